// BSD 3-Clause License
// Copyright (c) 2026, Virtual Cable S.L.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice,
//    this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice,
//    this list of conditions and the following disclaimer in the documentation
//    and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors
//    may be used to endorse or promote products derived from this software
//    without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
// AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
// FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
// CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
// OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

// Authors: Adolfo Gómez, dkmaster at dkmon dot com
use anyhow::Result;
use base64::{Engine as _, engine::general_purpose};
use rsa::{
    RsaPublicKey,
    pkcs1v15::Pkcs1v15Sign,
    pkcs8::DecodePublicKey,
    sha2::{Digest, Sha256},
    traits::PublicKeyParts,
};

use shared::consts;

/// Verifies detached signatures over transport descriptor bytes.
/// RSA PKCS#1 v1.5 with SHA-256, against a key compiled into the binary.
pub struct Verifier {
    key: RsaPublicKey,
}

impl Verifier {
    pub fn new(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| anyhow::anyhow!("Invalid public key: {}", e))?;
        Ok(Verifier { key })
    }

    pub fn compiled_in() -> Result<Self> {
        Verifier::new(consts::PUBLIC_KEY)
    }

    /// True only for a valid signature. Bad encoding, short input and
    /// verification failures are all indistinguishable, on purpose.
    /// Brokers are allowed to pad the signature, so anything beyond the
    /// modulus size is ignored.
    pub fn verify(&self, script: &[u8], signature_b64: &str) -> bool {
        let Some(raw) = decode_lenient(signature_b64) else {
            return false;
        };
        let size = self.key.size();
        if raw.len() < size {
            return false;
        }
        let digest = Sha256::digest(script);
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &raw[..size])
            .is_ok()
    }
}

// Drops whitespace, stray padding and any other non alphabet byte before
// decoding, so a signature with junk appended still decodes to the same
// leading bytes.
fn decode_lenient(signature_b64: &str) -> Option<Vec<u8>> {
    let filtered: String = signature_b64
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/'))
        .collect();
    // A remainder of one sextet cannot encode a byte; drop it
    let usable = filtered.len() - filtered.len() % 4;
    let trimmed = match filtered.len() % 4 {
        1 => &filtered[..usable],
        _ => filtered.as_str(),
    };
    general_purpose::STANDARD_NO_PAD.decode(trimmed).ok()
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use rsa::{RsaPrivateKey, pkcs8::EncodePublicKey};

    pub fn test_keypair() -> (RsaPrivateKey, String) {
        let mut rng = rand08::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(Default::default())
            .unwrap();
        (private, public_pem)
    }

    pub fn sign(private: &RsaPrivateKey, data: &[u8]) -> String {
        let digest = Sha256::digest(data);
        let signature = private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap();
        general_purpose::STANDARD.encode(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::{sign, test_keypair}, *};

    #[test]
    fn test_valid_signature() {
        let (private, public_pem) = test_keypair();
        let verifier = Verifier::new(&public_pem).unwrap();
        let script = b"{\"type\":\"tunnel\"}";
        let signature = sign(&private, script);
        assert!(verifier.verify(script, &signature));
    }

    #[test]
    fn test_modified_script_fails() {
        let (private, public_pem) = test_keypair();
        let verifier = Verifier::new(&public_pem).unwrap();
        let signature = sign(&private, b"original bytes");
        assert!(!verifier.verify(b"tampered bytes", &signature));
    }

    #[test]
    fn test_trailing_padding_is_tolerated() {
        let (private, public_pem) = test_keypair();
        let verifier = Verifier::new(&public_pem).unwrap();
        let script = b"payload";
        let signature = sign(&private, script);
        assert!(verifier.verify(script, &format!("{}====", signature)));
        assert!(verifier.verify(script, &format!("{}\n\n", signature)));
    }

    #[test]
    fn test_garbage_signature_fails() {
        let (_, public_pem) = test_keypair();
        let verifier = Verifier::new(&public_pem).unwrap();
        assert!(!verifier.verify(b"data", "not-base64-!!!"));
        assert!(!verifier.verify(b"data", ""));
        assert!(!verifier.verify(b"data", "QUJD")); // Too short
    }

    #[test]
    fn test_compiled_in_key_loads() {
        assert!(Verifier::compiled_in().is_ok());
    }
}
