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
use rand::{Rng, distr::Alphanumeric};

use crate::consts::TICKET_LENGTH;

/// Broker issued authorization token. Always exactly 48 ASCII characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket([u8; TICKET_LENGTH]);

impl Ticket {
    pub fn new_random() -> Self {
        let rng = rand::rng();
        let id = rng
            .sample_iter(Alphanumeric)
            .take(TICKET_LENGTH)
            .collect::<Vec<u8>>()
            .try_into()
            .expect("Failed to create Ticket");
        Ticket(id)
    }

    pub fn as_bytes(&self) -> &[u8; TICKET_LENGTH] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Checked constructors only admit ASCII, so this cannot fail for them
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    pub fn validate(&self) -> Result<()> {
        if !self.0.iter().all(|&c| c.is_ascii_alphanumeric()) {
            return Err(anyhow::anyhow!("Invalid ticket"));
        }
        Ok(())
    }
}

impl From<[u8; TICKET_LENGTH]> for Ticket {
    fn from(id: [u8; TICKET_LENGTH]) -> Self {
        Ticket(id)
    }
}

impl From<&[u8; TICKET_LENGTH]> for Ticket {
    fn from(id: &[u8; TICKET_LENGTH]) -> Self {
        Ticket(*id)
    }
}

impl TryFrom<&str> for Ticket {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        let bytes: [u8; TICKET_LENGTH] = value
            .as_bytes()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Ticket must be {} characters long", TICKET_LENGTH))?;
        let ticket = Ticket(bytes);
        ticket.validate()?;
        Ok(ticket)
    }
}

impl TryFrom<&[u8]> for Ticket {
    type Error = anyhow::Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; TICKET_LENGTH] = value
            .try_into()
            .map_err(|_| anyhow::anyhow!("Ticket must be {} bytes long", TICKET_LENGTH))?;
        Ok(Ticket(bytes))
    }
}

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ticket_is_valid() {
        let ticket = Ticket::new_random();
        assert!(ticket.validate().is_ok());
        assert_eq!(ticket.as_str().len(), TICKET_LENGTH);
    }

    #[test]
    fn test_short_ticket_rejected() {
        assert!(Ticket::try_from("too-short").is_err());
    }

    #[test]
    fn test_exact_length_roundtrip() {
        let raw = "A".repeat(TICKET_LENGTH);
        let ticket = Ticket::try_from(raw.as_str()).unwrap();
        assert_eq!(ticket.as_str(), raw);
    }

    #[test]
    fn test_non_ascii_rejected() {
        let raw = "\u{e9}".repeat(TICKET_LENGTH / 2); // 48 bytes, non alphanumeric
        assert!(Ticket::try_from(raw.as_str()).is_err());
    }
}
