use std::path::PathBuf;

// UDS client version, compared against the broker required version
pub const VERSION: &str = "4.0.0";

// Ticket related constants
pub const TICKET_LENGTH: usize = 48;

// Gateway tunnel protocol
pub const HANDSHAKE_V1: &[u8; 8] = b"\x5AMGB\xA5\x01\x00\x00";
pub const CMD_TEST: &[u8; 4] = b"TEST";
pub const CMD_OPEN: &[u8; 4] = b"OPEN";
pub const RESPONSE_OK: &[u8; 2] = b"OK";
pub const RESPONSE_ERROR_MAX: usize = 128;

// Relay buffer sizes
pub const BUFFER_SIZE: usize = 1024 * 16;
pub const SSH_BUFFER_SIZE: usize = 1024;

// Local listener addresses
pub const LISTEN_ADDRESS: &str = "127.0.0.1";
pub const LISTEN_ADDRESS_V6: &str = "::1";

// Broker REST base path
pub const REST_PATH: &str = "/uds/rest/client";

// Broker channel ciphers (TLS 1.3 suites plus the accepted TLS 1.2 ECDHE ones)
pub const SECURE_CIPHERS: &str = "TLS_AES_256_GCM_SHA384\
:TLS_CHACHA20_POLY1305_SHA256\
:TLS_AES_128_GCM_SHA256\
:ECDHE-RSA-AES256-GCM-SHA384\
:ECDHE-RSA-AES128-GCM-SHA256\
:ECDHE-RSA-CHACHA20-POLY1305\
:ECDHE-ECDSA-AES128-GCM-SHA256\
:ECDHE-ECDSA-AES256-GCM-SHA384\
:ECDHE-ECDSA-CHACHA20-POLY1305";

// Public key for validating signed transport descriptors
pub const PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----
MIICIjANBgkqhkiG9w0BAQEFAAOCAg8AMIICCgKCAgEAuNURlGjBpqbglkTTg2lh
dU5qPbg9Q+RofoDDucGfrbY0pjB9ULgWXUetUWDZhFG241tNeKw+aYFTEorK5P+g
ud7h9KfyJ6huhzln9eyDu3k+kjKUIB1PLtA3lZLZnBx7nmrHRody1u5lRaLVplsb
FmcnptwYD+3jtJ2eK9ih935DYAkYS4vJFi2FO+npUQdYBZHPG/KwXLjP4oGOuZp0
pCTLiCXWGjqh2GWsTECby2upGS/ZNZ1r4Ymp4V2A6DZnN0C0xenHIY34FWYahbXF
ZGdr4DFBPdYde5Rb5aVKJQc/pWK0CV7LK6Krx0/PFc7OGg7ItdEuC7GSfPNV/ANt
5BEQNF5w2nUUsyN8ziOrNih+z6fWQujAAUZfpCCeV9ekbwXGhbRtdNkbAryE5vH6
eCE0iZ+cFsk72VScwLRiOhGNelMQ7mIMotNck3a0P15eaGJVE2JV0M/ag/Cnk0Lp
wI1uJQRAVqz9ZAwvF2SxM45vnrBn6TqqxbKnHCeiwstLDYG4fIhBwFxP3iMH9EqV
2+QXqdJW/wLenFjmXfxrjTRr+z9aYMIdtIkSpADIlbaJyTtuQpEdWnrlDS2b1IGd
Okbm65EebVzOxfje+8dRq9Uqwip8f/qmzFsIIsx3wPSvkKawFwb0G5h2HX5oJrk0
nVgtClKcDDlSaBsO875WDR0CAwEAAQ==
-----END PUBLIC KEY-----";

// Debug feature toggle name. Enabled either through the environment
// (UDS_DEBUG_ON) or by dropping a marker file in the temp or home directory.
pub const DEBUG_TOGGLE: &str = "uds-debug-on";

pub fn debug_enabled() -> bool {
    let env_var_name = DEBUG_TOGGLE.to_uppercase().replace('-', "_");
    if let Ok(value) = std::env::var(&env_var_name) {
        return matches!(value.to_lowercase().as_str(), "true" | "yes" | "1");
    }
    std::env::temp_dir().join(DEBUG_TOGGLE).exists()
        || std::env::home_dir()
            .map(|home| home.join(DEBUG_TOGGLE).exists())
            .unwrap_or(false)
}

// Log destination: UDS_LOG_FILE wins, else the home folder on unix,
// else the temp folder
pub fn log_file() -> PathBuf {
    if let Ok(path) = std::env::var("UDS_LOG_FILE") {
        return PathBuf::from(path);
    }
    if cfg!(any(target_os = "linux", target_os = "macos"))
        && let Some(home) = std::env::home_dir()
    {
        return home.join("udsclient.log");
    }
    std::env::temp_dir().join("udsclient.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_is_eight_bytes() {
        assert_eq!(HANDSHAKE_V1.len(), 8);
        assert_eq!(&HANDSHAKE_V1[..5], &[0x5A, 0x4D, 0x47, 0x42, 0xA5]);
        assert_eq!(&HANDSHAKE_V1[5..], &[0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_cipher_list_has_nine_suites() {
        assert_eq!(SECURE_CIPHERS.split(':').count(), 9);
    }

    #[test]
    fn test_log_file_honors_environment() {
        // Not using UDS_LOG_FILE here to avoid mutating process env in parallel
        // tests; just check the default has the expected file name.
        assert_eq!(
            log_file().file_name().unwrap().to_string_lossy(),
            "udsclient.log"
        );
    }
}
