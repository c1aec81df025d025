use std::fmt;

/// Error kinds surfaced by the connector. User facing variants end up in the
/// orchestrator message sink; the exit code mapping is part of the CLI
/// contract.
#[derive(Debug)]
pub enum UdsError {
    BadArguments(String),
    EndpointNotApproved(String),
    UpgradeRequired {
        link: String,
        required_version: String,
    },
    SignatureInvalid,
    ServerError(String),
    Retryable(String),
    Transport(String),
    TunnelOpenFailed(String),
    CertificateUntrusted {
        hostname: String,
        serial: String,
    },
}

impl UdsError {
    pub fn transport(message: impl fmt::Display) -> Self {
        UdsError::Transport(message.to_string())
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            UdsError::BadArguments(_) | UdsError::EndpointNotApproved(_) => 1,
            // Opening the download link is the expected outcome, not a failure
            UdsError::UpgradeRequired { .. } => 0,
            _ => 128,
        }
    }
}

impl fmt::Display for UdsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdsError::BadArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            UdsError::EndpointNotApproved(host) => {
                write!(f, "Host {} was not approved", host)
            }
            UdsError::UpgradeRequired {
                required_version, ..
            } => write!(
                f,
                "A newer connector version is required ({})",
                required_version
            ),
            UdsError::SignatureInvalid => write!(
                f,
                "Invalid UDS code signature. Please, report to administrator"
            ),
            UdsError::ServerError(msg) => write!(f, "{}", msg),
            UdsError::Retryable(msg) => write!(f, "{}", msg),
            UdsError::Transport(msg) => write!(f, "Error communicating with broker: {}", msg),
            UdsError::TunnelOpenFailed(msg) => write!(f, "Could not open tunnel: {}", msg),
            UdsError::CertificateUntrusted { hostname, serial } => write!(
                f,
                "Certificate for {} (serial {}) is not trusted",
                hostname, serial
            ),
        }
    }
}

impl std::error::Error for UdsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(UdsError::BadArguments("x".into()).exit_code(), 1);
        assert_eq!(UdsError::EndpointNotApproved("h".into()).exit_code(), 1);
        assert_eq!(
            UdsError::UpgradeRequired {
                link: "https://example/install".into(),
                required_version: "99.0.0".into()
            }
            .exit_code(),
            0
        );
        assert_eq!(UdsError::SignatureInvalid.exit_code(), 128);
        assert_eq!(UdsError::Transport("dns".into()).exit_code(), 128);
    }
}
