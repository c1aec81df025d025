use std::sync::OnceLock;

use crate::{consts, types::OsType};

/// Local host name, sent to the broker as a query parameter.
pub fn gethostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

pub fn user_agent() -> String {
    format!("UDSClient/{} ({})", consts::VERSION, OsType::detected())
}

/// Installs the process wide rustls crypto provider. Safe to call multiple
/// times; only the first call does anything.
pub fn ensure_crypto_provider() {
    static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_shape() {
        let agent = user_agent();
        assert!(agent.starts_with("UDSClient/"));
        assert!(agent.contains(consts::VERSION));
        assert!(agent.ends_with(')'));
    }

    #[test]
    fn test_hostname_not_empty() {
        assert!(!gethostname().is_empty());
    }

    #[test]
    fn test_crypto_provider_idempotent() {
        ensure_crypto_provider();
        ensure_crypto_provider();
    }
}
