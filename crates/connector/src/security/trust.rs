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
use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};

use shared::log;

/// Asks the user for approvals. Injected so the desktop build can put a
/// dialog here while the CLI reads the terminal and tests answer directly.
pub trait ApprovalPrompt: Send + Sync {
    fn confirm_endpoint(&self, hostname: &str) -> bool;
    fn confirm_certificate(&self, hostname: &str, serial: &str) -> bool;
}

pub struct ConsolePrompt;

impl ConsolePrompt {
    fn ask(question: &str) -> bool {
        print!("{} [y/N] ", question);
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

impl ApprovalPrompt for ConsolePrompt {
    fn confirm_endpoint(&self, hostname: &str) -> bool {
        Self::ask(&format!(
            "The server {} must be approved. Only approve UDS servers that you trust.\nApprove?",
            hostname
        ))
    }

    fn confirm_certificate(&self, hostname: &str, serial: &str) -> bool {
        Self::ask(&format!(
            "Could not check SSL certificate for {} (serial {}).\nDo you trust this host?",
            hostname, serial
        ))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustData {
    #[serde(default)]
    endpoints: BTreeMap<String, bool>,
    #[serde(default)]
    ssl: BTreeMap<String, bool>,
}

/// Persistent approvals, grouped by kind. Entries are only ever added.
pub struct TrustStore {
    path: PathBuf,
    data: Mutex<TrustData>,
}

impl TrustStore {
    pub fn open(path: PathBuf) -> Self {
        let data = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        TrustStore {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn open_default() -> Self {
        let path = ProjectDirs::from("org", "VirtualCable", "UDSClient")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(std::env::temp_dir)
            .join("approvals.json");
        Self::open(path)
    }

    fn save(&self, data: &TrustData) {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        match serde_json::to_string_pretty(data) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.path, raw) {
                    log::debug!("Could not persist trust store: {}", e);
                }
            }
            Err(e) => log::debug!("Could not serialize trust store: {}", e),
        }
    }

    pub fn is_endpoint_approved(&self, hostname: &str) -> bool {
        self.data
            .lock()
            .map(|data| data.endpoints.get(hostname).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn set_endpoint_approved(&self, hostname: &str) {
        if let Ok(mut data) = self.data.lock() {
            data.endpoints.insert(hostname.to_string(), true);
            self.save(&data);
        }
    }

    pub fn is_serial_approved(&self, serial: &str) -> bool {
        self.data
            .lock()
            .map(|data| data.ssl.get(serial).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn set_serial_approved(&self, serial: &str) {
        if let Ok(mut data) = self.data.lock() {
            data.ssl.insert(serial.to_string(), true);
            self.save(&data);
        }
    }
}

/// Gates broker access: endpoint approval on first contact and certificate
/// approval when chain validation fails.
pub struct TrustPolicy {
    store: TrustStore,
    prompt: Box<dyn ApprovalPrompt>,
}

impl TrustPolicy {
    pub fn new(store: TrustStore, prompt: Box<dyn ApprovalPrompt>) -> Self {
        TrustPolicy { store, prompt }
    }

    pub fn check_endpoint(&self, hostname: &str) -> bool {
        if self.store.is_endpoint_approved(hostname) {
            return true;
        }
        if self.prompt.confirm_endpoint(hostname) {
            self.store.set_endpoint_approved(hostname);
            return true;
        }
        false
    }

    /// Consulted on TLS verification failures. True means "go on without
    /// verification for the next attempt"; the answer is cached by serial.
    pub fn on_cert_error(&self, hostname: &str, serial: &str) -> bool {
        if self.store.is_serial_approved(serial) {
            return true;
        }
        if self.prompt.confirm_certificate(hostname, serial) {
            self.store.set_serial_approved(serial);
            return true;
        }
        false
    }
}

/// CA bundle resolution: the override env var wins, then well known system
/// bundles. None is a valid outcome, callers fall back to platform roots.
pub fn get_cacerts_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CERTIFICATE_BUNDLE_PATH") {
        return Some(PathBuf::from(path));
    }

    if cfg!(target_os = "linux") {
        for path in [
            "/etc/pki/tls/certs/ca-bundle.crt",
            "/etc/ssl/certs/ca-certificates.crt",
            "/etc/ssl/ca-bundle.pem",
        ] {
            if Path::new(path).exists() {
                log::info!("Found CA bundle: {}", path);
                return Some(PathBuf::from(path));
            }
        }
    }

    None
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub struct Always(pub bool);

    impl ApprovalPrompt for Always {
        fn confirm_endpoint(&self, _hostname: &str) -> bool {
            self.0
        }

        fn confirm_certificate(&self, _hostname: &str, _serial: &str) -> bool {
            self.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::Always, *};

    fn temp_store() -> TrustStore {
        let path = std::env::temp_dir().join(format!(
            "uds-trust-test-{}-{}.json",
            std::process::id(),
            rand::random::<u32>()
        ));
        TrustStore::open(path)
    }

    #[test]
    fn test_endpoint_roundtrip_persists() {
        let store = temp_store();
        let path = store.path.clone();
        assert!(!store.is_endpoint_approved("broker.example.com"));
        store.set_endpoint_approved("broker.example.com");
        assert!(store.is_endpoint_approved("broker.example.com"));

        // A fresh instance reads the same file back
        let reopened = TrustStore::open(path.clone());
        assert!(reopened.is_endpoint_approved("broker.example.com"));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_policy_caches_certificate_approval() {
        let store = temp_store();
        let path = store.path.clone();
        let policy = TrustPolicy::new(store, Box::new(Always(true)));
        assert!(policy.on_cert_error("h", "00ff12"));
        // Cached now: even a denying prompt would not be consulted again
        let reopened = TrustPolicy::new(TrustStore::open(path.clone()), Box::new(Always(false)));
        assert!(reopened.on_cert_error("h", "00ff12"));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_denial_is_not_cached() {
        let store = temp_store();
        let path = store.path.clone();
        let policy = TrustPolicy::new(store, Box::new(Always(false)));
        assert!(!policy.check_endpoint("nope.example.com"));
        assert!(!policy.on_cert_error("nope.example.com", "abcd"));
        let reopened = TrustStore::open(path.clone());
        assert!(!reopened.is_endpoint_approved("nope.example.com"));
        assert!(!reopened.is_serial_approved("abcd"));
        std::fs::remove_file(path).ok();
    }
}
