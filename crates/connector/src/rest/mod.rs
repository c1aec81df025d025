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
use std::sync::{Arc, Mutex};

use anyhow::Result;
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use serde_json::json;

use shared::{consts, errors::UdsError, log, ticket::Ticket, utils};

use crate::{
    security::{signature::Verifier, trust::TrustPolicy},
    tls,
};

/// What the broker hands out for a valid ticket: the (already verified)
/// transport descriptor text, its parameters and an optional remote log
/// request.
pub struct ScriptBundle {
    pub script: String,
    pub params: serde_json::Value,
    pub log: Option<LogDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogDescriptor {
    pub ticket: String,
    #[serde(default)]
    pub level: i64,
}

#[derive(Clone)]
struct VersionInfo {
    required: String,
    link: String,
}

pub struct RestApi {
    endpoint: String, // base REST url, without trailing slash
    host: String,     // broker host, for certificate prompts
    port: u16,
    policy: Arc<TrustPolicy>,
    verifier: Verifier,
    version_cache: Mutex<Option<VersionInfo>>,
}

impl RestApi {
    pub fn new(
        endpoint: &str,
        host: &str,
        port: u16,
        policy: Arc<TrustPolicy>,
    ) -> Result<Self, UdsError> {
        log::debug!("Setting request URL to {}", endpoint);
        Ok(RestApi {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            host: host.to_string(),
            port,
            policy,
            verifier: Verifier::compiled_in().map_err(UdsError::transport)?,
            version_cache: Mutex::new(None),
        })
    }

    /// Builds the client for `https://<host>/uds/rest/client`.
    pub fn api(host_port: &str, policy: Arc<TrustPolicy>) -> Result<Self, UdsError> {
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => (
                host,
                port.parse::<u16>()
                    .map_err(|_| UdsError::BadArguments("Invalid UDS URL".to_string()))?,
            ),
            _ => (host_port, 443),
        };
        Self::new(
            &format!("https://{}{}", host_port, consts::REST_PATH),
            host,
            port,
            policy,
        )
    }

    #[cfg(test)]
    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = verifier;
        self
    }

    fn build_client(&self, verify: bool) -> Result<reqwest::Client> {
        let tls_config = tls::broker_config(verify)?;
        Ok(reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .user_agent(utils::user_agent())
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::ACCEPT,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                headers.insert(
                    reqwest::header::CONTENT_TYPE,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                headers
            })
            .build()?)
    }

    async fn issue(
        &self,
        url: &str,
        with_params: bool,
        body: &Option<serde_json::Value>,
        verify: bool,
    ) -> Result<serde_json::Value> {
        let client = self.build_client(verify)?;
        let mut request = match body {
            Some(body) => client.post(url).json(body),
            None => client.get(url),
        };
        if with_params {
            request = request.query(&[
                ("hostname", utils::gethostname()),
                ("version", consts::VERSION.to_string()),
            ]);
        }
        Ok(request.send().await?.json::<serde_json::Value>().await?)
    }

    /// One request against the broker. On certificate validation failures
    /// the trust policy is asked; approval re-issues this request exactly
    /// once with verification disabled.
    async fn request(
        &self,
        path: &str,
        with_params: bool,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, UdsError> {
        let url = format!("{}{}", self.endpoint, path);
        let data = match self.issue(&url, with_params, &body, true).await {
            Ok(data) => data,
            Err(e) if is_certificate_error(&e) => {
                let serial = tls::peer_certificate_serial(&self.host, self.port)
                    .await
                    .unwrap_or_default();
                log::info!(
                    "Certificate for {} (serial {}) could not be verified",
                    self.host,
                    serial
                );
                if !self.policy.on_cert_error(&self.host, &serial) {
                    return Err(UdsError::CertificateUntrusted {
                        hostname: self.host.clone(),
                        serial,
                    });
                }
                self.issue(&url, with_params, &body, false)
                    .await
                    .map_err(UdsError::transport)?
            }
            Err(e) => return Err(UdsError::transport(e)),
        };
        process_error(&data)?;
        Ok(data)
    }

    /// Gets and caches the broker required version, failing with
    /// `UpgradeRequired` when this client is too old for it.
    pub async fn get_version(&self) -> Result<String, UdsError> {
        let cached = self.version_cache.lock().ok().and_then(|slot| slot.clone());
        let info = match cached {
            Some(info) => info,
            None => {
                let data = self.request("/", false, None).await?;
                let result = data
                    .get("result")
                    .ok_or_else(|| UdsError::transport("malformed version response"))?;
                // New key is preferred; the old spelling goes away once all
                // brokers are known to be upgraded
                let info = if let Some(required) =
                    result.get("requiredVersion").and_then(|v| v.as_str())
                {
                    VersionInfo {
                        required: required.to_string(),
                        link: result
                            .get("downloadUrl")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    }
                } else if let Some(required) =
                    result.get("required_version").and_then(|v| v.as_str())
                {
                    VersionInfo {
                        required: required.to_string(),
                        link: result
                            .get("client_link")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    }
                } else {
                    return Err(UdsError::transport("malformed version response"));
                };
                if let Ok(mut slot) = self.version_cache.lock() {
                    *slot = Some(info.clone());
                }
                info
            }
        };
        if version_newer(&info.required, consts::VERSION) {
            return Err(UdsError::UpgradeRequired {
                link: info.link,
                required_version: info.required,
            });
        }
        Ok(info.required)
    }

    /// Fetches the signed transport descriptor for the ticket. The signature
    /// is checked over the exact decoded bytes before anything else looks at
    /// them.
    pub async fn get_script_and_parameters(
        &self,
        ticket: &Ticket,
        scrambler: &str,
    ) -> Result<ScriptBundle, UdsError> {
        let data = self
            .request(&format!("/{}/{}", ticket.as_str(), scrambler), true, None)
            .await?;
        log::debug!("Transport data received");
        let result = data
            .get("result")
            .ok_or_else(|| UdsError::transport("malformed transport response"))?;
        let script_b64 = result
            .get("script")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UdsError::transport("transport response without script"))?;
        let signature = result
            .get("signature")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UdsError::transport("transport response without signature"))?;
        let params_b64 = result
            .get("params")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UdsError::transport("transport response without params"))?;

        let script_bytes = decode_b64_bz2(script_b64).map_err(UdsError::transport)?;
        if !self.verifier.verify(&script_bytes, signature) {
            log::error!("Signature is invalid");
            return Err(UdsError::SignatureInvalid);
        }

        let params = serde_json::from_slice(&decode_b64_bz2(params_b64).map_err(UdsError::transport)?)
            .map_err(UdsError::transport)?;
        let script = String::from_utf8(script_bytes)
            .map_err(|_| UdsError::transport("script is not valid UTF-8"))?;
        let log_descriptor = result
            .get("log")
            .cloned()
            .and_then(|v| serde_json::from_value::<LogDescriptor>(v).ok());

        Ok(ScriptBundle {
            script,
            params,
            log: log_descriptor,
        })
    }

    /// Uploads captured log data under the broker provided log ticket.
    pub async fn send_log(&self, log_ticket: &str, log_data: &str) -> Result<(), UdsError> {
        self.request(
            &format!("/{}/log", log_ticket),
            true,
            Some(json!({ "log": log_data })),
        )
        .await
        .map(|_| ())
    }
}

// Server error convention: any body with an "error" field failed; the
// is_retrayable (new) / retryable (legacy) flag selects the retry path
fn process_error(data: &serde_json::Value) -> Result<(), UdsError> {
    if let Some(error) = data.get("error") {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        let retryable = data
            .get("is_retrayable")
            .or_else(|| data.get("retryable"))
            .and_then(|v| v.as_str())
            == Some("1");
        if retryable {
            return Err(UdsError::Retryable(message));
        }
        return Err(UdsError::ServerError(message));
    }
    Ok(())
}

fn is_certificate_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(rustls_err) = cause.downcast_ref::<rustls::Error>() {
            return matches!(rustls_err, rustls::Error::InvalidCertificate(_));
        }
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>()
            && tls::is_certificate_io_error(io_err)
        {
            return true;
        }
    }
    format!("{:?}", err).contains("InvalidCertificate")
}

fn decode_b64_bz2(data: &str) -> Result<Vec<u8>> {
    use std::io::Read;

    let compressed = general_purpose::STANDARD.decode(data.trim())?;
    let mut decoder = bzip2::read::BzDecoder::new(&compressed[..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// True when `required` is a newer version than `current`. Components are
/// compared numerically when both parse, so "10.0.0" orders above "9.0.0";
/// for the purely numeric dotted tuples brokers send this agrees with the
/// old string comparison.
fn version_newer(required: &str, current: &str) -> bool {
    let mut required_parts = required.split('.');
    let mut current_parts = current.split('.');
    loop {
        match (required_parts.next(), current_parts.next()) {
            (None, None) => return false,
            (Some(r), None) => return r.parse::<u64>().map(|n| n > 0).unwrap_or(true),
            (None, Some(_)) => return false,
            (Some(r), Some(c)) => {
                let ordering = match (r.parse::<u64>(), c.parse::<u64>()) {
                    (Ok(rn), Ok(cn)) => rn.cmp(&cn),
                    _ => r.cmp(c),
                };
                match ordering {
                    std::cmp::Ordering::Greater => return true,
                    std::cmp::Ordering::Less => return false,
                    std::cmp::Ordering::Equal => {}
                }
            }
        }
    }
}
