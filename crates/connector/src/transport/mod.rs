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

//! Typed replacement for the broker supplied transport script: the signed
//! bytes decode to one of these descriptors, and the orchestrator dispatches
//! on the tag instead of executing code.

use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use shared::{consts, errors::UdsError, log, ticket::Ticket};

use crate::{
    consts::SSH_DEFAULT_WAIT_SECS,
    sshtunnel,
    tools::{self, CleanupRegistry, Waitable},
    tunnel,
    ui::HostApp,
};

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

fn default_wait_time() -> u64 {
    SSH_DEFAULT_WAIT_SECS
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportDescriptor {
    Tunnel(TunnelDescriptor),
    Ssh(SshDescriptor),
}

#[derive(Debug, Deserialize)]
pub struct TunnelDescriptor {
    pub tunnel_host: String,
    pub tunnel_port: u16,
    pub ticket: String,
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default = "default_true")]
    pub check_certificate: bool,
    #[serde(default)]
    pub keep_listening: bool,
    #[serde(default)]
    pub use_ipv6: bool,
    /// Run a TEST tunnel before handing the listener to the client
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub client: Option<ClientLaunch>,
}

#[derive(Debug, Deserialize)]
pub struct SshDescriptor {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub redirect_host: String,
    pub redirect_port: u16,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default = "default_wait_time")]
    pub wait_time: u64,
    /// Comma separated fingerprint pins; empty accepts any host key
    #[serde(default)]
    pub fingerprints: String,
    #[serde(default)]
    pub clones: Vec<SshRedirect>,
    #[serde(default)]
    pub client: Option<ClientLaunch>,
}

#[derive(Debug, Deserialize)]
pub struct SshRedirect {
    pub redirect_host: String,
    pub redirect_port: u16,
    #[serde(default)]
    pub local_port: Option<u16>,
}

/// External transport client to launch against the local listener.
/// `args` and file contents may use the placeholders `{address}`, `{host}`,
/// `{port}`, `{file:N}` and `{param:<key>}`.
#[derive(Debug, Deserialize)]
pub struct ClientLaunch {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub files: Vec<LaunchFile>,
    #[serde(default)]
    pub wait_subprocesses: bool,
}

#[derive(Debug, Deserialize)]
pub struct LaunchFile {
    pub content: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub early_unlink: bool,
}

pub fn parse(script: &str) -> Result<TransportDescriptor, UdsError> {
    serde_json::from_str(script)
        .map_err(|e| UdsError::ServerError(format!("Invalid transport descriptor: {}", e)))
}

pub async fn dispatch(
    descriptor: TransportDescriptor,
    params: &serde_json::Value,
    registry: &Arc<CleanupRegistry>,
    host_app: &dyn HostApp,
) -> Result<(), UdsError> {
    match descriptor {
        TransportDescriptor::Tunnel(tunnel_descriptor) => {
            launch_tunnel(tunnel_descriptor, params, registry, host_app).await
        }
        TransportDescriptor::Ssh(ssh_descriptor) => {
            launch_ssh(ssh_descriptor, params, registry, host_app).await
        }
    }
}

async fn launch_tunnel(
    descriptor: TunnelDescriptor,
    params: &serde_json::Value,
    registry: &Arc<CleanupRegistry>,
    host_app: &dyn HostApp,
) -> Result<(), UdsError> {
    let ticket = Ticket::try_from(descriptor.ticket.as_str())
        .map_err(|_| UdsError::ServerError("Invalid ticket in transport descriptor".to_string()))?;

    host_app.info("Opening tunnel...");
    let forwarder = tunnel::forward(
        (descriptor.tunnel_host.clone(), descriptor.tunnel_port),
        ticket,
        descriptor.timeout,
        descriptor.local_port,
        descriptor.check_certificate,
        descriptor.keep_listening,
        descriptor.use_ipv6,
        false,
    )
    .await
    .map_err(|e| UdsError::TunnelOpenFailed(e.to_string()))?;

    if descriptor.verify {
        match forwarder.check().await {
            Ok(true) => {}
            Ok(false) => {
                forwarder.stop();
                return Err(UdsError::TunnelOpenFailed(
                    "Gateway is not available".to_string(),
                ));
            }
            Err(e) => {
                forwarder.stop();
                return Err(UdsError::TunnelOpenFailed(e.to_string()));
            }
        }
    }

    let port = forwarder.local_port();
    register_forwarder(
        registry,
        Waitable::Task(tokio::spawn({
            let forwarder = forwarder.clone();
            async move {
                forwarder.wait_finished().await;
            }
        })),
        Box::new({
            let forwarder = forwarder.clone();
            move || forwarder.stop()
        }),
    );

    if let Some(launch) = &descriptor.client {
        launch_client(launch, port, params, registry)?;
    }
    host_app.info(&format!(
        "Connection ready at {}:{}",
        consts::LISTEN_ADDRESS,
        port
    ));
    Ok(())
}

async fn launch_ssh(
    descriptor: SshDescriptor,
    params: &serde_json::Value,
    registry: &Arc<CleanupRegistry>,
    host_app: &dyn HostApp,
) -> Result<(), UdsError> {
    host_app.info("Opening SSH tunnel...");
    let (forwarder, port) = sshtunnel::forward(
        &descriptor.host,
        descriptor.port,
        &descriptor.username,
        &descriptor.password,
        &descriptor.redirect_host,
        descriptor.redirect_port,
        descriptor.local_port,
        descriptor.wait_time,
        &descriptor.fingerprints,
    )
    .await
    .map_err(|e| UdsError::TunnelOpenFailed(e.to_string()))?;

    register_forwarder(
        registry,
        Waitable::Task(tokio::spawn({
            let forwarder = forwarder.clone();
            async move {
                forwarder.wait_finished().await;
            }
        })),
        Box::new({
            let forwarder = forwarder.clone();
            move || forwarder.stop()
        }),
    );

    for clone in &descriptor.clones {
        let (cloned, cloned_port) = forwarder_clone(&forwarder, clone).await?;
        register_forwarder(
            registry,
            Waitable::Task(tokio::spawn({
                let cloned = cloned.clone();
                async move {
                    cloned.wait_finished().await;
                }
            })),
            Box::new({
                let cloned = cloned.clone();
                move || cloned.stop()
            }),
        );
        host_app.info(&format!(
            "Extra redirection ready at {}:{}",
            consts::LISTEN_ADDRESS,
            cloned_port
        ));
    }

    if let Some(launch) = &descriptor.client {
        launch_client(launch, port, params, registry)?;
    }
    host_app.info(&format!(
        "Connection ready at {}:{}",
        consts::LISTEN_ADDRESS,
        port
    ));
    Ok(())
}

async fn forwarder_clone(
    forwarder: &sshtunnel::SshForwardServer,
    clone: &SshRedirect,
) -> Result<(sshtunnel::SshForwardServer, u16), UdsError> {
    forwarder
        .clone_to(&clone.redirect_host, clone.redirect_port, clone.local_port)
        .await
        .map_err(|e| UdsError::TunnelOpenFailed(e.to_string()))
}

fn register_forwarder(
    registry: &Arc<CleanupRegistry>,
    wait: Waitable,
    stop: Box<dyn FnOnce() + Send>,
) {
    // The forwarder's own lifetime keeps the session alive; stopping it is
    // the last thing the cleanup does
    registry.add_task_to_wait(wait, false);
    registry.register_execute_before_exit(stop);
}

fn launch_client(
    launch: &ClientLaunch,
    port: u16,
    params: &serde_json::Value,
    registry: &Arc<CleanupRegistry>,
) -> Result<(), UdsError> {
    let mut file_paths: Vec<PathBuf> = Vec::new();
    for file in &launch.files {
        let content = substitute(&file.content, port, &file_paths, params);
        let path = tools::save_temp_file(&content, &file.extension)
            .map_err(|e| UdsError::ServerError(format!("Could not write session file: {}", e)))?;
        registry.register_for_delayed_deletion(path.clone(), file.early_unlink);
        file_paths.push(path);
    }

    let args: Vec<String> = launch
        .args
        .iter()
        .map(|arg| substitute(arg, port, &file_paths, params))
        .collect();
    log::info!("Launching {} {:?}", launch.program, args);
    let child = tokio::process::Command::new(&launch.program)
        .args(&args)
        .spawn()
        .map_err(|e| {
            UdsError::ServerError(format!("Could not launch {}: {}", launch.program, e))
        })?;
    registry.add_task_to_wait(Waitable::Process(child), launch.wait_subprocesses);
    Ok(())
}

fn substitute(
    template: &str,
    port: u16,
    files: &[PathBuf],
    params: &serde_json::Value,
) -> String {
    let mut out = template
        .replace(
            "{address}",
            &format!("{}:{}", consts::LISTEN_ADDRESS, port),
        )
        .replace("{host}", consts::LISTEN_ADDRESS)
        .replace("{port}", &port.to_string());
    for (index, path) in files.iter().enumerate() {
        out = out.replace(
            &format!("{{file:{}}}", index),
            &path.display().to_string(),
        );
    }
    if let Some(map) = params.as_object() {
        for (key, value) in map {
            let token = format!("{{param:{}}}", key);
            if !out.contains(&token) {
                continue;
            }
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&token, &rendered);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICKET: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    #[test]
    fn test_parse_minimal_tunnel_descriptor() {
        let script = format!(
            r#"{{"type":"tunnel","tunnel_host":"gw.example.com","tunnel_port":10443,"ticket":"{}"}}"#,
            TICKET
        );
        match parse(&script).unwrap() {
            TransportDescriptor::Tunnel(d) => {
                assert_eq!(d.tunnel_host, "gw.example.com");
                assert_eq!(d.tunnel_port, 10443);
                assert_eq!(d.ticket, TICKET);
                assert_eq!(d.timeout, 0);
                assert_eq!(d.local_port, 0);
                assert!(d.check_certificate);
                assert!(!d.keep_listening);
                assert!(!d.use_ipv6);
                assert!(!d.verify);
                assert!(d.client.is_none());
            }
            _ => panic!("expected tunnel descriptor"),
        }
    }

    #[test]
    fn test_parse_ssh_descriptor_with_clones() {
        let script = r#"{
            "type": "ssh",
            "host": "jump.example.com",
            "username": "user",
            "password": "secret",
            "redirect_host": "desktop.internal",
            "redirect_port": 3389,
            "fingerprints": "aa11,bb22",
            "clones": [
                {"redirect_host": "desktop.internal", "redirect_port": 3390},
                {"redirect_host": "audio.internal", "redirect_port": 4713, "local_port": 34567}
            ],
            "client": {"program": "xfreerdp", "args": ["/v:{address}"]}
        }"#;
        match parse(script).unwrap() {
            TransportDescriptor::Ssh(d) => {
                assert_eq!(d.port, 22);
                assert_eq!(d.wait_time, SSH_DEFAULT_WAIT_SECS);
                assert_eq!(d.clones.len(), 2);
                assert_eq!(d.clones[1].local_port, Some(34567));
                assert_eq!(d.client.unwrap().program, "xfreerdp");
            }
            _ => panic!("expected ssh descriptor"),
        }
    }

    #[test]
    fn test_parse_unknown_type_rejected() {
        assert!(matches!(
            parse(r#"{"type":"rogue"}"#),
            Err(UdsError::ServerError(_))
        ));
        assert!(matches!(parse("not json"), Err(UdsError::ServerError(_))));
    }

    #[test]
    fn test_substitute_placeholders() {
        let files = vec![PathBuf::from("/tmp/session.rdp")];
        let params = serde_json::json!({"user": "alice", "depth": 32});
        let out = substitute(
            "client /v:{address} /p:{port} /f:{file:0} /u:{param:user} /bpp:{param:depth}",
            41234,
            &files,
            &params,
        );
        assert_eq!(
            out,
            "client /v:127.0.0.1:41234 /p:41234 /f:/tmp/session.rdp /u:alice /bpp:32"
        );
    }
}
