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
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use futures::future;
use rand::Rng;
use sha2::{Digest, Sha256};
use thrussh::{ChannelMsg, Disconnect, client};
use thrussh_keys::{PublicKeyBase64, key};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    sync::Mutex,
    time::timeout,
};

use shared::{consts, log, system::trigger::Trigger, types::SshForwardState};

use crate::consts::{
    SSH_CLONE_PORT_RANGE, SSH_CONNECT_TIMEOUT_SECS, SSH_LOCAL_PORT_RANGE,
};

/// Lowercase hex digest of the wire encoded host key.
fn fingerprint_hex(server_public_key: &key::PublicKey) -> String {
    Sha256::digest(server_public_key.public_key_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// An empty expected list accepts any host key. Preserved from the previous
// behavior pending product direction.
fn fingerprint_allowed(expected: &str, fingerprint: &str) -> bool {
    if expected.trim().is_empty() {
        return true;
    }
    expected
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate.eq_ignore_ascii_case(fingerprint))
}

struct ClientHandler {
    fingerprints: String,
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;
    type FutureUnit = future::Ready<Result<(Self, client::Session), Self::Error>>;
    type FutureBool = future::Ready<Result<(Self, bool), Self::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        future::ready(Ok((self, b)))
    }

    fn finished(self, session: client::Session) -> Self::FutureUnit {
        future::ready(Ok((self, session)))
    }

    fn check_server_key(self, server_public_key: &key::PublicKey) -> Self::FutureBool {
        let fingerprint = fingerprint_hex(server_public_key);
        let accepted = fingerprint_allowed(&self.fingerprints, &fingerprint);
        if !accepted {
            log::error!(
                "Server has invalid fingerprint ({} vs {})",
                fingerprint,
                self.fingerprints
            );
        }
        self.finished_bool(accepted)
    }
}

/// The SSH connection, shared between the original forwarder and its
/// clones. Closed when the last owner stops.
struct SshTransport {
    handle: Mutex<client::Handle<ClientHandler>>,
    use_count: AtomicUsize,
}

async fn connect_transport(
    server: &str,
    port: u16,
    username: &str,
    password: &str,
    fingerprints: &str,
) -> Result<SshTransport> {
    let config = Arc::new(client::Config::default());
    let handler = ClientHandler {
        fingerprints: fingerprints.to_string(),
    };
    log::debug!("Connecting to ssh host {}:{} ...", server, port);
    let mut handle = timeout(
        Duration::from_secs(SSH_CONNECT_TIMEOUT_SECS),
        client::connect(config, (server, port), handler),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Timed out connecting to {}:{}", server, port))??;

    // Password only. No agent, no public key auth.
    let authenticated = handle.authenticate_password(username, password).await?;
    anyhow::ensure!(
        authenticated,
        "Authentication failed for {}@{}",
        username,
        server
    );
    Ok(SshTransport {
        handle: Mutex::new(handle),
        use_count: AtomicUsize::new(1),
    })
}

async fn release_transport(transport: &Arc<SshTransport>) {
    if transport.use_count.fetch_sub(1, Ordering::SeqCst) == 1 {
        log::debug!("Last owner gone, closing SSH transport");
        let mut handle = transport.handle.lock().await;
        handle
            .disconnect(Disconnect::ByApplication, "session finished", "en")
            .await
            .ok();
    }
}

#[derive(Clone)]
pub struct SshForwardServer {
    inner: Arc<SshInner>,
}

struct SshInner {
    server: String,
    port: u16,
    username: String,
    password: String,
    redirect: (String, u16),
    local_addr: SocketAddr,
    wait_time: u64,
    fingerprints: String,
    transport: Arc<SshTransport>,
    stop: Trigger,
    finished: Trigger,
    state: AtomicU8,
    can_stop: AtomicBool,
    current_connections: AtomicUsize,
}

impl SshInner {
    fn state(&self) -> SshForwardState {
        SshForwardState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SshForwardState) {
        self.state.store(u8::from(state), Ordering::SeqCst);
    }

    fn stop(&self) {
        if !self.stop.is_triggered() {
            log::debug!("Stopping SSH forwarder at {}", self.local_addr);
            self.stop.trigger();
        }
    }
}

/// Opens the SSH transport and starts a local forwarder multiplexing
/// direct-tcpip channels to `redirect_host:redirect_port`. Returns the
/// handle and the local port it listens on.
#[allow(clippy::too_many_arguments)]
pub async fn forward(
    server: &str,
    port: u16,
    username: &str,
    password: &str,
    redirect_host: &str,
    redirect_port: u16,
    local_port: Option<u16>,
    wait_time: u64,
    fingerprints: &str,
) -> Result<(SshForwardServer, u16)> {
    let local_port =
        local_port.unwrap_or_else(|| rand::rng().random_range(SSH_LOCAL_PORT_RANGE));
    log::debug!(
        "Connecting to {}:{} as {}, redirecting to {}:{}, listening on {}:{}",
        server,
        port,
        username,
        redirect_host,
        redirect_port,
        consts::LISTEN_ADDRESS,
        local_port
    );
    let transport = Arc::new(
        connect_transport(server, port, username, password, fingerprints).await?,
    );
    let forwarder = start_listener(
        server,
        port,
        username,
        password,
        (redirect_host.to_string(), redirect_port),
        local_port,
        wait_time,
        fingerprints,
        transport,
    )
    .await?;
    let local_port = forwarder.local_port();
    Ok((forwarder, local_port))
}

#[allow(clippy::too_many_arguments)]
async fn start_listener(
    server: &str,
    port: u16,
    username: &str,
    password: &str,
    redirect: (String, u16),
    local_port: u16,
    wait_time: u64,
    fingerprints: &str,
    transport: Arc<SshTransport>,
) -> Result<SshForwardServer> {
    let addr = SocketAddr::new(consts::LISTEN_ADDRESS.parse::<IpAddr>()?, local_port);
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(128)?;
    let local_addr = listener.local_addr()?;

    let inner = Arc::new(SshInner {
        server: server.to_string(),
        port,
        username: username.to_string(),
        password: password.to_string(),
        redirect,
        local_addr,
        wait_time,
        fingerprints: fingerprints.to_string(),
        transport,
        stop: Trigger::new(),
        finished: Trigger::new(),
        state: AtomicU8::new(u8::from(SshForwardState::Starting)),
        can_stop: AtomicBool::new(false),
        current_connections: AtomicUsize::new(0),
    });
    inner.set_state(SshForwardState::Ok);

    log::debug!("Wait time: {}", wait_time);
    tokio::spawn({
        let inner = inner.clone();
        async move {
            tokio::select! {
                _ = inner.stop.wait_async() => {}
                _ = tokio::time::sleep(Duration::from_secs(inner.wait_time)) => {
                    log::debug!("Timer fired with {} connections", inner.current_connections.load(Ordering::SeqCst));
                    inner.can_stop.store(true, Ordering::SeqCst);
                    if inner.current_connections.load(Ordering::SeqCst) == 0 {
                        inner.stop();
                    }
                }
            }
        }
    });

    tokio::spawn({
        let inner = inner.clone();
        async move { accept_loop(inner, listener).await }
    });

    Ok(SshForwardServer { inner })
}

async fn accept_loop(inner: Arc<SshInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.stop.wait_async() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, _)) => {
                        inner.current_connections.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn({
                            let inner = inner.clone();
                            async move { handle_connection(inner, socket).await }
                        });
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {:?}", e);
                        inner.set_state(SshForwardState::Error);
                        inner.stop();
                        break;
                    }
                }
            }
        }
    }
    release_transport(&inner.transport).await;
    inner.finished.trigger();
    log::debug!(
        "Stopped SSH forwarder {} -> {:?}",
        inner.local_addr,
        inner.redirect
    );
}

async fn handle_connection(inner: Arc<SshInner>, mut local: TcpStream) {
    relay_channel(&inner, &mut local).await;
    let remaining = inner.current_connections.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 && inner.can_stop.load(Ordering::SeqCst) {
        inner.stop();
    }
}

async fn relay_channel(inner: &Arc<SshInner>, local: &mut TcpStream) {
    let originator = local
        .peer_addr()
        .map(|addr| (addr.ip().to_string(), addr.port() as u32))
        .unwrap_or_else(|_| ("127.0.0.1".to_string(), 0));

    let opened = {
        let mut handle = inner.transport.handle.lock().await;
        handle
            .channel_open_direct_tcpip(
                inner.redirect.0.as_str(),
                inner.redirect.1 as u32,
                originator.0.as_str(),
                originator.1,
            )
            .await
    };
    let mut channel = match opened {
        Ok(channel) => channel,
        Err(e) => {
            log::error!(
                "Incoming request to {}:{} failed: {:?}",
                inner.redirect.0,
                inner.redirect.1,
                e
            );
            return;
        }
    };
    log::debug!(
        "Tunnel open {:?} -> {}:{}",
        originator,
        inner.redirect.0,
        inner.redirect.1
    );

    let mut buffer = [0u8; consts::SSH_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = inner.stop.wait_async() => break,
            read = local.read(&mut buffer) => match read {
                Ok(0) => {
                    channel.eof().await.ok();
                    break;
                }
                Ok(count) => {
                    if channel.data(&buffer[..count]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if local.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }
    log::debug!("Tunnel closed from {:?}", originator);
}

impl SshForwardServer {
    pub fn local_port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    pub fn state(&self) -> SshForwardState {
        self.inner.state()
    }

    pub fn stoppable(&self) -> bool {
        self.inner.can_stop.load(Ordering::SeqCst)
    }

    pub fn current_connections(&self) -> usize {
        self.inner.current_connections.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub async fn wait_finished(&self) {
        self.inner.finished.wait_async().await;
    }

    /// Starts another listener towards a different redirect target, sharing
    /// this forwarder's SSH transport. The clone picks a fresh random port
    /// unless one is given; the transport stays up until every sharer stops.
    pub async fn clone_to(
        &self,
        redirect_host: &str,
        redirect_port: u16,
        local_port: Option<u16>,
    ) -> Result<(SshForwardServer, u16)> {
        let local_port =
            local_port.unwrap_or_else(|| rand::rng().random_range(SSH_CLONE_PORT_RANGE));
        self.inner.transport.use_count.fetch_add(1, Ordering::SeqCst);
        match start_listener(
            &self.inner.server,
            self.inner.port,
            &self.inner.username,
            &self.inner.password,
            (redirect_host.to_string(), redirect_port),
            local_port,
            self.inner.wait_time,
            &self.inner.fingerprints,
            self.inner.transport.clone(),
        )
        .await
        {
            Ok(forwarder) => {
                let port = forwarder.local_port();
                Ok((forwarder, port))
            }
            Err(e) => {
                // The listener never ran, give the reference back
                self.inner.transport.use_count.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::log;

    #[test]
    fn test_fingerprint_allowed_matching() {
        let fp = "aabbccddeeff";
        assert!(fingerprint_allowed("aabbccddeeff", fp));
        assert!(fingerprint_allowed("001122,aabbccddeeff,334455", fp));
        assert!(fingerprint_allowed("AABBCCDDEEFF", fp));
        assert!(fingerprint_allowed(" aabbccddeeff , 001122", fp));
        assert!(!fingerprint_allowed("001122", fp));
        assert!(!fingerprint_allowed("001122,334455", fp));
    }

    #[test]
    fn test_empty_fingerprint_list_accepts_any() {
        assert!(fingerprint_allowed("", "whatever"));
        assert!(fingerprint_allowed("  ", "whatever"));
    }

    #[test]
    fn test_fingerprint_hex_is_stable_lowercase() {
        let pair = thrussh_keys::key::KeyPair::generate_ed25519().unwrap();
        let public = pair.clone_public_key();
        let fingerprint = fingerprint_hex(&public);
        assert_eq!(fingerprint, fingerprint.to_lowercase());
        assert_eq!(fingerprint.len(), 64); // SHA-256 in hex
        assert_eq!(fingerprint, fingerprint_hex(&public));
    }

    #[test]
    fn test_mismatched_fingerprint_would_reject_key() {
        let pair = thrussh_keys::key::KeyPair::generate_ed25519().unwrap();
        let fingerprint = fingerprint_hex(&pair.clone_public_key());
        // A configured pin that does not contain the presented key fails
        assert!(!fingerprint_allowed("aa00bb11cc22", &fingerprint));
    }

    #[tokio::test]
    async fn test_connect_to_non_ssh_server_fails_before_auth() {
        log::setup_logging("debug", log::LogType::Test);
        // A listener that closes immediately: the SSH version exchange
        // cannot even start, so forward() must fail
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let result = forward(
            "127.0.0.1",
            port,
            "user",
            "password",
            "internal.host",
            3389,
            None,
            2,
            "aa11bb22",
        )
        .await;
        assert!(result.is_err());
    }
}
