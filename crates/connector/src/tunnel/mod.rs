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

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    time::timeout,
};
use tokio_rustls::{TlsConnector, client::TlsStream};

use shared::{consts, log, system::trigger::Trigger, ticket::Ticket, types::ForwardState};

use crate::{consts::{DEFAULT_LISTEN_TIMEOUT_SECS, OPEN_TUNNEL_TIMEOUT_SECS}, tls};

/// Handle over a running TCP-to-TLS forwarder. Cheap to clone; dropping it
/// does not stop the listener, `stop()` does.
#[derive(Clone)]
pub struct ForwardServer {
    inner: Arc<Inner>,
}

struct Inner {
    remote: (String, u16),
    remote_ipv6: bool,
    ticket: Ticket,
    check_certificate: bool,
    keep_listening: bool,
    local_addr: SocketAddr,
    tls_config: Arc<rustls::ClientConfig>,
    stop: Trigger,
    finished: Trigger,
    state: AtomicU8,
    can_stop: AtomicBool,
    current_connections: AtomicUsize,
}

impl Inner {
    fn state(&self) -> ForwardState {
        ForwardState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ForwardState) {
        self.state.store(u8::from(state), Ordering::SeqCst);
    }

    fn stoppable(&self) -> bool {
        self.can_stop.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if !self.stop.is_triggered() {
            log::debug!("Stopping forwarder at {}", self.local_addr);
            self.stop.trigger();
        }
    }
}

// Negative timeouts mean "always accept new connections, but become
// stoppable after |timeout|". Zero falls back to the default grace period.
fn normalize_timeout(timeout: i64, keep_listening: bool) -> (u64, bool) {
    let (timeout, keep_listening) = if timeout < 0 {
        (timeout.unsigned_abs(), true)
    } else {
        (timeout as u64, keep_listening)
    };
    let timeout = if timeout == 0 {
        DEFAULT_LISTEN_TIMEOUT_SECS
    } else {
        timeout
    };
    (timeout, keep_listening)
}

async fn bind_local(local_port: u16, ipv6_listen: bool) -> Result<TcpListener> {
    let address = if ipv6_listen {
        consts::LISTEN_ADDRESS_V6
    } else {
        consts::LISTEN_ADDRESS
    };
    let addr = SocketAddr::new(address.parse::<IpAddr>()?, local_port);
    let socket = if ipv6_listen {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr).context("Failed to bind local listener")?;
    Ok(socket.listen(128)?)
}

#[allow(clippy::too_many_arguments)]
pub async fn forward(
    remote: (String, u16),
    ticket: Ticket,
    timeout: i64,
    local_port: u16,
    check_certificate: bool,
    keep_listening: bool,
    use_ipv6: bool,
    ipv6_listen: bool,
) -> Result<ForwardServer> {
    let (timeout_secs, keep_listening) = normalize_timeout(timeout, keep_listening);
    // A colon in the remote host means a literal IPv6 address
    let remote_ipv6 = use_ipv6 || remote.0.contains(':');

    let listener = bind_local(local_port, ipv6_listen).await?;
    let local_addr = listener.local_addr()?;
    let tls_config = Arc::new(tls::gateway_config(check_certificate)?);

    let inner = Arc::new(Inner {
        remote,
        remote_ipv6,
        ticket,
        check_certificate,
        keep_listening,
        local_addr,
        tls_config,
        stop: Trigger::new(),
        finished: Trigger::new(),
        state: AtomicU8::new(u8::from(ForwardState::Listening)),
        can_stop: AtomicBool::new(false),
        current_connections: AtomicUsize::new(0),
    });

    log::debug!("Remote: {:?}", inner.remote);
    log::debug!("Remote IPv6: {}", inner.remote_ipv6);
    log::debug!("Check certificate: {}", inner.check_certificate);
    log::debug!("Keep listening: {}", inner.keep_listening);
    log::debug!("Timeout: {}", timeout_secs);
    log::debug!("Listening on {}", local_addr);

    // One shot stoppable timer, cancelled by stop()
    tokio::spawn({
        let inner = inner.clone();
        async move {
            tokio::select! {
                _ = inner.stop.wait_async() => {}
                _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                    set_stoppable(&inner);
                }
            }
        }
    });

    tokio::spawn({
        let inner = inner.clone();
        async move { accept_loop(inner, listener).await }
    });

    Ok(ForwardServer { inner })
}

fn set_stoppable(inner: &Arc<Inner>) {
    log::debug!("New connection grace period is over");
    inner.can_stop.store(true, Ordering::SeqCst);
    // Nothing connected when the timer fired: nothing to wait for
    if inner.current_connections.load(Ordering::SeqCst) == 0 {
        inner.stop();
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.stop.wait_async() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        if inner.state() == ForwardState::Listening {
                            inner.set_state(ForwardState::Opening);
                        }
                        if inner.stoppable() && !inner.keep_listening {
                            log::error!("Rejected timed out connection from {}", peer);
                            inner.set_state(ForwardState::Error);
                            drop(socket);
                            inner.stop();
                            break;
                        }
                        inner.current_connections.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn({
                            let inner = inner.clone();
                            async move { handle_connection(inner, socket).await }
                        });
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {:?}", e);
                    }
                }
            }
        }
    }
    // Dropping the listener releases the port
    inner.finished.trigger();
    log::debug!("Stopped forwarder {} -> {:?}", inner.local_addr, inner.remote);
}

async fn handle_connection(inner: Arc<Inner>, mut local: TcpStream) {
    if let Err(e) = establish_and_relay(&inner, &mut local).await {
        log::error!("Error connecting to {:?}: {}", inner.remote, e);
        inner.set_state(ForwardState::Error);
        inner.stop();
    }
    let remaining = inner.current_connections.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 && inner.stoppable() {
        inner.stop();
    }
}

/// Tunnel open failures propagate (terminal for the connection and the
/// forwarder); relay faults after a successful open re-open the tunnel
/// until the local side closes.
async fn establish_and_relay(inner: &Arc<Inner>, local: &mut TcpStream) -> Result<()> {
    loop {
        if inner.stop.is_triggered() {
            return Ok(());
        }
        let tunnel = open_tunnel(inner).await?;
        inner.set_state(ForwardState::Processing);
        log::debug!("Processing tunnel with ticket {}", inner.ticket);
        match relay(inner, local, tunnel).await {
            RelayEnd::Finished => {
                log::debug!("Finished tunnel with ticket {}", inner.ticket);
                return Ok(());
            }
            RelayEnd::RemoteFailure(e) => {
                log::error!("Remote connection failure: {}. Retrying...", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn connect_gateway(inner: &Inner) -> Result<TlsStream<TcpStream>> {
    let host = inner.remote.0.trim_start_matches('[').trim_end_matches(']');
    let target = if inner.remote_ipv6 {
        format!("[{}]:{}", host, inner.remote.1)
    } else {
        format!("{}:{}", host, inner.remote.1)
    };
    log::info!("CONNECT to {}", target);
    let mut stream = TcpStream::connect(&target)
        .await
        .with_context(|| format!("Failed to connect to {}", target))?;

    // No response expected, just the handshake
    stream.write_all(consts::HANDSHAKE_V1).await?;

    let connector = TlsConnector::from(inner.tls_config.clone());
    let tls = connector.connect(tls::server_name(host)?, stream).await?;
    Ok(tls)
}

async fn open_tunnel(inner: &Inner) -> Result<TlsStream<TcpStream>> {
    timeout(
        Duration::from_secs(OPEN_TUNNEL_TIMEOUT_SECS),
        open_tunnel_exchange(inner),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Timed out opening tunnel to {:?}", inner.remote))?
}

async fn open_tunnel_exchange(inner: &Inner) -> Result<TlsStream<TcpStream>> {
    let mut tls = connect_gateway(inner).await?;
    tls.write_all(consts::CMD_OPEN).await?;
    tls.write_all(inner.ticket.as_bytes()).await?;

    let mut reply = [0u8; 2];
    tls.read_exact(&mut reply).await?;
    if &reply != consts::RESPONSE_OK {
        // Whatever follows is the error message
        let mut detail = vec![0u8; consts::RESPONSE_ERROR_MAX];
        let read = tls.read(&mut detail).await.unwrap_or(0);
        let mut message = reply.to_vec();
        message.extend_from_slice(&detail[..read]);
        anyhow::bail!("Error received: {}", String::from_utf8_lossy(&message));
    }
    Ok(tls)
}

enum RelayEnd {
    Finished,
    RemoteFailure(anyhow::Error),
}

async fn relay(inner: &Inner, local: &mut TcpStream, tunnel: TlsStream<TcpStream>) -> RelayEnd {
    let (mut remote_read, mut remote_write) = tokio::io::split(tunnel);
    let (mut local_read, mut local_write) = local.split();
    let mut local_buf = vec![0u8; consts::BUFFER_SIZE];
    let mut remote_buf = vec![0u8; consts::BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = inner.stop.wait_async() => return RelayEnd::Finished,
            read = local_read.read(&mut local_buf) => match read {
                Ok(0) => return RelayEnd::Finished,
                Ok(count) => {
                    if let Err(e) = remote_write.write_all(&local_buf[..count]).await {
                        return RelayEnd::RemoteFailure(e.into());
                    }
                }
                Err(e) => {
                    log::debug!("Local side closed: {}", e);
                    return RelayEnd::Finished;
                }
            },
            read = remote_read.read(&mut remote_buf) => match read {
                Ok(0) => return RelayEnd::Finished,
                Ok(count) => {
                    if let Err(e) = local_write.write_all(&remote_buf[..count]).await {
                        log::debug!("Local side closed: {}", e);
                        return RelayEnd::Finished;
                    }
                }
                Err(e) => return RelayEnd::RemoteFailure(e.into()),
            },
        }
    }
}

impl ForwardServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    pub fn remote(&self) -> (String, u16) {
        self.inner.remote.clone()
    }

    pub fn ticket(&self) -> Ticket {
        self.inner.ticket
    }

    pub fn state(&self) -> ForwardState {
        self.inner.state()
    }

    pub fn stoppable(&self) -> bool {
        self.inner.stoppable()
    }

    pub fn keep_listening(&self) -> bool {
        self.inner.keep_listening
    }

    pub fn check_certificate(&self) -> bool {
        self.inner.check_certificate
    }

    pub fn current_connections(&self) -> usize {
        self.inner.current_connections.load(Ordering::SeqCst)
    }

    /// Idempotent; also cancels the stoppable timer and makes the accept
    /// loop and all workers exit promptly.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Resolves once the accept loop has exited and the port is released.
    pub async fn wait_finished(&self) {
        self.inner.finished.wait_async().await;
    }

    /// Opens a test tunnel and checks the gateway answers OK. Certificate
    /// validation problems are hard failures for the caller to surface;
    /// everything else is just "not available".
    pub async fn check(&self) -> Result<bool> {
        if self.state() == ForwardState::Error {
            return Ok(false);
        }
        log::debug!("Checking tunnel availability");
        let exchange = timeout(Duration::from_secs(OPEN_TUNNEL_TIMEOUT_SECS), async {
            let mut tls = connect_gateway(&self.inner).await?;
            tls.write_all(consts::CMD_TEST).await?;
            let mut reply = [0u8; 2];
            tls.read_exact(&mut reply).await?;
            anyhow::ensure!(
                &reply == consts::RESPONSE_OK,
                "Invalid tunnel response: {:?}",
                reply
            );
            Ok(())
        })
        .await;
        match exchange {
            Ok(Ok(())) => {
                log::debug!("Tunnel is available!");
                Ok(true)
            }
            Ok(Err(e)) => {
                let certificate_problem = e
                    .downcast_ref::<std::io::Error>()
                    .map(tls::is_certificate_io_error)
                    .unwrap_or(false);
                if certificate_problem {
                    log::error!("Certificate error connecting to {:?}: {}", self.inner.remote, e);
                    Err(e.context(format!(
                        "Certificate error connecting to {:?}",
                        self.inner.remote
                    )))
                } else {
                    log::error!(
                        "Error connecting to tunnel server {:?}: {}",
                        self.inner.remote,
                        e
                    );
                    Ok(false)
                }
            }
            Err(_) => {
                log::error!("Timed out checking tunnel {:?}", self.inner.remote);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests;
