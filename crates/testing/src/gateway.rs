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
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;

use shared::{consts, system::trigger::Trigger};

use crate::certs;

/// What the gateway does after a successful OPEN.
#[derive(Clone)]
pub enum GatewayMode {
    /// Answer TEST with OK, close OPEN attempts.
    TestOnly,
    /// Answer OPEN with OK and echo every payload byte back.
    OpenEcho,
    /// Answer OPEN with an error tail instead of OK.
    OpenError(String),
}

/// In-process stand-in for the remote tunnel gateway: plaintext handshake,
/// TLS upgrade, TEST/OPEN commands. Accepts any number of connections
/// until stopped.
pub struct MockGateway {
    pub port: u16,
    pub ca_pem: String,
    stop: Trigger,
    received_tickets: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockGateway {
    pub async fn start(mode: GatewayMode) -> Result<MockGateway> {
        let cert = certs::self_signed()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let stop = Trigger::new();
        let received_tickets = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn({
            let stop = stop.clone();
            let received_tickets = received_tickets.clone();
            let server_config = cert.server_config.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = stop.wait_async() => break,
                        accepted = listener.accept() => {
                            let Ok((socket, _)) = accepted else { break };
                            tokio::spawn({
                                let mode = mode.clone();
                                let server_config = server_config.clone();
                                let received_tickets = received_tickets.clone();
                                let stop = stop.clone();
                                async move {
                                    let _ = handle(socket, server_config, mode, received_tickets, stop).await;
                                }
                            });
                        }
                    }
                }
            }
        });

        Ok(MockGateway {
            port,
            ca_pem: cert.ca_pem,
            stop,
            received_tickets,
        })
    }

    pub fn stop(&self) {
        self.stop.trigger();
    }

    pub fn received_tickets(&self) -> Vec<Vec<u8>> {
        self.received_tickets.lock().unwrap().clone()
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

async fn handle(
    mut socket: TcpStream,
    server_config: Arc<rustls::ServerConfig>,
    mode: GatewayMode,
    received_tickets: Arc<Mutex<Vec<Vec<u8>>>>,
    stop: Trigger,
) -> Result<()> {
    let mut header = [0u8; 8];
    socket.read_exact(&mut header).await?;
    anyhow::ensure!(&header == consts::HANDSHAKE_V1, "invalid header");

    let acceptor = TlsAcceptor::from(server_config);
    let mut tls = acceptor.accept(socket).await?;

    let mut command = [0u8; 4];
    tls.read_exact(&mut command).await?;
    match &command {
        b"TEST" => {
            tls.write_all(consts::RESPONSE_OK).await?;
            tls.shutdown().await.ok();
        }
        b"OPEN" => {
            let mut ticket = [0u8; consts::TICKET_LENGTH];
            tls.read_exact(&mut ticket).await?;
            received_tickets.lock().unwrap().push(ticket.to_vec());
            match mode {
                GatewayMode::OpenEcho => {
                    tls.write_all(consts::RESPONSE_OK).await?;
                    let mut buffer = vec![0u8; consts::BUFFER_SIZE];
                    loop {
                        tokio::select! {
                            _ = stop.wait_async() => break,
                            read = tls.read(&mut buffer) => {
                                let count = read?;
                                if count == 0 {
                                    break;
                                }
                                tls.write_all(&buffer[..count]).await?;
                            }
                        }
                    }
                    tls.shutdown().await.ok();
                }
                GatewayMode::OpenError(message) => {
                    tls.write_all(b"ER").await?;
                    tls.write_all(message.as_bytes()).await?;
                    tls.shutdown().await.ok();
                }
                GatewayMode::TestOnly => {
                    anyhow::bail!("unexpected OPEN");
                }
            }
        }
        other => anyhow::bail!("invalid command: {:?}", other),
    }
    Ok(())
}
