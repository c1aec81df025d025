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
use std::{sync::Arc, time::Duration};

use shared::{errors::UdsError, log};

pub mod args;
pub mod consts;
pub mod rest;
pub mod security;
pub mod sshtunnel;
pub mod tls;
pub mod tools;
pub mod transport;
pub mod tunnel;
pub mod ui;

use security::trust::{ConsolePrompt, TrustPolicy, TrustStore};
use tools::CleanupRegistry;

fn main() {
    std::process::exit(run());
}

#[tokio::main(flavor = "multi_thread")]
async fn run() -> i32 {
    log::setup_logging("info", log::LogType::Client);
    shared::utils::ensure_crypto_provider();

    let argv: Vec<String> = std::env::args().collect();
    log::debug!("Arguments: {:?}", argv);

    let session = match args::parse_arguments(&argv) {
        Ok(args::Invocation::Test) => return 0,
        Ok(args::Invocation::Session(session)) => session,
        Err(e) => {
            eprintln!("{}", e);
            return e.exit_code();
        }
    };

    let host_app: Box<dyn ui::HostApp> = if session.minimal {
        log::info!("Minimal execution");
        Box::new(ui::SilentHost)
    } else {
        Box::new(ui::ConsoleHost)
    };

    match run_session(&session, host_app.as_ref()).await {
        Ok(()) => {
            log::debug!("Main execution finished correctly");
            0
        }
        Err(e) => {
            // A denied approval is a user decision, not an error to shout about
            if matches!(e, UdsError::EndpointNotApproved(_)) {
                log::info!("{}", e);
            } else {
                host_app.error(&e.to_string());
            }
            e.exit_code()
        }
    }
}

async fn run_session(
    session: &args::SessionArgs,
    host_app: &dyn ui::HostApp,
) -> Result<(), UdsError> {
    log::debug!("Starting execution");

    let policy = Arc::new(TrustPolicy::new(
        TrustStore::open_default(),
        Box::new(ConsolePrompt),
    ));
    if !policy.check_endpoint(&session.host) {
        return Err(UdsError::EndpointNotApproved(session.host.clone()));
    }

    let api = rest::RestApi::api(&session.host, policy)?;

    host_app.info("Initializing...");
    match api.get_version().await {
        Ok(version) => log::debug!("Broker requires version {}", version),
        Err(UdsError::UpgradeRequired {
            link,
            required_version,
        }) => {
            host_app.info(&format!(
                "A newer connector version is required ({}). A browser will be opened to download it.",
                required_version
            ));
            if let Err(e) = open::that(&link) {
                log::error!("Could not open {}: {}", link, e);
            }
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    let bundle = loop {
        match api
            .get_script_and_parameters(&session.ticket, &session.scrambler)
            .await
        {
            Ok(bundle) => break bundle,
            Err(UdsError::Retryable(message)) => {
                host_app.info(&format!("{}, retrying access...", message));
                tokio::time::sleep(Duration::from_secs(consts::RETRY_DELAY_SECS)).await;
            }
            Err(e) => return Err(e),
        }
    };

    if let Some(descriptor) = &bundle.log {
        log::debug!("Remote log requested at level {}", descriptor.level);
        log::init_remote_log(&descriptor.ticket);
    }

    let descriptor = transport::parse(&bundle.script)?;
    let registry = Arc::new(CleanupRegistry::new());
    transport::dispatch(descriptor, &bundle.params, &registry, host_app).await?;

    finish_session(&registry, &api).await;
    Ok(())
}

/// Post session cleanup: pace out file deletions, wait for the transport
/// client (and the forwarders) to end, run the registered callables and
/// upload the captured log if the broker asked for it. All best effort.
async fn finish_session(registry: &Arc<CleanupRegistry>, api: &rest::RestApi) {
    tools::end_script(registry).await;
    let (log_ticket, body) = log::get_remote_log(consts::LOG_TAIL_BYTES);
    if let Some(log_ticket) = log_ticket
        && !body.is_empty()
    {
        if let Err(e) = api.send_log(&log_ticket, &body).await {
            log::debug!("Could not send remote log: {}", e);
        }
    }
    log::debug!("Exiting");
}
