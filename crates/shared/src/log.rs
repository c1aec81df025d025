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
    fs::{File, OpenOptions},
    io::{self, Write},
    sync::{Arc, Mutex, OnceLock},
};

use tracing_subscriber::{EnvFilter, fmt::time::LocalTime};

pub use tracing::{debug, error, info, warn};

use crate::consts;

pub enum LogType {
    Client,
    Test,
}

// Capture cap. The broker upload only takes the last 64 KiB of this.
const CAPTURE_LIMIT: usize = 256 * 1024;

static LOG_SETUP: OnceLock<()> = OnceLock::new();
static CAPTURE: Mutex<Vec<u8>> = Mutex::new(Vec::new());
static REMOTE_TICKET: Mutex<Option<String>> = Mutex::new(None);

/// Formatted records are appended to the log file and mirrored into the
/// capture buffer used for remote log upload.
#[derive(Clone)]
struct LogSink {
    file: Option<Arc<Mutex<File>>>,
    echo_stderr: bool,
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut capture) = CAPTURE.lock() {
            capture.extend_from_slice(buf);
            if capture.len() > CAPTURE_LIMIT {
                let excess = capture.len() - CAPTURE_LIMIT / 2;
                capture.drain(..excess);
            }
        }
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            file.write_all(buf).ok();
        }
        if self.echo_stderr {
            io::stderr().write_all(buf).ok();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            file.flush().ok();
        }
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

pub fn setup_logging(level: &str, log_type: LogType) {
    let level = if consts::debug_enabled() {
        "debug".to_string()
    } else {
        level.to_string()
    };
    LOG_SETUP.get_or_init(move || {
        // Route log-crate records from dependencies through tracing too
        tracing_log::LogTracer::init().ok();
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
        match log_type {
            LogType::Test => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_test_writer()
                    .try_init()
                    .ok();
            }
            LogType::Client => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(consts::log_file())
                    .ok()
                    .map(|f| Arc::new(Mutex::new(f)));
                let sink = LogSink {
                    echo_stderr: file.is_none() || consts::debug_enabled(),
                    file,
                };
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_timer(LocalTime::rfc_3339())
                    .with_ansi(false)
                    .with_writer(sink)
                    .try_init()
                    .ok();
                platform_debug_info();
            }
        }
    });
}

fn platform_debug_info() {
    debug!("UDSClient version: {}", consts::VERSION);
    debug!("Platform: {}", crate::types::OsType::detected());
    debug!("Arch: {}", std::env::consts::ARCH);
    debug!("Debug toggle: {}", consts::debug_enabled());
}

/// Remembers the broker log ticket so the post session cleanup knows where
/// to upload the captured records.
pub fn init_remote_log(ticket: &str) {
    if let Ok(mut slot) = REMOTE_TICKET.lock() {
        *slot = Some(ticket.to_string());
    }
}

/// Returns the remote log ticket (if any was received) and the tail of the
/// captured log, at most `max_bytes` long.
pub fn get_remote_log(max_bytes: usize) -> (Option<String>, String) {
    let ticket = REMOTE_TICKET.lock().ok().and_then(|slot| slot.clone());
    let body = CAPTURE
        .lock()
        .map(|capture| {
            let start = capture.len().saturating_sub(max_bytes);
            String::from_utf8_lossy(&capture[start..]).into_owned()
        })
        .unwrap_or_default();
    (ticket, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_capture_tail_is_bounded() {
        setup_logging("debug", LogType::Test);
        {
            let mut capture = CAPTURE.lock().unwrap();
            capture.clear();
            capture.extend_from_slice(&[b'x'; 1000]);
            capture.extend_from_slice(b"the-end");
        }
        let (_, body) = get_remote_log(7);
        assert_eq!(body, "the-end");
    }

    #[test]
    #[serial]
    fn test_remote_ticket_roundtrip() {
        init_remote_log("log-ticket-1");
        let (ticket, _) = get_remote_log(16);
        assert_eq!(ticket.as_deref(), Some("log-ticket-1"));
    }

    #[test]
    #[serial]
    fn test_sink_trims_over_capacity() {
        let mut sink = LogSink {
            file: None,
            echo_stderr: false,
        };
        CAPTURE.lock().unwrap().clear();
        let chunk = vec![b'y'; 64 * 1024];
        for _ in 0..8 {
            sink.write_all(&chunk).unwrap();
        }
        assert!(CAPTURE.lock().unwrap().len() <= CAPTURE_LIMIT);
    }
}
