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
use shared::{consts, errors::UdsError, ticket::Ticket};

/// Parsed command line. `--test` short circuits everything else.
#[derive(Debug)]
pub enum Invocation {
    Test,
    Session(SessionArgs),
}

#[derive(Debug)]
pub struct SessionArgs {
    pub host: String, // host[:port] as it appears in the URL
    pub ticket: Ticket,
    pub scrambler: String,
    pub minimal: bool,
}

/// Accepts `udss://host[:port]/<ticket>/<scrambler>[?minimal[=1]]`.
/// The legacy `uds://` scheme only passes when the debug toggle is on.
pub fn parse_arguments(args: &[String]) -> Result<Invocation, UdsError> {
    if args.len() < 2 {
        return Err(UdsError::BadArguments("missing UDS URL".to_string()));
    }

    let mut minimal = false;
    let mut uds_url = args[1].as_str();

    if uds_url == "--minimal" {
        minimal = true;
        uds_url = args
            .get(2)
            .map(|s| s.as_str())
            .ok_or_else(|| UdsError::BadArguments("missing UDS URL".to_string()))?;
    }

    if uds_url == "--test" {
        return Ok(Invocation::Test);
    }

    let (scheme, rest) = uds_url
        .split_once("://")
        .ok_or_else(|| UdsError::BadArguments("Invalid UDS URL".to_string()))?;

    match scheme {
        "udss" => {}
        "uds" => {
            if !consts::debug_enabled() {
                return Err(UdsError::BadArguments(format!(
                    "UDS Client Version {} does not support HTTP protocol anymore",
                    consts::VERSION
                )));
            }
        }
        _ => return Err(UdsError::BadArguments("Not supported protocol".to_string())),
    }

    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, Some(query)),
        None => (rest, None),
    };

    let mut segments = rest.split('/');
    let host = segments
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| UdsError::BadArguments("Invalid UDS URL".to_string()))?;
    let ticket = segments
        .next()
        .ok_or_else(|| UdsError::BadArguments("Invalid UDS URL".to_string()))?;
    let scrambler = segments
        .next()
        .ok_or_else(|| UdsError::BadArguments("Invalid UDS URL".to_string()))?;

    let ticket = Ticket::try_from(ticket)
        .map_err(|_| UdsError::BadArguments("Invalid UDS URL".to_string()))?;

    // The minimal interface can also be requested from the URL itself
    if let Some(query) = query {
        minimal = minimal
            || query
                .split('&')
                .any(|kv| matches!(kv.split_once('=').map_or(kv, |(k, _)| k), "minimal"));
    }

    Ok(Invocation::Session(SessionArgs {
        host: host.to_string(),
        ticket,
        scrambler: scrambler.to_string(),
        minimal,
    }))
}
