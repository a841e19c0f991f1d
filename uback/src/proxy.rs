// uback is the CLI front end for the uback backup engine.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The child-process side of the `command`/`proxy` adapter transport:
//! `uback proxy` is spawned by [`uback_common::adapters::proxy`] (or any
//! other `command`-speaking parent) with the adapter's options flattened
//! as `--key=value` flags, and serves requests on its own stdio until the
//! parent closes its end.

use crate::error::Error as CliError;
use crate::Result;

use uback_common::adapter::{self, DestinationAdapter, SourceAdapter};
use uback_common::options::{Options, ResolvedOptions};
use uback_common::proto::{AdapterRequest, AdapterResponse, PROTOCOL_VERSION};
use uback_common::snapshot::SnapshotId;
use uback_common::transport::{recv_request, send_response, CHUNKSIZE};
use uback_common::Error as CommonError;

use std::io::{self, Cursor, Read, Write};
use std::path::Path;

/// Turns `--key=value`/`--key` flags (as handed to a spawned proxy child)
/// back into an [`Options`], the inverse of
/// `adapters::proxy::proxy_args`.
fn parse_flags(args: &[String]) -> Result<Options> {
    let mut opts = Options::new();

    for arg in args {
        let body = arg
            .strip_prefix("--")
            .ok_or_else(|| CommonError::User(format!("Malformed proxy argument \"{arg}\": expected \"--key=value\"")))?;

        match body.split_once('=') {
            Some((key, value)) => opts.push(key.to_string(), value.to_string()),
            None => opts.push(body.to_string(), String::new()),
        }
    }

    Ok(opts)
}

fn reply_result(result: uback_common::Result<()>) -> AdapterResponse {
    match result {
        Ok(()) => AdapterResponse::Ok,
        Err(e) => AdapterResponse::Error { message: e.to_string() },
    }
}

fn recv_payload(input: &mut impl Read) -> Result<Vec<u8>> {
    let mut payload = Vec::new();

    loop {
        match recv_request(input).map_err(CliError::Common)? {
            AdapterRequest::Chunk(data) => payload.extend_from_slice(&data),
            AdapterRequest::EndOfStream => break,
            other => {
                return Err(CommonError::HelperFailed(format!("unexpected message while receiving a payload: {other:?}")).into())
            }
        }
    }

    Ok(payload)
}

fn send_payload(output: &mut impl Write, reader: &mut dyn Read) -> Result<()> {
    let mut buf = vec![0u8; CHUNKSIZE];

    loop {
        let n = reader.read(&mut buf).map_err(CliError::Io)?;
        if n == 0 {
            break;
        }

        send_response(output, &AdapterResponse::Chunk(buf[..n].to_vec())).map_err(CliError::Common)?;
    }

    send_response(output, &AdapterResponse::EndOfStream).map_err(CliError::Common)?;
    Ok(())
}

/// Lazily resolves and caches the source adapter this proxy instance
/// wraps. A single child process only ever plays one role (source or
/// destination) for its whole lifetime, but which role depends on which
/// request arrives first, so neither is constructed up front.
struct Adapters<'a> {
    opts: &'a ResolvedOptions,
    source: Option<Box<dyn SourceAdapter>>,
    destination: Option<Box<dyn DestinationAdapter>>,
}

impl<'a> Adapters<'a> {
    fn new(opts: &'a ResolvedOptions) -> Self {
        Self {
            opts,
            source: None,
            destination: None,
        }
    }

    fn source(&mut self) -> uback_common::Result<&dyn SourceAdapter> {
        if self.source.is_none() {
            self.source = Some(adapter::source_adapter(self.opts)?);
        }

        Ok(self.source.as_deref().expect("constructed above"))
    }

    fn destination(&mut self) -> uback_common::Result<&dyn DestinationAdapter> {
        if self.destination.is_none() {
            self.destination = Some(adapter::destination_adapter(self.opts)?);
        }

        Ok(self.destination.as_deref().expect("constructed above"))
    }
}

/// Runs the `uback proxy` request/response loop: `raw_args` are the
/// `--key=value` flags the parent spawned this process with.
pub fn serve(raw_args: &[String]) -> Result<()> {
    let parsed = parse_flags(raw_args)?;
    let opts = parsed.resolve();

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let stdout = io::stdout();
    let mut output = stdout.lock();

    match recv_request(&mut input).map_err(CliError::Common)? {
        AdapterRequest::Hello { version } if version == PROTOCOL_VERSION => {
            send_response(&mut output, &AdapterResponse::Hello { version: PROTOCOL_VERSION }).map_err(CliError::Common)?;
        }
        AdapterRequest::Hello { version } => {
            let message = format!("adapter protocol version mismatch: we speak {PROTOCOL_VERSION}, parent speaks {version}");
            send_response(&mut output, &AdapterResponse::Error { message: message.clone() }).map_err(CliError::Common)?;
            return Err(CommonError::HelperFailed(message).into());
        }
        other => return Err(CommonError::HelperFailed(format!("expected Hello, got {other:?}")).into()),
    }

    let mut adapters = Adapters::new(&opts);

    loop {
        let req = match recv_request(&mut input) {
            Ok(req) => req,
            Err(_) => break,
        };

        match req {
            AdapterRequest::Hello { .. } | AdapterRequest::Chunk(_) | AdapterRequest::EndOfStream => {
                send_response(
                    &mut output,
                    &AdapterResponse::Error {
                        message: "unexpected message outside a call".to_string(),
                    },
                )
                .map_err(CliError::Common)?;
            }

            AdapterRequest::CreateSnapshot { snap } => {
                let resp = reply_result(adapters.source().and_then(|s| s.create_snapshot(&snap)));
                send_response(&mut output, &resp).map_err(CliError::Common)?;
            }
            AdapterRequest::ListSnapshots => {
                let resp = match adapters.source().and_then(|s| s.list_snapshots()) {
                    Ok(snaps) => AdapterResponse::Snapshots(snaps.into_iter().collect::<Vec<SnapshotId>>()),
                    Err(e) => AdapterResponse::Error { message: e.to_string() },
                };
                send_response(&mut output, &resp).map_err(CliError::Common)?;
            }
            AdapterRequest::DeleteSnapshot { snap } => {
                let resp = reply_result(adapters.source().and_then(|s| s.delete_snapshot(&snap)));
                send_response(&mut output, &resp).map_err(CliError::Common)?;
            }
            AdapterRequest::CanIncremental { base } => {
                let resp = match adapters.source().and_then(|s| s.can_incremental(&base)) {
                    Ok(b) => AdapterResponse::Bool(b),
                    Err(e) => AdapterResponse::Error { message: e.to_string() },
                };
                send_response(&mut output, &resp).map_err(CliError::Common)?;
            }
            AdapterRequest::Stream { snap, base } => match adapters.source().and_then(|s| s.stream(&snap, base.as_ref())) {
                Ok((ty, mut reader)) => {
                    send_response(&mut output, &AdapterResponse::StreamReady { ty }).map_err(CliError::Common)?;
                    send_payload(&mut output, reader.as_mut())?;
                }
                Err(e) => {
                    send_response(&mut output, &AdapterResponse::Error { message: e.to_string() }).map_err(CliError::Common)?;
                }
            },
            AdapterRequest::Apply { dir, snap } => {
                let payload = recv_payload(&mut input)?;
                let resp = reply_result(
                    adapters
                        .source()
                        .and_then(|s| s.apply(Path::new(&dir), &snap, &mut Cursor::new(payload))),
                );
                send_response(&mut output, &resp).map_err(CliError::Common)?;
            }

            AdapterRequest::ListBackups => {
                let resp = match adapters.destination().and_then(|d| d.list_backups()) {
                    Ok(backups) => AdapterResponse::Backups(backups.into_iter().collect()),
                    Err(e) => AdapterResponse::Error { message: e.to_string() },
                };
                send_response(&mut output, &resp).map_err(CliError::Common)?;
            }
            AdapterRequest::Upload { id } => {
                let payload = recv_payload(&mut input)?;
                let resp = reply_result(adapters.destination().and_then(|d| d.upload(&id, &mut Cursor::new(payload))));
                send_response(&mut output, &resp).map_err(CliError::Common)?;
            }
            AdapterRequest::Download { id } => {
                let mut buf = Vec::new();
                match adapters.destination().and_then(|d| d.download(&id, &mut buf)) {
                    Ok(()) => {
                        send_response(&mut output, &AdapterResponse::StreamReady { ty: String::new() }).map_err(CliError::Common)?;
                        send_payload(&mut output, &mut Cursor::new(buf))?;
                    }
                    Err(e) => {
                        send_response(&mut output, &AdapterResponse::Error { message: e.to_string() }).map_err(CliError::Common)?;
                    }
                }
            }
            AdapterRequest::DeleteBackup { id } => {
                let resp = reply_result(adapters.destination().and_then(|d| d.delete(&id)));
                send_response(&mut output, &resp).map_err(CliError::Common)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_equals_and_bare_flags() {
        let opts = parse_flags(&["--type=tar".to_string(), "--path=/src".to_string(), "--no-encryption".to_string()])
            .unwrap()
            .resolve();

        assert_eq!(opts.get("type"), Some("tar"));
        assert_eq!(opts.get("path"), Some("/src"));
        assert_eq!(opts.get("no-encryption"), Some(""));
    }

    #[test]
    fn rejects_a_flag_without_the_leading_dashes() {
        assert!(parse_flags(&["type=tar".to_string()]).is_err());
    }
}
