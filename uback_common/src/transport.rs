// uback_common is the main uback library implementing the container format,
// configuration language and adapter protocol shared by the uback binary.
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

//! Spawns a `command`/`proxy` adapter as a child process and speaks the
//! adapter protocol (see [`crate::proto`]) over its stdio.

use crate::proto::{AdapterRequest, AdapterResponse, PROTOCOL_VERSION};
use crate::{Error, Result};

use std::io::{BufReader, Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};

/// Size of the chunks a payload stream is split into when crossing the
/// child-process boundary.
pub const CHUNKSIZE: usize = 64 * 1024;

/// A `ChildTransport` owns a spawned adapter child and the bincode-framed
/// request/response exchange over its stdio. One instance per adapter
/// call sequence.
pub struct ChildTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ChildTransport {
    /// Spawns `command` (a shell-like string; the first whitespace-separated
    /// word is the program, the rest are leading arguments, letting callers
    /// configure e.g. `"podman exec -i mycontainer uback proxy"` as a
    /// single option value) with `args` appended, and performs the version
    /// handshake.
    pub fn spawn(command: &str, args: &[String]) -> Result<Self> {
        let mut words = command.split_whitespace();
        let program = words.next().ok_or_else(|| Error::User("empty command".to_string()))?;
        let leading_args: Vec<&str> = words.collect();

        let mut child = Command::new(program)
            .args(&leading_args)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));

        let mut transport = Self {
            child,
            stdin: Some(stdin),
            stdout,
        };
        transport.handshake()?;

        Ok(transport)
    }

    fn handshake(&mut self) -> Result<()> {
        self.send(&AdapterRequest::Hello { version: PROTOCOL_VERSION })?;

        match self.recv()? {
            AdapterResponse::Hello { version } if version == PROTOCOL_VERSION => Ok(()),
            AdapterResponse::Hello { version } => Err(Error::HelperFailed(format!(
                "adapter protocol version mismatch: child speaks {version}, we speak {PROTOCOL_VERSION}"
            ))),
            other => Err(Error::HelperFailed(format!("unexpected handshake reply {other:?}"))),
        }
    }

    pub fn send(&mut self, req: &AdapterRequest) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| Error::HelperFailed("adapter stdin already closed".to_string()))?;
        bincode::serialize_into(&mut *stdin, req)?;
        stdin.flush()?;
        Ok(())
    }

    pub fn recv(&mut self) -> Result<AdapterResponse> {
        Ok(bincode::deserialize_from(&mut self.stdout)?)
    }

    /// Sends `req` and returns the child's reply, turning an
    /// [`AdapterResponse::Error`] into a surfaced [`Error::HelperFailed`].
    pub fn call(&mut self, req: &AdapterRequest) -> Result<AdapterResponse> {
        self.send(req)?;

        match self.recv()? {
            AdapterResponse::Error { message } => Err(Error::HelperFailed(message)),
            other => Ok(other),
        }
    }

    /// Streams `reader` to the child as a `Chunk`/`EndOfStream` request
    /// sequence, used after `Upload`/`Apply`.
    pub fn send_payload(&mut self, reader: &mut dyn Read) -> Result<()> {
        let mut buf = vec![0u8; CHUNKSIZE];

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }

            self.send(&AdapterRequest::Chunk(buf[..n].to_vec()))?;
        }

        self.send(&AdapterRequest::EndOfStream)?;
        Ok(())
    }

    /// Reads a `Chunk`/`EndOfStream` response sequence from the child into
    /// `writer`, used after `Stream`/`Download`.
    pub fn recv_payload(&mut self, writer: &mut dyn Write) -> Result<()> {
        loop {
            match self.recv()? {
                AdapterResponse::Chunk(data) => writer.write_all(&data)?,
                AdapterResponse::EndOfStream => break,
                AdapterResponse::Error { message } => return Err(Error::HelperFailed(message)),
                other => {
                    return Err(Error::HelperFailed(format!(
                        "unexpected message while streaming a payload: {other:?}"
                    )))
                }
            }
        }

        Ok(())
    }

    /// Closes stdin and waits for the child to exit, surfacing a non-zero
    /// exit status (with captured stderr) as [`Error::HelperFailed`].
    pub fn finish(mut self) -> Result<()> {
        // Dropping stdin closes the pipe, signalling end-of-input to the
        // child before we wait on it.
        self.stdin.take();

        let status = self.child.wait()?;
        if status.success() {
            return Ok(());
        }

        let stderr = self.read_stderr();
        Err(Error::HelperFailed(stderr))
    }

    fn read_stderr(&mut self) -> String {
        let mut stderr = String::new();
        if let Some(mut s) = self.child.stderr.take() as Option<ChildStderr> {
            let _ = s.read_to_string(&mut stderr);
        }

        stderr
    }
}

/// Reads one bincode-framed [`AdapterRequest`] from `input`. The
/// child-process counterpart to [`ChildTransport::recv`], used by `uback
/// proxy` to serve a request/response loop on its own stdio rather than
/// spawn one.
pub fn recv_request<R: Read>(input: &mut R) -> Result<AdapterRequest> {
    Ok(bincode::deserialize_from(input)?)
}

/// Writes one bincode-framed [`AdapterResponse`] to `output` and flushes
/// it, the child-process counterpart to [`ChildTransport::send`].
pub fn send_response<W: Write>(output: &mut W, resp: &AdapterResponse) -> Result<()> {
    bincode::serialize_into(&mut *output, resp)?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawning_missing_command_is_an_io_error() {
        let err = ChildTransport::spawn("uback-definitely-not-a-real-command", &[]).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn response_round_trips_through_the_server_side_framing() {
        let mut buf = Vec::new();
        send_response(&mut buf, &AdapterResponse::Bool(true)).unwrap();

        let decoded: AdapterResponse = bincode::deserialize(&buf).unwrap();
        assert!(matches!(decoded, AdapterResponse::Bool(true)));
    }

    #[test]
    fn request_round_trips_through_the_server_side_framing() {
        let req = AdapterRequest::ListSnapshots;
        let encoded = bincode::serialize(&req).unwrap();

        let decoded = recv_request(&mut encoded.as_slice()).unwrap();
        assert!(matches!(decoded, AdapterRequest::ListSnapshots));
    }
}
