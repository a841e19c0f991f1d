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

//! The `proxy` adapter: like `command`, but the child it spawns is expected
//! to be another `uback proxy` invocation (commonly over `ssh` or
//! `podman exec`), which re-resolves a built-in adapter of its own from
//! `proxy-type`/`proxy-command` and the rest of the flattened options. This
//! is how a source or destination living on a different host gets plugged
//! into an otherwise local backup/restore run.

use crate::adapter::{DestinationAdapter, SourceAdapter};
use crate::options::ResolvedOptions;
use crate::proto::{AdapterRequest, AdapterResponse};
use crate::snapshot::{BackupId, SnapshotId};
use crate::transport::ChildTransport;
use crate::{Error, Result};

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;

/// Flattens every resolved option except `type`, `command` and
/// `proxy-type` into `--key=value` flags, renaming `proxy-type` to `type`
/// and `proxy-command` to `command` so the child resolves the adapter it
/// is actually meant to wrap.
fn proxy_args(opts: &ResolvedOptions) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(proxy_type) = opts.get("proxy-type") {
        args.push(format!("--type={proxy_type}"));
    }

    for key in opts.keys() {
        if matches!(key, "type" | "command" | "proxy-type") {
            continue;
        }

        let out_key = if key == "proxy-command" { "command" } else { key };

        if let Some(value) = opts.get(key) {
            args.push(format!("--{out_key}={value}"));
        } else {
            for value in opts.get_list(key) {
                args.push(format!("--{out_key}={value}"));
            }
        }
    }

    args
}

fn expect_ok(resp: AdapterResponse) -> Result<()> {
    match resp {
        AdapterResponse::Ok => Ok(()),
        other => Err(Error::HelperFailed(format!("expected Ok, got {other:?}"))),
    }
}

pub struct ProxySource {
    transport: RefCell<ChildTransport>,
}

impl ProxySource {
    /// No `check_schema` call: `proxy-type` determines the remote's own
    /// adapter, whose key set isn't known here.
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        let command = opts.get_required("command")?;
        let transport = ChildTransport::spawn(command, &proxy_args(opts))?;

        Ok(Self {
            transport: RefCell::new(transport),
        })
    }
}

impl SourceAdapter for ProxySource {
    fn create_snapshot(&self, snap: &SnapshotId) -> Result<()> {
        let resp = self.transport.borrow_mut().call(&AdapterRequest::CreateSnapshot { snap: snap.clone() })?;
        expect_ok(resp)
    }

    fn list_snapshots(&self) -> Result<BTreeSet<SnapshotId>> {
        match self.transport.borrow_mut().call(&AdapterRequest::ListSnapshots)? {
            AdapterResponse::Snapshots(snaps) => Ok(snaps.into_iter().collect()),
            other => Err(Error::HelperFailed(format!("expected Snapshots, got {other:?}"))),
        }
    }

    fn delete_snapshot(&self, snap: &SnapshotId) -> Result<()> {
        let resp = self.transport.borrow_mut().call(&AdapterRequest::DeleteSnapshot { snap: snap.clone() })?;
        expect_ok(resp)
    }

    fn can_incremental(&self, base: &SnapshotId) -> Result<bool> {
        match self.transport.borrow_mut().call(&AdapterRequest::CanIncremental { base: base.clone() })? {
            AdapterResponse::Bool(b) => Ok(b),
            other => Err(Error::HelperFailed(format!("expected Bool, got {other:?}"))),
        }
    }

    fn stream(&self, snap: &SnapshotId, base: Option<&SnapshotId>) -> Result<(String, Box<dyn Read>)> {
        let mut transport = self.transport.borrow_mut();

        transport.send(&AdapterRequest::Stream {
            snap: snap.clone(),
            base: base.cloned(),
        })?;

        let ty = match transport.recv()? {
            AdapterResponse::StreamReady { ty } => ty,
            AdapterResponse::Error { message } => return Err(Error::HelperFailed(message)),
            other => return Err(Error::HelperFailed(format!("expected StreamReady, got {other:?}"))),
        };

        let mut payload = Vec::new();
        transport.recv_payload(&mut payload)?;

        Ok((ty, Box::new(Cursor::new(payload))))
    }

    fn apply(&self, dir: &Path, snap: &SnapshotId, reader: &mut dyn Read) -> Result<()> {
        let mut transport = self.transport.borrow_mut();

        transport.send(&AdapterRequest::Apply {
            dir: dir.to_str().expect("utf8 path").to_string(),
            snap: snap.clone(),
        })?;
        transport.send_payload(reader)?;

        let resp = transport.recv()?;
        expect_ok(resp)
    }
}

pub struct ProxyDestination {
    transport: RefCell<ChildTransport>,
}

impl ProxyDestination {
    /// Same reasoning as [`ProxySource::new`]: no schema check.
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        let command = opts.get_required("command")?;
        let transport = ChildTransport::spawn(command, &proxy_args(opts))?;

        Ok(Self {
            transport: RefCell::new(transport),
        })
    }
}

impl DestinationAdapter for ProxyDestination {
    fn list_backups(&self) -> Result<BTreeSet<BackupId>> {
        match self.transport.borrow_mut().call(&AdapterRequest::ListBackups)? {
            AdapterResponse::Backups(backups) => Ok(backups.into_iter().collect()),
            other => Err(Error::HelperFailed(format!("expected Backups, got {other:?}"))),
        }
    }

    fn upload(&self, id: &BackupId, reader: &mut dyn Read) -> Result<()> {
        let mut transport = self.transport.borrow_mut();

        transport.send(&AdapterRequest::Upload { id: id.clone() })?;
        transport.send_payload(reader)?;

        let resp = transport.recv()?;
        expect_ok(resp)
    }

    fn download(&self, id: &BackupId, writer: &mut dyn Write) -> Result<()> {
        let mut transport = self.transport.borrow_mut();

        transport.send(&AdapterRequest::Download { id: id.clone() })?;

        match transport.recv()? {
            AdapterResponse::StreamReady { .. } => {}
            AdapterResponse::Error { message } => return Err(Error::HelperFailed(message)),
            other => return Err(Error::HelperFailed(format!("expected StreamReady, got {other:?}"))),
        }

        transport.recv_payload(writer)
    }

    fn delete(&self, id: &BackupId) -> Result<()> {
        let resp = self.transport.borrow_mut().call(&AdapterRequest::DeleteBackup { id: id.clone() })?;
        expect_ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renames_proxy_type_and_proxy_command() {
        let mut o = crate::options::Options::new();
        o.push("type".to_string(), "proxy".to_string());
        o.push("command".to_string(), "uback proxy".to_string());
        o.push("proxy-type".to_string(), "tar".to_string());
        o.push("proxy-command".to_string(), "tar --exclude=./c".to_string());
        o.push("path".to_string(), "/src".to_string());

        let args = proxy_args(&o.resolve());
        assert!(args.contains(&"--type=tar".to_string()));
        assert!(args.contains(&"--command=tar --exclude=./c".to_string()));
        assert!(args.contains(&"--path=/src".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--proxy-type=") || a.starts_with("--proxy-command=")));
    }
}
