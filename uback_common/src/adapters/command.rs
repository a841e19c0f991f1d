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

//! The `command`/`proxy`-family `command` adapter: delegates every
//! operation to an external program speaking the [`crate::proto`] protocol
//! over its stdio. Every resolved option other than `type` and `command`
//! itself is flattened into `--key=value` flags so the child can rebuild
//! its own view of the configuration; `@extra-args` entries are appended
//! verbatim after that, letting the child accept flags uback itself has no
//! opinion about.

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
/// `@extra-args` into `--key=value` flags, then appends the literal
/// `@extra-args` values.
fn command_args(opts: &ResolvedOptions) -> Vec<String> {
    let mut args = Vec::new();

    for key in opts.keys() {
        if matches!(key, "type" | "command" | "extra-args") {
            continue;
        }

        if let Some(value) = opts.get(key) {
            args.push(format!("--{key}={value}"));
        } else {
            for value in opts.get_list(key) {
                args.push(format!("--{key}={value}"));
            }
        }
    }

    args.extend(opts.get_list("extra-args").iter().cloned());
    args
}

fn expect_ok(resp: AdapterResponse) -> Result<()> {
    match resp {
        AdapterResponse::Ok => Ok(()),
        other => Err(Error::HelperFailed(format!("expected Ok, got {other:?}"))),
    }
}

pub struct CommandSource {
    transport: RefCell<ChildTransport>,
}

impl CommandSource {
    /// No `check_schema` call here: the whole point of this adapter is to
    /// forward options the child understands and uback does not, so its
    /// key set can't be bounded in advance.
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        let command = opts.get_required("command")?;
        let transport = ChildTransport::spawn(command, &command_args(opts))?;

        Ok(Self {
            transport: RefCell::new(transport),
        })
    }
}

impl SourceAdapter for CommandSource {
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

pub struct CommandDestination {
    transport: RefCell<ChildTransport>,
}

impl CommandDestination {
    /// Same reasoning as [`CommandSource::new`]: no schema check.
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        let command = opts.get_required("command")?;
        let transport = ChildTransport::spawn(command, &command_args(opts))?;

        Ok(Self {
            transport: RefCell::new(transport),
        })
    }
}

impl DestinationAdapter for CommandDestination {
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
