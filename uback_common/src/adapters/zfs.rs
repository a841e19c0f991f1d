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

//! The `zfs` source and destination: snapshots are named `<dataset>@uback-<snap>`,
//! streamed with `zfs send` (`-R` when `replicate` pulls in child datasets,
//! `-i`/`-I` for incrementals). `use-bookmarks` converts a snapshot to a
//! bookmark once it is no longer needed as a full snapshot, so its space
//! can be reclaimed while it remains a valid incremental base.
//!
//! `dir`/`dataset` overrides at restore time are expected to have already
//! been folded into this adapter's `dataset` field by the caller (the
//! orchestrator rebuilds the adapter from the merged option set); `apply`
//! therefore ignores the `dir` argument other than for the common trait
//! shape, since a ZFS destination is a dataset name, not a filesystem path.

use crate::adapter::{DestinationAdapter, SourceAdapter, COMMON_DEST_KEYS, COMMON_SOURCE_KEYS};
use crate::options::ResolvedOptions;
use crate::snapshot::{BackupId, SnapshotId};
use crate::{Error, Result};

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};

const SNAP_PREFIX: &str = "uback-";

fn split_command(s: &str) -> Result<(String, Vec<String>)> {
    let mut parts = s.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| Error::User("empty command".to_string()))?
        .to_string();

    Ok((program, parts.map(str::to_string).collect()))
}

fn run(command: &str, args: &[&str]) -> Result<()> {
    let (program, base_args) = split_command(command)?;

    let status = Command::new(&program)
        .args(&base_args)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()?
        .wait()?;

    if !status.success() {
        return Err(Error::HelperFailed(format!("\"{command}\" exited with {status}")));
    }

    Ok(())
}

fn snap_name(dataset: &str, snap: &SnapshotId) -> String {
    format!("{dataset}@{SNAP_PREFIX}{}", snap.as_str())
}

fn bookmark_name(dataset: &str, snap: &SnapshotId) -> String {
    format!("{dataset}#{SNAP_PREFIX}{}", snap.as_str())
}

pub struct ZfsSource {
    dataset: String,
    destroy_command: String,
    replicate: bool,
    use_bookmarks: bool,
    exclude: Vec<String>,
}

impl ZfsSource {
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        let schema: Vec<&str> = COMMON_SOURCE_KEYS
            .iter()
            .chain(["destroy-command", "replicate", "use-bookmarks"].iter())
            .copied()
            .collect();
        opts.check_schema(&schema)?;

        Ok(Self {
            dataset: opts.get_required("dataset")?.to_string(),
            destroy_command: opts.get_or("destroy-command", "zfs destroy").to_string(),
            replicate: opts.get_bool("replicate", false),
            use_bookmarks: opts.get_bool("use-bookmarks", true),
            exclude: opts.get_list("exclude").to_vec(),
        })
    }

    fn snapshot_exists(&self, snap: &SnapshotId) -> bool {
        Command::new("zfs")
            .args(["list", "-H", "-t", "snapshot", "-o", "name", &snap_name(&self.dataset, snap)])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn bookmark_exists(&self, snap: &SnapshotId) -> bool {
        Command::new("zfs")
            .args(["list", "-H", "-t", "bookmark", "-o", "name", &bookmark_name(&self.dataset, snap)])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn base_ref(&self, base: &SnapshotId) -> Result<String> {
        if self.snapshot_exists(base) {
            return Ok(snap_name(&self.dataset, base));
        }
        if self.use_bookmarks && self.bookmark_exists(base) {
            return Ok(bookmark_name(&self.dataset, base));
        }

        Err(Error::ChainBroken(base.as_str().to_string()))
    }
}

impl SourceAdapter for ZfsSource {
    fn create_snapshot(&self, snap: &SnapshotId) -> Result<()> {
        let name = snap_name(&self.dataset, snap);
        let mut args = vec!["snapshot"];
        if self.replicate {
            args.push("-r");
        }
        args.push(&name);

        run("zfs", &args)
    }

    fn list_snapshots(&self) -> Result<BTreeSet<SnapshotId>> {
        let output = Command::new("zfs")
            .args(["list", "-H", "-d", "1", "-t", "snapshot,bookmark", "-o", "name", &self.dataset])
            .stdin(Stdio::null())
            .output()?;

        let mut snapshots = BTreeSet::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Some((_, name)) = line.split_once(['@', '#']) {
                if let Some(raw) = name.strip_prefix(SNAP_PREFIX) {
                    if let Ok(id) = SnapshotId::try_from(raw) {
                        snapshots.insert(id);
                    }
                }
            }
        }

        Ok(snapshots)
    }

    fn delete_snapshot(&self, snap: &SnapshotId) -> Result<()> {
        if self.use_bookmarks && self.snapshot_exists(snap) {
            run("zfs", &["bookmark", &snap_name(&self.dataset, snap), &bookmark_name(&self.dataset, snap)])?;
        }

        if self.snapshot_exists(snap) {
            let name = snap_name(&self.dataset, snap);
            let mut args = vec![];
            if self.replicate {
                args.push("-r");
            }
            args.push(name.as_str());
            run(&self.destroy_command, &args)?;
        }

        Ok(())
    }

    fn can_incremental(&self, base: &SnapshotId) -> Result<bool> {
        Ok(self.snapshot_exists(base) || (self.use_bookmarks && self.bookmark_exists(base)))
    }

    fn stream(&self, snap: &SnapshotId, base: Option<&SnapshotId>) -> Result<(String, Box<dyn Read>)> {
        let mut args = vec!["send".to_string()];
        if self.replicate {
            args.push("-R".to_string());
        }

        if let Some(base) = base {
            args.push("-i".to_string());
            args.push(self.base_ref(base)?);
        }
        args.push(snap_name(&self.dataset, snap));

        let child = Command::new("zfs")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let _ = &self.exclude;
        Ok(("zfs".to_string(), Box::new(child.stdout.expect("stdout was piped"))))
    }

    fn apply(&self, _dir: &Path, _snap: &SnapshotId, reader: &mut dyn Read) -> Result<()> {
        let mut child = Command::new("zfs")
            .args(["receive", "-F", &self.dataset])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;

        {
            let stdin = child.stdin.as_mut().expect("stdin was piped");
            std::io::copy(reader, stdin)?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::HelperFailed(format!("\"zfs receive\" exited with {status}")));
        }

        Ok(())
    }
}

pub struct ZfsDestination {
    dataset: String,
    receive_command: String,
    destroy_command: String,
}

impl ZfsDestination {
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        let schema: Vec<&str> = COMMON_DEST_KEYS
            .iter()
            .chain(["dataset", "receive-command", "destroy-command"].iter())
            .copied()
            .collect();
        opts.check_schema(&schema)?;

        Ok(Self {
            dataset: opts.get_required("dataset")?.to_string(),
            receive_command: opts.get_or("receive-command", "zfs receive").to_string(),
            destroy_command: opts.get_or("destroy-command", "zfs destroy").to_string(),
        })
    }
}

impl DestinationAdapter for ZfsDestination {
    fn list_backups(&self) -> Result<BTreeSet<BackupId>> {
        let output = Command::new("zfs")
            .args(["list", "-H", "-d", "1", "-t", "snapshot", "-o", "name", &self.dataset])
            .stdin(Stdio::null())
            .output()?;

        let mut backups = BTreeSet::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Some((_, name)) = line.split_once('@') {
                if let Some(raw) = name.strip_prefix(SNAP_PREFIX) {
                    if let Ok(id) = BackupId::try_from(format!("{raw}-full").as_str()) {
                        backups.insert(id);
                    }
                }
            }
        }

        Ok(backups)
    }

    fn upload(&self, id: &BackupId, reader: &mut dyn Read) -> Result<()> {
        let (program, mut args) = split_command(&self.receive_command)?;
        args.push("-F".to_string());
        args.push(self.dataset.clone());

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;

        {
            let stdin = child.stdin.as_mut().expect("stdin was piped");
            std::io::copy(reader, stdin)?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::HelperFailed(format!("\"{}\" exited with {status}", self.receive_command)));
        }

        let _ = id;
        Ok(())
    }

    fn download(&self, id: &BackupId, writer: &mut dyn Write) -> Result<()> {
        let (snap, _) = id.parse()?;
        let child = Command::new("zfs")
            .args(["send", &snap_name(&self.dataset, &snap)])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let mut stdout = child.stdout.expect("stdout was piped");
        std::io::copy(&mut stdout, writer)?;
        Ok(())
    }

    fn delete(&self, id: &BackupId) -> Result<()> {
        let (snap, _) = id.parse()?;
        run(&self.destroy_command, &["-r", &snap_name(&self.dataset, &snap)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_name_uses_the_uback_prefix() {
        let snap = SnapshotId::try_from("20210101T000000.000").unwrap();
        assert_eq!(snap_name("pool/source", &snap), "pool/source@uback-20210101T000000.000");
        assert_eq!(bookmark_name("pool/source", &snap), "pool/source#uback-20210101T000000.000");
    }
}
