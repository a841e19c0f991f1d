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

//! The `btrfs` source and destination: snapshots are read-only btrfs
//! subvolumes, streamed with `btrfs send` (incrementally with `-p` when a
//! base is given) and landed with `btrfs receive`. The subvolume
//! create/delete commands are run directly; the send/receive/delete
//! commands that touch the snapshot stream itself are configurable, since
//! they commonly need a `sudo` prefix when uback doesn't run as root.

use crate::adapter::{DestinationAdapter, SourceAdapter, COMMON_DEST_KEYS, COMMON_SOURCE_KEYS};
use crate::options::ResolvedOptions;
use crate::snapshot::{BackupId, SnapshotId};
use crate::{Error, Result};

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

const INDEX_FILE: &str = ".uback-backups.json";

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

pub struct BtrfsSource {
    path: PathBuf,
    snapshots_path: PathBuf,
    send_command: String,
    receive_command: String,
    delete_command: String,
}

impl BtrfsSource {
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        let schema: Vec<&str> = COMMON_SOURCE_KEYS
            .iter()
            .chain(["send-command", "receive-command", "delete-command"].iter())
            .copied()
            .collect();
        opts.check_schema(&schema)?;

        Ok(Self {
            path: PathBuf::from(opts.get_required("path")?),
            snapshots_path: PathBuf::from(opts.get_required("snapshots-path")?),
            send_command: opts.get_or("send-command", "btrfs send").to_string(),
            receive_command: opts.get_or("receive-command", "btrfs receive").to_string(),
            delete_command: opts.get_or("delete-command", "btrfs subvolume delete").to_string(),
        })
    }

    fn snapshot_path(&self, snap: &SnapshotId) -> PathBuf {
        self.snapshots_path.join(snap.as_str())
    }
}

impl SourceAdapter for BtrfsSource {
    fn create_snapshot(&self, snap: &SnapshotId) -> Result<()> {
        run(
            "btrfs subvolume snapshot -r",
            &[
                self.path.to_str().expect("utf8 path"),
                self.snapshot_path(snap).to_str().expect("utf8 path"),
            ],
        )
    }

    fn list_snapshots(&self) -> Result<BTreeSet<SnapshotId>> {
        let mut snapshots = BTreeSet::new();

        for entry in fs::read_dir(&self.snapshots_path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = SnapshotId::try_from(name) {
                    snapshots.insert(id);
                }
            }
        }

        Ok(snapshots)
    }

    fn delete_snapshot(&self, snap: &SnapshotId) -> Result<()> {
        run(&self.delete_command, &[self.snapshot_path(snap).to_str().expect("utf8 path")])
    }

    fn can_incremental(&self, base: &SnapshotId) -> Result<bool> {
        Ok(self.snapshot_path(base).exists())
    }

    fn stream(&self, snap: &SnapshotId, base: Option<&SnapshotId>) -> Result<(String, Box<dyn Read>)> {
        let (program, mut args) = split_command(&self.send_command)?;

        if let Some(base) = base {
            args.push("-p".to_string());
            args.push(self.snapshot_path(base).to_str().expect("utf8 path").to_string());
        }
        args.push(self.snapshot_path(snap).to_str().expect("utf8 path").to_string());

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdout = child.stdout.expect("stdout was piped");

        Ok(("btrfs".to_string(), Box::new(BufReader::new(stdout))))
    }

    fn apply(&self, dir: &Path, _snap: &SnapshotId, reader: &mut dyn Read) -> Result<()> {
        fs::create_dir_all(dir)?;

        let (program, mut args) = split_command(&self.receive_command)?;
        args.push(dir.to_str().expect("utf8 path").to_string());

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

        Ok(())
    }
}

/// Receive-side landing for both `btrfs` sources and other `btrfs`
/// destinations: subvolumes under `path`, keyed by the snapshot taken, with
/// a small JSON index mapping each landed snapshot back to its
/// [`BackupId`] (full vs. incremental-with-base is metadata `btrfs receive`
/// itself does not expose to us).
pub struct BtrfsDestination {
    path: PathBuf,
    send_command: String,
    receive_command: String,
    delete_command: String,
}

#[derive(Default, serde::Deserialize, serde::Serialize)]
struct Index(HashMap<String, String>);

impl BtrfsDestination {
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        let schema: Vec<&str> = COMMON_DEST_KEYS
            .iter()
            .chain(["send-command", "receive-command", "delete-command"].iter())
            .copied()
            .collect();
        opts.check_schema(&schema)?;

        Ok(Self {
            path: PathBuf::from(opts.get_required("path")?),
            send_command: opts.get_or("send-command", "btrfs send").to_string(),
            receive_command: opts.get_or("receive-command", "btrfs receive").to_string(),
            delete_command: opts.get_or("delete-command", "btrfs subvolume delete").to_string(),
        })
    }

    fn index_path(&self) -> PathBuf {
        self.path.join(INDEX_FILE)
    }

    fn load_index(&self) -> Result<Index> {
        match fs::read_to_string(self.index_path()) {
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Index::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_index(&self, index: &Index) -> Result<()> {
        fs::write(self.index_path(), serde_json::to_string_pretty(index)?)?;
        Ok(())
    }

    fn snapshot_dir_name(id: &BackupId) -> Result<String> {
        let (snap, _) = id.parse()?;
        Ok(snap.as_str().to_string())
    }
}

impl DestinationAdapter for BtrfsDestination {
    fn list_backups(&self) -> Result<BTreeSet<BackupId>> {
        let index = self.load_index()?;

        index
            .0
            .values()
            .map(|raw| BackupId::try_from(raw.as_str()))
            .collect()
    }

    fn upload(&self, id: &BackupId, reader: &mut dyn Read) -> Result<()> {
        fs::create_dir_all(&self.path)?;

        let (program, mut args) = split_command(&self.receive_command)?;
        args.push(self.path.to_str().expect("utf8 path").to_string());

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

        let mut index = self.load_index()?;
        index.0.insert(Self::snapshot_dir_name(id)?, id.as_str().to_string());
        self.save_index(&index)
    }

    fn download(&self, id: &BackupId, writer: &mut dyn Write) -> Result<()> {
        let subvol = self.path.join(Self::snapshot_dir_name(id)?);

        let (program, mut args) = split_command(&self.send_command)?;
        args.push(subvol.to_str().expect("utf8 path").to_string());

        let child: Child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let mut stdout: ChildStdout = child.stdout.expect("stdout was piped");
        std::io::copy(&mut stdout, writer)?;

        Ok(())
    }

    fn delete(&self, id: &BackupId) -> Result<()> {
        let dir_name = Self::snapshot_dir_name(id)?;
        run(&self.delete_command, &[self.path.join(&dir_name).to_str().expect("utf8 path")])?;

        let mut index = self.load_index()?;
        index.0.remove(&dir_name);
        self.save_index(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_separates_program_and_args() {
        let (program, args) = split_command("sudo btrfs send").unwrap();
        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["btrfs".to_string(), "send".to_string()]);
    }

    #[test]
    fn snapshot_dir_name_strips_the_backup_suffix() {
        let snap = SnapshotId::try_from("20210101T000000.000").unwrap();
        let id = BackupId::full(&snap);
        assert_eq!(BtrfsDestination::snapshot_dir_name(&id).unwrap(), "20210101T000000.000");
    }
}
