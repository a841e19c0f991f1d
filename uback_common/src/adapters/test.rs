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

//! The `test` source: a deterministic, dependency-free stand-in for a real
//! source adapter, used to exercise the orchestrator without shelling out
//! to `tar`, `btrfs` or `zfs`. Every snapshot streams as a single fixed
//! payload tagged with the snapshot ID, so restores are trivially
//! verifiable.

use crate::adapter::{SourceAdapter, COMMON_SOURCE_KEYS};
use crate::options::ResolvedOptions;
use crate::snapshot::SnapshotId;
use crate::Result;

use std::collections::BTreeSet;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

pub struct TestSource {
    snapshots_path: PathBuf,
}

impl TestSource {
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        opts.check_schema(COMMON_SOURCE_KEYS)?;

        Ok(Self {
            snapshots_path: PathBuf::from(opts.get_required("snapshots-path")?),
        })
    }

    fn marker_path(&self, snap: &SnapshotId) -> PathBuf {
        self.snapshots_path.join(snap.as_str())
    }
}

impl SourceAdapter for TestSource {
    fn create_snapshot(&self, snap: &SnapshotId) -> Result<()> {
        fs::write(self.marker_path(snap), snap.as_str())?;
        Ok(())
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
        fs::remove_file(self.marker_path(snap))?;
        Ok(())
    }

    fn can_incremental(&self, _base: &SnapshotId) -> Result<bool> {
        Ok(true)
    }

    fn stream(&self, snap: &SnapshotId, base: Option<&SnapshotId>) -> Result<(String, Box<dyn Read>)> {
        let payload = match base {
            Some(base) => format!("test-snapshot:{}:from:{}", snap.as_str(), base.as_str()),
            None => format!("test-snapshot:{}", snap.as_str()),
        };

        Ok(("test".to_string(), Box::new(Cursor::new(payload.into_bytes()))))
    }

    fn apply(&self, dir: &Path, snap: &SnapshotId, reader: &mut dyn Read) -> Result<()> {
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;

        fs::create_dir_all(dir)?;
        fs::write(dir.join(snap.as_str()), payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn opts(snapshots_path: &Path) -> ResolvedOptions {
        let mut o = crate::options::Options::new();
        o.push("snapshots-path".to_string(), snapshots_path.to_str().unwrap().to_string());
        o.resolve()
    }

    #[test]
    fn snapshot_payload_records_its_base() {
        let snap_dir = tempdir().unwrap();
        let restore_dir = tempdir().unwrap();

        let source = TestSource::new(&opts(snap_dir.path())).unwrap();

        let full = SnapshotId::try_from("20210101T000000.000").unwrap();
        let incr = SnapshotId::try_from("20210102T000000.000").unwrap();
        source.create_snapshot(&full).unwrap();
        source.create_snapshot(&incr).unwrap();

        let (ty, mut reader) = source.stream(&incr, Some(&full)).unwrap();
        assert_eq!(ty, "test");

        source.apply(restore_dir.path(), &incr, &mut reader).unwrap();

        let payload = fs::read_to_string(restore_dir.path().join(incr.as_str())).unwrap();
        assert_eq!(payload, format!("test-snapshot:{}:from:{}", incr.as_str(), full.as_str()));
    }
}
