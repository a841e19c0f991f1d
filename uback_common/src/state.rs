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

use crate::snapshot::SnapshotId;
use crate::Result;

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A `StateFile` records, per destination id, the most recent snapshot
/// that has been successfully written there from this source. Absence of
/// the backing file is equivalent to an empty map.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(flatten)]
    entries: HashMap<String, SnapshotId>,
}

impl StateFile {
    /// Loads the state map from `path`. A missing file is treated as an
    /// empty map rather than an error.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically persists the state map to `path`: the new content is
    /// written to a sibling `.tmp` file, then renamed over `path`. The
    /// parent directory must already exist; `save` never creates one.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let s = serde_json::to_string_pretty(self)?;

        let mut opts = OpenOptions::new();
        opts.create(true).write(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o0600);

        let mut f = opts.open(&tmp_path)?;
        write!(f, "{s}")?;
        f.sync_all()?;
        drop(f);

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn get(&self, dst_id: &str) -> Option<&SnapshotId> {
        self.entries.get(dst_id)
    }

    pub fn set(&mut self, dst_id: impl Into<String>, snap: SnapshotId) {
        self.entries.insert(dst_id.into(), snap);
    }

    /// Every snapshot currently referenced by some destination's entry,
    /// used by source-side retention to avoid deleting a snapshot another
    /// destination still depends on.
    pub fn referenced_snapshots(&self) -> impl Iterator<Item = &SnapshotId> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn missing_file_is_empty_map() {
        let dir = tempdir().unwrap();
        let state = StateFile::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(state.get("dst"), None);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = StateFile::default();
        state.set("dst-a", SnapshotId::try_from("20210101T000000.000").unwrap());
        state.save(&path).unwrap();

        let reloaded = StateFile::load(&path).unwrap();
        assert_eq!(
            reloaded.get("dst-a"),
            Some(&SnapshotId::try_from("20210101T000000.000").unwrap())
        );
    }

    #[test]
    fn save_overwrites_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = StateFile::default();
        state.set("dst-a", SnapshotId::try_from("20210101T000000.000").unwrap());
        state.save(&path).unwrap();

        state.set("dst-a", SnapshotId::try_from("20210102T000000.000").unwrap());
        state.save(&path).unwrap();

        let reloaded = StateFile::load(&path).unwrap();
        assert_eq!(
            reloaded.get("dst-a"),
            Some(&SnapshotId::try_from("20210102T000000.000").unwrap())
        );
    }
}
