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

//! The `tar` source: snapshots are a marker file under `snapshots-path`,
//! streamed as a `tar` archive of `path`. `tar` cannot express a binary
//! delta, so every "incremental" is really a fresh full archive of the
//! current tree — which is why file deletions never show up in a tar
//! restore of an earlier snapshot (see the source's own doc comment on
//! `stream`).

use crate::adapter::{SourceAdapter, COMMON_SOURCE_KEYS};
use crate::options::ResolvedOptions;
use crate::snapshot::SnapshotId;
use crate::{Error, Result};

use std::collections::BTreeSet;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

pub struct TarSource {
    path: PathBuf,
    snapshots_path: PathBuf,
    excludes: Vec<String>,
}

impl TarSource {
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        opts.check_schema(COMMON_SOURCE_KEYS)?;

        Ok(Self {
            path: PathBuf::from(opts.get_required("path")?),
            snapshots_path: PathBuf::from(opts.get_required("snapshots-path")?),
            excludes: opts.get_list("exclude").to_vec(),
        })
    }

    fn marker_path(&self, snap: &SnapshotId) -> PathBuf {
        self.snapshots_path.join(snap.as_str())
    }

    fn is_excluded(&self, rel: &Path) -> bool {
        self.excludes.iter().any(|ex| {
            let ex = ex.strip_prefix("./").unwrap_or(ex);
            rel == Path::new(ex) || rel.starts_with(ex)
        })
    }
}

impl SourceAdapter for TarSource {
    fn create_snapshot(&self, snap: &SnapshotId) -> Result<()> {
        fs::File::create(self.marker_path(snap))?;
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

    /// `base` is accepted but unused: a tar "incremental" simply re-archives
    /// the tree as it stands now.
    fn stream(&self, _snap: &SnapshotId, _base: Option<&SnapshotId>) -> Result<(String, Box<dyn Read>)> {
        let mut buf = Vec::new();
        {
            let mut builder = ::tar::Builder::new(&mut buf);

            for entry in walk(&self.path)? {
                let rel = entry.strip_prefix(&self.path).expect("walked entry is under path");
                if self.is_excluded(rel) {
                    continue;
                }

                if entry.is_file() {
                    builder.append_path_with_name(&entry, rel)?;
                }
            }

            builder.finish()?;
        }

        Ok(("tar".to_string(), Box::new(Cursor::new(buf))))
    }

    /// Unpacks into `dir/<snap>`, where `snap` is the snapshot the whole
    /// restore is producing a tree for, not necessarily the snapshot this
    /// particular chain member was taken at: the orchestrator calls
    /// `apply` once per chain member, full-then-incrementals, always
    /// passing the restore target's own snapshot, so each later tar
    /// overlays on top of the same subdirectory instead of landing in one
    /// of its own.
    fn apply(&self, dir: &Path, snap: &SnapshotId, reader: &mut dyn Read) -> Result<()> {
        let target = dir.join(snap.as_str());
        fs::create_dir_all(&target)?;

        let mut archive = ::tar::Archive::new(reader);
        archive.unpack(&target)?;

        Ok(())
    }
}

fn walk(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }

    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn opts(pairs: &[(&str, &str)]) -> ResolvedOptions {
        let mut o = crate::options::Options::new();
        for (k, v) in pairs {
            o.push(k.to_string(), v.to_string());
        }
        o.resolve()
    }

    #[test]
    fn streams_and_applies_a_flat_tree() {
        let src_dir = tempdir().unwrap();
        let snap_dir = tempdir().unwrap();
        let restore_dir = tempdir().unwrap();

        fs::write(src_dir.path().join("a"), "av1").unwrap();

        let source = TarSource::new(&opts(&[
            ("path", src_dir.path().to_str().unwrap()),
            ("snapshots-path", snap_dir.path().to_str().unwrap()),
        ]))
        .unwrap();

        let snap = SnapshotId::try_from("20210101T000000.000").unwrap();
        source.create_snapshot(&snap).unwrap();
        assert!(source.list_snapshots().unwrap().contains(&snap));

        let (ty, mut reader) = source.stream(&snap, None).unwrap();
        assert_eq!(ty, "tar");

        source.apply(restore_dir.path(), &snap, &mut reader).unwrap();

        let restored = fs::read_to_string(restore_dir.path().join(snap.as_str()).join("a")).unwrap();
        assert_eq!(restored, "av1");
    }

    #[test]
    fn excludes_named_entries() {
        let src_dir = tempdir().unwrap();
        let snap_dir = tempdir().unwrap();
        let restore_dir = tempdir().unwrap();

        fs::write(src_dir.path().join("a"), "av1").unwrap();
        fs::write(src_dir.path().join("c"), "c").unwrap();
        fs::create_dir(src_dir.path().join("d")).unwrap();
        fs::write(src_dir.path().join("d").join("e"), "e").unwrap();

        let source = TarSource::new(&opts(&[
            ("path", src_dir.path().to_str().unwrap()),
            ("snapshots-path", snap_dir.path().to_str().unwrap()),
            ("@exclude", "./c"),
        ]))
        .unwrap();

        let snap = SnapshotId::try_from("20210101T000000.000").unwrap();
        source.create_snapshot(&snap).unwrap();

        let (_, mut reader) = source.stream(&snap, None).unwrap();
        source.apply(restore_dir.path(), &snap, &mut reader).unwrap();

        let restored = restore_dir.path().join(snap.as_str());
        assert!(restored.join("a").exists());
        assert!(!restored.join("c").exists());
    }
}
