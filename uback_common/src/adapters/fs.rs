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

//! The `fs` destination: backups live as plain files under `path`, named
//! `<prefix><backup-id>.ubkp`. Uploads land atomically by writing to a
//! `.part` sibling and renaming it into place once fully written.

use crate::adapter::{DestinationAdapter, COMMON_DEST_KEYS};
use crate::options::ResolvedOptions;
use crate::snapshot::BackupId;
use crate::Result;

use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

const EXTENSION: &str = "ubkp";

pub struct FsDestination {
    path: PathBuf,
    prefix: String,
}

impl FsDestination {
    pub fn new(opts: &ResolvedOptions) -> Result<Self> {
        opts.check_schema(COMMON_DEST_KEYS)?;

        Ok(Self {
            path: PathBuf::from(opts.get_required("path")?),
            prefix: opts.get_or("prefix", "").to_string(),
        })
    }

    fn final_path(&self, id: &BackupId) -> PathBuf {
        self.path.join(format!("{}{}.{EXTENSION}", self.prefix, id.as_str()))
    }

    fn part_path(&self, id: &BackupId) -> PathBuf {
        self.path.join(format!("{}{}.{EXTENSION}.part", self.prefix, id.as_str()))
    }
}

impl DestinationAdapter for FsDestination {
    fn list_backups(&self) -> Result<BTreeSet<BackupId>> {
        let mut backups = BTreeSet::new();

        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };

            let Some(name) = name.strip_prefix(&self.prefix) else {
                continue;
            };
            let Some(name) = name.strip_suffix(&format!(".{EXTENSION}")) else {
                continue;
            };

            if let Ok(id) = BackupId::try_from(name) {
                backups.insert(id);
            }
        }

        Ok(backups)
    }

    fn upload(&self, id: &BackupId, reader: &mut dyn Read) -> Result<()> {
        fs::create_dir_all(&self.path)?;

        let part = self.part_path(id);
        {
            let mut file = fs::File::create(&part)?;
            std::io::copy(reader, &mut file)?;
            file.flush()?;
        }

        fs::rename(&part, self.final_path(id))?;
        Ok(())
    }

    fn download(&self, id: &BackupId, writer: &mut dyn Write) -> Result<()> {
        let mut file = fs::File::open(self.final_path(id))?;
        std::io::copy(&mut file, writer)?;
        Ok(())
    }

    fn delete(&self, id: &BackupId) -> Result<()> {
        fs::remove_file(self.final_path(id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;
    use tempfile::tempdir;

    fn opts(pairs: &[(&str, &str)]) -> ResolvedOptions {
        let mut o = crate::options::Options::new();
        for (k, v) in pairs {
            o.push(k.to_string(), v.to_string());
        }
        o.resolve()
    }

    #[test]
    fn upload_then_download_roundtrips() {
        let dir = tempdir().unwrap();
        let dest = FsDestination::new(&opts(&[("path", dir.path().to_str().unwrap())])).unwrap();

        let id = BackupId::try_from("20210101T000000.000-full").unwrap();
        dest.upload(&id, &mut Cursor::new(b"payload".to_vec())).unwrap();

        assert!(dest.list_backups().unwrap().contains(&id));

        let mut out = Vec::new();
        dest.download(&id, &mut out).unwrap();
        assert_eq!(out, b"payload");

        dest.delete(&id).unwrap();
        assert!(!dest.list_backups().unwrap().contains(&id));
    }

    #[test]
    fn upload_does_not_leave_a_part_file_behind() {
        let dir = tempdir().unwrap();
        let dest = FsDestination::new(&opts(&[("path", dir.path().to_str().unwrap())])).unwrap();

        let id = BackupId::try_from("20210101T000000.000-full").unwrap();
        dest.upload(&id, &mut Cursor::new(b"payload".to_vec())).unwrap();

        assert!(!dest.part_path(&id).exists());
    }

    #[test]
    fn prefix_isolates_listings() {
        let dir = tempdir().unwrap();
        let prefixed = FsDestination::new(&opts(&[("path", dir.path().to_str().unwrap()), ("prefix", "node-a-")])).unwrap();
        let unprefixed = FsDestination::new(&opts(&[("path", dir.path().to_str().unwrap())])).unwrap();

        let id = BackupId::try_from("20210101T000000.000-full").unwrap();
        prefixed.upload(&id, &mut Cursor::new(b"payload".to_vec())).unwrap();

        assert!(prefixed.list_backups().unwrap().contains(&id));
        assert!(!unprefixed.list_backups().unwrap().contains(&id));
    }
}
