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

use crate::{Error, Result};

use std::fmt;

/// A `SnapshotId` is a `YYYYMMDDThhmmss.mmm` UTC timestamp string. It is
/// total-ordered by plain lexicographic comparison of the underlying string,
/// which is why the format is fixed-width and zero-padded throughout.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Builds a `SnapshotId` from a UTC date/time, truncated to millisecond
    /// resolution.
    pub fn from_utc(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self(dt.format("%Y%m%dT%H%M%S%.3f").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for SnapshotId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        chrono::NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S%.3f")
            .map_err(|e| Error::User(format!("Invalid snapshot ID \"{value}\": {e}")))?;

        Ok(Self(value.to_string()))
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::try_from(value.as_str())
    }
}

/// A `BackupId` names either a self-sufficient full backup (`<snap>-full`)
/// or an incremental layered onto an earlier snapshot
/// (`<snap>-from-<base-snap>`). Ordered lexicographically like
/// `SnapshotId`, so a sorted `list backups` prints oldest first and
/// `BTreeSet<BackupId>` is usable directly by destination adapters.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct BackupId(String);

impl BackupId {
    pub fn full(snap: &SnapshotId) -> Self {
        Self(format!("{snap}-full"))
    }

    pub fn incremental(snap: &SnapshotId, base: &SnapshotId) -> Self {
        Self(format!("{snap}-from-{base}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the snapshot ID this backup captures, and, for an
    /// incremental, the base snapshot it is layered onto.
    pub fn parse(&self) -> Result<(SnapshotId, Option<SnapshotId>)> {
        if let Some(snap) = self.0.strip_suffix("-full") {
            return Ok((SnapshotId::try_from(snap)?, None));
        }

        if let Some(idx) = self.0.find("-from-") {
            let snap = &self.0[..idx];
            let base = &self.0[idx + "-from-".len()..];

            return Ok((SnapshotId::try_from(snap)?, Some(SnapshotId::try_from(base)?)));
        }

        Err(Error::User(format!("Malformed backup ID \"{}\"", self.0)))
    }

    pub fn is_full(&self) -> bool {
        self.0.ends_with("-full")
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for BackupId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        let id = Self(value.to_string());
        id.parse()?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    #[test]
    fn formats_with_millis() {
        let dt = chrono::Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(SnapshotId::from_utc(dt).as_str(), "20210101T000000.000");
    }

    #[test]
    fn lexicographic_order_matches_time_order() {
        let a = SnapshotId::try_from("20210101T000000.000").unwrap();
        let b = SnapshotId::try_from("20210102T000000.000").unwrap();
        assert!(a < b);
    }

    #[test]
    fn full_backup_id_roundtrips() {
        let snap = SnapshotId::try_from("20210101T000000.000").unwrap();
        let id = BackupId::full(&snap);
        assert_eq!(id.as_str(), "20210101T000000.000-full");

        let (parsed_snap, base) = id.parse().unwrap();
        assert_eq!(parsed_snap, snap);
        assert_eq!(base, None);
    }

    #[test]
    fn incremental_backup_id_roundtrips() {
        let snap = SnapshotId::try_from("20210102T000000.000").unwrap();
        let base = SnapshotId::try_from("20210101T000000.000").unwrap();
        let id = BackupId::incremental(&snap, &base);
        assert_eq!(id.as_str(), "20210102T000000.000-from-20210101T000000.000");

        let (parsed_snap, parsed_base) = id.parse().unwrap();
        assert_eq!(parsed_snap, snap);
        assert_eq!(parsed_base, Some(base));
    }
}
