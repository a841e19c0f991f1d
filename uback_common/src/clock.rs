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

use std::sync::Mutex;

use chrono::Utc;

/// A `Clock` allocates [`SnapshotId`]s, guaranteeing that successive calls
/// to [`Clock::next`] within one process return strictly increasing values
/// even if the wall clock has not advanced since the previous call.
pub struct Clock {
    last: Mutex<Option<SnapshotId>>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    /// Allocates the next `SnapshotId`. If the wall clock produces a value
    /// not strictly greater than the previous one, bumps the previous
    /// value by one millisecond instead of returning a duplicate.
    pub fn next(&self) -> SnapshotId {
        let mut last = self.last.lock().unwrap();

        let now = SnapshotId::from_utc(Utc::now());
        let next = match &*last {
            Some(prev) if now <= *prev => bump_millis(prev),
            _ => now,
        };

        *last = Some(next.clone());
        next
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns a `SnapshotId` exactly one millisecond after `id`, preserving
/// its `YYYYMMDDThhmmss.mmm` format.
fn bump_millis(id: &SnapshotId) -> SnapshotId {
    let dt = chrono::NaiveDateTime::parse_from_str(id.as_str(), "%Y%m%dT%H%M%S%.3f")
        .expect("SnapshotId always carries a well-formed timestamp");
    let bumped = dt + chrono::Duration::milliseconds(1);

    SnapshotId::try_from(bumped.format("%Y%m%dT%H%M%S%.3f").to_string())
        .expect("bumped timestamp is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successive_calls_strictly_increase() {
        let clock = Clock::new();

        let mut prev = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > prev, "{next} was not greater than {prev}");
            prev = next;
        }
    }

    #[test]
    fn bump_millis_preserves_format() {
        let id = SnapshotId::try_from("20210101T000000.000").unwrap();
        let bumped = bump_millis(&id);
        assert_eq!(bumped.as_str(), "20210101T000000.001");
    }

    #[test]
    fn bump_millis_rolls_over_second() {
        let id = SnapshotId::try_from("20210101T000000.999").unwrap();
        let bumped = bump_millis(&id);
        assert_eq!(bumped.as_str(), "20210101T000001.000");
    }
}
