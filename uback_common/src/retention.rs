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

use crate::snapshot::{BackupId, SnapshotId};
use crate::{Error, Result};

use std::collections::{HashMap, HashSet};

/// A single `daily=3`-style bucket rule: keep at most `count` of the most
/// recent buckets sized `period` seconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Rule {
    period_secs: i64,
    count: u32,
}

/// A `RetentionPolicy` is an ordered list of bucket rules, parsed from the
/// repeatable `@retention-policy` option (`daily=3`, `weekly=4`, a literal
/// duration like `12h`, etc.). Rule order only matters as a tie-breaking
/// convention between equally-valid selections; the kept set is the union
/// of what every rule selects.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RetentionPolicy {
    rules: Vec<Rule>,
}

impl RetentionPolicy {
    /// Builds a policy from the raw `rule=count` strings of an
    /// `@retention-policy` option list, in the order given.
    pub fn parse(raw_rules: &[String]) -> Result<Self> {
        let mut rules = Vec::with_capacity(raw_rules.len());

        for raw in raw_rules {
            let (name, count) = raw.split_once('=').ok_or_else(|| {
                Error::User(format!("Malformed retention rule \"{raw}\": expected \"name=count\""))
            })?;
            let count: u32 = count
                .parse()
                .map_err(|_| Error::User(format!("Malformed retention rule \"{raw}\": count must be a non-negative integer")))?;

            rules.push(Rule {
                period_secs: period_secs(name)?,
                count,
            });
        }

        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Selects the subset of `backups` to keep. `backups` need not be
    /// sorted. The returned set always includes every full backup still
    /// required by a kept incremental, even if that full itself fell
    /// outside every rule's bucket window.
    pub fn select_kept(&self, backups: &HashSet<BackupId>) -> Result<HashSet<BackupId>> {
        let mut timestamps = HashMap::new();
        for id in backups {
            let (snap, _) = id.parse()?;
            timestamps.insert(id.clone(), snap);
        }

        let mut kept = HashSet::new();

        for rule in &self.rules {
            kept.extend(self.select_for_rule(rule, backups, &timestamps));
        }

        // Pull in every ancestor a kept incremental still depends on, even
        // if the ancestor itself was not claimed by any rule.
        let mut by_snap: HashMap<SnapshotId, BackupId> = HashMap::new();
        for id in backups {
            let (snap, _) = id.parse()?;
            by_snap.insert(snap, id.clone());
        }

        let mut frontier: Vec<BackupId> = kept.iter().cloned().collect();
        while let Some(id) = frontier.pop() {
            let (_, base) = id.parse()?;
            if let Some(base_snap) = base {
                if let Some(base_id) = by_snap.get(&base_snap) {
                    if kept.insert(base_id.clone()) {
                        frontier.push(base_id.clone());
                    }
                }
            }
        }

        Ok(kept)
    }

    fn select_for_rule(
        &self,
        rule: &Rule,
        backups: &HashSet<BackupId>,
        timestamps: &HashMap<BackupId, SnapshotId>,
    ) -> HashSet<BackupId> {
        // Group backups into buckets keyed by `floor(ts / period)`, newest
        // bucket first.
        let mut buckets: HashMap<i64, Vec<&BackupId>> = HashMap::new();

        for id in backups {
            let snap = &timestamps[id];
            let secs = snapshot_epoch_secs(snap);
            let bucket = secs.div_euclid(rule.period_secs);
            buckets.entry(bucket).or_default().push(id);
        }

        let mut bucket_keys: Vec<i64> = buckets.keys().copied().collect();
        bucket_keys.sort_unstable_by(|a, b| b.cmp(a));

        let mut kept = HashSet::new();
        for bucket in bucket_keys.into_iter().take(rule.count as usize) {
            let candidates = &buckets[&bucket];
            // Tie-break by lexicographic Backup ID, preferring the larger
            // (later) one.
            if let Some(newest) = candidates.iter().max_by(|a, b| a.as_str().cmp(b.as_str())) {
                kept.insert((*newest).clone());
            }
        }

        kept
    }
}

/// Exposed to the orchestrator, which needs the same epoch conversion to
/// judge snapshot age against `full-interval`/`reuse-snapshots`.
pub(crate) fn snapshot_epoch_secs(snap: &SnapshotId) -> i64 {
    chrono::NaiveDateTime::parse_from_str(snap.as_str(), "%Y%m%dT%H%M%S%.3f")
        .expect("SnapshotId always carries a well-formed timestamp")
        .and_utc()
        .timestamp()
}

/// Exposed to the orchestrator, which parses `full-interval`/
/// `reuse-snapshots` durations with the same grammar as a retention rule's
/// bucket size.
pub(crate) fn period_secs(name: &str) -> Result<i64> {
    const MINUTE: i64 = 60;
    const HOUR: i64 = 3600;
    const DAY: i64 = 86400;

    match name {
        "last" => Ok(1),
        "hourly" => Ok(HOUR),
        "daily" => Ok(DAY),
        "weekly" => Ok(7 * DAY),
        "monthly" => Ok(30 * DAY),
        "yearly" => Ok(365 * DAY),
        _ => {
            let (digits, unit) = name.split_at(name.len().saturating_sub(1));
            let n: i64 = digits
                .parse()
                .map_err(|_| Error::User(format!("Unknown retention rule name \"{name}\"")))?;

            match unit {
                "m" => Ok(n * MINUTE),
                "h" => Ok(n * HOUR),
                "d" => Ok(n * DAY),
                _ => Err(Error::User(format!("Unknown retention rule name \"{name}\""))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(strs: &[&str]) -> HashSet<BackupId> {
        strs.iter().map(|s| BackupId::try_from(*s).unwrap()).collect()
    }

    #[test]
    fn s5_retention_scenario() {
        let policy = RetentionPolicy::parse(&["daily=3".to_string()]).unwrap();
        let backups = ids(&[
            "20210101T000000.000-full",
            "20210102T000000.000-from-20210101T000000.000",
            "20210103T000000.000-full",
            "20210104T000000.000-from-20210103T000000.000",
            "20210105T000000.000-full",
            "20210106T000000.000-from-20210105T000000.000",
        ]);

        let kept = policy.select_kept(&backups).unwrap();

        assert_eq!(
            kept,
            ids(&[
                "20210103T000000.000-full",
                "20210104T000000.000-from-20210103T000000.000",
                "20210105T000000.000-full",
                "20210106T000000.000-from-20210105T000000.000",
            ])
        );
    }

    #[test]
    fn empty_policy_keeps_nothing() {
        let policy = RetentionPolicy::default();
        let backups = ids(&["20210101T000000.000-full"]);
        assert!(policy.select_kept(&backups).unwrap().is_empty());
    }

    #[test]
    fn literal_duration_rule() {
        let policy = RetentionPolicy::parse(&["12h=2".to_string()]).unwrap();
        let backups = ids(&[
            "20210101T000000.000-full",
            "20210101T120000.000-from-20210101T000000.000",
            "20210102T000000.000-from-20210101T120000.000",
        ]);

        let kept = policy.select_kept(&backups).unwrap();
        assert!(kept.contains(&BackupId::try_from("20210102T000000.000-from-20210101T120000.000").unwrap()));
    }
}
