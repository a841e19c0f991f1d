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

//! Ties the adapter, container, state, preset/template and retention
//! layers together into the four user-facing operations: `backup`,
//! `restore`, `list` and `prune`.

use crate::adapter::{self, DestinationAdapter, SourceAdapter};
use crate::clock::Clock;
use crate::container;
use crate::options::{Options, ResolvedOptions};
use crate::preset::PresetStore;
use crate::retention::{self, RetentionPolicy};
use crate::snapshot::{BackupId, SnapshotId};
use crate::state::StateFile;
use crate::{Error, Result};

use std::collections::HashSet;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{info, warn};

/// Which half of a `list`/`prune` invocation's `target` option string
/// names: `snapshots` resolves it as a source, `backups` as a
/// destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target {
    Snapshots,
    Backups,
}

fn now_epoch_secs() -> i64 {
    Utc::now().timestamp()
}

fn snapshot_age_secs(snap: &SnapshotId, now: i64) -> i64 {
    now - retention::snapshot_epoch_secs(snap)
}

fn duration_opt(opts: &ResolvedOptions, key: &str) -> Result<Option<i64>> {
    opts.get(key).map(retention::period_secs).transpose()
}

fn read_private_key(path: &str) -> Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

/// Runs `backup`: resolves `src_opts`/`dst_opts` against `presets`,
/// decides full vs. incremental, streams and (unless `no-encryption` is
/// set) encrypts the source, uploads it, records the new state and
/// — unless `skip_retention` — prunes both ends. Returns the `BackupId`
/// that was emitted, the sole line `uback backup` prints to standard
/// output.
pub fn backup(
    presets: &PresetStore,
    src_opts: &Options,
    dst_opts: &Options,
    force_full: bool,
    skip_retention: bool,
) -> Result<BackupId> {
    let src = presets.resolve(src_opts)?;
    let dst = presets.resolve(dst_opts)?;

    let dst_id = dst.get_required("id")?.to_string();
    let state_path = src.get_required("state-file")?.to_string();

    let mut state = StateFile::load(Path::new(&state_path))?;
    let last = state.get(&dst_id).cloned();

    let source = adapter::source_adapter(&src)?;
    let destination = adapter::destination_adapter(&dst)?;

    let now = now_epoch_secs();
    let reuse_window = duration_opt(&src, "reuse-snapshots")?;

    let snap = match reuse_window.and_then(|window| {
        source
            .list_snapshots()
            .ok()?
            .iter()
            .max()
            .filter(|newest| snapshot_age_secs(newest, now) < window)
            .cloned()
    }) {
        Some(reused) => {
            info!("reusing snapshot {reused} for destination \"{dst_id}\" (within reuse-snapshots window)");
            reused
        }
        None => {
            let snap = Clock::new().next();
            source.create_snapshot(&snap)?;
            snap
        }
    };

    let snapshots = source.list_snapshots()?;
    let full_interval = duration_opt(&src, "full-interval")?;

    let base = resolve_base(
        force_full,
        &last,
        &snap,
        &snapshots,
        source.as_ref(),
        destination.as_ref(),
        full_interval,
    )?;

    let backup_id = match &base {
        Some(base_snap) => BackupId::incremental(&snap, base_snap),
        None => BackupId::full(&snap),
    };

    let no_encryption = src.get_bool("no-encryption", false);
    let (ty, mut plaintext) = source.stream(&snap, base.as_ref())?;

    let mut body = Vec::new();
    if no_encryption {
        io::copy(&mut plaintext, &mut body)?;
    } else {
        let recipients = adapter::recipients_from_opts(&src)?;
        let mut writer = container::encode(&mut body, &ty, &recipients)?;
        io::copy(&mut plaintext, &mut writer)?;
        writer.finish()?;
    }

    destination.upload(&backup_id, &mut Cursor::new(body))?;

    state.set(dst_id.clone(), snap.clone());
    state.save(Path::new(&state_path))?;

    if !skip_retention {
        let mut keep = HashSet::new();
        keep.insert(snap);
        for referenced in state.referenced_snapshots() {
            keep.insert(referenced.clone());
        }

        for deleted in prune_source_snapshots(source.as_ref(), &src, &keep)? {
            info!("pruned source snapshot {deleted}");
        }
        for deleted in prune_destination_backups(destination.as_ref(), &dst)? {
            info!("pruned backup {deleted} at destination \"{dst_id}\"");
        }
    }

    Ok(backup_id)
}

/// Decides whether the upcoming backup should be full or incremental
/// against `last`. `full-interval` measures elapsed time since the
/// destination's most recent *full* backup, not since `last` itself,
/// since `last` may already be an incremental.
#[allow(clippy::too_many_arguments)]
fn resolve_base(
    force_full: bool,
    last: &Option<SnapshotId>,
    snap: &SnapshotId,
    snapshots: &std::collections::BTreeSet<SnapshotId>,
    source: &dyn SourceAdapter,
    destination: &dyn DestinationAdapter,
    full_interval: Option<i64>,
) -> Result<Option<SnapshotId>> {
    if force_full {
        return Ok(None);
    }

    let Some(last_snap) = last else {
        return Ok(None);
    };

    if !snapshots.contains(last_snap) {
        return Ok(None);
    }

    if !source.can_incremental(last_snap)? {
        return Ok(None);
    }

    if let Some(interval) = full_interval {
        match newest_full_snapshot(destination)? {
            None => return Ok(None),
            Some(last_full) => {
                let elapsed = retention::snapshot_epoch_secs(snap) - retention::snapshot_epoch_secs(&last_full);
                if elapsed >= interval {
                    return Ok(None);
                }
            }
        }
    }

    Ok(Some(last_snap.clone()))
}

/// The snapshot time of the destination's most recent full backup, used
/// to judge `full-interval`. `None` if it has no full backup at all yet.
fn newest_full_snapshot(destination: &dyn DestinationAdapter) -> Result<Option<SnapshotId>> {
    let mut newest: Option<SnapshotId> = None;

    for id in destination.list_backups()? {
        if !id.is_full() {
            continue;
        }

        let (snap, _) = id.parse()?;
        if newest.as_ref().is_none_or(|n| snap > *n) {
            newest = Some(snap);
        }
    }

    Ok(newest)
}

/// Deletes every source snapshot not in `keep` and older than the
/// `reuse-snapshots` window (if any), leaving younger unreferenced
/// snapshots around in case a not-yet-run destination reuses them.
fn prune_source_snapshots(source: &dyn SourceAdapter, src: &ResolvedOptions, keep: &HashSet<SnapshotId>) -> Result<Vec<SnapshotId>> {
    let reuse_window = duration_opt(src, "reuse-snapshots")?;
    let now = now_epoch_secs();

    let mut deleted = Vec::new();
    for snap in source.list_snapshots()? {
        if keep.contains(&snap) {
            continue;
        }
        if let Some(window) = reuse_window {
            if snapshot_age_secs(&snap, now) < window {
                continue;
            }
        }

        source.delete_snapshot(&snap)?;
        deleted.push(snap);
    }

    Ok(deleted)
}

fn prune_destination_backups(destination: &dyn DestinationAdapter, dst: &ResolvedOptions) -> Result<Vec<BackupId>> {
    let policy = RetentionPolicy::parse(dst.get_list("retention-policy"))?;
    if policy.is_empty() {
        return Ok(Vec::new());
    }

    let backups: HashSet<BackupId> = destination.list_backups()?.into_iter().collect();
    let kept = policy.select_kept(&backups)?;

    let mut deleted = Vec::new();
    for id in backups {
        if !kept.contains(&id) {
            destination.delete(&id)?;
            deleted.push(id);
        }
    }

    Ok(deleted)
}

/// Runs `restore`: downloads `backup_id` (or the newest one, if omitted)
/// from `dst_opts`, walks its ancestor chain back to a full backup, and
/// applies each container in order under `dir`.
///
/// Unlike `backup`, `restore` is not given a source option string on the
/// command line — only the container's embedded type tag and whatever
/// `apply_opts` supplies (e.g. `receive-command=...` for a `btrfs`
/// source). `apply_opts` is spliced/templated the same way `src_opts`/
/// `dst_opts` are.
pub fn restore(presets: &PresetStore, dst_opts: &Options, apply_opts: Option<&Options>, backup_id: Option<&str>, dir: &Path) -> Result<()> {
    let dst = presets.resolve(dst_opts)?;
    let destination = adapter::destination_adapter(&dst)?;

    let available = destination.list_backups()?;
    let target = match backup_id {
        Some(raw) => BackupId::try_from(raw)?,
        None => newest_backup(&available).ok_or_else(|| Error::User("Destination has no backups to restore".to_string()))?,
    };

    let chain = resolve_chain(&target, &available)?;
    let (target_snap, _) = target.parse()?;

    let no_encryption = dst.get_bool("no-encryption", false);
    let private_key = if no_encryption { None } else { Some(read_private_key(dst.get_required("key-file")?)?) };

    let mut source: Option<Box<dyn SourceAdapter>> = None;

    for id in &chain {
        let mut raw = Vec::new();
        destination.download(id, &mut raw)?;

        let (ty, mut plaintext): (String, Box<dyn io::Read>) = if no_encryption {
            (dst.get_required("type")?.to_string(), Box::new(Cursor::new(raw)))
        } else {
            let (ty, reader) = container::decode(Cursor::new(raw), private_key.as_ref().expect("checked above"))?;
            (ty, Box::new(reader))
        };

        if source.is_none() {
            source = Some(adapter::source_adapter(&build_apply_options(presets, &ty, apply_opts)?)?);
        }

        source.as_ref().expect("constructed above").apply(dir, &target_snap, &mut plaintext)?;
    }

    Ok(())
}

/// Builds the `ResolvedOptions` used to construct the source adapter for
/// `apply`: `type=<ty>` from the container header, plus whatever
/// `apply_opts` supplies on top (spliced/templated like any other option
/// string).
fn build_apply_options(presets: &PresetStore, ty: &str, apply_opts: Option<&Options>) -> Result<ResolvedOptions> {
    let mut raw = Options::new();
    raw.push("type".to_string(), ty.to_string());
    if let Some(extra) = apply_opts {
        raw.extend(extra.clone());
    }

    presets.resolve(&raw)
}

fn newest_backup(backups: &std::collections::BTreeSet<BackupId>) -> Option<BackupId> {
    backups
        .iter()
        .filter_map(|id| id.parse().ok().map(|(snap, _)| (snap, id.clone())))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, id)| id)
}

/// Walks `target`'s ancestor chain back to a full backup, returning it in
/// apply order (full first). Fails with [`Error::ChainBroken`] if any
/// ancestor is missing from `available`.
fn resolve_chain(target: &BackupId, available: &std::collections::BTreeSet<BackupId>) -> Result<Vec<BackupId>> {
    let mut chain = vec![target.clone()];
    let mut current = target.clone();

    loop {
        let (_, base) = current.parse()?;
        let Some(base_snap) = base else { break };

        let next = available
            .iter()
            .find(|id| matches!(id.parse(), Ok((snap, _)) if snap == base_snap))
            .cloned()
            .ok_or_else(|| Error::ChainBroken(target.as_str().to_string()))?;

        chain.push(next.clone());
        current = next;
    }

    chain.reverse();
    Ok(chain)
}

/// Runs `list {snapshots|backups} target`: one ID per line, ascending.
pub fn list(presets: &PresetStore, target_opts: &Options, target: Target) -> Result<Vec<String>> {
    let resolved = presets.resolve(target_opts)?;

    let mut ids: Vec<String> = match target {
        Target::Snapshots => {
            let source = adapter::source_adapter(&resolved)?;
            source.list_snapshots()?.into_iter().map(|s| s.as_str().to_string()).collect()
        }
        Target::Backups => {
            let destination = adapter::destination_adapter(&resolved)?;
            destination.list_backups()?.into_iter().map(|b| b.as_str().to_string()).collect()
        }
    };

    ids.sort();
    Ok(ids)
}

/// Runs `prune {snapshots|backups} target`: applies the retention policy
/// (for `backups`) or the referenced/reuse-window rule (for `snapshots`)
/// and deletes everything not kept. Returns the deleted IDs.
pub fn prune(presets: &PresetStore, target_opts: &Options, target: Target) -> Result<Vec<String>> {
    let resolved = presets.resolve(target_opts)?;

    match target {
        Target::Snapshots => {
            let source = adapter::source_adapter(&resolved)?;

            let mut keep = HashSet::new();
            if let Some(state_path) = resolved.get("state-file") {
                match StateFile::load(Path::new(state_path)) {
                    Ok(state) => keep.extend(state.referenced_snapshots().cloned()),
                    Err(e) => warn!("could not load state file \"{state_path}\": {e}"),
                }
            }

            Ok(prune_source_snapshots(source.as_ref(), &resolved, &keep)?
                .into_iter()
                .map(|s| s.as_str().to_string())
                .collect())
        }
        Target::Backups => {
            let destination = adapter::destination_adapter(&resolved)?;
            Ok(prune_destination_backups(destination.as_ref(), &resolved)?
                .into_iter()
                .map(|b| b.as_str().to_string())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::key;

    use tempfile::tempdir;

    fn source_opts(dir: &Path, state_file: &str, pub_key: &str) -> Options {
        let mut o = Options::new();
        o.push("type".to_string(), "test".to_string());
        o.push("snapshots-path".to_string(), dir.join("snapshots").to_str().unwrap().to_string());
        o.push("state-file".to_string(), dir.join(state_file).to_str().unwrap().to_string());
        o.push("key-file".to_string(), dir.join(pub_key).to_str().unwrap().to_string());
        o
    }

    fn dest_opts(dir: &Path, id: &str, priv_key: &str) -> Options {
        let mut o = Options::new();
        o.push("id".to_string(), id.to_string());
        o.push("type".to_string(), "fs".to_string());
        o.push("path".to_string(), dir.join(format!("backups-{id}")).to_str().unwrap().to_string());
        o.push("key-file".to_string(), dir.join(priv_key).to_str().unwrap().to_string());
        o
    }

    fn write_keys(dir: &Path) {
        let (private, public) = key::generate();
        std::fs::write(dir.join("backup.key"), private).unwrap();
        std::fs::write(dir.join("backup.pub"), public).unwrap();
    }

    #[test]
    fn first_backup_is_always_full() {
        let dir = tempdir().unwrap();
        write_keys(dir.path());
        std::fs::create_dir_all(dir.path().join("snapshots")).unwrap();

        let presets = PresetStore::load(dir.path()).unwrap();
        let src = source_opts(dir.path(), "state.json", "backup.pub");
        let dst = dest_opts(dir.path(), "d1", "backup.key");

        let id = backup(&presets, &src, &dst, false, true).unwrap();
        assert!(id.is_full());
    }

    #[test]
    fn second_backup_is_incremental_and_restores_the_chain() {
        let dir = tempdir().unwrap();
        write_keys(dir.path());
        std::fs::create_dir_all(dir.path().join("snapshots")).unwrap();

        let presets = PresetStore::load(dir.path()).unwrap();
        let src = source_opts(dir.path(), "state.json", "backup.pub");
        let dst = dest_opts(dir.path(), "d1", "backup.key");

        let full_id = backup(&presets, &src, &dst, false, true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let incr_id = backup(&presets, &src, &dst, false, true).unwrap();

        assert!(full_id.is_full());
        assert!(!incr_id.is_full());

        let restore_dir = dir.path().join("restore");
        std::fs::create_dir_all(&restore_dir).unwrap();
        restore(&presets, &dst, None, None, &restore_dir).unwrap();

        let (latest_snap, _) = incr_id.parse().unwrap();
        let restored = std::fs::read_to_string(restore_dir.join(latest_snap.as_str())).unwrap();
        assert!(restored.contains(&format!("from:{}", full_id.parse().unwrap().0)));
    }

    #[test]
    fn force_full_ignores_existing_state() {
        let dir = tempdir().unwrap();
        write_keys(dir.path());
        std::fs::create_dir_all(dir.path().join("snapshots")).unwrap();

        let presets = PresetStore::load(dir.path()).unwrap();
        let src = source_opts(dir.path(), "state.json", "backup.pub");
        let dst = dest_opts(dir.path(), "d1", "backup.key");

        backup(&presets, &src, &dst, false, true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let forced = backup(&presets, &src, &dst, true, true).unwrap();
        assert!(forced.is_full());
    }

    #[test]
    fn reuse_snapshots_shares_one_snapshot_across_destinations() {
        let dir = tempdir().unwrap();
        write_keys(dir.path());
        std::fs::create_dir_all(dir.path().join("snapshots")).unwrap();

        let presets = PresetStore::load(dir.path()).unwrap();
        let mut src = source_opts(dir.path(), "state.json", "backup.pub");
        src.push("reuse-snapshots".to_string(), "1d".to_string());

        let dst1 = dest_opts(dir.path(), "d1", "backup.key");
        let dst2 = dest_opts(dir.path(), "d2", "backup.key");

        let id1 = backup(&presets, &src, &dst1, false, true).unwrap();
        let id2 = backup(&presets, &src, &dst2, false, true).unwrap();

        assert_eq!(id1, id2);

        let state = StateFile::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(state.get("d1"), state.get("d2"));
    }

    #[test]
    fn list_and_prune_backups_respects_retention_policy() {
        let dir = tempdir().unwrap();
        write_keys(dir.path());
        std::fs::create_dir_all(dir.path().join("snapshots")).unwrap();

        let presets = PresetStore::load(dir.path()).unwrap();
        let src = source_opts(dir.path(), "state.json", "backup.pub");
        let mut dst = dest_opts(dir.path(), "d1", "backup.key");
        dst.push("@retention-policy".to_string(), "last=1".to_string());

        backup(&presets, &src, &dst, true, true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        backup(&presets, &src, &dst, true, true).unwrap();

        assert_eq!(list(&presets, &dst, Target::Backups).unwrap().len(), 2);

        let deleted = prune(&presets, &dst, Target::Backups).unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(list(&presets, &dst, Target::Backups).unwrap().len(), 1);
    }

    #[test]
    fn restore_of_unknown_backup_id_fails_chain_broken() {
        let dir = tempdir().unwrap();
        write_keys(dir.path());
        std::fs::create_dir_all(dir.path().join("snapshots")).unwrap();

        let presets = PresetStore::load(dir.path()).unwrap();
        let src = source_opts(dir.path(), "state.json", "backup.pub");
        let dst = dest_opts(dir.path(), "d1", "backup.key");
        backup(&presets, &src, &dst, false, true).unwrap();

        let restore_dir = dir.path().join("restore");
        std::fs::create_dir_all(&restore_dir).unwrap();

        let err = restore(&presets, &dst, None, Some("20210101T000000.000-from-20201231T000000.000"), &restore_dir).unwrap_err();
        assert!(matches!(err, Error::ChainBroken(_)));
    }
}
