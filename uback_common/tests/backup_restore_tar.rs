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

//! End-to-end coverage of a `tar` source backed by an `fs` destination,
//! growing and mutating a source tree across several incremental backups
//! and checking the restored tree after each one.

use uback_common::key;
use uback_common::options::Options;
use uback_common::orchestrator;
use uback_common::preset::PresetStore;

use std::fs;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

fn source_opts(root: &Path) -> Options {
    let mut o = Options::new();
    o.push("type".to_string(), "tar".to_string());
    o.push("path".to_string(), root.join("tree").to_str().unwrap().to_string());
    o.push("snapshots-path".to_string(), root.join("snapshots").to_str().unwrap().to_string());
    o.push("state-file".to_string(), root.join("state.json").to_str().unwrap().to_string());
    o.push("key-file".to_string(), root.join("backup.pub").to_str().unwrap().to_string());
    o.push("@exclude".to_string(), "./c".to_string());
    o.push("@exclude".to_string(), "./d".to_string());
    o
}

fn dest_opts(root: &Path) -> Options {
    let mut o = Options::new();
    o.push("id".to_string(), "d1".to_string());
    o.push("type".to_string(), "fs".to_string());
    o.push("path".to_string(), root.join("backups").to_str().unwrap().to_string());
    o.push("key-file".to_string(), root.join("backup.key").to_str().unwrap().to_string());
    o
}

fn restored_files(restore_dir: &Path) -> Vec<(String, String)> {
    let mut files: Vec<(String, String)> = fs::read_dir(restore_dir)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            let name = entry.file_name().to_str().unwrap().to_string();
            let content = fs::read_to_string(entry.path()).unwrap();
            (name, content)
        })
        .collect();

    files.sort();
    files
}

#[test]
fn tar_source_grows_and_mutates_across_incremental_backups() {
    let root = tempfile::tempdir().unwrap();
    let root = root.path();

    let (private, public) = key::generate();
    fs::write(root.join("backup.key"), &private).unwrap();
    fs::write(root.join("backup.pub"), &public).unwrap();

    fs::create_dir_all(root.join("tree")).unwrap();
    fs::create_dir_all(root.join("snapshots")).unwrap();
    fs::create_dir_all(root.join("tree/d")).unwrap();

    fs::write(root.join("tree/a"), "av1").unwrap();
    fs::write(root.join("tree/c"), "c").unwrap();
    fs::write(root.join("tree/d/e"), "e").unwrap();

    let presets = PresetStore::load(root).unwrap();
    let src = source_opts(root);
    let dst = dest_opts(root);

    // S1 - first backup is full, excludes ./c and ./d; restore is {a}.
    let id = orchestrator::backup(&presets, &src, &dst, false, true).unwrap();
    let (snap, _) = id.parse().unwrap();

    let restore_dir = root.join("restore-1");
    fs::create_dir_all(&restore_dir).unwrap();
    orchestrator::restore(&presets, &dst, None, None, &restore_dir).unwrap();
    assert_eq!(restored_files(&restore_dir.join(snap.as_str())), vec![("a".to_string(), "av1".to_string())]);

    // S2 - add b, incremental backup, restore is {a, b}.
    sleep(Duration::from_millis(2));
    fs::write(root.join("tree/b"), "bv1").unwrap();
    let id = orchestrator::backup(&presets, &src, &dst, false, true).unwrap();
    let (snap, _) = id.parse().unwrap();

    let restore_dir = root.join("restore-2");
    fs::create_dir_all(&restore_dir).unwrap();
    orchestrator::restore(&presets, &dst, None, None, &restore_dir).unwrap();
    assert_eq!(
        restored_files(&restore_dir.join(snap.as_str())),
        vec![("a".to_string(), "av1".to_string()), ("b".to_string(), "bv1".to_string())]
    );

    // S3 - modify a, incremental backup, restore is {a=av2, b=bv1}.
    sleep(Duration::from_millis(2));
    fs::write(root.join("tree/a"), "av2").unwrap();
    let id = orchestrator::backup(&presets, &src, &dst, false, true).unwrap();
    let (snap, _) = id.parse().unwrap();

    let restore_dir = root.join("restore-3");
    fs::create_dir_all(&restore_dir).unwrap();
    orchestrator::restore(&presets, &dst, None, None, &restore_dir).unwrap();
    assert_eq!(
        restored_files(&restore_dir.join(snap.as_str())),
        vec![("a".to_string(), "av2".to_string()), ("b".to_string(), "bv1".to_string())]
    );
}
