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

use crate::options::{Options, ResolvedOptions};
use crate::{template, Error, Result};

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A `PresetStore` is a named collection of raw (unresolved) [`Options`],
/// backed by one TOML file per presets directory. `preset=<name>` in a
/// later option list splices the stored pairs in at that position.
#[derive(Debug)]
pub struct PresetStore {
    path: PathBuf,
    presets: HashMap<String, Options>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct OnDisk {
    #[serde(flatten)]
    presets: HashMap<String, Options>,
}

impl PresetStore {
    /// The on-disk file name within a presets directory.
    const FILE_NAME: &'static str = "presets.toml";

    /// Default presets directory when `-p` is not given on the command
    /// line.
    pub const DEFAULT_DIR: &'static str = "/etc/uback/presets";

    /// Loads the store from `dir`. A missing directory or file is treated
    /// as an empty store.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(Self::FILE_NAME);

        let presets = match fs::read_to_string(&path) {
            Ok(s) => toml::from_str::<OnDisk>(&s)?.presets,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, presets })
    }

    /// Persists the store, creating the presets directory if absent.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let on_disk = OnDisk {
            presets: self.presets.clone(),
        };
        let s = toml::to_string_pretty(&on_disk)?;
        fs::write(&self.path, s)?;

        Ok(())
    }

    /// Appends `opts` to the named preset, creating it if absent. Matches
    /// the observed behavior where repeated `preset set` calls against the
    /// same name accumulate rather than overwrite.
    pub fn set(&mut self, name: &str, opts: Options) {
        self.presets.entry(name.to_string()).or_default().extend(opts);
    }

    /// Removes a preset. Returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.presets.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Options> {
        self.presets.get(name)
    }

    /// Preset names in sorted order, for deterministic `preset list`
    /// output.
    pub fn names_sorted(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.presets.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Renders `name [[k1 v1] [k2 v2] …]`, the format `preset list -v`
    /// prints per preset.
    pub fn format_verbose(&self, name: &str) -> Option<String> {
        let opts = self.presets.get(name)?;
        let pairs: Vec<String> = opts.iter().map(|(k, v)| format!("[{k} {v}]")).collect();

        Some(format!("{name} [{}]", pairs.join(" ")))
    }

    /// Splices every `preset=<name>` reference in `opts` with that
    /// preset's own (recursively spliced) pairs, depth-first, in place of
    /// the reference. Fails with [`Error::User`] on an unknown preset name
    /// or a preset reference cycle.
    pub fn splice(&self, opts: &Options) -> Result<Options> {
        let mut visiting = HashSet::new();
        self.splice_with(opts, &mut visiting)
    }

    fn splice_with(&self, opts: &Options, visiting: &mut HashSet<String>) -> Result<Options> {
        let mut out = Options::new();

        for (key, value) in opts.iter() {
            if key == "preset" {
                if !visiting.insert(value.to_string()) {
                    return Err(Error::User(format!("Preset reference cycle at \"{value}\"")));
                }

                let referenced = self
                    .presets
                    .get(value)
                    .ok_or_else(|| Error::User(format!("Unknown preset \"{value}\"")))?;
                let spliced = self.splice_with(referenced, visiting)?;
                out.extend(spliced);

                visiting.remove(value);
            } else {
                out.push(key.to_string(), value.to_string());
            }
        }

        Ok(out)
    }

    /// Like [`eval`](Self::eval), but keeps the original kebab-case keys
    /// instead of projecting onto `CamelCase`: splices presets, renders
    /// templates, and returns the result as a [`ResolvedOptions`] ready to
    /// hand to an adapter constructor. This is what `backup`/`restore`/
    /// `list`/`prune` call to turn a raw option string into something
    /// `adapter::source_adapter`/`destination_adapter` can consume.
    pub fn resolve(&self, opts: &Options) -> Result<ResolvedOptions> {
        let spliced = self.splice(opts)?;
        let resolved = spliced.resolve();

        let mut camel_values: HashMap<String, String> = HashMap::new();
        let mut kebab_for_camel: HashMap<String, String> = HashMap::new();

        for (key, value) in resolved.scalar_pairs() {
            let camel = template::camel_case(key);
            kebab_for_camel.insert(camel.clone(), key.to_string());
            camel_values.insert(camel, value.to_string());
        }

        let rendered = resolve_templates(camel_values)?;

        let mut out = Options::new();
        for (camel, value) in &rendered {
            out.push(kebab_for_camel[camel].clone(), value.clone());
        }
        for (key, values) in resolved.list_pairs() {
            for value in values {
                out.push(format!("@{key}"), value.clone());
            }
        }

        Ok(out.resolve())
    }

    /// Fully evaluates `opts`: splices presets, resolves scalar/list
    /// values, then renders every `{{ … }}` template expression in
    /// topological dependency order. Returns the resolved `CamelCase key
    /// -> value` map that `preset eval` prints (sorted by key).
    pub fn eval(&self, opts: &Options) -> Result<Vec<(String, String)>> {
        let spliced = self.splice(opts)?;
        let resolved = spliced.resolve();

        let mut values: HashMap<String, String> = HashMap::new();
        let mut camel_to_kebab: HashMap<String, String> = HashMap::new();

        for (key, value) in resolved.scalar_pairs() {
            let camel = template::camel_case(key);
            camel_to_kebab.insert(camel.clone(), key.to_string());
            values.insert(camel, value.to_string());
        }

        let rendered = resolve_templates(values)?;

        let mut out: Vec<(String, String)> = rendered.into_iter().collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(out)
    }
}

/// Topologically resolves `{{ … }}` references among `raw` values (keyed
/// by CamelCase identifier), returning the same map with every value fully
/// rendered. Fails with [`Error::User`] on a reference cycle or a
/// reference to a key that isn't present at all.
fn resolve_templates(raw: HashMap<String, String>) -> Result<HashMap<String, String>> {
    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut in_progress: HashSet<String> = HashSet::new();

    fn resolve_one(
        key: &str,
        raw: &HashMap<String, String>,
        resolved: &mut HashMap<String, String>,
        in_progress: &mut HashSet<String>,
    ) -> Result<String> {
        if let Some(v) = resolved.get(key) {
            return Ok(v.clone());
        }

        if !in_progress.insert(key.to_string()) {
            return Err(Error::User(format!("Template reference cycle at \".{key}\"")));
        }

        let value = raw
            .get(key)
            .ok_or_else(|| Error::User(format!("Template references unknown key \".{key}\"")))?;

        for dep in template::referenced_keys(value)? {
            resolve_one(&dep, raw, resolved, in_progress)?;
        }

        let rendered = template::render(value, resolved)?;
        resolved.insert(key.to_string(), rendered.clone());
        in_progress.remove(key);

        Ok(rendered)
    }

    for key in raw.keys() {
        resolve_one(key, &raw, &mut resolved, &mut in_progress)?;
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn set_appends_rather_than_overwrites() {
        let mut store = PresetStore::load(&tempdir().unwrap().path().to_path_buf()).unwrap();
        store.set("tar-src", Options::parse("@Command=sudo").unwrap());
        assert_eq!(store.format_verbose("tar-src").unwrap(), "tar-src [[@Command sudo]]");

        store.set("tar-src", Options::parse("@Command=tar").unwrap());
        assert_eq!(
            store.format_verbose("tar-src").unwrap(),
            "tar-src [[@Command sudo] [@Command tar]]"
        );
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let mut store = PresetStore::load(dir.path()).unwrap();
        store.set("tar-src", Options::parse("type=tar").unwrap());
        store.save().unwrap();

        let reloaded = PresetStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("tar-src").unwrap().resolve().get("type"), Some("tar"));
    }

    #[test]
    fn s8_preset_eval_scenario() {
        let mut store = PresetStore::load(&tempdir().unwrap().path().to_path_buf()).unwrap();

        store.set(
            "escape-path",
            Options::parse(r#"escaped-path={{.Path|clean|replace "/" "-"|trimSuffix "-"}}"#).unwrap(),
        );
        store.set(
            "src",
            {
                let mut o = Options::new();
                o.push("state-file".to_string(), "/var/lib/uback/state/{{.EscapedPath}}.json".to_string());
                o.push("key-file".to_string(), "/etc/uback/backup.pub".to_string());
                o
            },
        );
        store.set("tar-src", {
            let mut o = Options::new();
            o.push("type".to_string(), "tar".to_string());
            o.push("preset".to_string(), "escape-path".to_string());
            o.push("preset".to_string(), "src".to_string());
            o
        });

        let mut input = Options::new();
        input.push("path".to_string(), "/etc".to_string());
        input.push("preset".to_string(), "tar-src".to_string());

        let result = store.eval(&input).unwrap();

        assert_eq!(
            result,
            vec![
                ("EscapedPath".to_string(), "-etc".to_string()),
                ("KeyFile".to_string(), "/etc/uback/backup.pub".to_string()),
                ("Path".to_string(), "/etc".to_string()),
                ("StateFile".to_string(), "/var/lib/uback/state/-etc.json".to_string()),
                ("Type".to_string(), "tar".to_string()),
            ]
        );
    }

    #[test]
    fn resolve_keeps_kebab_case_keys() {
        let store = PresetStore::load(&tempdir().unwrap().path().to_path_buf()).unwrap();

        let mut input = Options::new();
        input.push("type".to_string(), "tar".to_string());
        input.push("path".to_string(), "/etc".to_string());
        input.push("state-file".to_string(), "/var/lib/uback/state/{{.Path}}.json".to_string());
        input.push("@exclude".to_string(), "./c".to_string());

        let resolved = store.resolve(&input).unwrap();
        assert_eq!(resolved.get("type"), Some("tar"));
        assert_eq!(resolved.get("state-file"), Some("/var/lib/uback/state//etc.json"));
        assert_eq!(resolved.get_list("exclude"), &["./c".to_string()]);
    }

    #[test]
    fn unknown_preset_reference_fails() {
        let store = PresetStore::load(&tempdir().unwrap().path().to_path_buf()).unwrap();
        let opts = Options::parse("preset=nope").unwrap();
        assert!(store.splice(&opts).is_err());
    }

    #[test]
    fn preset_cycle_is_rejected() {
        let mut store = PresetStore::load(&tempdir().unwrap().path().to_path_buf()).unwrap();
        store.set("a", Options::parse("preset=b").unwrap());
        store.set("b", Options::parse("preset=a").unwrap());

        let opts = Options::parse("preset=a").unwrap();
        assert!(store.splice(&opts).is_err());
    }
}
