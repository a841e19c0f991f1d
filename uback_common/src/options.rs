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

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An `Options` is an ordered multimap of `(key, value)` pairs parsed from a
/// comma-separated option string.
///
/// Keys beginning with `@` are list-valued: every occurrence accumulates.
/// All other keys are scalar: the last occurrence wins. Insertion order is
/// preserved since preset splicing and template resolution are both
/// order-sensitive. Serializable as-is so a [`crate::preset::PresetStore`]
/// can persist raw, unresolved option lists to TOML.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Options {
    pairs: Vec<(String, String)>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `k=v,k2=v2,...` option string.
    ///
    /// `pair := key ('=' value)?`. A bare key without `=` is stored with an
    /// empty value. Unescaped commas separate pairs; `\,` is a literal
    /// comma embedded in a key or value.
    pub fn parse(s: &str) -> Result<Self> {
        let mut opts = Self::new();

        for raw_pair in split_unescaped(s, ',') {
            if raw_pair.is_empty() {
                continue;
            }

            let (key, value) = match split_unescaped(&raw_pair, '=').as_slice() {
                [key] => (key.clone(), String::new()),
                [key, value] => (key.clone(), value.clone()),
                _ => {
                    return Err(Error::User(format!(
                        "Malformed option pair \"{raw_pair}\": too many \"=\""
                    )))
                }
            };

            opts.push(key, value);
        }

        Ok(opts)
    }

    /// Appends a raw `(key, value)` pair, preserving insertion order.
    pub fn push(&mut self, key: String, value: String) {
        self.pairs.push((key, value));
    }

    /// Splices another `Options`' pairs in at the end of this one, used to
    /// implement preset expansion.
    pub fn extend(&mut self, other: Options) {
        self.pairs.extend(other.pairs);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Resolves this `Options` into a final scalar/list value map: for
    /// scalar keys the last occurrence wins, for `@`-prefixed keys every
    /// occurrence accumulates in order.
    pub fn resolve(&self) -> ResolvedOptions {
        let mut scalars = HashMap::new();
        let mut lists: HashMap<String, Vec<String>> = HashMap::new();
        let mut order = Vec::new();

        for (key, value) in &self.pairs {
            if let Some(list_key) = key.strip_prefix('@') {
                if !lists.contains_key(list_key) {
                    order.push(list_key.to_string());
                }
                lists.entry(list_key.to_string()).or_default().push(value.clone());
            } else {
                if !scalars.contains_key(key) {
                    order.push(key.clone());
                }
                scalars.insert(key.clone(), value.clone());
            }
        }

        ResolvedOptions {
            scalars,
            lists,
            order,
        }
    }
}

/// Splits `s` on unescaped occurrences of `sep`. A backslash escapes the
/// following character (consumed, without the backslash) anywhere in the
/// string, not only directly before `sep`.
fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == sep {
            parts.push(current);
            current = String::new();
        } else {
            current.push(c);
        }
    }
    parts.push(current);

    parts
}

/// A `ResolvedOptions` is the final, deduplicated view of an [`Options`]:
/// one value per scalar key, one ordered list per `@`-prefixed key.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResolvedOptions {
    scalars: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
    /// First-occurrence order of keys (without the `@` prefix for list keys),
    /// used for deterministic iteration (e.g. `preset list -v`, `preset eval`).
    order: Vec<String>,
}

impl ResolvedOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.scalars.get(key).map(|s| s.as_str())
    }

    pub fn get_required(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::User(format!("Missing required option \"{key}\"")))
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some("") => true,
            Some(v) => matches!(v, "true" | "1" | "yes"),
        }
    }

    pub fn get_list(&self, key: &str) -> &[String] {
        self.lists.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn scalar_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.scalars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn list_pairs(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.lists.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Verifies that every scalar and list key in this map is present in
    /// `schema`. Fails with [`Error::UnknownOption`] on the first key not
    /// recognized.
    pub fn check_schema(&self, schema: &[&str]) -> Result<()> {
        for key in self.scalars.keys().chain(self.lists.keys()) {
            if !schema.contains(&key.as_str()) {
                return Err(Error::UnknownOption(key.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs() {
        let opts = Options::parse("type=tar,path=/tmp/src").unwrap();
        let resolved = opts.resolve();

        assert_eq!(resolved.get("type"), Some("tar"));
        assert_eq!(resolved.get("path"), Some("/tmp/src"));
    }

    #[test]
    fn escaped_comma_is_literal() {
        let opts = Options::parse(r"path=/tmp/a\,b,type=tar").unwrap();
        let resolved = opts.resolve();

        assert_eq!(resolved.get("path"), Some("/tmp/a,b"));
        assert_eq!(resolved.get("type"), Some("tar"));
    }

    #[test]
    fn scalar_last_write_wins() {
        let opts = Options::parse("key-file=/a,key-file=/b").unwrap();
        assert_eq!(opts.resolve().get("key-file"), Some("/b"));
    }

    #[test]
    fn list_values_accumulate() {
        let opts = Options::parse("@command=sudo,@command=tar").unwrap();
        let resolved = opts.resolve();

        assert_eq!(resolved.get_list("command"), &["sudo".to_string(), "tar".to_string()]);
    }

    #[test]
    fn bare_key_has_empty_value() {
        let opts = Options::parse("no-encryption").unwrap();
        assert_eq!(opts.resolve().get("no-encryption"), Some(""));
    }

    #[test]
    fn unknown_option_rejected() {
        let resolved = Options::parse("type=tar,bogus=1").unwrap().resolve();
        let err = resolved.check_schema(&["type", "path"]).unwrap_err();
        assert!(matches!(err, Error::UnknownOption(k) if k == "bogus"));
    }
}
