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

//! A tiny, closed-grammar template evaluator for option values: `{{ .Key
//! |func arg… }}` expressions referencing sibling keys by their CamelCase
//! name. This is deliberately not a general templating library — the
//! grammar below is everything `preset eval` needs and nothing more.

use crate::{Error, Result};

/// Converts a kebab-case option key (`state-file`) to its template
/// identifier (`StateFile`).
pub fn camel_case(key: &str) -> String {
    key.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// One `{{ … }}` expression: a key reference followed by zero or more
/// pipeline functions applied left to right.
struct Expr {
    key: String,
    pipeline: Vec<(String, Vec<String>)>,
}

/// Returns the CamelCase keys referenced by any `{{ .Key … }}` expression
/// in `value`, used to build the dependency graph for topological
/// resolution.
pub fn referenced_keys(value: &str) -> Result<Vec<String>> {
    Ok(find_exprs(value)?.into_iter().map(|e| e.key).collect())
}

/// Substitutes every `{{ … }}` expression in `value` with its rendered
/// result, looking up referenced keys in `resolved`. Every referenced key
/// must already be present in `resolved` — callers are expected to resolve
/// in topological order.
pub fn render(value: &str, resolved: &std::collections::HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::User(format!("Unterminated template expression in \"{value}\"")))?;

        let inner = &after[..end];
        let expr = parse_expr(inner)?;

        let mut v = resolved
            .get(&expr.key)
            .ok_or_else(|| Error::User(format!("Template references unknown key \".{}\"", expr.key)))?
            .clone();

        for (func, args) in &expr.pipeline {
            v = apply_pipeline_func(func, args, &v)?;
        }

        out.push_str(&v);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn find_exprs(value: &str) -> Result<Vec<Expr>> {
    let mut exprs = Vec::new();
    let mut rest = value;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::User(format!("Unterminated template expression in \"{value}\"")))?;

        exprs.push(parse_expr(&after[..end])?);
        rest = &after[end + 2..];
    }

    Ok(exprs)
}

/// Parses `.Key|func "arg" "arg"|func2 arg` (surrounding whitespace
/// tolerated).
fn parse_expr(inner: &str) -> Result<Expr> {
    let segments = split_unquoted(inner.trim(), '|');
    let mut segments = segments.into_iter();

    let key_segment = segments
        .next()
        .ok_or_else(|| Error::User("Empty template expression".to_string()))?;
    let key_segment = key_segment.trim();
    let key = key_segment
        .strip_prefix('.')
        .ok_or_else(|| Error::User(format!("Template expression must start with \".Key\", got \"{key_segment}\"")))?
        .to_string();

    let mut pipeline = Vec::new();
    for segment in segments {
        let tokens = tokenize(segment.trim());
        let mut tokens = tokens.into_iter();
        let func = tokens
            .next()
            .ok_or_else(|| Error::User("Empty pipeline function".to_string()))?;
        let args: Vec<String> = tokens.collect();

        pipeline.push((func, args));
    }

    Ok(Expr { key, pipeline })
}

/// Splits `s` on `sep` outside of double-quoted spans.
fn split_unquoted(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c == sep && !in_quotes => {
                parts.push(current);
                current = String::new();
            }
            c => current.push(c),
        }
    }
    parts.push(current);

    parts
}

/// Tokenizes a pipeline step's argument list: whitespace-separated,
/// double-quoted tokens have their quotes stripped.
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '"' {
            chars.next();
            let mut tok = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                tok.push(c);
            }
            tokens.push(tok);
        } else {
            let mut tok = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                tok.push(c);
                chars.next();
            }
            tokens.push(tok);
        }
    }

    tokens
}

fn apply_pipeline_func(func: &str, args: &[String], input: &str) -> Result<String> {
    match func {
        "clean" => Ok(clean_path(input)),
        "replace" => match args {
            [from, to] => Ok(input.replace(from.as_str(), to.as_str())),
            _ => Err(Error::User(format!("\"replace\" takes exactly 2 arguments, got {}", args.len()))),
        },
        "trimSuffix" => match args {
            [suffix] => Ok(input.strip_suffix(suffix.as_str()).unwrap_or(input).to_string()),
            _ => Err(Error::User(format!("\"trimSuffix\" takes exactly 1 argument, got {}", args.len()))),
        },
        "lower" => Ok(input.to_lowercase()),
        "upper" => Ok(input.to_uppercase()),
        other => Err(Error::User(format!("Unknown template pipeline function \"{other}\""))),
    }
}

/// A minimal subset of Go's `path.Clean`: collapses repeated slashes,
/// drops `.` segments, and resolves `..` against a preceding real segment.
fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(stack.last(), Some(&last) if last != "..") {
                    stack.pop();
                } else if !rooted {
                    stack.push("..");
                }
            }
            seg => stack.push(seg),
        }
    }

    let joined = stack.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    #[test]
    fn camel_case_conversion() {
        assert_eq!(camel_case("path"), "Path");
        assert_eq!(camel_case("state-file"), "StateFile");
        assert_eq!(camel_case("escaped-path"), "EscapedPath");
        assert_eq!(camel_case("key-file"), "KeyFile");
    }

    #[test]
    fn s8_escape_path_pipeline() {
        let mut resolved = HashMap::new();
        resolved.insert("Path".to_string(), "/etc".to_string());

        let rendered = render(r#"{{.Path|clean|replace "/" "-"|trimSuffix "-"}}"#, &resolved).unwrap();
        assert_eq!(rendered, "-etc");
    }

    #[test]
    fn s8_state_file_embedding() {
        let mut resolved = HashMap::new();
        resolved.insert("EscapedPath".to_string(), "-etc".to_string());

        let rendered = render("/var/lib/uback/state/{{.EscapedPath}}.json", &resolved).unwrap();
        assert_eq!(rendered, "/var/lib/uback/state/-etc.json");
    }

    #[test]
    fn referenced_keys_extracts_dependency() {
        let refs = referenced_keys("/var/lib/uback/state/{{.EscapedPath}}.json").unwrap();
        assert_eq!(refs, vec!["EscapedPath".to_string()]);
    }

    #[test]
    fn literal_value_has_no_references() {
        assert!(referenced_keys("/etc/uback/backup.pub").unwrap().is_empty());
    }

    #[test]
    fn clean_path_collapses_slashes() {
        assert_eq!(clean_path("/etc"), "/etc");
        assert_eq!(clean_path("/etc//foo/./bar"), "/etc/foo/bar");
        assert_eq!(clean_path("/etc/../foo"), "/foo");
    }
}
