//! Reader/writer for the `[group]` / `key=value` configuration format used by
//! repo configs, app metadata and ref files.
//!
//! Layout is preserved on rewrite: comments, blank lines, group order and key
//! order survive a load/modify/save cycle.

use std::fmt::Write as _;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum KeyFileError {
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: &'static str },
    #[error("group '{0}' not found")]
    GroupNotFound(String),
    #[error("key '{key}' not found in group '{group}'")]
    KeyNotFound { group: String, key: String },
    #[error("value of '{key}' in group '{group}' is not a valid {expected}")]
    InvalidValue {
        group: String,
        key: String,
        expected: &'static str,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Line {
    Comment(String),
    Entry { key: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Group {
    name: String,
    lines: Vec<Line>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyFile {
    header: Vec<String>,
    groups: Vec<Group>,
}

impl KeyFile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, KeyFileError> {
        let mut file = Self::default();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim_start();
            if line.is_empty() || line.starts_with('#') {
                match file.groups.last_mut() {
                    Some(group) => group.lines.push(Line::Comment(raw.to_string())),
                    None => file.header.push(raw.to_string()),
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.trim_end().strip_suffix(']').ok_or(KeyFileError::Syntax {
                    line: index + 1,
                    reason: "unterminated group header",
                })?;
                if name.is_empty() || name.contains(['[', ']']) {
                    return Err(KeyFileError::Syntax {
                        line: index + 1,
                        reason: "invalid group name",
                    });
                }
                file.groups.push(Group {
                    name: name.to_string(),
                    lines: Vec::new(),
                });
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(KeyFileError::Syntax {
                    line: index + 1,
                    reason: "expected key=value",
                });
            };
            let Some(group) = file.groups.last_mut() else {
                return Err(KeyFileError::Syntax {
                    line: index + 1,
                    reason: "key outside of any group",
                });
            };
            let key = key.trim_end();
            if key.is_empty() {
                return Err(KeyFileError::Syntax {
                    line: index + 1,
                    reason: "empty key",
                });
            }
            group.lines.push(Line::Entry {
                key: key.to_string(),
                value: value.trim_start().to_string(),
            });
        }
        Ok(file)
    }

    #[must_use]
    pub fn groups(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.name.as_str()).collect()
    }

    #[must_use]
    pub fn has_group(&self, group: &str) -> bool {
        self.group(group).is_some()
    }

    #[must_use]
    pub fn has_key(&self, group: &str, key: &str) -> bool {
        self.raw(group, key).is_some()
    }

    fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn group_mut(&mut self, name: &str) -> &mut Group {
        let position = match self.groups.iter().position(|g| g.name == name) {
            Some(position) => position,
            None => {
                self.groups.push(Group {
                    name: name.to_string(),
                    lines: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        &mut self.groups[position]
    }

    #[must_use]
    pub fn keys(&self, group: &str) -> Vec<&str> {
        self.group(group)
            .map(|g| {
                g.lines
                    .iter()
                    .filter_map(|line| match line {
                        Line::Entry { key, .. } => Some(key.as_str()),
                        Line::Comment(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn raw(&self, group: &str, key: &str) -> Option<&str> {
        self.group(group)?.lines.iter().rev().find_map(|line| match line {
            Line::Entry { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Unescaped string value.
    #[must_use]
    pub fn get_string(&self, group: &str, key: &str) -> Option<String> {
        self.raw(group, key).map(unescape)
    }

    pub fn require_string(&self, group: &str, key: &str) -> Result<String, KeyFileError> {
        if !self.has_group(group) {
            return Err(KeyFileError::GroupNotFound(group.to_string()));
        }
        self.get_string(group, key)
            .ok_or_else(|| KeyFileError::KeyNotFound {
                group: group.to_string(),
                key: key.to_string(),
            })
    }

    /// `;`-separated list; a trailing separator is optional.
    #[must_use]
    pub fn get_string_list(&self, group: &str, key: &str) -> Option<Vec<String>> {
        let raw = self.raw(group, key)?;
        let mut items = Vec::new();
        let mut current = String::new();
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        if next == ';' {
                            current.push(';');
                        } else {
                            current.push('\\');
                            current.push(next);
                        }
                    }
                }
                ';' => items.push(unescape(&std::mem::take(&mut current))),
                other => current.push(other),
            }
        }
        if !current.is_empty() {
            items.push(unescape(&current));
        }
        Some(items)
    }

    pub fn get_bool(&self, group: &str, key: &str) -> Result<Option<bool>, KeyFileError> {
        match self.raw(group, key).map(str::trim) {
            None => Ok(None),
            Some("true" | "1") => Ok(Some(true)),
            Some("false" | "0") => Ok(Some(false)),
            Some(_) => Err(KeyFileError::InvalidValue {
                group: group.to_string(),
                key: key.to_string(),
                expected: "boolean",
            }),
        }
    }

    /// Boolean with a default; malformed values read as the default.
    #[must_use]
    pub fn bool_or(&self, group: &str, key: &str, default: bool) -> bool {
        self.get_bool(group, key).ok().flatten().unwrap_or(default)
    }

    pub fn get_integer(&self, group: &str, key: &str) -> Result<Option<i64>, KeyFileError> {
        match self.raw(group, key) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| KeyFileError::InvalidValue {
                    group: group.to_string(),
                    key: key.to_string(),
                    expected: "integer",
                }),
        }
    }

    pub fn set_string(&mut self, group: &str, key: &str, value: &str) {
        self.set_raw(group, key, escape(value));
    }

    pub fn set_bool(&mut self, group: &str, key: &str, value: bool) {
        self.set_raw(group, key, value.to_string());
    }

    pub fn set_integer(&mut self, group: &str, key: &str, value: i64) {
        self.set_raw(group, key, value.to_string());
    }

    pub fn set_string_list<S: AsRef<str>>(&mut self, group: &str, key: &str, values: &[S]) {
        let mut raw = String::new();
        for value in values {
            raw.push_str(&escape(value.as_ref()).replace(';', "\\;"));
            raw.push(';');
        }
        self.set_raw(group, key, raw);
    }

    fn set_raw(&mut self, group: &str, key: &str, raw: String) {
        let group = self.group_mut(group);
        for line in group.lines.iter_mut().rev() {
            if let Line::Entry { key: k, value } = line {
                if k == key {
                    *value = raw;
                    return;
                }
            }
        }
        // New keys go before trailing blank lines so groups stay visually separated.
        let insert_at = group
            .lines
            .iter()
            .rposition(|line| !matches!(line, Line::Comment(text) if text.trim().is_empty()))
            .map_or(0, |index| index + 1);
        group.lines.insert(
            insert_at,
            Line::Entry {
                key: key.to_string(),
                value: raw,
            },
        );
    }

    /// Returns whether the key existed.
    pub fn remove_key(&mut self, group: &str, key: &str) -> bool {
        let Some(group) = self.groups.iter_mut().find(|g| g.name == group) else {
            return false;
        };
        let before = group.lines.len();
        group
            .lines
            .retain(|line| !matches!(line, Line::Entry { key: k, .. } if k == key));
        before != group.lines.len()
    }

    /// Returns whether the group existed.
    pub fn remove_group(&mut self, group: &str) -> bool {
        let before = self.groups.len();
        self.groups.retain(|g| g.name != group);
        before != self.groups.len()
    }

    #[must_use]
    pub fn to_data(&self) -> String {
        let mut out = String::new();
        for line in &self.header {
            let _ = writeln!(out, "{line}");
        }
        for (index, group) in self.groups.iter().enumerate() {
            if index > 0 && !out.is_empty() && !out.ends_with("\n\n") {
                let previous_blank = self.groups[index - 1]
                    .lines
                    .last()
                    .is_some_and(|line| matches!(line, Line::Comment(t) if t.trim().is_empty()));
                if !previous_blank {
                    out.push('\n');
                }
            }
            let _ = writeln!(out, "[{}]", group.name);
            for line in &group.lines {
                match line {
                    Line::Comment(text) => {
                        let _ = writeln!(out, "{text}");
                    }
                    Line::Entry { key, value } => {
                        let _ = writeln!(out, "{key}={value}");
                    }
                }
            }
        }
        out
    }
}

/// Build a `remote "<name>"` group name.
#[must_use]
pub fn remote_group(name: &str) -> String {
    format!("remote \"{name}\"")
}

/// Extract `<name>` from a `remote "<name>"` group name.
#[must_use]
pub fn parse_remote_group(group: &str) -> Option<&str> {
    group
        .strip_prefix("remote \"")
        .and_then(|rest| rest.strip_suffix('"'))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (index, c) in value.chars().enumerate() {
        match c {
            ' ' if index == 0 => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# installation config
[core]
repo_version=1
xa.pinned=runtime/org.test.Platform/x86_64/*;

[remote \"flathub\"]
url=https://dl.example.org/repo/
gpg-verify=true
xa.title=Example Hub
";

    #[test]
    fn reads_typed_values() {
        let kf = KeyFile::parse(SAMPLE).unwrap();
        assert_eq!(kf.groups(), vec!["core", "remote \"flathub\""]);
        assert_eq!(kf.get_integer("core", "repo_version").unwrap(), Some(1));
        assert_eq!(
            kf.get_string_list("core", "xa.pinned").unwrap(),
            vec!["runtime/org.test.Platform/x86_64/*"]
        );
        assert_eq!(kf.get_bool("remote \"flathub\"", "gpg-verify").unwrap(), Some(true));
        assert_eq!(
            parse_remote_group("remote \"flathub\""),
            Some("flathub")
        );
    }

    #[test]
    fn untouched_files_roundtrip_exactly() {
        let kf = KeyFile::parse(SAMPLE).unwrap();
        assert_eq!(kf.to_data(), SAMPLE);
    }

    #[test]
    fn edits_keep_unknown_keys_and_comments() {
        let mut kf = KeyFile::parse(SAMPLE).unwrap();
        kf.set_bool("remote \"flathub\"", "gpg-verify", false);
        kf.set_string(&remote_group("other"), "url", "file:///srv/repo");
        kf.remove_key("core", "xa.pinned");
        let text = kf.to_data();
        assert!(text.starts_with("# installation config\n"));
        assert!(text.contains("xa.title=Example Hub"));
        assert!(text.contains("gpg-verify=false"));
        assert!(text.contains("[remote \"other\"]\nurl=file:///srv/repo"));
        assert!(!text.contains("xa.pinned"));
        let reparsed = KeyFile::parse(&text).unwrap();
        assert_eq!(reparsed.to_data(), text);
    }

    #[test]
    fn escapes_survive_lists() {
        let mut kf = KeyFile::new();
        kf.set_string_list("g", "k", &["a;b", " lead", "x"]);
        assert_eq!(
            kf.get_string_list("g", "k").unwrap(),
            vec!["a;b", " lead", "x"]
        );
    }

    #[test]
    fn rejects_keys_outside_groups() {
        assert!(matches!(
            KeyFile::parse("key=value\n"),
            Err(KeyFileError::Syntax { line: 1, .. })
        ));
        assert!(KeyFile::parse("[open\n").is_err());
    }
}
