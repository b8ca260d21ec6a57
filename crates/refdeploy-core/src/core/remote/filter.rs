//! Ref globs and per-remote allow/deny filters.
//!
//! A filter file has one rule per line, `allow <glob>` or `deny <glob>`, with
//! `#` comments. Globs name refs (`app/org.test.*/x86_64/stable`); trailing
//! components may be left out and `*` never crosses a `/`. A glob without a
//! kind prefix matches both apps and runtimes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use tracing::{debug, warn};

/// A compiled set of ref globs.
#[derive(Clone, Debug, Default)]
pub struct RefGlobs {
    regex: Option<Regex>,
}

impl RefGlobs {
    pub fn compile<S: AsRef<str>>(globs: &[S]) -> Result<Self> {
        if globs.is_empty() {
            return Ok(Self::default());
        }
        let alternatives = globs
            .iter()
            .map(|glob| glob_to_regex(glob.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let regex = Regex::new(&format!("^(?:{})$", alternatives.join("|")))
            .context("failed to compile ref globs")?;
        Ok(Self { regex: Some(regex) })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regex.is_none()
    }

    #[must_use]
    pub fn matches(&self, reference: &str) -> bool {
        self.regex
            .as_ref()
            .is_some_and(|regex| regex.is_match(reference))
    }
}

fn glob_to_regex(glob: &str) -> Result<String> {
    let glob = glob.trim();
    if glob.is_empty() {
        bail!("empty ref glob");
    }
    let mut parts: Vec<&str> = glob.split('/').collect();
    if !matches!(parts[0], "app" | "runtime" | "*") {
        parts.insert(0, "*");
    }
    if parts.len() > 4 {
        bail!("ref glob '{glob}' has too many components");
    }
    if parts[0] == "*" {
        parts[0] = "(?:app|runtime)";
    }
    let mut out = Vec::with_capacity(4);
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            bail!("ref glob '{glob}' has an empty component");
        }
        if index == 0 {
            out.push((*part).to_string());
            continue;
        }
        let escaped = part
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("[^/]*");
        out.push(escaped);
    }
    while out.len() < 4 {
        out.push("[^/]+".to_string());
    }
    Ok(out.join("/"))
}

/// Allow/deny rules loaded from a remote's `xa.filter` file.
#[derive(Clone, Debug, Default)]
pub struct RefFilter {
    allow: RefGlobs,
    deny: RefGlobs,
}

impl RefFilter {
    pub fn parse(text: &str) -> Result<Self> {
        let mut allow = Vec::new();
        let mut deny = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let (rule, glob) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("filter line {}: expected 'allow' or 'deny' and a glob", index + 1))?;
            let glob = glob.trim();
            match rule {
                "allow" => allow.push(glob.to_string()),
                "deny" => deny.push(glob.to_string()),
                other => bail!("filter line {}: unknown rule '{other}'", index + 1),
            }
        }
        Ok(Self {
            allow: RefGlobs::compile(&allow)?,
            deny: RefGlobs::compile(&deny)?,
        })
    }

    /// Denied refs are hidden unless an allow rule matches them too.
    #[must_use]
    pub fn allow_ref(&self, reference: &str) -> bool {
        if !self.deny.matches(reference) {
            return true;
        }
        self.allow.matches(reference)
    }
}

#[derive(Debug)]
struct CachedFilter {
    modified: Option<SystemTime>,
    filter: Arc<RefFilter>,
}

/// Parsed filter files, reloaded when the file's mtime changes.
#[derive(Debug, Default)]
pub struct FilterCache {
    entries: Mutex<HashMap<PathBuf, Arc<CachedFilter>>>,
}

impl FilterCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the filter at `path`, keeping a copy at `backup` so the remote
    /// stays filtered if the original disappears.
    pub fn load(&self, path: &Path, backup: &Path) -> Result<Arc<RefFilter>> {
        let (source, modified) = match fs::metadata(path) {
            Ok(meta) => (path, meta.modified().ok()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && backup.exists() => {
                debug!(path = %path.display(), "filter missing, using backup copy");
                (backup, fs::metadata(backup).ok().and_then(|m| m.modified().ok()))
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read filter {}", path.display()))
            }
        };

        let key = source.to_path_buf();
        if let Some(cached) = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            if cached.modified.is_some() && cached.modified == modified {
                return Ok(Arc::clone(&cached.filter));
            }
        }

        let text = fs::read_to_string(source)
            .with_context(|| format!("failed to read filter {}", source.display()))?;
        let filter = Arc::new(
            RefFilter::parse(&text)
                .with_context(|| format!("invalid filter {}", source.display()))?,
        );
        if source == path {
            if let Err(err) = crate::core::fs::write_file_atomic(backup, text.as_bytes()) {
                warn!(backup = %backup.display(), %err, "failed to save filter backup");
            }
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                Arc::new(CachedFilter {
                    modified,
                    filter: Arc::clone(&filter),
                }),
            );
        Ok(filter)
    }
}
