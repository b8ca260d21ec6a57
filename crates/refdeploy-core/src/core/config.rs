//! Process environment and per-installation `[core]` configuration.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use refdeploy_domain::KeyFile;

const DEFAULT_CONFIG_DIR: &str = "/etc/flatpak";
const DEFAULT_RUN_DIR: &str = "/run/flatpak";
const DEFAULT_SYSTEM_DIR: &str = "/var/lib/flatpak";
const DEFAULT_SYSTEM_CACHE_DIR: &str = "/var/tmp";
const DEFAULT_TRIGGERS_DIR: &str = "/usr/share/flatpak/triggers";
const DEFAULT_BINARY: &str = "refdeploy";
const SYSFS_MODULE_DIR: &str = "/sys/module";

pub const CORE_GROUP: &str = "core";
pub const KEY_PINNED: &str = "xa.pinned";
pub const KEY_MASKED: &str = "xa.masked";
pub const KEY_LANGUAGES: &str = "xa.languages";

/// Captured process environment. Everything that reads environment variables
/// goes through a snapshot so callers and tests can inject values.
#[derive(Clone, Debug, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    #[must_use]
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn flag_is_enabled(&self, key: &str) -> bool {
        matches!(self.var(key), Some("1" | "true" | "yes"))
    }

    fn path_or(&self, key: &str, default: impl Into<PathBuf>) -> PathBuf {
        self.var(key).map_or_else(|| default.into(), PathBuf::from)
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        Self::from_pairs(pairs.iter().copied())
    }
}

/// Locations and host facts resolved once at startup and passed to every
/// component by reference.
#[derive(Clone, Debug)]
pub struct Environment {
    pub config_dir: PathBuf,
    pub run_dir: PathBuf,
    pub system_dir: PathBuf,
    pub user_dir: PathBuf,
    pub system_cache_dir: PathBuf,
    pub user_cache_dir: PathBuf,
    pub system_helper_on_session: bool,
    pub triggers_dir: PathBuf,
    pub binary: PathBuf,
    pub revokefs_fuse: Option<PathBuf>,
    pub default_arch: String,
    pub languages: Vec<String>,
    pub gl_drivers: Vec<String>,
    pub current_desktops: Vec<String>,
    pub gtk_theme: Option<String>,
    pub sysfs_module_dir: PathBuf,
}

impl Environment {
    #[must_use]
    pub fn capture() -> Self {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    #[must_use]
    pub fn from_snapshot(snapshot: &EnvSnapshot) -> Self {
        let data_home = snapshot
            .var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(dirs_next::data_dir)
            .unwrap_or_else(|| PathBuf::from(".local/share"));
        let cache_home = snapshot
            .var("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(dirs_next::cache_dir)
            .unwrap_or_else(|| PathBuf::from(".cache"));
        let gl_drivers = snapshot.var("FLATPAK_GL_DRIVERS").map_or_else(
            || vec!["default".to_string(), "host".to_string()],
            |value| split_list(value, ':'),
        );
        Self {
            config_dir: snapshot.path_or("FLATPAK_CONFIG_DIR", DEFAULT_CONFIG_DIR),
            run_dir: snapshot.path_or("FLATPAK_RUN_DIR", DEFAULT_RUN_DIR),
            system_dir: snapshot.path_or("FLATPAK_SYSTEM_DIR", DEFAULT_SYSTEM_DIR),
            user_dir: snapshot.path_or("FLATPAK_USER_DIR", data_home.join("flatpak")),
            system_cache_dir: snapshot.path_or("FLATPAK_SYSTEM_CACHE_DIR", DEFAULT_SYSTEM_CACHE_DIR),
            user_cache_dir: cache_home.join("flatpak"),
            system_helper_on_session: snapshot.var("FLATPAK_SYSTEM_HELPER_ON_SESSION").is_some(),
            triggers_dir: snapshot.path_or("FLATPAK_TRIGGERSDIR", DEFAULT_TRIGGERS_DIR),
            binary: snapshot.path_or("FLATPAK_BINARY", DEFAULT_BINARY),
            revokefs_fuse: snapshot.var("FLATPAK_REVOKEFS_FUSE").map(PathBuf::from),
            default_arch: snapshot
                .var("FLATPAK_DEFAULT_ARCH")
                .map_or_else(host_arch, ToOwned::to_owned),
            languages: locale_languages(snapshot),
            gl_drivers,
            current_desktops: snapshot
                .var("XDG_CURRENT_DESKTOP")
                .map(|value| split_list(value, ':'))
                .unwrap_or_default(),
            gtk_theme: snapshot.var("GTK_THEME").map(ToOwned::to_owned),
            sysfs_module_dir: PathBuf::from(SYSFS_MODULE_DIR),
        }
    }

    /// Arches this host can run: the default one followed by its compat arch.
    #[must_use]
    pub fn supported_arches(&self) -> Vec<String> {
        let mut arches = vec![self.default_arch.clone()];
        if let Some(compat) = compat_arch(&self.default_arch) {
            arches.push(compat.to_string());
        }
        arches
    }

    #[must_use]
    pub fn sideload_run_dir(&self) -> PathBuf {
        self.run_dir.join("sideload-repos")
    }

    #[must_use]
    pub fn has_kernel_module(&self, module: &str) -> bool {
        self.sysfs_module_dir.join(module).exists()
    }
}

/// The 32-bit arch a 64-bit arch can also run.
#[must_use]
pub fn compat_arch(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("i386"),
        "aarch64" => Some("arm"),
        _ => None,
    }
}

/// The 64-bit arch whose listings also carry refs for `arch`.
#[must_use]
pub fn reverse_compat_arch(arch: &str) -> Option<&'static str> {
    match arch {
        "i386" => Some("x86_64"),
        "arm" => Some("aarch64"),
        _ => None,
    }
}

fn host_arch() -> String {
    match env::consts::ARCH {
        "x86" => "i386".to_string(),
        other => other.to_string(),
    }
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Languages from `LANGUAGE`, then the first of `LC_ALL`, `LC_MESSAGES`, `LANG`.
fn locale_languages(snapshot: &EnvSnapshot) -> Vec<String> {
    let mut languages = Vec::new();
    let mut push = |locale: &str| {
        if let Some(language) = language_of(locale) {
            if !languages.contains(&language) {
                languages.push(language);
            }
        }
    };
    if let Some(list) = snapshot.var("LANGUAGE") {
        for locale in list.split(':') {
            push(locale);
        }
    }
    if let Some(locale) = ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .find_map(|key| snapshot.var(key))
    {
        push(locale);
    }
    languages
}

fn language_of(locale: &str) -> Option<String> {
    let language = locale
        .split(['_', '.', '@'])
        .next()
        .unwrap_or_default();
    if language.is_empty() || language == "C" || language == "POSIX" {
        None
    } else {
        Some(language.to_string())
    }
}

/// Parsed `[core]` values of an installation's repo config.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoreConfig {
    pub pinned: Vec<String>,
    pub masked: Vec<String>,
    pub languages: Option<Vec<String>>,
}

impl CoreConfig {
    #[must_use]
    pub fn from_keyfile(keyfile: &KeyFile) -> Self {
        Self {
            pinned: keyfile
                .get_string_list(CORE_GROUP, KEY_PINNED)
                .unwrap_or_default(),
            masked: keyfile
                .get_string_list(CORE_GROUP, KEY_MASKED)
                .unwrap_or_default(),
            languages: keyfile.get_string_list(CORE_GROUP, KEY_LANGUAGES),
        }
    }

    /// Configured languages, falling back to the locale.
    #[must_use]
    pub fn languages<'a>(&'a self, environment: &'a Environment) -> &'a [String] {
        self.languages
            .as_deref()
            .unwrap_or(environment.languages.as_slice())
    }
}

/// Summary cache directory under `cache_root`.
#[must_use]
pub fn summary_cache_dir(cache_root: &Path) -> PathBuf {
    cache_root.join("summaries")
}
