//! The exported slice of a deployment and app renames.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use refdeploy_domain::KeyFile;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::fs::write_file_atomic;

pub const RENAMED_FROM_KEY: &str = "X-Flatpak-RenamedFrom";
const DESKTOP_GROUP: &str = "Desktop Entry";

/// Directories below `files/share` whose app-prefixed entries are exported.
const EXPORTED_DIRS: &[&str] = &["applications", "icons", "dbus-1/services", "metainfo"];

fn is_exported_name(file_name: &str, app_id: &str) -> bool {
    file_name
        .strip_prefix(app_id)
        .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-'))
}

/// Copy `files/share/...` entries named after `app_id` into `export/share/...`.
/// Returns how many files were exported.
pub fn populate_export(deploy_dir: &Path, app_id: &str) -> Result<usize> {
    let share = deploy_dir.join("files/share");
    let export_share = deploy_dir.join("export/share");
    let mut exported = 0;
    for dir in EXPORTED_DIRS {
        let source = share.join(dir);
        if !source.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&source) {
            let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !is_exported_name(name, app_id) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&share)
                .with_context(|| format!("{} escapes {}", entry.path().display(), share.display()))?;
            let target = export_share.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to export {}", entry.path().display()))?;
            exported += 1;
        }
    }
    fs::create_dir_all(deploy_dir.join("export"))
        .with_context(|| format!("failed to create export dir in {}", deploy_dir.display()))?;
    Ok(exported)
}

fn desktop_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "desktop"))
        .collect();
    files.sort();
    files
}

/// Record `previous_ids` in every exported desktop file's renamed-from list.
pub fn add_renamed_from(export_dir: &Path, previous_ids: &[String]) -> Result<usize> {
    if previous_ids.is_empty() {
        return Ok(0);
    }
    let mut updated = 0;
    for path in desktop_files(&export_dir.join("share/applications")) {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut keyfile = KeyFile::parse(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let mut renamed = keyfile
            .get_string_list(DESKTOP_GROUP, RENAMED_FROM_KEY)
            .unwrap_or_default();
        for id in previous_ids {
            let entry = format!("{id}.desktop");
            if !renamed.contains(&entry) {
                renamed.push(entry);
            }
        }
        keyfile.set_string_list(DESKTOP_GROUP, RENAMED_FROM_KEY, &renamed);
        write_file_atomic(&path, keyfile.to_data().as_bytes())?;
        updated += 1;
    }
    Ok(updated)
}

/// The id among `previous_ids` that prefixes `name`, longest first.
fn matching_previous_id<'a>(name: &str, previous_ids: &'a [String]) -> Option<&'a str> {
    let mut ids: Vec<&str> = previous_ids.iter().map(String::as_str).collect();
    ids.sort_by_key(|id| std::cmp::Reverse(id.len()));
    ids.into_iter().find(|id| is_exported_name(name, id))
}

/// Rename launchers already installed under `applications_dir` for one of
/// `previous_ids` so they point at `app_id`.
pub fn rename_launchers(applications_dir: &Path, app_id: &str, previous_ids: &[String]) -> Result<usize> {
    let mut renamed = 0;
    for path in desktop_files(applications_dir) {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(old_id) = matching_previous_id(name, previous_ids) else {
            continue;
        };
        let new_name = format!("{app_id}{}", &name[old_id.len()..]);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let patched = text.replace(old_id, app_id);
        let target = applications_dir.join(&new_name);
        write_file_atomic(&target, patched.as_bytes())?;
        if target != path {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        debug!(from = %name, to = %new_name, "renamed launcher");
        renamed += 1;
    }
    if renamed > 0 {
        info!(app = app_id, renamed, "migrated launchers from previous app ids");
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_app_files_and_marks_renames() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let deploy = tmp.path();
        let apps = deploy.join("files/share/applications");
        fs::create_dir_all(&apps)?;
        fs::write(
            apps.join("org.test.App.desktop"),
            "[Desktop Entry]\nName=Test\nExec=org.test.App\nX-Flatpak-RenamedFrom=org.old.App.desktop;\n",
        )?;
        fs::write(apps.join("unrelated.desktop"), "[Desktop Entry]\nName=Other\n")?;

        assert_eq!(populate_export(deploy, "org.test.App")?, 1);
        assert!(!deploy.join("export/share/applications/unrelated.desktop").exists());

        let ids = vec!["org.old.App".to_string(), "org.older.App".to_string()];
        assert_eq!(add_renamed_from(&deploy.join("export"), &ids)?, 1);
        let exported = KeyFile::parse(&fs::read_to_string(
            deploy.join("export/share/applications/org.test.App.desktop"),
        )?)?;
        assert_eq!(
            exported.get_string_list(DESKTOP_GROUP, RENAMED_FROM_KEY),
            Some(vec![
                "org.old.App.desktop".to_string(),
                "org.older.App.desktop".to_string()
            ])
        );
        Ok(())
    }

    #[test]
    fn launchers_use_the_longest_matching_previous_id() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path();
        fs::write(dir.join("org.old.App.Viewer.desktop"), "Exec=run org.old.App.Viewer\n")?;
        fs::write(dir.join("org.unrelated.desktop"), "Exec=run\n")?;

        let ids = vec!["org.old".to_string(), "org.old.App".to_string()];
        assert_eq!(rename_launchers(dir, "org.new.App", &ids)?, 1);
        assert_eq!(
            fs::read_to_string(dir.join("org.new.App.Viewer.desktop"))?,
            "Exec=run org.new.App.Viewer\n"
        );
        assert!(dir.join("org.unrelated.desktop").exists());
        assert!(!dir.join("org.old.App.Viewer.desktop").exists());
        Ok(())
    }
}
