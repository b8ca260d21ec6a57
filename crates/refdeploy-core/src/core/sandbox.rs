//! Confined execution of app-provided scripts.
//!
//! Callers go through [`run_confined`], which locks the writable directory
//! down before the runner spawns anything and canonicalizes its permissions
//! once the process has exited.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{anyhow, Context, Result};
use tracing::debug;
use walkdir::WalkDir;

const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bind {
    pub source: PathBuf,
    pub dest: String,
    pub writable: bool,
}

impl Bind {
    pub fn read_only(source: impl Into<PathBuf>, dest: &str) -> Self {
        Self {
            source: source.into(),
            dest: dest.to_string(),
            writable: false,
        }
    }

    pub fn writable(source: impl Into<PathBuf>, dest: &str) -> Self {
        Self {
            source: source.into(),
            dest: dest.to_string(),
            writable: true,
        }
    }
}

/// Everything a runner needs to start one confined process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SandboxManifest {
    pub argv: Vec<String>,
    pub binds: Vec<Bind>,
    pub cwd: String,
    pub envs: Vec<(String, String)>,
    pub share_network: bool,
    /// Keep the caller's capabilities instead of dropping them all.
    pub keep_caps: bool,
}

impl SandboxManifest {
    pub fn writable_binds(&self) -> impl Iterator<Item = &Bind> {
        self.binds.iter().filter(|bind| bind.writable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub trait SandboxRunner: Send + Sync {
    /// Spawn the manifest's process and wait for it. Writable binds have
    /// already been locked down.
    fn run(&self, manifest: &SandboxManifest) -> Result<RunOutput>;
}

/// Lock writable binds down, run, then canonicalize them.
pub fn run_confined(runner: &dyn SandboxRunner, manifest: &SandboxManifest) -> Result<RunOutput> {
    for bind in manifest.writable_binds() {
        lock_down(&bind.source)?;
    }
    let output = runner.run(manifest);
    for bind in manifest.writable_binds() {
        canonicalize_permissions(&bind.source)?;
    }
    output
}

/// Strip group/other write and setuid bits from everything below `root`.
#[cfg(unix)]
pub fn lock_down(root: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        let mode = meta.permissions().mode() & 0o7777;
        let locked = mode & !0o6022;
        if locked != mode {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(locked))
                .with_context(|| format!("failed to chmod {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn lock_down(_root: &Path) -> Result<()> {
    Ok(())
}

/// Reset modes below `root` to 0755 for directories and executables and
/// 0644 for everything else. Anything that is not a file, directory or
/// symlink is removed.
#[cfg(unix)]
pub fn canonicalize_permissions(root: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if !root.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let file_type = entry.file_type();
        let path = entry.path();
        if file_type.is_symlink() {
            continue;
        }
        if !file_type.is_dir() && !file_type.is_file() {
            debug!(path = %path.display(), "removing special file");
            fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let mode = meta.permissions().mode();
        let canonical = if file_type.is_dir() || mode & 0o111 != 0 {
            0o755
        } else {
            0o644
        };
        if mode & 0o7777 != canonical {
            fs::set_permissions(path, fs::Permissions::from_mode(canonical))
                .with_context(|| format!("failed to chmod {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn canonicalize_permissions(_root: &Path) -> Result<()> {
    Ok(())
}

/// Runs manifests under `bwrap`.
#[derive(Clone, Debug)]
pub struct BwrapRunner {
    program: PathBuf,
}

impl Default for BwrapRunner {
    fn default() -> Self {
        Self::new("bwrap")
    }
}

impl BwrapRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(manifest: &SandboxManifest) -> Vec<String> {
        let mut args: Vec<String> = [
            "--unshare-pid",
            "--unshare-ipc",
            "--unshare-uts",
            "--die-with-parent",
            "--new-session",
            "--proc",
            "/proc",
            "--dev",
            "/dev",
            "--tmpfs",
            "/tmp",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        if !manifest.share_network {
            args.push("--unshare-net".into());
        }
        if !manifest.keep_caps {
            args.extend(["--cap-drop".into(), "ALL".into()]);
        }
        args.push("--clearenv".into());
        for bind in &manifest.binds {
            let flag = if bind.writable { "--bind" } else { "--ro-bind" };
            args.push(flag.into());
            args.push(bind.source.display().to_string());
            args.push(bind.dest.clone());
        }
        for (key, value) in &manifest.envs {
            args.extend(["--setenv".into(), key.clone(), value.clone()]);
        }
        if !manifest.cwd.is_empty() {
            args.extend(["--chdir".into(), manifest.cwd.clone()]);
        }
        args.push("--".into());
        args.extend(manifest.argv.iter().cloned());
        args
    }
}

impl SandboxRunner for BwrapRunner {
    fn run(&self, manifest: &SandboxManifest) -> Result<RunOutput> {
        if manifest.argv.is_empty() {
            return Err(anyhow!("sandbox manifest has no command"));
        }
        let program = self.program.display().to_string();
        let mut child = Command::new(&self.program)
            .args(Self::args(manifest))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {program}"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout missing for {program}"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr missing for {program}"))?;
        let stdout_handle = thread::spawn(move || read_limited(stdout));
        let stderr_handle = thread::spawn(move || read_limited(stderr));
        let status = child
            .wait()
            .with_context(|| format!("failed to wait for {program}"))?;
        let stdout = stdout_handle
            .join()
            .map_err(|_| anyhow!("stdout thread panicked"))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| anyhow!("stderr thread panicked"))??;
        Ok(RunOutput {
            code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

fn read_limited(reader: impl Read) -> Result<String> {
    let mut buf = Vec::new();
    reader
        .take(MAX_CAPTURE_BYTES as u64)
        .read_to_end(&mut buf)
        .context("failed to read process output")?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingRunner {
        seen_modes: Mutex<Vec<u32>>,
    }

    #[cfg(unix)]
    impl SandboxRunner for RecordingRunner {
        fn run(&self, manifest: &SandboxManifest) -> Result<RunOutput> {
            use std::os::unix::fs::PermissionsExt;
            let bind = manifest
                .writable_binds()
                .next()
                .ok_or_else(|| anyhow!("no writable bind"))?;
            let script = bind.source.join("script");
            let mode = fs::metadata(&script)?.permissions().mode() & 0o7777;
            self.seen_modes
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(mode);
            let produced = bind.source.join("produced");
            fs::write(&produced, "out")?;
            fs::set_permissions(&produced, fs::Permissions::from_mode(0o600))?;
            Ok(RunOutput {
                code: 3,
                stdout: String::new(),
                stderr: "failed".into(),
            })
        }
    }

    #[cfg(unix)]
    #[test]
    fn confined_runs_are_locked_down_then_canonicalized() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir()?;
        let extra = tmp.path().join("extra");
        fs::create_dir(&extra)?;
        fs::write(extra.join("script"), "#!/bin/sh\n")?;
        fs::set_permissions(extra.join("script"), fs::Permissions::from_mode(0o4777))?;

        let runner = RecordingRunner {
            seen_modes: Mutex::new(Vec::new()),
        };
        let manifest = SandboxManifest {
            argv: vec!["/app/bin/apply_extra".into()],
            binds: vec![Bind::writable(&extra, "/app/extra")],
            ..SandboxManifest::default()
        };
        let output = run_confined(&runner, &manifest)?;
        assert!(!output.success());
        assert_eq!(*runner.seen_modes.lock().unwrap(), vec![0o755]);
        let produced = fs::metadata(extra.join("produced"))?.permissions().mode() & 0o7777;
        assert_eq!(produced, 0o644);
        Ok(())
    }

    #[test]
    fn bwrap_arguments_follow_the_manifest() {
        let manifest = SandboxManifest {
            argv: vec!["/app/bin/apply_extra".into()],
            binds: vec![
                Bind::read_only("/deploy/files", "/app"),
                Bind::writable("/deploy/files/extra", "/app/extra"),
            ],
            cwd: "/app/extra".into(),
            envs: vec![("PATH".into(), "/app/bin:/usr/bin".into())],
            ..SandboxManifest::default()
        };
        let args = BwrapRunner::args(&manifest);
        let joined = args.join(" ");
        assert!(joined.contains("--unshare-net"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--ro-bind /deploy/files /app"));
        assert!(joined.contains("--bind /deploy/files/extra /app/extra"));
        assert!(joined.contains("--setenv PATH /app/bin:/usr/bin"));
        assert!(joined.ends_with("--chdir /app/extra -- /app/bin/apply_extra"));

        let networked = SandboxManifest {
            share_network: true,
            keep_caps: true,
            ..manifest
        };
        let args = BwrapRunner::args(&networked);
        assert!(!args.iter().any(|arg| arg == "--unshare-net" || arg == "--cap-drop"));
    }
}
