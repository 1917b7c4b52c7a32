//! PID file handling.
//!
//! The file is created with `create_new` so two daemons cannot both claim
//! it. A file left behind by a process that no longer exists is replaced.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// A PID file owned by this process.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current PID to `path`.
    ///
    /// Fails when another live process holds the file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        create_parent(&path)?;

        let mut file = match open_new(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match read_pid(&path) {
                    Some(pid) if process_alive(pid) => {
                        anyhow::bail!(
                            "PID file {} is held by running process {pid}; is another binwatch-daemon running?",
                            path.display()
                        );
                    }
                    stale => {
                        warn!(path = %path.display(), stale_pid = ?stale, "replacing stale PID file");
                        fs::remove_file(&path)
                            .with_context(|| format!("removing stale PID file {}", path.display()))?;
                        open_new(&path)
                            .with_context(|| format!("creating PID file {}", path.display()))?
                    }
                }
            }
            Err(e) => {
                return Err(e).with_context(|| format!("creating PID file {}", path.display()));
            }
        };

        if !file.metadata()?.is_file() {
            let _ = fs::remove_file(&path);
            anyhow::bail!("PID file {} is not a regular file", path.display());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o644))?;
        }

        let pid = std::process::id();
        writeln!(file, "{pid}")?;
        info!(pid, path = %path.display(), "PID file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Failures are logged, not returned.
    pub fn remove(self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "PID file removed"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove PID file"),
        }
    }
}

/// PID recorded in `path`, if the file exists and parses.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process with `pid` exists.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Whether a process with `pid` exists. Assumed true where it cannot be
/// checked.
#[cfg(not(target_os = "linux"))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

fn open_new(path: &Path) -> std::io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

fn create_parent(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .mode(0o755)
            .recursive(true)
            .create(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    #[cfg(not(unix))]
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_own_pid_and_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("binwatch.pid");

        let pid_file = PidFile::create(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        assert_eq!(pid_file.path(), path);

        pid_file.remove();
        assert!(!path.exists());
    }

    #[test]
    fn refuses_file_held_by_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binwatch.pid");
        let _held = PidFile::create(&path).unwrap();

        let err = PidFile::create(&path).unwrap_err();
        assert!(err.to_string().contains("another binwatch-daemon"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binwatch.pid");
        // Above the kernel's pid_max ceiling, so never a live process.
        fs::write(&path, "4194305\n").unwrap();

        let pid_file = PidFile::create(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        pid_file.remove();
    }

    #[test]
    fn garbage_is_treated_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binwatch.pid");
        fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pid(&path), None);
        PidFile::create(&path).unwrap().remove();
    }
}
