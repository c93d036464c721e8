//! Single-instance guard for the monitor command.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PidFileError {
    #[error("another monitor session is running (pid {0})")]
    AlreadyRunning(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Claims a pidfile for the lifetime of the session; removed on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim the pidfile. A file naming a live foreign process is an
    /// error; a stale file from a dead process is reclaimed.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();

        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                if pid != std::process::id() && process_alive(pid) {
                    return Err(PidFileError::AlreadyRunning(pid));
                }
                tracing::debug!(pid, "reclaiming stale pidfile");
            }
        }

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Without a liveness probe, treat every recorded pid as alive.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facewatch.pid");

        let _guard = PidFile::acquire(&path).unwrap();
        let recorded: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facewatch.pid");

        {
            let _guard = PidFile::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_live_foreign_pid_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facewatch.pid");
        // pid 1 is always alive.
        std::fs::write(&path, "1").unwrap();

        assert!(matches!(
            PidFile::acquire(&path),
            Err(PidFileError::AlreadyRunning(1))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stale_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facewatch.pid");
        // Beyond the kernel's default pid_max; never a live process.
        std::fs::write(&path, "4294967").unwrap();

        let _guard = PidFile::acquire(&path).unwrap();
        let recorded: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id());
    }

    #[test]
    fn test_garbage_content_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facewatch.pid");
        std::fs::write(&path, "not a pid").unwrap();

        assert!(PidFile::acquire(&path).is_ok());
    }
}
