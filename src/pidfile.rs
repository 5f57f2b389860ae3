//! PID file management.
//!
//! A single file, mode 0600, holding the daemon's decimal pid. Writing
//! detects a still-running previous instance (the file exists, parses,
//! and that pid responds to signal 0) and refuses to proceed, reporting
//! the other pid. Skipped entirely in debug/foreground mode.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::InetdError;

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Create and lock the pid file at `path`. Fails if another live
    /// process already holds it.
    pub fn create(path: &Path) -> Result<Self, InetdError> {
        if let Some(other) = read_live_pid(path) {
            return Err(InetdError::Fatal {
                reason: format!("already running as pid {other} ({})", path.display()),
            });
        }

        let mut file = fs::File::create(path).map_err(|e| InetdError::Fatal {
            reason: format!("cannot create pidfile {}: {e}", path.display()),
        })?;
        file.set_permissions(fs::Permissions::from_mode(0o600)).map_err(|e| InetdError::Fatal {
            reason: format!("cannot chmod pidfile {}: {e}", path.display()),
        })?;
        writeln!(file, "{}", std::process::id()).map_err(|e| InetdError::Fatal {
            reason: format!("cannot write pidfile {}: {e}", path.display()),
        })?;
        Ok(PidFile { path: path.to_path_buf() })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_live_pid(path: &Path) -> Option<i32> {
    let text = fs::read_to_string(path).ok()?;
    let pid: i32 = text.trim().parse().ok()?;
    if pid == std::process::id() as i32 {
        return None;
    }
    kill(Pid::from_raw(pid), None).ok().map(|_| pid)
}
