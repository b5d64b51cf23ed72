//! OS process queries behind a trait so lifecycle logic can be tested
//! without real processes.

use std::io;

/// Liveness checks and forced termination by PID.
pub trait ProcessRegistry: Send + Sync {
    /// Whether a process with `pid` currently exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Kill `pid` without giving it a chance to clean up.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Registry backed by the host OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRegistry;

#[cfg(unix)]
impl ProcessRegistry for SystemRegistry {
    fn is_alive(&self, pid: u32) -> bool {
        let Some(pid) = to_pid(pid) else {
            return false;
        };
        // Signal 0 only checks existence and permission.
        // SAFETY: kill has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid = to_pid(pid)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid PID"))?;
        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Positive `pid_t`; 0 and negatives would address process groups.
#[cfg(unix)]
fn to_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

#[cfg(windows)]
impl ProcessRegistry for SystemRegistry {
    fn is_alive(&self, pid: u32) -> bool {
        let output = std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
            .output();
        let pid = pid.to_string();
        match output {
            // CSV rows: "image","pid",...; no match prints an INFO line instead.
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .any(|line| line.split(',').nth(1).map(|f| f.trim_matches('"')) == Some(pid.as_str())),
            _ => false,
        }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let status = std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("taskkill exited with {status}")))
        }
    }
}
