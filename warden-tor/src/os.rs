//! PID-level process helpers
//!
//! Used only for daemons we did not spawn ourselves (adopted instances),
//! whose PID was reported by their own control port.

#[cfg(unix)]
mod imp {
    /// Ask the process to exit (SIGTERM)
    pub fn terminate(pid: u32) -> bool {
        send(pid, libc::SIGTERM)
    }

    /// Kill the process outright (SIGKILL)
    pub fn force_kill(pid: u32) -> bool {
        send(pid, libc::SIGKILL)
    }

    /// Signal 0 probes for existence without delivering anything
    pub fn is_alive(pid: u32) -> bool {
        send(pid, 0)
    }

    fn send(pid: u32, signal: libc::c_int) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: kill(2) has no memory-safety preconditions
        unsafe { libc::kill(pid, signal) == 0 }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::process::Command;

    pub fn terminate(pid: u32) -> bool {
        taskkill(pid, false)
    }

    pub fn force_kill(pid: u32) -> bool {
        taskkill(pid, true)
    }

    pub fn is_alive(pid: u32) -> bool {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    fn taskkill(pid: u32, force: bool) -> bool {
        let pid = pid.to_string();
        let mut args = vec!["/PID", pid.as_str()];
        if force {
            args.push("/F");
        }
        Command::new("taskkill")
            .args(&args)
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

pub use imp::{force_kill, is_alive, terminate};

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pid_is_not_alive() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }
}
