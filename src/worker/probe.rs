//! OS-level liveness of worker processes.

use std::path::Path;

use crate::subprocess::Tool;

/// What the OS says about a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited but not yet reaped by its parent.
    Zombie,
    NotFound,
}

impl ProcessState {
    /// Zombies count as dead: they will never produce more output.
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Look up `pid`, preferring `/proc` and falling back to `ps` where there is none.
pub fn process_state(pid: u32) -> ProcessState {
    if Path::new("/proc/self").exists() {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(contents) => parse_proc_stat(&contents),
            Err(_) => ProcessState::NotFound,
        }
    } else {
        ps_state(pid)
    }
}

/// Classify the state field of a `/proc/<pid>/stat` line.
///
/// The command name (field 2) is wrapped in parentheses and may itself
/// contain spaces or parentheses, so the state is read after the last `)`.
pub fn parse_proc_stat(contents: &str) -> ProcessState {
    let Some((_, rest)) = contents.rsplit_once(')') else {
        return ProcessState::NotFound;
    };
    match rest.split_whitespace().next() {
        Some("Z") => ProcessState::Zombie,
        Some("X" | "x") | None => ProcessState::NotFound,
        Some(_) => ProcessState::Running,
    }
}

fn ps_state(pid: u32) -> ProcessState {
    let pid = pid.to_string();
    match Tool::new("ps").args(&["-o", "stat=", "-p", &pid]).run() {
        Ok(out) if out.success() => match out.stdout.trim().chars().next() {
            Some('Z') => ProcessState::Zombie,
            Some(_) => ProcessState::Running,
            None => ProcessState::NotFound,
        },
        Ok(_) => ProcessState::NotFound,
        Err(e) => {
            tracing::debug!(pid, error = %e, "ps unavailable, assuming process is gone");
            ProcessState::NotFound
        }
    }
}

/// Send SIGTERM to a worker's process group, or to the pid alone if it
/// does not lead a group.
pub fn terminate(pid: u32) -> anyhow::Result<()> {
    let group = format!("-{pid}");
    if Tool::new("kill").args(&["-TERM", "--", &group]).run_ok().is_ok() {
        return Ok(());
    }
    let pid = pid.to_string();
    Tool::new("kill").args(&["-TERM", &pid]).run_ok()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_running_and_sleeping() {
        assert_eq!(
            parse_proc_stat("1234 (claude) S 1 1234 1234 0 -1"),
            ProcessState::Running
        );
        assert_eq!(
            parse_proc_stat("1234 (claude) R 1 1234 1234 0 -1"),
            ProcessState::Running
        );
    }

    #[test]
    fn parses_zombie_and_dead() {
        assert_eq!(parse_proc_stat("77 (node) Z 1 77"), ProcessState::Zombie);
        assert_eq!(parse_proc_stat("77 (node) X 1 77"), ProcessState::NotFound);
        assert_eq!(parse_proc_stat("garbage"), ProcessState::NotFound);
    }

    #[test]
    fn command_names_with_parens_do_not_confuse_parser() {
        assert_eq!(
            parse_proc_stat("99 (weird) Z name) Z 1 99"),
            ProcessState::Zombie
        );
        assert_eq!(
            parse_proc_stat("99 (a (b) c) S 1 99"),
            ProcessState::Running
        );
    }

    #[test]
    fn own_process_is_running() {
        assert_eq!(process_state(std::process::id()), ProcessState::Running);
    }

    #[test]
    fn reaped_child_is_not_found() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        // The pid may be recycled in principle, but not this quickly in practice.
        assert!(!process_state(pid).is_alive());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unreaped_child_is_zombie() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while process_state(pid) != ProcessState::Zombie && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(process_state(pid), ProcessState::Zombie);
        child.wait().unwrap();
    }
}
