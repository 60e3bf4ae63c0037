use sysinfo::{Pid, ProcessesToUpdate, System};

/// Tells the worker whether its controlling process still exists.
pub trait ControllerWatch {
    fn is_alive(&mut self) -> bool;
}

/// Polls an OS process id. Used when the controller runs as a separate
/// process (the usual GUI-plus-worker topology).
pub struct PidWatch {
    pid: Pid,
    system: System,
}

impl PidWatch {
    pub fn new(pid: u32) -> Self {
        Self {
            pid: Pid::from_u32(pid),
            system: System::new(),
        }
    }
}

impl ControllerWatch for PidWatch {
    fn is_alive(&mut self) -> bool {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.system.process(self.pid).is_some()
    }
}

/// For a controller living in the same process as the worker; channel
/// disconnection is the only death signal that matters then.
pub struct AlwaysAlive;

impl ControllerWatch for AlwaysAlive {
    fn is_alive(&mut self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_watch_sees_current_process() {
        let mut watch = PidWatch::new(std::process::id());
        assert!(watch.is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn test_pid_watch_sees_exited_process() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let mut watch = PidWatch::new(pid);
        assert!(!watch.is_alive());
    }
}
