// SPDX-License-Identifier: MIT

//! Unix backend, for engines that start targets stopped (`SIGSTOP`) and
//! continue them once the broker is done.

use nix::{
    sys::{
        signal::{Signal, kill},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};

use crate::broker::environment::{CurrentJob, HostProbe};
use crate::broker::launch::TargetProcess;
use crate::policy::host::{Arch, HostFacts};
use crate::policy::target::HandleValue;

/// A stopped child process.
#[derive(Debug)]
pub struct UnixTargetProcess {
    pid: Pid,
    terminated: bool,
    reaped: bool,
}

impl UnixTargetProcess {
    pub fn new(pid: u32) -> Self {
        Self { pid: Pid::from_raw(pid as i32), terminated: false, reaped: false }
    }
}

impl TargetProcess for UnixTargetProcess {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn handle(&self) -> HandleValue {
        HandleValue(self.pid.as_raw() as usize)
    }

    fn terminate(&mut self, _exit_code: u32) -> std::io::Result<()> {
        if self.terminated {
            return Ok(());
        }
        // a stopped child still dies on SIGKILL.
        kill(self.pid, Signal::SIGKILL).map_err(|e| {
            std::io::Error::other(format!("failed terminating child {}: {:?}", self.pid, e))
        })?;
        self.terminated = true;

        match waitpid(self.pid, None) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                self.reaped = true;
                Ok(())
            }
            Ok(status) => Err(std::io::Error::other(format!(
                "unexpected wait status after killing child: {:?}",
                status
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn resume(&mut self) -> std::io::Result<()> {
        kill(self.pid, Signal::SIGCONT).map_err(std::io::Error::from)
    }

    fn close_thread(&mut self) {}

    fn close_process(&mut self) {
        if self.reaped {
            return;
        }
        // Reap it if it already went away; otherwise the caller owns it.
        if let Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) = waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            self.reaped = true;
        }
    }
}

/// stdout and stderr file descriptors.
pub fn std_handles() -> (Option<HandleValue>, Option<HandleValue>) {
    (Some(HandleValue(1)), Some(HandleValue(2)))
}

/// Host facts for a non-Windows host.  There are no job objects here, and
/// no terminal-services session to be remote in.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn host_facts(&self) -> HostFacts {
        HostFacts {
            os: None,
            arch: Arch::current(),
            running_from_network_drive: false,
            remote_session: false,
        }
    }

    fn current_job(&self) -> CurrentJob {
        CurrentJob::NotInJob
    }
}
