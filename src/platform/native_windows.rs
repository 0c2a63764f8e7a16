// SPDX-License-Identifier: MIT

//! Windows backend.

use std::path::{Component, Prefix};

use tracing::debug;
use windows::{
    Wdk::System::SystemServices::RtlGetVersion,
    Win32::{
        Foundation::{CloseHandle, HANDLE},
        Storage::FileSystem::GetDriveTypeW,
        System::{
            JobObjects::{
                IsProcessInJob, JOB_OBJECT_LIMIT_BREAKAWAY_OK, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
                JobObjectExtendedLimitInformation, QueryInformationJobObject,
            },
            SystemInformation::OSVERSIONINFOW,
            Threading::{GetCurrentProcess, ResumeThread, TerminateProcess},
        },
        UI::WindowsAndMessaging::{GetSystemMetrics, SM_REMOTESESSION},
    },
    core::{BOOL, PCWSTR},
};
use windows_sys::Win32::System::Console;

use crate::broker::environment::{CurrentJob, HostProbe};
use crate::broker::launch::TargetProcess;
use crate::policy::host::{Arch, HostFacts, OsVersion};
use crate::policy::target::HandleValue;

const DRIVE_REMOTE: u32 = 4;

/// A target created suspended by the engine.
///
/// Owns the process and main thread handles.  Dropping it closes whatever
/// is still open but does not terminate a target that was resumed.
#[derive(Debug)]
pub struct WinTargetProcess {
    pid: u32,
    // raw values, so the wrapper can cross threads.
    process: usize,
    thread: usize,
    terminated: bool,
}

impl WinTargetProcess {
    /// Take ownership of the handles from a `PROCESS_INFORMATION`.
    ///
    /// # Safety
    /// Both handles must be valid and not owned by anything else.
    pub unsafe fn from_raw(pid: u32, process: HANDLE, thread: HANDLE) -> Self {
        Self { pid, process: process.0 as usize, thread: thread.0 as usize, terminated: false }
    }

    fn process_handle(&self) -> HANDLE {
        HANDLE(self.process as *mut std::ffi::c_void)
    }

    fn thread_handle(&self) -> HANDLE {
        HANDLE(self.thread as *mut std::ffi::c_void)
    }
}

impl TargetProcess for WinTargetProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn handle(&self) -> HandleValue {
        HandleValue(self.process)
    }

    fn terminate(&mut self, exit_code: u32) -> std::io::Result<()> {
        if self.terminated || self.process == 0 {
            return Ok(());
        }
        unsafe { TerminateProcess(self.process_handle(), exit_code) }
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e))?;
        self.terminated = true;
        Ok(())
    }

    fn resume(&mut self) -> std::io::Result<()> {
        if self.thread == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "main thread handle already closed"));
        }
        let previous = unsafe { ResumeThread(self.thread_handle()) };
        if previous == u32::MAX {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn close_thread(&mut self) {
        if self.thread != 0 {
            let _ = unsafe { CloseHandle(self.thread_handle()) };
            self.thread = 0;
        }
    }

    fn close_process(&mut self) {
        if self.process != 0 {
            let _ = unsafe { CloseHandle(self.process_handle()) };
            self.process = 0;
        }
    }
}

impl Drop for WinTargetProcess {
    fn drop(&mut self) {
        self.close_thread();
        self.close_process();
    }
}

/// The broker's stdout and stderr, for inheritance by targets.
/// Missing when the broker has no console.
pub fn std_handles() -> (Option<HandleValue>, Option<HandleValue>) {
    let get = |which| {
        let handle = unsafe { Console::GetStdHandle(which) };
        // null or INVALID_HANDLE_VALUE
        if handle.is_null() || handle as isize == -1 {
            None
        } else {
            Some(HandleValue(handle as usize))
        }
    };
    (get(Console::STD_OUTPUT_HANDLE), get(Console::STD_ERROR_HANDLE))
}

/// Reads host facts from the running system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl SystemProbe {
    fn os_version() -> Option<OsVersion> {
        let mut info = OSVERSIONINFOW {
            dwOSVersionInfoSize: std::mem::size_of::<OSVERSIONINFOW>() as u32,
            ..Default::default()
        };
        let status = unsafe { RtlGetVersion(&mut info) };
        if status.is_err() {
            debug!(status = status.0, "RtlGetVersion failed");
            return None;
        }
        Some(OsVersion::new(info.dwMajorVersion, info.dwMinorVersion, info.dwBuildNumber))
    }

    fn running_from_network_drive() -> bool {
        let Ok(exe) = std::env::current_exe() else {
            return false;
        };
        match exe.components().next() {
            Some(Component::Prefix(prefix)) => match prefix.kind() {
                Prefix::UNC(..) | Prefix::VerbatimUNC(..) => true,
                Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
                    let root: Vec<u16> = format!("{}:\\", letter as char).encode_utf16().chain([0]).collect();
                    unsafe { GetDriveTypeW(PCWSTR(root.as_ptr())) == DRIVE_REMOTE }
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl HostProbe for SystemProbe {
    fn host_facts(&self) -> HostFacts {
        HostFacts {
            os: Self::os_version(),
            arch: Arch::current(),
            running_from_network_drive: Self::running_from_network_drive(),
            remote_session: unsafe { GetSystemMetrics(SM_REMOTESESSION) } != 0,
        }
    }

    fn current_job(&self) -> CurrentJob {
        let mut in_job = BOOL(1);
        if unsafe { IsProcessInJob(GetCurrentProcess(), None, &mut in_job) }.is_err() {
            return CurrentJob::Unknown;
        }
        if !in_job.as_bool() {
            return CurrentJob::NotInJob;
        }

        let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        let queried = unsafe {
            QueryInformationJobObject(
                None,
                JobObjectExtendedLimitInformation,
                &mut info as *mut _ as *mut std::ffi::c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                None,
            )
        };
        if queried.is_err() {
            return CurrentJob::InJob { breakaway_ok: None };
        }
        let flags = info.BasicLimitInformation.LimitFlags;
        CurrentJob::InJob { breakaway_ok: Some(flags.0 & JOB_OBJECT_LIMIT_BREAKAWAY_OK.0 != 0) }
    }
}
