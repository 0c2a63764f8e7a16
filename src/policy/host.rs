// SPDX-License-Identifier: MIT

//! Facts about the host the broker runs on.
//!
//! Version and architecture checks are only ever made through the named
//! capability predicates here, so each gate says what it is gating.

/// CPU architecture of the broker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
    Aarch64,
    Other,
}

impl Arch {
    pub fn current() -> Self {
        if cfg!(target_arch = "x86") {
            Arch::X86
        } else if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::Other
        }
    }
}

/// Windows-style version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self { major, minor, build }
    }

    const WIN8: OsVersion = OsVersion::new(6, 2, 0);
    const WIN10: OsVersion = OsVersion::new(10, 0, 0);
    const WIN10_1809: OsVersion = OsVersion::new(10, 0, 17763);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFacts {
    /// `None` when the version could not be read, or the host isn't Windows.
    /// The predicates then pick the strongest confinement.
    pub os: Option<OsVersion>,
    pub arch: Arch,
    /// The broker's own executable lives on a network share.
    pub running_from_network_drive: bool,
    /// The interactive session is a remote desktop session.
    pub remote_session: bool,
}

impl HostFacts {
    /// A current 64-bit Windows 10 host running from a local disk.
    pub fn modern() -> Self {
        Self {
            os: Some(OsVersion::new(10, 0, 19045)),
            arch: Arch::X86_64,
            running_from_network_drive: false,
            remote_session: false,
        }
    }

    /// Jobs can be nested without asking the current job for breakaway rights.
    pub fn supports_nested_jobs(&self) -> bool {
        self.at_least(OsVersion::WIN8)
    }

    /// The composition (win32k) subsystem can be disabled for a process.
    pub fn supports_win32k_lockdown(&self) -> bool {
        self.at_least(OsVersion::WIN8)
    }

    /// The output protection (OPM) redirection needed for a win32k lockdown
    /// that still renders on screen is available.
    pub fn supports_opm_redirection(&self) -> bool {
        self.at_least(OsVersion::WIN10)
    }

    /// Control-flow guard breaks COM activation on early ARM64 builds.
    pub fn needs_cfg_compat_exception(&self) -> bool {
        self.arch == Arch::Aarch64 && self.os.is_some_and(|os| os < OsVersion::WIN10_1809)
    }

    /// Unknown versions count as new enough, so no feature gate loosens.
    fn at_least(&self, version: OsVersion) -> bool {
        self.os.is_none_or(|os| os >= version)
    }

    /// Image-load restrictions stop the target from starting when the
    /// binaries themselves are on a network share.
    pub fn allows_image_load_restrictions(&self) -> bool {
        !self.running_from_network_drive
    }
}

impl Default for HostFacts {
    fn default() -> Self {
        Self::modern()
    }
}
