// SPDX-License-Identifier: MIT

//! Process mitigation flag sets.
//!
//! Every kind starts from the same baseline and adds its own flags.  Some
//! additions depend on the host, and the composition-subsystem lockdown has
//! its own two-step protocol against the policy object.

use std::ops::{BitOr, BitOrAssign};

use tracing::debug;

use crate::error::{PolicyStep, ProgrammerError};

use super::host::HostFacts;
use super::kind::TrustLevel;
use super::rules::{Access, ResourceRule};
use super::target::TargetPolicy;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MitigationFlags(u64);

impl MitigationFlags {
    pub const NONE: Self = Self(0);
    pub const BOTTOM_UP_ASLR: Self = Self(1 << 0);
    pub const HEAP_TERMINATE: Self = Self(1 << 1);
    pub const SEHOP: Self = Self(1 << 2);
    pub const DEP_NO_ATL_THUNK: Self = Self(1 << 3);
    pub const DEP: Self = Self(1 << 4);
    pub const EXTENSION_POINT_DISABLE: Self = Self(1 << 5);
    pub const IMAGE_LOAD_PREFER_SYS32: Self = Self(1 << 6);
    pub const IMAGE_LOAD_NO_REMOTE: Self = Self(1 << 7);
    pub const IMAGE_LOAD_NO_LOW_LABEL: Self = Self(1 << 8);
    pub const CONTROL_FLOW_GUARD_DISABLE: Self = Self(1 << 9);
    pub const HARDEN_TOKEN_IL_POLICY: Self = Self(1 << 10);
    pub const NONSYSTEM_FONT_DISABLE: Self = Self(1 << 11);
    pub const WIN32K_DISABLE: Self = Self(1 << 12);
    pub const STRICT_HANDLE_CHECKS: Self = Self(1 << 13);
    pub const DLL_SEARCH_ORDER: Self = Self(1 << 14);
    pub const DYNAMIC_CODE_DISABLE: Self = Self(1 << 15);
    pub const FORCE_MS_SIGNED_BINS: Self = Self(1 << 16);

    /// Applied to every worker at creation.
    pub const BASELINE: Self = Self::BOTTOM_UP_ASLR
        .union(Self::HEAP_TERMINATE)
        .union(Self::SEHOP)
        .union(Self::DEP_NO_ATL_THUNK)
        .union(Self::DEP);

    pub const IMAGE_LOAD_RESTRICTIONS: Self = Self::IMAGE_LOAD_NO_REMOTE.union(Self::IMAGE_LOAD_NO_LOW_LABEL);

    const NAMES: &'static [(MitigationFlags, &'static str)] = &[
        (Self::BOTTOM_UP_ASLR, "BOTTOM_UP_ASLR"),
        (Self::HEAP_TERMINATE, "HEAP_TERMINATE"),
        (Self::SEHOP, "SEHOP"),
        (Self::DEP_NO_ATL_THUNK, "DEP_NO_ATL_THUNK"),
        (Self::DEP, "DEP"),
        (Self::EXTENSION_POINT_DISABLE, "EXTENSION_POINT_DISABLE"),
        (Self::IMAGE_LOAD_PREFER_SYS32, "IMAGE_LOAD_PREFER_SYS32"),
        (Self::IMAGE_LOAD_NO_REMOTE, "IMAGE_LOAD_NO_REMOTE"),
        (Self::IMAGE_LOAD_NO_LOW_LABEL, "IMAGE_LOAD_NO_LOW_LABEL"),
        (Self::CONTROL_FLOW_GUARD_DISABLE, "CONTROL_FLOW_GUARD_DISABLE"),
        (Self::HARDEN_TOKEN_IL_POLICY, "HARDEN_TOKEN_IL_POLICY"),
        (Self::NONSYSTEM_FONT_DISABLE, "NONSYSTEM_FONT_DISABLE"),
        (Self::WIN32K_DISABLE, "WIN32K_DISABLE"),
        (Self::STRICT_HANDLE_CHECKS, "STRICT_HANDLE_CHECKS"),
        (Self::DLL_SEARCH_ORDER, "DLL_SEARCH_ORDER"),
        (Self::DYNAMIC_CODE_DISABLE, "DYNAMIC_CODE_DISABLE"),
        (Self::FORCE_MS_SIGNED_BINS, "FORCE_MS_SIGNED_BINS"),
    ];

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MitigationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for MitigationFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl std::fmt::Debug for MitigationFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "MitigationFlags({})", names.join(" | "))
    }
}

/// Declarative mitigation settings for one worker kind.
#[derive(Debug, Clone, Copy)]
pub struct MitigationProfile {
    /// Added to the baseline at creation.
    pub additions: MitigationFlags,
    /// Image-load restrictions are requested when trust is above this value.
    pub image_load_restrictions_above: Option<u32>,
    /// Whether the ARM64 control-flow guard exception applies to this kind.
    pub cfg_compat_exception: bool,
    /// Applied once the target finishes its own start-up.
    pub delayed: MitigationFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MitigationSet {
    pub initial: MitigationFlags,
    pub delayed: MitigationFlags,
}

pub fn build_mitigations(profile: &MitigationProfile, trust: TrustLevel, host: &HostFacts) -> MitigationSet {
    let mut initial = MitigationFlags::BASELINE | profile.additions;

    if profile.cfg_compat_exception && host.needs_cfg_compat_exception() {
        initial |= MitigationFlags::CONTROL_FLOW_GUARD_DISABLE;
    }

    if let Some(above) = profile.image_load_restrictions_above {
        if trust.get() > above {
            if host.allows_image_load_restrictions() {
                initial |= MitigationFlags::IMAGE_LOAD_RESTRICTIONS;
            } else {
                debug!("running from a network drive, image load restrictions not applied");
            }
        }
    }

    MitigationSet { initial, delayed: profile.delayed }
}

/// How much of the composition subsystem the locked-down worker keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Win32kMode {
    /// Minimal stub so GDI initialisation succeeds without real access.
    FakeGdiInit,
    /// Emulate the output protection APIs for on-screen rendering.
    ImplementOpm,
}

/// Disable the composition subsystem for the target.
///
/// The engine only accepts the lockdown rule once the disable flag is set,
/// so the flag goes in first, then the rule, then (outside stub mode) the
/// OPM redirection.  Hosts without lockdown support skip all of it.
pub fn add_win32k_lockdown<P: TargetPolicy + ?Sized>(
    policy: &mut P,
    mode: Win32kMode,
    host: &HostFacts,
) -> Result<(), ProgrammerError> {
    if !host.supports_win32k_lockdown() {
        debug!("host does not support win32k lockdown; skipping");
        return Ok(());
    }

    let flags = policy.process_mitigations();
    if flags.contains(MitigationFlags::WIN32K_DISABLE) {
        return Err(ProgrammerError::LockdownAlreadyApplied);
    }

    let result = policy.set_process_mitigations(flags | MitigationFlags::WIN32K_DISABLE);
    if !result.is_ok() {
        return Err(ProgrammerError::Rejected {
            step: PolicyStep::Win32kLockdown,
            result,
            message: "mitigation flags rejected while disabling win32k",
        });
    }

    let access = match mode {
        Win32kMode::FakeGdiInit => Access::Win32kFakeGdiInit,
        Win32kMode::ImplementOpm => Access::Win32kImplementOpm,
    };
    let result = policy.add_rule(&ResourceRule::new(access, ""));
    if !result.is_ok() {
        return Err(ProgrammerError::Rejected {
            step: PolicyStep::Win32kLockdown,
            result,
            message: "win32k lockdown rule rejected after the disable flag was set",
        });
    }

    if mode == Win32kMode::ImplementOpm {
        policy.set_enable_opm_redirection();
    }
    Ok(())
}
