// SPDX-License-Identifier: MIT

//! The policy object owned by the external sandbox engine.
//!
//! The compiler only talks to the engine through this trait.  It never looks
//! at hidden state, apart from reading back the current mitigation flags,
//! which the engine's own rule preconditions depend on.

use super::levels::{IntegrityLevel, JobLevel, TokenLevel};
use super::mitigation::MitigationFlags;
use super::rules::ResourceRule;

/// Result code reported by the sandbox engine.  Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const ALL_OK: ResultCode = ResultCode(0);

    pub fn is_ok(self) -> bool {
        self == Self::ALL_OK
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An OS handle value passed through to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleValue(pub usize);

/// Job object UI exception allowing the target to use user handles.
pub const JOB_UI_EXCEPTION_HANDLES: u32 = 0x0000_0001;

pub trait TargetPolicy {
    fn set_job_level(&mut self, level: JobLevel, ui_exceptions: u32) -> ResultCode;

    fn set_token_level(&mut self, initial: TokenLevel, lockdown: TokenLevel) -> ResultCode;

    fn set_integrity_level(&mut self, level: IntegrityLevel) -> ResultCode;

    fn set_delayed_integrity_level(&mut self, level: IntegrityLevel) -> ResultCode;

    fn set_lockdown_default_dacl(&mut self);

    fn add_restricting_random_sid(&mut self);

    /// Run the target on an isolated desktop; `alternate_winstation` also
    /// isolates the window station.
    fn set_alternate_desktop(&mut self, alternate_winstation: bool) -> ResultCode;

    /// The mitigations already set for process creation.
    fn process_mitigations(&self) -> MitigationFlags;

    fn set_process_mitigations(&mut self, flags: MitigationFlags) -> ResultCode;

    fn set_delayed_process_mitigations(&mut self, flags: MitigationFlags) -> ResultCode;

    fn add_rule(&mut self, rule: &ResourceRule) -> ResultCode;

    fn set_enable_opm_redirection(&mut self);

    fn add_handle_to_share(&mut self, handle: HandleValue);

    fn set_stdout_handle(&mut self, handle: HandleValue);

    fn set_stderr_handle(&mut self, handle: HandleValue);

    fn set_do_not_use_restricting_sids(&mut self);
}
