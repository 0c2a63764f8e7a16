// SPDX-License-Identifier: MIT

//! Applies a derived [`PolicySpec`] to the sandbox engine's policy object.
//!
//! The order of the steps is fixed.  A rejection of anything built from
//! static values is a programmer error; failures caused by the environment
//! are logged and the rest of the policy still goes in.

use tracing::{debug, error, warn};

use crate::error::{PolicyStep, ProgrammerError};

use super::PolicySpec;
use super::host::HostFacts;
use super::levels::JobLevel;
use super::mitigation::add_win32k_lockdown;
use super::rules::RuleOrigin;
use super::target::{ResultCode, TargetPolicy};

/// Environment facts the compiler needs beyond the derived policy.
#[derive(Debug, Clone, Copy)]
pub struct CompileEnv<'a> {
    pub host: &'a HostFacts,
    /// A job object can be assigned to the target from this broker.
    pub can_use_job: bool,
}

/// What happened while applying a policy, for the caller to log or record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileReport {
    /// The job level fell back to no job.
    pub job_fallback: bool,
    pub alternate_desktop_failed: bool,
    pub rules_applied: usize,
    pub rules_failed: usize,
}

fn check(step: PolicyStep, result: ResultCode, message: &'static str) -> Result<(), ProgrammerError> {
    if result.is_ok() {
        Ok(())
    } else {
        Err(ProgrammerError::Rejected { step, result, message })
    }
}

pub fn apply_policy<P: TargetPolicy + ?Sized>(
    policy: &mut P,
    spec: &PolicySpec,
    env: &CompileEnv<'_>,
) -> Result<CompileReport, ProgrammerError> {
    let mut report = CompileReport::default();
    let kind = spec.kind;

    // Job containment.
    let (job, ui_exceptions) = if env.can_use_job {
        (spec.levels.job, spec.job_ui_exceptions)
    } else {
        report.job_fallback = spec.levels.job != JobLevel::None;
        (JobLevel::None, 0)
    };
    if report.job_fallback {
        warn!(%kind, requested = ?spec.levels.job, "job objects unusable; launching without a job");
    }
    check(PolicyStep::JobLevel, policy.set_job_level(job, ui_exceptions), "job level rejected")?;

    check(
        PolicyStep::TokenLevel,
        policy.set_token_level(spec.levels.initial_token, spec.levels.delayed_token),
        "token levels rejected",
    )?;

    check(
        PolicyStep::IntegrityLevel,
        policy.set_integrity_level(spec.levels.initial_integrity),
        "initial integrity level rejected",
    )?;
    check(
        PolicyStep::DelayedIntegrityLevel,
        policy.set_delayed_integrity_level(spec.levels.delayed_integrity),
        "delayed integrity level rejected",
    )?;

    if spec.lockdown_dacl {
        policy.set_lockdown_default_dacl();
        policy.add_restricting_random_sid();
    }

    if let Some(alternate_winstation) = spec.alternate_desktop {
        let result = policy.set_alternate_desktop(alternate_winstation);
        if !result.is_ok() {
            report.alternate_desktop_failed = true;
            warn!(%kind, %result, alternate_winstation, "failed to create alternate desktop for sandbox");
        }
    }

    check(
        PolicyStep::ProcessMitigations,
        policy.set_process_mitigations(spec.mitigations.initial),
        "process mitigation flags rejected",
    )?;

    if let Some(mode) = spec.win32k {
        add_win32k_lockdown(policy, mode, env.host)?;
    }

    check(
        PolicyStep::DelayedProcessMitigations,
        policy.set_delayed_process_mitigations(spec.mitigations.delayed),
        "delayed process mitigation flags rejected",
    )?;

    let mut best_effort_failed = false;
    for entry in &spec.rules {
        if entry.origin != RuleOrigin::BestEffort {
            best_effort_failed = false;
        } else if best_effort_failed {
            continue;
        }

        let result = policy.add_rule(&entry.rule);
        if result.is_ok() {
            debug!(%kind, access = ?entry.rule.access, pattern = %entry.rule.pattern, "added rule");
            report.rules_applied += 1;
            continue;
        }

        report.rules_failed += 1;
        match entry.origin {
            RuleOrigin::Static => {
                return Err(ProgrammerError::Rejected {
                    step: PolicyStep::StaticRule,
                    result,
                    message: "static rule pattern rejected",
                });
            }
            RuleOrigin::CachedDirectory => {
                error!(%kind, %result, pattern = %entry.rule.pattern, "failed to add rule for cached directory");
            }
            RuleOrigin::BestEffort => {
                warn!(%kind, %result, pattern = %entry.rule.pattern, "optional rule rejected; skipping its group");
                best_effort_failed = true;
            }
        }
    }

    Ok(report)
}
