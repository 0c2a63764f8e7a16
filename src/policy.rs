// SPDX-License-Identifier: MIT

//! Policy derivation.
//!
//! `PolicySpec::derive` turns a worker kind, its launch context and the host
//! facts into the full set of restriction settings.  Nothing here talks to
//! the sandbox engine; the [`compiler`] applies a derived policy to a
//! [`target::TargetPolicy`].

pub mod compiler;
pub mod host;
pub mod kind;
pub mod levels;
pub mod mitigation;
pub mod rules;
pub mod target;

use crate::broker::dirs::CachedDirectories;
use crate::error::ProgrammerError;

use host::HostFacts;
use kind::{BinaryKind, LaunchContext, TrustLevel, WorkerKind};
use levels::{LevelSet, resolve_levels};
use mitigation::{MitigationSet, Win32kMode, build_mitigations};
use rules::{RuleContext, RuleEntry, RuleOrigin};
use target::JOB_UI_EXCEPTION_HANDLES;

/// Switches that come from configuration rather than the launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeriveOptions {
    /// Composition-subsystem lockdown is enabled for this kind.
    pub win32k_enabled: bool,
    /// Add the debug-only rules and job exceptions.
    pub debug_rules: bool,
}

/// Everything the compiler applies, fixed once derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySpec {
    pub kind: WorkerKind,
    pub trust: TrustLevel,
    pub levels: LevelSet,
    pub job_ui_exceptions: u32,
    pub mitigations: MitigationSet,
    pub lockdown_dacl: bool,
    /// `Some(alternate_winstation)` when an alternate desktop is requested.
    pub alternate_desktop: Option<bool>,
    pub win32k: Option<Win32kMode>,
    pub rules: Vec<RuleEntry>,
    pub binary: BinaryKind,
}

impl PolicySpec {
    pub fn derive(
        kind: WorkerKind,
        ctx: &LaunchContext,
        host: &HostFacts,
        dirs: &CachedDirectories,
        options: DeriveOptions,
    ) -> Result<Self, ProgrammerError> {
        let profile = kind.profile();
        let trust = TrustLevel::new(ctx.trust)?;
        let handles_file_content = profile.honors_file_content && ctx.is_file_process;

        let levels = resolve_levels(profile.bands, trust, handles_file_content)?;
        let job_ui_exceptions = if options.debug_rules && profile.debug_ui_exceptions {
            JOB_UI_EXCEPTION_HANDLES
        } else {
            0
        };

        let desktop = profile.alternate_desktop;
        let alternate_desktop = desktop.when.applies(trust).then_some(desktop.alternate_winstation);

        let win32k = profile
            .win32k
            .filter(|_| options.win32k_enabled)
            .filter(|w| !w.requires_opm || host.supports_opm_redirection())
            .map(|w| w.mode);

        let rule_ctx = RuleContext {
            trust,
            handles_file_content,
            remote_launch: ctx.is_remote_launch,
            debug_rules: options.debug_rules,
            dirs,
            gpu_profile_dir: ctx.gpu_profile_dir.as_deref(),
        };
        let mut rules = (profile.rules)(&rule_ctx);
        if options.debug_rules {
            if let Some(rule) = rules::temp_dir_rule(dirs) {
                rules.push(RuleEntry { rule, origin: RuleOrigin::CachedDirectory });
            }
        }

        Ok(Self {
            kind,
            trust,
            levels,
            job_ui_exceptions,
            mitigations: build_mitigations(&profile.mitigations, trust, host),
            lockdown_dacl: profile.hardening.applies(trust),
            alternate_desktop,
            win32k,
            rules,
            binary: profile.binary,
        })
    }
}
