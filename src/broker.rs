// SPDX-License-Identifier: MIT

//! Process-scoped broker state and the per-launch broker.
//!
//! [`BrokerContext`] holds everything that lives as long as the broker
//! process: configuration, host facts, the directory cache, the job probe
//! and the spawn failure log.  It has an explicit lifecycle:
//! [`initialize`](BrokerContext::initialize) must run on the thread that owns
//! the directory service, before any launch; [`shutdown`](BrokerContext::shutdown)
//! drops the caches.
//!
//! A [`SandboxBroker`] is created per launch.  It owns the engine's policy
//! object, gets the worker's security level applied, then launches.

pub mod cmdline;
pub mod dirs;
pub mod environment;
pub mod launch;
pub mod telemetry;

use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, ProgrammerError};
use crate::policy::compiler::{CompileEnv, CompileReport, apply_policy};
use crate::policy::host::HostFacts;
use crate::policy::kind::{LaunchContext, WorkerKind};
use crate::policy::rules::{Access, ResourceRule, child_log_file_rule, logging_interception_rules};
use crate::policy::target::{HandleValue, TargetPolicy};
use crate::policy::{DeriveOptions, PolicySpec};

use cmdline::{Environment, quote_command_line};
use dirs::{CachedDirectories, ConfiguredDirectories, DirectoryCache, DirectoryService};
use environment::{HostProbe, JobSupport};
use launch::{
    BinaryFixups, ImportSnapshot, LaunchAttempt, LaunchFailureLog, LaunchOrchestrator, LaunchRequest,
    LauncherCircuitBreaker, MarkerFileBreaker, SpawnService,
};
use telemetry::{Telemetry, TracingTelemetry};

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct BrokerContext {
    config: BrokerConfig,
    probe: Box<dyn HostProbe>,
    host: OnceLock<HostFacts>,
    dirs: DirectoryCache,
    job: JobSupport,
    failures: LaunchFailureLog,
    telemetry: Arc<dyn Telemetry>,
    launcher: Option<Box<dyn LauncherCircuitBreaker>>,
    env: EnvLookup,
}

impl BrokerContext {
    pub fn new(config: BrokerConfig, probe: Box<dyn HostProbe>, telemetry: Arc<dyn Telemetry>) -> Self {
        let launcher: Option<Box<dyn LauncherCircuitBreaker>> = match (config.behind_launcher, &config.launcher_disable_marker) {
            (true, Some(path)) => Some(Box::new(MarkerFileBreaker { path: path.clone() })),
            (true, None) => {
                warn!("behind the launcher but no disable marker configured; circuit breaker is off");
                None
            }
            (false, _) => None,
        };
        Self {
            config,
            probe,
            host: OnceLock::new(),
            dirs: DirectoryCache::new(),
            job: JobSupport::new(),
            failures: LaunchFailureLog::new(),
            telemetry,
            launcher,
            env: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Context for the running system, logging telemetry through `tracing`.
    pub fn system(config: BrokerConfig) -> Self {
        Self::new(config, Box::new(crate::platform::SystemProbe), Arc::new(TracingTelemetry))
    }

    pub fn with_launcher(mut self, launcher: Box<dyn LauncherCircuitBreaker>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Replace the lookup used for the broker's own environment variables.
    pub fn with_env_lookup<F: Fn(&str) -> Option<String> + Send + Sync + 'static>(mut self, lookup: F) -> Self {
        self.env = Box::new(lookup);
        self
    }

    /// Cache the rule directories and start the failure log.
    ///
    /// Must run on the thread that owns `directories`, before any launch.
    pub fn initialize(&self, directories: &dyn DirectoryService) {
        let host = self.host();
        info!(os = ?host.os, arch = ?host.arch, network_drive = host.running_from_network_drive, "initializing sandbox broker");
        self.dirs.populate(directories);
        self.failures.init();
    }

    /// [`initialize`](Self::initialize) with the configured directories.
    pub fn initialize_from_config(&self) {
        let service = ConfiguredDirectories::new(self.config.directories.clone());
        self.initialize(&service);
    }

    pub fn shutdown(&self) {
        debug!("sandbox broker shutting down");
        self.dirs.clear();
        self.failures.clear();
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Host facts, probed on first use.
    pub fn host(&self) -> HostFacts {
        *self.host.get_or_init(|| self.probe.host_facts())
    }

    pub fn directories(&self) -> Arc<CachedDirectories> {
        self.dirs.snapshot()
    }

    pub fn can_use_job(&self) -> bool {
        self.job.can_use_job(self.probe.as_ref(), self.telemetry.as_ref())
    }

    fn escalate(&self, e: ProgrammerError) -> BrokerError {
        if self.config.abort_on_programmer_error {
            panic!("sandbox programmer error: {e}");
        }
        error!(error = %e, "sandbox programmer error");
        BrokerError::Programmer(e)
    }
}

/// Prepares and launches one sandboxed target.
pub struct SandboxBroker<'a, S: SpawnService, F: BinaryFixups<S::Process>> {
    context: &'a BrokerContext,
    spawner: &'a S,
    fixups: &'a F,
    policy: Option<S::Policy>,
    launch: LaunchContext,
    /// Set once the security level went in; launches use its kind.
    applied: Option<PolicySpec>,
}

impl<'a, S: SpawnService, F: BinaryFixups<S::Process>> SandboxBroker<'a, S, F> {
    pub fn new(context: &'a BrokerContext, spawner: &'a S, fixups: &'a F) -> Self {
        let mut policy = spawner.create_policy();
        if let Some(policy) = policy.as_mut() {
            // restricting SIDs break access to the binaries on a share.
            if context.host().running_from_network_drive {
                policy.set_do_not_use_restricting_sids();
            }
        } else {
            warn!("spawn service has no policy to give out");
        }
        Self { context, spawner, fixups, policy, launch: LaunchContext::default(), applied: None }
    }

    pub fn has_policy(&self) -> bool {
        self.policy.is_some()
    }

    fn policy_mut(&mut self) -> Result<&mut S::Policy, BrokerError> {
        self.policy.as_mut().ok_or(BrokerError::NoPolicy)
    }

    /// Derive the policy for the worker and apply it.  Only once per broker.
    pub fn set_security_level(&mut self, kind: WorkerKind, launch: LaunchContext) -> Result<CompileReport, BrokerError> {
        let context = self.context;
        if self.policy.is_none() {
            return Err(BrokerError::NoPolicy);
        }
        if let Some(applied) = &self.applied {
            return Err(context.escalate(ProgrammerError::SecurityLevelAlreadySet(applied.kind)));
        }
        let host = context.host();
        let dirs = context.directories();
        let options = DeriveOptions {
            win32k_enabled: context.config.lockdown.enabled_for(kind),
            debug_rules: context.config.debug_rules,
        };
        let spec = PolicySpec::derive(kind, &launch, &host, &dirs, options).map_err(|e| context.escalate(e))?;
        let env = CompileEnv { host: &host, can_use_job: context.can_use_job() };

        let policy = self.policy_mut()?;
        let report = apply_policy(policy, &spec, &env).map_err(|e| context.escalate(e))?;
        debug!(%kind, trust = launch.trust, ?report, "applied security level");
        self.launch = launch;
        self.applied = Some(spec);
        Ok(report)
    }

    /// Allow the target to read a single file.
    pub fn allow_read_file(&mut self, path: &Path) -> bool {
        let Some(policy) = self.policy.as_mut() else {
            return false;
        };
        let Some(path) = path.to_str() else {
            error!(path = %path.display(), "read rule path is not valid unicode");
            return false;
        };
        let rule = ResourceRule::new(Access::FilesAllowReadonly, dirs::to_rule_path(path));
        let result = policy.add_rule(&rule);
        if !result.is_ok() {
            error!(%result, pattern = %rule.pattern, "failed to add read rule");
            return false;
        }
        true
    }

    pub fn add_handle_to_share(&mut self, handle: HandleValue) {
        if let Some(policy) = self.policy.as_mut() {
            policy.add_handle_to_share(handle);
        }
    }

    /// Let targets duplicate handles into `process`.
    pub fn add_target_peer(&self, process: HandleValue) -> bool {
        if self.policy.is_none() {
            return false;
        }
        self.spawner.add_target_peer(process).is_ok()
    }

    /// Placeholder rules so that every interception is active and logs.
    pub fn apply_logging_policy(&mut self) {
        let Some(policy) = self.policy.as_mut() else {
            return;
        };
        for rule in logging_interception_rules() {
            let result = policy.add_rule(&rule);
            if !result.is_ok() {
                warn!(%result, access = ?rule.access, "failed to add logging rule");
            }
        }
    }

    fn add_child_log_rule(&mut self, env: &Environment) {
        let logging = &self.context.config.child_logging;
        let Some(file) = logging.file_vars.iter().find_map(|var| env.get(var)) else {
            return;
        };
        let Some(modules) = (self.context.env)(&logging.modules_var) else {
            return;
        };
        let rule = child_log_file_rule(file, &modules, &logging.extension, &logging.pid_token);
        if let Some(policy) = self.policy.as_mut() {
            let result = policy.add_rule(&rule);
            if !result.is_ok() {
                warn!(%result, pattern = %rule.pattern, "failed to add child log file rule");
            }
        }
    }

    /// Launch the target under the applied policy.  On success the caller
    /// owns the returned process.
    ///
    /// [`set_security_level`](Self::set_security_level) must have succeeded
    /// first; the worker kind is the one it was applied for.
    pub fn launch_app(
        &mut self,
        path: &Path,
        args: &[String],
        env: &Environment,
        enable_logging: bool,
        import_snapshot: Option<&ImportSnapshot>,
    ) -> Result<S::Process, BrokerError> {
        let context = self.context;
        if self.policy.is_none() {
            return Err(BrokerError::NoPolicy);
        }
        let Some(spec) = self.applied.as_ref() else {
            return Err(context.escalate(ProgrammerError::SecurityLevelNotSet));
        };
        let (kind, binary) = (spec.kind, spec.binary);

        let path = resolve_executable(path)?;
        let program = path
            .to_str()
            .ok_or_else(|| BrokerError::InvalidArgument(format!("executable path {} is not unicode", path.display())))?;
        let command_line = quote_command_line(program, args)?;

        let (stdout, stderr) = crate::platform::std_handles();
        {
            let policy = self.policy_mut()?;
            if let Some(handle) = stdout {
                policy.set_stdout_handle(handle);
            }
            if let Some(handle) = stderr {
                policy.set_stderr_handle(handle);
            }
        }
        if enable_logging {
            self.apply_logging_policy();
        }
        self.add_child_log_rule(env);

        let orchestrator = LaunchOrchestrator {
            spawner: self.spawner,
            fixups: self.fixups,
            failures: &context.failures,
            telemetry: context.telemetry.as_ref(),
            launcher: context.launcher.as_deref(),
        };
        let request = LaunchRequest {
            kind,
            binary,
            path: &path,
            command_line: &command_line,
            env,
            import_snapshot,
        };
        let mut attempt = LaunchAttempt::new(kind);
        let policy = self.policy_mut()?;
        orchestrator.launch(policy, &request, &mut attempt)
    }

    /// The launch context of the last applied security level.
    pub fn launch_context(&self) -> &LaunchContext {
        &self.launch
    }

    /// The policy applied by [`set_security_level`](Self::set_security_level).
    pub fn applied_policy(&self) -> Option<&PolicySpec> {
        self.applied.as_ref()
    }
}

/// A bare program name is looked up on the search path; anything with a
/// directory part is used as given.
fn resolve_executable(path: &Path) -> Result<PathBuf, BrokerError> {
    let has_dir = path.to_str().is_none_or(|s| s.contains(['/', '\\']));
    if has_dir || path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let resolved = which::which(path.as_os_str())?;
    debug!(program = %path.display(), resolved = %resolved.display(), "resolved executable");
    Ok(resolved)
}
