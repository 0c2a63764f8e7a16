// SPDX-License-Identifier: MIT

//! In-memory stand-ins for the broker's collaborators.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
};

use crate::broker::cmdline::Environment;
use crate::broker::launch::{
    BinaryFixups, ImageHeaders, ImportSnapshot, LauncherCircuitBreaker, SpawnOutcome, SpawnService, TargetProcess,
};
use crate::broker::telemetry::Telemetry;
use crate::error::FixupError;
use crate::policy::levels::{IntegrityLevel, JobLevel, TokenLevel};
use crate::policy::mitigation::MitigationFlags;
use crate::policy::rules::ResourceRule;
use crate::policy::target::{HandleValue, ResultCode, TargetPolicy};

/// Result code the fakes hand back for a rejected call.
pub const REJECTED: ResultCode = ResultCode(1);

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyCall {
    JobLevel(JobLevel, u32),
    TokenLevel(TokenLevel, TokenLevel),
    IntegrityLevel(IntegrityLevel),
    DelayedIntegrityLevel(IntegrityLevel),
    LockdownDefaultDacl,
    RestrictingRandomSid,
    AlternateDesktop(bool),
    ProcessMitigations(MitigationFlags),
    DelayedProcessMitigations(MitigationFlags),
    Rule(ResourceRule),
    OpmRedirection,
    HandleToShare(HandleValue),
    StdoutHandle(HandleValue),
    StderrHandle(HandleValue),
    NoRestrictingSids,
}

impl PolicyCall {
    /// The [`TargetPolicy`] method that made the call.
    pub fn step_name(&self) -> &'static str {
        match self {
            PolicyCall::JobLevel(..) => "set_job_level",
            PolicyCall::TokenLevel(..) => "set_token_level",
            PolicyCall::IntegrityLevel(_) => "set_integrity_level",
            PolicyCall::DelayedIntegrityLevel(_) => "set_delayed_integrity_level",
            PolicyCall::LockdownDefaultDacl => "set_lockdown_default_dacl",
            PolicyCall::RestrictingRandomSid => "add_restricting_random_sid",
            PolicyCall::AlternateDesktop(_) => "set_alternate_desktop",
            PolicyCall::ProcessMitigations(_) => "set_process_mitigations",
            PolicyCall::DelayedProcessMitigations(_) => "set_delayed_process_mitigations",
            PolicyCall::Rule(_) => "add_rule",
            PolicyCall::OpmRedirection => "set_enable_opm_redirection",
            PolicyCall::HandleToShare(_) => "add_handle_to_share",
            PolicyCall::StdoutHandle(_) => "set_stdout_handle",
            PolicyCall::StderrHandle(_) => "set_stderr_handle",
            PolicyCall::NoRestrictingSids => "set_do_not_use_restricting_sids",
        }
    }
}

/// Records every call and keeps the accepted state.
///
/// `reject_step` makes the named method fail; `reject_patterns` makes
/// `add_rule` fail for those patterns.  Rejected calls are still recorded.
#[derive(Debug, Clone, Default)]
pub struct RecordingPolicy {
    pub calls: Vec<PolicyCall>,
    pub job: Option<(JobLevel, u32)>,
    pub tokens: Option<(TokenLevel, TokenLevel)>,
    pub integrity: Option<IntegrityLevel>,
    pub delayed_integrity: Option<IntegrityLevel>,
    pub lockdown_dacl: bool,
    pub random_sid: bool,
    pub alternate_desktop: Option<bool>,
    pub initial_mitigations: MitigationFlags,
    pub delayed_mitigations: MitigationFlags,
    pub rules: Vec<ResourceRule>,
    pub opm_redirection: bool,
    pub shared_handles: Vec<HandleValue>,
    pub stdout: Option<HandleValue>,
    pub stderr: Option<HandleValue>,
    pub no_restricting_sids: bool,
    pub reject_step: Option<&'static str>,
    pub reject_patterns: Vec<String>,
}

impl RecordingPolicy {
    fn record(&mut self, call: PolicyCall) -> bool {
        let step = call.step_name();
        self.calls.push(call);
        self.reject_step != Some(step)
    }

    fn result(accepted: bool) -> ResultCode {
        if accepted { ResultCode::ALL_OK } else { REJECTED }
    }

    pub fn rule_patterns(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.pattern.as_str()).collect()
    }
}

impl TargetPolicy for RecordingPolicy {
    fn set_job_level(&mut self, level: JobLevel, ui_exceptions: u32) -> ResultCode {
        let ok = self.record(PolicyCall::JobLevel(level, ui_exceptions));
        if ok {
            self.job = Some((level, ui_exceptions));
        }
        Self::result(ok)
    }

    fn set_token_level(&mut self, initial: TokenLevel, lockdown: TokenLevel) -> ResultCode {
        let ok = self.record(PolicyCall::TokenLevel(initial, lockdown));
        if ok {
            self.tokens = Some((initial, lockdown));
        }
        Self::result(ok)
    }

    fn set_integrity_level(&mut self, level: IntegrityLevel) -> ResultCode {
        let ok = self.record(PolicyCall::IntegrityLevel(level));
        if ok {
            self.integrity = Some(level);
        }
        Self::result(ok)
    }

    fn set_delayed_integrity_level(&mut self, level: IntegrityLevel) -> ResultCode {
        let ok = self.record(PolicyCall::DelayedIntegrityLevel(level));
        if ok {
            self.delayed_integrity = Some(level);
        }
        Self::result(ok)
    }

    fn set_lockdown_default_dacl(&mut self) {
        self.record(PolicyCall::LockdownDefaultDacl);
        self.lockdown_dacl = true;
    }

    fn add_restricting_random_sid(&mut self) {
        self.record(PolicyCall::RestrictingRandomSid);
        self.random_sid = true;
    }

    fn set_alternate_desktop(&mut self, alternate_winstation: bool) -> ResultCode {
        let ok = self.record(PolicyCall::AlternateDesktop(alternate_winstation));
        if ok {
            self.alternate_desktop = Some(alternate_winstation);
        }
        Self::result(ok)
    }

    fn process_mitigations(&self) -> MitigationFlags {
        self.initial_mitigations
    }

    fn set_process_mitigations(&mut self, flags: MitigationFlags) -> ResultCode {
        let ok = self.record(PolicyCall::ProcessMitigations(flags));
        if ok {
            self.initial_mitigations = flags;
        }
        Self::result(ok)
    }

    fn set_delayed_process_mitigations(&mut self, flags: MitigationFlags) -> ResultCode {
        let ok = self.record(PolicyCall::DelayedProcessMitigations(flags));
        if ok {
            self.delayed_mitigations = flags;
        }
        Self::result(ok)
    }

    fn add_rule(&mut self, rule: &ResourceRule) -> ResultCode {
        let ok = self.record(PolicyCall::Rule(rule.clone())) && !self.reject_patterns.contains(&rule.pattern);
        if ok {
            self.rules.push(rule.clone());
        }
        Self::result(ok)
    }

    fn set_enable_opm_redirection(&mut self) {
        self.record(PolicyCall::OpmRedirection);
        self.opm_redirection = true;
    }

    fn add_handle_to_share(&mut self, handle: HandleValue) {
        self.record(PolicyCall::HandleToShare(handle));
        self.shared_handles.push(handle);
    }

    fn set_stdout_handle(&mut self, handle: HandleValue) {
        self.record(PolicyCall::StdoutHandle(handle));
        self.stdout = Some(handle);
    }

    fn set_stderr_handle(&mut self, handle: HandleValue) {
        self.record(PolicyCall::StderrHandle(handle));
        self.stderr = Some(handle);
    }

    fn set_do_not_use_restricting_sids(&mut self) {
        self.record(PolicyCall::NoRestrictingSids);
        self.no_restricting_sids = true;
    }
}

type EventLog = Arc<Mutex<Vec<String>>>;

/// A target that only records what was done to it.  The event log is
/// shared, so it can still be read after the process is dropped.
#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    events: EventLog,
    terminated: bool,
    resume_fails: bool,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Self {
        Self { pid, events: Arc::default(), terminated: false, resume_fails: false }
    }

    /// A target whose main thread refuses to resume.
    pub fn failing_resume(pid: u32) -> Self {
        Self { resume_fails: true, ..Self::new(pid) }
    }

    pub fn events(&self) -> Vec<String> {
        locked(&self.events).clone()
    }

    fn event_log(&self) -> EventLog {
        Arc::clone(&self.events)
    }

    fn push(&self, event: impl Into<String>) {
        locked(&self.events).push(event.into());
    }
}

impl TargetProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn handle(&self) -> HandleValue {
        HandleValue(0x1000 + self.pid as usize)
    }

    fn terminate(&mut self, exit_code: u32) -> std::io::Result<()> {
        if !self.terminated {
            self.terminated = true;
            self.push(format!("terminate({exit_code})"));
        }
        Ok(())
    }

    fn resume(&mut self) -> std::io::Result<()> {
        self.push("resume");
        if self.resume_fails {
            return Err(std::io::Error::other("thread could not be resumed"));
        }
        Ok(())
    }

    fn close_thread(&mut self) {
        self.push("close_thread");
    }

    fn close_process(&mut self) {
        self.push("close_process");
    }
}

/// What one spawn was asked to do.
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub path: PathBuf,
    pub command_line: String,
    pub env: Environment,
    pub policy: RecordingPolicy,
}

/// Hands out scripted spawn outcomes in order, then succeeds.
#[derive(Debug, Default)]
pub struct ScriptedSpawner {
    outcomes: Mutex<VecDeque<SpawnOutcome<FakeProcess>>>,
    spawns: Mutex<Vec<SpawnRecord>>,
    peers: Mutex<Vec<HandleValue>>,
    last_events: Mutex<Option<EventLog>>,
    next_pid: AtomicU32,
    shut_down: AtomicBool,
}

impl ScriptedSpawner {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn with_outcomes(outcomes: Vec<SpawnOutcome<FakeProcess>>) -> Self {
        Self { outcomes: Mutex::new(outcomes.into()), ..Self::default() }
    }

    /// An engine that no longer gives out policies.
    pub fn shut_down() -> Self {
        let spawner = Self::default();
        spawner.shut_down.store(true, Ordering::SeqCst);
        spawner
    }

    pub fn spawns(&self) -> Vec<SpawnRecord> {
        locked(&self.spawns).clone()
    }

    pub fn peers(&self) -> Vec<HandleValue> {
        locked(&self.peers).clone()
    }

    /// Events of the last process handed out.
    pub fn last_process_events(&self) -> Vec<String> {
        match locked(&self.last_events).as_ref() {
            Some(events) => locked(events).clone(),
            None => Vec::new(),
        }
    }
}

impl SpawnService for ScriptedSpawner {
    type Policy = RecordingPolicy;
    type Process = FakeProcess;

    fn create_policy(&self) -> Option<RecordingPolicy> {
        (!self.shut_down.load(Ordering::SeqCst)).then(RecordingPolicy::default)
    }

    fn spawn_target(
        &self,
        path: &Path,
        command_line: &str,
        env: &Environment,
        policy: &mut RecordingPolicy,
    ) -> SpawnOutcome<FakeProcess> {
        locked(&self.spawns).push(SpawnRecord {
            path: path.to_path_buf(),
            command_line: command_line.to_string(),
            env: env.clone(),
            policy: policy.clone(),
        });
        let outcome = locked(&self.outcomes).pop_front().unwrap_or_else(|| {
            let pid = 100 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            SpawnOutcome::spawned(FakeProcess::new(pid))
        });
        if let Some(process) = outcome.process.as_ref() {
            *locked(&self.last_events) = Some(process.event_log());
        }
        outcome
    }

    fn add_target_peer(&self, process: HandleValue) -> ResultCode {
        locked(&self.peers).push(process);
        ResultCode::ALL_OK
    }
}

/// Fixups that fail at the scripted stage.
#[derive(Debug, Default)]
pub struct ScriptedFixups {
    pub blocklist: Option<FixupError>,
    pub headers: Option<ImageHeaders>,
    pub exe_base: Option<FixupError>,
    pub restore: Option<FixupError>,
    pub restores: AtomicUsize,
}

impl ScriptedFixups {
    pub fn restore_calls(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

impl BinaryFixups<FakeProcess> for ScriptedFixups {
    fn init_dll_blocklist(&self, _path: &Path, _process: &FakeProcess, _snapshot: Option<&ImportSnapshot>) -> Result<(), FixupError> {
        match &self.blocklist {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn load_image_headers(&self, _path: &Path) -> Option<ImageHeaders> {
        self.headers.clone()
    }

    fn process_exe_base(&self, _process: &FakeProcess) -> Result<usize, FixupError> {
        match &self.exe_base {
            Some(e) => Err(e.clone()),
            None => Ok(0x1_4000_0000),
        }
    }

    fn restore_import_directory(
        &self,
        _path: &Path,
        _headers: &ImageHeaders,
        _process: &FakeProcess,
        _remote_base: usize,
    ) -> Result<(), FixupError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        match &self.restore {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct TrippableLauncher {
    tripped: AtomicBool,
}

impl TrippableLauncher {
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

impl LauncherCircuitBreaker for TrippableLauncher {
    fn disable_due_to_failure(&self) -> std::io::Result<()> {
        self.tripped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    accumulations: Mutex<Vec<(&'static str, String, u32)>>,
    scalars: Mutex<Vec<(&'static str, String, bool)>>,
}

impl RecordingTelemetry {
    pub fn accumulations(&self) -> Vec<(&'static str, String, u32)> {
        locked(&self.accumulations).clone()
    }

    pub fn scalars(&self) -> Vec<(&'static str, String, bool)> {
        locked(&self.scalars).clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn accumulate_keyed(&self, probe: &'static str, key: &str, sample: u32) {
        locked(&self.accumulations).push((probe, key.to_string(), sample));
    }

    fn scalar_set(&self, probe: &'static str, key: &str, value: bool) {
        locked(&self.scalars).push((probe, key.to_string(), value));
    }
}
