// SPDX-License-Identifier: MIT

//! Launch orchestration.
//!
//! The target is always created suspended.  It only gets resumed once the
//! policy is in place and the post-launch fixups for its binary kind have
//! succeeded; any fixup failure terminates it before it ran a single
//! instruction.  A target that cannot be resumed is terminated as well.
//!
//! ```text
//! Idle -> PolicyReady -> Spawned -> PostLaunchFixupOk -> Running
//!                     |            |                 \-> ResumeFailed -> Terminated
//!                     |            \-> FixupFailed -> Terminated
//!                     \-> SpawnFailed -> Terminated
//! ```

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, error, warn};

use crate::error::{BrokerError, FixupError, FixupStage};
use crate::policy::kind::{BinaryKind, WorkerKind};
use crate::policy::target::{HandleValue, ResultCode, TargetPolicy};

use super::cmdline::Environment;
use super::telemetry::{SANDBOX_FAILED_LAUNCH_KEYED, Telemetry};

/// A launched, initially suspended target process.
pub trait TargetProcess: Send {
    fn pid(&self) -> u32;

    /// The raw process handle, for registering the target as a peer.
    fn handle(&self) -> HandleValue;

    /// Hard-kill the target.  Only the first call has an effect.
    fn terminate(&mut self, exit_code: u32) -> std::io::Result<()>;

    /// Resume the main thread.
    fn resume(&mut self) -> std::io::Result<()>;

    fn close_thread(&mut self);

    fn close_process(&mut self);
}

/// What the engine reports back from a spawn.
#[derive(Debug)]
pub struct SpawnOutcome<P> {
    pub result: ResultCode,
    pub warning: ResultCode,
    pub last_error: u32,
    pub process: Option<P>,
}

impl<P> SpawnOutcome<P> {
    pub fn failed(result: ResultCode, last_error: u32) -> Self {
        Self { result, warning: ResultCode::ALL_OK, last_error, process: None }
    }

    pub fn spawned(process: P) -> Self {
        Self { result: ResultCode::ALL_OK, warning: ResultCode::ALL_OK, last_error: 0, process: Some(process) }
    }
}

/// The sandbox engine's process creation side.
pub trait SpawnService: Send + Sync {
    type Policy: TargetPolicy;
    type Process: TargetProcess;

    /// A fresh policy object, or `None` once the engine has shut down.
    fn create_policy(&self) -> Option<Self::Policy>;

    fn spawn_target(
        &self,
        path: &Path,
        command_line: &str,
        env: &Environment,
        policy: &mut Self::Policy,
    ) -> SpawnOutcome<Self::Process>;

    /// Let targets duplicate handles into the given process.
    fn add_target_peer(&self, process: HandleValue) -> ResultCode;
}

/// Import table snapshot taken from the broker before it was patched, used
/// to seed the DLL blocklist of a same-image target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSnapshot(pub Vec<u8>);

/// Headers of an executable image, read without loading its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeaders(pub Vec<u8>);

/// Post-launch binary integrity fixups.
pub trait BinaryFixups<P: TargetProcess>: Send + Sync {
    fn init_dll_blocklist(&self, path: &Path, process: &P, snapshot: Option<&ImportSnapshot>) -> Result<(), FixupError>;

    /// `None` when the image can't be mapped as data or has no valid headers.
    fn load_image_headers(&self, path: &Path) -> Option<ImageHeaders>;

    /// Base address of the executable module inside the target.
    fn process_exe_base(&self, process: &P) -> Result<usize, FixupError>;

    fn restore_import_directory(
        &self,
        path: &Path,
        headers: &ImageHeaders,
        process: &P,
        remote_base: usize,
    ) -> Result<(), FixupError>;
}

/// Fixups for platforms where there is nothing to repair.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFixups;

impl<P: TargetProcess> BinaryFixups<P> for NoFixups {
    fn init_dll_blocklist(&self, _path: &Path, _process: &P, _snapshot: Option<&ImportSnapshot>) -> Result<(), FixupError> {
        Ok(())
    }

    fn load_image_headers(&self, _path: &Path) -> Option<ImageHeaders> {
        None
    }

    fn process_exe_base(&self, _process: &P) -> Result<usize, FixupError> {
        Ok(0)
    }

    fn restore_import_directory(&self, _: &Path, _: &ImageHeaders, _: &P, _: usize) -> Result<(), FixupError> {
        Ok(())
    }
}

/// The launcher layer in front of the broker.  Tripped when the broker can't
/// start same-image workers, so the next run skips the launcher.
pub trait LauncherCircuitBreaker: Send + Sync {
    fn disable_due_to_failure(&self) -> std::io::Result<()>;
}

/// Records the trip as a marker file the launcher checks at start-up.
#[derive(Debug, Clone)]
pub struct MarkerFileBreaker {
    pub path: PathBuf,
}

impl LauncherCircuitBreaker for MarkerFileBreaker {
    fn disable_due_to_failure(&self) -> std::io::Result<()> {
        std::fs::write(&self.path, b"disabled due to child launch failure\n")
    }
}

/// Distinct spawn failure keys seen this session.
///
/// Until [`init`](Self::init) runs every failure is reported.
#[derive(Debug, Default)]
pub struct LaunchFailureLog {
    seen: Mutex<Option<HashSet<String>>>,
}

impl LaunchFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&self) {
        let mut seen = self.lock();
        if seen.is_none() {
            *seen = Some(HashSet::new());
        }
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    /// True when this failure should be reported.  The check and the insert
    /// happen under one lock so racing launches report a key once.
    pub fn first_occurrence(&self, key: &str) -> bool {
        match self.lock().as_mut() {
            None => true,
            Some(seen) => seen.insert(key.to_string()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<HashSet<String>>> {
        match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Telemetry key for a spawn failure: worker kind and OS error in hex.
pub fn failure_key(kind: WorkerKind, last_error: u32) -> String {
    format!("{}/0x{:x}", kind.name(), last_error)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Idle,
    PolicyReady,
    Spawned,
    PostLaunchFixupOk,
    Running,
    SpawnFailed,
    FixupFailed,
    ResumeFailed,
    Terminated,
}

impl LaunchState {
    fn can_move_to(self, next: LaunchState) -> bool {
        use LaunchState::*;
        matches!(
            (self, next),
            (Idle, PolicyReady)
                | (PolicyReady, Spawned)
                | (PolicyReady, SpawnFailed)
                | (Spawned, PostLaunchFixupOk)
                | (Spawned, FixupFailed)
                | (PostLaunchFixupOk, Running)
                | (PostLaunchFixupOk, ResumeFailed)
                | (SpawnFailed, Terminated)
                | (FixupFailed, Terminated)
                | (ResumeFailed, Terminated)
        )
    }
}

/// One launch attempt's progress through the state machine.
#[derive(Debug)]
pub struct LaunchAttempt {
    kind: WorkerKind,
    state: LaunchState,
}

impl LaunchAttempt {
    pub fn new(kind: WorkerKind) -> Self {
        Self { kind, state: LaunchState::Idle }
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    fn advance(&mut self, next: LaunchState) {
        debug_assert!(self.state.can_move_to(next), "bad launch transition {:?} -> {:?}", self.state, next);
        debug!(kind = %self.kind, from = ?self.state, to = ?next, "launch state");
        self.state = next;
    }
}

/// Everything about the target except its policy.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub kind: WorkerKind,
    pub binary: BinaryKind,
    pub path: &'a Path,
    pub command_line: &'a str,
    pub env: &'a Environment,
    pub import_snapshot: Option<&'a ImportSnapshot>,
}

/// Runs a launch attempt against the collaborators.
pub struct LaunchOrchestrator<'a, S: SpawnService, F: BinaryFixups<S::Process>> {
    pub spawner: &'a S,
    pub fixups: &'a F,
    pub failures: &'a LaunchFailureLog,
    pub telemetry: &'a dyn Telemetry,
    /// Set when the broker itself was started through the launcher.
    pub launcher: Option<&'a dyn LauncherCircuitBreaker>,
}

impl<'a, S: SpawnService, F: BinaryFixups<S::Process>> LaunchOrchestrator<'a, S, F> {
    pub fn launch(
        &self,
        policy: &mut S::Policy,
        request: &LaunchRequest<'_>,
        attempt: &mut LaunchAttempt,
    ) -> Result<S::Process, BrokerError> {
        attempt.advance(LaunchState::PolicyReady);

        let outcome = self.spawner.spawn_target(request.path, request.command_line, request.env, policy);
        if !outcome.result.is_ok() {
            attempt.advance(LaunchState::SpawnFailed);
            let key = failure_key(request.kind, outcome.last_error);
            if self.failures.first_occurrence(&key) {
                self.telemetry.accumulate_keyed(SANDBOX_FAILED_LAUNCH_KEYED, &key, outcome.result.0);
            }
            error!(
                kind = %request.kind,
                result = %outcome.result,
                last_error = outcome.last_error,
                last_warning = %outcome.warning,
                "failed to spawn target"
            );
            if let Some(mut process) = outcome.process {
                discard(&mut process);
            }
            attempt.advance(LaunchState::Terminated);
            return Err(BrokerError::Launch { key, result: outcome.result, os_error: outcome.last_error });
        }
        if !outcome.warning.is_ok() {
            warn!(
                kind = %request.kind,
                last_error = outcome.last_error,
                last_warning = %outcome.warning,
                "warning on spawn target"
            );
        }

        let Some(mut process) = outcome.process else {
            attempt.advance(LaunchState::SpawnFailed);
            attempt.advance(LaunchState::Terminated);
            return Err(BrokerError::Io(std::io::Error::other("spawn reported success without a process")));
        };
        attempt.advance(LaunchState::Spawned);
        debug!(kind = %request.kind, pid = process.pid(), "target spawned suspended");

        if let Err((stage, source)) = self.apply_fixups(request, &process) {
            attempt.advance(LaunchState::FixupFailed);
            error!(kind = %request.kind, %stage, error = %source, "post-launch fixup failed");
            discard(&mut process);
            if stage == FixupStage::DllBlocklist {
                if let Some(launcher) = self.launcher {
                    if let Err(e) = launcher.disable_due_to_failure() {
                        error!(error = %e, "failed to disable the launcher");
                    }
                }
            }
            attempt.advance(LaunchState::Terminated);
            return Err(BrokerError::PostLaunchIntegrity { stage, source });
        }
        attempt.advance(LaunchState::PostLaunchFixupOk);

        if let Err(source) = process.resume() {
            attempt.advance(LaunchState::ResumeFailed);
            let pid = process.pid();
            error!(kind = %request.kind, pid, error = %source, "failed to resume target");
            discard(&mut process);
            attempt.advance(LaunchState::Terminated);
            return Err(BrokerError::ResumeFailed { pid, source });
        }
        process.close_thread();
        attempt.advance(LaunchState::Running);
        Ok(process)
    }

    fn apply_fixups(&self, request: &LaunchRequest<'_>, process: &S::Process) -> Result<(), (FixupStage, FixupError)> {
        match request.binary {
            BinaryKind::SameImage => self
                .fixups
                .init_dll_blocklist(request.path, process, request.import_snapshot)
                .map_err(|e| (FixupStage::DllBlocklist, e)),
            BinaryKind::Separate => {
                let headers = self.fixups.load_image_headers(request.path);
                let base = match self.fixups.process_exe_base(process) {
                    Ok(base) => Some(base),
                    Err(e) => {
                        error!(error = %e, "failed to find the executable module in the target");
                        None
                    }
                };
                match (headers, base) {
                    (Some(headers), Some(base)) => self
                        .fixups
                        .restore_import_directory(request.path, &headers, process, base)
                        .map_err(|e| (FixupStage::ImportDirectory, e)),
                    _ => {
                        debug!("import directory not inspected; continuing");
                        Ok(())
                    }
                }
            }
        }
    }
}

fn discard<P: TargetProcess>(process: &mut P) {
    if let Err(e) = process.terminate(1) {
        error!(pid = process.pid(), error = %e, "failed to terminate target");
    }
    process.close_thread();
    process.close_process();
}
