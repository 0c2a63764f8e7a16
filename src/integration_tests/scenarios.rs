// SPDX-License-Identifier: MIT

//! Whole-broker runs: derive, apply and launch against the fakes.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use super::fakes::{RecordingPolicy, RecordingTelemetry, ScriptedFixups, ScriptedSpawner};
use crate::broker::cmdline::Environment;
use crate::broker::dirs::{ConfiguredDirectories, DirectoryKey};
use crate::broker::environment::{CurrentJob, StaticProbe};
use crate::broker::launch::{NoFixups, SpawnOutcome, TargetProcess};
use crate::broker::telemetry::{SANDBOX_FAILED_LAUNCH_KEYED, SANDBOX_NO_JOB, Telemetry};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, ProgrammerError};
use crate::policy::host::{Arch, HostFacts, OsVersion};
use crate::policy::levels::{IntegrityLevel, JobLevel, TokenLevel};
use crate::policy::mitigation::MitigationFlags;
use crate::policy::rules::{Access, ResourceRule};
use crate::policy::target::{HandleValue, ResultCode};
use crate::{BrokerContext, LaunchContext, SandboxBroker, WorkerKind};

const WORKER: &str = r"C:\app\worker.exe";

fn config() -> BrokerConfig {
    BrokerConfig { abort_on_programmer_error: false, debug_rules: false, ..BrokerConfig::default() }
}

fn context_on(host: HostFacts, current_job: CurrentJob, config: BrokerConfig) -> (BrokerContext, Arc<RecordingTelemetry>) {
    let telemetry = Arc::new(RecordingTelemetry::default());
    let sink: Arc<dyn Telemetry> = telemetry.clone();
    let context = BrokerContext::new(config, Box::new(StaticProbe { host, current_job }), sink);
    let dirs = HashMap::from([
        (DirectoryKey::Binary, PathBuf::from(r"C:\app")),
        (DirectoryKey::Profile, PathBuf::from(r"C:\Users\me\profile")),
        (DirectoryKey::ContentTemp, PathBuf::from(r"C:\Users\me\Temp\content")),
        (DirectoryKey::SystemTemp, PathBuf::from(r"C:\Temp")),
    ]);
    context.initialize(&ConfiguredDirectories::new(dirs));
    (context, telemetry)
}

fn context() -> (BrokerContext, Arc<RecordingTelemetry>) {
    context_on(HostFacts::modern(), CurrentJob::NotInJob, config())
}

fn applied(context: &BrokerContext, kind: WorkerKind, launch: LaunchContext) -> RecordingPolicy {
    let spawner = ScriptedSpawner::succeeding();
    let mut broker = SandboxBroker::new(context, &spawner, &NoFixups);
    broker.set_security_level(kind, launch).unwrap();
    broker.launch_app(Path::new(WORKER), &[], &Environment::default(), false, None).unwrap();
    spawner.spawns().remove(0).policy
}

#[test]
fn content_high_trust_is_fully_locked_down() {
    let (context, _) = context();
    let policy = applied(&context, WorkerKind::ContentRenderer, LaunchContext::with_trust(20));

    assert_eq!(policy.job, Some((JobLevel::Lockdown, 0)));
    assert_eq!(policy.tokens, Some((TokenLevel::RestrictedSameAccess, TokenLevel::Lockdown)));
    assert_eq!(policy.integrity, Some(IntegrityLevel::Low));
    assert_eq!(policy.delayed_integrity, Some(IntegrityLevel::Untrusted));
    assert!(policy.lockdown_dacl);
    assert!(policy.random_sid);
    assert_eq!(policy.alternate_desktop, Some(false));
    assert!(policy.initial_mitigations.contains(MitigationFlags::IMAGE_LOAD_NO_REMOTE));
    assert!(policy.rule_patterns().contains(&r"C:\app\*"));
    assert!(!policy.rule_patterns().contains(&"*"));
}

#[test]
fn file_content_process_keeps_read_access() {
    let (context, _) = context();
    let launch = LaunchContext { is_file_process: true, ..LaunchContext::with_trust(20) };
    let policy = applied(&context, WorkerKind::ContentRenderer, launch);

    assert_eq!(policy.job, Some((JobLevel::Lockdown, 0)));
    assert_eq!(policy.tokens, Some((TokenLevel::Unprotected, TokenLevel::NonAdmin)));
    assert_eq!(policy.delayed_integrity, Some(IntegrityLevel::Low));
    assert!(policy.rules.contains(&ResourceRule::new(Access::FilesAllowReadonly, "*")));
}

#[test]
fn content_lowest_trust() {
    let (context, _) = context();
    let policy = applied(&context, WorkerKind::ContentRenderer, LaunchContext::with_trust(1));

    assert_eq!(policy.job, Some((JobLevel::None, 0)));
    assert_eq!(policy.tokens, Some((TokenLevel::Unprotected, TokenLevel::NonAdmin)));
    assert!(!policy.lockdown_dacl);
    assert_eq!(policy.alternate_desktop, None);
    assert!(policy.rules.contains(&ResourceRule::new(Access::FilesAllowReadonly, "*")));
}

#[test]
fn repeated_spawn_failure_is_reported_once() {
    let (context, telemetry) = context();
    let spawner = ScriptedSpawner::with_outcomes(vec![
        SpawnOutcome::failed(ResultCode(3), 5),
        SpawnOutcome::failed(ResultCode(3), 5),
    ]);
    for _ in 0..2 {
        let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
        broker.set_security_level(WorkerKind::DecoderWorker, LaunchContext::with_trust(1)).unwrap();
        let err = broker
            .launch_app(Path::new(WORKER), &[], &Environment::default(), false, None)
            .unwrap_err();
        assert!(matches!(&err, BrokerError::Launch { key, os_error: 5, .. } if key == "decoder/0x5"));
    }
    assert_eq!(telemetry.accumulations(), vec![(SANDBOX_FAILED_LAUNCH_KEYED, "decoder/0x5".to_string(), 3)]);
}

#[test]
fn successful_launch_runs_the_target() {
    let (context, _) = context();
    let spawner = ScriptedSpawner::succeeding();
    let fixups = ScriptedFixups::default();
    let mut broker = SandboxBroker::new(&context, &spawner, &fixups);
    broker.set_security_level(WorkerKind::GpuWorker, LaunchContext::with_trust(1)).unwrap();
    let env = Environment::new([("PATH", r"C:\Windows")]).unwrap();
    let args = vec!["-gpu".to_string(), "two words".to_string()];
    let process = broker.launch_app(Path::new(WORKER), &args, &env, false, None).unwrap();

    assert_eq!(process.events(), vec!["resume", "close_thread"]);
    let spawn = spawner.spawns().remove(0);
    assert_eq!(spawn.command_line, r#"C:\app\worker.exe -gpu "two words""#);
    assert_eq!(spawn.env, env);
    assert_eq!(broker.launch_context().trust, 1);

    assert!(broker.add_target_peer(process.handle()));
    assert_eq!(spawner.peers(), vec![process.handle()]);
}

#[test]
fn logging_adds_interception_and_child_log_rules() {
    let (context, _) = context();
    let context = context.with_env_lookup(|name| (name == "GRACKLE_LOG").then(|| "timestamp:1,rotate:4".to_string()));
    let spawner = ScriptedSpawner::succeeding();
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
    broker.set_security_level(WorkerKind::NetworkWorker, LaunchContext::with_trust(1)).unwrap();
    let env = Environment::new([("GRACKLE_LOG_FILE", r"C:\logs\child-%PID")]).unwrap();
    broker.launch_app(Path::new(WORKER), &[], &env, true, None).unwrap();

    let policy = spawner.spawns().remove(0).policy;
    assert_eq!(policy.rules.iter().filter(|r| r.pattern.ends_with("dummy")).count(), 5);
    assert_eq!(policy.rules.last(), Some(&ResourceRule::new(Access::FilesAllowAny, r"C:\logs\child-*.log.?")));
}

#[test]
fn no_child_log_rule_without_module_settings() {
    let (context, _) = context();
    let context = context.with_env_lookup(|_| None);
    let spawner = ScriptedSpawner::succeeding();
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
    broker.set_security_level(WorkerKind::NetworkWorker, LaunchContext::with_trust(1)).unwrap();
    let env = Environment::new([("GRACKLE_LOG_FILE", r"C:\logs\child")]).unwrap();
    broker.launch_app(Path::new(WORKER), &[], &env, false, None).unwrap();

    let policy = spawner.spawns().remove(0).policy;
    assert!(!policy.rule_patterns().iter().any(|p| p.starts_with(r"C:\logs")));
}

#[test]
fn network_drive_drops_restricting_sids_and_remote_image_block() {
    let host = HostFacts { running_from_network_drive: true, ..HostFacts::modern() };
    let (context, _) = context_on(host, CurrentJob::NotInJob, config());
    let policy = applied(&context, WorkerKind::ContentRenderer, LaunchContext::with_trust(20));

    assert!(policy.no_restricting_sids);
    assert!(!policy.initial_mitigations.intersects(MitigationFlags::IMAGE_LOAD_RESTRICTIONS));
}

#[test]
fn job_without_breakaway_falls_back_to_no_job() {
    let win7 = HostFacts { os: Some(OsVersion::new(6, 1, 7601)), ..HostFacts::modern() };
    let (context, telemetry) = context_on(win7, CurrentJob::InJob { breakaway_ok: Some(false) }, config());
    let spawner = ScriptedSpawner::succeeding();
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
    let report = broker.set_security_level(WorkerKind::DecoderWorker, LaunchContext::with_trust(1)).unwrap();

    assert!(report.job_fallback);
    assert_eq!(telemetry.scalars(), vec![(SANDBOX_NO_JOB, "local".to_string(), true)]);
}

#[test]
fn programmer_error_is_returned_when_not_aborting() {
    let (context, _) = context();
    let spawner = ScriptedSpawner::succeeding();
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
    let err = broker.set_security_level(WorkerKind::PluginHost, LaunchContext::with_trust(0)).unwrap_err();
    assert!(matches!(err, BrokerError::Programmer(ProgrammerError::InvalidTrustLevel(0))));
}

#[test]
#[should_panic(expected = "sandbox programmer error")]
fn programmer_error_aborts_by_default() {
    let config = BrokerConfig { abort_on_programmer_error: true, ..config() };
    let (context, _) = context_on(HostFacts::modern(), CurrentJob::NotInJob, config);
    let spawner = ScriptedSpawner::succeeding();
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
    let _ = broker.set_security_level(WorkerKind::ContentRenderer, LaunchContext::with_trust(0));
}

#[test]
fn shut_down_engine_gives_no_policy() {
    let (context, _) = context();
    let spawner = ScriptedSpawner::shut_down();
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);

    assert!(!broker.has_policy());
    assert!(matches!(
        broker.set_security_level(WorkerKind::GpuWorker, LaunchContext::with_trust(1)),
        Err(BrokerError::NoPolicy)
    ));
    assert!(!broker.allow_read_file(Path::new(r"C:\data\file.txt")));
    assert!(!broker.add_target_peer(HandleValue(4)));
    let err = broker
        .launch_app(Path::new(WORKER), &[], &Environment::default(), false, None)
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoPolicy));
    assert!(spawner.spawns().is_empty());
}

#[test]
fn read_rules_use_the_device_namespace_for_shares() {
    let (context, _) = context();
    let spawner = ScriptedSpawner::succeeding();
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
    assert!(broker.allow_read_file(Path::new(r"\\server\share\file.txt")));
    broker.add_handle_to_share(HandleValue(0x44));
    broker.set_security_level(WorkerKind::GpuWorker, LaunchContext::with_trust(1)).unwrap();
    broker.launch_app(Path::new(WORKER), &[], &Environment::default(), false, None).unwrap();

    let policy = spawner.spawns().remove(0).policy;
    assert_eq!(policy.rules[0], ResourceRule::new(Access::FilesAllowReadonly, r"\??\UNC\server\share\file.txt"));
    assert_eq!(policy.shared_handles, vec![HandleValue(0x44)]);
}

#[test]
fn shutdown_drops_cached_directories() {
    let (context, _) = context();
    assert!(context.directories().get(DirectoryKey::Profile).is_some());
    context.shutdown();
    assert!(context.directories().is_empty());
}

#[test]
fn launch_without_security_level_is_refused() {
    let (context, telemetry) = context();
    let spawner = ScriptedSpawner::succeeding();
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
    let err = broker
        .launch_app(Path::new(WORKER), &[], &Environment::default(), false, None)
        .unwrap_err();
    assert!(matches!(err, BrokerError::Programmer(ProgrammerError::SecurityLevelNotSet)));
    assert!(spawner.spawns().is_empty());
    assert!(telemetry.accumulations().is_empty());
}

#[test]
#[should_panic(expected = "launch requested before a security level was applied")]
fn launch_without_security_level_aborts_by_default() {
    let config = BrokerConfig { abort_on_programmer_error: true, ..config() };
    let (context, _) = context_on(HostFacts::modern(), CurrentJob::NotInJob, config);
    let spawner = ScriptedSpawner::succeeding();
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
    let _ = broker.launch_app(Path::new(WORKER), &[], &Environment::default(), false, None);
}

#[test]
fn launch_uses_the_applied_kind() {
    let (context, telemetry) = context();
    let spawner = ScriptedSpawner::with_outcomes(vec![SpawnOutcome::failed(ResultCode(3), 5)]);
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
    broker.set_security_level(WorkerKind::GpuWorker, LaunchContext::with_trust(1)).unwrap();
    assert_eq!(broker.applied_policy().map(|spec| spec.kind), Some(WorkerKind::GpuWorker));

    let err = broker
        .launch_app(Path::new(WORKER), &[], &Environment::default(), false, None)
        .unwrap_err();
    assert!(matches!(&err, BrokerError::Launch { key, .. } if key == "gpu/0x5"));
    assert_eq!(telemetry.accumulations(), vec![(SANDBOX_FAILED_LAUNCH_KEYED, "gpu/0x5".to_string(), 3)]);
}

#[test]
fn security_level_applies_once() {
    let (context, _) = context();
    let spawner = ScriptedSpawner::succeeding();
    let mut broker = SandboxBroker::new(&context, &spawner, &NoFixups);
    broker.set_security_level(WorkerKind::GpuWorker, LaunchContext::with_trust(1)).unwrap();
    let err = broker.set_security_level(WorkerKind::PluginHost, LaunchContext::with_trust(1)).unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Programmer(ProgrammerError::SecurityLevelAlreadySet(WorkerKind::GpuWorker))
    ));
    assert_eq!(broker.applied_policy().map(|spec| spec.kind), Some(WorkerKind::GpuWorker));
}

#[test]
fn unknown_os_version_keeps_full_lockdown() {
    let host = HostFacts { os: None, arch: Arch::Aarch64, ..HostFacts::modern() };
    let in_job = CurrentJob::InJob { breakaway_ok: Some(false) };
    let (context, telemetry) = context_on(host, in_job, config());
    let policy = applied(&context, WorkerKind::ContentRenderer, LaunchContext::with_trust(20));

    assert_eq!(policy.job, Some((JobLevel::Lockdown, 0)));
    assert!(telemetry.scalars().is_empty());
    assert!(!policy.initial_mitigations.contains(MitigationFlags::CONTROL_FLOW_GUARD_DISABLE));
}
