// SPDX-License-Identifier: MIT

//! Environment probing: host facts and whether job objects are usable.

use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::policy::host::HostFacts;

use super::telemetry::{SANDBOX_NO_JOB, Telemetry};

/// What the broker knows about the job object it is itself running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentJob {
    /// The query failed.
    Unknown,
    NotInJob,
    /// In a job; `breakaway_ok` is `None` when the limits couldn't be read.
    InJob { breakaway_ok: Option<bool> },
}

/// Source of environment facts.  The platform module supplies the real one.
pub trait HostProbe: Send + Sync {
    fn host_facts(&self) -> HostFacts;

    fn current_job(&self) -> CurrentJob;
}

/// Decide whether the target can be put in a job of its own.
///
/// Only a broker stuck inside a job without breakaway rights, on a host
/// that can't nest jobs, has to go without.  Any query failure counts as
/// usable.  Going without is recorded, keyed on whether this is a remote
/// session.
pub fn can_use_job(host: &HostFacts, current: CurrentJob, telemetry: &dyn Telemetry) -> bool {
    if host.supports_nested_jobs() {
        return true;
    }
    match current {
        CurrentJob::Unknown | CurrentJob::NotInJob => true,
        CurrentJob::InJob { breakaway_ok: None } | CurrentJob::InJob { breakaway_ok: Some(true) } => true,
        CurrentJob::InJob { breakaway_ok: Some(false) } => {
            let key = if host.remote_session { "remote" } else { "local" };
            warn!(session = key, "in a job without breakaway on a host without nested jobs; targets run without a job");
            telemetry.scalar_set(SANDBOX_NO_JOB, key, true);
            false
        }
    }
}

/// Caches the job decision for the lifetime of the broker context.
#[derive(Debug, Default)]
pub struct JobSupport {
    usable: OnceLock<bool>,
}

impl JobSupport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached decision, probing on first use.
    pub fn can_use_job(&self, probe: &dyn HostProbe, telemetry: &dyn Telemetry) -> bool {
        *self.usable.get_or_init(|| {
            let host = probe.host_facts();
            let usable = can_use_job(&host, probe.current_job(), telemetry);
            debug!(usable, "probed job object support");
            usable
        })
    }

    pub fn cached(&self) -> Option<bool> {
        self.usable.get().copied()
    }
}

/// Fixed facts, for embedders that detect the host themselves.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
    pub host: HostFacts,
    pub current_job: CurrentJob,
}

impl HostProbe for StaticProbe {
    fn host_facts(&self) -> HostFacts {
        self.host
    }

    fn current_job(&self) -> CurrentJob {
        self.current_job
    }
}
