// SPDX-License-Identifier: MIT

//! Common error types.
//!
//! Errors fall into four groups.  Programmer errors mean a static argument or
//! level combination baked into this crate is wrong; they are never something
//! a caller can recover from.  Environment limitations are handled (and
//! logged) where they are detected and never show up here.  Launch failures
//! and post-launch integrity failures are the only ordinary failures a caller
//! sees.

use crate::policy::target::ResultCode;

/// A broken invariant in the policy derivation or its application.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgrammerError {
    #[error("trust level must be at least 1, found {0}")]
    InvalidTrustLevel(u32),

    #[error("{step} rejected with result code {result}: {message}")]
    Rejected {
        step: PolicyStep,
        result: ResultCode,
        message: &'static str,
    },

    #[error("launch requested before a security level was applied")]
    SecurityLevelNotSet,

    #[error("security level already applied for {0}")]
    SecurityLevelAlreadySet(crate::policy::kind::WorkerKind),

    #[error("composition-subsystem lockdown requested with the disable flag already set")]
    LockdownAlreadyApplied,

    #[error("initial token level {initial} is inconsistent with delayed token level {delayed}")]
    InconsistentTokenLevels {
        initial: crate::policy::levels::TokenLevel,
        delayed: crate::policy::levels::TokenLevel,
    },
}

/// The policy application step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyStep {
    JobLevel,
    TokenLevel,
    IntegrityLevel,
    DelayedIntegrityLevel,
    ProcessMitigations,
    DelayedProcessMitigations,
    Win32kLockdown,
    StaticRule,
}

impl std::fmt::Display for PolicyStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::JobLevel => "set job level",
            Self::TokenLevel => "set token level",
            Self::IntegrityLevel => "set integrity level",
            Self::DelayedIntegrityLevel => "set delayed integrity level",
            Self::ProcessMitigations => "set process mitigations",
            Self::DelayedProcessMitigations => "set delayed process mitigations",
            Self::Win32kLockdown => "add composition-subsystem lockdown",
            Self::StaticRule => "add static rule",
        })
    }
}

/// A post-launch binary fixup failed.
/// The code is the HRESULT-style value reported by the fixup collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("fixup failed with 0x{code:08X}{}", location_suffix(.location))]
pub struct FixupError {
    pub code: u32,
    pub location: Option<(&'static str, u32)>,
}

impl FixupError {
    pub fn new(code: u32) -> Self {
        Self { code, location: None }
    }

    pub fn at(code: u32, file: &'static str, line: u32) -> Self {
        Self { code, location: Some((file, line)) }
    }
}

fn location_suffix(location: &Option<(&'static str, u32)>) -> String {
    match location {
        None => String::new(),
        Some((file, line)) => format!(" at {file}:{line}"),
    }
}

/// Which post-launch fixup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupStage {
    DllBlocklist,
    ImportDirectory,
}

impl std::fmt::Display for FixupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::DllBlocklist => "dll blocklist initialization",
            Self::ImportDirectory => "import directory restoration",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("programmer error: {0}")]
    Programmer(#[from] ProgrammerError),

    #[error("failed to spawn target ({key}): result {result}, os error {os_error}")]
    Launch {
        key: String,
        result: ResultCode,
        os_error: u32,
    },

    #[error("target terminated after {stage} failed: {source}")]
    PostLaunchIntegrity {
        stage: FixupStage,
        #[source]
        source: FixupError,
    },

    #[error("target {pid} terminated after it could not be resumed: {source}")]
    ResumeFailed {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("no spawn service is available to create a policy")]
    NoPolicy,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid launch argument: {0}")]
    InvalidArgument(String),

    #[error("executable not found: {0}")]
    ExecutableNotFound(#[from] which::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// True for the failures a caller is expected to handle as ordinary results.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, Self::Launch { .. } | Self::PostLaunchIntegrity { .. } | Self::ResumeFailed { .. })
    }
}

impl From<toml::de::Error> for BrokerError {
    fn from(e: toml::de::Error) -> Self {
        BrokerError::Config(e.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
