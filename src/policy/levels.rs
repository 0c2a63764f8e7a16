// SPDX-License-Identifier: MIT

//! The policy level table.
//!
//! Each worker kind declares its levels as bands keyed by a minimum trust
//! level.  Bands are evaluated from the highest threshold down and the first
//! match wins, so the table is total as long as the lowest band starts at 1.
//!
//! The level enums are declared from the most restrictive value to the least,
//! so the derived ordering reads as "tighter < looser".

use crate::error::ProgrammerError;

use super::kind::TrustLevel;

/// Job object containment level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobLevel {
    Lockdown,
    Restricted,
    LimitedUser,
    Interactive,
    Unprotected,
    None,
}

/// Access token reduction level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenLevel {
    Lockdown,
    Restricted,
    Limited,
    Interactive,
    NonAdmin,
    RestrictedSameAccess,
    Unprotected,
}

impl std::fmt::Display for TokenLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Mandatory integrity level, from most trusted to least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntegrityLevel {
    System,
    High,
    Medium,
    MediumLow,
    Low,
    BelowLow,
    Untrusted,
}

/// The level fields of a policy, before the cross-cutting clamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSet {
    pub job: JobLevel,
    pub initial_token: TokenLevel,
    pub delayed_token: TokenLevel,
    pub initial_integrity: IntegrityLevel,
    pub delayed_integrity: IntegrityLevel,
}

/// One row of a kind's level table.
/// The initial token is not part of the band; it follows from the delayed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelBand {
    pub min_trust: u32,
    pub job: JobLevel,
    pub delayed_token: TokenLevel,
    pub initial_integrity: IntegrityLevel,
    pub delayed_integrity: IntegrityLevel,
}

impl LevelBand {
    pub const fn new(
        min_trust: u32,
        job: JobLevel,
        delayed_token: TokenLevel,
        initial_integrity: IntegrityLevel,
        delayed_integrity: IntegrityLevel,
    ) -> Self {
        Self { min_trust, job, delayed_token, initial_integrity, delayed_integrity }
    }
}

/// Find the band for the trust level.  Bands must be sorted by descending threshold.
pub fn select_band(bands: &[LevelBand], trust: TrustLevel) -> Result<&LevelBand, ProgrammerError> {
    debug_assert!(
        bands.windows(2).all(|w| w[0].min_trust > w[1].min_trust),
        "level bands must be strictly descending"
    );
    bands
        .iter()
        .find(|b| trust.get() >= b.min_trust)
        .ok_or(ProgrammerError::InvalidTrustLevel(trust.get()))
}

/// The initial token that goes with a delayed token.
///
/// A delayed token at non-admin or looser means the worker isn't really
/// token-restricted, and a restricted initial token interferes with running
/// from a network drive.
pub fn initial_token_for(delayed: TokenLevel) -> TokenLevel {
    if delayed >= TokenLevel::NonAdmin {
        TokenLevel::Unprotected
    } else {
        TokenLevel::RestrictedSameAccess
    }
}

/// Check a (initial, delayed) token pair against [`initial_token_for`].
pub fn check_token_pair(initial: TokenLevel, delayed: TokenLevel) -> Result<(), ProgrammerError> {
    if initial_token_for(delayed) == initial {
        Ok(())
    } else {
        Err(ProgrammerError::InconsistentTokenLevels { initial, delayed })
    }
}

/// Workers that read arbitrary local files can't run with settings that block reads.
pub fn clamp_for_file_content(levels: LevelSet) -> LevelSet {
    let delayed_token = levels.delayed_token.max(TokenLevel::NonAdmin);
    LevelSet {
        delayed_token,
        initial_token: initial_token_for(delayed_token),
        delayed_integrity: levels.delayed_integrity.min(IntegrityLevel::Low),
        ..levels
    }
}

/// Resolve the full level set for the trust level.
pub fn resolve_levels(
    bands: &[LevelBand],
    trust: TrustLevel,
    handles_file_content: bool,
) -> Result<LevelSet, ProgrammerError> {
    let band = select_band(bands, trust)?;
    let mut levels = LevelSet {
        job: band.job,
        initial_token: initial_token_for(band.delayed_token),
        delayed_token: band.delayed_token,
        initial_integrity: band.initial_integrity,
        delayed_integrity: band.delayed_integrity,
    };
    if handles_file_content {
        levels = clamp_for_file_content(levels);
    }
    check_token_pair(levels.initial_token, levels.delayed_token)?;
    Ok(levels)
}
