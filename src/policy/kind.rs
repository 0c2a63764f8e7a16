// SPDX-License-Identifier: MIT

//! Worker kinds and their declarative policy profiles.
//!
//! Each kind is one record of constants: level bands, hardening thresholds,
//! mitigations, composition lockdown mode, the rule list, and how the worker
//! binary is launched.  The compiler is the same for all of them.

use crate::error::ProgrammerError;

use super::levels::{IntegrityLevel as IL, JobLevel as Job, LevelBand, TokenLevel as Token};
use super::mitigation::{MitigationFlags as M, MitigationProfile, Win32kMode};
use super::rules::{self, RuleContext, RuleEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    ContentRenderer,
    GpuWorker,
    /// Remote data decoder.
    DecoderWorker,
    NetworkWorker,
    PluginHost,
    /// Host for a third-party media DRM module.
    MediaDrmHost,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 6] = [
        WorkerKind::ContentRenderer,
        WorkerKind::GpuWorker,
        WorkerKind::DecoderWorker,
        WorkerKind::NetworkWorker,
        WorkerKind::PluginHost,
        WorkerKind::MediaDrmHost,
    ];

    /// Short name used in failure telemetry keys.
    pub fn name(self) -> &'static str {
        match self {
            WorkerKind::ContentRenderer => "content",
            WorkerKind::GpuWorker => "gpu",
            WorkerKind::DecoderWorker => "decoder",
            WorkerKind::NetworkWorker => "network",
            WorkerKind::PluginHost => "plugin",
            WorkerKind::MediaDrmHost => "mediadrm",
        }
    }

    pub fn profile(self) -> &'static KindProfile {
        match self {
            WorkerKind::ContentRenderer => &CONTENT,
            WorkerKind::GpuWorker => &GPU,
            WorkerKind::DecoderWorker => &DECODER,
            WorkerKind::NetworkWorker => &NETWORK,
            WorkerKind::PluginHost => &PLUGIN,
            WorkerKind::MediaDrmHost => &MEDIA_DRM,
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Restriction level requested for a worker.  Higher is more restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrustLevel(u32);

impl TrustLevel {
    pub fn new(level: u32) -> Result<Self, ProgrammerError> {
        if level < 1 {
            return Err(ProgrammerError::InvalidTrustLevel(level));
        }
        Ok(Self(level))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

/// Per-launch facts about the worker being started.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    pub trust: u32,
    /// The content worker serves `file://` URLs and must be able to read local files.
    pub is_file_process: bool,
    /// The launch was requested through a remote broker on behalf of another process.
    pub is_remote_launch: bool,
    /// Profile directory passed to the GPU worker for its shader cache.
    pub gpu_profile_dir: Option<String>,
}

impl LaunchContext {
    pub fn with_trust(trust: u32) -> Self {
        Self { trust, ..Self::default() }
    }
}

/// How the worker executable relates to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    /// Re-executes the broker's own image.
    SameImage,
    /// A separate executable.
    Separate,
}

/// A threshold that is either unconditional or applies above a trust level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    Always,
    Above(u32),
    Never,
}

impl Threshold {
    pub fn applies(self, trust: TrustLevel) -> bool {
        match self {
            Threshold::Always => true,
            Threshold::Above(t) => trust.get() > t,
            Threshold::Never => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlternateDesktop {
    pub when: Threshold,
    pub alternate_winstation: bool,
}

/// Composition lockdown settings for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Win32kProfile {
    pub mode: Win32kMode,
    /// The lockdown is skipped on hosts without OPM redirection.
    pub requires_opm: bool,
}

pub struct KindProfile {
    pub kind: WorkerKind,
    pub bands: &'static [LevelBand],
    /// Whether the file-content clamp applies when the launch asks for it.
    pub honors_file_content: bool,
    /// Lock the default DACL and add a random restricting SID.
    pub hardening: Threshold,
    pub alternate_desktop: AlternateDesktop,
    pub mitigations: MitigationProfile,
    pub win32k: Option<Win32kProfile>,
    pub rules: fn(&RuleContext<'_>) -> Vec<RuleEntry>,
    pub binary: BinaryKind,
    /// Debug builds let the content worker keep user handles for debugging tools.
    pub debug_ui_exceptions: bool,
}

impl std::fmt::Debug for KindProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindProfile")
            .field("kind", &self.kind)
            .field("bands", &self.bands.len())
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

const BASE_DELAYED: M = M::STRICT_HANDLE_CHECKS.union(M::DLL_SEARCH_ORDER);
const LOCKED_DELAYED: M = M::STRICT_HANDLE_CHECKS
    .union(M::DYNAMIC_CODE_DISABLE)
    .union(M::DLL_SEARCH_ORDER)
    .union(M::FORCE_MS_SIGNED_BINS);
const RENDERER_ADDITIONS: M = M::EXTENSION_POINT_DISABLE.union(M::IMAGE_LOAD_PREFER_SYS32);

static CONTENT: KindProfile = KindProfile {
    kind: WorkerKind::ContentRenderer,
    bands: &[
        LevelBand::new(20, Job::Lockdown, Token::Lockdown, IL::Low, IL::Untrusted),
        LevelBand::new(4, Job::Lockdown, Token::Limited, IL::Low, IL::Low),
        LevelBand::new(3, Job::Restricted, Token::Limited, IL::Low, IL::Low),
        LevelBand::new(2, Job::Interactive, Token::Interactive, IL::Low, IL::Low),
        LevelBand::new(1, Job::None, Token::NonAdmin, IL::Low, IL::Low),
    ],
    honors_file_content: true,
    hardening: Threshold::Above(5),
    alternate_desktop: AlternateDesktop { when: Threshold::Above(4), alternate_winstation: false },
    mitigations: MitigationProfile {
        additions: RENDERER_ADDITIONS,
        image_load_restrictions_above: Some(3),
        cfg_compat_exception: true,
        delayed: BASE_DELAYED,
    },
    win32k: Some(Win32kProfile { mode: Win32kMode::FakeGdiInit, requires_opm: false }),
    rules: rules::content_rules,
    binary: BinaryKind::SameImage,
    debug_ui_exceptions: true,
};

static GPU: KindProfile = KindProfile {
    kind: WorkerKind::GpuWorker,
    bands: &[
        LevelBand::new(2, Job::None, Token::Limited, IL::Low, IL::Low),
        LevelBand::new(1, Job::None, Token::NonAdmin, IL::Low, IL::Low),
    ],
    honors_file_content: false,
    hardening: Threshold::Always,
    alternate_desktop: AlternateDesktop { when: Threshold::Never, alternate_winstation: false },
    mitigations: MitigationProfile {
        additions: M::NONE,
        image_load_restrictions_above: None,
        cfg_compat_exception: false,
        delayed: BASE_DELAYED,
    },
    win32k: None,
    rules: rules::gpu_rules,
    binary: BinaryKind::SameImage,
    debug_ui_exceptions: false,
};

static DECODER: KindProfile = KindProfile {
    kind: WorkerKind::DecoderWorker,
    bands: &[LevelBand::new(1, Job::Lockdown, Token::Lockdown, IL::Low, IL::Untrusted)],
    honors_file_content: false,
    hardening: Threshold::Always,
    alternate_desktop: AlternateDesktop { when: Threshold::Always, alternate_winstation: true },
    mitigations: MitigationProfile {
        additions: RENDERER_ADDITIONS,
        image_load_restrictions_above: None,
        cfg_compat_exception: false,
        delayed: LOCKED_DELAYED,
    },
    win32k: Some(Win32kProfile { mode: Win32kMode::FakeGdiInit, requires_opm: false }),
    rules: rules::decoder_rules,
    binary: BinaryKind::SameImage,
    debug_ui_exceptions: false,
};

static NETWORK: KindProfile = KindProfile {
    kind: WorkerKind::NetworkWorker,
    bands: &[LevelBand::new(1, Job::Lockdown, Token::Limited, IL::Low, IL::Untrusted)],
    honors_file_content: false,
    hardening: Threshold::Always,
    alternate_desktop: AlternateDesktop { when: Threshold::Always, alternate_winstation: true },
    mitigations: MitigationProfile {
        additions: RENDERER_ADDITIONS,
        image_load_restrictions_above: None,
        cfg_compat_exception: false,
        delayed: LOCKED_DELAYED,
    },
    win32k: Some(Win32kProfile { mode: Win32kMode::FakeGdiInit, requires_opm: false }),
    rules: rules::network_rules,
    binary: BinaryKind::SameImage,
    debug_ui_exceptions: false,
};

static PLUGIN: KindProfile = KindProfile {
    kind: WorkerKind::PluginHost,
    bands: &[
        LevelBand::new(3, Job::Unprotected, Token::Limited, IL::Low, IL::Low),
        LevelBand::new(2, Job::Unprotected, Token::Interactive, IL::Low, IL::Low),
        LevelBand::new(1, Job::None, Token::NonAdmin, IL::Medium, IL::Medium),
    ],
    honors_file_content: false,
    hardening: Threshold::Always,
    alternate_desktop: AlternateDesktop { when: Threshold::Never, alternate_winstation: false },
    mitigations: MitigationProfile {
        additions: M::HARDEN_TOKEN_IL_POLICY
            .union(M::EXTENSION_POINT_DISABLE)
            .union(M::NONSYSTEM_FONT_DISABLE)
            .union(M::IMAGE_LOAD_PREFER_SYS32),
        image_load_restrictions_above: Some(0),
        cfg_compat_exception: false,
        delayed: M::DLL_SEARCH_ORDER,
    },
    win32k: None,
    rules: rules::plugin_rules,
    binary: BinaryKind::Separate,
    debug_ui_exceptions: false,
};

static MEDIA_DRM: KindProfile = KindProfile {
    kind: WorkerKind::MediaDrmHost,
    bands: &[
        LevelBand::new(2, Job::Lockdown, Token::Lockdown, IL::Low, IL::Untrusted),
        LevelBand::new(1, Job::Lockdown, Token::Restricted, IL::Low, IL::Untrusted),
    ],
    honors_file_content: false,
    hardening: Threshold::Always,
    alternate_desktop: AlternateDesktop { when: Threshold::Always, alternate_winstation: true },
    mitigations: MitigationProfile {
        additions: M::EXTENSION_POINT_DISABLE,
        image_load_restrictions_above: None,
        cfg_compat_exception: false,
        delayed: BASE_DELAYED,
    },
    win32k: Some(Win32kProfile { mode: Win32kMode::ImplementOpm, requires_opm: true }),
    rules: rules::media_drm_rules,
    binary: BinaryKind::Separate,
    debug_ui_exceptions: false,
};
