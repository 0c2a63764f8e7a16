// SPDX-License-Identifier: MIT

//! Broker configuration.
//!
//! Read from a TOML file (the path in `GRACKLE_BROKER_CONFIG`), then
//! individual `GRACKLE_BROKER_*` environment variables override single
//! fields.  A missing file means defaults.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::broker::dirs::DirectoryKey;
use crate::error::BrokerError;
use crate::policy::kind::WorkerKind;

/// Names the configuration file.
pub const CONFIG_PATH_VAR: &str = "GRACKLE_BROKER_CONFIG";

const ENV_PREFIX: &str = "GRACKLE_BROKER_";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Panic on a programmer error instead of returning it.
    pub abort_on_programmer_error: bool,

    /// Debug-only rules: writable temp dir, IPC log events, job UI handles.
    pub debug_rules: bool,

    /// The broker was started through the launcher layer.
    pub behind_launcher: bool,

    /// Marker file written when the launcher has to be disabled.
    pub launcher_disable_marker: Option<PathBuf>,

    pub lockdown: LockdownConfig,

    pub child_logging: ChildLoggingConfig,

    /// Explicit paths for logical directories.
    pub directories: HashMap<DirectoryKey, PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            abort_on_programmer_error: true,
            debug_rules: cfg!(debug_assertions),
            behind_launcher: false,
            launcher_disable_marker: None,
            lockdown: LockdownConfig::default(),
            child_logging: ChildLoggingConfig::default(),
            directories: HashMap::new(),
        }
    }
}

/// Composition-subsystem lockdown per kind.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockdownConfig {
    pub content: bool,
    pub decoder: bool,
    pub network: bool,
    pub media_drm: bool,
}

impl LockdownConfig {
    pub fn enabled_for(&self, kind: WorkerKind) -> bool {
        match kind {
            WorkerKind::ContentRenderer => self.content,
            WorkerKind::DecoderWorker => self.decoder,
            WorkerKind::NetworkWorker => self.network,
            WorkerKind::MediaDrmHost => self.media_drm,
            WorkerKind::GpuWorker | WorkerKind::PluginHost => false,
        }
    }
}

/// Where a child writes its log file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChildLoggingConfig {
    /// Child environment variables naming the log file; the first set wins.
    pub file_vars: Vec<String>,
    /// Broker environment variable holding the log module settings.
    pub modules_var: String,
    pub extension: String,
    /// Replaced by the child's process id in its log file name.
    pub pid_token: String,
}

impl Default for ChildLoggingConfig {
    fn default() -> Self {
        Self {
            file_vars: vec!["GRACKLE_LOG_FILE".to_string(), "GRACKLE_LOG_FILE_LEGACY".to_string()],
            modules_var: "GRACKLE_LOG".to_string(),
            extension: ".log".to_string(),
            pid_token: "%PID".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn from_toml(contents: &str) -> Result<Self, BrokerError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load from a file.  A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents).map_err(|e| match e {
                BrokerError::Config(msg) => BrokerError::Config(format!("{}: {msg}", path.display())),
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no broker config file; using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load using the process environment.
    pub fn from_env() -> Result<Self, BrokerError> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Load using the given variable lookup.
    pub fn from_env_with<F: Fn(&str) -> Option<String>>(get: F) -> Result<Self, BrokerError> {
        let mut config = match get(CONFIG_PATH_VAR) {
            Some(path) if !path.is_empty() => Self::load(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env_overrides(get);
        Ok(config)
    }

    /// Override single fields from `GRACKLE_BROKER_<FIELD>` variables.
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides<F: Fn(&str) -> Option<String>>(&mut self, get: F) {
        let flag = |name: &str, target: &mut bool| {
            let var = format!("{ENV_PREFIX}{name}");
            if let Some(value) = get(&var) {
                match parse_bool(&value) {
                    Some(v) => *target = v,
                    None => warn!(%var, %value, "ignoring unparseable boolean override"),
                }
            }
        };
        flag("ABORT_ON_PROGRAMMER_ERROR", &mut self.abort_on_programmer_error);
        flag("DEBUG_RULES", &mut self.debug_rules);
        flag("BEHIND_LAUNCHER", &mut self.behind_launcher);
        flag("LOCKDOWN_CONTENT", &mut self.lockdown.content);
        flag("LOCKDOWN_DECODER", &mut self.lockdown.decoder);
        flag("LOCKDOWN_NETWORK", &mut self.lockdown.network);
        flag("LOCKDOWN_MEDIA_DRM", &mut self.lockdown.media_drm);

        if let Some(marker) = get(&format!("{ENV_PREFIX}LAUNCHER_DISABLE_MARKER")) {
            self.launcher_disable_marker = (!marker.is_empty()).then(|| PathBuf::from(marker));
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
