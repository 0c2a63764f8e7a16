// SPDX-License-Identifier: MIT

//! Cached well-known directories used to build file rules.
//!
//! The directory service can only be asked from the initialising thread, so
//! the paths are looked up once, converted to the form rule patterns need,
//! and kept as an immutable snapshot.  Launches on any thread read the
//! snapshot.  A directory that could not be resolved is simply missing; the
//! rules keyed on it get skipped.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, OnceLock, RwLock},
    thread::ThreadId,
};

use serde::Deserialize;
use tracing::{debug, error};

/// Logical directory names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryKey {
    /// Installation directory holding the worker binaries.
    Binary,
    Profile,
    ContentTemp,
    PluginTemp,
    RoamingAppData,
    LocalAppData,
    UserExtensionsDev,
    UserExtensionsOptional,
    SystemTemp,
}

impl DirectoryKey {
    pub const ALL: [DirectoryKey; 9] = [
        DirectoryKey::Binary,
        DirectoryKey::Profile,
        DirectoryKey::ContentTemp,
        DirectoryKey::PluginTemp,
        DirectoryKey::RoamingAppData,
        DirectoryKey::LocalAppData,
        DirectoryKey::UserExtensionsDev,
        DirectoryKey::UserExtensionsOptional,
        DirectoryKey::SystemTemp,
    ];
}

/// Resolves logical directory names to absolute paths.
pub trait DirectoryService {
    fn get(&self, key: DirectoryKey) -> std::io::Result<PathBuf>;
}

/// Directory service backed by explicit paths, falling back to the
/// environment for the per-user directories Windows publishes there.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredDirectories {
    explicit: HashMap<DirectoryKey, PathBuf>,
}

impl ConfiguredDirectories {
    pub fn new(explicit: HashMap<DirectoryKey, PathBuf>) -> Self {
        Self { explicit }
    }

    fn from_env(&self, key: DirectoryKey) -> Option<PathBuf> {
        match key {
            DirectoryKey::LocalAppData => std::env::var_os("LOCALAPPDATA").map(PathBuf::from),
            DirectoryKey::RoamingAppData => std::env::var_os("APPDATA").map(PathBuf::from),
            DirectoryKey::SystemTemp => Some(std::env::temp_dir()),
            DirectoryKey::Binary => std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|p| p.to_path_buf())),
            _ => None,
        }
    }
}

impl DirectoryService for ConfiguredDirectories {
    fn get(&self, key: DirectoryKey) -> std::io::Result<PathBuf> {
        if let Some(path) = self.explicit.get(&key) {
            return Ok(path.clone());
        }
        self.from_env(key).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no path known for {:?}", key))
        })
    }
}

/// Convert an absolute path into the form a rule pattern accepts.
///
/// A UNC path (`\\server\share`) is not valid inside a pattern and must use
/// the device namespace (`\??\UNC\server\share`).  Extended-length prefixes
/// are mapped the same way.
pub fn to_rule_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix(r"\\?\UNC\") {
        format!(r"\??\UNC\{rest}")
    } else if let Some(rest) = path.strip_prefix(r"\\?\") {
        format!(r"\??\{rest}")
    } else if path.starts_with(r"\\") {
        // keep the leading separator, insert the namespace after it.
        format!(r"\??\UNC{}", &path[1..])
    } else {
        path.to_string()
    }
}

/// Immutable set of resolved directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedDirectories {
    paths: HashMap<DirectoryKey, String>,
}

impl CachedDirectories {
    /// Resolve every key through the service.  Failures leave the key absent.
    pub fn resolve(service: &dyn DirectoryService) -> Self {
        let mut paths = HashMap::new();
        for key in DirectoryKey::ALL {
            match service.get(key) {
                Ok(path) => match path.to_str() {
                    Some(p) => {
                        paths.insert(key, to_rule_path(p));
                    }
                    None => error!(?key, path = %path.display(), "directory path is not valid unicode; not caching"),
                },
                Err(e) => error!(?key, error = %e, "failed to get directory to cache"),
            }
        }
        Self { paths }
    }

    /// Build directly from already-converted paths.
    pub fn from_paths<I: IntoIterator<Item = (DirectoryKey, String)>>(paths: I) -> Self {
        Self { paths: paths.into_iter().map(|(k, p)| (k, to_rule_path(&p))).collect() }
    }

    pub fn get(&self, key: DirectoryKey) -> Option<&str> {
        self.paths.get(&key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Process-wide, populate-once holder for [`CachedDirectories`].
#[derive(Debug, Default)]
pub struct DirectoryCache {
    slot: RwLock<Option<Arc<CachedDirectories>>>,
    init_thread: OnceLock<ThreadId>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the cache.  Must run on the thread that owns the directory
    /// service, before any launch reads it.  Later calls are no-ops and
    /// return false.  Debug builds assert every call comes from the owning
    /// thread.
    pub fn populate(&self, service: &dyn DirectoryService) -> bool {
        let current = std::thread::current().id();
        debug_assert!(
            self.init_thread.get().is_none_or(|owner| *owner == current),
            "directory cache populated off its owning thread"
        );
        let mut slot = match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            debug!("directory cache already populated");
            return false;
        }
        let _ = self.init_thread.set(current);
        let resolved = CachedDirectories::resolve(service);
        debug!(count = resolved.len(), "cached sandbox rule directories");
        *slot = Some(Arc::new(resolved));
        true
    }

    /// The thread that populated the cache, if any.
    pub fn init_thread(&self) -> Option<ThreadId> {
        self.init_thread.get().copied()
    }

    pub fn is_populated(&self) -> bool {
        self.read().is_some()
    }

    /// The current snapshot.  Before population (or after teardown) this is empty.
    pub fn snapshot(&self) -> Arc<CachedDirectories> {
        self.read().unwrap_or_default()
    }

    /// Drop the cached paths at shutdown.
    pub fn clear(&self) {
        let mut slot = match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
    }

    fn read(&self) -> Option<Arc<CachedDirectories>> {
        match self.slot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
