// SPDX-License-Identifier: MIT

//! Resource-access rules and the fixed rule lists of each worker kind.

use tracing::error;

use crate::broker::dirs::{CachedDirectories, DirectoryKey};

use super::kind::TrustLevel;

/// The engine subsystem a rule is evaluated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Files,
    NamedPipes,
    Registry,
    Handles,
    Sync,
    Process,
    Win32kLockdown,
}

/// What a rule allows.  Each access belongs to exactly one subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    FilesAllowAny,
    FilesAllowReadonly,
    FilesAllowQuery,
    FilesAllowDirAny,
    NamedPipesAllowAny,
    RegistryAllowReadonly,
    RegistryAllowAny,
    /// Duplicate handles of the named type into the broker.
    HandlesDupBroker,
    /// Duplicate handles of the named type into any peer process.
    HandlesDupAny,
    EventsAllowAny,
    EventsAllowReadonly,
    ProcessMinExec,
    Win32kFakeGdiInit,
    Win32kImplementOpm,
}

impl Access {
    pub fn subsystem(self) -> Subsystem {
        match self {
            Access::FilesAllowAny
            | Access::FilesAllowReadonly
            | Access::FilesAllowQuery
            | Access::FilesAllowDirAny => Subsystem::Files,
            Access::NamedPipesAllowAny => Subsystem::NamedPipes,
            Access::RegistryAllowReadonly | Access::RegistryAllowAny => Subsystem::Registry,
            Access::HandlesDupBroker | Access::HandlesDupAny => Subsystem::Handles,
            Access::EventsAllowAny | Access::EventsAllowReadonly => Subsystem::Sync,
            Access::ProcessMinExec => Subsystem::Process,
            Access::Win32kFakeGdiInit | Access::Win32kImplementOpm => Subsystem::Win32kLockdown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRule {
    pub access: Access,
    /// Path, pipe, registry key or handle type name; may contain wildcards.
    pub pattern: String,
}

impl ResourceRule {
    pub fn new(access: Access, pattern: impl Into<String>) -> Self {
        Self { access, pattern: pattern.into() }
    }

    pub fn subsystem(&self) -> Subsystem {
        self.access.subsystem()
    }
}

/// How a failure to add the rule is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOrigin {
    /// Hand-written pattern; rejection is a programmer error.
    Static,
    /// Built on a cached directory; rejection is logged.
    CachedDirectory,
    /// Optional; the first rejection drops the rest of the best-effort group.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub rule: ResourceRule,
    pub origin: RuleOrigin,
}

impl RuleEntry {
    pub fn fixed(access: Access, pattern: &str) -> Self {
        Self { rule: ResourceRule::new(access, pattern), origin: RuleOrigin::Static }
    }
}

/// Build a rule from a base directory and a relative path.
/// Without a base directory there is no rule.
pub fn build_rule(access: Access, base: Option<&str>, relative: &str) -> Option<ResourceRule> {
    match base {
        None => {
            error!(relative, ?access, "tried to add rule with no base directory");
            None
        }
        Some(base) => Some(ResourceRule::new(access, format!("{base}{relative}"))),
    }
}

/// Inputs to a kind's rule list.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub trust: TrustLevel,
    pub handles_file_content: bool,
    pub remote_launch: bool,
    pub debug_rules: bool,
    pub dirs: &'a CachedDirectories,
    /// Profile directory handed to the GPU worker at launch; the cache is not
    /// populated that early.
    pub gpu_profile_dir: Option<&'a str>,
}

/// Collects a kind's rules in order.
struct RuleList<'a> {
    dirs: &'a CachedDirectories,
    entries: Vec<RuleEntry>,
}

impl<'a> RuleList<'a> {
    fn new(dirs: &'a CachedDirectories) -> Self {
        Self { dirs, entries: Vec::new() }
    }

    fn fixed(&mut self, access: Access, pattern: &str) -> &mut Self {
        self.entries.push(RuleEntry::fixed(access, pattern));
        self
    }

    fn cached(&mut self, access: Access, key: DirectoryKey, relative: &str) -> &mut Self {
        if let Some(rule) = build_rule(access, self.dirs.get(key), relative) {
            self.entries.push(RuleEntry { rule, origin: RuleOrigin::CachedDirectory });
        }
        self
    }

    fn best_effort(&mut self, rule: ResourceRule) -> &mut Self {
        self.entries.push(RuleEntry { rule, origin: RuleOrigin::BestEffort });
        self
    }

    fn ipc_pipes(&mut self) -> &mut Self {
        self.fixed(Access::FilesAllowAny, CONTROL_PIPE_PATTERN)
            .fixed(Access::FilesAllowAny, CRASH_PIPE_PATTERN)
    }

    fn dup_handles(&mut self, type_name: &str) -> &mut Self {
        self.fixed(Access::HandlesDupBroker, type_name)
            .fixed(Access::HandlesDupAny, type_name)
    }

    fn finish(self) -> Vec<RuleEntry> {
        self.entries
    }
}

/// Client side of the IPC channel pipes; keeps workers off system service pipes.
pub const CONTROL_PIPE_PATTERN: &str = r"\??\pipe\chrome.*";
/// Client side of the crash reporter pipe.
pub const CRASH_PIPE_PATTERN: &str = r"\??\pipe\gecko-crash-server-pipe.*";

const HANDLE_FILE: &str = "File";
const HANDLE_SECTION: &str = "Section";
const HANDLE_SEMAPHORE: &str = "Semaphore";

pub(crate) fn content_rules(ctx: &RuleContext<'_>) -> Vec<RuleEntry> {
    let mut list = RuleList::new(ctx.dirs);
    // Read/write to the content temp dir.  Printing needs it.
    list.cached(Access::FilesAllowAny, DirectoryKey::ContentTemp, r"\*");

    if ctx.trust.get() == 1 || ctx.handles_file_content {
        // Low integrity still can't read some files; open reads up entirely.
        list.fixed(Access::FilesAllowReadonly, "*");
    } else {
        list.cached(Access::FilesAllowReadonly, DirectoryKey::LocalAppData, r"\Microsoft\Windows\Fonts\*")
            .cached(Access::FilesAllowReadonly, DirectoryKey::Binary, r"\*")
            .cached(Access::FilesAllowReadonly, DirectoryKey::Profile, r"\chrome\*")
            .cached(Access::FilesAllowReadonly, DirectoryKey::Profile, r"\extensions\*")
            .cached(Access::FilesAllowReadonly, DirectoryKey::UserExtensionsDev, r"\*");
        if ctx.dirs.get(DirectoryKey::UserExtensionsOptional).is_some() {
            list.cached(Access::FilesAllowReadonly, DirectoryKey::UserExtensionsOptional, r"\*");
        }
    }

    list.ipc_pipes()
        .dup_handles(HANDLE_FILE)
        .dup_handles(HANDLE_SECTION)
        .dup_handles(HANDLE_SEMAPHORE);
    list.finish()
}

pub(crate) fn gpu_rules(ctx: &RuleContext<'_>) -> Vec<RuleEntry> {
    let mut list = RuleList::new(ctx.dirs);
    list.ipc_pipes();

    // Shader cache.  Missing it only costs performance.
    if let Some(profile) = ctx.gpu_profile_dir.filter(|p| !p.is_empty()) {
        let cache_dir = format!(r"{}\shader-cache", crate::broker::dirs::to_rule_path(profile));
        list.best_effort(ResourceRule::new(Access::FilesAllowDirAny, cache_dir.as_str()))
            .best_effort(ResourceRule::new(Access::FilesAllowAny, format!(r"{cache_dir}\*")));
    }

    list.dup_handles(HANDLE_SECTION);
    list.finish()
}

pub(crate) fn decoder_rules(ctx: &RuleContext<'_>) -> Vec<RuleEntry> {
    let mut list = RuleList::new(ctx.dirs);
    list.ipc_pipes()
        .fixed(Access::HandlesDupAny, HANDLE_SECTION)
        // crash reporting shares memory with the broker.
        .fixed(Access::HandlesDupBroker, HANDLE_SECTION)
        // platform codec registration lookup.
        .fixed(
            Access::RegistryAllowReadonly,
            r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Windows Media Foundation\*",
        );
    list.finish()
}

pub(crate) fn network_rules(ctx: &RuleContext<'_>) -> Vec<RuleEntry> {
    let mut list = RuleList::new(ctx.dirs);
    list.ipc_pipes()
        .fixed(Access::HandlesDupBroker, HANDLE_SECTION);
    list.finish()
}

pub(crate) fn plugin_rules(ctx: &RuleContext<'_>) -> Vec<RuleEntry> {
    let mut list = RuleList::new(ctx.dirs);
    list.cached(Access::FilesAllowAny, DirectoryKey::PluginTemp, r"\*");

    if ctx.trust.get() >= 2 {
        // Low integrity from here on; the player writes its settings under app data.
        list.cached(Access::FilesAllowAny, DirectoryKey::RoamingAppData, r"\Macromedia\Flash Player\*")
            .cached(Access::FilesAllowAny, DirectoryKey::LocalAppData, r"\Macromedia\Flash Player\*")
            .cached(Access::FilesAllowAny, DirectoryKey::RoamingAppData, r"\Adobe\Flash Player\*")
            // The parents may not exist yet.
            .cached(Access::FilesAllowDirAny, DirectoryKey::RoamingAppData, r"\Macromedia")
            .cached(Access::FilesAllowQuery, DirectoryKey::RoamingAppData, r"\Macromedia\")
            .cached(Access::FilesAllowDirAny, DirectoryKey::RoamingAppData, r"\Macromedia\Flash Player")
            .cached(Access::FilesAllowDirAny, DirectoryKey::LocalAppData, r"\Macromedia")
            .cached(Access::FilesAllowDirAny, DirectoryKey::LocalAppData, r"\Macromedia\Flash Player")
            .cached(Access::FilesAllowDirAny, DirectoryKey::RoamingAppData, r"\Adobe")
            .cached(Access::FilesAllowDirAny, DirectoryKey::RoamingAppData, r"\Adobe\Flash Player");
    }

    list.ipc_pipes()
        .fixed(Access::HandlesDupAny, HANDLE_SECTION)
        .fixed(Access::HandlesDupBroker, HANDLE_SECTION)
        // File dialog most-recently-used folders.
        .fixed(
            Access::RegistryAllowAny,
            r"HKEY_CURRENT_USER\Software\Microsoft\Windows\CurrentVersion\Explorer\ComDlg32\OpenSavePidlMRU\*",
        )
        .fixed(
            Access::RegistryAllowAny,
            r"HKEY_CURRENT_USER\Software\Microsoft\Windows\CurrentVersion\Explorer\ComDlg32\LastVisitedPidlMRULegacy\*",
        );
    list.finish()
}

/// Registry keys read while a DRM module loads.
const MEDIA_DRM_REGISTRY_KEYS: &[&str] = &[
    "HKEY_CURRENT_USER",
    r"HKEY_CURRENT_USER\Control Panel\Desktop",
    r"HKEY_CURRENT_USER\Control Panel\Desktop\LanguageConfiguration",
    r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Windows\CurrentVersion\SideBySide",
    r"HKEY_LOCAL_MACHINE\SOFTWARE\Policies\Microsoft\MUI\Settings",
    r"HKEY_CURRENT_USER\Software\Policies\Microsoft\Control Panel\Desktop",
    r"HKEY_CURRENT_USER\Control Panel\Desktop\PreferredUILanguages",
    r"HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Windows\CurrentVersion\SideBySide\PreferExternalManifest",
];

pub(crate) fn media_drm_rules(ctx: &RuleContext<'_>) -> Vec<RuleEntry> {
    let mut list = RuleList::new(ctx.dirs);
    list.ipc_pipes();

    if ctx.debug_rules {
        // IPC logging events; the host can't create named events otherwise.
        list.fixed(Access::EventsAllowAny, "ChromeIPCLog.*");
    }

    for key in MEDIA_DRM_REGISTRY_KEYS {
        list.fixed(Access::RegistryAllowReadonly, key);
    }

    // AppLocker DLL rules are evaluated through these.
    list.fixed(Access::FilesAllowReadonly, r"\Device\SrpDevice")
        .fixed(Access::RegistryAllowReadonly, r"HKEY_LOCAL_MACHINE\System\CurrentControlSet\Control\Srp\GP\")
        // Some versions have a doubled separator before GP.
        .fixed(Access::RegistryAllowReadonly, r"HKEY_LOCAL_MACHINE\System\CurrentControlSet\Control\Srp\\GP\");

    // Crash reporting shares memory with the main process, which is not our
    // broker when launched remotely.
    let target = if ctx.remote_launch { Access::HandlesDupAny } else { Access::HandlesDupBroker };
    list.fixed(target, HANDLE_SECTION);
    list.finish()
}

/// Placeholder rules so the interception code for each subsystem is set up
/// and can log.
pub fn logging_interception_rules() -> Vec<ResourceRule> {
    vec![
        ResourceRule::new(Access::NamedPipesAllowAny, "dummy"),
        ResourceRule::new(Access::ProcessMinExec, "dummy"),
        ResourceRule::new(Access::RegistryAllowReadonly, r"HKEY_CURRENT_USER\dummy"),
        ResourceRule::new(Access::EventsAllowReadonly, "dummy"),
        ResourceRule::new(Access::HandlesDupBroker, "dummy"),
    ]
}

/// Rule allowing the child to write its log file.
///
/// `file` is the log file the child was told to write, `modules` the log
/// module settings (`name:value` pairs separated by commas).  Rotation adds a
/// one-character suffix.  The PID token is only wildcarded in the file name;
/// a PID in the directory part can't be matched before the child exists.
pub fn child_log_file_rule(file: &str, modules: &str, extension: &str, pid_token: &str) -> ResourceRule {
    let mut name = format!("{file}{extension}");

    let rotate = modules
        .split(',')
        .filter_map(|m| m.trim().split_once(':'))
        .filter(|(key, _)| key.trim() == "rotate")
        .filter_map(|(_, value)| value.trim().parse::<i64>().ok())
        .last()
        .is_some_and(|v| v > 0);
    if rotate {
        name.push_str(".?");
    }

    if !pid_token.is_empty() {
        if let Some(pid_pos) = name.find(pid_token) {
            let last_slash = name.rfind(['/', '\\']);
            if last_slash.is_none_or(|slash| slash < pid_pos) {
                name.replace_range(pid_pos..pid_pos + pid_token.len(), "*");
            }
        }
    }

    ResourceRule::new(Access::FilesAllowAny, name)
}

/// Writable temp directory, for debug builds that log there.
pub fn temp_dir_rule(dirs: &CachedDirectories) -> Option<ResourceRule> {
    let temp = dirs.get(DirectoryKey::SystemTemp)?;
    let sep = if temp.ends_with('\\') { "" } else { "\\" };
    Some(ResourceRule::new(Access::FilesAllowAny, format!("{temp}{sep}*")))
}
