// SPDX-License-Identifier: MIT

//! OS backends: handles for launched targets and detection of host facts.
//!
//! The sandbox engine that actually creates targets lives outside this
//! crate.  Its spawn service wraps the raw process it created in the native
//! target type here.

#[cfg(target_os = "windows")]
mod native_windows;

#[cfg(target_os = "windows")]
pub use native_windows::{SystemProbe, WinTargetProcess as NativeProcess, std_handles};

#[cfg(unix)]
mod native_unix;

#[cfg(unix)]
pub use native_unix::{SystemProbe, UnixTargetProcess as NativeProcess, std_handles};
