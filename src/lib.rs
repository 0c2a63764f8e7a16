// SPDX-License-Identifier: MIT

//! # gracklebroker
//!
//! Derives the confinement policy for each kind of worker child process,
//! applies it to a sandbox engine's policy object, and launches the worker
//! suspended until its post-launch integrity fixups are done.
//!
//! The engine itself is external; it is reached through
//! [`policy::target::TargetPolicy`] and [`broker::launch::SpawnService`].

pub mod broker;
pub mod config;
pub mod error;
pub mod platform;
pub mod policy;


pub use broker::{BrokerContext, SandboxBroker};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult, ProgrammerError};
pub use policy::PolicySpec;
pub use policy::kind::{LaunchContext, WorkerKind};
