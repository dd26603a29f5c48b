//! Purpose: Subsystem loader and COM-style component substrate shared by hosts and modules.
//! Exports: `abi` (module boundary), `component` (objects, registries, smart refs),
//! `core` (loader, config, registry, host, sessions, errors).
//! Role: Host processes link it to load subsystems; module crates link it to export objects.
//! Invariants: Nothing here keeps process-wide state; hosts pass a `Host` explicitly and
//! modules own their `ComponentRegistry` statics.
pub mod abi;
pub mod component;
pub mod core;

#[cfg(test)]
mod test_support;

pub use crate::abi::CafResult;
pub use crate::component::{InterfaceId, SmartRef};
pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::host::Host;
pub use crate::core::subsystem::SubsystemHandle;
