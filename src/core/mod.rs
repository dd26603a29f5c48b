// Host-side core: platform loading, configuration, the subsystem registry, and sessions.
pub mod config;
pub mod error;
pub mod host;
pub mod loader;
pub mod registry;
pub mod subsystem;
