//! Configuration module for happy-control.
//!
//! - [`types`]: settings structs with serde defaults
//! - [`resolve`]: settings file + env override resolution

pub mod resolve;
pub mod types;

pub use resolve::{ResolvedSettings, persist_settings, resolve_settings};
pub use types::{DaemonSettings, SessionSettings, Settings};
