//! Core library for happy-control
//!
//! Shared by the daemon and session crates:
//! - [`daemon_state`]: the persisted singleton record and its claim protocol
//! - [`control`] / [`daemon_client`]: the loopback control surface
//! - [`rpc`]: the encrypted scope-prefixed dispatcher
//! - [`config`], [`home`], [`logging`]: ambient setup

pub mod config;
pub mod control;
pub mod daemon_client;
pub mod daemon_state;
pub mod error;
pub mod home;
pub mod logging;
pub mod process;
pub mod rpc;

pub use daemon_state::{DaemonState, DaemonStateFile};
pub use error::DaemonError;
