//! happy-control daemon library
//!
//! Exposes the daemon's building blocks so the binary and the integration
//! tests drive the same code.

pub mod daemon;
