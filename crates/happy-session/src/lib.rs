//! happy-session library crate.
//!
//! Turn coordination inside one remotely controlled agent session: the
//! mode-aware [`MessageQueue`], the [`PermissionNegotiator`] and its stdio
//! tool server, the collaborator traits for the agent backend and the relay
//! client, and the [`AgentLoop`] joining them.

pub mod agent_loop;
pub mod backend;
pub mod framing;
pub mod message_queue;
pub mod mode;
pub mod permission;
pub mod permission_server;
pub mod rpc_handlers;
pub mod session_client;

#[doc(inline)]
pub use agent_loop::AgentLoop;
#[doc(inline)]
pub use message_queue::{MessageQueue, QueueBatch, QueueError};
#[doc(inline)]
pub use mode::{EnhancedMode, PermissionMode, mode_hash};
#[doc(inline)]
pub use permission::{PermissionDecision, PermissionEvent, PermissionNegotiator, PermissionRequest};
#[doc(inline)]
pub use permission_server::PermissionToolServer;
