pub mod control_server;
pub mod controller;
pub mod heartbeat;
pub mod machine_rpc;
pub mod orphans;
pub mod run;
pub mod session_registry;
pub mod shutdown;
pub mod spawn;

pub use controller::DaemonController;
pub use machine_rpc::{machine_rpc_manager, register_machine_handlers};
pub use orphans::{OrphanProcess, clean_orphans, find_orphans};
pub use run::{DaemonConfig, DaemonHandle, start_daemon};
pub use session_registry::{
    SessionRegistry, SharedSessionRegistry, UpsertOutcome, new_session_registry,
};
pub use shutdown::graceful_shutdown;
