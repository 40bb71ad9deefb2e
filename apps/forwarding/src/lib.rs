//! SSH local port forwarding library.
//!
//! Provides the components for forwarding local TCP ports to remote targets
//! through SSH servers.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod management;
pub mod mapping;
pub mod signal;
pub mod ssh;
pub mod state;
pub mod supervisor;

pub use config::{search_config_file, Config, ForwardingRule, SshServerSpec};
pub use engine::TunnelEngine;
pub use error::{ErrorScope, ForwardingError};
pub use events::{ColumnWidths, ForwardingEvent};
pub use management::run_management_api;
pub use mapping::{CloseReason, Mapping};
pub use signal::{shutdown_channel, ShutdownReceiver, ShutdownSender};
pub use ssh::{ConnectionLease, RusshConnector, SshConnector, SshPool, SshSession};
pub use state::{ForwardingRegistry, ForwardingState, MappingId, MappingInfo};
pub use supervisor::{RuleOutcome, Supervisor};
