//! Tunnel manager of the tunwire agent
//!
//! Multiplexes outbound TCP connections, reverse listeners and local
//! processes over a single control channel. Each logical connection is a
//! [`Tunnel`] identified by a one-byte id.
//!
//! Everything runs from one event loop ([`Agent::serve`]): requests from the
//! controller and finished transport operations are handled one at a time
//! by the [`TunnelManager`], which is the only place tunnel state changes.

pub mod agent;
pub mod channel;
pub mod config;
mod dispatcher;
mod flow;
mod lifecycle;
pub mod manager;
pub mod registry;
pub mod transport;
pub mod tunnel;
pub mod watcher;

pub use agent::Agent;
pub use channel::{ChannelError, ChannelSender, ControlChannel};
pub use config::AgentConfig;
pub use manager::TunnelManager;
pub use registry::{Registry, RegistryError};
pub use transport::SetupError;
pub use tunnel::{Tunnel, TunnelKey, TunnelKind, TunnelState};
pub use watcher::{Completion, Watcher};

use thiserror::Error;
use tunwire_proto::CodecError;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Control channel error: {0}")]
    Codec(#[from] CodecError),

    #[error("Control channel writer failed: {0}")]
    Writer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
