//! Tunnel Protocol Definitions
//!
//! This crate defines the wire vocabulary spoken between the tunnel agent and
//! its controller: command, address-family and error-code enumerations, the
//! answer payloads produced when tunnels open, parsing of inbound requests and
//! the length-prefixed framing used on the control channel.
//!
//! Nothing in here performs I/O.

pub mod codec;
pub mod messages;

pub use codec::{ChannelCodec, CodecError};
pub use messages::*;

/// Tunnel identifier as carried on the wire
pub type TunnelId = u8;

/// Reserved identifier meaning "no tunnel id available"
///
/// Never assigned to a live tunnel.
pub const NO_TUNNEL_ID: TunnelId = 0xFF;

/// Size of the message header (`cmd` + `id`)
pub const MESSAGE_HEADER_SIZE: usize = 2;

/// Default maximum size of a single control-channel message (64KB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
