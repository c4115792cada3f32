use crate::transport::Transport;
use bytes::BytesMut;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use tunwire_proto::TunnelId;

/// Identifies one incarnation of a tunnel
///
/// Ids are reused once a tunnel is gone; the serial is not, so a completion
/// armed by a dead tunnel never matches its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub id: TunnelId,
    pub serial: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// Outbound TCP connection requested by the controller
    Outbound,
    /// Listening socket; only produces `Accepted` tunnels
    Listener,
    /// Connection accepted on a listener
    Accepted,
    /// Local process wired through its stdin/stdout
    Process,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelKind::Outbound => "outbound",
            TunnelKind::Listener => "listener",
            TunnelKind::Accepted => "accepted",
            TunnelKind::Process => "process",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Transport created, handshake not finished
    Pending,
    /// Handshake finished; data may flow
    Connected,
}

/// One multiplexed logical connection
pub struct Tunnel {
    pub(crate) key: TunnelKey,
    pub(crate) kind: TunnelKind,
    pub(crate) state: TunnelState,
    pub(crate) address: Option<SocketAddr>,
    /// Bytes read from the transport, not yet forwarded
    pub(crate) inbound: BytesMut,
    /// Bytes from the controller, not yet written to the transport
    pub(crate) outbound: BytesMut,
    pub(crate) transport: Transport,
    pub(crate) bytes_in: u64,
    pub(crate) bytes_out: u64,
    pub(crate) created_at: Instant,
}

impl Tunnel {
    pub(crate) fn new(key: TunnelKey, kind: TunnelKind, transport: Transport) -> Self {
        Self {
            key,
            kind,
            state: TunnelState::Pending,
            address: None,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            transport,
            bytes_in: 0,
            bytes_out: 0,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TunnelId {
        self.key.id
    }

    pub fn key(&self) -> TunnelKey {
        self.key
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == TunnelState::Connected
    }

    pub fn is_server(&self) -> bool {
        self.kind == TunnelKind::Listener
    }

    /// Resolved endpoint: the peer for connections, the bound address for listeners
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Bytes queued for the transport
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Bytes read from the transport over the tunnel's life
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Bytes written to the transport over the tunnel's life
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Arm whatever readiness waits the tunnel currently needs
    pub(crate) fn rearm(&mut self, watcher: &mut crate::Watcher, read_chunk: usize) {
        let want_write = self.is_connected() && !self.outbound.is_empty();
        self.transport
            .arm(self.key, want_write, read_chunk, watcher);
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &format_args!("{:#04x}", self.key.id))
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("address", &self.address)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}
