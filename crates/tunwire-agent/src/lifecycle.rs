//! Tunnel creation and teardown

use crate::channel::ControlChannel;
use crate::manager::TunnelManager;
use crate::transport::{ListenerTransport, ProcessTransport, StreamTransport, Transport};
use crate::tunnel::{Tunnel, TunnelKind, TunnelState};
use bytes::Bytes;
use tunwire_proto::{
    encode_failure_answer, encode_reverse_connect, AddressFamily, Command, ErrorCode, TunnelId,
    NO_TUNNEL_ID,
};

impl<C: ControlChannel> TunnelManager<C> {
    /// Start an outbound connection for peer-assigned `id`
    ///
    /// The tunnel is registered as pending right away; the answer goes out
    /// when the connect completes.
    pub fn create_outbound(&mut self, id: TunnelId, family: AddressFamily, host: String, port: u16) {
        if !self.id_available(Command::Connect, id) {
            return;
        }

        tracing::info!(tunnel_id = id, host = %host, port = port, family = ?family, "Connecting");

        let key = self.next_key(id);
        let preferred = self.config.preferred_family;
        let transport = StreamTransport::connect(key, family, preferred, host, port, &mut self.watcher);
        let tunnel = Tunnel::new(key, TunnelKind::Outbound, Transport::Stream(transport));
        self.register(Command::Connect, tunnel);
    }

    /// Start listening on `host:port` for peer-assigned `id`
    pub fn create_listener(&mut self, id: TunnelId, family: AddressFamily, host: String, port: u16) {
        if !self.id_available(Command::Bind, id) {
            return;
        }

        tracing::info!(tunnel_id = id, host = %host, port = port, family = ?family, "Binding");

        let key = self.next_key(id);
        let preferred = self.config.preferred_family;
        let transport = ListenerTransport::bind(key, family, preferred, host, port, &mut self.watcher);
        let tunnel = Tunnel::new(key, TunnelKind::Listener, Transport::Listener(transport));
        self.register(Command::Bind, tunnel);
    }

    /// Spawn `command_line` wired to tunnel `id`
    pub fn create_process(&mut self, id: TunnelId, command_line: &str) {
        if !self.id_available(Command::Connect, id) {
            return;
        }

        let key = self.next_key(id);
        let transport = match ProcessTransport::spawn(key, command_line, &mut self.watcher) {
            Ok(transport) => transport,
            Err(e) => {
                let code = ErrorCode::from_io_error(&e);
                tracing::warn!(tunnel_id = id, command = %command_line, error = %e, code = %code, "Failed to spawn process");
                self.send_failure(Command::Connect, id, code);
                return;
            }
        };

        tracing::info!(tunnel_id = id, command = %command_line, pid = ?transport.pid(), "Process started");

        let mut tunnel = Tunnel::new(key, TunnelKind::Process, Transport::Process(transport));
        tunnel.state = TunnelState::Connected;
        if !self.register(Command::Connect, tunnel) {
            return;
        }

        if let Err(e) = self.channel.send(
            Command::Connect,
            id,
            encode_failure_answer(ErrorCode::Success),
        ) {
            tracing::warn!(tunnel_id = id, error = %e, "Failed to send process answer");
        }

        let read_chunk = self.config.read_chunk_size;
        if let Some(tunnel) = self.registry.lookup_mut(id) {
            tunnel.rearm(&mut self.watcher, read_chunk);
        }
    }

    /// Take the connection a listener just accepted and turn it into a tunnel
    ///
    /// A connection that cannot get an id is dropped; the listener stays up.
    /// The reverse-connect notification is sent before the new tunnel is
    /// armed, so it always precedes that tunnel's data.
    pub(crate) fn accept_connection(&mut self, listener_id: TunnelId) {
        let accepted = match self.registry.lookup_mut(listener_id) {
            Some(Tunnel {
                transport: Transport::Listener(listener),
                ..
            }) => listener.take_accepted(),
            _ => None,
        };
        let Some((stream, peer)) = accepted else {
            return;
        };

        let Some(new_id) = self.registry.generate_id() else {
            tracing::warn!(
                listener_id = listener_id,
                peer_addr = %peer,
                "No tunnel id available, dropping accepted connection"
            );
            return;
        };

        let key = self.next_key(new_id);
        let mut tunnel = Tunnel::new(
            key,
            TunnelKind::Accepted,
            Transport::Stream(StreamTransport::established(stream)),
        );
        tunnel.state = TunnelState::Connected;
        tunnel.address = Some(peer);
        if let Err(e) = self.registry.insert(new_id, tunnel) {
            tracing::error!(tunnel_id = new_id, error = %e, "Failed to register accepted connection");
            return;
        }

        tracing::info!(
            tunnel_id = new_id,
            listener_id = listener_id,
            peer_addr = %peer,
            "Connection accepted"
        );

        if let Err(e) = self.channel.send(
            Command::ReverseConnect,
            listener_id,
            encode_reverse_connect(new_id, &peer),
        ) {
            tracing::warn!(listener_id = listener_id, error = %e, "Failed to notify accepted connection, closing listener");
            self.close(listener_id);
        }

        let read_chunk = self.config.read_chunk_size;
        if let Some(tunnel) = self.registry.lookup_mut(new_id) {
            tunnel.rearm(&mut self.watcher, read_chunk);
        }
    }

    /// Tear tunnel `id` down without telling the peer
    ///
    /// Outstanding operations are cancelled before the tunnel leaves the
    /// registry; its transport and buffers are released when it drops.
    /// Returns `false` if no such tunnel exists.
    pub fn close(&mut self, id: TunnelId) -> bool {
        let Some(tunnel) = self.registry.lookup_mut(id) else {
            return false;
        };
        tunnel.transport.cancel();

        let Some(tunnel) = self.registry.remove(id) else {
            return false;
        };

        tracing::info!(
            tunnel_id = id,
            kind = %tunnel.kind,
            bytes_in = tunnel.bytes_in,
            bytes_out = tunnel.bytes_out,
            lifetime_ms = tunnel.created_at.elapsed().as_millis() as u64,
            "Tunnel closed"
        );

        drop(tunnel);
        true
    }

    /// Tell the peer tunnel `id` is gone, then tear it down
    ///
    /// The notification is best effort; teardown happens regardless.
    pub(crate) fn close_with_notify(&mut self, id: TunnelId) {
        if let Err(e) = self.channel.send(Command::Close, id, Bytes::new()) {
            tracing::debug!(tunnel_id = id, error = %e, "Failed to send close notification");
        }
        self.close(id);
    }

    /// Close every tunnel and cancel everything still outstanding
    pub fn destroy_all(&mut self) {
        let ids = self.registry.ids();
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Destroying all tunnels");
        }

        for id in ids {
            self.close(id);
        }
        self.watcher.shutdown();
    }

    /// Refuse a peer-assigned id that is reserved or already live
    fn id_available(&mut self, command: Command, id: TunnelId) -> bool {
        if id != NO_TUNNEL_ID && !self.registry.contains(id) {
            return true;
        }

        tracing::warn!(tunnel_id = id, command = ?command, "Refusing request for unusable tunnel id");
        self.send_failure(command, id, ErrorCode::Generic);
        false
    }

    fn register(&mut self, command: Command, tunnel: Tunnel) -> bool {
        let id = tunnel.id();
        match self.registry.insert(id, tunnel) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(tunnel_id = id, error = %e, "Failed to register tunnel");
                self.send_failure(command, id, ErrorCode::Generic);
                false
            }
        }
    }

    pub(crate) fn send_failure(&self, command: Command, id: TunnelId, code: ErrorCode) {
        if let Err(e) = self.channel.send(command, id, encode_failure_answer(code)) {
            tracing::warn!(tunnel_id = id, error = %e, "Failed to send failure answer");
        }
    }
}
