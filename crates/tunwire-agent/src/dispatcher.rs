//! Per-tunnel readiness state machine
//!
//! One completion is folded into a [`Readiness`] by the tunnel's transport,
//! then handled in a fixed order: setup (connect or bind) and accept first,
//! then writable, then readable, and close last so data already available
//! is forwarded before the peer is told the tunnel is gone.

use crate::channel::ControlChannel;
use crate::flow;
use crate::manager::TunnelManager;
use crate::transport::{Readiness, Received, SetupError, Transport};
use crate::tunnel::{TunnelKind, TunnelState};
use crate::watcher::Completion;
use std::io;
use tunwire_proto::{encode_connect_answer, Command, ErrorCode, Message, Request, TunnelId};

impl<C: ControlChannel> TunnelManager<C> {
    /// Handle one finished operation
    ///
    /// Completions armed by a tunnel that no longer exists, or by an earlier
    /// tunnel that held the same id, are discarded.
    pub fn handle_completion(&mut self, completion: Completion) {
        let Completion { key, outcome } = completion;

        let Some(tunnel) = self.registry.lookup_mut(key.id) else {
            tracing::debug!(tunnel_id = key.id, "Discarding completion for unknown tunnel");
            return;
        };
        if tunnel.key != key {
            tracing::debug!(tunnel_id = key.id, serial = key.serial, "Discarding stale completion");
            return;
        }

        let readiness = tunnel.transport.absorb(outcome);
        self.dispatch(key.id, readiness);
    }

    fn dispatch(&mut self, id: TunnelId, readiness: Readiness) {
        let Readiness {
            acceptable,
            setup,
            mut writable,
            written,
            mut readable,
            mut closed,
            error,
        } = readiness;

        if let Some(result) = setup {
            let Some(kind) = self.complete_setup(id, result) else {
                return;
            };
            // flush what queued up while pending, then pick up early inbound data
            if kind == TunnelKind::Outbound {
                writable = true;
                readable = true;
            }
        }

        if acceptable {
            self.accept_connection(id);
            if !self.registry.contains(id) {
                return;
            }
        }

        if let Some(e) = error {
            tracing::warn!(tunnel_id = id, error = %e, "Tunnel transport failed");
            self.close_with_notify(id);
            return;
        }

        if written > 0 {
            if let Some(tunnel) = self.registry.lookup_mut(id) {
                flow::record_written(tunnel, written);
            }
        }

        if writable {
            if let Err(e) = self.drain(id) {
                tracing::warn!(tunnel_id = id, error = %e, "Failed to write to tunnel");
                self.close_with_notify(id);
                return;
            }
        }

        if readable {
            match self.read_and_forward(id) {
                Ok(end_of_stream) => closed |= end_of_stream,
                Err(e) => {
                    tracing::warn!(tunnel_id = id, error = %e, "Failed to read from tunnel");
                    self.close_with_notify(id);
                    return;
                }
            }
        }

        if closed {
            tracing::debug!(tunnel_id = id, "Tunnel transport closed");
            self.close_with_notify(id);
            return;
        }

        let read_chunk = self.config.read_chunk_size;
        if let Some(tunnel) = self.registry.lookup_mut(id) {
            tunnel.rearm(&mut self.watcher, read_chunk);
        }
    }

    /// Finish a pending connect or bind and answer the peer
    ///
    /// Returns the tunnel kind when it survives, `None` once it is gone.
    fn complete_setup(
        &mut self,
        id: TunnelId,
        result: Result<(), SetupError>,
    ) -> Option<TunnelKind> {
        let tunnel = self.registry.lookup_mut(id)?;
        let kind = tunnel.kind;
        let command = match kind {
            TunnelKind::Listener => Command::Bind,
            _ => Command::Connect,
        };

        if let Err(e) = result {
            let code = e.error_code();
            tracing::warn!(tunnel_id = id, kind = %kind, error = %e, code = %code, "Tunnel setup failed");
            self.send_failure(command, id, code);
            self.close(id);
            return None;
        }

        let address = match &tunnel.transport {
            Transport::Stream(stream) => stream.peer_addr(),
            Transport::Listener(listener) => listener.local_addr(),
            Transport::Process(_) => None,
        };
        let Some(address) = address else {
            tracing::warn!(tunnel_id = id, kind = %kind, "Tunnel endpoint address unavailable");
            self.send_failure(command, id, ErrorCode::Generic);
            self.close(id);
            return None;
        };

        tunnel.state = TunnelState::Connected;
        tunnel.address = Some(address);

        match kind {
            TunnelKind::Listener => {
                tracing::info!(tunnel_id = id, local_addr = %address, "Listening")
            }
            _ => tracing::info!(tunnel_id = id, peer_addr = %address, "Connected"),
        }

        if let Err(e) = self.channel.send(command, id, encode_connect_answer(&address)) {
            tracing::warn!(tunnel_id = id, error = %e, "Failed to send answer");
        }

        Some(kind)
    }

    fn drain(&mut self, id: TunnelId) -> io::Result<usize> {
        match self.registry.lookup_mut(id) {
            Some(tunnel) => flow::drain_on_writable(tunnel, &mut self.watcher),
            None => Ok(0),
        }
    }

    /// Read one chunk and hand it to the controller straight away
    ///
    /// Returns `true` at end of stream.
    fn read_and_forward(&mut self, id: TunnelId) -> io::Result<bool> {
        let read_chunk = self.config.read_chunk_size;
        let Some(tunnel) = self.registry.lookup_mut(id) else {
            return Ok(false);
        };
        if !tunnel.is_connected() {
            return Ok(false);
        }

        match tunnel.transport.recv(&mut tunnel.inbound, read_chunk)? {
            Received::Data(n) => {
                tunnel.bytes_in += n as u64;
                tracing::trace!(tunnel_id = id, bytes = n, "Inbound data read");

                let data = tunnel.inbound.split().freeze();
                if let Err(e) = self.channel.forward_inbound(id, data) {
                    tracing::warn!(tunnel_id = id, error = %e, "Failed to forward inbound data");
                }
                Ok(false)
            }
            Received::Nothing => Ok(false),
            Received::EndOfStream => Ok(true),
        }
    }

    /// Handle one message from the controller
    ///
    /// Malformed requests are logged and dropped.
    pub fn handle_message(&mut self, message: Message) {
        let command = message.command;
        let id = message.id;
        match Request::parse(message) {
            Ok(request) => self.handle_request(request),
            Err(e) => {
                tracing::warn!(tunnel_id = id, command = ?command, error = %e, "Ignoring malformed request");
            }
        }
    }

    pub fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect {
                id,
                family,
                host,
                port,
            } => self.create_outbound(id, family, host, port),
            Request::Spawn { id, command } => self.create_process(id, &command),
            Request::Bind {
                id,
                family,
                host,
                port,
            } => self.create_listener(id, family, host, port),
            Request::Data { id, data } => self.write_to(id, &data),
            Request::Close { id } => {
                if !self.close(id) {
                    tracing::debug!(tunnel_id = id, "Close requested for unknown tunnel");
                }
            }
            Request::Ping => {
                if let Err(e) = self.channel.send_message(Message::ping()) {
                    tracing::warn!(error = %e, "Failed to answer ping");
                }
            }
        }
    }

    fn write_to(&mut self, id: TunnelId, data: &[u8]) {
        let read_chunk = self.config.read_chunk_size;
        let Some(tunnel) = self.registry.lookup_mut(id) else {
            tracing::warn!(tunnel_id = id, bytes = data.len(), "Dropping data for unknown tunnel");
            return;
        };
        if tunnel.is_server() {
            tracing::warn!(tunnel_id = id, bytes = data.len(), "Dropping data sent to a listener");
            return;
        }

        if let Err(e) = flow::enqueue_write(tunnel, data, &mut self.watcher, read_chunk) {
            tracing::warn!(tunnel_id = id, error = %e, "Failed to write to tunnel");
            self.close_with_notify(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelSender;
    use crate::config::AgentConfig;
    use crate::transport::Outcome;
    use crate::tunnel::TunnelKey;
    use tunwire_proto::AddressFamily;

    fn manager() -> (
        TunnelManager<ChannelSender>,
        tokio::sync::mpsc::UnboundedReceiver<Message>,
    ) {
        let (sender, rx) = ChannelSender::new();
        (TunnelManager::new(sender, AgentConfig::default()), rx)
    }

    #[tokio::test]
    async fn test_completion_for_unknown_tunnel_is_discarded() {
        let (mut manager, mut rx) = manager();

        manager.handle_completion(Completion {
            key: TunnelKey { id: 9, serial: 1 },
            outcome: Outcome::Exited(Err(io::ErrorKind::Other.into())),
        });

        assert!(manager.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_serial_is_discarded() {
        let (mut manager, mut rx) = manager();
        manager.create_listener(0x01, AddressFamily::Ipv4, "127.0.0.1".to_string(), 0);
        let live = manager.tunnel(0x01).unwrap().key();

        manager.handle_completion(Completion {
            key: TunnelKey {
                id: 0x01,
                serial: live.serial + 100,
            },
            outcome: Outcome::Exited(Err(io::ErrorKind::Other.into())),
        });

        let tunnel = manager.tunnel(0x01).unwrap();
        assert_eq!(tunnel.state(), TunnelState::Pending);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_data_for_unknown_tunnel_and_listener_is_dropped() {
        let (mut manager, mut rx) = manager();
        manager.create_listener(0x01, AddressFamily::Ipv4, "127.0.0.1".to_string(), 0);
        while manager.tunnel(0x01).is_some_and(|t| !t.is_connected()) {
            assert!(manager.turn().await);
        }
        let _bind_answer = rx.try_recv().unwrap();

        manager.handle_request(Request::Data {
            id: 0x01,
            data: bytes::Bytes::from_static(b"ignored"),
        });
        manager.handle_request(Request::Data {
            id: 0x42,
            data: bytes::Bytes::from_static(b"ignored"),
        });

        assert_eq!(manager.tunnel(0x01).unwrap().pending_outbound(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (mut manager, mut rx) = manager();
        manager.handle_message(Message::ping());

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.command, Command::Ping);
    }

    #[tokio::test]
    async fn test_malformed_request_is_ignored() {
        let (mut manager, mut rx) = manager();
        manager.handle_message(Message::new(Command::Connect, 0x01, vec![0x01]));

        assert!(manager.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
