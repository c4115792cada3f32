//! Write-side backpressure
//!
//! Outbound bytes from the controller are queued on the tunnel and only reach
//! the transport once it is connected. Write interest stays armed exactly as
//! long as the queue is non-empty.

use crate::tunnel::Tunnel;
use crate::Watcher;
use std::io;

/// Queue `data` for the tunnel's transport
///
/// When the queue was empty and the tunnel is connected, an immediate send is
/// attempted and write interest is armed for whatever remains. Otherwise the
/// bytes wait: either a write watch is already pending or the tunnel is not
/// writable yet.
pub(crate) fn enqueue_write(
    tunnel: &mut Tunnel,
    data: &[u8],
    watcher: &mut Watcher,
    read_chunk: usize,
) -> io::Result<()> {
    let was_empty = tunnel.outbound.is_empty();
    tunnel.outbound.extend_from_slice(data);

    if !was_empty || !tunnel.is_connected() {
        tracing::trace!(
            tunnel_id = tunnel.id(),
            queued = tunnel.outbound.len(),
            "Outbound data queued"
        );
        return Ok(());
    }

    drain_on_writable(tunnel, watcher)?;
    tunnel.rearm(watcher, read_chunk);
    Ok(())
}

/// Send as much of the queue as the transport takes in one non-blocking call
///
/// Partial sends leave the remainder queued for the next writable signal.
pub(crate) fn drain_on_writable(tunnel: &mut Tunnel, watcher: &mut Watcher) -> io::Result<usize> {
    if tunnel.outbound.is_empty() || !tunnel.is_connected() {
        return Ok(0);
    }

    let key = tunnel.key;
    let sent = tunnel.transport.send(&mut tunnel.outbound, key, watcher)?;
    if sent > 0 {
        record_written(tunnel, sent);
    }

    Ok(sent)
}

/// Count bytes the transport has actually delivered
pub(crate) fn record_written(tunnel: &mut Tunnel, bytes: usize) {
    tunnel.bytes_out += bytes as u64;
    tracing::trace!(
        tunnel_id = tunnel.id(),
        bytes = bytes,
        remaining = tunnel.outbound.len(),
        "Outbound data sent"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{StreamTransport, Transport};
    use crate::tunnel::{TunnelKey, TunnelKind, TunnelState};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn tunnel_over(stream: TcpStream) -> Tunnel {
        Tunnel::new(
            TunnelKey { id: 1, serial: 1 },
            TunnelKind::Outbound,
            Transport::Stream(StreamTransport::established(stream)),
        )
    }

    #[tokio::test]
    async fn test_nothing_sent_before_connected() {
        let (local, mut peer) = socket_pair().await;
        let mut watcher = Watcher::new();
        let mut tunnel = tunnel_over(local);

        enqueue_write(&mut tunnel, b"first ", &mut watcher, 1024).unwrap();
        enqueue_write(&mut tunnel, b"second", &mut watcher, 1024).unwrap();
        assert_eq!(tunnel.pending_outbound(), 12);
        assert_eq!(tunnel.bytes_out(), 0);

        let mut buf = [0u8; 16];
        let early = tokio::time::timeout(Duration::from_millis(100), peer.read(&mut buf)).await;
        assert!(early.is_err(), "data reached the peer before connect");

        tunnel.state = TunnelState::Connected;
        let sent = drain_on_writable(&mut tunnel, &mut watcher).unwrap();
        assert_eq!(sent, 12);
        assert_eq!(tunnel.pending_outbound(), 0);

        let mut received = vec![0u8; 12];
        tokio::time::timeout(Duration::from_secs(5), peer.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"first second");
    }

    #[tokio::test]
    async fn test_enqueue_on_connected_sends_immediately() {
        let (local, mut peer) = socket_pair().await;
        let mut watcher = Watcher::new();
        let mut tunnel = tunnel_over(local);
        tunnel.state = TunnelState::Connected;

        enqueue_write(&mut tunnel, b"ping", &mut watcher, 1024).unwrap();
        assert_eq!(tunnel.pending_outbound(), 0);
        assert_eq!(tunnel.bytes_out(), 4);

        let mut received = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), peer.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"ping");
    }
}
