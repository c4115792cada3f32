use super::{resolve, Outcome, Readiness, Received, SetupError};
use crate::tunnel::TunnelKey;
use crate::Watcher;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tunwire_proto::AddressFamily;

/// Connected (or connecting) TCP socket
pub struct StreamTransport {
    /// `None` until the connect finishes
    stream: Option<Arc<TcpStream>>,
    /// Pending connect or readiness wait
    op: Option<AbortHandle>,
    /// Interest of the readiness wait in flight
    armed: Option<Interest>,
    /// Tags readiness waits so a superseded one is recognised
    seq: u64,
}

impl StreamTransport {
    /// Start a non-blocking connect to `host:port`
    pub fn connect(
        key: TunnelKey,
        family: AddressFamily,
        preferred: AddressFamily,
        host: String,
        port: u16,
        watcher: &mut Watcher,
    ) -> Self {
        let op = watcher.spawn(key, async move {
            let result = async {
                let candidates = resolve(family, preferred, &host, port).await?;
                connect_first(&candidates).await
            }
            .await;
            Outcome::Connected(result)
        });

        Self {
            stream: None,
            op: Some(op),
            armed: None,
            seq: 0,
        }
    }

    /// Wrap a socket that is already connected
    pub fn established(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream: Some(Arc::new(stream)),
            op: None,
            armed: None,
            seq: 0,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    pub(super) fn absorb(&mut self, outcome: Outcome) -> Readiness {
        match outcome {
            Outcome::Connected(result) => {
                self.op = None;
                match result {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        self.stream = Some(Arc::new(stream));
                        Readiness::setup(Ok(()))
                    }
                    Err(e) => Readiness::setup(Err(e)),
                }
            }
            Outcome::Ready { seq, result } if seq == self.seq => {
                self.op = None;
                self.armed = None;
                match result {
                    Ok(ready) => Readiness {
                        readable: ready.is_readable(),
                        writable: ready.is_writable(),
                        closed: ready.is_read_closed() && ready.is_write_closed(),
                        ..Default::default()
                    },
                    Err(e) => Readiness::failed(e),
                }
            }
            // superseded by a wait with a different interest
            Outcome::Ready { .. } => Readiness::default(),
            other => {
                tracing::warn!(outcome = ?other, "Unexpected completion for stream transport");
                Readiness::default()
            }
        }
    }

    /// Keep one readiness wait in flight; write interest only while data is queued
    pub(super) fn arm(&mut self, key: TunnelKey, want_write: bool, watcher: &mut Watcher) {
        let Some(stream) = &self.stream else {
            return;
        };

        let interest = if want_write {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        if self.op.is_some() && self.armed == Some(interest) {
            return;
        }

        if let Some(op) = self.op.take() {
            op.abort();
        }
        self.seq += 1;

        let seq = self.seq;
        let stream = Arc::clone(stream);
        self.op = Some(watcher.spawn(key, async move {
            Outcome::Ready {
                seq,
                result: stream.ready(interest).await,
            }
        }));
        self.armed = Some(interest);
    }

    pub(super) fn send(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        let Some(stream) = &self.stream else {
            return Ok(0);
        };
        if buf.is_empty() {
            return Ok(0);
        }

        match stream.try_write(buf) {
            Ok(n) => {
                buf.advance(n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub(super) fn recv(&mut self, buf: &mut BytesMut, read_chunk: usize) -> io::Result<Received> {
        let Some(stream) = &self.stream else {
            return Ok(Received::Nothing);
        };

        buf.reserve(read_chunk);
        let mut limited = (&mut *buf).limit(read_chunk);
        match stream.try_read_buf(&mut limited) {
            Ok(0) => Ok(Received::EndOfStream),
            Ok(n) => Ok(Received::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Received::Nothing),
            Err(e) => Err(e),
        }
    }

    pub(super) fn cancel(&mut self) {
        if let Some(op) = self.op.take() {
            op.abort();
        }
        self.armed = None;
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn connect_first(candidates: &[SocketAddr]) -> Result<TcpStream, SetupError> {
    let mut last_error = None;

    for addr in candidates {
        match TcpStream::connect(*addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidates"))
        .into())
}
