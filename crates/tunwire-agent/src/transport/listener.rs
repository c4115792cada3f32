use super::{resolve, Outcome, Readiness, SetupError};
use crate::tunnel::TunnelKey;
use crate::Watcher;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tunwire_proto::AddressFamily;

/// Listening socket; one accept in flight at a time
pub struct ListenerTransport {
    /// `None` until the bind finishes
    listener: Option<Arc<TcpListener>>,
    /// Pending bind or accept
    op: Option<AbortHandle>,
    /// Connection accepted but not yet taken by the manager
    accepted: Option<(TcpStream, SocketAddr)>,
}

impl ListenerTransport {
    /// Start binding `host:port`
    pub fn bind(
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
                bind_first(&candidates).await
            }
            .await;
            Outcome::Listening(result)
        });

        Self {
            listener: None,
            op: Some(op),
            accepted: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Take the connection delivered by the last accept
    pub fn take_accepted(&mut self) -> Option<(TcpStream, SocketAddr)> {
        self.accepted.take()
    }

    pub(super) fn absorb(&mut self, outcome: Outcome) -> Readiness {
        self.op = None;
        match outcome {
            Outcome::Listening(Ok(listener)) => {
                self.listener = Some(Arc::new(listener));
                Readiness::setup(Ok(()))
            }
            Outcome::Listening(Err(e)) => Readiness::setup(Err(e)),
            Outcome::Accepted(Ok(conn)) => {
                self.accepted = Some(conn);
                Readiness {
                    acceptable: true,
                    ..Default::default()
                }
            }
            Outcome::Accepted(Err(e)) => Readiness::failed(e),
            other => {
                tracing::warn!(outcome = ?other, "Unexpected completion for listener transport");
                Readiness::default()
            }
        }
    }

    pub(super) fn arm(&mut self, key: TunnelKey, watcher: &mut Watcher) {
        let Some(listener) = &self.listener else {
            return;
        };
        if self.op.is_some() || self.accepted.is_some() {
            return;
        }

        let listener = Arc::clone(listener);
        self.op = Some(watcher.spawn(key, async move {
            Outcome::Accepted(listener.accept().await)
        }));
    }

    pub(super) fn cancel(&mut self) {
        if let Some(op) = self.op.take() {
            op.abort();
        }
    }
}

impl Drop for ListenerTransport {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn bind_first(candidates: &[SocketAddr]) -> Result<TcpListener, SetupError> {
    let mut last_error = None;

    for addr in candidates {
        match TcpListener::bind(*addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Bind attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidates"))
        .into())
}
