//! Transport adapters
//!
//! Three structurally different transports sit behind [`Transport`]:
//! - `Stream`: a connected TCP socket driven by readiness waits
//! - `Listener`: a listening socket that only accepts
//! - `Process`: a child process driven by asynchronous pipe reads and writes
//!
//! Each adapter turns its raw [`Outcome`]s into a transport-neutral
//! [`Readiness`] so the dispatcher never sees pipe or socket details.

mod listener;
mod process;
mod stream;

pub use listener::ListenerTransport;
pub use process::{ProcessTransport, EXIT_DRAIN_GRACE};
pub use stream::StreamTransport;

use crate::tunnel::TunnelKey;
use crate::Watcher;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::process::ExitStatus;
use thiserror::Error;
use tokio::io::Ready;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{ChildStdin, ChildStdout};
use tunwire_proto::{AddressFamily, ErrorCode};

/// Failure while resolving, connecting or binding
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("No {family:?} address found for {host}")]
    NoAddress { host: String, family: AddressFamily },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SetupError {
    /// Protocol error code reported to the controller
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SetupError::Resolve { .. } => ErrorCode::Resolve,
            SetupError::NoAddress { .. } => ErrorCode::NotAvailable,
            SetupError::Io(e) => ErrorCode::from_io_error(e),
        }
    }
}

/// Raw result of one finished operation
#[derive(Debug)]
pub enum Outcome {
    /// Outbound connect finished
    Connected(Result<TcpStream, SetupError>),
    /// Bind finished
    Listening(Result<TcpListener, SetupError>),
    /// A listener accepted one connection
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    /// A socket readiness wait fired
    Ready { seq: u64, result: io::Result<Ready> },
    /// A pipe read finished; the pipe comes back with the data
    PipeRead {
        stdout: ChildStdout,
        result: io::Result<Bytes>,
    },
    /// A pipe write finished; the pipe comes back with the count
    PipeWritten {
        stdin: ChildStdin,
        result: io::Result<usize>,
    },
    /// The child process terminated
    Exited(io::Result<ExitStatus>),
    /// Output drain after exit ran out of time
    DrainExpired,
}

/// Transport-neutral view of what a completion means for a tunnel
#[derive(Debug, Default)]
pub struct Readiness {
    /// A connection is waiting to be taken from a listener
    pub acceptable: bool,
    /// Connect or bind finished, successfully or not
    pub setup: Option<Result<(), SetupError>>,
    pub writable: bool,
    /// Bytes a finished asynchronous write delivered
    pub written: usize,
    pub readable: bool,
    /// Peer hung up, pipe hit end of stream, or the process exited
    pub closed: bool,
    /// Mid-session transport failure
    pub error: Option<io::Error>,
}

impl Readiness {
    fn setup(result: Result<(), SetupError>) -> Self {
        Self {
            setup: Some(result),
            ..Default::default()
        }
    }

    fn failed(error: io::Error) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    fn closed() -> Self {
        Self {
            closed: true,
            ..Default::default()
        }
    }
}

/// Result of one non-blocking receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// `n` bytes appended to the buffer
    Data(usize),
    /// Nothing available right now
    Nothing,
    /// The peer will send nothing more
    EndOfStream,
}

pub enum Transport {
    Stream(StreamTransport),
    Listener(ListenerTransport),
    Process(ProcessTransport),
}

impl Transport {
    /// Fold a finished operation into the transport's state
    pub(crate) fn absorb(&mut self, outcome: Outcome) -> Readiness {
        match self {
            Transport::Stream(t) => t.absorb(outcome),
            Transport::Listener(t) => t.absorb(outcome),
            Transport::Process(t) => t.absorb(outcome),
        }
    }

    /// Make sure the waits the tunnel needs are in flight
    pub(crate) fn arm(
        &mut self,
        key: TunnelKey,
        want_write: bool,
        read_chunk: usize,
        watcher: &mut Watcher,
    ) {
        match self {
            Transport::Stream(t) => t.arm(key, want_write, watcher),
            Transport::Listener(t) => t.arm(key, watcher),
            Transport::Process(t) => t.arm(key, read_chunk, watcher),
        }
    }

    /// Hand as much of `buf` to the transport as it takes without blocking
    ///
    /// Accepted bytes are removed from the front of `buf`.
    pub(crate) fn send(
        &mut self,
        buf: &mut BytesMut,
        key: TunnelKey,
        watcher: &mut Watcher,
    ) -> io::Result<usize> {
        match self {
            Transport::Stream(t) => t.send(buf),
            Transport::Process(t) => Ok(t.send(buf, key, watcher)),
            Transport::Listener(_) => Ok(0),
        }
    }

    /// Append whatever is available to `buf`
    pub(crate) fn recv(&mut self, buf: &mut BytesMut, read_chunk: usize) -> io::Result<Received> {
        match self {
            Transport::Stream(t) => t.recv(buf, read_chunk),
            Transport::Process(t) => Ok(t.recv(buf)),
            Transport::Listener(_) => Ok(Received::Nothing),
        }
    }

    /// Abort every outstanding operation
    pub(crate) fn cancel(&mut self) {
        match self {
            Transport::Stream(t) => t.cancel(),
            Transport::Listener(t) => t.cancel(),
            Transport::Process(t) => t.cancel(),
        }
    }
}

/// Resolve `host:port` into connect/bind candidates
///
/// An explicit family filters the candidates; `Any` keeps them all but puts
/// the preferred family first.
pub(crate) async fn resolve(
    family: AddressFamily,
    preferred: AddressFamily,
    host: &str,
    port: u16,
) -> Result<Vec<SocketAddr>, SetupError> {
    let resolved: Vec<SocketAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SocketAddr::new(ip, port)],
        Err(_) => tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| SetupError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect(),
    };

    if resolved.is_empty() {
        return Err(SetupError::Resolve {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        });
    }

    let mut candidates: Vec<SocketAddr> = resolved
        .into_iter()
        .filter(|addr| family.matches(addr))
        .collect();
    if family == AddressFamily::Any {
        candidates.sort_by_key(|addr| !preferred.matches(addr));
    }

    if candidates.is_empty() {
        return Err(SetupError::NoAddress {
            host: host.to_string(),
            family,
        });
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_skips_lookup() {
        let addrs = resolve(AddressFamily::Any, AddressFamily::Any, "10.0.0.5", 80)
            .await
            .unwrap();
        assert_eq!(addrs, vec!["10.0.0.5:80".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_resolve_family_mismatch() {
        let err = resolve(AddressFamily::Ipv6, AddressFamily::Any, "10.0.0.5", 80)
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::NoAddress { .. }));
        assert_eq!(err.error_code(), ErrorCode::NotAvailable);
    }

    #[test]
    fn test_setup_error_codes() {
        let refused = SetupError::Io(io::ErrorKind::ConnectionRefused.into());
        assert_eq!(refused.error_code(), ErrorCode::ConnectionRefused);

        let resolve = SetupError::Resolve {
            host: "nowhere.invalid".to_string(),
            source: io::ErrorKind::Other.into(),
        };
        assert_eq!(resolve.error_code(), ErrorCode::Resolve);
    }
}
