//! Protocol message types
//!
//! Every message on the control channel is `cmd:u8 | id:u8 | payload`. The
//! payload layout depends on the command and on the direction:
//!
//! ```text
//! controller -> agent
//!   Connect / Bind   af:u8 | port:u16be | host or command line [| 0x00]
//!   Data             raw bytes
//!   Close / Ping     empty
//!
//! agent -> controller
//!   Connect / Bind   err:u8 [| af:u8 | port:u16be | addr:4 or 16]
//!   ReverseConnect   new_id:u8 | err:u8 | af:u8 | port:u16be | addr:4 or 16
//!   Data             raw bytes
//!   Close / Ping     empty
//! ```

use crate::{TunnelId, MESSAGE_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Length of a connect answer carrying an IPv4 endpoint
pub const CONNECT_ANSWER_V4_LEN: usize = 8;

/// Length of a connect answer carrying an IPv6 endpoint
pub const CONNECT_ANSWER_V6_LEN: usize = 20;

/// Protocol errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown command: {0:#04x}")]
    UnknownCommand(u8),

    #[error("Unknown address family: {0:#04x}")]
    UnknownAddressFamily(u8),

    #[error("Unknown error code: {0:#04x}")]
    UnknownErrorCode(u8),

    #[error("Truncated {what}: {len} bytes")]
    Truncated { what: &'static str, len: usize },

    #[error("Invalid host name: {0}")]
    InvalidHost(String),

    #[error("Unexpected {0:?} message from controller")]
    UnexpectedCommand(Command),
}

/// Command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Open an outbound connection or spawn a process; also its answer
    Connect = 0x00,
    /// Tunnel closed
    Close = 0x01,
    /// Tunnel payload
    Data = 0x02,
    /// Keepalive
    Ping = 0x03,
    /// Open a listening socket; also its answer
    Bind = 0x04,
    /// A listener accepted a connection
    ReverseConnect = 0x05,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Command::Connect),
            0x01 => Ok(Command::Close),
            0x02 => Ok(Command::Data),
            0x03 => Ok(Command::Ping),
            0x04 => Ok(Command::Bind),
            0x05 => Ok(Command::ReverseConnect),
            _ => Err(ProtocolError::UnknownCommand(value)),
        }
    }
}

/// Address family tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AddressFamily {
    #[default]
    Any = 0x00,
    Ipv4 = 0x01,
    Ipv6 = 0x02,
}

impl AddressFamily {
    /// Family of a concrete endpoint
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Whether `addr` satisfies this family constraint
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            family => *family == Self::of(addr),
        }
    }
}

impl TryFrom<u8> for AddressFamily {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AddressFamily::Any),
            0x01 => Ok(AddressFamily::Ipv4),
            0x02 => Ok(AddressFamily::Ipv6),
            _ => Err(ProtocolError::UnknownAddressFamily(value)),
        }
    }
}

/// Error codes carried by answer messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0x00,
    Generic = 0x01,
    BadMessage = 0x02,
    ConnectionRefused = 0x03,
    Forbidden = 0x04,
    NotAvailable = 0x05,
    Resolve = 0x06,
    NotFound = 0x07,
}

impl ErrorCode {
    /// Map an OS-level transport error onto the protocol taxonomy
    ///
    /// Total and deterministic: anything without a dedicated code is
    /// reported as [`ErrorCode::Generic`]. Name resolution failures are not
    /// visible through [`io::ErrorKind`] and are mapped by the caller that
    /// performed the lookup.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => ErrorCode::Forbidden,
            io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            io::ErrorKind::AddrNotAvailable => ErrorCode::NotAvailable,
            _ => ErrorCode::Generic,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ErrorCode::Success
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::Generic => "generic error",
            ErrorCode::BadMessage => "bad message",
            ErrorCode::ConnectionRefused => "connection refused",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotAvailable => "address not available",
            ErrorCode::Resolve => "name resolution failed",
            ErrorCode::NotFound => "not found",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ErrorCode::Success),
            0x01 => Ok(ErrorCode::Generic),
            0x02 => Ok(ErrorCode::BadMessage),
            0x03 => Ok(ErrorCode::ConnectionRefused),
            0x04 => Ok(ErrorCode::Forbidden),
            0x05 => Ok(ErrorCode::NotAvailable),
            0x06 => Ok(ErrorCode::Resolve),
            0x07 => Ok(ErrorCode::NotFound),
            _ => Err(ProtocolError::UnknownErrorCode(value)),
        }
    }
}

/// A single control-channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub id: TunnelId,
    pub payload: Bytes,
}

impl Message {
    pub fn new(command: Command, id: TunnelId, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            id,
            payload: payload.into(),
        }
    }

    pub fn data(id: TunnelId, data: Bytes) -> Self {
        Self::new(Command::Data, id, data)
    }

    pub fn close(id: TunnelId) -> Self {
        Self::new(Command::Close, id, Bytes::new())
    }

    pub fn ping() -> Self {
        Self::new(Command::Ping, 0, Bytes::new())
    }

    /// Size of the encoded message, without any framing
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.payload.len()
    }

    /// Append `cmd | id | payload` to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.command as u8);
        dst.put_u8(self.id);
        dst.extend_from_slice(&self.payload);
    }

    /// Decode one message from an unframed body
    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                what: "message header",
                len: body.len(),
            });
        }

        let command = Command::try_from(body.get_u8())?;
        let id = body.get_u8();

        Ok(Self {
            command,
            id,
            payload: body,
        })
    }
}

/// Requests the controller can make of the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Connect to `host:port`
    Connect {
        id: TunnelId,
        family: AddressFamily,
        host: String,
        port: u16,
    },
    /// Spawn `command` with its stdin/stdout wired to the tunnel
    Spawn { id: TunnelId, command: String },
    /// Listen on `host:port`; port 0 asks for an ephemeral port
    Bind {
        id: TunnelId,
        family: AddressFamily,
        host: String,
        port: u16,
    },
    /// Bytes to write to the tunnel's transport
    Data { id: TunnelId, data: Bytes },
    /// Tear the tunnel down
    Close { id: TunnelId },
    /// Keepalive
    Ping,
}

impl Request {
    /// Interpret a message received from the controller
    pub fn parse(message: Message) -> Result<Self, ProtocolError> {
        let id = message.id;
        match message.command {
            Command::Connect => {
                let (family, host, port) = parse_open(message.payload)?;
                if port == 0 {
                    Ok(Request::Spawn { id, command: host })
                } else {
                    Ok(Request::Connect {
                        id,
                        family,
                        host,
                        port,
                    })
                }
            }
            Command::Bind => {
                let (family, host, port) = parse_open(message.payload)?;
                Ok(Request::Bind {
                    id,
                    family,
                    host,
                    port,
                })
            }
            Command::Data => Ok(Request::Data {
                id,
                data: message.payload,
            }),
            Command::Close => Ok(Request::Close { id }),
            Command::Ping => Ok(Request::Ping),
            Command::ReverseConnect => Err(ProtocolError::UnexpectedCommand(Command::ReverseConnect)),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        match request {
            Request::Connect {
                id,
                family,
                host,
                port,
            } => Message::new(Command::Connect, id, open_payload(family, &host, port)),
            Request::Spawn { id, command } => Message::new(
                Command::Connect,
                id,
                open_payload(AddressFamily::Any, &command, 0),
            ),
            Request::Bind {
                id,
                family,
                host,
                port,
            } => Message::new(Command::Bind, id, open_payload(family, &host, port)),
            Request::Data { id, data } => Message::data(id, data),
            Request::Close { id } => Message::close(id),
            Request::Ping => Message::ping(),
        }
    }
}

fn open_payload(family: AddressFamily, host: &str, port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + host.len());
    buf.put_u8(family as u8);
    buf.put_u16(port);
    buf.extend_from_slice(host.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

fn parse_open(mut payload: Bytes) -> Result<(AddressFamily, String, u16), ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::Truncated {
            what: "open request",
            len: payload.len(),
        });
    }

    let family = AddressFamily::try_from(payload.get_u8())?;
    let port = payload.get_u16();

    // host is NUL terminated by most peers, but the frame length is authoritative
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    let host = std::str::from_utf8(&payload[..end])
        .map_err(|_| ProtocolError::InvalidHost(String::from_utf8_lossy(&payload[..end]).into()))?
        .trim()
        .to_string();

    if host.is_empty() {
        return Err(ProtocolError::InvalidHost(host));
    }

    Ok((family, host, port))
}

fn put_endpoint(buf: &mut BytesMut, addr: &SocketAddr) {
    buf.put_u8(ErrorCode::Success as u8);
    buf.put_u8(AddressFamily::of(addr) as u8);
    buf.put_u16(addr.port());
    match addr.ip() {
        IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
    }
}

/// Successful connect/bind answer for `addr` (8 bytes for IPv4, 20 for IPv6)
pub fn encode_connect_answer(addr: &SocketAddr) -> Bytes {
    let mut buf = BytesMut::with_capacity(CONNECT_ANSWER_V6_LEN);
    put_endpoint(&mut buf, addr);
    buf.freeze()
}

/// Failed connect/bind answer: the error code alone
pub fn encode_failure_answer(code: ErrorCode) -> Bytes {
    Bytes::copy_from_slice(&[code as u8])
}

/// Reverse-connect notification: the new tunnel id followed by a connect answer
pub fn encode_reverse_connect(new_id: TunnelId, peer: &SocketAddr) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + CONNECT_ANSWER_V6_LEN);
    buf.put_u8(new_id);
    put_endpoint(&mut buf, peer);
    buf.freeze()
}

/// Decoded connect/bind answer, as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAnswer {
    pub error: ErrorCode,
    pub address: Option<SocketAddr>,
}

impl ConnectAnswer {
    pub fn decode(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::Truncated {
                what: "connect answer",
                len: 0,
            });
        }

        let error = ErrorCode::try_from(payload.get_u8())?;
        if payload.is_empty() {
            return Ok(Self {
                error,
                address: None,
            });
        }

        if payload.len() < 3 {
            return Err(ProtocolError::Truncated {
                what: "connect answer",
                len: payload.len() + 1,
            });
        }
        let family = AddressFamily::try_from(payload.get_u8())?;
        let port = payload.get_u16();

        let ip = match family {
            AddressFamily::Ipv4 if payload.len() >= 4 => {
                let mut octets = [0u8; 4];
                payload.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            AddressFamily::Ipv6 if payload.len() >= 16 => {
                let mut octets = [0u8; 16];
                payload.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            AddressFamily::Any => return Err(ProtocolError::UnknownAddressFamily(0)),
            _ => {
                return Err(ProtocolError::Truncated {
                    what: "answer address",
                    len: payload.len(),
                })
            }
        };

        Ok(Self {
            error,
            address: Some(SocketAddr::new(ip, port)),
        })
    }
}

/// Decoded reverse-connect notification, as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseConnect {
    pub new_id: TunnelId,
    pub answer: ConnectAnswer,
}

impl ReverseConnect {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (&new_id, rest) = payload.split_first().ok_or(ProtocolError::Truncated {
            what: "reverse connect",
            len: 0,
        })?;
        Ok(Self {
            new_id,
            answer: ConnectAnswer::decode(rest)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_connect_answer_layout() {
        let addr: SocketAddr = "10.0.0.5:80".parse().unwrap();
        let answer = encode_connect_answer(&addr);

        assert_eq!(answer.len(), CONNECT_ANSWER_V4_LEN);
        assert_eq!(&answer[..], &[0x00, 0x01, 0x00, 0x50, 10, 0, 0, 5]);
    }

    #[test]
    fn test_ipv6_connect_answer_layout() {
        let addr: SocketAddr = "[2001:db8::1]:8443".parse().unwrap();
        let answer = encode_connect_answer(&addr);

        assert_eq!(answer.len(), CONNECT_ANSWER_V6_LEN);
        assert_eq!(answer[0], ErrorCode::Success as u8);
        assert_eq!(answer[1], AddressFamily::Ipv6 as u8);
        assert_eq!(u16::from_be_bytes([answer[2], answer[3]]), 8443);

        let decoded = ConnectAnswer::decode(&answer).unwrap();
        assert_eq!(decoded.address, Some(addr));
    }

    #[test]
    fn test_failure_answer_is_one_byte() {
        let answer = encode_failure_answer(ErrorCode::ConnectionRefused);
        assert_eq!(&answer[..], &[0x03]);

        let decoded = ConnectAnswer::decode(&answer).unwrap();
        assert_eq!(decoded.error, ErrorCode::ConnectionRefused);
        assert_eq!(decoded.address, None);
    }

    #[test]
    fn test_reverse_connect_prepends_new_id() {
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let payload = encode_reverse_connect(0x03, &peer);

        assert_eq!(payload.len(), 1 + CONNECT_ANSWER_V4_LEN);
        assert_eq!(payload[0], 0x03);

        let decoded = ReverseConnect::decode(&payload).unwrap();
        assert_eq!(decoded.new_id, 0x03);
        assert_eq!(decoded.answer.address, Some(peer));
    }

    #[test]
    fn test_error_mapping() {
        use io::ErrorKind::*;

        let cases = [
            (PermissionDenied, ErrorCode::Forbidden),
            (ConnectionRefused, ErrorCode::ConnectionRefused),
            (AddrNotAvailable, ErrorCode::NotAvailable),
            (TimedOut, ErrorCode::Generic),
            (AddrInUse, ErrorCode::Generic),
            (Other, ErrorCode::Generic),
        ];

        for (kind, expected) in cases {
            let err = io::Error::from(kind);
            assert_eq!(ErrorCode::from_io_error(&err), expected);
            // same input, same answer
            assert_eq!(ErrorCode::from_io_error(&err), expected);
        }
    }

    #[test]
    fn test_parse_connect_request() {
        let msg = Message::new(
            Command::Connect,
            0x01,
            Bytes::from_static(b"\x01\x00\x50example.com\x00"),
        );

        let request = Request::parse(msg).unwrap();
        assert_eq!(
            request,
            Request::Connect {
                id: 0x01,
                family: AddressFamily::Ipv4,
                host: "example.com".to_string(),
                port: 80,
            }
        );
    }

    #[test]
    fn test_parse_zero_port_connect_is_spawn() {
        let msg = Message::new(Command::Connect, 0x04, Bytes::from_static(b"\x00\x00\x00/bin/sh"));

        let request = Request::parse(msg).unwrap();
        assert_eq!(
            request,
            Request::Spawn {
                id: 0x04,
                command: "/bin/sh".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_requests() {
        let short = Message::new(Command::Bind, 0x02, Bytes::from_static(b"\x00\x1f"));
        assert!(matches!(
            Request::parse(short),
            Err(ProtocolError::Truncated { .. })
        ));

        let empty_host = Message::new(Command::Bind, 0x02, Bytes::from_static(b"\x00\x1f\x90\x00"));
        assert!(matches!(
            Request::parse(empty_host),
            Err(ProtocolError::InvalidHost(_))
        ));

        let bad_family = Message::new(Command::Connect, 0x02, Bytes::from_static(b"\x09\x00\x50h"));
        assert_eq!(
            Request::parse(bad_family),
            Err(ProtocolError::UnknownAddressFamily(0x09))
        );

        let rconn = Message::new(Command::ReverseConnect, 0x02, Bytes::new());
        assert!(Request::parse(rconn).is_err());
    }

    #[test]
    fn test_request_into_message_parses_back() {
        let request = Request::Bind {
            id: 0x02,
            family: AddressFamily::Any,
            host: "0.0.0.0".to_string(),
            port: 8080,
        };

        let message = Message::from(request.clone());
        assert_eq!(message.command, Command::Bind);
        assert_eq!(Request::parse(message).unwrap(), request);
    }

    #[test]
    fn test_message_decode_header() {
        let msg = Message::decode(Bytes::from_static(b"\x02\x07hello")).unwrap();
        assert_eq!(msg.command, Command::Data);
        assert_eq!(msg.id, 0x07);
        assert_eq!(&msg.payload[..], b"hello");

        assert!(Message::decode(Bytes::from_static(b"\x02")).is_err());
        assert_eq!(
            Message::decode(Bytes::from_static(b"\x42\x00")),
            Err(ProtocolError::UnknownCommand(0x42))
        );
    }
}
