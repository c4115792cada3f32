//! Seam between the tunnel core and the control channel

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tunwire_proto::{Command, Message, TunnelId};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Control channel closed")]
    Closed,
}

/// Where the core hands its outbound protocol messages
///
/// Implementations must not block: the event loop calls these from inside a
/// dispatch step.
pub trait ControlChannel {
    /// Queue a message to the controller; fails once the channel is gone
    fn send_message(&self, message: Message) -> Result<(), ChannelError>;

    /// Hand bytes freshly read from tunnel `id` to the controller
    fn forward_inbound(&self, id: TunnelId, data: Bytes) -> Result<(), ChannelError> {
        self.send_message(Message::data(id, data))
    }

    fn send(&self, command: Command, id: TunnelId, payload: Bytes) -> Result<(), ChannelError> {
        self.send_message(Message::new(command, id, payload))
    }
}

/// Control channel backed by an unbounded queue drained by a writer task
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelSender {
    /// Create a sender and the receiving end the writer task drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ControlChannel for ChannelSender {
    fn send_message(&self, message: Message) -> Result<(), ChannelError> {
        self.tx.send(message).map_err(|_| ChannelError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_fails_once_receiver_dropped() {
        let (sender, mut rx) = ChannelSender::new();

        sender
            .forward_inbound(3, Bytes::from_static(b"hi"))
            .unwrap();
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.command, Command::Data);
        assert_eq!(msg.id, 3);

        drop(rx);
        assert!(matches!(
            sender.send(Command::Close, 3, Bytes::new()),
            Err(ChannelError::Closed)
        ));
    }
}
