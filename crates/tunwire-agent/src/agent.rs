use crate::channel::ChannelSender;
use crate::config::AgentConfig;
use crate::manager::TunnelManager;
use crate::AgentError;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tunwire_proto::{ChannelCodec, CodecError, Message};

/// Serves tunnel requests arriving on one control channel
#[derive(Debug, Clone)]
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run the event loop over `io` until the controller hangs up, the
    /// channel fails, or `shutdown` resolves
    ///
    /// Every tunnel created during the session is destroyed before this
    /// returns.
    pub async fn serve<S, F>(&self, io: S, shutdown: F) -> Result<(), AgentError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: Future<Output = ()>,
    {
        let codec = ChannelCodec::new(self.config.max_message_size);
        let (read_half, write_half) = tokio::io::split(io);
        let mut inbound = FramedRead::new(read_half, codec.clone());

        let (sender, outbound) = ChannelSender::new();
        let mut writer: JoinHandle<Result<(), CodecError>> =
            tokio::spawn(write_loop(FramedWrite::new(write_half, codec), outbound));
        let mut writer_done = false;

        let mut manager = TunnelManager::new(sender, self.config.clone());
        tokio::pin!(shutdown);

        tracing::info!("Control channel established");

        let result = loop {
            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(Ok(message)) => {
                        tracing::debug!(command = ?message.command, tunnel_id = message.id, bytes = message.payload.len(), "Request received");
                        manager.handle_message(message);
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Control channel read failed");
                        break Err(AgentError::Codec(e));
                    }
                    None => {
                        tracing::info!("Controller closed the control channel");
                        break Ok(());
                    }
                },
                Some(completion) = manager.next_completion(), if manager.has_pending_operations() => {
                    manager.handle_completion(completion);
                }
                joined = &mut writer, if !writer_done => {
                    writer_done = true;
                    break match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => {
                            tracing::error!(error = %e, "Control channel write failed");
                            Err(AgentError::Codec(e))
                        }
                        Err(e) => Err(AgentError::Writer(e.to_string())),
                    };
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break Ok(());
                }
            }
        };

        manager.destroy_all();
        // dropping the manager closes the queue so the writer flushes and exits
        drop(manager);

        if !writer_done {
            match writer.await {
                Ok(Err(e)) => tracing::debug!(error = %e, "Control channel writer stopped with error"),
                Err(e) => tracing::debug!(error = %e, "Control channel writer task failed"),
                Ok(Ok(())) => {}
            }
        }

        result
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, ChannelCodec>,
    mut outbound: UnboundedReceiver<Message>,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        tracing::trace!(command = ?message.command, tunnel_id = message.id, bytes = message.payload.len(), "Sending message");
        sink.feed(message).await?;

        // batch whatever else is already queued into one flush
        while let Ok(message) = outbound.try_recv() {
            sink.feed(message).await?;
        }
        sink.flush().await?;
    }

    sink.get_mut().shutdown().await?;
    Ok(())
}
