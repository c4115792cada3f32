use super::{Outcome, Readiness, Received};
use crate::tunnel::TunnelKey;
use crate::Watcher;
use bytes::{Bytes, BytesMut};
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::task::AbortHandle;

/// How long output is still drained after the child exits
///
/// A grandchild that inherited stdout can hold the pipe open indefinitely.
pub const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Child process wired through its standard input and output
///
/// Pipes have no readiness notion, so each direction runs as an owned
/// asynchronous operation: the pipe end moves into the operation and comes
/// back in its [`Outcome`]. The child itself lives in the exit watch and is
/// killed when that watch is aborted. Once the child exits, output already
/// in the pipe is forwarded for at most [`EXIT_DRAIN_GRACE`] before the
/// tunnel reports closed.
pub struct ProcessTransport {
    pid: Option<u32>,
    /// Present while no read is in flight
    stdout: Option<ChildStdout>,
    /// Present while no write is in flight
    stdin: Option<ChildStdin>,
    reader: Option<AbortHandle>,
    writer: Option<AbortHandle>,
    exit: Option<AbortHandle>,
    /// Drain deadline, armed after the child exits
    deadline: Option<AbortHandle>,
    /// Data from the last finished read, not yet taken
    received: Option<Bytes>,
    eof: bool,
    exited: bool,
}

impl ProcessTransport {
    /// Launch `command_line` with piped stdin/stdout
    ///
    /// The line is handed to the platform shell, so quoting and redirection
    /// follow its rules.
    pub fn spawn(key: TunnelKey, command_line: &str, watcher: &mut Watcher) -> io::Result<Self> {
        if command_line.trim().is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command line"));
        }

        let mut child = shell_command(command_line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        let exit = watcher.spawn(key, async move { Outcome::Exited(child.wait().await) });

        Ok(Self {
            pid,
            stdout,
            stdin,
            reader: None,
            writer: None,
            exit: Some(exit),
            deadline: None,
            received: None,
            eof: false,
            exited: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(super) fn absorb(&mut self, outcome: Outcome) -> Readiness {
        match outcome {
            Outcome::PipeRead { stdout, result } => {
                self.reader = None;
                self.stdout = Some(stdout);
                match result {
                    Ok(data) if data.is_empty() => {
                        self.eof = true;
                        Readiness::closed()
                    }
                    Ok(data) => {
                        self.received = Some(data);
                        Readiness {
                            readable: true,
                            ..Default::default()
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        self.eof = true;
                        Readiness::closed()
                    }
                    Err(e) => Readiness::failed(e),
                }
            }
            Outcome::PipeWritten { stdin, result } => {
                self.writer = None;
                self.stdin = Some(stdin);
                match result {
                    Ok(written) => Readiness {
                        writable: true,
                        written,
                        ..Default::default()
                    },
                    Err(e) => Readiness::failed(e),
                }
            }
            Outcome::Exited(status) => {
                self.exit = None;
                self.exited = true;
                match status {
                    Ok(status) => tracing::debug!(pid = ?self.pid, %status, "Process exited"),
                    Err(e) => tracing::warn!(pid = ?self.pid, error = %e, "Failed to wait for process"),
                }
                // otherwise the drain deadline is armed on the next rearm
                if self.eof || (self.stdout.is_none() && self.reader.is_none()) {
                    Readiness::closed()
                } else {
                    Readiness::default()
                }
            }
            Outcome::DrainExpired => {
                self.deadline = None;
                tracing::debug!(pid = ?self.pid, "Output still open after exit, closing");
                Readiness::closed()
            }
            other => {
                tracing::warn!(outcome = ?other, "Unexpected completion for process transport");
                Readiness::default()
            }
        }
    }

    /// Keep one pipe read in flight until end of stream
    pub(super) fn arm(&mut self, key: TunnelKey, read_chunk: usize, watcher: &mut Watcher) {
        if self.exited && self.deadline.is_none() {
            self.deadline = Some(watcher.spawn(key, async {
                tokio::time::sleep(EXIT_DRAIN_GRACE).await;
                Outcome::DrainExpired
            }));
        }
        if self.eof || self.reader.is_some() || self.received.is_some() {
            return;
        }
        let Some(mut stdout) = self.stdout.take() else {
            return;
        };

        self.reader = Some(watcher.spawn(key, async move {
            let mut buf = BytesMut::with_capacity(read_chunk);
            let result = stdout.read_buf(&mut buf).await.map(|_| buf.freeze());
            Outcome::PipeRead { stdout, result }
        }));
    }

    /// Submit everything queued as one pipe write
    ///
    /// Nothing is written synchronously, so this always returns 0; the byte
    /// count arrives with the write's completion. The queue is left alone
    /// while a previous write is still in flight.
    pub(super) fn send(&mut self, buf: &mut BytesMut, key: TunnelKey, watcher: &mut Watcher) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let Some(mut stdin) = self.stdin.take() else {
            return 0;
        };

        let chunk = buf.split().freeze();
        self.writer = Some(watcher.spawn(key, async move {
            let result = stdin.write_all(&chunk).await.map(|_| chunk.len());
            Outcome::PipeWritten { stdin, result }
        }));
        0
    }

    pub(super) fn recv(&mut self, buf: &mut BytesMut) -> Received {
        match self.received.take() {
            Some(data) => {
                buf.extend_from_slice(&data);
                Received::Data(data.len())
            }
            None if self.eof => Received::EndOfStream,
            None => Received::Nothing,
        }
    }

    pub(super) fn cancel(&mut self) {
        for op in [
            self.reader.take(),
            self.writer.take(),
            self.exit.take(),
            self.deadline.take(),
        ]
            .into_iter()
            .flatten()
        {
            op.abort();
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}
