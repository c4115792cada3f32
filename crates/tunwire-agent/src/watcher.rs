//! Readiness multiplexer
//!
//! Every outstanding readiness wait or asynchronous pipe operation is a task
//! in one `JoinSet`. Completions are tagged with the tunnel they belong to and
//! are consumed one at a time by the event loop. Each task's `AbortHandle` is
//! kept by the owning transport so closing a tunnel cancels its operations.

use crate::transport::Outcome;
use crate::tunnel::TunnelKey;
use std::future::Future;
use tokio::task::{AbortHandle, JoinSet};

/// A finished operation, tagged with the tunnel that armed it
#[derive(Debug)]
pub struct Completion {
    pub key: TunnelKey,
    pub outcome: Outcome,
}

pub struct Watcher {
    tasks: JoinSet<Completion>,
}

impl Watcher {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    /// Start an operation on behalf of `key`
    pub fn spawn<F>(&mut self, key: TunnelKey, op: F) -> AbortHandle
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        self.tasks.spawn(async move {
            Completion {
                key,
                outcome: op.await,
            }
        })
    }

    /// Wait for the next completion
    ///
    /// Cancelled operations are skipped. Returns `None` once nothing is
    /// outstanding. Cancel safe.
    pub async fn next(&mut self) -> Option<Completion> {
        loop {
            match self.tasks.join_next().await? {
                Ok(completion) => return Some(completion),
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Watch task failed");
                    continue;
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every outstanding operation
    pub fn shutdown(&mut self) {
        self.tasks.abort_all();
    }
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(id: u8) -> TunnelKey {
        TunnelKey { id, serial: 1 }
    }

    fn exited() -> Outcome {
        Outcome::Exited(Err(std::io::ErrorKind::Other.into()))
    }

    #[tokio::test]
    async fn test_completion_carries_key() {
        let mut watcher = Watcher::new();
        watcher.spawn(key(7), async { exited() });

        let completion = watcher.next().await.unwrap();
        assert_eq!(completion.key, key(7));
        assert!(watcher.next().await.is_none());
    }

    #[tokio::test]
    async fn test_aborted_operations_are_skipped() {
        let mut watcher = Watcher::new();

        let handle = watcher.spawn(key(1), async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            exited()
        });
        watcher.spawn(key(2), async { exited() });
        handle.abort();

        let completion = watcher.next().await.unwrap();
        assert_eq!(completion.key, key(2));
        assert!(watcher.next().await.is_none());
        assert!(watcher.is_empty());
    }
}
