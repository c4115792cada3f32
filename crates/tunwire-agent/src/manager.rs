use crate::channel::ControlChannel;
use crate::config::AgentConfig;
use crate::registry::Registry;
use crate::tunnel::{Tunnel, TunnelKey};
use crate::watcher::{Completion, Watcher};
use tunwire_proto::TunnelId;

/// Owner of every live tunnel and of the operations armed on their behalf
///
/// All tunnel state is mutated through `&mut self`, so whoever holds the
/// manager is the single mutator. Creation and teardown live in
/// `lifecycle.rs`, readiness handling in `dispatcher.rs`.
pub struct TunnelManager<C> {
    pub(crate) registry: Registry<Tunnel>,
    pub(crate) watcher: Watcher,
    pub(crate) channel: C,
    pub(crate) config: AgentConfig,
    next_serial: u64,
}

impl<C: ControlChannel> TunnelManager<C> {
    pub fn new(channel: C, config: AgentConfig) -> Self {
        Self {
            registry: Registry::new(),
            watcher: Watcher::new(),
            channel,
            config,
            next_serial: 0,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry<Tunnel> {
        &self.registry
    }

    pub fn tunnel(&self, id: TunnelId) -> Option<&Tunnel> {
        self.registry.lookup(id)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Whether any readiness wait or pipe operation is outstanding
    pub fn has_pending_operations(&self) -> bool {
        !self.watcher.is_empty()
    }

    /// Wait for the next finished operation. Cancel safe.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.watcher.next().await
    }

    /// Wait for one completion and dispatch it
    ///
    /// Returns `false` once nothing is outstanding.
    pub async fn turn(&mut self) -> bool {
        match self.watcher.next().await {
            Some(completion) => {
                self.handle_completion(completion);
                true
            }
            None => false,
        }
    }

    pub(crate) fn next_key(&mut self, id: TunnelId) -> TunnelKey {
        self.next_serial += 1;
        TunnelKey {
            id,
            serial: self.next_serial,
        }
    }
}
