//! Data channel bookkeeping
//!
//! Two independent label-keyed maps sharing one label namespace: channels
//! this side created, and channels the engine reported open from the remote
//! side. The registry records presence and routes lookups; channel readiness
//! stays with the engine.

use crate::engine::EngineDataChannel;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ChannelRegistry {
    local: HashMap<String, Arc<dyn EngineDataChannel>>,
    remote: HashMap<String, Arc<dyn EngineDataChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a locally-created channel under its label.
    pub fn register_local(&mut self, label: impl Into<String>, channel: Arc<dyn EngineDataChannel>) {
        self.local.insert(label.into(), channel);
    }

    /// Record a channel the engine reported open from the remote side.
    ///
    /// A second open with the same label replaces the first; this is accepted
    /// engine behavior, not an error.
    pub fn register_remote(&mut self, label: impl Into<String>, channel: Arc<dyn EngineDataChannel>) {
        let label = label.into();
        if self.remote.insert(label.clone(), channel).is_some() {
            debug!("Channel {} re-opened, replacing previous handle", label);
        }
    }

    /// Look up the remote-side channel for a label. Absence is not an error
    /// at this layer.
    pub fn lookup_remote(&self, label: &str) -> Option<Arc<dyn EngineDataChannel>> {
        self.remote.get(label).cloned()
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Close every handle in both maps. The maps are left populated; this
    /// only runs during session teardown.
    pub fn close_all(&self) {
        for channel in self.local.values().chain(self.remote.values()) {
            channel.close();
        }
    }
}
