//! Runtime daemon configuration.
//!
//! The identity expectations (network, peer id, stream id) are validated
//! against every fullnode event. Guards read them through [`SharedConfig`]
//! on every call so that a reconfiguration takes effect without restarting
//! the connection.
use std::sync::{Arc, RwLock};

/// Expectations and tunables for one logical connection.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Network name the fullnode must report, e.g. `mainnet`.
    pub network: String,
    /// Peer id of the fullnode this daemon is allowed to follow.
    pub peer_id: String,
    /// Stream id events must carry for their ids to be trusted.
    pub stream_id: String,
    /// Capacity of the change-detection cache.
    pub cache_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            peer_id: String::new(),
            stream_id: String::new(),
            cache_size: 10_000,
        }
    }
}

/// Cheap-to-clone handle over the live configuration.
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<RwLock<DaemonConfig>>);

impl SharedConfig {
    pub fn new(config: DaemonConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    /// Returns a snapshot of the current configuration.
    pub fn read(&self) -> DaemonConfig {
        self.0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Applies a mutation to the live configuration.
    ///
    /// Guards observe the new values on their next invocation.
    pub fn update(&self, f: impl FnOnce(&mut DaemonConfig)) {
        let mut guard = self
            .0
            .write()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }
}
