//! Process-wide channel registry
//!
//! Holds one live channel per name with reference-counted acquire/release.
//! Channels outlive the views that use them: releasing the last reference
//! does not close anything, only an explicit [`ChannelRegistry::disconnect`]
//! does.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::connection::{ChannelHandle, ReconnectPolicy};
use super::handler::ChannelDriver;
use super::transport::Connector;

struct ChannelEntry {
    handle: ChannelHandle,
    task: JoinHandle<()>,
}

/// Registry of realtime channels keyed by channel name
#[derive(Clone)]
pub struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<String, ChannelEntry>>>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
}

impl ChannelRegistry {
    /// Create a registry that opens transports through `connector`
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            connector,
            policy,
        }
    }

    /// Acquire a handle to `channel`, connecting it if needed
    ///
    /// Idempotent: while a live handle exists it is returned (with its
    /// reference count bumped) instead of opening a duplicate connection.
    /// A failed or shut-down channel is replaced.
    pub async fn connect(&self, channel: &str, credential: &str) -> ChannelHandle {
        let mut channels = self.channels.write().await;

        if let Some(entry) = channels.get(channel) {
            if entry.handle.is_live() {
                let refs = entry.handle.acquire();
                tracing::debug!(
                    channel = %channel,
                    refs,
                    "Reusing live channel"
                );
                return entry.handle.clone();
            }
        }

        let (handle, outbound) = ChannelHandle::new(channel);
        let driver = ChannelDriver {
            shared: Arc::clone(&handle.shared),
            credential: credential.to_string(),
            connector: Arc::clone(&self.connector),
            policy: self.policy.clone(),
            outbound,
            shutdown: handle.shared.shutdown.subscribe(),
        };
        let task = tokio::spawn(driver.run());

        if let Some(stale) = channels.insert(
            channel.to_string(),
            ChannelEntry {
                handle: handle.clone(),
                task,
            },
        ) {
            stale.handle.shutdown();
            stale.task.abort();
        }

        tracing::info!(
            channel = %channel,
            session_id = %handle.session_id(),
            total_channels = channels.len(),
            "Channel opened"
        );

        handle
    }

    /// Give back a reference; never disconnects
    ///
    /// Returns the remaining reference count.
    pub async fn release(&self, channel: &str) -> usize {
        let channels = self.channels.read().await;
        match channels.get(channel) {
            Some(entry) => {
                let remaining = entry.handle.release();
                tracing::debug!(channel = %channel, remaining, "Channel reference released");
                remaining
            }
            None => 0,
        }
    }

    /// Tear a channel down explicitly
    ///
    /// Returns false if no such channel was registered.
    pub async fn disconnect(&self, channel: &str) -> bool {
        let entry = {
            let mut channels = self.channels.write().await;
            channels.remove(channel)
        };

        match entry {
            Some(entry) => {
                entry.handle.shutdown();
                if let Err(e) = entry.task.await {
                    tracing::warn!(channel = %channel, error = %e, "Channel driver ended abnormally");
                }
                tracing::info!(channel = %channel, "Channel disconnected explicitly");
                true
            }
            None => false,
        }
    }

    /// Disconnect every channel (app-lifetime teardown)
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = {
            let channels = self.channels.read().await;
            channels.keys().cloned().collect()
        };
        for name in names {
            self.disconnect(&name).await;
        }
    }

    /// Get a registered channel without acquiring it
    pub async fn get(&self, channel: &str) -> Option<ChannelHandle> {
        let channels = self.channels.read().await;
        channels.get(channel).map(|entry| entry.handle.clone())
    }

    /// Get statistics about the registry
    pub async fn stats(&self) -> RegistryStats {
        let channels = self.channels.read().await;
        RegistryStats {
            channels: channels.len(),
            live_channels: channels.values().filter(|e| e.handle.is_live()).count(),
            references: channels.values().map(|e| e.handle.ref_count()).sum(),
        }
    }
}

/// Statistics about registered channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of registered channels
    pub channels: usize,
    /// Channels that are neither failed nor shut down
    pub live_channels: usize,
    /// Sum of outstanding references
    pub references: usize,
}
