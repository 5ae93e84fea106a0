pub mod manager;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use manager::FileManager;
pub use types::{DnsResolver, Forwarder, Root, TunnelSettings};

/// Receives configuration snapshots from a [`Manager`].
pub trait Notifier: Send + Sync {
    /// Called for every new snapshot. Must not block the caller.
    fn config_did_update(&self, root: Root);
}

/// Producer of configuration snapshots.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Delivers the current snapshot to `notifier`, then keeps delivering
    /// updates until [`shutdown`](Manager::shutdown) is called.
    async fn start(&self, notifier: Arc<dyn Notifier>) -> anyhow::Result<()>;

    fn shutdown(&self);
}
