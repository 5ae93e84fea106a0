//! Supervision of named background services.
//!
//! A [`Service`] is identified by its name; its hash describes the
//! configuration it was built from. The [`AppManager`] keeps at most one
//! running instance per name and reconciles additions against that registry.

pub mod app_manager;

use std::sync::Arc;

use async_trait::async_trait;

pub use app_manager::{AppManager, ServiceCallback};

#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Unique key inside the supervisor.
    fn name(&self) -> &str;

    /// Category tag such as `forward` or `resolver`.
    fn service_type(&self) -> &str;

    /// Digest of the configuration this instance was built from.
    fn hash(&self) -> &str;

    /// Runs until the service exits on its own or [`shutdown`](Service::shutdown) is called.
    async fn run(&self) -> anyhow::Result<()>;

    /// Requests the service to stop. Must make `run` return even if it has not
    /// finished starting up yet.
    fn shutdown(&self);
}

pub type ServiceRef = Arc<dyn Service>;
