//! Concrete services built from configuration entries.

pub mod forwarder;
pub mod resolver;
pub mod tunnel;

use std::sync::Arc;

use crate::config::{DnsResolver, Forwarder, TunnelSettings};
use crate::connection::EventSink;
use crate::overwatch::ServiceRef;

pub use forwarder::ForwarderService;
pub use resolver::ResolverService;
pub use tunnel::TunnelService;

/// Builds services from configuration entries.
///
/// An error means the entry is malformed; the caller skips it and keeps the
/// rest of the snapshot.
pub trait ServiceFactory: Send + Sync {
    fn forwarder(&self, forwarder: &Forwarder) -> anyhow::Result<ServiceRef>;
    fn resolver(&self, resolver: &DnsResolver) -> anyhow::Result<ServiceRef>;
    fn tunnel(&self, tunnel: &TunnelSettings) -> anyhow::Result<ServiceRef>;
}

/// Factory producing services that bind real sockets.
pub struct ListenerFactory {
    events: Arc<dyn EventSink>,
}

impl ListenerFactory {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self { events }
    }
}

impl ServiceFactory for ListenerFactory {
    fn forwarder(&self, forwarder: &Forwarder) -> anyhow::Result<ServiceRef> {
        Ok(Arc::new(ForwarderService::new(forwarder)?))
    }

    fn resolver(&self, resolver: &DnsResolver) -> anyhow::Result<ServiceRef> {
        Ok(Arc::new(ResolverService::new(resolver)?))
    }

    fn tunnel(&self, tunnel: &TunnelSettings) -> anyhow::Result<ServiceRef> {
        Ok(Arc::new(TunnelService::new(tunnel, self.events.clone())?))
    }
}
