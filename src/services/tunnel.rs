use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelSettings;
use crate::connection::EventSink;
use crate::connection::edge::{EdgeConnector, EdgeSupervisor, TcpEdgeConnector};
use crate::constants::service_type;
use crate::errors;
use crate::overwatch::Service;

const SERVICE_NAME: &str = "tunnel";

/// Keeps the configured number of edge connections alive.
pub struct TunnelService {
    hash: String,
    supervisor: EdgeSupervisor,
    shutdown: CancellationToken,
}

impl TunnelService {
    pub fn new(settings: &TunnelSettings, events: Arc<dyn EventSink>) -> anyhow::Result<Self> {
        let connector = Arc::new(TcpEdgeConnector::new(&settings.edge, &settings.origin));
        Self::with_connector(settings, connector, events)
    }

    pub fn with_connector(
        settings: &TunnelSettings,
        connector: Arc<dyn EdgeConnector>,
        events: Arc<dyn EventSink>,
    ) -> anyhow::Result<Self> {
        settings.validate().context(errors::tunnel::INVALID)?;
        Ok(Self {
            hash: settings.hash(),
            supervisor: EdgeSupervisor::new(
                connector,
                events,
                settings.ha_connections,
                settings.retries,
            ),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.supervisor = self.supervisor.with_base_delay(base_delay);
        self
    }
}

#[async_trait]
impl Service for TunnelService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn service_type(&self) -> &str {
        service_type::TUNNEL
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    async fn run(&self) -> anyhow::Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.supervisor.run(self.shutdown.clone()).await
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
