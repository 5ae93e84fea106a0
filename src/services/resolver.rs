//! UDP DNS relay.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DnsResolver;
use crate::constants::resolver::{MAX_DATAGRAM_SIZE, UPSTREAM_TIMEOUT};
use crate::constants::service_type;
use crate::errors;
use crate::overwatch::Service;

const SERVICE_NAME: &str = "resolver";

/// Relays each query datagram to the first upstream that answers.
pub struct ResolverService {
    address: String,
    upstreams: Arc<[String]>,
    max_upstream_connections: usize,
    upstream_timeout: Duration,
    hash: String,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
}

impl ResolverService {
    pub fn new(resolver: &DnsResolver) -> anyhow::Result<Self> {
        resolver.validate().context(errors::resolver::INVALID)?;
        Ok(Self {
            address: format!(
                "{}:{}",
                resolver.address_or_default(),
                resolver.port_or_default()
            ),
            upstreams: resolver.upstreams_or_default().into(),
            max_upstream_connections: resolver.max_upstream_connections_or_default(),
            upstream_timeout: UPSTREAM_TIMEOUT,
            hash: resolver.hash(),
            local_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }
}

#[async_trait]
impl Service for ResolverService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn service_type(&self) -> &str {
        service_type::RESOLVER
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    async fn run(&self) -> anyhow::Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let socket = UdpSocket::bind(&self.address)
            .await
            .with_context(|| errors::resolver::bind_failed(&self.address))?;
        if let Ok(addr) = socket.local_addr() {
            let _ = self.local_addr.set(addr);
        }
        let socket = Arc::new(socket);
        tracing::info!(
            address = %self.address,
            upstreams = ?self.upstreams,
            "Resolver listening"
        );

        let permits = Arc::new(Semaphore::new(self.max_upstream_connections));
        let mut exchanges = JoinSet::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(_) = exchanges.join_next(), if !exchanges.is_empty() => {}
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, client)) => {
                        exchanges.spawn(exchange(
                            socket.clone(),
                            buf[..len].to_vec(),
                            client,
                            self.upstreams.clone(),
                            self.upstream_timeout,
                            permits.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::debug!(address = %self.address, "Receive failed: {}", e);
                    }
                },
            }
        }

        tracing::info!(address = %self.address, "Resolver stopped");
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn exchange(
    socket: Arc<UdpSocket>,
    query: Vec<u8>,
    client: SocketAddr,
    upstreams: Arc<[String]>,
    timeout: Duration,
    permits: Arc<Semaphore>,
) {
    let Ok(_permit) = permits.acquire_owned().await else {
        return;
    };

    match forward(&query, &upstreams, timeout).await {
        Ok(answer) => {
            if let Err(e) = socket.send_to(&answer, client).await {
                tracing::debug!(%client, "Failed to deliver answer: {}", e);
            }
        }
        Err(e) => {
            tracing::warn!(%client, "{:#}", e);
        }
    }
}

/// Tries each upstream in order and returns the first answer.
pub async fn forward(
    query: &[u8],
    upstreams: &[String],
    timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let mut last_error = None;
    for upstream in upstreams {
        match tokio::time::timeout(timeout, query_upstream(upstream, query)).await {
            Ok(Ok(answer)) => return Ok(answer),
            Ok(Err(e)) => {
                tracing::debug!(%upstream, "Upstream failed: {:#}", e);
                last_error = Some(e);
            }
            Err(_) => {
                tracing::debug!(%upstream, "Upstream timed out");
                last_error = Some(anyhow::anyhow!(errors::resolver::upstream_timeout(
                    upstream
                )));
            }
        }
    }

    let error = last_error.unwrap_or_else(|| anyhow::anyhow!(errors::resolver::NO_UPSTREAMS));
    Err(error.context(errors::resolver::ALL_UPSTREAMS_FAILED))
}

async fn query_upstream(upstream: &str, query: &[u8]) -> anyhow::Result<Vec<u8>> {
    let addr = tokio::net::lookup_host(upstream)
        .await
        .with_context(|| errors::resolver::unresolvable(upstream))?
        .next()
        .with_context(|| errors::resolver::unresolvable(upstream))?;

    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    socket.send(query).await?;

    let mut answer = vec![0u8; MAX_DATAGRAM_SIZE];
    let len = socket.recv(&mut answer).await?;
    answer.truncate(len);
    Ok(answer)
}
