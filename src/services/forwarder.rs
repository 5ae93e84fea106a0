use std::net::SocketAddr;
use std::sync::OnceLock;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Forwarder;
use crate::constants::forwarder::ACCEPT_ERROR_DELAY;
use crate::constants::service_type;
use crate::constants::tunnel::DIAL_TIMEOUT;
use crate::errors;
use crate::overwatch::Service;

/// TCP listener piping every accepted connection to a fixed target.
pub struct ForwarderService {
    listener: String,
    target: String,
    hash: String,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
}

impl ForwarderService {
    pub fn new(forwarder: &Forwarder) -> anyhow::Result<Self> {
        forwarder
            .validate()
            .with_context(|| errors::forwarder::invalid(&forwarder.listener))?;
        Ok(Self {
            listener: forwarder.listener.trim().to_string(),
            target: forwarder.target(),
            hash: forwarder.hash(),
            local_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Address actually bound, once `run` has started listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }
}

#[async_trait]
impl Service for ForwarderService {
    fn name(&self) -> &str {
        &self.listener
    }

    fn service_type(&self) -> &str {
        service_type::FORWARD
    }

    fn hash(&self) -> &str {
        &self.hash
    }

    async fn run(&self) -> anyhow::Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.listener)
            .await
            .with_context(|| errors::forwarder::bind_failed(&self.listener))?;
        if let Ok(addr) = listener.local_addr() {
            let _ = self.local_addr.set(addr);
        }
        tracing::info!(
            listener = %self.listener,
            target = %self.target,
            "Forwarder listening"
        );

        // Dropping the set aborts every open pipe.
        let mut pipes = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(_) = pipes.join_next(), if !pipes.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        pipes.spawn(pipe(stream, peer, self.target.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(listener = %self.listener, "Accept failed: {}", e);
                        if !pause_after_accept_error(&self.shutdown).await {
                            break;
                        }
                    }
                },
            }
        }

        tracing::info!(
            listener = %self.listener,
            open_connections = pipes.len(),
            "Forwarder stopped"
        );
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Returns `false` when shutdown arrives during the pause.
async fn pause_after_accept_error(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_DELAY) => true,
    }
}

async fn pipe(mut inbound: TcpStream, peer: SocketAddr, target: String) {
    let dialed = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await;
    let mut outbound = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(%peer, "{}: {}", errors::forwarder::connect_failed(&target), e);
            return;
        }
        Err(_) => {
            tracing::warn!(%peer, "{}", errors::forwarder::connect_timeout(&target));
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok((sent, received)) => {
            tracing::debug!(%peer, %target, sent, received, "Forwarded connection closed");
        }
        Err(e) => {
            tracing::debug!(%peer, %target, "Forwarded connection ended: {}", e);
        }
    }
}
