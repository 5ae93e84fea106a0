use anyhow::{Context, ensure};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use crate::constants::{resolver, tunnel};

/// Local listener forwarding to a remote destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forwarder {
    pub url: String,
    pub listener: String,
    #[serde(default, rename = "serviceTokenID", skip_serializing_if = "String::is_empty")]
    pub service_token_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_token_secret: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
}

impl Forwarder {
    pub fn hash(&self) -> String {
        digest(&[
            &self.url,
            &self.listener,
            &self.service_token_id,
            &self.service_token_secret,
            &self.destination,
        ])
    }

    /// Address connections are forwarded to: `destination` when set,
    /// otherwise the authority part of `url`.
    pub fn target(&self) -> String {
        if !self.destination.trim().is_empty() {
            return self.destination.trim().to_string();
        }
        authority(&self.url).to_string()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            !self.listener.trim().is_empty(),
            "Forwarder listener cannot be empty"
        );
        ensure!(
            !self.url.trim().is_empty() || !self.destination.trim().is_empty(),
            "Forwarder for {} needs a url or a destination",
            self.listener
        );
        let target = self.target();
        ensure!(
            target.rsplit_once(':').is_some_and(|(host, port)| {
                !host.is_empty() && port.parse::<u16>().is_ok()
            }),
            "Forwarder target must be host:port, got: {}",
            target
        );
        Ok(())
    }
}

/// Client side DNS resolver settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsResolver {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bootstraps: Vec<String>,
    #[serde(default)]
    pub max_upstream_connections: usize,
}

impl DnsResolver {
    pub fn hash(&self) -> String {
        digest(&[
            &self.address,
            &self.bootstraps.join(","),
            &self.upstreams.join(","),
            &self.port.to_string(),
            &self.max_upstream_connections.to_string(),
            &self.enabled.to_string(),
        ])
    }

    pub fn address_or_default(&self) -> &str {
        if self.address.is_empty() {
            resolver::DEFAULT_ADDRESS
        } else {
            &self.address
        }
    }

    pub fn port_or_default(&self) -> u16 {
        if self.port == 0 {
            resolver::DEFAULT_PORT
        } else {
            self.port
        }
    }

    pub fn upstreams_or_default(&self) -> Vec<String> {
        if self.upstreams.is_empty() {
            resolver::DEFAULT_UPSTREAMS
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.upstreams.clone()
        }
    }

    pub fn max_upstream_connections_or_default(&self) -> usize {
        if self.max_upstream_connections == 0 {
            resolver::DEFAULT_MAX_UPSTREAM_CONNECTIONS
        } else {
            self.max_upstream_connections
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for upstream in self.upstreams_or_default() {
            ensure!(
                !upstream.contains("://"),
                "Resolver upstream must be a host:port UDP address, got: {}",
                upstream
            );
        }
        Ok(())
    }
}

/// Edge connection settings for the tunnel service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSettings {
    pub edge: String,
    pub origin: String,
    #[serde(default = "default_ha_connections")]
    pub ha_connections: u8,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_ha_connections() -> u8 {
    tunnel::DEFAULT_HA_CONNECTIONS
}

fn default_retries() -> u32 {
    tunnel::DEFAULT_RETRIES
}

impl TunnelSettings {
    pub fn hash(&self) -> String {
        digest(&[
            &self.edge,
            &self.origin,
            &self.ha_connections.to_string(),
            &self.retries.to_string(),
        ])
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.edge.trim().is_empty(), "Tunnel edge address cannot be empty");
        ensure!(
            !self.origin.trim().is_empty(),
            "Tunnel origin address cannot be empty"
        );
        ensure!(
            self.ha_connections >= 1,
            "Tunnel needs at least one HA connection, got: {}",
            self.ha_connections
        );
        ensure!(self.retries >= 1, crate::errors::tunnel::NO_RETRIES);
        Ok(())
    }
}

/// Immutable configuration snapshot delivered to the app service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Root {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forwarders: Vec<Forwarder>,
    #[serde(default)]
    pub resolver: DnsResolver,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelSettings>,
}

impl Root {
    /// Parses a snapshot. Entries are validated one by one when services are
    /// built from them, so a bad entry never rejects the whole file.
    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(contents).context("Failed to parse config YAML")
    }
}

fn digest(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn authority(url: &str) -> &str {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme)
}
