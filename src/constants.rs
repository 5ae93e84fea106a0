use std::path::PathBuf;
use std::time::Duration;

pub const APP_NAME: &str = "tunnel_agent";

pub const ENV_PREFIX: &str = "TUNNEL";

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

pub const DEFAULT_METRICS_ADDRESS: &str = "localhost:20241";

pub const DEFAULT_GRACE_PERIOD: &str = "30s";

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const READY_PATH: &str = "/ready";

/// Time a stopped service gets to finish after the hard shutdown fired.
pub const SERVICE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub mod service_type {
    pub const FORWARD: &str = "forward";
    pub const RESOLVER: &str = "resolver";
    pub const TUNNEL: &str = "tunnel";
}

pub mod backoff {
    use std::time::Duration;

    pub const BASE_DELAY: Duration = Duration::from_secs(1);
    pub const MAX_DELAY: Duration = Duration::from_secs(60);
    pub const GRACE_WINDOW: Duration = Duration::from_secs(4);
}

pub mod resolver {
    use std::time::Duration;

    pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_ADDRESS: &str = "localhost";
    pub const DEFAULT_PORT: u16 = 53;
    pub const DEFAULT_MAX_UPSTREAM_CONNECTIONS: usize = 5;
    pub const DEFAULT_UPSTREAMS: [&str; 2] = ["1.1.1.1:53", "1.0.0.1:53"];
    pub const MAX_DATAGRAM_SIZE: usize = 4096;
}

pub mod forwarder {
    use std::time::Duration;

    /// Pause after a failed accept, e.g. when file descriptors run out.
    pub const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);
}

pub mod tunnel {
    use std::time::Duration;

    pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DEFAULT_HA_CONNECTIONS: u8 = 4;
    pub const DEFAULT_RETRIES: u32 = 5;
}

pub fn default_log_directory() -> PathBuf {
    PathBuf::from(".").join("logs")
}
