pub mod app {
    pub const ALREADY_STARTED: &str = "App service is already running";
    pub const DUPLICATE_SERVICE: &str =
        "Skipping config entry: another entry already defines a service with this name";

    pub fn skipped_entry(entry: &str) -> String {
        format!("Skipping invalid config entry '{}'", entry)
    }
}

pub mod service {
    pub fn panicked(name: &str, error: &str) -> String {
        format!("Service '{}' panicked: {}", name, error)
    }
}

pub mod config {
    pub fn corrupted_yaml(path: &str) -> String {
        format!("Corrupted YAML config at {}", path)
    }

    pub fn reload_failed(path: &str) -> String {
        format!(
            "Failed to reload config from {}, keeping the previous configuration",
            path
        )
    }

    pub fn failed_to_create_default(path: &str) -> String {
        format!("Failed to create default config at {}", path)
    }

    pub fn failed_to_read(path: &str) -> String {
        format!("Failed to read config from {}", path)
    }

    pub const FAILED_TO_SERIALIZE: &str = "Failed to serialize config to YAML";

    pub fn failed_to_create_dir(path: &str) -> String {
        format!("Failed to create config directory: {}", path)
    }

    pub fn failed_to_write_temp(path: &str) -> String {
        format!("Failed to write temporary config to {}", path)
    }

    pub fn failed_to_rename(from: &str, to: &str) -> String {
        format!("Failed to rename {} to {}", from, to)
    }

    #[cfg(unix)]
    pub const FAILED_TO_OPEN_TEMP: &str = "Failed to open temp file for fsync";
    #[cfg(unix)]
    pub const FAILED_TO_FSYNC: &str = "Failed to fsync temp file";
    pub const FAILED_TO_CREATE_WATCHER: &str = "Failed to create file watcher";

    pub fn failed_to_watch(path: &str) -> String {
        format!("Failed to watch config directory: {}", path)
    }
}

pub mod settings {
    pub const FAILED_TO_BUILD: &str = "Failed to load agent settings";
    pub const CONFIG_PATH_EMPTY: &str = "Config path cannot be empty";
    pub const METRICS_ADDRESS_EMPTY: &str = "Metrics address cannot be empty";
    pub const LOG_LEVEL_EMPTY: &str = "Log level cannot be empty";

    pub fn invalid_grace_period(value: &str) -> String {
        format!(
            "Invalid grace period '{}', expected a duration such as 30s or 1m",
            value
        )
    }

    pub fn invalid_connector_id(value: &str) -> String {
        format!("Invalid connector ID '{}', expected a UUID", value)
    }
}

pub mod forwarder {
    pub fn invalid(listener: &str) -> String {
        format!("Invalid forwarder for listener '{}'", listener)
    }

    pub fn bind_failed(listener: &str) -> String {
        format!("Failed to listen on {}", listener)
    }

    pub fn connect_failed(target: &str) -> String {
        format!("Failed to connect to forwarder target {}", target)
    }

    pub fn connect_timeout(target: &str) -> String {
        format!("Timed out connecting to forwarder target {}", target)
    }
}

pub mod resolver {
    pub const INVALID: &str = "Invalid resolver configuration";
    pub const NO_UPSTREAMS: &str = "No upstreams configured";
    pub const ALL_UPSTREAMS_FAILED: &str = "Every resolver upstream failed";

    pub fn bind_failed(address: &str) -> String {
        format!("Failed to bind resolver on {}", address)
    }

    pub fn unresolvable(upstream: &str) -> String {
        format!("Cannot resolve upstream address {}", upstream)
    }

    pub fn upstream_timeout(upstream: &str) -> String {
        format!("Upstream {} did not answer in time", upstream)
    }
}

pub mod tunnel {
    pub const INVALID: &str = "Invalid tunnel configuration";
    pub const NO_RETRIES: &str = "Tunnel retries must be at least 1";
}

pub mod edge {
    pub const FIRST_CONNECTION_FAILED: &str = "Could not establish the first edge connection";
    pub const READ_FAILED: &str = "Failed to read from edge connection";
    pub const PROXY_FAILED: &str = "Edge stream to origin failed";

    pub fn dial_failed(edge: &str) -> String {
        format!("Failed to dial edge {}", edge)
    }

    pub fn dial_timeout(edge: &str) -> String {
        format!("Timed out dialing edge {}", edge)
    }

    pub fn closed_by_edge(edge: &str) -> String {
        format!("Edge {} closed the connection before sending data", edge)
    }

    pub fn origin_unreachable(origin: &str) -> String {
        format!("Failed to connect to origin {}", origin)
    }

    pub fn retries_exhausted(index: u8, retries: u32) -> String {
        format!(
            "Edge connection {} gave up after {} retries",
            index, retries
        )
    }

    pub fn slot_panicked(error: &str) -> String {
        format!("Edge connection task panicked: {}", error)
    }
}

pub mod signal {
    pub const HANDLER_FAILED: &str = "Failed to install shutdown signal handler";
}

pub mod startup {
    pub const FAILED_TO_INIT_TRACING: &str = "Failed to initialize tracing";
    pub const FAILED_TO_CREATE_RUNTIME: &str = "Failed to create tokio runtime";
    pub const FAILED_TO_CREATE_LOG_DIR: &str = "Failed to create log directory";
    pub const METRICS_SERVER_FAILED: &str = "Metrics server stopped unexpectedly";

    pub fn metrics_bind_failed(address: &str) -> String {
        format!("Failed to bind metrics server on {}", address)
    }
}
