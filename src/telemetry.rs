//! Tracing setup for the settlement engine.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` (driven by
//! `RUST_LOG`, defaulting to `info`) and a formatted output layer.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Builder for the process-wide tracing subscriber.
pub struct Telemetry {
    name: &'static str,
    version: &'static str,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            name: "railpay",
            version: "0.0.0",
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = version;
        self
    }

    /// Installs the global subscriber. Call once at startup.
    pub fn register(self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
        tracing::info!(service = self.name, version = self.version, "telemetry initialized");
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
