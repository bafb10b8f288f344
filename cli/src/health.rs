//! Health check document served at `/health`

use serde::Serialize;
use sparext::QueryEndpoint;
use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

pub fn uptime_seconds() -> u64 {
    START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

#[derive(Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triple_count: Option<usize>,
    pub extension_functions: usize,
}

impl HealthStatus {
    pub fn from_endpoint(endpoint: &QueryEndpoint) -> Self {
        Self {
            status: "healthy",
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: uptime_seconds(),
            triple_count: endpoint.store().len().ok(),
            extension_functions: endpoint.registry().len(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
