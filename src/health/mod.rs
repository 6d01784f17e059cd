//! Health Module - Liveness reporting for the process
//!
//! The KV is the only hard dependency: when it is gone the process reports
//! unhealthy while sessions keep serving with every status read degrading
//! to offline.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::kv::{KvError, KvStore};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub version: String,
    pub kv: ComponentHealth,
    pub active_sessions: usize,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: Option<String>,
}

pub struct HealthMonitor {
    start_time: Instant,
    kv: Arc<dyn KvStore>,
}

impl HealthMonitor {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            start_time: Instant::now(),
            kv,
        }
    }

    pub async fn check(&self, active_sessions: usize) -> HealthSnapshot {
        let kv = match self.kv.ping().await {
            Ok(()) => ComponentHealth {
                status: HealthStatus::Healthy,
                message: None,
            },
            Err(e @ KvError::TransientUnavailable(_)) => ComponentHealth {
                status: HealthStatus::Degraded,
                message: Some(e.to_string()),
            },
            Err(e) => ComponentHealth {
                status: HealthStatus::Unhealthy,
                message: Some(e.to_string()),
            },
        };

        HealthSnapshot {
            status: kv.status,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            kv,
            active_sessions,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}
