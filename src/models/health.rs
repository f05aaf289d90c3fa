//! Health report models.

use super::connection::TransactionInfo;
use serde::Serialize;

/// Role of a pool within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolRole {
    Write,
    Read,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub role: PoolRole,
    pub size: u32,
    pub idle: usize,
    pub max_connections: u32,
}

impl PoolStats {
    /// True when every connection the pool may open is checked out.
    pub fn is_exhausted(&self) -> bool {
        self.size >= self.max_connections && self.idle == 0
    }
}

/// Outcome of a connectivity probe.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Health {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Health {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            message: None,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

/// Health of one named connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub name: String,
    pub health: Health,
    pub pools: Vec<PoolStats>,
    pub open_transactions: Vec<TransactionInfo>,
}

/// Aggregated health of every health-checked connection.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub connections: Vec<ConnectionReport>,
}

impl HealthReport {
    pub fn from_reports(connections: Vec<ConnectionReport>) -> Self {
        Self {
            healthy: connections.iter().all(|c| c.health.healthy),
            connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, health: Health) -> ConnectionReport {
        ConnectionReport {
            name: name.to_string(),
            health,
            pools: Vec::new(),
            open_transactions: Vec::new(),
        }
    }

    #[test]
    fn test_pool_exhaustion() {
        let stats = PoolStats {
            role: PoolRole::Write,
            size: 5,
            idle: 0,
            max_connections: 5,
        };
        assert!(stats.is_exhausted());
        let stats = PoolStats { idle: 1, ..stats };
        assert!(!stats.is_exhausted());
    }

    #[test]
    fn test_report_is_unhealthy_if_any_connection_is() {
        let aggregate = HealthReport::from_reports(vec![
            report("primary", Health::healthy(3)),
            report("analytics", Health::unhealthy("probe failed", "refused")),
        ]);
        assert!(!aggregate.healthy);

        let aggregate = HealthReport::from_reports(vec![report("primary", Health::healthy(3))]);
        assert!(aggregate.healthy);
    }

    #[test]
    fn test_health_serialization_skips_empty_fields() {
        let json = serde_json::to_value(Health::healthy(2)).unwrap();
        assert_eq!(json, serde_json::json!({"healthy": true, "latency_ms": 2}));
    }
}
