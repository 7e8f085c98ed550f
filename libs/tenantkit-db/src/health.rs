//! Health check distinguishing "cannot reach the database" from "reached it,
//! but isolation is not in force".

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::Pool;

use crate::backend::IsolationBackend;
use crate::tables::TenantTables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Connected, but policies are missing or a connection carried a stale marker.
    Degraded,
    /// Could not acquire a connection or run a trivial query.
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthReport {
    fn new(status: HealthStatus, latency: Duration, detail: Option<String>) -> Self {
        Self {
            status,
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            detail,
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Probe one pooled connection.
///
/// A connection found carrying a marker is closed rather than returned.
pub(crate) async fn check<DB: IsolationBackend>(pool: &Pool<DB>, tables: &TenantTables) -> HealthReport {
    let started = Instant::now();
    let (status, detail) = probe(pool, tables).await;
    let report = HealthReport::new(status, started.elapsed(), detail);
    match report.status {
        HealthStatus::Healthy => {
            tracing::debug!(backend = DB::BACKEND, latency_ms = report.latency_ms, "database healthy");
        }
        HealthStatus::Degraded | HealthStatus::Unhealthy => tracing::warn!(
            backend = DB::BACKEND,
            status = %report.status,
            latency_ms = report.latency_ms,
            detail = report.detail.as_deref().unwrap_or_default(),
            "database health check failed"
        ),
    }
    report
}

async fn probe<DB: IsolationBackend>(
    pool: &Pool<DB>,
    tables: &TenantTables,
) -> (HealthStatus, Option<String>) {
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => return (HealthStatus::Unhealthy, Some(format!("acquire failed: {e}"))),
    };
    if let Err(e) = DB::ping(&mut *conn).await {
        conn.close_on_drop();
        return (HealthStatus::Unhealthy, Some(format!("ping failed: {e}")));
    }
    if let Err(e) = DB::probe_policy(&mut *conn).await {
        return (HealthStatus::Degraded, Some(format!("policy probe failed: {e}")));
    }
    match DB::read_marker(&mut *conn).await {
        Ok(None) => {}
        Ok(Some(marker)) => {
            conn.close_on_drop();
            tracing::error!(
                target: "security",
                tenant = marker.label(),
                "idle pooled connection carried a session marker"
            );
            return (
                HealthStatus::Degraded,
                Some(format!("idle connection carried a session marker for {}", marker.label())),
            );
        }
        Err(e) => {
            conn.close_on_drop();
            return (HealthStatus::Degraded, Some(format!("marker audit failed: {e}")));
        }
    }
    match DB::missing_policies(&mut *conn, tables).await {
        Ok(missing) if missing.is_empty() => (HealthStatus::Healthy, None),
        Ok(missing) => (
            HealthStatus::Degraded,
            Some(format!("missing isolation objects: {}", missing.join(", "))),
        ),
        Err(e) => (HealthStatus::Degraded, Some(format!("policy audit failed: {e}"))),
    }
}
