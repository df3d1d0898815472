//! `/health` endpoint body.

use serde::Serialize;
use tokio::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the binding is running.
    pub status: String,
    /// Seconds since the binding started.
    pub uptime_secs: u64,
    /// Live connections on this binding.
    pub connections: usize,
    /// Registered routes.
    pub routes: usize,
}

/// Build a health response from live counters.
pub fn health_check(started_at: Instant, connections: usize, routes: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: started_at.elapsed().as_secs(),
        connections,
        routes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, 0);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[tokio::test(start_paused = true)]
    async fn uptime_increases() {
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(health_check(start, 0, 0).uptime_secs >= 60);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(health_check(Instant::now(), 2, 6)).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 2);
        assert_eq!(json["routes"], 6);
        assert!(json["uptimeSecs"].is_number());
    }
}
