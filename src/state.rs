//! Shared state for the gateway
//!
//! Holds the upstream endpoint pool and the per-endpoint health state that
//! selection and active sessions communicate through.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Instant;

use tokio::sync::watch;
use uuid::Uuid;

use crate::config::Config;

/// Health fields guarded by the endpoint's reader/writer lock
#[derive(Debug, Default)]
struct Health {
    /// Set while the endpoint is considered unhealthy
    offline_since: Option<Instant>,
    /// Most recent accepted block header notification
    last_header_at: Option<Instant>,
    /// Consecutive dial/timeout failures since the last recovery
    failed_attempts: u32,
}

/// Health-tracked handle to one upstream node
///
/// All mutation goes through the operations below; callers never touch the
/// fields directly. Reads are cheap snapshots and may be stale by the time
/// they are acted on.
#[derive(Debug)]
pub struct Endpoint {
    id: Uuid,
    url: String,
    health: RwLock<Health>,
    /// Active sessions bound to this endpoint must terminate when this is true.
    /// A watch channel so the watchdog and recovery tasks can await the flip.
    should_disconnect: watch::Sender<bool>,
}

impl Endpoint {
    /// Create a healthy endpoint for the given upstream URL
    pub fn new(url: impl Into<String>) -> Self {
        let (should_disconnect, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            health: RwLock::new(Health::default()),
            should_disconnect,
        }
    }

    /// Opaque unique identifier, assigned at creation
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Upstream WebSocket address
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Record a dial or liveness-timeout failure
    pub fn record_failure(&self) {
        let mut health = self.health.write().expect("endpoint lock poisoned");
        health.failed_attempts += 1;
        if health.offline_since.is_none() {
            health.offline_since = Some(Instant::now());
        }
    }

    /// Record an accepted block header notification; the endpoint is healthy again
    pub fn record_liveness(&self) {
        let mut health = self.health.write().expect("endpoint lock poisoned");
        health.last_header_at = Some(Instant::now());
        health.offline_since = None;
        health.failed_attempts = 0;
    }

    /// Mark the endpoint offline without touching the failure counter
    ///
    /// Keeps an earlier `offline_since` intact so the oldest-offline ordering
    /// used by selection is preserved.
    pub fn mark_offline(&self) {
        let mut health = self.health.write().expect("endpoint lock poisoned");
        if health.offline_since.is_none() {
            health.offline_since = Some(Instant::now());
        }
    }

    /// Reset the endpoint to a clean healthy state after a successful
    /// background probe
    pub fn mark_recovered(&self) {
        let mut health = self.health.write().expect("endpoint lock poisoned");
        health.offline_since = None;
        health.failed_attempts = 0;
        health.last_header_at = None;
    }

    /// Speculatively clear the offline marker (selection's optimistic retry)
    pub fn clear_offline(&self) {
        let mut health = self.health.write().expect("endpoint lock poisoned");
        health.offline_since = None;
    }

    /// Set or clear the forced-disconnect flag for sessions bound to this endpoint
    pub fn set_should_disconnect(&self, disconnect: bool) {
        self.should_disconnect.send_replace(disconnect);
    }

    /// Current forced-disconnect flag
    pub fn should_disconnect(&self) -> bool {
        *self.should_disconnect.borrow()
    }

    /// Subscribe to forced-disconnect transitions
    pub fn disconnect_signal(&self) -> watch::Receiver<bool> {
        self.should_disconnect.subscribe()
    }

    /// When the endpoint was last marked offline, if it currently is
    pub fn offline_since(&self) -> Option<Instant> {
        self.health.read().expect("endpoint lock poisoned").offline_since
    }

    /// When the last block header notification was accepted
    pub fn last_header_at(&self) -> Option<Instant> {
        self.health.read().expect("endpoint lock poisoned").last_header_at
    }

    /// Consecutive failures since the last recovery
    pub fn failed_attempts(&self) -> u32 {
        self.health.read().expect("endpoint lock poisoned").failed_attempts
    }
}

/// Main application state shared across all handlers
pub struct AppState {
    /// Validated gateway configuration
    pub config: Config,
    /// Upstream endpoint pool, fixed order, read-only after startup
    pub endpoints: Vec<Arc<Endpoint>>,
}

impl AppState {
    /// Build the endpoint pool from the configured URLs
    pub fn new(config: Config) -> Self {
        let endpoints = config
            .endpoints
            .iter()
            .map(|url| Arc::new(Endpoint::new(url.clone())))
            .collect();

        Self { config, endpoints }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use std::time::Duration;

    fn sample_config(endpoints: Vec<&str>) -> Config {
        Config {
            strategy: Strategy::RoundRobin,
            max_attempts: 3,
            reconnect_timeout: Duration::from_secs(3),
            port: 4000,
            header_timeout: Duration::from_secs(300),
            endpoints: endpoints.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn test_new_endpoint_is_healthy() {
        let endpoint = Endpoint::new("ws://localhost:8546");

        assert!(endpoint.offline_since().is_none());
        assert!(endpoint.last_header_at().is_none());
        assert_eq!(endpoint.failed_attempts(), 0);
        assert!(!endpoint.should_disconnect());
    }

    #[test]
    fn test_record_failure_sets_offline_once() {
        let endpoint = Endpoint::new("ws://localhost:8546");

        endpoint.record_failure();
        let first = endpoint.offline_since().expect("should be offline");
        assert_eq!(endpoint.failed_attempts(), 1);

        endpoint.record_failure();
        assert_eq!(endpoint.failed_attempts(), 2);
        assert_eq!(
            endpoint.offline_since().expect("still offline"),
            first,
            "offline_since should keep the first failure's timestamp"
        );
    }

    #[test]
    fn test_record_liveness_resets_health() {
        let endpoint = Endpoint::new("ws://localhost:8546");

        endpoint.record_failure();
        endpoint.record_failure();
        endpoint.record_liveness();

        assert!(endpoint.offline_since().is_none());
        assert_eq!(endpoint.failed_attempts(), 0);
        assert!(endpoint.last_header_at().is_some());
    }

    #[test]
    fn test_mark_offline_keeps_earlier_timestamp() {
        let endpoint = Endpoint::new("ws://localhost:8546");

        endpoint.mark_offline();
        let first = endpoint.offline_since().expect("should be offline");

        endpoint.mark_offline();
        assert_eq!(endpoint.offline_since().expect("still offline"), first);
        assert_eq!(
            endpoint.failed_attempts(),
            0,
            "mark_offline must not touch the failure counter"
        );
    }

    #[test]
    fn test_mark_recovered_clears_everything() {
        let endpoint = Endpoint::new("ws://localhost:8546");

        endpoint.record_liveness();
        endpoint.record_failure();
        endpoint.mark_recovered();

        assert!(endpoint.offline_since().is_none());
        assert_eq!(endpoint.failed_attempts(), 0);
        assert!(
            endpoint.last_header_at().is_none(),
            "recovery forgets stale header timestamps"
        );
    }

    #[test]
    fn test_clear_offline_only_clears_marker() {
        let endpoint = Endpoint::new("ws://localhost:8546");

        endpoint.record_failure();
        endpoint.clear_offline();

        assert!(endpoint.offline_since().is_none());
        assert_eq!(
            endpoint.failed_attempts(),
            1,
            "the failure counter survives the optimistic reset"
        );
    }

    #[tokio::test]
    async fn test_disconnect_signal_observes_flip() {
        let endpoint = Endpoint::new("ws://localhost:8546");
        let mut signal = endpoint.disconnect_signal();

        assert!(!endpoint.should_disconnect());

        endpoint.set_should_disconnect(true);
        signal.changed().await.expect("sender alive");
        assert!(*signal.borrow());
        assert!(endpoint.should_disconnect());

        endpoint.set_should_disconnect(false);
        assert!(!endpoint.should_disconnect());
    }

    #[test]
    fn test_app_state_builds_pool_in_order() {
        let config = sample_config(vec!["ws://localhost:8546", "ws://localhost:8548"]);
        let state = AppState::new(config);

        assert_eq!(state.endpoints.len(), 2);
        assert_eq!(state.endpoints[0].url(), "ws://localhost:8546");
        assert_eq!(state.endpoints[1].url(), "ws://localhost:8548");
        assert_ne!(
            state.endpoints[0].id(),
            state.endpoints[1].id(),
            "endpoint ids must be unique"
        );
    }
}
