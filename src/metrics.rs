//! Prometheus metrics for the gateway
//!
//! Process-wide atomic counters with manual text exposition, served at
//! `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

static SESSIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static ACTIVE_SESSIONS: AtomicU64 = AtomicU64::new(0);
static DIAL_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);
static MESSAGES_UPSTREAM_TOTAL: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DOWNSTREAM_TOTAL: AtomicU64 = AtomicU64::new(0);
static HEADER_NOTIFICATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static WATCHDOG_TIMEOUTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static RECOVERIES_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Gateway metrics collector
pub struct GatewayMetrics;

impl GatewayMetrics {
    /// Count an accepted downstream session
    pub fn inc_sessions() {
        SESSIONS_TOTAL.fetch_add(1, Ordering::SeqCst);
        ACTIVE_SESSIONS.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a downstream session ending
    pub fn dec_active_sessions() {
        ACTIVE_SESSIONS.fetch_sub(1, Ordering::SeqCst);
    }

    /// Count a failed dial to a chosen endpoint
    pub fn inc_dial_failures() {
        DIAL_FAILURES_TOTAL.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a relayed message in the given direction
    pub fn inc_messages(direction: &str) {
        match direction {
            "upstream" => MESSAGES_UPSTREAM_TOTAL.fetch_add(1, Ordering::SeqCst),
            "downstream" => MESSAGES_DOWNSTREAM_TOTAL.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };
    }

    /// Count an accepted block header notification
    pub fn inc_header_notifications() {
        HEADER_NOTIFICATIONS_TOTAL.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a watchdog liveness timeout
    pub fn inc_watchdog_timeouts() {
        WATCHDOG_TIMEOUTS_TOTAL.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a primary endpoint recovered by a background probe
    pub fn inc_recoveries() {
        RECOVERIES_TOTAL.fetch_add(1, Ordering::SeqCst);
    }

    /// Get current metrics as a Prometheus-formatted string
    pub fn render() -> String {
        let mut output = String::new();

        output.push_str("# HELP ethgate_sessions_total Total downstream sessions accepted\n");
        output.push_str("# TYPE ethgate_sessions_total counter\n");
        output.push_str(&format!(
            "ethgate_sessions_total {}\n",
            SESSIONS_TOTAL.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP ethgate_active_sessions Currently bridged downstream sessions\n");
        output.push_str("# TYPE ethgate_active_sessions gauge\n");
        output.push_str(&format!(
            "ethgate_active_sessions {}\n",
            ACTIVE_SESSIONS.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP ethgate_dial_failures_total Failed dials to upstream endpoints\n");
        output.push_str("# TYPE ethgate_dial_failures_total counter\n");
        output.push_str(&format!(
            "ethgate_dial_failures_total {}\n",
            DIAL_FAILURES_TOTAL.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP ethgate_messages_upstream_total Messages relayed client to upstream\n");
        output.push_str("# TYPE ethgate_messages_upstream_total counter\n");
        output.push_str(&format!(
            "ethgate_messages_upstream_total {}\n",
            MESSAGES_UPSTREAM_TOTAL.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP ethgate_messages_downstream_total Messages relayed upstream to client\n");
        output.push_str("# TYPE ethgate_messages_downstream_total counter\n");
        output.push_str(&format!(
            "ethgate_messages_downstream_total {}\n",
            MESSAGES_DOWNSTREAM_TOTAL.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP ethgate_header_notifications_total Block header notifications accepted\n",
        );
        output.push_str("# TYPE ethgate_header_notifications_total counter\n");
        output.push_str(&format!(
            "ethgate_header_notifications_total {}\n",
            HEADER_NOTIFICATIONS_TOTAL.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP ethgate_watchdog_timeouts_total Sessions closed for missing block headers\n",
        );
        output.push_str("# TYPE ethgate_watchdog_timeouts_total counter\n");
        output.push_str(&format!(
            "ethgate_watchdog_timeouts_total {}\n",
            WATCHDOG_TIMEOUTS_TOTAL.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP ethgate_recoveries_total Primary endpoints recovered by background probes\n");
        output.push_str("# TYPE ethgate_recoveries_total counter\n");
        output.push_str(&format!(
            "ethgate_recoveries_total {}\n",
            RECOVERIES_TOTAL.load(Ordering::SeqCst)
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The counters are process-wide, so assertions are relative deltas.

    #[test]
    fn test_session_counters() {
        let before_total = SESSIONS_TOTAL.load(Ordering::SeqCst);
        let before_active = ACTIVE_SESSIONS.load(Ordering::SeqCst);

        GatewayMetrics::inc_sessions();

        assert!(SESSIONS_TOTAL.load(Ordering::SeqCst) >= before_total + 1);
        assert!(ACTIVE_SESSIONS.load(Ordering::SeqCst) >= before_active + 1);

        GatewayMetrics::dec_active_sessions();
    }

    #[test]
    fn test_message_direction_counters() {
        let before_up = MESSAGES_UPSTREAM_TOTAL.load(Ordering::SeqCst);
        let before_down = MESSAGES_DOWNSTREAM_TOTAL.load(Ordering::SeqCst);

        GatewayMetrics::inc_messages("upstream");
        GatewayMetrics::inc_messages("downstream");
        GatewayMetrics::inc_messages("sideways");

        assert!(MESSAGES_UPSTREAM_TOTAL.load(Ordering::SeqCst) >= before_up + 1);
        assert!(MESSAGES_DOWNSTREAM_TOTAL.load(Ordering::SeqCst) >= before_down + 1);
    }

    #[test]
    fn test_render_contains_metric_lines() {
        GatewayMetrics::inc_dial_failures();

        let output = GatewayMetrics::render();

        assert!(output.contains("# TYPE ethgate_sessions_total counter"));
        assert!(output.contains("# TYPE ethgate_active_sessions gauge"));
        assert!(output.contains("ethgate_dial_failures_total"));
        assert!(output.contains("ethgate_header_notifications_total"));
        assert!(output.contains("ethgate_recoveries_total"));
    }
}
