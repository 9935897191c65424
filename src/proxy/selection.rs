//! Endpoint selection strategies with background primary recovery

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_tungstenite::connect_async;
use tracing::{debug, info};

use crate::config::Strategy;
use crate::metrics::GatewayMetrics;
use crate::proxy::ws::DIAL_TIMEOUT;
use crate::state::{AppState, Endpoint};

/// Pick the endpoint a new downstream session should bridge to
///
/// Every selection starts a fresh cycle: the forced-disconnect flag is
/// cleared on the whole pool before the strategy runs. A single-endpoint
/// pool is returned unconditionally.
pub fn select_endpoint(state: &AppState) -> Arc<Endpoint> {
    for endpoint in &state.endpoints {
        endpoint.set_should_disconnect(false);
    }

    if state.endpoints.len() == 1 {
        return state.endpoints[0].clone();
    }

    match state.config.strategy {
        Strategy::RoundRobin => pick_round_robin(&state.endpoints),
        Strategy::PrimaryInstant => {
            pick_primary_instant(&state.endpoints, state.config.max_attempts)
        }
        Strategy::PrimaryAsync => pick_primary_async(state),
    }
}

/// First online endpoint in fixed order
///
/// When the whole pool is offline, the least-recently-failed endpoint is
/// returned and its offline marker is cleared as a side effect: a
/// speculative retry before the dial is even attempted, which makes the
/// next selection treat that endpoint as online.
fn pick_round_robin(endpoints: &[Arc<Endpoint>]) -> Arc<Endpoint> {
    let mut oldest: Option<(&Arc<Endpoint>, Instant)> = None;

    for endpoint in endpoints {
        match endpoint.offline_since() {
            None => return endpoint.clone(),
            Some(since) => {
                if oldest.as_ref().is_none_or(|(_, oldest_since)| since < *oldest_since) {
                    oldest = Some((endpoint, since));
                }
            }
        }
    }

    let (endpoint, _) = oldest.expect("endpoint pool is empty");
    debug!(url = %endpoint.url(), "all endpoints offline, retrying least-recently-failed");
    endpoint.clear_offline();
    endpoint.clone()
}

/// Fixed-order scan preferring endpoints that are online or still within
/// their failure budget; falls back to the least-failed endpoint
fn pick_primary_instant(endpoints: &[Arc<Endpoint>], max_attempts: u32) -> Arc<Endpoint> {
    let mut least_failed: Option<(&Arc<Endpoint>, u32)> = None;

    for endpoint in endpoints {
        if endpoint.offline_since().is_none() {
            return endpoint.clone();
        }

        let attempts = endpoint.failed_attempts();
        if attempts < max_attempts {
            return endpoint.clone();
        }

        if least_failed.as_ref().is_none_or(|(_, fewest)| attempts < *fewest) {
            least_failed = Some((endpoint, attempts));
        }
    }

    let (endpoint, _) = least_failed.expect("endpoint pool is empty");
    endpoint.clone()
}

/// Serve from a secondary while the primary is probed in the background
///
/// The first configured endpoint is the primary. While it is offline the
/// session goes to a RoundRobin pick instead, and a background task keeps
/// probing the primary; once a bare dial succeeds, the secondary's session
/// is flagged for disconnect so the next selection lands back on the
/// primary.
fn pick_primary_async(state: &AppState) -> Arc<Endpoint> {
    let primary = state.endpoints[0].clone();
    if primary.offline_since().is_none() {
        return primary;
    }

    let secondary = pick_round_robin(&state.endpoints);
    if secondary.id() == primary.id() {
        // Degenerate pool: everything is offline and the primary itself was
        // the least-recently-failed pick. It becomes the session target with
        // no recovery task running against it.
        return secondary;
    }

    tokio::spawn(recover_primary(
        primary,
        secondary.clone(),
        state.config.reconnect_timeout,
    ));

    secondary
}

/// Background probe loop that reroutes traffic back to the primary
///
/// Stops as soon as the secondary's session is superseded or torn down;
/// otherwise keeps dialing the primary until it answers, then flags the
/// secondary's session for disconnect.
async fn recover_primary(
    primary: Arc<Endpoint>,
    secondary: Arc<Endpoint>,
    reconnect_timeout: Duration,
) {
    primary.record_failure();

    info!(url = %primary.url(), "probing endpoint in background");

    let mut superseded = secondary.disconnect_signal();

    loop {
        tokio::select! {
            _ = superseded.wait_for(|&disconnect| disconnect) => {
                debug!(url = %primary.url(), "secondary session ended, stopping probe");
                return;
            }
            _ = tokio::time::sleep(reconnect_timeout) => {}
        }

        if probe(primary.url()).await {
            info!(url = %primary.url(), "endpoint recovered, rerouting to primary");
            GatewayMetrics::inc_recoveries();
            primary.mark_recovered();
            secondary.set_should_disconnect(true);
            return;
        }

        debug!(url = %primary.url(), "reconnect attempt failed");
    }
}

/// Bare dial with the session dial bound; a successful probe is closed
/// immediately
async fn probe(url: &str) -> bool {
    match tokio::time::timeout(DIAL_TIMEOUT, connect_async(url)).await {
        Ok(Ok((mut ws, _))) => {
            let _ = ws.close(None).await;
            true
        }
        _ => false,
    }
}
