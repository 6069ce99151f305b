//! Metrics collection and export for Herald.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use herald_core::{AuthError, ChannelKind, Delivery, JoinError, JoinOutcome};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "herald_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "herald_subscriptions_total";
    pub const JOIN_FAILURES_TOTAL: &str = "herald_join_failures_total";
    pub const JOIN_SECONDS: &str = "herald_join_seconds";
    pub const RELAY_MESSAGES_TOTAL: &str = "herald_relay_messages_total";
    pub const RELAY_RECIPIENTS_TOTAL: &str = "herald_relay_recipients_total";
    pub const CLIENT_EVENTS_TOTAL: &str = "herald_client_events_total";
    pub const ERRORS_TOTAL: &str = "herald_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of channel joins, by channel kind"
    );
    metrics::describe_counter!(
        names::JOIN_FAILURES_TOTAL,
        "Total number of rejected or abandoned joins, by reason"
    );
    metrics::describe_histogram!(
        names::JOIN_SECONDS,
        "Time from subscribe request to join outcome in seconds"
    );
    metrics::describe_counter!(
        names::RELAY_MESSAGES_TOTAL,
        "Total number of pub/sub messages, by outcome"
    );
    metrics::describe_counter!(
        names::RELAY_RECIPIENTS_TOTAL,
        "Total number of frames queued by the relay"
    );
    metrics::describe_counter!(
        names::CLIENT_EVENTS_TOTAL,
        "Total number of client events, by outcome"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of transport errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record the outcome of a subscribe request.
pub fn record_join(result: &Result<JoinOutcome, JoinError>, elapsed: Duration) {
    histogram!(names::JOIN_SECONDS).record(elapsed.as_secs_f64());
    match result {
        Ok(JoinOutcome::Joined { kind, .. }) => record_subscription(*kind),
        Ok(JoinOutcome::AlreadyJoined) => {}
        Err(error) => record_join_failure(join_failure_reason(error)),
    }
}

/// Record a channel join.
pub fn record_subscription(kind: ChannelKind) {
    counter!(names::SUBSCRIPTIONS_TOTAL, "kind" => kind.as_str()).increment(1);
}

/// Record a join that did not happen.
pub fn record_join_failure(reason: &'static str) {
    counter!(names::JOIN_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Label for a join failure.
#[must_use]
pub fn join_failure_reason(error: &JoinError) -> &'static str {
    match error {
        JoinError::InvalidChannel(_) => "invalid_channel",
        JoinError::Unauthorized(AuthError::Request(_)) => "auth_unavailable",
        JoinError::Unauthorized(AuthError::MissingMemberData) => "missing_member_data",
        JoinError::Unauthorized(AuthError::Rejected { .. }) => "unauthorized",
        JoinError::Disconnected => "disconnected",
    }
}

/// Record a relayed pub/sub message.
pub fn record_relay(delivery: &Delivery) {
    counter!(names::RELAY_MESSAGES_TOTAL, "outcome" => "delivered").increment(1);
    counter!(names::RELAY_RECIPIENTS_TOTAL).increment(delivery.recipients as u64);
}

/// Record a pub/sub message that could not be relayed.
pub fn record_relay_malformed() {
    counter!(names::RELAY_MESSAGES_TOTAL, "outcome" => "malformed").increment(1);
}

/// Record a client event.
pub fn record_client_event(forwarded: bool) {
    let outcome = if forwarded { "forwarded" } else { "dropped" };
    counter!(names::CLIENT_EVENTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_client_event(false);
    }

    #[test]
    fn test_join_failure_reason() {
        assert_eq!(
            join_failure_reason(&JoinError::InvalidChannel("empty")),
            "invalid_channel"
        );
        assert_eq!(
            join_failure_reason(&JoinError::Unauthorized(AuthError::Rejected {
                status: 403,
                body: String::new(),
            })),
            "unauthorized"
        );
        assert_eq!(
            join_failure_reason(&JoinError::Unauthorized(AuthError::Request(
                "timed out".to_string()
            ))),
            "auth_unavailable"
        );
        assert_eq!(join_failure_reason(&JoinError::Disconnected), "disconnected");
    }

    #[test]
    fn test_record_join_outcomes() {
        record_join(
            &Ok(JoinOutcome::Joined {
                kind: ChannelKind::Presence,
                presence: None,
            }),
            Duration::from_millis(3),
        );
        record_join(&Err(JoinError::Disconnected), Duration::ZERO);
    }
}
