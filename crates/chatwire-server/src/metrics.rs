//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Call once at startup before anything is recorded. Fails if another
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render the Prometheus text exposition.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// HTTP requests served (counter, labels: method, status).
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
/// HTTP requests rejected before dispatch (counter, labels: reason).
pub const HTTP_REJECTED_TOTAL: &str = "http_rejected_total";
/// Accept errors on the listener (counter).
pub const TCP_ACCEPT_ERRORS_TOTAL: &str = "tcp_accept_errors_total";
/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Handshakes refused (counter, labels: reason).
pub const WS_HANDSHAKE_REJECTED_TOTAL: &str = "ws_handshake_rejected_total";
/// Inbound frames (counter, labels: opcode).
pub const WS_FRAMES_RECEIVED_TOTAL: &str = "ws_frames_received_total";
/// Inbound frames that failed to decode (counter).
pub const WS_FRAME_ERRORS_TOTAL: &str = "ws_frame_errors_total";
/// Chat protocol messages handled (counter, labels: kind).
pub const CHAT_MESSAGES_TOTAL: &str = "chat_messages_total";
/// Chat message handling duration seconds (histogram).
pub const CHAT_MESSAGE_DURATION_SECONDS: &str = "chat_message_duration_seconds";
/// Broadcast deliveries queued (counter).
pub const WS_BROADCAST_RECIPIENTS_TOTAL: &str = "ws_broadcast_recipients_total";
/// Broadcast deliveries that failed (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
