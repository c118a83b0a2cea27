//! Prometheus gauges for open sessions/channels, labeled by backend, node
//! and cluster, matching `session/ssh_session.go`'s `openSessionsMetric`/
//! `openChannelsMetric` exactly (same namespace, subsystem and label set),
//! served on `:9191` at `/metrics` the way `cmd/wormhole/main.go` exposes
//! `promhttp.Handler()`.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

pub struct Metrics {
    registry: Registry,
    open_sessions: GaugeVec,
    open_channels: GaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let open_sessions = GaugeVec::new(
            Opts::new("open_sessions_total", "Number of active sessions.").namespace("wormhole"),
            &["backend", "node", "cluster"],
        )
        .expect("static gauge config is valid");
        let open_channels = GaugeVec::new(
            Opts::new("open_channels_total", "Number of active data streams.").namespace("wormhole"),
            &["backend", "node", "cluster"],
        )
        .expect("static gauge config is valid");

        registry
            .register(Box::new(open_sessions.clone()))
            .expect("metric not already registered");
        registry
            .register(Box::new(open_channels.clone()))
            .expect("metric not already registered");

        Self {
            registry,
            open_sessions,
            open_channels,
        }
    }

    pub fn session_opened(&self, backend: &str, node: &str, cluster: &str) {
        self.open_sessions.with_label_values(&[backend, node, cluster]).inc();
    }

    pub fn session_closed(&self, backend: &str, node: &str, cluster: &str) {
        self.open_sessions.with_label_values(&[backend, node, cluster]).dec();
    }

    pub fn channel_opened(&self, backend: &str, node: &str, cluster: &str) {
        self.open_channels.with_label_values(&[backend, node, cluster]).inc();
    }

    pub fn channel_closed(&self, backend: &str, node: &str, cluster: &str) {
        self.open_channels.with_label_values(&[backend, node, cluster]).dec();
    }

    fn render(&self) -> String {
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("prometheus text encoding is infallible");
        String::from_utf8(buf).expect("prometheus output is valid utf-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves `metrics` at `GET /metrics` on `addr` until the process exits.
pub async fn serve(addr: SocketAddr, metrics: std::sync::Arc<Metrics>) {
    let app = Router::new()
        .route("/metrics", get(move || render_handler(metrics.clone())))
        .into_make_service();

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(err) => {
            error!("failed to bind metrics listener on {addr}: {err}");
            return;
        }
    };
    info!("metrics listening on {addr}");
    if let Err(err) = axum::serve(listener, app).await {
        error!("metrics server exited: {err}");
    }
}

async fn render_handler(metrics: std::sync::Arc<Metrics>) -> String {
    metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_balance_around_a_session_and_channel() {
        let metrics = Metrics::new();
        metrics.session_opened("B1", "node-a", "cluster-1");
        metrics.channel_opened("B1", "node-a", "cluster-1");
        let rendered = metrics.render();
        assert!(rendered.contains("wormhole_open_sessions_total"));
        assert!(rendered.contains("wormhole_open_channels_total"));

        metrics.channel_closed("B1", "node-a", "cluster-1");
        metrics.session_closed("B1", "node-a", "cluster-1");
        let rendered = metrics.render();
        assert!(rendered.contains("wormhole_open_sessions_total{backend=\"B1\",cluster=\"cluster-1\",node=\"node-a\"} 0"));
    }
}
