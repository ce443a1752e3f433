//! Prometheus metrics for the HTTP surface and the relay.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::server::relay::RelayReport;

pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    sessions: IntCounterVec,
    frames: IntCounterVec,
    active_sessions: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("token_relay_requests_total", "Chat requests by route and outcome"),
            &["route", "outcome"],
        )?;
        let sessions = IntCounterVec::new(
            Opts::new("token_relay_sessions_total", "Finished relay sessions by final state"),
            &["state"],
        )?;
        let frames = IntCounterVec::new(
            Opts::new("token_relay_frames_total", "Data frames written to clients"),
            &["backend"],
        )?;
        let active_sessions =
            IntGauge::new("token_relay_active_sessions", "Relay sessions currently streaming")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(frames.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Self {
            registry,
            requests,
            sessions,
            frames,
            active_sessions,
        })
    }

    pub fn record_request(&self, route: &str, outcome: &str) {
        self.requests.with_label_values(&[route, outcome]).inc();
    }

    pub fn session_started(&self) {
        self.active_sessions.inc();
    }

    pub fn session_finished(&self, backend: &str, report: &RelayReport) {
        self.active_sessions.dec();
        self.sessions.with_label_values(&[report.state.as_str()]).inc();
        self.frames
            .with_label_values(&[backend])
            .inc_by(report.frames_written as u64);
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("Failed to encode metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::relay::RelayState;

    #[test]
    fn test_session_accounting() {
        let metrics = Metrics::new().unwrap();
        metrics.session_started();
        metrics.session_finished(
            "mock",
            &RelayReport {
                session_id: uuid::Uuid::new_v4(),
                state: RelayState::Completed,
                frames_written: 3,
                error: None,
            },
        );
        metrics.record_request("chat", "ok");

        let text = metrics.render();
        assert!(text.contains("token_relay_sessions_total{state=\"completed\"} 1"));
        assert!(text.contains("token_relay_frames_total{backend=\"mock\"} 3"));
        assert!(text.contains("token_relay_active_sessions 0"));
        assert!(text.contains("token_relay_requests_total{outcome=\"ok\",route=\"chat\"} 1"));
    }
}
