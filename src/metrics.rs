// Numan Thabit 2025
// metrics.rs - Prometheus counters for the gateway core

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub frames_tx: IntCounter,
    pub frames_rx: IntCounter,
    pub serial_frames: IntCounter,
    pub serial_rejects: IntCounter,
    pub wake_signals: IntCounter,
    pub queue_depth: IntGauge,
    pub queue_evictions: IntCounter,
    pub sessions_opened: IntCounter,
    pub sessions_closed: IntCounter,
    pub connect_failures: IntCounter,
    pub protocol_violations: IntCounter,
    pub auth_rejects: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("goster_gateway".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let frames_tx = register_counter!("frames_tx_total", "Frames written to the server");
        let frames_rx = register_counter!("frames_rx_total", "Frames received from the server");
        let serial_frames =
            register_counter!("serial_frames_total", "Valid frames accepted from the sensor link");
        let serial_rejects =
            register_counter!("serial_rejects_total", "Serial regions dropped by validation");
        let wake_signals = register_counter!("wake_signals_total", "Wake sentinels observed");
        let queue_depth = register_gauge!("queue_depth", "Pending transmit queue entries");
        let queue_evictions =
            register_counter!("queue_evictions_total", "Entries evicted by queue overflow");
        let sessions_opened = register_counter!("sessions_opened_total", "Server sessions opened");
        let sessions_closed = register_counter!("sessions_closed_total", "Server sessions closed");
        let connect_failures =
            register_counter!("connect_failures_total", "TCP connect attempts that failed");
        let protocol_violations = register_counter!(
            "protocol_violations_total",
            "Frames dropped for framing or crypto failures"
        );
        let auth_rejects = register_counter!("auth_rejects_total", "AUTH_ACK rejections");

        Ok(Self {
            registry,
            frames_tx,
            frames_rx,
            serial_frames,
            serial_rejects,
            wake_signals,
            queue_depth,
            queue_evictions,
            sessions_opened,
            sessions_closed,
            connect_failures,
            protocol_violations,
            auth_rejects,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_metrics_registry() {
        let metrics = Metrics::new().expect("metrics");
        metrics.frames_tx.inc();
        metrics.queue_depth.set(3);
        metrics.auth_rejects.inc();
        assert!(!metrics.gather().is_empty());
    }
}
