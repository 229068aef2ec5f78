use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum BrokerStatus {
    #[default]
    Unknown,
    Ok,
    Error,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BrokerHealthSnapshot {
    pub status: BrokerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
}

/// Connection health of one broker client, updated from its I/O worker
#[derive(Debug, Default)]
pub struct BrokerHealth {
    inner: RwLock<BrokerHealthSnapshot>,
}

impl BrokerHealth {
    pub fn set_ok(&self) {
        if self.status() == BrokerStatus::Ok {
            return;
        }
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = BrokerHealthSnapshot {
            status: BrokerStatus::Ok,
            ..Default::default()
        };
    }

    pub fn set_error(&self, code: impl Into<String>, message: impl Into<String>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = BrokerHealthSnapshot {
            status: BrokerStatus::Error,
            last_error: Some(message.into()),
            last_error_code: Some(code.into()),
        };
    }

    /// Move from `Unknown` to `Ok`; a reported error or a close is kept.
    pub fn mark_connected(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.status == BrokerStatus::Unknown {
            inner.status = BrokerStatus::Ok;
        }
    }

    pub fn set_closed(&self) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).status = BrokerStatus::Closed;
    }

    pub fn status(&self) -> BrokerStatus {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn snapshot(&self) -> BrokerHealthSnapshot {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Running counters shared by the bridges, the pipeline and the HTTP layer
pub struct Metrics {
    registry: Registry,
    pub consumed: IntCounter,
    pub produced: IntCounter,
    pub dropped: IntCounter,
    pub malformed: IntCounter,
    pub delivery_failures: IntCounter,
    pub consumer_errors: IntCounter,
    pub tracked_sensors: IntGauge,
    pub consumer_lag: IntGauge,
    pub consumed_per_second: Gauge,
    pub produced_per_second: Gauge,
    pub consumer_health: BrokerHealth,
    pub producer_health: BrokerHealth,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let consumed = IntCounter::with_opts(Opts::new(
            "filter_messages_consumed_total",
            "Total messages consumed from the input topics",
        ))?;
        let produced = IntCounter::with_opts(Opts::new(
            "filter_messages_produced_total",
            "Total messages acknowledged on the filtered topics",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "filter_messages_dropped_total",
            "Total messages throttled because every sensor reading was stale",
        ))?;
        let malformed = IntCounter::with_opts(Opts::new(
            "filter_messages_malformed_total",
            "Total messages forwarded without a throttling decision",
        ))?;
        let delivery_failures = IntCounter::with_opts(Opts::new(
            "filter_delivery_failures_total",
            "Total messages the producer failed to deliver",
        ))?;
        let consumer_errors = IntCounter::with_opts(Opts::new(
            "filter_consumer_errors_total",
            "Total errors reported by the broker while polling",
        ))?;
        let tracked_sensors = IntGauge::with_opts(Opts::new(
            "filter_tracked_sensors",
            "Number of sensors with a recorded last-accepted timestamp",
        ))?;

        let consumer_lag = IntGauge::with_opts(Opts::new(
            "filter_consumer_lag",
            "Messages behind the end of the input partitions, from client statistics",
        ))?;
        let consumed_per_second = Gauge::with_opts(Opts::new(
            "filter_messages_consumed_per_second",
            "Consumption rate over the last summary interval",
        ))?;
        let produced_per_second = Gauge::with_opts(Opts::new(
            "filter_messages_produced_per_second",
            "Acknowledged production rate over the last summary interval",
        ))?;

        registry.register(Box::new(consumed.clone()))?;
        registry.register(Box::new(produced.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(malformed.clone()))?;
        registry.register(Box::new(delivery_failures.clone()))?;
        registry.register(Box::new(consumer_errors.clone()))?;
        registry.register(Box::new(tracked_sensors.clone()))?;
        registry.register(Box::new(consumer_lag.clone()))?;
        registry.register(Box::new(consumed_per_second.clone()))?;
        registry.register(Box::new(produced_per_second.clone()))?;

        Ok(Self {
            registry,
            consumed,
            produced,
            dropped,
            malformed,
            delivery_failures,
            consumer_errors,
            tracked_sensors,
            consumer_lag,
            consumed_per_second,
            produced_per_second,
            consumer_health: BrokerHealth::default(),
            producer_health: BrokerHealth::default(),
        })
    }

    /// Prometheus text exposition of every registered metric
    pub fn gather(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            consumer: self.consumer_health.snapshot(),
            producer: self.producer_health.snapshot(),
            consumed_messages: self.consumed.get(),
            produced_messages: self.produced.get(),
            dropped_messages: self.dropped.get(),
            malformed_messages: self.malformed.get(),
            delivery_failures: self.delivery_failures.get(),
            consumer_errors: self.consumer_errors.get(),
            tracked_sensors: self.tracked_sensors.get(),
            consumer_lag: self.consumer_lag.get(),
            consumed_per_second: self.consumed_per_second.get(),
            produced_per_second: self.produced_per_second.get(),
        }
    }

    /// Ready unless either broker client is in an error state
    pub fn is_ready(&self) -> bool {
        self.consumer_health.status() != BrokerStatus::Error
            && self.producer_health.status() != BrokerStatus::Error
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthReport {
    pub consumer: BrokerHealthSnapshot,
    pub producer: BrokerHealthSnapshot,
    pub consumed_messages: u64,
    pub produced_messages: u64,
    pub dropped_messages: u64,
    pub malformed_messages: u64,
    pub delivery_failures: u64,
    pub consumer_errors: u64,
    pub tracked_sensors: i64,
    pub consumer_lag: i64,
    pub consumed_per_second: f64,
    pub produced_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.consumed.inc_by(3);
        metrics.dropped.inc();

        let text = metrics.gather().unwrap();
        assert!(text.contains("filter_messages_consumed_total 3"));
        assert!(text.contains("filter_messages_dropped_total 1"));
    }

    #[test]
    fn test_broker_health_transitions() {
        let health = BrokerHealth::default();
        assert_eq!(health.snapshot().status, BrokerStatus::Unknown);

        health.set_error("BrokerTransportFailure", "connection refused");
        let snapshot = health.snapshot();
        assert_eq!(snapshot.status, BrokerStatus::Error);
        assert_eq!(snapshot.last_error.as_deref(), Some("connection refused"));

        health.set_ok();
        assert_eq!(health.snapshot(), BrokerHealthSnapshot {
            status: BrokerStatus::Ok,
            last_error: None,
            last_error_code: None,
        });

        health.set_closed();
        assert_eq!(health.snapshot().status, BrokerStatus::Closed);
    }

    #[test]
    fn test_mark_connected_only_leaves_unknown() {
        let health = BrokerHealth::default();
        health.mark_connected();
        assert_eq!(health.status(), BrokerStatus::Ok);

        let health = BrokerHealth::default();
        health.set_error("AllBrokersDown", "all brokers down");
        health.mark_connected();
        assert_eq!(health.status(), BrokerStatus::Error);

        health.set_ok();
        assert_eq!(health.snapshot().last_error, None);
        health.set_ok();
        assert_eq!(health.status(), BrokerStatus::Ok);
    }

    #[test]
    fn test_readiness_follows_broker_errors() {
        let metrics = Metrics::new().unwrap();
        assert!(metrics.is_ready());

        metrics.producer_health.set_error("MessageTimedOut", "timed out");
        assert!(!metrics.is_ready());

        metrics.producer_health.set_ok();
        assert!(metrics.is_ready());
    }
}
