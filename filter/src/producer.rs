use crate::config::Settings;
use crate::errors::Result;
use crate::metrics::Metrics;
use crate::model::DeliveryOutcome;
use crate::pipeline::MessageSink;
use crate::worker::BlockingWorker;
use rdkafka::client::ClientContext;
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::util::Timeout;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Producer context that turns delivery reports into [`DeliveryOutcome`]s
pub struct DeliveryContext {
    outcomes: mpsc::UnboundedSender<DeliveryOutcome>,
    metrics: Arc<Metrics>,
}

impl ClientContext for DeliveryContext {
    fn error(&self, error: KafkaError, reason: &str) {
        error!(error = %error, reason, "Kafka producer error");
        let code = error
            .rdkafka_error_code()
            .map(|code| format!("{:?}", code))
            .unwrap_or_else(|| "Unknown".to_string());
        self.metrics.producer_health.set_error(code, error.to_string());
    }
}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<u64>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, id: Self::DeliveryOpaque) {
        let outcome = match delivery_result {
            Ok(message) => DeliveryOutcome {
                id: *id,
                topic: message.topic().to_string(),
                result: Ok((message.partition(), message.offset())),
            },
            Err((e, message)) => DeliveryOutcome {
                id: *id,
                topic: message.topic().to_string(),
                result: Err(e.to_string()),
            },
        };
        if self.outcomes.send(outcome).is_err() {
            warn!(id = *id, "Delivery report dropped, no receiver");
        }
    }
}

type FilterProducer = BaseProducer<DeliveryContext>;

/// Publishes filtered messages without waiting for the broker.
///
/// Every accepted send produces exactly one [`DeliveryOutcome`] on the channel
/// returned by [`EgressBridge::connect`]. The channel closes after [`MessageSink::close`].
pub struct EgressBridge {
    producer: Arc<FilterProducer>,
    next_id: AtomicU64,
    drainer: BlockingWorker,
    flush_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl EgressBridge {
    pub fn connect(
        settings: &Settings,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeliveryOutcome>)> {
        info!("Connecting producer to {}", settings.bootstrap_servers);
        let (tx, rx) = mpsc::unbounded_channel();
        let context = DeliveryContext {
            outcomes: tx,
            metrics: metrics.clone(),
        };
        let producer: FilterProducer = settings.producer_config().create_with_context(context)?;
        let producer = Arc::new(producer);

        let polled = producer.clone();
        let drainer = BlockingWorker::spawn("producer", move |token| {
            while !token.is_cancelled() {
                polled.poll(POLL_INTERVAL);
            }
        });

        Ok((
            Self {
                producer,
                next_id: AtomicU64::new(1),
                drainer,
                flush_timeout: settings.flush_timeout,
                metrics,
            },
            rx,
        ))
    }

    pub fn in_flight(&self) -> i32 {
        self.producer.in_flight_count()
    }
}

impl MessageSink for EgressBridge {
    fn send(&self, payload: &[u8], topic: &str) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = BaseRecord::<(), [u8], Box<u64>>::with_opaque_to(topic, Box::new(id))
            .payload(payload);
        self.producer.send(record).map_err(|(e, _)| e)?;
        Ok(id)
    }

    async fn close(mut self) {
        info!(
            in_flight = self.producer.in_flight_count(),
            "Flushing producer (timeout: {:?})", self.flush_timeout
        );
        let producer = self.producer.clone();
        let timeout = self.flush_timeout;
        match tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await {
            Ok(Ok(())) => info!("Producer flushed"),
            Ok(Err(e)) => warn!(
                error = %e,
                "Producer flush incomplete, undelivered messages will be reported as failed"
            ),
            Err(e) => error!("Producer flush task failed: {}", e),
        }

        self.drainer.stop().await;
        self.metrics.producer_health.set_closed();
        info!("Producer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_settings() -> Settings {
        let mut settings = Settings::from_env();
        settings.bootstrap_servers = "127.0.0.1:1".to_string();
        settings.message_timeout_ms = 500;
        settings.flush_timeout = Duration::from_secs(2);
        settings
    }

    #[tokio::test]
    async fn test_send_reports_failure_when_broker_unreachable() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (bridge, mut outcomes) = EgressBridge::connect(&unreachable_settings(), metrics).unwrap();

        let first = bridge.send(b"{}", "sensors-filtered").unwrap();
        let second = bridge.send(b"{}", "sensors-filtered").unwrap();
        assert_ne!(first, second);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let outcome = tokio::time::timeout(Duration::from_secs(10), outcomes.recv())
                .await
                .expect("delivery report should arrive")
                .expect("channel open");
            assert!(!outcome.is_success());
            assert_eq!(outcome.topic, "sensors-filtered");
            seen.push(outcome.id);
        }
        seen.sort();
        assert_eq!(seen, vec![first, second]);

        tokio::time::timeout(Duration::from_secs(10), bridge.close())
            .await
            .expect("close should be bounded");
        assert!(outcomes.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_bounded_with_pending_messages() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let mut settings = unreachable_settings();
        settings.message_timeout_ms = 60_000;
        settings.flush_timeout = Duration::from_millis(500);
        let (bridge, mut outcomes) = EgressBridge::connect(&settings, metrics.clone()).unwrap();

        bridge.send(b"payload", "power-filtered").unwrap();
        assert!(bridge.in_flight() >= 1);

        tokio::time::timeout(Duration::from_secs(10), bridge.close())
            .await
            .expect("close should not wait for the message timeout");
        assert_eq!(
            metrics.producer_health.snapshot().status,
            crate::metrics::BrokerStatus::Closed
        );

        // Whatever was reported before shutdown, the channel ends
        while let Some(outcome) = outcomes.recv().await {
            assert!(!outcome.is_success());
        }
    }
}
