use crate::errors::Result;
use crate::metrics::Metrics;
use crate::model::{DeliveryOutcome, InboundMessage, TelemetryPayload};
use crate::throttle::RuleSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

/// Where admitted messages are published
pub trait MessageSink {
    /// Queue `payload` for `topic` and return the id its [`DeliveryOutcome`] will carry
    fn send(&self, payload: &[u8], topic: &str) -> Result<u64>;

    /// Flush what is still queued and release the client
    fn close(self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Forwarded { id: u64, topic: String },
    Dropped,
    SendFailed,
}

/// Counter values at the start of the current rate window
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    consumed: u64,
    produced: u64,
    started: Instant,
}

/// Decode, rate-limit and republish loop. Owns the rule state.
pub struct Pipeline {
    rules: RuleSet,
    suffix: String,
    metrics: Arc<Metrics>,
    window: RateWindow,
}

impl Pipeline {
    pub fn new(rules: RuleSet, suffix: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        let window = RateWindow {
            consumed: metrics.consumed.get(),
            produced: metrics.produced.get(),
            started: Instant::now(),
        };
        Self {
            rules,
            suffix: suffix.into(),
            metrics,
            window,
        }
    }

    pub fn handle_message<S: MessageSink>(&mut self, sink: &S, message: &InboundMessage) -> Verdict {
        self.metrics.consumed.inc();

        let admitted = match serde_json::from_slice::<TelemetryPayload>(&message.payload) {
            Ok(payload) => match self.rules.admit(&message.topic, &payload) {
                Ok(admitted) => admitted,
                Err(e) => {
                    warn!(
                        topic = %message.topic,
                        offset = message.offset,
                        error = %e,
                        "Unparseable sensor timestamp, forwarding unfiltered"
                    );
                    self.metrics.malformed.inc();
                    true
                }
            },
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    offset = message.offset,
                    error = %e,
                    "Failed to decode telemetry, forwarding unfiltered"
                );
                self.metrics.malformed.inc();
                true
            }
        };
        self.metrics.tracked_sensors.set(self.rules.tracked_sensors() as i64);

        if !admitted {
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Dropped stale message"
            );
            self.metrics.dropped.inc();
            return Verdict::Dropped;
        }

        let destination = self.rules.destination_for(&message.topic, &self.suffix);
        match sink.send(&message.payload, &destination) {
            Ok(id) => {
                debug!(
                    id,
                    from = %message.topic,
                    to = %destination,
                    "Forwarded message"
                );
                Verdict::Forwarded {
                    id,
                    topic: destination,
                }
            }
            Err(e) => {
                error!(topic = %destination, error = %e, "Failed to queue message");
                self.metrics.delivery_failures.inc();
                Verdict::SendFailed
            }
        }
    }

    pub fn handle_delivery(&self, outcome: &DeliveryOutcome) {
        match &outcome.result {
            Ok((partition, offset)) => {
                debug!(
                    id = outcome.id,
                    topic = %outcome.topic,
                    partition,
                    offset,
                    "Delivered message"
                );
                self.metrics.produced.inc();
                self.metrics.producer_health.set_ok();
            }
            Err(e) => {
                error!(
                    id = outcome.id,
                    topic = %outcome.topic,
                    error = %e,
                    "Delivery failed"
                );
                self.metrics.delivery_failures.inc();
            }
        }
    }

    /// Set the per-second gauges from the counter deltas since the last update
    fn update_rates(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window.started).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let consumed = self.metrics.consumed.get();
        let produced = self.metrics.produced.get();
        self.metrics
            .consumed_per_second
            .set(consumed.saturating_sub(self.window.consumed) as f64 / elapsed);
        self.metrics
            .produced_per_second
            .set(produced.saturating_sub(self.window.produced) as f64 / elapsed);
        self.window = RateWindow {
            consumed,
            produced,
            started: now,
        };
    }

    fn log_summary(&mut self) {
        self.update_rates(Instant::now());
        let report = self.metrics.report();
        info!(
            consumed = report.consumed_messages,
            produced = report.produced_messages,
            consumed_per_second = report.consumed_per_second,
            produced_per_second = report.produced_per_second,
            consumer_lag = report.consumer_lag,
            dropped = report.dropped_messages,
            malformed = report.malformed_messages,
            delivery_failures = report.delivery_failures,
            tracked_sensors = report.tracked_sensors,
            "Filter summary"
        );
    }

    /// Run until the consumer side closes and every delivery report is drained.
    ///
    /// When `messages` ends the sink is closed, which flushes it and in turn
    /// ends `deliveries`.
    pub async fn run<S: MessageSink>(
        mut self,
        sink: S,
        mut messages: mpsc::Receiver<InboundMessage>,
        mut deliveries: mpsc::UnboundedReceiver<DeliveryOutcome>,
    ) {
        info!("Pipeline started");
        let mut sink = Some(sink);
        let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                message = messages.recv(), if sink.is_some() => match message {
                    Some(message) => {
                        if let Some(sink) = sink.as_ref() {
                            self.handle_message(sink, &message);
                        }
                    }
                    None => {
                        info!("Input closed, flushing output");
                        if let Some(sink) = sink.take() {
                            let closing = sink.close();
                            tokio::pin!(closing);
                            // Keep draining reports so the flush is not starved
                            loop {
                                tokio::select! {
                                    _ = &mut closing => break,
                                    Some(outcome) = deliveries.recv() => self.handle_delivery(&outcome),
                                }
                            }
                        }
                    }
                },
                outcome = deliveries.recv() => match outcome {
                    Some(outcome) => self.handle_delivery(&outcome),
                    None => break,
                },
                _ = ticker.tick() => self.log_summary(),
            }
        }

        self.log_summary();
        info!("Pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ThrottleRule;
    use crate::timestamp::TimestampParser;
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// In-memory sink that acknowledges every send immediately
    struct FakeSink {
        sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        outcomes: mpsc::UnboundedSender<DeliveryOutcome>,
        next_id: AtomicU64,
        fail_sends: bool,
    }

    impl FakeSink {
        fn new(outcomes: mpsc::UnboundedSender<DeliveryOutcome>) -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                outcomes,
                next_id: AtomicU64::new(1),
                fail_sends: false,
            }
        }
    }

    impl MessageSink for FakeSink {
        fn send(&self, payload: &[u8], topic: &str) -> Result<u64> {
            if self.fail_sends {
                return Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull).into());
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
            let _ = self.outcomes.send(DeliveryOutcome {
                id,
                topic: topic.to_string(),
                result: Ok((0, id as i64)),
            });
            Ok(id)
        }

        async fn close(self) {}
    }

    fn telemetry(timestamp: &str) -> Vec<u8> {
        serde_json::json!({
            "Context": "x3000c0s19b1",
            "Events": [{
                "EventTimestamp": timestamp,
                "MessageId": "CrayTelemetry.Temperature",
                "Oem": {
                    "TelemetrySource": "River",
                    "Sensors": [{
                        "Timestamp": timestamp,
                        "Location": "x3000c0s19b1n0",
                        "PhysicalContext": "CPU",
                        "Index": 0,
                        "Value": "41.0"
                    }]
                }
            }]
        })
        .to_string()
        .into_bytes()
    }

    fn inbound(topic: &str, payload: Vec<u8>) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: 0,
            payload,
        }
    }

    fn pipeline(rules: &[ThrottleRule]) -> (Pipeline, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let rule_set = RuleSet::with_rules(TimestampParser::default(), 1000, rules);
        (Pipeline::new(rule_set, "-filtered", metrics.clone()), metrics)
    }

    #[test]
    fn test_forwards_fresh_and_drops_stale() {
        let (mut pipeline, metrics) = pipeline(&[]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = FakeSink::new(tx);

        let first = pipeline.handle_message(&sink, &inbound("sensors", telemetry("2021-07-26T14:25:00Z")));
        assert_eq!(
            first,
            Verdict::Forwarded {
                id: 1,
                topic: "sensors-filtered".to_string()
            }
        );

        let second = pipeline.handle_message(&sink, &inbound("sensors", telemetry("2021-07-26T14:25:10Z")));
        assert_eq!(second, Verdict::Dropped);

        let third = pipeline.handle_message(&sink, &inbound("sensors", telemetry("2021-07-26T14:25:30Z")));
        assert!(matches!(third, Verdict::Forwarded { .. }));

        assert_eq!(metrics.consumed.get(), 3);
        assert_eq!(metrics.dropped.get(), 1);
        assert_eq!(metrics.tracked_sensors.get(), 1);
        assert_eq!(sink.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_payload_is_forwarded_unchanged() {
        let (mut pipeline, metrics) = pipeline(&[]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = FakeSink::new(tx);

        let body = b"not json at all".to_vec();
        let verdict = pipeline.handle_message(&sink, &inbound("sensors", body.clone()));

        assert!(matches!(verdict, Verdict::Forwarded { .. }));
        assert_eq!(metrics.malformed.get(), 1);
        assert_eq!(sink.sent.lock().unwrap()[0], ("sensors-filtered".to_string(), body));
    }

    #[test]
    fn test_bad_timestamp_fails_open() {
        let (mut pipeline, metrics) = pipeline(&[]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = FakeSink::new(tx);

        let verdict = pipeline.handle_message(&sink, &inbound("sensors", telemetry("yesterday-ish")));
        assert!(matches!(verdict, Verdict::Forwarded { .. }));
        assert_eq!(metrics.malformed.get(), 1);
        assert_eq!(metrics.tracked_sensors.get(), 0);
    }

    #[test]
    fn test_destination_topic_rule() {
        let (mut pipeline, _metrics) = pipeline(&[ThrottleRule {
            topic: "power".to_string(),
            rate: 5.0,
            destination_topic: Some("power-sampled".to_string()),
        }]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = FakeSink::new(tx);

        let verdict = pipeline.handle_message(&sink, &inbound("power", telemetry("2021-07-26T14:25:00Z")));
        assert_eq!(
            verdict,
            Verdict::Forwarded {
                id: 1,
                topic: "power-sampled".to_string()
            }
        );
    }

    #[test]
    fn test_send_failure_is_counted() {
        let (mut pipeline, metrics) = pipeline(&[]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sink = FakeSink::new(tx);
        sink.fail_sends = true;

        let verdict = pipeline.handle_message(&sink, &inbound("sensors", telemetry("2021-07-26T14:25:00Z")));
        assert_eq!(verdict, Verdict::SendFailed);
        assert_eq!(metrics.delivery_failures.get(), 1);
    }

    #[test]
    fn test_delivery_outcomes_update_metrics() {
        let (pipeline, metrics) = pipeline(&[]);

        pipeline.handle_delivery(&DeliveryOutcome {
            id: 1,
            topic: "sensors-filtered".to_string(),
            result: Ok((0, 10)),
        });
        pipeline.handle_delivery(&DeliveryOutcome {
            id: 2,
            topic: "sensors-filtered".to_string(),
            result: Err("Message timed out".to_string()),
        });

        assert_eq!(metrics.produced.get(), 1);
        assert_eq!(metrics.delivery_failures.get(), 1);
        assert_eq!(
            metrics.producer_health.snapshot().status,
            crate::metrics::BrokerStatus::Ok
        );
    }

    #[test]
    fn test_rates_follow_counter_deltas() {
        let (mut pipeline, metrics) = pipeline(&[]);
        let start = pipeline.window.started;

        metrics.consumed.inc_by(100);
        metrics.produced.inc_by(40);
        pipeline.update_rates(start + Duration::from_secs(2));
        assert_eq!(metrics.consumed_per_second.get(), 50.0);
        assert_eq!(metrics.produced_per_second.get(), 20.0);

        metrics.consumed.inc_by(10);
        pipeline.update_rates(start + Duration::from_secs(7));
        assert_eq!(metrics.consumed_per_second.get(), 2.0);
        assert_eq!(metrics.produced_per_second.get(), 0.0);

        // A clock that did not move leaves the gauges alone
        pipeline.update_rates(start + Duration::from_secs(7));
        assert_eq!(metrics.consumed_per_second.get(), 2.0);
    }

    #[tokio::test]
    async fn test_run_drains_until_input_closes() {
        let (pipeline, metrics) = pipeline(&[]);
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let sink = FakeSink::new(outcomes_tx);
        let sent = sink.sent.clone();
        let (messages_tx, messages_rx) = mpsc::channel(16);

        let handle = tokio::spawn(pipeline.run(sink, messages_rx, outcomes_rx));

        for timestamp in ["2021-07-26T14:25:00Z", "2021-07-26T14:25:01Z", "2021-07-26T14:26:00Z"] {
            messages_tx.send(inbound("sensors", telemetry(timestamp))).await.unwrap();
        }
        drop(messages_tx);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("pipeline should stop once input and deliveries end")
            .unwrap();

        assert_eq!(metrics.consumed.get(), 3);
        assert_eq!(metrics.dropped.get(), 1);
        assert_eq!(metrics.produced.get(), 2);
        assert_eq!(sent.lock().unwrap().len(), 2);
    }
}
