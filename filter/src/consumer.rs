use crate::config::Settings;
use crate::errors::Result;
use crate::metrics::Metrics;
use crate::model::InboundMessage;
use crate::worker::BlockingWorker;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on how long one poll may block, and so on shutdown latency
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a batch of end-of-partition seeks may take
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer context that moves every newly assigned partition to its end.
///
/// The filter only cares about current telemetry, so backlog left over from a
/// previous owner of the partition is skipped rather than replayed. The
/// rebalance callback only records the assignment; the poll loop performs the
/// seek before handing on anything from those partitions.
pub struct TailContext {
    metrics: Arc<Metrics>,
    pending_seek: Mutex<Vec<(String, i32)>>,
}

impl TailContext {
    fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            pending_seek: Mutex::new(Vec::new()),
        }
    }

    /// Partitions assigned since the last call, still to be moved to their end
    fn take_pending_seek(&self) -> Vec<(String, i32)> {
        std::mem::take(&mut *self.pending_seek.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl ClientContext for TailContext {
    fn error(&self, error: KafkaError, reason: &str) {
        record_error(&self.metrics, &error, reason);
    }

    fn stats_raw(&self, statistics: &[u8]) {
        match overall_lag(statistics) {
            Ok(lag) => {
                self.metrics.consumer_lag.set(lag);
                // Statistics only arrive once the client talks to the cluster
                self.metrics.consumer_health.mark_connected();
            }
            Err(e) => warn!(error = %e, "Unreadable client statistics"),
        }
    }
}

impl ConsumerContext for TailContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        let mut pending = self.pending_seek.lock().unwrap_or_else(|e| e.into_inner());
        match rebalance {
            Rebalance::Assign(assigned) => {
                info!(partitions = assigned.count(), "Partitions assigned, seeking to end");
                for element in assigned.elements() {
                    let partition = (element.topic().to_string(), element.partition());
                    if !pending.contains(&partition) {
                        pending.push(partition);
                    }
                }
            }
            Rebalance::Revoke(revoked) => {
                info!(partitions = revoked.count(), "Partitions revoked");
                for element in revoked.elements() {
                    pending.retain(|(topic, partition)| {
                        topic != element.topic() || *partition != element.partition()
                    });
                }
            }
            Rebalance::Error(e) => {
                error!(error = %e, "Rebalance failed");
            }
        }
    }
}

/// Partition list positioning every given partition at its newest offset
pub fn end_offsets(partitions: &[(String, i32)]) -> TopicPartitionList {
    let mut tail = TopicPartitionList::with_capacity(partitions.len());
    for (topic, partition) in partitions {
        if let Err(e) = tail.add_partition_offset(topic, *partition, Offset::End) {
            warn!(topic = %topic, partition, error = %e, "Could not set end offset");
        }
    }
    tail
}

fn seek_to_end(consumer: &BaseConsumer<TailContext>, partitions: &[(String, i32)]) {
    match consumer.seek_partitions(end_offsets(partitions), SEEK_TIMEOUT) {
        Ok(result) => {
            for element in result.elements() {
                if let Err(e) = element.error() {
                    consumer.context().metrics.consumer_errors.inc();
                    error!(
                        topic = element.topic(),
                        partition = element.partition(),
                        error = %e,
                        "Failed to seek partition to end"
                    );
                }
            }
        }
        Err(e) => record_error(&consumer.context().metrics, &e, "seek"),
    }
}

#[derive(Debug, Deserialize)]
struct ClientStatistics {
    #[serde(default)]
    topics: HashMap<String, TopicStatistics>,
}

#[derive(Debug, Deserialize)]
struct TopicStatistics {
    #[serde(default)]
    partitions: HashMap<String, PartitionStatistics>,
}

#[derive(Debug, Deserialize)]
struct PartitionStatistics {
    #[serde(default = "unknown_lag")]
    consumer_lag: i64,
}

fn unknown_lag() -> i64 {
    -1
}

/// Sum of the known per-partition consumer lag in a librdkafka statistics document
fn overall_lag(statistics: &[u8]) -> serde_json::Result<i64> {
    let statistics: ClientStatistics = serde_json::from_slice(statistics)?;
    Ok(statistics
        .topics
        .values()
        .flat_map(|topic| topic.partitions.values())
        .map(|partition| partition.consumer_lag)
        .filter(|lag| *lag >= 0)
        .sum())
}

/// Unknown topics show up while topics are still being provisioned and are not
/// a sign of an unhealthy broker.
fn is_soft_error(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) | Some(RDKafkaErrorCode::UnknownTopic)
    )
}

fn record_error(metrics: &Metrics, error: &KafkaError, reason: &str) {
    if is_soft_error(error) {
        warn!(error = %error, reason, "Unknown topic");
        return;
    }
    error!(error = %error, reason, "Kafka consumer error");
    metrics.consumer_errors.inc();
    let code = error
        .rdkafka_error_code()
        .map(|code| format!("{:?}", code))
        .unwrap_or_else(|| "Unknown".to_string());
    metrics.consumer_health.set_error(code, error.to_string());
}

/// Consumes the input topics on a dedicated blocking worker and hands each
/// message to a single receiver.
pub struct IngressBridge {
    worker: BlockingWorker,
}

impl IngressBridge {
    /// Subscribe to `topics` and start polling.
    ///
    /// Messages arrive on the returned receiver in poll order; the channel closes
    /// once the bridge is closed.
    pub fn subscribe(
        settings: &Settings,
        topics: &[String],
        metrics: Arc<Metrics>,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>)> {
        info!("Connecting consumer to {}", settings.bootstrap_servers);
        let context = TailContext::new(metrics.clone());
        let consumer: BaseConsumer<TailContext> =
            settings.consumer_config().create_with_context(context)?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;
        info!("Subscribed to topics: {:?}", topics);

        let (tx, rx) = mpsc::channel(settings.channel_capacity);
        let worker = BlockingWorker::spawn("consumer", move |token| {
            poll_loop(consumer, tx, token, metrics)
        });

        Ok((Self { worker }, rx))
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop polling, unsubscribe and release the client
    pub async fn close(&mut self) {
        info!("Closing consumer");
        self.worker.stop().await;
    }
}

fn poll_loop(
    consumer: BaseConsumer<TailContext>,
    tx: mpsc::Sender<InboundMessage>,
    token: CancellationToken,
    metrics: Arc<Metrics>,
) {
    info!("Beginning polling");

    while !token.is_cancelled() {
        let polled = consumer.poll(POLL_INTERVAL);

        // Assignment happens inside poll; reposition before anything from the
        // new partitions reaches the pipeline.
        let reassigned = consumer.context().take_pending_seek();
        if !reassigned.is_empty() {
            seek_to_end(&consumer, &reassigned);
            if let Some(Ok(message)) = &polled {
                let partition = (message.topic().to_string(), message.partition());
                if reassigned.contains(&partition) {
                    debug!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        "Skipped message fetched before end-of-partition seek"
                    );
                    continue;
                }
            }
        }

        match polled {
            None => continue,
            Some(Ok(message)) => {
                metrics.consumer_health.set_ok();
                let inbound = InboundMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                };
                debug!(
                    topic = %inbound.topic,
                    partition = inbound.partition,
                    offset = inbound.offset,
                    "Received message"
                );
                if tx.blocking_send(inbound).is_err() {
                    warn!("Pipeline receiver dropped, stopping consumer");
                    break;
                }
            }
            Some(Err(e)) => record_error(&metrics, &e, "poll"),
        }
    }

    consumer.unsubscribe();
    metrics.consumer_health.set_closed();
    info!("Consumer finished");
}
