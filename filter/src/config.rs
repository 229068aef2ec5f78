use rdkafka::config::ClientConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process settings, read once at startup and passed to every component
#[derive(Debug, Clone)]
pub struct Settings {
    pub bootstrap_servers: String,
    pub consumer_group: String,
    pub client_id: String,
    pub filtered_topic_suffix: String,
    pub topic_file: PathBuf,
    pub throttling_file: PathBuf,
    pub http_addr: String,
    pub channel_capacity: usize,
    pub max_tracked_sensors: usize,
    pub timestamp_fail_soft: bool,
    pub local_timezone: Option<String>,
    pub flush_timeout: Duration,
    pub session_timeout_ms: u64,
    pub message_timeout_ms: u64,
    pub statistics_interval_ms: u64,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Self {
            bootstrap_servers: string("KAFKA_BOOTSTRAP_SERVERS", "broker:29092"),
            consumer_group: string("KAFKA_CONSUMER_GROUP", "metrics-filter-group"),
            client_id: lookup("KAFKA_CLIENT_ID")
                .unwrap_or_else(|| format!("metrics-filter-{}", uuid::Uuid::new_v4())),
            filtered_topic_suffix: string("FILTERED_TOPIC_SUFFIX", "-filtered"),
            topic_file: string("KAFKA_TOPIC_FILE", "/usr/local/etc/service/kafka-topics.json").into(),
            throttling_file: string(
                "KAFKA_THROTTLING_CONFIG",
                "/usr/local/etc/service/topic-throttling.json",
            )
            .into(),
            http_addr: string("HTTP_ADDR", "0.0.0.0:9088"),
            channel_capacity: parse_or(lookup("CHANNEL_CAPACITY"), 10_000),
            max_tracked_sensors: parse_or(lookup("MAX_TRACKED_SENSORS"), 100_000),
            timestamp_fail_soft: parse_or(lookup("TIMESTAMP_FAIL_SOFT"), false),
            local_timezone: lookup("LOCAL_TIMEZONE").filter(|tz| !tz.is_empty()),
            flush_timeout: Duration::from_secs(parse_or(lookup("FLUSH_TIMEOUT_SECS"), 10)),
            session_timeout_ms: parse_or(lookup("CONSUMER_SESSION_TIMEOUT_MS"), 6000),
            message_timeout_ms: parse_or(lookup("PRODUCER_MESSAGE_TIMEOUT_MS"), 30_000),
            statistics_interval_ms: parse_or(lookup("STATISTICS_INTERVAL_MS"), 5000),
        }
    }

    /// Consumer client settings.
    ///
    /// `auto.offset.reset=earliest` only matters for a group without committed
    /// offsets; the consumer seeks every assigned partition to its end anyway.
    pub fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &self.consumer_group)
            .set("client.id", &self.client_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            // Feeds the consumer lag gauge; 0 turns statistics off
            .set("statistics.interval.ms", self.statistics_interval_ms.to_string());
        config
    }

    pub fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            // Bounds how long a send can go without a delivery report
            .set("message.timeout.ms", self.message_timeout_ms.to_string());
        config
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings(&[]);

        assert_eq!(settings.bootstrap_servers, "broker:29092");
        assert_eq!(settings.consumer_group, "metrics-filter-group");
        assert_eq!(settings.filtered_topic_suffix, "-filtered");
        assert_eq!(settings.max_tracked_sensors, 100_000);
        assert!(!settings.timestamp_fail_soft);
        assert!(settings.local_timezone.is_none());
        assert!(settings.client_id.starts_with("metrics-filter-"));
        assert_eq!(settings.flush_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let settings = settings(&[
            ("KAFKA_BOOTSTRAP_SERVERS", "kafka:9092"),
            ("FILTERED_TOPIC_SUFFIX", "-sampled"),
            ("TIMESTAMP_FAIL_SOFT", "true"),
            ("CHANNEL_CAPACITY", "not-a-number"),
            ("LOCAL_TIMEZONE", "CST6CDT"),
            ("KAFKA_CLIENT_ID", "filter-0"),
        ]);

        assert_eq!(settings.bootstrap_servers, "kafka:9092");
        assert_eq!(settings.filtered_topic_suffix, "-sampled");
        assert!(settings.timestamp_fail_soft);
        assert_eq!(settings.channel_capacity, 10_000);
        assert_eq!(settings.local_timezone.as_deref(), Some("CST6CDT"));
        assert_eq!(settings.client_id, "filter-0");
    }

    #[test]
    fn test_client_configs() {
        let settings = settings(&[("KAFKA_CONSUMER_GROUP", "group-a")]);

        let consumer = settings.consumer_config();
        assert_eq!(consumer.get("group.id"), Some("group-a"));
        assert_eq!(consumer.get("enable.auto.commit"), Some("true"));
        assert_eq!(consumer.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(consumer.get("statistics.interval.ms"), Some("5000"));

        let producer = settings.producer_config();
        assert_eq!(producer.get("bootstrap.servers"), Some("broker:29092"));
        assert!(producer.get("group.id").is_none());
    }
}
