//! Per-sensor admission decisions.
//!
//! Each [`FilterPattern`] remembers when it last let a reading through for every
//! sensor it has seen. A message is forwarded when at least one of its readings is
//! at least one sampling period newer than the last accepted reading for the same
//! sensor.

use crate::model::{Event, SensorReading, TelemetryPayload};
use crate::rules::{ThrottleRule, DEFAULT_RATE_SECS, DEFAULT_TOPIC};
use crate::timestamp::{TimestampError, TimestampParser};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Readings up to this much earlier than a full period still count as fresh.
pub const JITTER_MS: i64 = 100;

/// Identity of a single sensor, independent of the values it reports
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SensorKey {
    context: String,
    message_id: String,
    telemetry_source: String,
    location: String,
    parental_context: Option<String>,
    physical_context: Option<String>,
    physical_sub_context: Option<String>,
    device_specific_context: Option<String>,
    index: Option<u32>,
    parental_index: Option<u32>,
    sub_index: Option<u32>,
}

impl SensorKey {
    pub fn new(payload: &TelemetryPayload, event: &Event, sensor: &SensorReading) -> Self {
        Self {
            context: payload.context.clone(),
            message_id: event.message_id.clone(),
            telemetry_source: event.oem.telemetry_source.clone(),
            location: sensor.location.clone(),
            parental_context: sensor.parental_context.clone(),
            physical_context: sensor.physical_context.clone(),
            physical_sub_context: sensor.physical_sub_context.clone(),
            device_specific_context: sensor.device_specific_context.clone(),
            index: sensor.index,
            parental_index: sensor.parental_index,
            sub_index: sensor.sub_index,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    last_accepted_ms: i64,
    tick: u64,
}

/// Last-accepted timestamps per sensor, bounded by least-recently-seen eviction.
///
/// An evicted sensor is indistinguishable from one never seen, so its next
/// reading is admitted.
#[derive(Debug)]
pub struct SensorTimes {
    slots: HashMap<SensorKey, Slot>,
    recency: BTreeMap<u64, SensorKey>,
    next_tick: u64,
    capacity: usize,
    evicted: u64,
}

impl SensorTimes {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    /// Decide whether a reading is fresh and record it if so.
    ///
    /// Every observation refreshes the sensor's recency, fresh or not.
    pub fn observe(&mut self, key: SensorKey, timestamp_ms: i64, threshold_ms: i64) -> bool {
        let tick = self.next_tick;
        self.next_tick += 1;

        if let Some(slot) = self.slots.get_mut(&key) {
            if let Some(key) = self.recency.remove(&slot.tick) {
                self.recency.insert(tick, key);
            }
            slot.tick = tick;

            let elapsed = timestamp_ms.saturating_sub(slot.last_accepted_ms);
            if elapsed >= threshold_ms {
                slot.last_accepted_ms = timestamp_ms;
                return true;
            }
            return false;
        }

        self.recency.insert(tick, key.clone());
        self.slots.insert(
            key,
            Slot {
                last_accepted_ms: timestamp_ms,
                tick,
            },
        );
        while self.slots.len() > self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.slots.remove(&oldest);
            self.evicted += 1;
        }
        true
    }

    pub fn last_accepted(&self, key: &SensorKey) -> Option<i64> {
        self.slots.get(key).map(|slot| slot.last_accepted_ms)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

/// A rate rule bound to one topic, with its sensor bookkeeping
#[derive(Debug)]
pub struct FilterPattern {
    topic: String,
    rate_secs: f64,
    destination: Option<String>,
    sensor_times: SensorTimes,
}

impl FilterPattern {
    pub fn new(topic: impl Into<String>, rate_secs: f64, capacity: usize) -> Self {
        Self {
            topic: topic.into(),
            rate_secs,
            destination: None,
            sensor_times: SensorTimes::new(capacity),
        }
    }

    fn from_rule(rule: &ThrottleRule, capacity: usize) -> Self {
        Self {
            destination: rule.destination_topic.clone(),
            ..Self::new(rule.topic.clone(), rule.rate, capacity)
        }
    }

    pub fn applies(&self, topic: &str) -> bool {
        self.topic == topic
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn rate_secs(&self) -> f64 {
        self.rate_secs
    }

    pub fn threshold_ms(&self) -> i64 {
        (self.rate_secs * 1000.0).round() as i64 - JITTER_MS
    }

    pub fn sensor_times(&self) -> &SensorTimes {
        &self.sensor_times
    }

    /// Returns true when the payload should be forwarded.
    ///
    /// All timestamps are normalised before any state changes, so a parse error
    /// leaves the pattern untouched. A payload without sensors is dropped.
    pub fn should_forward(
        &mut self,
        payload: &TelemetryPayload,
        parser: &TimestampParser,
    ) -> Result<bool, TimestampError> {
        let mut readings = Vec::new();
        for event in &payload.events {
            for sensor in &event.oem.sensors {
                let timestamp_ms = parser.epoch_ms(&sensor.timestamp)?;
                readings.push((SensorKey::new(payload, event, sensor), timestamp_ms));
            }
        }

        let threshold_ms = self.threshold_ms();
        let mut forward = false;
        for (key, timestamp_ms) in readings {
            if self.sensor_times.observe(key, timestamp_ms, threshold_ms) {
                forward = true;
            }
        }

        debug!(
            topic = %self.topic,
            context = %payload.context,
            forward,
            "Evaluated payload"
        );
        Ok(forward)
    }
}

/// Ordered rate rules; the first pattern whose topic matches wins
#[derive(Debug)]
pub struct RuleSet {
    patterns: Vec<FilterPattern>,
    default: FilterPattern,
    parser: TimestampParser,
    capacity: usize,
}

impl RuleSet {
    pub fn new(parser: TimestampParser, capacity: usize) -> Self {
        Self {
            patterns: Vec::new(),
            default: FilterPattern::new(DEFAULT_TOPIC, DEFAULT_RATE_SECS, capacity),
            parser,
            capacity,
        }
    }

    pub fn with_rules<'a>(
        parser: TimestampParser,
        capacity: usize,
        rules: impl IntoIterator<Item = &'a ThrottleRule>,
    ) -> Self {
        let mut rule_set = Self::new(parser, capacity);
        for rule in rules {
            rule_set.add_rule(rule);
        }
        rule_set
    }

    /// A `default-rate` rule replaces the default pattern; anything else is
    /// appended after the existing rules.
    pub fn add_rule(&mut self, rule: &ThrottleRule) {
        if rule.is_default() {
            self.default = FilterPattern::from_rule(rule, self.capacity);
        } else {
            self.patterns.push(FilterPattern::from_rule(rule, self.capacity));
        }
    }

    pub fn pattern_for(&self, topic: &str) -> &FilterPattern {
        self.patterns
            .iter()
            .find(|pattern| pattern.applies(topic))
            .unwrap_or(&self.default)
    }

    /// Decide whether a decoded message from `topic` should be forwarded
    pub fn admit(&mut self, topic: &str, payload: &TelemetryPayload) -> Result<bool, TimestampError> {
        let parser = &self.parser;
        let pattern = match self.patterns.iter().position(|pattern| pattern.applies(topic)) {
            Some(index) => &mut self.patterns[index],
            None => &mut self.default,
        };
        pattern.should_forward(payload, parser)
    }

    /// Output topic for an input topic: the rule's explicit destination, or the
    /// input name with `suffix` appended
    pub fn destination_for(&self, topic: &str, suffix: &str) -> String {
        match &self.pattern_for(topic).destination {
            Some(destination) => destination.clone(),
            None => format!("{}{}", topic, suffix),
        }
    }

    pub fn tracked_sensors(&self) -> usize {
        self.patterns
            .iter()
            .chain(std::iter::once(&self.default))
            .map(|pattern| pattern.sensor_times.len())
            .sum()
    }

    pub fn default_pattern(&self) -> &FilterPattern {
        &self.default
    }
}
