use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

pub const DEFAULT_TOPIC: &str = "default-rate";
pub const DEFAULT_RATE_SECS: f64 = 30.0;

/// One entry of the throttling document
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ThrottleRule {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_rate")]
    pub rate: f64,
    #[serde(default)]
    pub destination_topic: Option<String>,
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_rate() -> f64 {
    DEFAULT_RATE_SECS
}

impl ThrottleRule {
    pub fn is_default(&self) -> bool {
        self.topic == DEFAULT_TOPIC
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TopicsDocument {
    topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ThrottlingDocument {
    Many(Vec<ThrottleRule>),
    Combined {
        #[serde(rename = "Topics", default)]
        topics: Vec<String>,
        #[serde(rename = "Throttling")]
        throttling: Vec<ThrottleRule>,
    },
    One(ThrottleRule),
}

/// Input topics plus the throttling rules applied to them, in document order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterRules {
    pub topics: Vec<String>,
    pub rules: Vec<ThrottleRule>,
}

impl FilterRules {
    pub fn load(topic_file: &Path, throttling_file: &Path) -> Result<Self> {
        info!("Loading topics from {}", topic_file.display());
        let topics = std::fs::read_to_string(topic_file)?;
        info!("Loading throttling rules from {}", throttling_file.display());
        let throttling = std::fs::read_to_string(throttling_file)?;

        let mut rules = Self::parse_throttling(&throttling)?;
        for topic in Self::parse_topics(&topics)? {
            if !rules.topics.contains(&topic) {
                rules.topics.push(topic);
            }
        }
        Ok(rules)
    }

    pub fn parse_topics(body: &str) -> Result<Vec<String>> {
        let document: TopicsDocument = serde_json::from_str(body)?;
        Ok(document.topics)
    }

    /// Accepts a single rule, a list of rules, or `{ "Topics": [...], "Throttling": [...] }`
    pub fn parse_throttling(body: &str) -> Result<Self> {
        let document: serde_json::Value = serde_json::from_str(body)?;
        let empty_rule = |value: &serde_json::Value| value.as_object().is_some_and(|rule| rule.is_empty());
        let has_empty_rule = match &document {
            serde_json::Value::Array(entries) => entries.iter().any(empty_rule),
            other => empty_rule(other),
        };
        if has_empty_rule {
            return Err(Error::Config(
                "Throttling rule must set at least one of Topic, Rate or DestinationTopic".to_string(),
            ));
        }

        let (topics, rules) = match serde_json::from_value(document)? {
            ThrottlingDocument::Many(rules) => (Vec::new(), rules),
            ThrottlingDocument::Combined { topics, throttling } => (topics, throttling),
            ThrottlingDocument::One(rule) => (Vec::new(), vec![rule]),
        };

        for rule in &rules {
            if !rule.rate.is_finite() || rule.rate < 0.0 {
                return Err(Error::Config(format!(
                    "Rate {} for topic {} must be a non-negative number of seconds",
                    rule.rate, rule.topic
                )));
            }
        }

        Ok(Self { topics, rules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule_list() {
        let rules = FilterRules::parse_throttling(
            r#"[
                {"Topic": "cray-telemetry-temperature", "Rate": 60},
                {"Topic": "default-rate", "Rate": 15},
                {"Topic": "cray-telemetry-power", "Rate": 5, "DestinationTopic": "power-out"}
            ]"#,
        )
        .unwrap();

        assert_eq!(rules.rules.len(), 3);
        assert_eq!(rules.rules[0].rate, 60.0);
        assert!(rules.rules[1].is_default());
        assert_eq!(rules.rules[2].destination_topic.as_deref(), Some("power-out"));
    }

    #[test]
    fn test_parse_single_rule_with_defaults() {
        let rules = FilterRules::parse_throttling(r#"{"Rate": 10}"#).unwrap();
        assert_eq!(rules.rules.len(), 1);
        assert!(rules.rules[0].is_default());
        assert_eq!(rules.rules[0].rate, 10.0);

        let rules = FilterRules::parse_throttling(r#"{"Topic": "sensors"}"#).unwrap();
        assert_eq!(rules.rules[0].rate, DEFAULT_RATE_SECS);
    }

    #[test]
    fn test_parse_combined_document() {
        let rules = FilterRules::parse_throttling(
            r#"{"Topics": ["sensors"], "Throttling": [{"Topic": "sensors", "Rate": 30}]}"#,
        )
        .unwrap();

        assert_eq!(rules.topics, vec!["sensors".to_string()]);
        assert_eq!(rules.rules[0].topic, "sensors");
    }

    #[test]
    fn test_negative_rate_rejected() {
        let result = FilterRules::parse_throttling(r#"[{"Topic": "sensors", "Rate": -1}]"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_or_unrecognised_documents_rejected() {
        assert!(matches!(
            FilterRules::parse_throttling("{}"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            FilterRules::parse_throttling(r#"[{"Topic": "a"}, {}]"#),
            Err(Error::Config(_))
        ));
        // A combined document without its Throttling list is not a rule either
        assert!(matches!(
            FilterRules::parse_throttling(r#"{"Topics": ["a"]}"#),
            Err(Error::Json(_))
        ));
        assert!(FilterRules::parse_throttling(r#"{"Topic": "a", "Rat": 5}"#).is_err());
    }

    #[test]
    fn test_parse_topics() {
        let topics = FilterRules::parse_topics(r#"{"Topics": ["a", "b"]}"#).unwrap();
        assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);
        assert!(FilterRules::parse_topics(r#"["a"]"#).is_err());
    }

    #[test]
    fn test_load_merges_topic_lists() {
        let dir = std::env::temp_dir().join(format!("filter-rules-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let topic_file = dir.join("topics.json");
        let throttling_file = dir.join("throttling.json");
        std::fs::write(&topic_file, r#"{"Topics": ["a", "b"]}"#).unwrap();
        std::fs::write(
            &throttling_file,
            r#"{"Topics": ["b", "c"], "Throttling": [{"Topic": "a", "Rate": 1}]}"#,
        )
        .unwrap();

        let rules = FilterRules::load(&topic_file, &throttling_file).unwrap();
        assert_eq!(rules.topics, vec!["b", "c", "a"]);
        assert_eq!(rules.rules.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
