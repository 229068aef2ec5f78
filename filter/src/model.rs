use serde::{Deserialize, Serialize};

/// Decoded telemetry message body as published by the hardware collectors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryPayload {
    pub context: String,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Event {
    pub event_timestamp: String,
    pub message_id: String,
    pub oem: Oem,
}

/// Measurement group embedded in each event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Oem {
    pub telemetry_source: String,
    pub sensors: Vec<SensorReading>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorReading {
    pub timestamp: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parental_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parental_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_sub_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_specific_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_index: Option<u32>,
    pub value: serde_json::Value,
}

/// A raw message handed from the consumer to the pipeline
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Result of a single producer send, reported once per send
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub id: u64,
    pub topic: String,
    pub result: std::result::Result<(i32, i64), String>,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}
