use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

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

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Oem {
    pub telemetry_source: String,
    pub sensors: Vec<Sensor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Sensor {
    pub timestamp: String,
    pub location: String,
    pub physical_context: String,
    pub index: u32,
    pub value: String,
}

/// Kinds of readings a simulated node controller reports
#[derive(Debug, Clone, Copy)]
pub enum Measurement {
    Temperature,
    Power,
    Voltage,
}

impl Measurement {
    pub const ALL: [Measurement; 3] = [Self::Temperature, Self::Power, Self::Voltage];

    fn message_id(self) -> &'static str {
        match self {
            Self::Temperature => "CrayTelemetry.Temperature",
            Self::Power => "CrayTelemetry.Power",
            Self::Voltage => "CrayTelemetry.Voltage",
        }
    }

    fn sample(self, rng: &mut impl Rng) -> f64 {
        match self {
            Self::Temperature => {
                if rng.gen_bool(0.05) {
                    rng.gen_range(80.0..105.0) // 5% hot spots
                } else {
                    rng.gen_range(35.0..70.0)
                }
            }
            Self::Power => rng.gen_range(150.0..450.0),
            Self::Voltage => rng.gen_range(11.8..12.2),
        }
    }
}

/// Cabinet-style xname for the n-th simulated node controller
pub fn node_context(node: usize) -> String {
    format!("x3000c0s{}b{}", node / 2, node % 2)
}

pub fn generate_payload(
    rng: &mut impl Rng,
    node: usize,
    measurement: Measurement,
    sensors: usize,
    at: DateTime<Utc>,
) -> TelemetryPayload {
    let context = node_context(node);
    let timestamp = at.to_rfc3339_opts(SecondsFormat::Millis, true);

    let sensors = (0..sensors)
        .map(|index| Sensor {
            timestamp: timestamp.clone(),
            location: format!("{}n0", context),
            physical_context: "CPU".to_string(),
            index: index as u32,
            value: format!("{:.2}", measurement.sample(rng)),
        })
        .collect();

    TelemetryPayload {
        context,
        events: vec![Event {
            event_timestamp: timestamp,
            message_id: measurement.message_id().to_string(),
            oem: Oem {
                telemetry_source: "River".to_string(),
                sensors,
            },
        }],
    }
}
