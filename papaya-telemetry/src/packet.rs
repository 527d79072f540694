use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use papaya_util::clock::now_ms;

/// A single telemetry value
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_owned())
    }
}

/// Metric key to value mapping, e.g. `ultrasonic.sensor_1 -> 150.5`
pub type Values = BTreeMap<String, Scalar>;

/// A timestamped set of readings.
///
/// Serializes to the wire payload: `{"ts": <ms>, "values": {...}}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TelemetryPacket {
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
    pub values: Values,
}

impl TelemetryPacket {
    pub fn new(timestamp_ms: i64, values: Values) -> Self {
        Self {
            timestamp_ms,
            values,
        }
    }

    /// Create a packet stamped with the current time
    pub fn now(values: Values) -> Self {
        Self::new(now_ms(), values)
    }

    /// Encode the packet as the wire payload
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A reading as handed over by an external producer.
///
/// Either a packet-shaped object with an optional timestamp or a flat map
/// of values.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Reading {
    Packet {
        #[serde(default)]
        ts: Option<i64>,
        values: Values,
    },
    Flat(Values),
}

impl From<Reading> for TelemetryPacket {
    fn from(reading: Reading) -> Self {
        match reading {
            Reading::Packet {
                ts: Some(ts),
                values,
            } => TelemetryPacket::new(ts, values),
            Reading::Packet { ts: None, values } => TelemetryPacket::now(values),
            Reading::Flat(values) => TelemetryPacket::now(values),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn it_stamps_readings_without_a_timestamp() {
        let before = now_ms();
        let reading: Reading =
            serde_json::from_value(json!({"values": {"ultrasonic.sensor_1": 150.5}})).unwrap();
        let packet = TelemetryPacket::from(reading);
        let after = now_ms();

        assert!(packet.timestamp_ms >= before && packet.timestamp_ms <= after);

        let payload: Value = serde_json::from_slice(&packet.to_payload().unwrap()).unwrap();
        assert_eq!(
            payload,
            json!({
                "ts": packet.timestamp_ms,
                "values": {"ultrasonic.sensor_1": 150.5}
            })
        );
    }

    #[test]
    fn it_keeps_the_producer_timestamp() {
        let reading: Reading = serde_json::from_value(json!({
            "ts": 1700000000000i64,
            "values": {"lidar.distance_cm": 42, "tamper": false}
        }))
        .unwrap();
        let packet = TelemetryPacket::from(reading);

        assert_eq!(packet.timestamp_ms, 1_700_000_000_000);
        assert_eq!(packet.values.get("lidar.distance_cm"), Some(&Scalar::Int(42)));
        assert_eq!(packet.values.get("tamper"), Some(&Scalar::Bool(false)));
    }

    #[test]
    fn it_accepts_flat_readings() {
        let reading: Reading =
            serde_json::from_value(json!({"airquality.pm25": 12.5, "nfc.tag": "04A1"})).unwrap();
        let packet = TelemetryPacket::from(reading);

        assert_eq!(packet.values.get("airquality.pm25"), Some(&Scalar::Float(12.5)));
        assert_eq!(packet.values.get("nfc.tag"), Some(&Scalar::from("04A1")));
    }

    #[test]
    fn it_rejects_nested_values() {
        let res = serde_json::from_value::<Reading>(json!({"values": {"a": {"b": 1}}}));
        assert!(res.is_err());
    }
}
