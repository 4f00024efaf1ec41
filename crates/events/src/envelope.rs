use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

/// Wire envelope carried by every message on the bus.
///
/// ```text
/// { "event": "order.created", "timestamp": "2024-05-01T12:00:00Z", "data": { ... } }
/// ```
///
/// Notes:
/// - `event` doubles as the routing key and is never empty.
/// - `timestamp` is the publish instant (UTC, RFC3339 on the wire).
/// - `data` is the event-specific payload. `Envelope<JsonValue>` is the
///   untyped form the dispatcher parses first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<D = JsonValue> {
    event: String,
    timestamp: DateTime<Utc>,
    data: D,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope event name must not be empty")]
    EmptyEvent,

    #[error("failed to serialize envelope: {0}")]
    Serialization(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl<D> Envelope<D> {
    /// Wrap `data` with a fresh UTC timestamp.
    pub fn new(event: impl Into<String>, data: D) -> Result<Self, EnvelopeError> {
        Self::with_timestamp(event, Utc::now(), data)
    }

    pub fn with_timestamp(
        event: impl Into<String>,
        timestamp: DateTime<Utc>,
        data: D,
    ) -> Result<Self, EnvelopeError> {
        let event = event.into();
        if event.trim().is_empty() {
            return Err(EnvelopeError::EmptyEvent);
        }
        Ok(Self {
            event,
            timestamp,
            data,
        })
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn into_data(self) -> D {
        self.data
    }

    /// Convert the payload, keeping event name and timestamp.
    pub fn try_map_data<T, E>(self, f: impl FnOnce(&str, D) -> Result<T, E>) -> Result<Envelope<T>, E> {
        let data = f(&self.event, self.data)?;
        Ok(Envelope {
            event: self.event,
            timestamp: self.timestamp,
            data,
        })
    }
}

impl<D: Serialize> Envelope<D> {
    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }
}

impl<D: DeserializeOwned> Envelope<D> {
    /// Parse raw message bytes, enforcing the non-empty event invariant.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if envelope.event.trim().is_empty() {
            return Err(EnvelopeError::EmptyEvent);
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, json};

    #[test]
    fn wire_shape_matches_contract() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let env = Envelope::with_timestamp("user.registered", ts, json!({"user_id": "u1"})).unwrap();

        let value: JsonValue = serde_json::from_slice(&env.to_vec().unwrap()).unwrap();
        assert_eq!(value["event"], "user.registered");
        assert_eq!(value["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(value["data"]["user_id"], "u1");
    }

    #[test]
    fn rejects_empty_event_name() {
        assert!(matches!(
            Envelope::new("", json!({})),
            Err(EnvelopeError::EmptyEvent)
        ));

        let raw = br#"{"event":"","timestamp":"2024-05-01T12:00:00Z","data":{}}"#;
        assert!(matches!(
            Envelope::<JsonValue>::from_slice(raw),
            Err(EnvelopeError::EmptyEvent)
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Envelope::<JsonValue>::from_slice(b"not json"),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::<JsonValue>::from_slice(br#"{"event":"x.y"}"#),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    fn scalar() -> impl Strategy<Value = JsonValue> {
        prop_oneof![
            any::<i64>().prop_map(JsonValue::from),
            any::<bool>().prop_map(JsonValue::from),
            "[a-zA-Z0-9 _.-]{0,24}".prop_map(JsonValue::from),
            Just(JsonValue::Null),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: decoding a serialized envelope yields the original data map.
        #[test]
        fn data_survives_round_trip(
            event in "[a-z]{1,8}(\\.[a-z_]{1,12}){1,2}",
            data in prop::collection::btree_map("[a-z_]{1,12}", scalar(), 0..8)
        ) {
            let data: Map<String, JsonValue> = data.into_iter().collect();
            let env = Envelope::new(event.clone(), JsonValue::Object(data.clone())).unwrap();

            let decoded = Envelope::<JsonValue>::from_slice(&env.to_vec().unwrap()).unwrap();

            prop_assert_eq!(decoded.event(), event.as_str());
            prop_assert_eq!(decoded.timestamp(), env.timestamp());
            prop_assert_eq!(decoded.into_data(), JsonValue::Object(data));
        }
    }
}
