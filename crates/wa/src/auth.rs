use serde::{Deserialize, Serialize};

/// Serde adapter for binary fields inside auth-state JSON.
///
/// The client library's credential bundle mixes strings with raw key
/// material. Keys are stored as `{"$bytes": "<base64>"}` so the whole blob
/// stays valid JSON in the database while round-tripping byte-equal.
pub mod tagged_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::json;

    pub const TAG: &str = "$bytes";

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let value = json!({ TAG: STANDARD.encode(bytes) });
        serde::Serialize::serialize(&value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let encoded = value
            .get(TAG)
            .and_then(|v| v.as_str())
            .ok_or_else(|| D::Error::custom("expected tagged byte string"))?;
        STANDARD
            .decode(encoded)
            .map_err(|e| D::Error::custom(format!("invalid base64 in tagged bytes: {e}")))
    }
}

/// Opaque credential bundle required to resume a session without rescanning
/// a QR. Persisted as a whole on every credentials-updated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    pub client_token: String,
    pub server_token: String,
    #[serde(with = "tagged_bytes")]
    pub client_id: Vec<u8>,
    #[serde(with = "tagged_bytes")]
    pub enc_key: Vec<u8>,
    #[serde(with = "tagged_bytes")]
    pub mac_key: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

impl AuthState {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: &serde_json::Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuthState {
        AuthState {
            client_token: "ct".to_string(),
            server_token: "st".to_string(),
            client_id: vec![0, 1, 2, 255, 254],
            enc_key: (0..32).collect(),
            mac_key: (32..64).collect(),
            phone_number: Some("5551234567".to_string()),
        }
    }

    #[test]
    fn test_round_trip_is_byte_equal() {
        let state = sample();
        let value = state.to_value();
        let back = AuthState::from_value(&value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_binary_fields_are_tagged_json() {
        let value = sample().to_value();
        let enc = value.get("enc_key").unwrap();
        assert!(enc.get(tagged_bytes::TAG).unwrap().is_string());
        // Re-encoding the same value is stable
        let reencoded = AuthState::from_value(&value).unwrap().to_value();
        assert_eq!(reencoded, value);
    }

    #[test]
    fn test_malformed_tag_is_rejected() {
        let mut value = sample().to_value();
        value["enc_key"] = serde_json::json!("not-tagged");
        assert!(AuthState::from_value(&value).is_err());
    }
}
