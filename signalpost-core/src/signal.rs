//! Signal records as they are queued, persisted, and posted
//!
//! A `SignalRecord` is the unit that flows through the whole pipeline. The
//! same JSON shape is used for the offline cache file and for the ingestion
//! API body, so the field names follow the ingestion service's wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry event, ready to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    /// When the signal was enqueued
    #[serde(rename = "receivedAt")]
    pub received_at: DateTime<Utc>,

    /// App the signal belongs to
    #[serde(rename = "appID")]
    pub app_id: String,

    /// Hex digest of the user identifier (see [`crate::hasher`])
    #[serde(rename = "clientUser")]
    pub client_user: String,

    /// Session the signal was produced in
    #[serde(rename = "sessionID")]
    pub session_id: String,

    /// Name of the event that triggered the signal
    #[serde(rename = "type")]
    pub signal_type: String,

    /// Tags in the form "key:value"
    pub payload: Vec<String>,

    /// Marks the signal as non-production
    #[serde(rename = "isTestMode", with = "bool_string")]
    pub is_test_mode: bool,
}

/// The ingestion API expects `isTestMode` as the strings "true"/"false".
mod bool_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "true" } else { "false" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bool(b) => Ok(b),
            Raw::Str(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(de::Error::custom(format!(
                    "invalid isTestMode value: {}",
                    other
                ))),
            },
        }
    }
}
