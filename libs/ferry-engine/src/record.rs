use std::collections::BTreeMap;

use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::Serialize;

use ferry_api::record::IncomingRecord;

// ════════════════════════════════════════════════════════════════
//  Payload
// ════════════════════════════════════════════════════════════════

/// Record payload: UTF-8 text when the bytes decode, raw bytes otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Payload::Text(text),
            Err(e) => Payload::Binary(e.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  Record
// ════════════════════════════════════════════════════════════════

/// A normalized, buffered record. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub payload: Payload,
    pub key: Option<String>,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub qos: Option<u8>,
    pub retain: Option<bool>,
    pub headers: BTreeMap<String, String>,
    pub broker_timestamp: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record has an empty topic")]
    EmptyTopic,

    #[error("broker timestamp {0} ms is out of range")]
    Timestamp(i64),
}

impl Record {
    /// Turn a raw broker record into the stored shape: decode the payload,
    /// stringify key and headers, attach the receive timestamp.
    pub fn normalize(
        incoming: IncomingRecord,
        received_at: DateTime<Utc>,
    ) -> Result<Self, NormalizeError> {
        if incoming.topic.is_empty() {
            return Err(NormalizeError::EmptyTopic);
        }

        let broker_timestamp = match incoming.timestamp_ms {
            Some(ms) => Some(
                DateTime::<Utc>::from_timestamp_millis(ms).ok_or(NormalizeError::Timestamp(ms))?,
            ),
            None => None,
        };

        let headers = incoming
            .headers
            .into_iter()
            .map(|(name, value)| (name, String::from_utf8_lossy(&value).into_owned()))
            .collect();

        Ok(Record {
            topic: incoming.topic,
            payload: Payload::from_bytes(incoming.payload),
            key: incoming
                .key
                .map(|key| String::from_utf8_lossy(&key).into_owned()),
            partition: incoming.partition,
            offset: incoming.offset,
            qos: incoming.qos,
            retain: incoming.retain,
            headers,
            broker_timestamp,
            received_at,
        })
    }
}

impl Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("topic", &self.topic)?;
        match &self.payload {
            Payload::Text(text) => {
                map.serialize_entry("payload", text)?;
            }
            Payload::Binary(bytes) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                map.serialize_entry("payload", &encoded)?;
                map.serialize_entry("encoding", "base64")?;
            }
        }
        if let Some(key) = &self.key {
            map.serialize_entry("key", key)?;
        }
        if let Some(partition) = self.partition {
            map.serialize_entry("partition", &partition)?;
        }
        if let Some(offset) = self.offset {
            map.serialize_entry("offset", &offset)?;
        }
        if let Some(qos) = self.qos {
            map.serialize_entry("qos", &qos)?;
        }
        if let Some(retain) = self.retain {
            map.serialize_entry("retain", &retain)?;
        }
        if !self.headers.is_empty() {
            map.serialize_entry("headers", &self.headers)?;
        }
        if let Some(ts) = &self.broker_timestamp {
            map.serialize_entry("timestamp", &ts.to_rfc3339_opts(SecondsFormat::Millis, true))?;
        }
        map.serialize_entry(
            "received_at",
            &self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        map.end()
    }
}
