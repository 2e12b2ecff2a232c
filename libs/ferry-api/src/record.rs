/// A record exactly as a broker connection hands it over, before the
/// ingestion loop normalizes it.
///
/// Fields a protocol has no notion of stay `None` (MQTT has no key or
/// partition, Kafka has no QoS or retain flag).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub key: Option<Vec<u8>>,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub qos: Option<u8>,
    pub retain: Option<bool>,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Broker-assigned timestamp (Unix ms), if the protocol carries one.
    pub timestamp_ms: Option<i64>,
}

impl IncomingRecord {
    /// Record with just a topic and payload.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }
}
