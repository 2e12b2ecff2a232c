use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use ferry_api::message::{OutgoingMessage, SubscribeOptions};
use ferry_engine::relay::MessageQuery;
use ferry_engine::{Relay, RelayError};

// ═══════════════════════════════════════════════════════════════
//  Tool catalogue
// ═══════════════════════════════════════════════════════════════

/// Tool names without the transport prefix.
pub const TOOLS: &[&str] = &[
    "status",
    "get_messages",
    "publish",
    "subscribe",
    "subscribe_batch",
    "unsubscribe",
    "clear_messages",
];

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: &'static str,
    pub input_schema: Value,
}

pub fn tool_names(prefix: &str) -> Vec<String> {
    TOOLS.iter().map(|t| format!("{prefix}_{t}")).collect()
}

pub fn tool_specs(prefix: &str) -> Vec<ToolSpec> {
    TOOLS
        .iter()
        .filter_map(|tool| {
            let Some((description, input_schema)) = describe(tool) else {
                tracing::error!(tool = %tool, "tool has no description, leaving it out of the catalogue");
                return None;
            };
            Some(ToolSpec {
                name: format!("{prefix}_{tool}"),
                description,
                input_schema,
            })
        })
        .collect()
}

fn describe(tool: &str) -> Option<(&'static str, Value)> {
    let options = json!({
        "qos": { "type": "integer", "minimum": 0, "maximum": 2 },
        "from_beginning": { "type": "boolean" },
    });
    let described = match tool {
        "status" => (
            "Connection state, subscribed topics and buffer occupancy",
            json!({ "type": "object", "properties": {} }),
        ),
        "get_messages" => (
            "Most recent buffered messages, oldest first, optionally filtered",
            json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "default": 10 },
                    "topic": { "type": "string", "description": "exact topic or +/# pattern" },
                    "partition": { "type": "integer" },
                    "key": { "type": "string" },
                },
            }),
        ),
        "publish" => (
            "Publish a message",
            json!({
                "type": "object",
                "required": ["topic", "message"],
                "properties": {
                    "topic": { "type": "string" },
                    "message": { "description": "string payload, or any JSON value" },
                    "key": { "type": "string" },
                    "headers": { "type": "object", "additionalProperties": { "type": "string" } },
                    "partition": { "type": "integer" },
                    "qos": { "type": "integer", "minimum": 0, "maximum": 2 },
                    "retain": { "type": "boolean" },
                },
            }),
        ),
        "subscribe" => {
            let mut schema = json!({
                "type": "object",
                "required": ["topic"],
                "properties": { "topic": { "type": "string" } },
            });
            merge_properties(&mut schema, &options);
            ("Subscribe to a topic or pattern", schema)
        }
        "subscribe_batch" => {
            let mut schema = json!({
                "type": "object",
                "required": ["topics"],
                "properties": {
                    "topics": { "type": "array", "items": { "type": "string" } },
                },
            });
            merge_properties(&mut schema, &options);
            ("Subscribe to several topics in one change", schema)
        }
        "unsubscribe" => (
            "Unsubscribe from a topic or pattern",
            json!({
                "type": "object",
                "required": ["topic"],
                "properties": { "topic": { "type": "string" } },
            }),
        ),
        "clear_messages" => (
            "Drop every buffered message",
            json!({ "type": "object", "properties": {} }),
        ),
        _ => return None,
    };
    Some(described)
}

fn merge_properties(schema: &mut Value, extra: &Value) {
    if let (Some(props), Some(extra)) = (
        schema.get_mut("properties").and_then(Value::as_object_mut),
        extra.as_object(),
    ) {
        for (k, v) in extra {
            props.insert(k.clone(), v.clone());
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Arguments
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct PublishArgs {
    topic: String,
    message: Value,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    partition: Option<i32>,
    #[serde(default)]
    qos: Option<u8>,
    #[serde(default)]
    retain: bool,
}

#[derive(Debug, Deserialize)]
struct SubscribeArgs {
    topic: String,
    #[serde(flatten)]
    opts: SubscribeOptions,
}

#[derive(Debug, Deserialize)]
struct SubscribeBatchArgs {
    topics: Vec<String>,
    #[serde(flatten)]
    opts: SubscribeOptions,
}

#[derive(Debug, Deserialize)]
struct UnsubscribeArgs {
    topic: String,
}

impl PublishArgs {
    fn into_message(self) -> OutgoingMessage {
        let payload = match self.message {
            Value::String(s) => s.into_bytes(),
            other => other.to_string().into_bytes(),
        };
        OutgoingMessage {
            topic: self.topic,
            payload,
            key: self.key,
            headers: self.headers,
            partition: self.partition,
            qos: self.qos,
            retain: self.retain,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Dispatch
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolError {
    pub kind: String,
    pub message: String,
}

/// Result of one tool call. Engine failures are carried here, not raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResponse {
    fn success(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(e) => Self::failure("InternalInvariant", format!("result not serializable: {e}")),
        }
    }

    fn failure(kind: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ToolError {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }

    fn from_result<T: Serialize>(result: Result<T, RelayError>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(e) => Self::failure(e.kind(), e.to_string()),
        }
    }
}

/// The call itself could not be made.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments for '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownTool(_) => "UnknownTool",
            DispatchError::InvalidArguments { .. } => "InvalidArguments",
        }
    }
}

/// Invoke tool `name` with JSON `args`. `null` args count as `{}`.
pub async fn dispatch(
    relay: &Relay,
    prefix: &str,
    name: &str,
    args: Value,
) -> Result<ToolResponse, DispatchError> {
    let tool = name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .filter(|t| TOOLS.contains(t))
        .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;

    let args = match args {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };

    tracing::debug!(tool = %name, "tool call");

    let response = match tool {
        "status" => ToolResponse::success(relay.status()),
        "get_messages" => {
            let query: MessageQuery = parse(name, args)?;
            ToolResponse::from_result(relay.get_messages(&query))
        }
        "publish" => {
            let args: PublishArgs = parse(name, args)?;
            ToolResponse::from_result(relay.publish(args.into_message()).await)
        }
        "subscribe" => {
            let args: SubscribeArgs = parse(name, args)?;
            ToolResponse::from_result(relay.subscribe(&args.topic, args.opts).await)
        }
        "subscribe_batch" => {
            let args: SubscribeBatchArgs = parse(name, args)?;
            ToolResponse::from_result(relay.subscribe_batch(args.topics, args.opts).await)
        }
        "unsubscribe" => {
            let args: UnsubscribeArgs = parse(name, args)?;
            ToolResponse::from_result(relay.unsubscribe(&args.topic).await)
        }
        "clear_messages" => ToolResponse::success(relay.clear_messages()),
        other => return Err(DispatchError::UnknownTool(other.to_string())),
    };

    if let Some(err) = &response.error {
        tracing::warn!(tool = %name, kind = %err.kind, message = %err.message, "tool call failed");
    }
    Ok(response)
}

fn parse<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, DispatchError> {
    serde_json::from_value(args).map_err(|e| DispatchError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}
