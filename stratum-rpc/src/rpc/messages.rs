//! Stratum message types and JSON-RPC serialization.
//!
//! Outbound traffic is strongly typed ([`Request`]; a batch is a plain
//! `Vec<Request>`, which serializes as a JSON array). Inbound
//! traffic is classified by hand from a [`Value`] into [`Inbound`], because
//! servers are sloppy about the envelope: `id` may be absent or `null` on
//! notifications, `error` may be `null` on success, and batch replies are bare
//! arrays.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Client request.
///
/// Stratum has no `jsonrpc` version field and only positional params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Message ID, unique among outstanding requests
    pub id: u64,
    /// Method name (e.g., "server.version", "blockchain.headers.subscribe")
    pub method: String,
    /// Positional parameters
    pub params: Vec<Value>,
}

impl Request {
    /// Create a new request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Response to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Message ID matching the request
    pub id: u64,
    /// Result value (present on success)
    pub result: Option<Value>,
    /// Error value (present on failure; `null` is treated as absent)
    pub error: Option<Value>,
}

impl Response {
    /// Successful response, mostly for tests and mock servers.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response, mostly for tests and mock servers.
    pub fn err(id: u64, error: Value) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Serialize in wire form.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::from(self.id));
        if let Some(result) = &self.result {
            obj.insert("result".to_string(), result.clone());
        }
        if let Some(error) = &self.error {
            obj.insert("error".to_string(), error.clone());
        }
        Value::Object(obj)
    }
}

/// Server push for a subscribed method.
///
/// Unlike a response, the payload lives in `params`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Subscription method name
    pub method: String,
    /// Payload
    pub params: Value,
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a single request
    Response(Response),
    /// Reply to a batch request
    Batch(Vec<Response>),
    /// Subscription traffic
    Notification(Notification),
    /// Request with an id sent by the server; Stratum clients do not serve
    /// requests, so these are only logged
    ServerRequest {
        /// Server-chosen id
        id: Value,
        /// Requested method
        method: String,
    },
}

/// Why an inbound value could not be classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// Object has neither a usable id nor a method
    NoIdNorMethod,
    /// `id` present but not an unsigned integer
    BadId(String),
    /// Top-level value is neither object nor array
    NotAnObject,
    /// Batch reply with no elements
    EmptyBatch,
    /// Batch reply in which no element is a usable response
    NoUsableReplies,
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShapeError::NoIdNorMethod => write!(f, "message has no id nor method"),
            ShapeError::BadId(id) => write!(f, "unusable message id {}", id),
            ShapeError::NotAnObject => write!(f, "message is not an object or array"),
            ShapeError::EmptyBatch => write!(f, "empty batch reply"),
            ShapeError::NoUsableReplies => write!(f, "batch reply has no usable responses"),
        }
    }
}

impl Inbound {
    /// Classify a decoded line.
    ///
    /// Manual parsing for better error context than serde untagged enums.
    /// Unusable elements of a batch reply (e.g. `{"id": null, "error": ..}`)
    /// are skipped so the rest can still settle the batch.
    pub fn classify(value: Value) -> Result<Self, ShapeError> {
        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(ShapeError::EmptyBatch);
                }
                let total = items.len();
                let responses: Vec<Response> = items
                    .into_iter()
                    .filter_map(|item| {
                        let parsed = match item {
                            Value::Object(obj) => parse_response(obj),
                            _ => Err(ShapeError::NotAnObject),
                        };
                        parsed
                            .inspect_err(|e| warn!(error = %e, "Skipping unusable batch element"))
                            .ok()
                    })
                    .collect();
                if responses.is_empty() {
                    return Err(ShapeError::NoUsableReplies);
                }
                if responses.len() < total {
                    debug!(kept = responses.len(), total, "Batch reply partially usable");
                }
                Ok(Inbound::Batch(responses))
            }
            Value::Object(obj) => {
                let has_id = obj.get("id").is_some_and(|id| !id.is_null());
                let method = obj.get("method").and_then(Value::as_str).map(str::to_string);

                match (has_id, method) {
                    (false, Some(method)) => {
                        let params = obj.get("params").cloned().unwrap_or(Value::Null);
                        Ok(Inbound::Notification(Notification { method, params }))
                    }
                    (false, None) => Err(ShapeError::NoIdNorMethod),
                    (true, Some(method))
                        if !obj.contains_key("result") && !obj.contains_key("error") =>
                    {
                        let id = obj.get("id").cloned().unwrap_or(Value::Null);
                        Ok(Inbound::ServerRequest { id, method })
                    }
                    (true, _) => parse_response(obj).map(Inbound::Response),
                }
            }
            _ => Err(ShapeError::NotAnObject),
        }
    }
}

fn parse_response(mut obj: Map<String, Value>) -> Result<Response, ShapeError> {
    let id = match obj.get("id") {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| ShapeError::BadId(n.to_string()))?,
        Some(other) => return Err(ShapeError::BadId(other.to_string())),
        None => return Err(ShapeError::NoIdNorMethod),
    };

    let result = obj.remove("result");
    let error = obj.remove("error").filter(|e| !e.is_null());

    Ok(Response { id, result, error })
}

/// Events emitted by the client for an optional observer.
///
/// Delivery is best-effort: if the observer's channel is full the event is
/// dropped rather than stalling the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established (and handshake done, if enabled)
    Connected {
        /// Transport generation; increases with every reconnect
        generation: u64,
        /// Directly connected peer, if known
        peer: Option<std::net::SocketAddr>,
    },

    /// Connection lost or closed
    Disconnected {
        /// Generation of the connection that went away
        generation: u64,
        /// Requests that were abandoned with it
        abandoned: usize,
    },

    /// Reply whose id matched nothing outstanding
    UnknownResponse {
        /// Id the server sent
        id: u64,
    },

    /// Notification for a method nobody listens to
    UnexpectedNotification {
        /// Method name
        method: String,
        /// Payload that was discarded
        params: Value,
    },

    /// A line that could not be framed or classified
    MalformedFrame(String),
}
