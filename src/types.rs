use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 error codes.
pub const ERR_CODE_PARSE: i32 = -32700;
pub const ERR_CODE_INVALID_REQ: i32 = -32600;
pub const ERR_CODE_NO_METHOD: i32 = -32601;
pub const ERR_CODE_BAD_PARAMS: i32 = -32602;
pub const ERR_CODE_INTERNAL: i32 = -32603;
/// Reserved by LSP/BSP for requests that arrive before `build/initialize`.
pub const ERR_CODE_NOT_INITIALIZED: i32 = -32002;

/// JSON-RPC version emitted on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

// ── Correlation id ──

/// Opaque request id, echoed verbatim in the matching response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.into())
    }
}

// ── Messages ──

/// Inbound or outbound JSON-RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// JSON-RPC notification. Never carries an id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Notification {
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response. Holds exactly one of a result or an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(RpcError),
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Response {
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn error(id: RequestId, err: RequestError) -> Self {
        Response {
            id,
            payload: ResponsePayload::Error(err.into()),
        }
    }

    /// The success payload, if any.
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(value) => Some(value),
            ResponsePayload::Error(_) => None,
        }
    }

    /// The error payload, if any.
    pub fn rpc_error(&self) -> Option<&RpcError> {
        match &self.payload {
            ResponsePayload::Error(err) => Some(err),
            ResponsePayload::Result(_) => None,
        }
    }
}

/// One decoded frame.
///
/// Deserialization classifies the envelope: `method` plus `id` is a request,
/// `method` alone is a notification, `id` plus exactly one of `result` /
/// `error` is a response. Anything else is rejected. The `jsonrpc` field is
/// ignored on input and always written on output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawMessage")]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(req) => Some(&req.id),
            Message::Response(resp) => Some(&resp.id),
            Message::Notification(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Message::Response(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Message::Notification(value)
    }
}

impl Serialize for Message {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;

        match self {
            Message::Request(req) => {
                map.serialize_entry("id", &req.id)?;
                map.serialize_entry("method", &req.method)?;
                if let Some(ref params) = req.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Message::Notification(n) => {
                map.serialize_entry("method", &n.method)?;
                if let Some(ref params) = n.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Message::Response(resp) => {
                map.serialize_entry("id", &resp.id)?;
                match &resp.payload {
                    ResponsePayload::Result(value) => map.serialize_entry("result", value)?,
                    ResponsePayload::Error(err) => map.serialize_entry("error", err)?,
                }
            }
        }

        map.end()
    }
}

/// Wire envelope before classification.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Distinguishes `"result": null` from an absent `result`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawMessage> for Message {
    type Error = String;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        match (raw.method, raw.id) {
            (Some(method), Some(id)) => Ok(Message::Request(Request {
                id,
                method,
                params: raw.params,
            })),
            (Some(method), None) => Ok(Message::Notification(Notification {
                method,
                params: raw.params,
            })),
            (None, Some(id)) => match (raw.result, raw.error) {
                (Some(result), None) => Ok(Message::Response(Response::ok(id, result))),
                (None, Some(error)) => Ok(Message::Response(Response {
                    id,
                    payload: ResponsePayload::Error(error),
                })),
                (Some(_), Some(_)) => Err("response carries both result and error".into()),
                (None, None) => Err("response carries neither result nor error".into()),
            },
            (None, None) => Err("message has neither method nor id".into()),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ── Errors ──

/// Failure signalled by a handler. Mapped 1:1 onto an error response.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RequestError {
    pub code: i32,
    pub message: String,
}

impl RequestError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        RequestError {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ERR_CODE_NO_METHOD, format!("Method not found: {method}"))
    }

    /// A known method the server chose not to implement.
    pub fn not_implemented(method: &str) -> Self {
        Self::new(ERR_CODE_NO_METHOD, format!("'{method}' not implemented"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_CODE_BAD_PARAMS, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ERR_CODE_INVALID_REQ, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ERR_CODE_INTERNAL, message)
    }

    pub fn server_not_initialized() -> Self {
        Self::new(ERR_CODE_NOT_INITIALIZED, "server not initialized")
    }
}

impl From<RequestError> for RpcError {
    fn from(err: RequestError) -> Self {
        RpcError {
            code: err.code,
            message: err.message,
            data: None,
        }
    }
}

/// Framing and stream failures raised by [`Transport`](crate::Transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("expected Content-Length header, got {0:?}")]
    InvalidHeader(String),
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("expected blank line after Content-Length header, got {0:?}")]
    MissingSeparator(String),
    #[error("stream closed mid-frame")]
    Truncated,
    #[error("json codec error: {0}")]
    Codec(#[source] serde_json::Error),
    #[error("outbound stream closed by peer")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum BspError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("method {method:?} registered twice")]
    DuplicateMethod { method: String },
    #[error("handler for notification {method:?} failed: {source}")]
    NotificationFailed {
        method: String,
        #[source]
        source: RequestError,
    },
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
