//! msgpack-rpc message envelopes.
//!
//! Every frame on an RPC channel is a single MessagePack array whose first
//! element is the message type tag:
//!
//! ```text
//! [0, msgid, method, args]        request
//! [1, msgid, error, result]       response
//! [2, method, args]               notification
//! ```

use rmpv::Value;
use serde::{Deserialize, Serialize};

use super::framing::FrameError;

/// Error code used for every error the broker reports back to a peer.
pub const GENERIC_ERROR_CODE: i64 = 1;

const TAG_REQUEST: u64 = 0;
const TAG_RESPONSE: u64 = 1;
const TAG_NOTIFICATION: u64 = 2;

/// Error payload of a response (`[code, message]` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Error with the generic broker code.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(GENERIC_ERROR_CODE, message)
    }

    /// The error a peer receives when it calls a method nobody serves.
    pub fn not_implemented(method: &str) -> Self {
        Self::generic(format!("{} not implemented", method))
    }

    fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.code),
            Value::from(self.message.as_str()),
        ])
    }

    /// Read the error slot of a response. Peers are not always tidy here, so
    /// anything that is not `[code, message]` is kept as generic text.
    fn from_value(value: Value) -> Self {
        let Value::Array(items) = value else {
            return Self::generic(string_value(value).unwrap_or_else(|v| v.to_string()));
        };
        let mut items = items.into_iter();
        let code = items
            .next()
            .and_then(|v| v.as_i64())
            .unwrap_or(GENERIC_ERROR_CODE);
        let message = match items.next() {
            Some(v) => string_value(v).unwrap_or_else(|v| v.to_string()),
            None => String::new(),
        };
        Self { code, message }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// A decoded msgpack-rpc envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u64,
        method: String,
        args: Vec<Value>,
    },
    Notification {
        method: String,
        args: Vec<Value>,
    },
    Response {
        id: u64,
        /// `Err` is sent as `[1, id, [code, message], nil]`.
        outcome: Result<Value, RpcError>,
    },
    /// A request whose id decoded but whose method or arguments did not.
    /// It still gets an error response; `frame` is the value as received.
    InvalidRequest {
        id: u64,
        reason: String,
        frame: Value,
    },
}

impl Message {
    pub fn request(id: u64, method: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Request {
            id,
            method: method.into(),
            args,
        }
    }

    pub fn notification(method: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            args,
        }
    }

    pub fn response(id: u64, outcome: Result<Value, RpcError>) -> Self {
        Message::Response { id, outcome }
    }

    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Notification { .. } => "notification",
            Message::Response { .. } => "response",
            Message::InvalidRequest { .. } => "invalid request",
        }
    }

    /// Build the wire array for this message.
    pub fn into_value(self) -> Value {
        match self {
            Message::Request { id, method, args } => Value::Array(vec![
                Value::from(TAG_REQUEST),
                Value::from(id),
                Value::from(method),
                Value::Array(args),
            ]),
            Message::Notification { method, args } => Value::Array(vec![
                Value::from(TAG_NOTIFICATION),
                Value::from(method),
                Value::Array(args),
            ]),
            Message::Response { id, outcome } => {
                let (error, result) = match outcome {
                    Ok(result) => (Value::Nil, result),
                    Err(err) => (err.to_value(), Value::Nil),
                };
                Value::Array(vec![Value::from(TAG_RESPONSE), Value::from(id), error, result])
            }
            Message::InvalidRequest { frame, .. } => frame,
        }
    }

    /// Interpret a decoded MessagePack value as an envelope.
    ///
    /// A request with a usable id always comes back as a message: if its
    /// method or arguments are unusable it becomes
    /// [`Message::InvalidRequest`] so the peer still gets an answer. Any
    /// other shape is a framing error and the channel that sent it is torn
    /// down.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Array(items) = value else {
            return Err(invalid("message must be an array"));
        };
        let tag = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid("message type must be a non-negative integer"))?;

        match (tag, items.len()) {
            (TAG_REQUEST, len) if len >= 2 => {
                let id = message_id(items.get(1))?;
                if len != 4 {
                    let reason = format!("request must have 4 elements, got {}", len);
                    return Ok(Message::InvalidRequest {
                        id,
                        reason,
                        frame: Value::Array(items),
                    });
                }
                match request_body(&items[2], &items[3]) {
                    Ok(()) => {
                        let mut items = items.into_iter().skip(2);
                        let method = method_name(items.next())?;
                        let args = arguments(items.next())?;
                        Ok(Message::Request { id, method, args })
                    }
                    Err(reason) => Ok(Message::InvalidRequest {
                        id,
                        reason,
                        frame: Value::Array(items),
                    }),
                }
            }
            (TAG_NOTIFICATION, 3) => {
                let mut items = items.into_iter().skip(1);
                let method = method_name(items.next())?;
                let args = arguments(items.next())?;
                Ok(Message::Notification { method, args })
            }
            (TAG_RESPONSE, 4) => {
                let id = message_id(items.get(1))?;
                let mut items = items.into_iter().skip(2);
                let error = items.next().unwrap_or(Value::Nil);
                let result = items.next().unwrap_or(Value::Nil);
                let outcome = if error.is_nil() {
                    Ok(result)
                } else {
                    Err(RpcError::from_value(error))
                };
                Ok(Message::Response { id, outcome })
            }
            (tag, len) => Err(invalid(format!(
                "unexpected message shape: type {} with {} elements",
                tag, len
            ))),
        }
    }
}

fn invalid(reason: impl Into<String>) -> FrameError {
    FrameError::InvalidMessage(reason.into())
}

fn message_id(value: Option<&Value>) -> Result<u64, FrameError> {
    value
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid("message id must be a non-negative integer"))
}

fn method_name(value: Option<Value>) -> Result<String, FrameError> {
    let value = value.ok_or_else(|| invalid("missing method name"))?;
    string_value(value).map_err(|_| invalid("method name must be a string"))
}

/// Check a request's method and arguments before taking them apart.
fn request_body(method: &Value, args: &Value) -> Result<(), String> {
    let method_ok = match method {
        Value::String(s) => s.as_str().is_some(),
        Value::Binary(bytes) => std::str::from_utf8(bytes).is_ok(),
        _ => false,
    };
    if !method_ok {
        return Err(format!("method name must be a string, got {}", method));
    }
    if !args.is_array() {
        return Err(format!("arguments must be an array, got {}", args));
    }
    Ok(())
}

fn arguments(value: Option<Value>) -> Result<Vec<Value>, FrameError> {
    match value {
        Some(Value::Array(args)) => Ok(args),
        _ => Err(invalid("arguments must be an array")),
    }
}

/// Accept both msgpack `str` and `bin` as text; some clients send method
/// names as raw bytes.
fn string_value(value: Value) -> Result<String, Value> {
    match value {
        Value::String(s) => match s.into_str() {
            Some(s) => Ok(s),
            None => Err(Value::Nil),
        },
        Value::Binary(bytes) => String::from_utf8(bytes).map_err(|_| Value::Nil),
        other => Err(other),
    }
}
