//! MessagePack payload encoding for frame bodies.
//!
//! Non-control payloads are self-describing key/value maps. Typed control
//! payloads (auth, disconnect, RPC envelopes) are serde structs encoded
//! with named fields so every payload decodes as a plain map; free-form
//! data rides in [`rmpv::Value`].

use crate::error::{ConduitError, Result};
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Encode a typed payload as a MessagePack map with named fields.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| ConduitError::Encode(e.to_string()))
}

/// Decode a typed payload from MessagePack bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| ConduitError::Decode(e.to_string()))
}

/// Encode a dynamic value.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)
        .map_err(|e| ConduitError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a dynamic value; an empty payload reads as nil.
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    if bytes.is_empty() {
        return Ok(Value::Nil);
    }
    let mut cursor = bytes;
    rmpv::decode::read_value(&mut cursor).map_err(|e| ConduitError::Decode(e.to_string()))
}

/// Build a MessagePack map from string keys.
pub fn value_map<I>(pairs: I) -> Value
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    Value::Map(
        pairs
            .into_iter()
            .map(|(k, v)| (Value::from(k), v))
            .collect(),
    )
}

/// Look up a key in a MessagePack map value.
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_map().and_then(|entries| {
        entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    })
}

/// Endpoint identity carried in the auth exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub version: String,
}

/// AUTH_REQUEST body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequestPayload {
    /// Hex-encoded SHA-256 of the shared password
    pub password_hash: String,
    pub client_info: PeerInfo,
}

/// AUTH_SUCCESS body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSuccessPayload {
    /// Opaque token; advisory across reconnects
    pub session_token: String,
    pub server_info: PeerInfo,
}

/// AUTH_FAILURE body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFailurePayload {
    pub reason: String,
    pub retry_allowed: bool,
}

/// DISCONNECT body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// MESSAGE body: `{type, data}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub data: Value,
}

/// RPC_REQUEST body: `{method, params}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequestPayload {
    pub method: String,
    pub params: Value,
}

/// RPC_RESPONSE body: `{success: true, result}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponsePayload {
    pub success: bool,
    pub result: Value,
}

impl RpcResponsePayload {
    pub fn new(result: Value) -> Self {
        Self {
            success: true,
            result,
        }
    }
}

/// RPC_ERROR body: `{success: false, error, code?, details?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorPayload {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RpcErrorPayload {
    pub fn new(error: impl Into<String>, code: Option<u16>) -> Self {
        Self {
            success: false,
            error: error.into(),
            code,
            details: None,
        }
    }
}

/// HEARTBEAT_PING / HEARTBEAT_PONG body: `{}` or `{nonce}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
}

/// ERROR body: `{message, code?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}
