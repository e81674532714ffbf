//! Name-keyed dispatch for typed messages and RPC methods.
//!
//! The router holds two subtables: free-form message handlers keyed by
//! type tag, and RPC methods keyed by method name. RPC registrations carry
//! a parameter schema used both for validation before invocation and for
//! the built-in `listall` discovery method.
//!
//! Handlers run on their connection's dispatch task, sequentially per
//! connection so per-tag delivery keeps on-wire order, and concurrently
//! with the send, receive, and heartbeat tasks, so a slow handler
//! exercises flow control instead of blocking the socket. A handler error
//! is converted into an RPC_ERROR envelope (or logged, for message
//! handlers); it never propagates into the connection machinery.

use crate::connection::Connection;
use crate::core::frame::{Frame, FrameType};
use crate::core::payload::{
    self, MessagePayload, RpcErrorPayload, RpcRequestPayload, RpcResponsePayload,
};
use crate::error::{codes, constants, ConduitError, Result};
use futures::future::BoxFuture;
use rmpv::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

type MessageHandlerFn =
    dyn Fn(Arc<Connection>, Value) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync;
type RpcHandlerFn = dyn Fn(Arc<Connection>, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// Expected type of one RPC parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Any,
    Bool,
    Integer,
    Float,
    String,
    Binary,
    Array,
    Map,
}

impl ParamKind {
    fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Integer => "int",
            Self::Float => "float",
            Self::String => "str",
            Self::Binary => "bin",
            Self::Array => "array",
            Self::Map => "map",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Bool => value.is_bool(),
            Self::Integer => value.is_i64() || value.is_u64(),
            // Integers are accepted where floats are expected
            Self::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            Self::String => value.is_str(),
            Self::Binary => matches!(value, Value::Binary(_)),
            Self::Array => value.is_array(),
            Self::Map => value.is_map(),
        }
    }
}

/// One named parameter in a method schema.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Parameter schema attached to an RPC method at registration.
#[derive(Debug, Clone, Default)]
pub struct MethodSchema {
    pub params: Vec<ParamSpec>,
}

impl MethodSchema {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    /// Check a params value against this schema.
    ///
    /// Nil is treated as an empty map so zero-argument calls need no body.
    pub fn validate(&self, params: &Value) -> Result<()> {
        let entries: &[(Value, Value)] = match params {
            Value::Nil => &[],
            Value::Map(entries) => entries,
            _ => {
                return Err(ConduitError::InvalidParams(
                    "params must be a map".to_string(),
                ))
            }
        };

        for spec in &self.params {
            let found = entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(spec.name.as_str()))
                .map(|(_, v)| v);
            match found {
                None | Some(Value::Nil) => {
                    if spec.required {
                        return Err(ConduitError::InvalidParams(format!(
                            "missing required parameter '{}'",
                            spec.name
                        )));
                    }
                }
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(ConduitError::InvalidParams(format!(
                            "parameter '{}' must be {}",
                            spec.name,
                            spec.kind.name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Discovery representation: `[{name, type, required}]`.
    fn describe(&self) -> Value {
        Value::Array(
            self.params
                .iter()
                .map(|p| {
                    payload::value_map([
                        ("name", Value::from(p.name.as_str())),
                        ("type", Value::from(p.kind.name())),
                        ("required", Value::from(p.required)),
                    ])
                })
                .collect(),
        )
    }
}

struct RegisteredMessageHandler {
    priority: i32,
    handler: Arc<MessageHandlerFn>,
}

struct RpcMethod {
    description: String,
    schema: MethodSchema,
    handler: Arc<RpcHandlerFn>,
}

/// Dispatch table shared by every connection of a server or client.
pub struct Router {
    messages: RwLock<HashMap<String, Vec<RegisteredMessageHandler>>>,
    methods: RwLock<HashMap<String, RpcMethod>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a message type tag, replacing any prior
    /// registration for that tag.
    ///
    /// A `Some` return value is sent back as a MESSAGE of the same tag
    /// carrying the request's correlation id.
    pub fn register_message<F, Fut>(&self, type_tag: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Arc<Connection>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let boxed: Arc<MessageHandlerFn> =
            Arc::new(move |conn, data| Box::pin(handler(conn, data)));
        let mut messages = self
            .messages
            .write()
            .map_err(|_| ConduitError::Custom(constants::ERR_ROUTER_WRITE_LOCK.to_string()))?;
        messages.insert(
            type_tag.into(),
            vec![RegisteredMessageHandler {
                priority: 0,
                handler: boxed,
            }],
        );
        Ok(())
    }

    /// Register an additional handler for a tag with an explicit priority.
    ///
    /// All handlers for the tag run in descending priority order; the
    /// highest-priority non-`None` return value is the one replied.
    /// Priorities never reorder delivery across distinct tags.
    pub fn register_message_with_priority<F, Fut>(
        &self,
        type_tag: impl Into<String>,
        priority: i32,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Arc<Connection>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let boxed: Arc<MessageHandlerFn> =
            Arc::new(move |conn, data| Box::pin(handler(conn, data)));
        let mut messages = self
            .messages
            .write()
            .map_err(|_| ConduitError::Custom(constants::ERR_ROUTER_WRITE_LOCK.to_string()))?;
        let entry = messages.entry(type_tag.into()).or_default();
        entry.push(RegisteredMessageHandler {
            priority,
            handler: boxed,
        });
        entry.sort_by_key(|h| std::cmp::Reverse(h.priority));
        Ok(())
    }

    /// Register an RPC method with its parameter schema, replacing any
    /// prior registration under the same name.
    pub fn register_rpc<F, Fut>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: MethodSchema,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Arc<Connection>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let boxed: Arc<RpcHandlerFn> = Arc::new(move |conn, params| Box::pin(handler(conn, params)));
        let mut methods = self
            .methods
            .write()
            .map_err(|_| ConduitError::Custom(constants::ERR_ROUTER_WRITE_LOCK.to_string()))?;
        methods.insert(
            name.into(),
            RpcMethod {
                description: description.into(),
                schema,
                handler: boxed,
            },
        );
        Ok(())
    }

    /// Whether any handler is registered for a message tag.
    pub fn has_message_handler(&self, type_tag: &str) -> bool {
        self.messages
            .read()
            .map(|m| m.contains_key(type_tag))
            .unwrap_or(false)
    }

    /// Route one inbound frame. Called from a spawned per-message task.
    pub async fn dispatch(&self, conn: Arc<Connection>, frame: Frame) {
        match frame.frame_type {
            FrameType::Message => self.dispatch_message(conn, frame).await,
            FrameType::RpcRequest => self.dispatch_rpc(conn, frame).await,
            other => {
                debug!(frame_type = ?other, "Router ignoring non-dispatchable frame");
            }
        }
    }

    async fn dispatch_message(&self, conn: Arc<Connection>, frame: Frame) {
        let message: MessagePayload = match payload::decode(&frame.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed MESSAGE payload");
                return;
            }
        };

        let handlers: Vec<Arc<MessageHandlerFn>> = match self.messages.read() {
            Ok(messages) => messages
                .get(&message.type_tag)
                .map(|list| list.iter().map(|h| h.handler.clone()).collect())
                .unwrap_or_default(),
            Err(_) => {
                warn!("{}", constants::ERR_ROUTER_READ_LOCK);
                return;
            }
        };

        if handlers.is_empty() {
            debug!(type_tag = %message.type_tag, "No handler for message tag");
            return;
        }

        let mut reply: Option<Value> = None;
        for handler in handlers {
            match handler(conn.clone(), message.data.clone()).await {
                Ok(Some(value)) => {
                    // Highest-priority return is authoritative
                    if reply.is_none() {
                        reply = Some(value);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(type_tag = %message.type_tag, error = %e, "Message handler failed");
                }
            }
        }

        if let Some(value) = reply {
            let body = MessagePayload {
                type_tag: message.type_tag.clone(),
                data: value,
            };
            match payload::encode(&body) {
                Ok(bytes) => {
                    let reply_frame = Frame::new(FrameType::Message, frame.correlation, bytes);
                    if let Err(e) = conn.enqueue_data(reply_frame).await {
                        warn!(error = %e, "Failed to enqueue message reply");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode message reply"),
            }
        }
    }

    async fn dispatch_rpc(&self, conn: Arc<Connection>, frame: Frame) {
        let request: RpcRequestPayload = match payload::decode(&frame.payload) {
            Ok(request) => request,
            Err(_) => {
                let error = RpcErrorPayload::new(
                    "RPC_REQUEST payload must be {method, params}",
                    Some(codes::VALIDATION),
                );
                Self::send_rpc_error(&conn, frame.correlation, error).await;
                return;
            }
        };

        if request.method == "listall" {
            let listing = self.describe_methods();
            Self::send_rpc_response(&conn, frame.correlation, listing).await;
            return;
        }

        let method = match self.methods.read() {
            Ok(methods) => methods.get(&request.method).map(|m| {
                (m.schema.clone(), m.handler.clone())
            }),
            Err(_) => {
                warn!("{}", constants::ERR_ROUTER_READ_LOCK);
                return;
            }
        };

        let Some((schema, handler)) = method else {
            let error = RpcErrorPayload::new(
                format!("Method not found: {}", request.method),
                Some(codes::METHOD_NOT_FOUND),
            );
            Self::send_rpc_error(&conn, frame.correlation, error).await;
            return;
        };

        if let Err(e) = schema.validate(&request.params) {
            let error = RpcErrorPayload::new(e.to_string(), e.code());
            Self::send_rpc_error(&conn, frame.correlation, error).await;
            return;
        }

        match handler(conn.clone(), request.params).await {
            Ok(result) => Self::send_rpc_response(&conn, frame.correlation, result).await,
            Err(e) => {
                let code = e.code().unwrap_or(codes::HANDLER_ERROR);
                let error = RpcErrorPayload::new(e.to_string(), Some(code));
                Self::send_rpc_error(&conn, frame.correlation, error).await;
            }
        }
    }

    /// Discovery listing for `listall`, including the built-in itself.
    fn describe_methods(&self) -> Value {
        let mut listing = vec![payload::value_map([
            ("name", Value::from("listall")),
            (
                "description",
                Value::from("List all registered RPC methods"),
            ),
            ("parameters", Value::Array(Vec::new())),
        ])];

        if let Ok(methods) = self.methods.read() {
            let mut names: Vec<&String> = methods.keys().collect();
            names.sort();
            for name in names {
                let method = &methods[name];
                listing.push(payload::value_map([
                    ("name", Value::from(name.as_str())),
                    ("description", Value::from(method.description.as_str())),
                    ("parameters", method.schema.describe()),
                ]));
            }
        }
        Value::Array(listing)
    }

    async fn send_rpc_response(conn: &Arc<Connection>, correlation: u64, result: Value) {
        let body = RpcResponsePayload::new(result);
        match payload::encode(&body) {
            Ok(bytes) => {
                let frame = Frame::new(FrameType::RpcResponse, correlation, bytes);
                if let Err(e) = conn.enqueue_data(frame).await {
                    warn!(error = %e, "Failed to enqueue RPC response");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode RPC response"),
        }
    }

    async fn send_rpc_error(conn: &Arc<Connection>, correlation: u64, error: RpcErrorPayload) {
        match payload::encode(&error) {
            Ok(bytes) => {
                let frame = Frame::new(FrameType::RpcError, correlation, bytes);
                if let Err(e) = conn.enqueue_data(frame).await {
                    warn!(error = %e, "Failed to enqueue RPC error");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode RPC error"),
        }
    }
}
