//! # Conduit
//!
//! Bidirectional TCP messaging library multiplexing three activities over
//! a single authenticated stream: free-form typed messages, correlated
//! request/response calls, and keep-alive probes, with flow control,
//! connection health tracking, and ordered authentication.
//!
//! ## Architecture
//! - **core**: frame layout, tokio codec, MessagePack payloads
//! - **transport**: TCP sockets with deadlines and idempotent close
//! - **protocol**: password handshake, dispatch router, RPC machinery
//! - **connection**: the state machine and its send/receive/heartbeat loops
//! - **service**: `Server` (accept loop + pool + broadcast) and `Client`
//!   (connect + reconnect supervisor)
//!
//! ## Example
//! ```no_run
//! use conduit::config::{ClientConfig, ServerConfig};
//! use conduit::protocol::router::{MethodSchema, ParamKind, ParamSpec};
//! use conduit::{Client, Server};
//! use rmpv::Value;
//!
//! # async fn run() -> conduit::error::Result<()> {
//! let server = Server::new(ServerConfig {
//!     password: "secret".into(),
//!     port: 9000,
//!     ..Default::default()
//! });
//! server.rpc(
//!     "add",
//!     "Add two integers",
//!     MethodSchema::new(vec![
//!         ParamSpec::required("a", ParamKind::Integer),
//!         ParamSpec::required("b", ParamKind::Integer),
//!     ]),
//!     |_conn, params| async move {
//!         let a = conduit::core::payload::map_get(&params, "a")
//!             .and_then(Value::as_i64)
//!             .unwrap_or(0);
//!         let b = conduit::core::payload::map_get(&params, "b")
//!             .and_then(Value::as_i64)
//!             .unwrap_or(0);
//!         Ok(Value::from(a + b))
//!     },
//! )?;
//! server.start().await?;
//!
//! let client = Client::new(ClientConfig {
//!     password: "secret".into(),
//!     server_port: 9000,
//!     ..Default::default()
//! });
//! client.connect().await?;
//! let sum = client
//!     .call(
//!         "add",
//!         conduit::core::payload::value_map([
//!             ("a", Value::from(10)),
//!             ("b", Value::from(20)),
//!         ]),
//!         None,
//!     )
//!     .await?;
//! assert_eq!(sum.as_i64(), Some(30));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::{ClientConfig, ConduitConfig, LoggingConfig, ServerConfig};
pub use crate::connection::{Connection, ConnectionHealth, ConnectionState, Role};
pub use crate::core::{Frame, FrameCodec, FrameType};
pub use crate::error::{ConduitError, Result};
pub use crate::protocol::{AuthSession, CallEnvelope, MethodSchema, ParamKind, ParamSpec, Router};
pub use crate::service::{Client, Server};
