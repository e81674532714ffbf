//! # Protocol Layer
//!
//! Authentication, dispatch, and the correlated RPC machinery built on
//! top of the frame codec.
//!
//! ## Components
//! - **Auth**: password handshake executed at connect time
//! - **Router**: name-keyed message handlers and RPC methods
//! - **RPC**: correlation ids, pending calls, reply envelopes

pub mod auth;
pub mod router;
pub mod rpc;

pub use auth::AuthSession;
pub use router::{MethodSchema, ParamKind, ParamSpec, Router};
pub use rpc::{CallEnvelope, PendingCalls};
