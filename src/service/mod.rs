//! # Service Facades
//!
//! The user-facing Server and Client built on the connection core.
//!
//! ## Components
//! - **Server**: accept supervisor, connection pool, broadcast, hooks
//! - **Client**: connect, reconnect supervisor with backoff, hooks

pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;
