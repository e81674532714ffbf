//! # Utility Modules
//!
//! Supporting utilities for compression, logging, timing, and metrics.
//!
//! This module provides reusable utilities used throughout the engine.
//!
//! ## Components
//! - **Compression**: per-frame deflate with size limits and thresholds
//! - **Logging**: structured logging configuration
//! - **Time**: epoch-millisecond timestamps for frame headers
//! - **Timeout**: async deadline wrappers and default durations
//! - **Metrics**: thread-safe observability counters
//!
//! ## Safety
//! - Decompression bomb protection (output capped at the frame limit)
//! - All counters are lock-free atomics

pub mod compression;
pub mod logging;
pub mod metrics;
pub mod time;
pub mod timeout;

pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
