//! Observability and Metrics
//!
//! Process-wide counters for monitoring engine health: connection churn,
//! authentication outcomes, frame and byte volume, RPC activity, and
//! flow-control events.
//!
//! Uses atomic counters for thread-safe collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Global metrics collector for engine operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Successful authentications
    pub auth_success: AtomicU64,
    /// Failed authentications
    pub auth_failed: AtomicU64,
    /// Total frames sent
    pub frames_sent: AtomicU64,
    /// Total frames received
    pub frames_received: AtomicU64,
    /// Total payload bytes sent
    pub bytes_sent: AtomicU64,
    /// Total payload bytes received
    pub bytes_received: AtomicU64,
    /// RPC calls issued
    pub rpc_calls: AtomicU64,
    /// RPC calls that timed out
    pub rpc_timeouts: AtomicU64,
    /// PAUSE frames emitted by flow control
    pub pauses_sent: AtomicU64,
    /// RESUME frames emitted by flow control
    pub resumes_sent: AtomicU64,
    /// Connections failed at the heartbeat deadline
    pub heartbeat_failures: AtomicU64,
    /// Frame-stream integrity violations
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            auth_success: AtomicU64::new(0),
            auth_failed: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            rpc_calls: AtomicU64::new(0),
            rpc_timeouts: AtomicU64::new(0),
            pauses_sent: AtomicU64::new(0),
            resumes_sent: AtomicU64::new(0),
            heartbeat_failures: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a successful authentication
    pub fn auth_succeeded(&self) {
        self.auth_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed authentication
    pub fn auth_rejected(&self) {
        self.auth_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame sent
    pub fn frame_sent(&self, payload_bytes: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload_bytes, Ordering::Relaxed);
    }

    /// Record a frame received
    pub fn frame_received(&self, payload_bytes: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(payload_bytes, Ordering::Relaxed);
    }

    /// Record an RPC call issued
    pub fn rpc_call(&self) {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an RPC call that expired
    pub fn rpc_timeout(&self) {
        self.rpc_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a PAUSE frame emitted
    pub fn pause_sent(&self) {
        self.pauses_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a RESUME frame emitted
    pub fn resume_sent(&self) {
        self.resumes_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a heartbeat-deadline failure
    pub fn heartbeat_failure(&self) {
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame-stream integrity violation
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            auth_success: self.auth_success.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            rpc_calls: self.rpc_calls.load(Ordering::Relaxed),
            rpc_timeouts: self.rpc_timeouts.load(Ordering::Relaxed),
            pauses_sent: self.pauses_sent.load(Ordering::Relaxed),
            resumes_sent: self.resumes_sent.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            auth_success = snapshot.auth_success,
            auth_failed = snapshot.auth_failed,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            rpc_calls = snapshot.rpc_calls,
            rpc_timeouts = snapshot.rpc_timeouts,
            pauses_sent = snapshot.pauses_sent,
            resumes_sent = snapshot.resumes_sent,
            heartbeat_failures = snapshot.heartbeat_failures,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Engine metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub auth_success: u64,
    pub auth_failed: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rpc_calls: u64,
    pub rpc_timeouts: u64,
    pub pauses_sent: u64,
    pub resumes_sent: u64,
    pub heartbeat_failures: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

/// Global metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
