//! Caller-side RPC machinery: correlation ids, pending-call slots, and
//! the uniform reply envelope.
//!
//! Every outbound call allocates a fresh non-zero correlation id and parks
//! a completion slot in the pending table. The receive loop completes the
//! slot when the matching RPC_RESPONSE or RPC_ERROR arrives; timeouts
//! remove the slot so a late reply cannot be misdelivered, and connection
//! failure drops every slot, surfacing `ConnectionLost` to each caller.

use crate::core::payload::RpcErrorPayload;
use crate::error::{ConduitError, Result};
use dashmap::DashMap;
use rmpv::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// A completed call as delivered by the receive loop.
#[derive(Debug)]
pub enum CallReply {
    /// RPC_RESPONSE arrived: the unwrapped `result` value
    Response(Value),
    /// RPC_ERROR arrived: the decoded error body
    Error(RpcErrorPayload),
}

/// The uniform envelope returned to callers who want errors as data
/// rather than as `Err`.
#[derive(Debug, Clone)]
pub struct CallEnvelope {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub code: Option<u16>,
    pub details: Option<Value>,
    pub correlation_id: String,
}

impl CallEnvelope {
    fn from_reply(reply: CallReply, correlation: u64) -> Self {
        match reply {
            CallReply::Response(data) => Self {
                success: true,
                data: Some(data),
                error: None,
                code: None,
                details: None,
                correlation_id: correlation.to_string(),
            },
            CallReply::Error(body) => Self {
                success: false,
                data: None,
                error: Some(body.error),
                code: body.code,
                details: body.details,
                correlation_id: correlation.to_string(),
            },
        }
    }

    /// Collapse the envelope into a Result, raising the error side.
    pub fn into_result(self) -> Result<Value> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Nil))
        } else {
            Err(ConduitError::Custom(format!(
                "RPC error{}: {}",
                self.code.map(|c| format!(" ({c})")).unwrap_or_default(),
                self.error.unwrap_or_else(|| "unknown".to_string()),
            )))
        }
    }
}

/// Table of outstanding calls keyed by correlation id.
pub struct PendingCalls {
    next_id: AtomicU64,
    slots: DashMap<u64, oneshot::Sender<CallReply>>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: DashMap::new(),
        }
    }

    /// Allocate a correlation id: non-zero and unique among outstanding
    /// calls. Ids are never reused while their slot is still pending.
    pub fn allocate(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.slots.contains_key(&id) {
                return id;
            }
        }
    }

    /// Park a completion slot for an allocated id.
    pub fn register(&self, correlation: u64) -> oneshot::Receiver<CallReply> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(correlation, tx);
        rx
    }

    /// Complete a pending call. Returns false when no slot matches, in
    /// which case the caller logs and drops the reply.
    pub fn complete(&self, correlation: u64, reply: CallReply) -> bool {
        match self.slots.remove(&correlation) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop the slot for a timed-out call so its id frees up and a late
    /// reply cannot be misdelivered.
    pub fn cancel(&self, correlation: u64) {
        self.slots.remove(&correlation);
    }

    /// Fail every outstanding call; their receivers observe closure and
    /// surface `ConnectionLost`.
    pub fn fail_all(&self) {
        let count = self.slots.len();
        if count > 0 {
            debug!(pending = count, "Failing outstanding RPC calls");
        }
        self.slots.clear();
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Await a parked call under its deadline.
pub async fn await_call(
    pending: &PendingCalls,
    correlation: u64,
    rx: oneshot::Receiver<CallReply>,
    deadline: Duration,
) -> Result<CallEnvelope> {
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(reply)) => Ok(CallEnvelope::from_reply(reply, correlation)),
        // Sender dropped without a reply: the connection failed
        Ok(Err(_)) => Err(ConduitError::ConnectionLost),
        Err(_) => {
            pending.cancel(correlation);
            Err(ConduitError::RpcTimeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_unique_and_nonzero() {
        let pending = PendingCalls::new();
        let a = pending.allocate();
        let b = pending.allocate();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn completion_delivers_reply() {
        let pending = PendingCalls::new();
        let id = pending.allocate();
        let rx = pending.register(id);

        assert!(pending.complete(id, CallReply::Response(Value::from(30))));
        let envelope = await_call(&pending, id, rx, Duration::from_secs(1))
            .await
            .expect("reply");
        assert!(envelope.success);
        assert_eq!(envelope.data, Some(Value::from(30)));
        assert_eq!(envelope.correlation_id, id.to_string());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unknown_correlation_is_reported() {
        let pending = PendingCalls::new();
        assert!(!pending.complete(9999, CallReply::Response(Value::Nil)));
    }

    #[tokio::test]
    async fn timeout_removes_slot() {
        let pending = PendingCalls::new();
        let id = pending.allocate();
        let rx = pending.register(id);

        let err = await_call(&pending, id, rx, Duration::from_millis(20))
            .await
            .expect_err("must time out");
        assert!(matches!(err, ConduitError::RpcTimeout));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn fail_all_surfaces_connection_lost() {
        let pending = PendingCalls::new();
        let id = pending.allocate();
        let rx = pending.register(id);

        pending.fail_all();
        let err = await_call(&pending, id, rx, Duration::from_secs(1))
            .await
            .expect_err("must fail");
        assert!(matches!(err, ConduitError::ConnectionLost));
    }

    #[tokio::test]
    async fn error_reply_becomes_error_envelope() {
        let pending = PendingCalls::new();
        let id = pending.allocate();
        let rx = pending.register(id);

        pending.complete(
            id,
            CallReply::Error(RpcErrorPayload::new("no such method", Some(4000))),
        );
        let envelope = await_call(&pending, id, rx, Duration::from_secs(1))
            .await
            .expect("envelope");
        assert!(!envelope.success);
        assert_eq!(envelope.code, Some(4000));
        assert!(envelope.into_result().is_err());
    }
}
