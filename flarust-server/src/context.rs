//! Per-listener configuration: which protocols a connection tries and which
//! methods are wired up to run when one of them decodes a request.
//!
//! Grounded on `flare::rpc::detail::NormalConnectionHandler::Context` (see
//! `normal_connection_handler.h` in the original source): a `Context` bundles
//! the service list and protocol list shared by every connection accepted
//! on one listener. Two of our six protocol drivers (`PoppyDriver`,
//! `HbaseDriver`) keep per-connection handshake state directly in `self`, so
//! unlike the original's shared `protocols` vector, here each [`Connection`]
//! gets its own freshly built set of driver instances; [`ServerContext`]
//! holds factories rather than the drivers themselves.
//!
//! [`Connection`]: crate::connection::Connection

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use flarust_protocols::{CallContext, HandlerOutcome, MethodDescriptor, ProtocolDriver};
use parking_lot::RwLock;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Builds one connection's private instance of a protocol driver.
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn ProtocolDriver> + Send + Sync>;

/// What a handler reports back to the connection state machine: §4.6 step 4.
pub struct HandlerReply {
    pub outcome: HandlerOutcome,
    /// Encoded response payload, if any; `None` for `Dropped`/`Corrupted`.
    pub payload: Option<Box<dyn Any + Send>>,
    pub status: i32,
}

impl HandlerReply {
    pub fn processed(payload: Box<dyn Any + Send>) -> Self {
        Self { outcome: HandlerOutcome::Processed, payload: Some(payload), status: 0 }
    }

    pub fn corrupted() -> Self {
        Self { outcome: HandlerOutcome::Corrupted, payload: None, status: 0 }
    }
}

pub type UnaryHandlerFn = Arc<dyn Fn(Box<dyn Any + Send>, CallContext) -> BoxFuture<(CallContext, HandlerReply)> + Send + Sync>;

/// A registered RPC method: the wire-level descriptor shared with the
/// protocol drivers' method locator, plus the business logic a driver's
/// decoded request is dispatched to. Streaming methods are out of scope for
/// this registry's `call` signature - §4.6's stream demux hands decoded
/// messages to the handler one at a time via a channel instead; see
/// [`crate::connection`] for how `is_stream` methods are wired up.
pub struct Handler {
    pub descriptor: Arc<MethodDescriptor>,
    pub call: UnaryHandlerFn,
}

/// Configuration shared by every connection accepted on one listener.
pub struct ServerContext {
    pub service_name: String,
    pub protocol_factories: Vec<ProtocolFactory>,
    pub max_request_queueing_delay: Option<Duration>,
    /// Mirrors `Server::OnNewCall`'s admission check: `None` means unbounded.
    pub max_concurrent_calls: Option<i64>,
    inflight: AtomicI64,
    handlers: RwLock<HashMap<String, Arc<Handler>>>,
}

impl ServerContext {
    pub fn new(service_name: impl Into<String>, protocol_factories: Vec<ProtocolFactory>) -> Self {
        Self {
            service_name: service_name.into(),
            protocol_factories,
            max_request_queueing_delay: None,
            max_concurrent_calls: None,
            inflight: AtomicI64::new(0),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_max_queueing_delay(mut self, delay: Duration) -> Self {
        self.max_request_queueing_delay = Some(delay);
        self
    }

    pub fn with_max_concurrent_calls(mut self, limit: i64) -> Self {
        self.max_concurrent_calls = Some(limit);
        self
    }

    /// Admission check run in the I/O task, before a worker task is even
    /// spawned - see §4.6 step 4's note on why this can't be deferred.
    pub fn try_begin_call(&self) -> bool {
        match self.max_concurrent_calls {
            None => {
                self.inflight.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(limit) => {
                let prev = self.inflight.fetch_add(1, Ordering::Relaxed);
                if prev < limit {
                    true
                } else {
                    self.inflight.fetch_sub(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    pub fn end_call(&self) {
        self.inflight.fetch_sub(1, Ordering::Release);
    }

    pub fn register_handler(&self, handler: Handler) {
        self.handlers.write().insert(handler.descriptor.full_name.clone(), Arc::new(handler));
    }

    pub fn handler(&self, full_name: &str) -> Option<Arc<Handler>> {
        self.handlers.read().get(full_name).cloned()
    }

    /// Builds one connection's private set of protocol driver instances.
    pub fn build_protocols(&self) -> Vec<Box<dyn ProtocolDriver>> {
        self.protocol_factories.iter().map(|f| f()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_admission_always_succeeds() {
        let ctx = ServerContext::new("svc", vec![]);
        for _ in 0..1000 {
            assert!(ctx.try_begin_call());
        }
    }

    #[test]
    fn bounded_admission_rejects_past_limit() {
        let ctx = ServerContext::new("svc", vec![]).with_max_concurrent_calls(2);
        assert!(ctx.try_begin_call());
        assert!(ctx.try_begin_call());
        assert!(!ctx.try_begin_call());
        ctx.end_call();
        assert!(ctx.try_begin_call());
    }

    #[test]
    fn handler_lookup_round_trips() {
        let ctx = ServerContext::new("svc", vec![]);
        assert!(ctx.handler("missing").is_none());
    }
}
