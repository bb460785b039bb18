//! Protocol-agnostic contract every wire-protocol driver implements: §4.4.
//!
//! A [`ProtocolDriver`] recognizes, cuts, parses and serializes messages for
//! exactly one wire protocol. The connection state machine (in
//! `flarust-server`) holds a heterogeneous list of drivers and tries each in
//! turn; none of this module depends on that state machine, so drivers can
//! be exercised standalone in tests.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use flarust_core::buffer::{NoncontiguousBuffer, NoncontiguousBufferBuilder};
use flarust_core::compression::Algorithm;

use crate::locator::MethodDescriptor;

/// Result of one `try_cut_message` call. See §4.4's state diagram: a driver
/// must consume zero bytes from the source buffer unless it returns `Cut`
/// (the HBase handshake is the one spec-sanctioned exception, commented on
/// in `protocols::hbase`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCutStatus {
    NotIdentified,
    NeedMore,
    ProtocolMismatch,
    Cut,
    Error,
}

/// A raw, on-wire message a driver has cut off the front of the connection
/// buffer but not yet parsed. `protocol_meta` is the driver's own decoded
/// meta type (`flarust_core::meta::RpcMeta` for FlareStd, `poppy::RpcMeta`
/// for Poppy, ...), stored type-erased so this struct can stay
/// protocol-independent; each driver downcasts its own meta back out in
/// `try_parse`.
pub struct RawMessage {
    pub correlation_id: u64,
    pub is_stream: bool,
    pub protocol_meta: Box<dyn Any + Send>,
    pub body: NoncontiguousBuffer,
    pub attachment: Option<NoncontiguousBuffer>,
}

/// A message payload. `Decoded` only ever appears on the read/dispatch
/// path, produced by `try_parse` via the method descriptor's
/// `decode_request` closure. Everything a driver writes back out - a
/// dispatched handler's response, or a client's still-undecoded request -
/// travels as `Raw`, already encoded by `MethodDescriptor::encode_response`
/// or by the caller; `write_message` never needs to know a concrete prost
/// type.
pub enum Payload {
    Decoded(Box<dyn Any + Send>),
    Raw(Bytes),
    /// `no_payload` flag set in meta: single-message call with an empty body.
    None,
}

/// A decoded proto message: meta plus payload plus attachment, per §3's
/// "decoded proto message" container.
pub struct DecodedMessage {
    pub correlation_id: u64,
    pub is_stream: bool,
    pub method_full_name: Option<String>,
    /// Framework status (`STATUS_SUCCESS`, ...) for responses; always 0 on
    /// well-formed requests.
    pub status: i32,
    pub payload: Payload,
    pub attachment: Option<NoncontiguousBuffer>,
}

/// The third canonical container of §3: used when the method is unknown or
/// its key is invalid. A driver synthesizes a wire response straight from
/// this, without ever constructing a `DecodedMessage`.
pub struct EarlyErrorMessage {
    pub correlation_id: u64,
    pub status: i32,
    pub description: String,
}

/// What `try_parse` produced. Method-not-found is a first-class outcome,
/// not an error: §4.5.1 is explicit that it "produces an early-error
/// message rather than an Error cut" so the connection stays alive.
pub enum ParseOutcome {
    Decoded(DecodedMessage),
    EarlyError(EarlyErrorMessage),
    /// Structurally valid frame but meta/body failed to deserialize: drop
    /// the connection.
    ProtocolError,
}

/// Kinds of synthetic message a [`MessageFactory`] may be asked to produce.
/// Only `Overloaded` and `CircuitBroken` are required; a factory unable to
/// represent a kind on its wire returns `None` and the framework drops the
/// connection instead (§9 design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryMessageKind {
    Overloaded,
    CircuitBroken,
}

/// Produces synthetic protocol messages server-side reporting that fails
/// before a method descriptor, and so a correlation ID, was ever resolved.
pub trait MessageFactory: Send + Sync {
    fn create(&self, kind: FactoryMessageKind, correlation_id: u64, is_stream: bool) -> Option<EarlyErrorMessage>;
}

/// A factory that never produces a message; protocols without a
/// wire-representable overload/circuit-break response use this.
pub struct NullMessageFactory;

impl MessageFactory for NullMessageFactory {
    fn create(&self, _kind: FactoryMessageKind, _correlation_id: u64, _is_stream: bool) -> Option<EarlyErrorMessage> {
        None
    }
}

/// Per-call mutable state shared between the framework and the user
/// handler: §3's "call context", minus the fields (method descriptor,
/// endpoints, timestamps) that live on [`CallContext`] instead. `Controller`
/// is the part a protocol driver populates during `try_parse` and consults
/// during `write_message`.
#[derive(Debug, Default)]
pub struct Controller {
    pub is_stream: bool,
    pub tracing_context: Bytes,
    pub compression_algorithm: Option<Algorithm>,
    pub attachment_compressed: bool,
    pub failed: bool,
    pub status: i32,
    pub description: String,
    pub trace_forcibly_sampled: bool,
    /// HBase only: `ExceptionResponse.exception_class_name`, when `failed`.
    pub exception_class_name: Option<String>,
}

impl Controller {
    pub fn new(is_stream: bool) -> Self {
        Self { is_stream, ..Default::default() }
    }
}

/// Furnishes a fresh [`Controller`] per call, server-side.
pub trait ControllerFactory: Send + Sync {
    fn create(&self, is_stream: bool) -> Controller {
        Controller::new(is_stream)
    }
}

/// The default factory: every driver that doesn't need extra per-protocol
/// controller state uses this.
pub struct DefaultControllerFactory;

impl ControllerFactory for DefaultControllerFactory {}

/// Per-call state visible to the handler, owned by the connection state
/// machine (§3 "call context"). Protocol drivers never construct this
/// directly; they fill in a [`Controller`] which the state machine folds
/// into a `CallContext` alongside timestamps and the resolved descriptor.
pub struct CallContext {
    pub correlation_id: u64,
    pub method: Option<Arc<MethodDescriptor>>,
    pub remote_peer: Option<SocketAddr>,
    pub local_peer: Option<SocketAddr>,
    pub receive_ts: Instant,
    pub dispatch_ts: Option<Instant>,
    pub parse_ts: Option<Instant>,
    pub sent_ts: Option<Instant>,
    pub status: i32,
    /// HBase only: the cell-block bytes carried alongside the protobuf body.
    pub cell_block: Option<NoncontiguousBuffer>,
    pub controller: Controller,
}

impl CallContext {
    pub fn new(correlation_id: u64, receive_ts: Instant, controller: Controller) -> Self {
        Self {
            correlation_id,
            method: None,
            remote_peer: None,
            local_peer: None,
            receive_ts,
            dispatch_ts: None,
            parse_ts: None,
            sent_ts: None,
            status: 0,
            cell_block: None,
            controller,
        }
    }
}

/// Outcome a user handler reports back to the connection state machine
/// (§4.6 step 4). Drives what the state machine does with the connection
/// after the response (if any) is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Normal completion; connection stays open.
    Processed,
    /// Normal completion; connection closes after the response is flushed.
    Completed,
    Overloaded,
    /// Response intentionally withheld (e.g. a stream consumer already gone).
    Dropped,
    /// Fatal: drop the connection immediately, no response written.
    Corrupted,
    /// Handler panicked or returned something the framework can't map.
    Unexpected,
}

/// One wire-protocol driver: §4.4. Implementations live under
/// `crate::protocols`. A driver instance is stateless across calls on one
/// connection except for whatever `try_cut_message` needs to remember
/// between partial reads, which it keeps in `self` behind interior
/// mutability if required (none of the six drivers in this crate need to).
pub trait ProtocolDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// True for protocols that cannot multiplex more than one in-flight
    /// call per connection (HBase: call IDs exist but the channel is bound
    /// 1:1 to a single logical session in this implementation's scope).
    fn not_multiplexable(&self) -> bool {
        false
    }

    /// True for protocols with no explicit end-of-stream wire marker.
    fn no_end_of_stream_marker(&self) -> bool {
        false
    }

    fn message_factory(&self) -> &dyn MessageFactory;

    fn controller_factory(&self) -> &dyn ControllerFactory;

    /// Attempts to recognize and cut one message off the front of `buffer`.
    /// Must not consume any bytes from `buffer` unless it returns `Cut`.
    fn try_cut_message(&self, buffer: &mut NoncontiguousBuffer) -> (MessageCutStatus, Option<RawMessage>);

    /// Parses a cut raw message into a decoded message, populating
    /// `controller` with tracing context, compression algorithm and
    /// attachment.
    fn try_parse(&self, message: RawMessage, controller: &mut Controller) -> ParseOutcome;

    /// Serializes one decoded message onto `buffer`. The writer is
    /// single-threaded per connection; no synchronization is required here.
    fn write_message(&self, message: &DecodedMessage, buffer: &mut NoncontiguousBufferBuilder, controller: &Controller);

    /// Serializes an early-error (method-not-found, overload, ...) message.
    fn write_early_error(&self, message: &EarlyErrorMessage, buffer: &mut NoncontiguousBufferBuilder);
}
