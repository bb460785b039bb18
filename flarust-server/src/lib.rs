//! Connection state machine, admission control and binlog hooks atop
//! `flarust-protocols`: §4.6-§4.7.

pub mod binlog;
pub mod connection;
pub mod context;

pub use connection::{Connection, DataConsumptionStatus, FAST_CALL_RESERVED_CONTEXT_ID};
pub use context::{Handler, HandlerReply, ProtocolFactory, ServerContext, UnaryHandlerFn};
