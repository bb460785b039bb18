//! Wire-protocol drivers and method locator atop `flarust-core`: §4.3-§4.5.

pub mod locator;
pub mod protocols;
pub mod wire;

/// Generated from `proto/poppy.proto`.
pub mod poppy_proto {
    include!(concat!(env!("OUT_DIR"), "/poppy.rs"));
}
/// Generated from `proto/brpc.proto`.
pub mod brpc_proto {
    include!(concat!(env!("OUT_DIR"), "/brpc.rs"));
}
/// Generated from `proto/trpc.proto`.
pub mod trpc_proto {
    include!(concat!(env!("OUT_DIR"), "/trpc.rs"));
}
/// Generated from `proto/hbase.proto`.
pub mod hbase_proto {
    include!(concat!(env!("OUT_DIR"), "/hbase.rs"));
}

pub use locator::{MethodDescriptor, MethodLocator, ProtocolTag, ServiceDescriptor};
pub use wire::{
    CallContext, Controller, ControllerFactory, DecodedMessage, EarlyErrorMessage, FactoryMessageKind,
    HandlerOutcome, MessageCutStatus, MessageFactory, ParseOutcome, Payload, ProtocolDriver, RawMessage,
};
