//! FlareStd: this crate's native protocol. §4.5.1 / §6.
//!
//! `["FRPC" magic (4B)][LE u32 meta_size][LE u32 msg_size][LE u32
//! att_size][meta][msg][att]`, meta being `flarust_core::meta::RpcMeta`
//! directly - no translation layer, unlike every other driver in this
//! crate.

use std::sync::Arc;

use bytes::Bytes;
use flarust_core::buffer::{NoncontiguousBuffer, NoncontiguousBufferBuilder, flatten_slow};
use flarust_core::compression::{self, Algorithm};
use flarust_core::meta::{
    CompressionAlgorithm, MessageFlags, MethodType, RequestMeta, ResponseMeta, RpcMeta, Status, rpc_meta::Meta as MetaOneof,
};
use flarust_core::status::STATUS_RESERVED_MAX;
use prost::Message;

use crate::locator::{MethodLocator, ProtocolTag};
use crate::wire::{
    Controller, ControllerFactory, DecodedMessage, DefaultControllerFactory, EarlyErrorMessage, FactoryMessageKind,
    MessageCutStatus, MessageFactory, ParseOutcome, Payload, ProtocolDriver, RawMessage,
};

const MAGIC: &[u8; 4] = b"FRPC";
const HEADER_LEN: usize = 16;

/// Compile-time tag for the method locator: FlareStd keys methods by their
/// full name, same string carried in `RequestMeta.method_name`.
pub struct FlareStdTag;

impl ProtocolTag for FlareStdTag {
    type Key = String;
}

fn algorithm_from_wire(algo: CompressionAlgorithm) -> Option<Algorithm> {
    match algo {
        CompressionAlgorithm::None => None,
        CompressionAlgorithm::Gzip => Some(Algorithm::Gzip),
        CompressionAlgorithm::Lz4Frame => Some(Algorithm::Lz4Frame),
        CompressionAlgorithm::Snappy => Some(Algorithm::Snappy),
        CompressionAlgorithm::Zstd => Some(Algorithm::Zstd),
    }
}

fn algorithm_to_wire(algo: Option<Algorithm>) -> CompressionAlgorithm {
    match algo {
        None => CompressionAlgorithm::None,
        Some(Algorithm::Gzip) => CompressionAlgorithm::Gzip,
        Some(Algorithm::Lz4Frame) => CompressionAlgorithm::Lz4Frame,
        Some(Algorithm::Snappy) => CompressionAlgorithm::Snappy,
        Some(Algorithm::Zstd) => CompressionAlgorithm::Zstd,
    }
}

struct FlareStdMessageFactory;

impl MessageFactory for FlareStdMessageFactory {
    fn create(&self, kind: FactoryMessageKind, correlation_id: u64, _is_stream: bool) -> Option<EarlyErrorMessage> {
        let status = match kind {
            FactoryMessageKind::Overloaded => Status::Overloaded as i32,
            FactoryMessageKind::CircuitBroken => Status::OutOfService as i32,
        };
        Some(EarlyErrorMessage { correlation_id, status, description: String::new() })
    }
}

pub struct FlareStdDriver {
    locator: Arc<MethodLocator>,
    message_factory: FlareStdMessageFactory,
    controller_factory: DefaultControllerFactory,
}

impl FlareStdDriver {
    pub fn new(locator: Arc<MethodLocator>) -> Self {
        Self { locator, message_factory: FlareStdMessageFactory, controller_factory: DefaultControllerFactory }
    }

    fn build_meta(message: &DecodedMessage, controller: &Controller, no_payload: bool) -> RpcMeta {
        let mut flags: u64 = 0;
        if no_payload {
            flags |= MessageFlags::NoPayload as u64;
        }
        let meta = if let Some(method_name) = &message.method_full_name {
            MetaOneof::RequestMeta(RequestMeta {
                method_name: method_name.clone(),
                acceptable_compression_algorithms: 0,
                timeout_ms: 0,
                tracing_context: controller.tracing_context.clone(),
            })
        } else {
            MetaOneof::ResponseMeta(ResponseMeta {
                status: message.status,
                description: controller.description.clone(),
                trace_forcibly_sampled: controller.trace_forcibly_sampled,
            })
        };
        RpcMeta {
            correlation_id: message.correlation_id,
            method_type: if message.is_stream { MethodType::Stream } else { MethodType::Single } as i32,
            flags,
            compression_algorithm: algorithm_to_wire(controller.compression_algorithm) as i32,
            attachment_compressed: controller.attachment_compressed && message.attachment.is_some(),
            meta: Some(meta),
        }
    }
}

impl ProtocolDriver for FlareStdDriver {
    fn name(&self) -> &'static str {
        "flare_std"
    }

    fn message_factory(&self) -> &dyn MessageFactory {
        &self.message_factory
    }

    fn controller_factory(&self) -> &dyn ControllerFactory {
        &self.controller_factory
    }

    fn try_cut_message(&self, buffer: &mut NoncontiguousBuffer) -> (MessageCutStatus, Option<RawMessage>) {
        let head = flatten_slow(buffer, HEADER_LEN.min(buffer.byte_size()));
        if head.len() < 4 {
            if head.as_slice() != &MAGIC[..head.len()] {
                return (MessageCutStatus::ProtocolMismatch, None);
            }
            return (MessageCutStatus::NeedMore, None);
        }
        if &head[0..4] != MAGIC {
            return (MessageCutStatus::ProtocolMismatch, None);
        }
        if head.len() < HEADER_LEN {
            return (MessageCutStatus::NeedMore, None);
        }
        let meta_size = u32::from_le_bytes(head[4..8].try_into().unwrap()) as usize;
        let msg_size = u32::from_le_bytes(head[8..12].try_into().unwrap()) as usize;
        let att_size = u32::from_le_bytes(head[12..16].try_into().unwrap()) as usize;
        let total = HEADER_LEN + meta_size + msg_size + att_size;
        if buffer.byte_size() < total {
            return (MessageCutStatus::NeedMore, None);
        }

        let mut frame = buffer.cut(total);
        frame.skip(HEADER_LEN);
        let meta_bytes = flatten_slow(&frame.cut(meta_size), meta_size);
        let meta = match RpcMeta::decode(meta_bytes.as_slice()) {
            Ok(m) => m,
            Err(_) => return (MessageCutStatus::Error, None),
        };
        let body = frame.cut(msg_size);
        let attachment = if att_size > 0 { Some(frame) } else { None };
        let correlation_id = meta.correlation_id;
        let is_stream = meta.method_type() == MethodType::Stream;

        (
            MessageCutStatus::Cut,
            Some(RawMessage { correlation_id, is_stream, protocol_meta: Box::new(meta), body, attachment }),
        )
    }

    fn try_parse(&self, message: RawMessage, controller: &mut Controller) -> ParseOutcome {
        let meta = match message.protocol_meta.downcast::<RpcMeta>() {
            Ok(m) => *m,
            Err(_) => return ParseOutcome::ProtocolError,
        };

        controller.compression_algorithm = algorithm_from_wire(meta.compression_algorithm());
        controller.attachment_compressed = meta.attachment_compressed;

        let Some(MetaOneof::RequestMeta(request_meta)) = &meta.meta else {
            // Response side: hand the raw (still possibly compressed) body
            // back; the caller (client channel) knows its own response type
            // and decompresses/decodes it.
            let status = match &meta.meta {
                Some(MetaOneof::ResponseMeta(r)) => r.status,
                _ => Status::MalformedData as i32,
            };
            if let Some(MetaOneof::ResponseMeta(r)) = &meta.meta {
                controller.trace_forcibly_sampled = r.trace_forcibly_sampled;
                controller.description = r.description.clone();
                controller.failed = r.status != Status::Success as i32;
            }
            let body = flatten_slow(&message.body, message.body.byte_size());
            return ParseOutcome::Decoded(DecodedMessage {
                correlation_id: message.correlation_id,
                is_stream: message.is_stream,
                method_full_name: None,
                status,
                payload: if meta.flags & (MessageFlags::NoPayload as u64) != 0 {
                    Payload::None
                } else {
                    Payload::Raw(Bytes::from(body))
                },
                attachment: message.attachment,
            });
        };

        controller.tracing_context = request_meta.tracing_context.clone();

        let no_payload = meta.flags & (MessageFlags::NoPayload as u64) != 0;
        if no_payload {
            return ParseOutcome::Decoded(DecodedMessage {
                correlation_id: message.correlation_id,
                is_stream: message.is_stream,
                method_full_name: Some(request_meta.method_name.clone()),
                status: Status::Success as i32,
                payload: Payload::None,
                attachment: message.attachment,
            });
        }

        let Some(desc) = self.locator.try_get_method_desc::<FlareStdTag>(&request_meta.method_name) else {
            return ParseOutcome::EarlyError(EarlyErrorMessage {
                correlation_id: message.correlation_id,
                status: Status::MethodNotFound as i32,
                description: format!("method not found: {}", request_meta.method_name),
            });
        };

        let body_bytes = match controller.compression_algorithm {
            Some(algo) => match compression::decompress(algo, &message.body) {
                Ok(nb) => flatten_slow(&nb, nb.byte_size()),
                Err(_) => {
                    return ParseOutcome::EarlyError(EarlyErrorMessage {
                        correlation_id: message.correlation_id,
                        status: Status::ParseRequest as i32,
                        description: "failed to decompress request body".into(),
                    });
                }
            },
            None => flatten_slow(&message.body, message.body.byte_size()),
        };

        let decoded = match (desc.decode_request)(&body_bytes) {
            Ok(d) => d,
            Err(_) => {
                return ParseOutcome::EarlyError(EarlyErrorMessage {
                    correlation_id: message.correlation_id,
                    status: Status::ParseRequest as i32,
                    description: "failed to decode request body".into(),
                });
            }
        };

        ParseOutcome::Decoded(DecodedMessage {
            correlation_id: message.correlation_id,
            is_stream: message.is_stream,
            method_full_name: Some(desc.full_name.clone()),
            status: Status::Success as i32,
            payload: Payload::Decoded(decoded),
            attachment: message.attachment,
        })
    }

    fn write_message(&self, message: &DecodedMessage, buffer: &mut NoncontiguousBufferBuilder, controller: &Controller) {
        let no_payload = matches!(message.payload, Payload::None);
        let meta = Self::build_meta(message, controller, no_payload);
        let meta_bytes = meta.encode_to_vec();

        let body_plain: &[u8] = match &message.payload {
            Payload::Raw(bytes) => bytes,
            Payload::None => &[],
            Payload::Decoded(_) => panic!("write_message requires an already-encoded (Raw) payload"),
        };
        let mut body_builder = NoncontiguousBufferBuilder::new();
        if let Some(algo) = controller.compression_algorithm {
            compression::compress(algo, body_plain, &mut body_builder).expect("in-memory compression cannot fail");
        } else {
            body_builder.append_slice(body_plain);
        }
        let body_nb = body_builder.destructive_get();

        let att_nb = match &message.attachment {
            Some(att) if controller.attachment_compressed => {
                let flat = flatten_slow(att, att.byte_size());
                let mut ab = NoncontiguousBufferBuilder::new();
                match controller.compression_algorithm {
                    Some(algo) => compression::compress(algo, &flat, &mut ab).expect("in-memory compression cannot fail"),
                    None => ab.append_slice(&flat),
                }
                Some(ab.destructive_get())
            }
            Some(att) => Some(att.clone()),
            None => None,
        };
        let att_size = att_nb.as_ref().map(|a| a.byte_size()).unwrap_or(0);

        buffer.append_slice(MAGIC);
        buffer.append_slice(&(meta_bytes.len() as u32).to_le_bytes());
        buffer.append_slice(&(body_nb.byte_size() as u32).to_le_bytes());
        buffer.append_slice(&(att_size as u32).to_le_bytes());
        buffer.append_slice(&meta_bytes);
        buffer.append_noncontiguous(body_nb);
        if let Some(att) = att_nb {
            buffer.append_noncontiguous(att);
        }
    }

    fn write_early_error(&self, message: &EarlyErrorMessage, buffer: &mut NoncontiguousBufferBuilder) {
        let meta = RpcMeta {
            correlation_id: message.correlation_id,
            method_type: MethodType::Single as i32,
            flags: MessageFlags::NoPayload as u64,
            compression_algorithm: CompressionAlgorithm::None as i32,
            attachment_compressed: false,
            meta: Some(MetaOneof::ResponseMeta(ResponseMeta {
                status: message.status,
                description: message.description.clone(),
                trace_forcibly_sampled: false,
            })),
        };
        let meta_bytes = meta.encode_to_vec();
        buffer.append_slice(MAGIC);
        buffer.append_slice(&(meta_bytes.len() as u32).to_le_bytes());
        buffer.append_slice(&0u32.to_le_bytes());
        buffer.append_slice(&0u32.to_le_bytes());
        buffer.append_slice(&meta_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::MethodDescriptor;
    use flarust_core::buffer::create_buffer;

    fn echo_locator() -> Arc<MethodLocator> {
        let locator = Arc::new(MethodLocator::new());
        let desc = Arc::new(MethodDescriptor {
            full_name: "flare.testing.EchoService.Echo".into(),
            service_full_name: "flare.testing.EchoService".into(),
            method_name: "Echo".into(),
            is_stream: false,
            decode_request: Box::new(|b| Ok(Box::new(b.to_vec()))),
            encode_response: Box::new(|a| a.downcast_ref::<Vec<u8>>().unwrap().clone()),
        });
        locator.register_method::<FlareStdTag>(desc, "flare.testing.EchoService.Echo".to_string());
        locator
    }

    #[test]
    fn round_trip_request_s2() {
        let locator = echo_locator();
        let driver = FlareStdDriver::new(locator);

        let request = DecodedMessage {
            correlation_id: 1,
            is_stream: false,
            method_full_name: Some("flare.testing.EchoService.Echo".into()),
            status: 0,
            payload: Payload::Raw(Bytes::from_static(b"asdf")),
            attachment: None,
        };
        let controller = Controller::new(false);
        let mut builder = NoncontiguousBufferBuilder::new();
        driver.write_message(&request, &mut builder, &controller);
        let mut wire = builder.destructive_get();

        let (status, raw) = driver.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::Cut);
        assert_eq!(wire.byte_size(), 0);

        let mut server_controller = Controller::new(false);
        match driver.try_parse(raw.unwrap(), &mut server_controller) {
            ParseOutcome::Decoded(decoded) => {
                assert_eq!(decoded.method_full_name.as_deref(), Some("flare.testing.EchoService.Echo"));
                match decoded.payload {
                    Payload::Decoded(body) => assert_eq!(*body.downcast::<Vec<u8>>().unwrap(), b"asdf".to_vec()),
                    _ => panic!("expected decoded payload"),
                }
            }
            _ => panic!("expected a decoded message"),
        }
    }

    #[test]
    fn byte_at_a_time_needs_more_then_cuts_once() {
        let locator = echo_locator();
        let driver = FlareStdDriver::new(locator);
        let request = DecodedMessage {
            correlation_id: 7,
            is_stream: false,
            method_full_name: Some("flare.testing.EchoService.Echo".into()),
            status: 0,
            payload: Payload::Raw(Bytes::from_static(b"hi")),
            attachment: None,
        };
        let mut builder = NoncontiguousBufferBuilder::new();
        driver.write_message(&request, &mut builder, &Controller::new(false));
        let full = flatten_slow(&builder.destructive_get(), usize::MAX);

        let mut fed = NoncontiguousBuffer::new();
        let mut cuts = 0;
        for (i, byte) in full.iter().enumerate() {
            fed.append_buffer(create_buffer(&[*byte]));
            let (status, raw) = driver.try_cut_message(&mut fed);
            if i + 1 < full.len() {
                assert_eq!(status, MessageCutStatus::NeedMore, "byte {i}");
            } else {
                assert_eq!(status, MessageCutStatus::Cut);
                assert!(raw.is_some());
                cuts += 1;
            }
        }
        assert_eq!(cuts, 1);
    }

    #[test]
    fn unknown_method_produces_early_error() {
        let locator = echo_locator();
        let driver = FlareStdDriver::new(locator);
        let request = DecodedMessage {
            correlation_id: 2,
            is_stream: false,
            method_full_name: Some("does.not.Exist".into()),
            status: 0,
            payload: Payload::Raw(Bytes::from_static(b"x")),
            attachment: None,
        };
        let mut builder = NoncontiguousBufferBuilder::new();
        driver.write_message(&request, &mut builder, &Controller::new(false));
        let mut wire = builder.destructive_get();
        let (_, raw) = driver.try_cut_message(&mut wire);
        match driver.try_parse(raw.unwrap(), &mut Controller::new(false)) {
            ParseOutcome::EarlyError(e) => assert_eq!(e.status, Status::MethodNotFound as i32),
            _ => panic!("expected early error"),
        }
    }
}
