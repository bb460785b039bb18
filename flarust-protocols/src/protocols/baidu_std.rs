//! BaiduStd (BRPC): §4.5.3 / §6.
//!
//! `["PRPC" magic (4B)][BE u32 body_size][BE u32 meta_size][meta][msg][att]`,
//! meta = `brpc::RpcMeta`. Method name on the wire is `service + "." +
//! method`; this driver splits at the *last* dot, since service full names
//! may themselves contain dots.

use std::sync::Arc;

use bytes::Bytes;
use flarust_core::buffer::{NoncontiguousBuffer, NoncontiguousBufferBuilder, flatten_slow};
use flarust_core::compression::{self, Algorithm};
use flarust_core::status::Status;
use prost::Message;

use crate::brpc_proto::{RequestMeta, ResponseMeta, RpcMeta};
use crate::locator::{MethodLocator, ProtocolTag};
use crate::wire::{
    Controller, ControllerFactory, DecodedMessage, DefaultControllerFactory, EarlyErrorMessage, FactoryMessageKind,
    MessageCutStatus, MessageFactory, NullMessageFactory, ParseOutcome, Payload, ProtocolDriver, RawMessage,
};

const MAGIC: &[u8; 4] = b"PRPC";
const HEADER_LEN: usize = 12;

pub struct BaiduStdTag;

impl ProtocolTag for BaiduStdTag {
    type Key = String;
}

fn algorithm_from_wire(compress_type: i32) -> Option<Algorithm> {
    match compress_type {
        1 => Some(Algorithm::Snappy),
        2 => Some(Algorithm::Gzip),
        _ => None,
    }
}

fn algorithm_to_wire(algo: Option<Algorithm>) -> i32 {
    match algo {
        Some(Algorithm::Snappy) => 1,
        Some(Algorithm::Gzip) => 2,
        _ => 0,
    }
}

pub struct BaiduStdDriver {
    locator: Arc<MethodLocator>,
    controller_factory: DefaultControllerFactory,
}

impl BaiduStdDriver {
    pub fn new(locator: Arc<MethodLocator>) -> Self {
        Self { locator, controller_factory: DefaultControllerFactory }
    }
}

impl ProtocolDriver for BaiduStdDriver {
    fn name(&self) -> &'static str {
        "baidu_std"
    }

    fn message_factory(&self) -> &dyn MessageFactory {
        &NullMessageFactory
    }

    fn controller_factory(&self) -> &dyn ControllerFactory {
        &self.controller_factory
    }

    fn try_cut_message(&self, buffer: &mut NoncontiguousBuffer) -> (MessageCutStatus, Option<RawMessage>) {
        if buffer.byte_size() < 4 {
            return (MessageCutStatus::NotIdentified, None);
        }
        let head = flatten_slow(buffer, HEADER_LEN.min(buffer.byte_size()));
        if &head[0..4] != MAGIC {
            return (MessageCutStatus::ProtocolMismatch, None);
        }
        if head.len() < HEADER_LEN {
            return (MessageCutStatus::NeedMore, None);
        }
        let body_size = u32::from_be_bytes(head[4..8].try_into().unwrap()) as usize;
        let meta_size = u32::from_be_bytes(head[8..12].try_into().unwrap()) as usize;
        if buffer.byte_size() < HEADER_LEN + body_size {
            return (MessageCutStatus::NeedMore, None);
        }

        let mut frame = buffer.cut(HEADER_LEN + body_size);
        frame.skip(HEADER_LEN);
        let meta_bytes = flatten_slow(&frame.cut(meta_size), meta_size);
        let meta = match RpcMeta::decode(meta_bytes.as_slice()) {
            Ok(m) => m,
            Err(_) => return (MessageCutStatus::Error, None),
        };

        let attachment_size = meta.attachment_size.max(0) as usize;
        if attachment_size + meta_size > body_size {
            return (MessageCutStatus::Error, None);
        }
        let msg_size = body_size - meta_size - attachment_size;
        let body = frame.cut(msg_size);
        let attachment = if attachment_size > 0 { Some(frame) } else { None };
        let correlation_id = meta.correlation_id.max(0) as u64;

        (MessageCutStatus::Cut, Some(RawMessage { correlation_id, is_stream: false, protocol_meta: Box::new(meta), body, attachment }))
    }

    fn try_parse(&self, message: RawMessage, controller: &mut Controller) -> ParseOutcome {
        let meta = match message.protocol_meta.downcast::<RpcMeta>() {
            Ok(m) => *m,
            Err(_) => return ParseOutcome::ProtocolError,
        };
        let algo = algorithm_from_wire(meta.compress_type);
        controller.compression_algorithm = algo;

        if let Some(request) = &meta.request {
            let full_name = format!("{}.{}", request.service_name, request.method_name);
            let Some(desc) = self.locator.try_get_method_desc::<BaiduStdTag>(&full_name) else {
                return ParseOutcome::EarlyError(EarlyErrorMessage {
                    correlation_id: message.correlation_id,
                    status: Status::MethodNotFound as i32,
                    description: format!("method not found: {full_name}"),
                });
            };
            let body_bytes = match algo {
                Some(a) => match compression::decompress(a, &message.body) {
                    Ok(nb) => flatten_slow(&nb, nb.byte_size()),
                    Err(_) => {
                        return ParseOutcome::EarlyError(EarlyErrorMessage {
                            correlation_id: message.correlation_id,
                            status: Status::ParseRequest as i32,
                            description: "failed to decompress brpc body".into(),
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
                        description: "failed to decode brpc body".into(),
                    });
                }
            };
            return ParseOutcome::Decoded(DecodedMessage {
                correlation_id: message.correlation_id,
                is_stream: false,
                method_full_name: Some(desc.full_name.clone()),
                status: Status::Success as i32,
                payload: Payload::Decoded(decoded),
                attachment: message.attachment,
            });
        }

        let (status, description) = match &meta.response {
            Some(r) => (r.error_code, r.error_text.clone()),
            None => (Status::MalformedData as i32, String::new()),
        };
        controller.failed = status != Status::Success as i32;
        controller.description = description;
        let body = flatten_slow(&message.body, message.body.byte_size());
        ParseOutcome::Decoded(DecodedMessage {
            correlation_id: message.correlation_id,
            is_stream: false,
            method_full_name: None,
            status,
            payload: Payload::Raw(Bytes::from(body)),
            attachment: message.attachment,
        })
    }

    fn write_message(&self, message: &DecodedMessage, buffer: &mut NoncontiguousBufferBuilder, controller: &Controller) {
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

        let att_nb = message.attachment.clone();
        let attachment_size = att_nb.as_ref().map(|a| a.byte_size()).unwrap_or(0) as i32;

        let meta = if let Some(full_name) = &message.method_full_name {
            let (service_name, method_name) = full_name.rsplit_once('.').unwrap_or(("", full_name));
            RpcMeta {
                request: Some(RequestMeta { service_name: service_name.to_string(), method_name: method_name.to_string(), log_id: 0 }),
                response: None,
                compress_type: algorithm_to_wire(controller.compression_algorithm),
                correlation_id: message.correlation_id as i64,
                attachment_size,
            }
        } else {
            RpcMeta {
                request: None,
                response: Some(ResponseMeta { error_code: message.status, error_text: controller.description.clone() }),
                compress_type: algorithm_to_wire(controller.compression_algorithm),
                correlation_id: message.correlation_id as i64,
                attachment_size,
            }
        };
        let meta_bytes = meta.encode_to_vec();
        let body_size = meta_bytes.len() + body_nb.byte_size() + attachment_size as usize;

        buffer.append_slice(MAGIC);
        buffer.append_slice(&(body_size as u32).to_be_bytes());
        buffer.append_slice(&(meta_bytes.len() as u32).to_be_bytes());
        buffer.append_slice(&meta_bytes);
        buffer.append_noncontiguous(body_nb);
        if let Some(att) = att_nb {
            buffer.append_noncontiguous(att);
        }
    }

    fn write_early_error(&self, message: &EarlyErrorMessage, buffer: &mut NoncontiguousBufferBuilder) {
        let meta = RpcMeta {
            request: None,
            response: Some(ResponseMeta { error_code: message.status, error_text: message.description.clone() }),
            compress_type: 0,
            correlation_id: message.correlation_id as i64,
            attachment_size: 0,
        };
        let meta_bytes = meta.encode_to_vec();
        buffer.append_slice(MAGIC);
        buffer.append_slice(&(meta_bytes.len() as u32).to_be_bytes());
        buffer.append_slice(&(meta_bytes.len() as u32).to_be_bytes());
        buffer.append_slice(&meta_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::MethodDescriptor;

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
        locator.register_method::<BaiduStdTag>(desc, "flare.testing.EchoService.Echo".to_string());
        locator
    }

    #[test]
    fn round_trip() {
        let driver = BaiduStdDriver::new(echo_locator());
        let request = DecodedMessage {
            correlation_id: 42,
            is_stream: false,
            method_full_name: Some("flare.testing.EchoService.Echo".into()),
            status: 0,
            payload: Payload::Raw(Bytes::from_static(b"hello")),
            attachment: None,
        };
        let mut builder = NoncontiguousBufferBuilder::new();
        driver.write_message(&request, &mut builder, &Controller::new(false));
        let mut wire = builder.destructive_get();

        let (status, raw) = driver.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::Cut);
        match driver.try_parse(raw.unwrap(), &mut Controller::new(false)) {
            ParseOutcome::Decoded(decoded) => {
                assert_eq!(decoded.method_full_name.as_deref(), Some("flare.testing.EchoService.Echo"));
            }
            _ => panic!("expected decoded message"),
        }
    }

    #[test]
    fn corrupted_attachment_size_is_error() {
        let meta = RpcMeta {
            request: Some(RequestMeta { service_name: "svc".into(), method_name: "m".into(), log_id: 0 }),
            response: None,
            compress_type: 0,
            correlation_id: 1,
            attachment_size: 1000,
        };
        let meta_bytes = meta.encode_to_vec();
        let body_size = meta_bytes.len(); // attachment_size + meta_size > body_size
        let mut builder = NoncontiguousBufferBuilder::new();
        builder.append_slice(MAGIC);
        builder.append_slice(&(body_size as u32).to_be_bytes());
        builder.append_slice(&(meta_bytes.len() as u32).to_be_bytes());
        builder.append_slice(&meta_bytes);
        let mut wire = builder.destructive_get();

        let driver = BaiduStdDriver::new(Arc::new(MethodLocator::new()));
        let (status, _) = driver.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::Error);
    }
}
