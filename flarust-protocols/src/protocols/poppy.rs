//! Poppy: §4.5.2 / §6.
//!
//! A one-shot HTTP-style handshake runs once per connection, then every
//! following frame is `[BE u32 meta_size][BE u32 body_size][meta][body]`
//! with meta = `poppy::RpcMeta`. Unlike FlareStd this driver has to carry
//! one bit of per-connection state (has the handshake happened yet), so it
//! wraps it in a `Mutex<bool>` rather than relying on caller discipline.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flarust_core::buffer::{NoncontiguousBuffer, NoncontiguousBufferBuilder, flatten_slow, flatten_until};
use flarust_core::compression::{self, Algorithm};
use flarust_core::status::Status;
use prost::Message;

use crate::locator::{MethodLocator, ProtocolTag};
use crate::poppy_proto::RpcMeta;
use crate::wire::{
    Controller, ControllerFactory, DecodedMessage, DefaultControllerFactory, EarlyErrorMessage, FactoryMessageKind,
    MessageCutStatus, MessageFactory, NullMessageFactory, ParseOutcome, Payload, ProtocolDriver, RawMessage,
};

const HANDSHAKE_REQUEST_LINE: &[u8] = b"POST /__rpc_service__ HTTP/1.1\r\n";
const HANDSHAKE_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nX-Poppy-Compress-Type: 0,1\r\n\r\n";

pub struct PoppyTag;

impl ProtocolTag for PoppyTag {
    type Key = String;
}

fn algorithm_from_wire(compress_type: i32) -> Option<Algorithm> {
    match compress_type {
        1 => Some(Algorithm::Snappy),
        _ => None,
    }
}

fn algorithm_to_wire(algo: Option<Algorithm>) -> i32 {
    match algo {
        Some(Algorithm::Snappy) => 1,
        _ => 0,
    }
}

pub struct PoppyDriver {
    locator: Arc<MethodLocator>,
    handshake_done: Mutex<bool>,
    controller_factory: DefaultControllerFactory,
}

impl PoppyDriver {
    pub fn new(locator: Arc<MethodLocator>) -> Self {
        Self { locator, handshake_done: Mutex::new(false), controller_factory: DefaultControllerFactory }
    }
}

impl ProtocolDriver for PoppyDriver {
    fn name(&self) -> &'static str {
        "poppy"
    }

    fn message_factory(&self) -> &dyn MessageFactory {
        &NullMessageFactory
    }

    fn controller_factory(&self) -> &dyn ControllerFactory {
        &self.controller_factory
    }

    fn try_cut_message(&self, buffer: &mut NoncontiguousBuffer) -> (MessageCutStatus, Option<RawMessage>) {
        let mut done = self.handshake_done.lock().unwrap();
        if !*done {
            if buffer.byte_size() < HANDSHAKE_REQUEST_LINE.len() {
                return (MessageCutStatus::NeedMore, None);
            }
            let prefix = flatten_slow(buffer, HANDSHAKE_REQUEST_LINE.len());
            if prefix != HANDSHAKE_REQUEST_LINE {
                return (MessageCutStatus::ProtocolMismatch, None);
            }
            let head = flatten_until(buffer, b"\r\n\r\n", usize::MAX);
            if !head.ends_with(b"\r\n\r\n") {
                return (MessageCutStatus::NeedMore, None);
            }
            buffer.skip(head.len());
            *done = true;
            return (MessageCutStatus::NeedMore, None);
        }
        drop(done);

        if buffer.byte_size() < 8 {
            return (MessageCutStatus::NeedMore, None);
        }
        let head = flatten_slow(buffer, 8);
        let meta_size = u32::from_be_bytes(head[0..4].try_into().unwrap()) as usize;
        let body_size = u32::from_be_bytes(head[4..8].try_into().unwrap()) as usize;
        let total = 8 + meta_size + body_size;
        if buffer.byte_size() < total {
            return (MessageCutStatus::NeedMore, None);
        }

        let mut frame = buffer.cut(total);
        frame.skip(8);
        let meta_bytes = flatten_slow(&frame.cut(meta_size), meta_size);
        let meta = match RpcMeta::decode(meta_bytes.as_slice()) {
            Ok(m) => m,
            Err(_) => return (MessageCutStatus::Error, None),
        };
        let correlation_id = meta.sequence_id;
        let body = frame;

        (MessageCutStatus::Cut, Some(RawMessage { correlation_id, is_stream: false, protocol_meta: Box::new(meta), body, attachment: None }))
    }

    fn try_parse(&self, message: RawMessage, controller: &mut Controller) -> ParseOutcome {
        let meta = match message.protocol_meta.downcast::<RpcMeta>() {
            Ok(m) => *m,
            Err(_) => return ParseOutcome::ProtocolError,
        };
        let algo = algorithm_from_wire(meta.compress_type);
        controller.compression_algorithm = algo;

        if !meta.method.is_empty() {
            let Some(desc) = self.locator.try_get_method_desc::<PoppyTag>(&meta.method) else {
                return ParseOutcome::EarlyError(EarlyErrorMessage {
                    correlation_id: message.correlation_id,
                    status: Status::MethodNotFound as i32,
                    description: format!("method not found: {}", meta.method),
                });
            };
            let body_bytes = match algo {
                Some(a) => match compression::decompress(a, &message.body) {
                    Ok(nb) => flatten_slow(&nb, nb.byte_size()),
                    Err(_) => {
                        return ParseOutcome::EarlyError(EarlyErrorMessage {
                            correlation_id: message.correlation_id,
                            status: Status::ParseRequest as i32,
                            description: "failed to decompress poppy body".into(),
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
                        description: "failed to decode poppy body".into(),
                    });
                }
            };
            return ParseOutcome::Decoded(DecodedMessage {
                correlation_id: message.correlation_id,
                is_stream: false,
                method_full_name: Some(desc.full_name.clone()),
                status: Status::Success as i32,
                payload: Payload::Decoded(decoded),
                attachment: None,
            });
        }

        controller.failed = meta.failed;
        controller.description = meta.reason.clone();
        let status = if meta.failed { meta.error_code } else { Status::Success as i32 };
        let body = flatten_slow(&message.body, message.body.byte_size());
        ParseOutcome::Decoded(DecodedMessage {
            correlation_id: message.correlation_id,
            is_stream: false,
            method_full_name: None,
            status,
            payload: Payload::Raw(Bytes::from(body)),
            attachment: None,
        })
    }

    fn write_message(&self, message: &DecodedMessage, buffer: &mut NoncontiguousBufferBuilder, controller: &Controller) {
        if !*self.handshake_done.lock().unwrap() {
            buffer.append_slice(HANDSHAKE_REQUEST_LINE);
            buffer.append_slice(b"Cookie: POPPY_AUTH_TICKET=\r\n");
            buffer.append_slice(b"X-Poppy-Compress-Type: 0,1\r\n");
            buffer.append_slice(b"X-Poppy-Tos: 96\r\n\r\n");
            *self.handshake_done.lock().unwrap() = true;
        }

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

        let meta = if let Some(method) = &message.method_full_name {
            RpcMeta {
                method: method.clone(),
                sequence_id: message.correlation_id,
                failed: false,
                error_code: 0,
                reason: String::new(),
                compress_type: algorithm_to_wire(controller.compression_algorithm),
                expect_compressed_response: controller.compression_algorithm.is_some(),
            }
        } else {
            RpcMeta {
                method: String::new(),
                sequence_id: message.correlation_id,
                failed: message.status != Status::Success as i32,
                error_code: message.status,
                reason: controller.description.clone(),
                compress_type: algorithm_to_wire(controller.compression_algorithm),
                expect_compressed_response: false,
            }
        };
        let meta_bytes = meta.encode_to_vec();

        buffer.append_slice(&(meta_bytes.len() as u32).to_be_bytes());
        buffer.append_slice(&(body_nb.byte_size() as u32).to_be_bytes());
        buffer.append_slice(&meta_bytes);
        buffer.append_noncontiguous(body_nb);
    }

    fn write_early_error(&self, message: &EarlyErrorMessage, buffer: &mut NoncontiguousBufferBuilder) {
        let meta = RpcMeta {
            method: String::new(),
            sequence_id: message.correlation_id,
            failed: true,
            error_code: message.status,
            reason: message.description.clone(),
            compress_type: 0,
            expect_compressed_response: false,
        };
        let meta_bytes = meta.encode_to_vec();
        buffer.append_slice(&(meta_bytes.len() as u32).to_be_bytes());
        buffer.append_slice(&0u32.to_be_bytes());
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
            full_name: "Echo".into(),
            service_full_name: "poppy".into(),
            method_name: "Echo".into(),
            is_stream: false,
            decode_request: Box::new(|b| Ok(Box::new(b.to_vec()))),
            encode_response: Box::new(|a| a.downcast_ref::<Vec<u8>>().unwrap().clone()),
        });
        locator.register_method::<PoppyTag>(desc, "Echo".to_string());
        locator
    }

    #[test]
    fn handshake_then_frame_round_trip() {
        let driver = PoppyDriver::new(echo_locator());
        let request = DecodedMessage {
            correlation_id: 5,
            is_stream: false,
            method_full_name: Some("Echo".into()),
            status: 0,
            payload: Payload::Raw(Bytes::from_static(b"ping")),
            attachment: None,
        };
        let mut builder = NoncontiguousBufferBuilder::new();
        driver.write_message(&request, &mut builder, &Controller::new(false));
        let mut wire = builder.destructive_get();

        // First pass only consumes the handshake and asks for more.
        let (status, raw) = driver.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::NeedMore);
        assert!(raw.is_none());

        let (status, raw) = driver.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::Cut);
        let mut controller = Controller::new(false);
        match driver.try_parse(raw.unwrap(), &mut controller) {
            ParseOutcome::Decoded(decoded) => {
                assert_eq!(decoded.method_full_name.as_deref(), Some("Echo"));
            }
            _ => panic!("expected decoded message"),
        }
    }
}
