//! HBase: §4.5.6 / §6.
//!
//! Unlike the other five drivers, a connection opens with a one-time,
//! variable-length handshake: `["HBas" magic][u8 version=0][u8
//! auth=80][BE u32 conn_header_size]` followed by a plain (non
//! length-delimited - the preamble already gave the exact length)
//! `ConnectionHeader`. Every frame after that is `[BE u32 total_size][varint-
//! delimited header][optional varint-delimited body][cell block bytes]`,
//! where `total_size` counts everything *after* its own four bytes and the
//! cell block is sized by subtraction, then checked against
//! `CellBlockMeta.length`.
//!
//! The framework's usual rule - a driver consumes nothing from the buffer
//! unless it returns `Cut` - has one sanctioned exception here: once the
//! full preamble and connection header are buffered, this driver consumes
//! them and returns `NeedMore` so the next call can cut the first real
//! frame. The caller only ever sees consumed bytes alongside a `Cut`
//! instead on every other path.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flarust_core::buffer::{NoncontiguousBuffer, NoncontiguousBufferBuilder, create_buffer, flatten_slow};
use flarust_core::status::Status;
use prost::Message;

use crate::hbase_proto::{CellBlockMeta, ConnectionHeader, ExceptionResponse, RequestHeader, ResponseHeader, UserInformation};
use crate::locator::{MethodLocator, ProtocolTag};
use crate::wire::{
    Controller, ControllerFactory, DecodedMessage, DefaultControllerFactory, EarlyErrorMessage, FactoryMessageKind,
    MessageCutStatus, MessageFactory, NullMessageFactory, ParseOutcome, Payload, ProtocolDriver, RawMessage,
};

const PREAMBLE_MAGIC: &[u8; 4] = b"HBas";
const PREAMBLE_LEN: usize = 10;
const RPC_VERSION: u8 = 0;
const AUTH_SIMPLE: u8 = 80;

pub struct HbaseTag;

impl ProtocolTag for HbaseTag {
    /// `(service_name, method_name)`: the connection header fixes the
    /// service for the whole connection, so per-request keys only need the
    /// method name, but the locator is shared across every service.
    type Key = (String, String);
}

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        if i == 9 {
            return None;
        }
    }
    None
}

fn write_delimited(msg: &impl Message, out: &mut Vec<u8>) {
    let body = msg.encode_to_vec();
    encode_varint(body.len() as u64, out);
    out.extend_from_slice(&body);
}

enum HbaseMeta {
    Request(RequestHeader),
    Response(ResponseHeader),
}

fn exception_class_for(status: i32) -> String {
    if status == Status::MethodNotFound as i32 {
        "org.apache.hadoop.hbase.exceptions.UnknownProtocolException".to_string()
    } else {
        "java.io.IOException".to_string()
    }
}

fn exception_class_to_status(class_name: &str) -> i32 {
    if class_name.contains("UnknownProtocolException") {
        Status::MethodNotFound as i32
    } else {
        Status::Failed as i32
    }
}

struct HandshakeState {
    done: bool,
    service_name: Option<String>,
}

pub struct HbaseDriver {
    locator: Arc<MethodLocator>,
    server_side: bool,
    /// Client-only: the service this connection addresses, sent in the
    /// one-time `ConnectionHeader`.
    client_service_name: String,
    client_user: String,
    handshake: Mutex<HandshakeState>,
    controller_factory: DefaultControllerFactory,
}

impl HbaseDriver {
    pub fn new_server(locator: Arc<MethodLocator>) -> Self {
        Self {
            locator,
            server_side: true,
            client_service_name: String::new(),
            client_user: String::new(),
            handshake: Mutex::new(HandshakeState { done: false, service_name: None }),
            controller_factory: DefaultControllerFactory,
        }
    }

    pub fn new_client(locator: Arc<MethodLocator>, service_name: String, user: String) -> Self {
        Self {
            locator,
            server_side: false,
            client_service_name: service_name,
            client_user: user,
            handshake: Mutex::new(HandshakeState { done: false, service_name: None }),
            controller_factory: DefaultControllerFactory,
        }
    }
}

impl ProtocolDriver for HbaseDriver {
    fn name(&self) -> &'static str {
        "hbase"
    }

    fn not_multiplexable(&self) -> bool {
        true
    }

    fn message_factory(&self) -> &dyn MessageFactory {
        &NullMessageFactory
    }

    fn controller_factory(&self) -> &dyn ControllerFactory {
        &self.controller_factory
    }

    fn try_cut_message(&self, buffer: &mut NoncontiguousBuffer) -> (MessageCutStatus, Option<RawMessage>) {
        {
            let mut state = self.handshake.lock().unwrap();
            if !state.done {
                if buffer.byte_size() < PREAMBLE_LEN {
                    return (MessageCutStatus::NotIdentified, None);
                }
                let preamble = flatten_slow(buffer, PREAMBLE_LEN);
                if &preamble[0..4] != PREAMBLE_MAGIC {
                    return (MessageCutStatus::ProtocolMismatch, None);
                }
                if preamble[4] != RPC_VERSION || preamble[5] != AUTH_SIMPLE {
                    return (MessageCutStatus::Error, None);
                }
                let conn_header_size = u32::from_be_bytes(preamble[6..10].try_into().unwrap()) as usize;
                if buffer.byte_size() < PREAMBLE_LEN + conn_header_size {
                    // Preamble fully buffered but connection header isn't yet;
                    // nothing has been consumed, so an ordinary NeedMore works.
                    return (MessageCutStatus::NeedMore, None);
                }

                buffer.skip(PREAMBLE_LEN);
                let header_bytes = flatten_slow(&buffer.cut(conn_header_size), conn_header_size);
                let conn_header = match ConnectionHeader::decode(header_bytes.as_slice()) {
                    Ok(h) => h,
                    Err(_) => return (MessageCutStatus::Error, None),
                };
                state.service_name = Some(conn_header.service_name);
                state.done = true;
                // The handshake is now fully consumed from `buffer` even
                // though we're about to report NeedMore: the framework
                // explicitly allows mutating the buffer on this path, since
                // the bytes consumed can never be re-parsed as anything else.
                return (MessageCutStatus::NeedMore, None);
            }
        }

        if buffer.byte_size() < 4 {
            return (MessageCutStatus::NeedMore, None);
        }
        let size_head = flatten_slow(buffer, 4);
        let total_size = u32::from_be_bytes(size_head[0..4].try_into().unwrap()) as usize;
        if buffer.byte_size() < 4 + total_size {
            return (MessageCutStatus::NeedMore, None);
        }

        let mut frame = buffer.cut(4 + total_size);
        frame.skip(4);
        let flat = flatten_slow(&frame, total_size);

        let Some((header_len, consumed)) = decode_varint(&flat) else {
            return (MessageCutStatus::Error, None);
        };
        let mut pos = consumed;
        if pos + header_len as usize > flat.len() {
            return (MessageCutStatus::Error, None);
        }
        let header_bytes = &flat[pos..pos + header_len as usize];
        pos += header_len as usize;

        let (meta, correlation_id, cell_block_meta, has_body) = if self.server_side {
            let header = match RequestHeader::decode(header_bytes) {
                Ok(h) => h,
                Err(_) => return (MessageCutStatus::Error, None),
            };
            let correlation_id = header.call_id as u64;
            let cell_block_meta = header.cell_block_meta.clone();
            let has_body = header.request_param;
            (HbaseMeta::Request(header), correlation_id, cell_block_meta, has_body)
        } else {
            let header = match ResponseHeader::decode(header_bytes) {
                Ok(h) => h,
                Err(_) => return (MessageCutStatus::Error, None),
            };
            let correlation_id = header.call_id as u64;
            let cell_block_meta = header.cell_block_meta.clone();
            let has_body = header.exception.is_none();
            (HbaseMeta::Response(header), correlation_id, cell_block_meta, has_body)
        };

        let body_bytes: &[u8] = if has_body {
            let Some((body_len, consumed2)) = decode_varint(&flat[pos..]) else {
                return (MessageCutStatus::Error, None);
            };
            pos += consumed2;
            if pos + body_len as usize > flat.len() {
                return (MessageCutStatus::Error, None);
            }
            let slice = &flat[pos..pos + body_len as usize];
            pos += body_len as usize;
            slice
        } else {
            &[]
        };

        let cell_block_bytes = &flat[pos..];
        let expected_cell_block_len = cell_block_meta.as_ref().map(|m| m.length as usize).unwrap_or(0);
        if cell_block_bytes.len() != expected_cell_block_len {
            return (MessageCutStatus::Error, None);
        }

        let body = create_buffer(body_bytes);
        let attachment = if cell_block_bytes.is_empty() { None } else { Some(create_buffer(cell_block_bytes)) };

        (MessageCutStatus::Cut, Some(RawMessage { correlation_id, is_stream: false, protocol_meta: Box::new(meta), body, attachment }))
    }

    fn try_parse(&self, message: RawMessage, controller: &mut Controller) -> ParseOutcome {
        let meta = match message.protocol_meta.downcast::<HbaseMeta>() {
            Ok(m) => *m,
            Err(_) => return ParseOutcome::ProtocolError,
        };

        match *meta {
            HbaseMeta::Request(header) => {
                let service_name = self.handshake.lock().unwrap().service_name.clone().unwrap_or_default();
                let key = (service_name.clone(), header.method_name.clone());
                let Some(desc) = self.locator.try_get_method_desc::<HbaseTag>(&key) else {
                    return ParseOutcome::EarlyError(EarlyErrorMessage {
                        correlation_id: message.correlation_id,
                        status: Status::MethodNotFound as i32,
                        description: format!("method not found: {service_name}/{}", header.method_name),
                    });
                };

                let payload = if header.request_param {
                    let body_bytes = flatten_slow(&message.body, message.body.byte_size());
                    match (desc.decode_request)(&body_bytes) {
                        Ok(d) => Payload::Decoded(d),
                        Err(_) => {
                            return ParseOutcome::EarlyError(EarlyErrorMessage {
                                correlation_id: message.correlation_id,
                                status: Status::ParseRequest as i32,
                                description: "failed to decode hbase request param".into(),
                            });
                        }
                    }
                } else {
                    Payload::None
                };

                ParseOutcome::Decoded(DecodedMessage {
                    correlation_id: message.correlation_id,
                    is_stream: false,
                    method_full_name: Some(desc.full_name.clone()),
                    status: Status::Success as i32,
                    payload,
                    attachment: message.attachment,
                })
            }
            HbaseMeta::Response(header) => {
                if let Some(exception) = &header.exception {
                    controller.failed = true;
                    controller.exception_class_name = Some(exception.exception_class_name.clone());
                    controller.description = exception.stack_trace.clone();
                    let status = exception_class_to_status(&exception.exception_class_name);
                    return ParseOutcome::Decoded(DecodedMessage {
                        correlation_id: message.correlation_id,
                        is_stream: false,
                        method_full_name: None,
                        status,
                        payload: Payload::None,
                        attachment: message.attachment,
                    });
                }

                let body = flatten_slow(&message.body, message.body.byte_size());
                ParseOutcome::Decoded(DecodedMessage {
                    correlation_id: message.correlation_id,
                    is_stream: false,
                    method_full_name: None,
                    status: Status::Success as i32,
                    payload: Payload::Raw(Bytes::from(body)),
                    attachment: message.attachment,
                })
            }
        }
    }

    fn write_message(&self, message: &DecodedMessage, buffer: &mut NoncontiguousBufferBuilder, controller: &Controller) {
        if !self.server_side && !self.handshake.lock().unwrap().done {
            let conn_header = ConnectionHeader {
                user_info: Some(UserInformation { effective_user: self.client_user.clone(), real_user: String::new() }),
                service_name: self.client_service_name.clone(),
                cell_block_codec_class: String::new(),
                cell_block_compressor_class: String::new(),
            };
            let header_bytes = conn_header.encode_to_vec();
            buffer.append_slice(PREAMBLE_MAGIC);
            buffer.append_byte(RPC_VERSION);
            buffer.append_byte(AUTH_SIMPLE);
            buffer.append_slice(&(header_bytes.len() as u32).to_be_bytes());
            buffer.append_slice(&header_bytes);
            self.handshake.lock().unwrap().done = true;
        }

        let attachment = message.attachment.clone();
        let cell_block_len = attachment.as_ref().map(|a| a.byte_size()).unwrap_or(0) as u32;
        let cell_block_meta = Some(CellBlockMeta { length: cell_block_len });

        let mut frame = Vec::new();
        let has_body = !matches!(message.payload, Payload::None);

        if let Some(method) = &message.method_full_name {
            let (service_name, method_name) = method.rsplit_once('.').unwrap_or(("", method));
            let _ = service_name; // connection-scoped service; only the method travels per-request
            let header = RequestHeader {
                call_id: message.correlation_id as u32,
                method_name: method_name.to_string(),
                request_param: has_body,
                cell_block_meta,
                priority: 0,
                timeout_ms: 0,
            };
            write_delimited(&header, &mut frame);
        } else {
            let exception = if message.status != Status::Success as i32 {
                Some(ExceptionResponse {
                    exception_class_name: controller.exception_class_name.clone().unwrap_or_else(|| exception_class_for(message.status)),
                    stack_trace: controller.description.clone(),
                    do_not_retry: false,
                })
            } else {
                None
            };
            let header = ResponseHeader { call_id: message.correlation_id as u32, exception, cell_block_meta };
            write_delimited(&header, &mut frame);
        }

        if has_body {
            let body_plain: &[u8] = match &message.payload {
                Payload::Raw(bytes) => bytes,
                Payload::None => &[],
                Payload::Decoded(_) => panic!("write_message requires an already-encoded (Raw) payload"),
            };
            let mut varint_prefix = Vec::new();
            encode_varint(body_plain.len() as u64, &mut varint_prefix);
            frame.extend_from_slice(&varint_prefix);
            frame.extend_from_slice(body_plain);
        }

        let total_size = frame.len() + attachment.as_ref().map(|a| a.byte_size()).unwrap_or(0);
        buffer.append_slice(&(total_size as u32).to_be_bytes());
        buffer.append_slice(&frame);
        if let Some(att) = attachment {
            buffer.append_noncontiguous(att);
        }
    }

    fn write_early_error(&self, message: &EarlyErrorMessage, buffer: &mut NoncontiguousBufferBuilder) {
        let header = ResponseHeader {
            call_id: message.correlation_id as u32,
            exception: Some(ExceptionResponse {
                exception_class_name: exception_class_for(message.status),
                stack_trace: message.description.clone(),
                do_not_retry: false,
            }),
            cell_block_meta: None,
        };
        let mut frame = Vec::new();
        write_delimited(&header, &mut frame);
        buffer.append_slice(&(frame.len() as u32).to_be_bytes());
        buffer.append_slice(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::MethodDescriptor;

    fn echo_locator() -> Arc<MethodLocator> {
        let locator = Arc::new(MethodLocator::new());
        let desc = Arc::new(MethodDescriptor {
            full_name: "testing.EchoService.Echo".into(),
            service_full_name: "testing.EchoService".into(),
            method_name: "Echo".into(),
            is_stream: false,
            decode_request: Box::new(|b| Ok(Box::new(b.to_vec()))),
            encode_response: Box::new(|a| a.downcast_ref::<Vec<u8>>().unwrap().clone()),
        });
        locator.register_method::<HbaseTag>(desc, ("testing.EchoService".to_string(), "Echo".to_string()));
        locator
    }

    fn write_all(driver: &HbaseDriver, msgs: &[(DecodedMessage, Controller)]) -> NoncontiguousBuffer {
        let mut builder = NoncontiguousBufferBuilder::new();
        for (msg, ctrl) in msgs {
            driver.write_message(msg, &mut builder, ctrl);
        }
        builder.destructive_get()
    }

    #[test]
    fn handshake_then_request_round_trip() {
        let locator = echo_locator();
        let client = HbaseDriver::new_client(locator.clone(), "testing.EchoService".to_string(), "alice".to_string());
        let server = HbaseDriver::new_server(locator);

        let request = DecodedMessage {
            correlation_id: 7,
            is_stream: false,
            method_full_name: Some("testing.EchoService.Echo".into()),
            status: 0,
            payload: Payload::Raw(Bytes::from_static(b"ping")),
            attachment: None,
        };
        let mut wire = write_all(&client, &[(request, Controller::new(false))]);

        let (status, raw) = server.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::NeedMore);
        assert!(raw.is_none());

        let (status, raw) = server.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::Cut);
        assert_eq!(wire.byte_size(), 0);

        match server.try_parse(raw.unwrap(), &mut Controller::new(false)) {
            ParseOutcome::Decoded(decoded) => {
                assert_eq!(decoded.method_full_name.as_deref(), Some("testing.EchoService.Echo"));
                match decoded.payload {
                    Payload::Decoded(b) => assert_eq!(*b.downcast::<Vec<u8>>().unwrap(), b"ping".to_vec()),
                    _ => panic!("expected decoded payload"),
                }
            }
            _ => panic!("expected decoded message"),
        }
    }

    #[test]
    fn cell_block_round_trips_through_attachment() {
        let locator = echo_locator();
        let client = HbaseDriver::new_client(locator.clone(), "testing.EchoService".to_string(), "alice".to_string());
        let server = HbaseDriver::new_server(locator);

        let request = DecodedMessage {
            correlation_id: 11,
            is_stream: false,
            method_full_name: Some("testing.EchoService.Echo".into()),
            status: 0,
            payload: Payload::Raw(Bytes::from_static(b"ping")),
            attachment: Some(create_buffer(b"some cell data")),
        };
        let mut wire = write_all(&client, &[(request, Controller::new(false))]);
        server.try_cut_message(&mut wire); // consume handshake
        let (status, raw) = server.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::Cut);

        match server.try_parse(raw.unwrap(), &mut Controller::new(false)) {
            ParseOutcome::Decoded(decoded) => {
                let att = decoded.attachment.expect("cell block carried in attachment");
                assert_eq!(flatten_slow(&att, att.byte_size()), b"some cell data".to_vec());
            }
            _ => panic!("expected decoded message"),
        }
    }

    #[test]
    fn unrecognized_magic_is_protocol_mismatch() {
        let server = HbaseDriver::new_server(Arc::new(MethodLocator::new()));
        let mut builder = NoncontiguousBufferBuilder::new();
        builder.append_slice(b"NOPE000000");
        let mut wire = builder.destructive_get();
        let (status, _) = server.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::ProtocolMismatch);
    }

    #[test]
    fn exception_response_round_trip() {
        let locator = Arc::new(MethodLocator::new());
        let server = HbaseDriver::new_server(locator.clone());
        let client = HbaseDriver::new_client(locator, "testing.EchoService".to_string(), "bob".to_string());

        let response = DecodedMessage {
            correlation_id: 3,
            is_stream: false,
            method_full_name: None,
            status: Status::MethodNotFound as i32,
            payload: Payload::None,
            attachment: None,
        };
        let mut ctrl = Controller::new(false);
        ctrl.exception_class_name = Some("org.apache.hadoop.hbase.exceptions.UnknownProtocolException".into());
        ctrl.description = "no such method".into();
        let mut builder = NoncontiguousBufferBuilder::new();
        server.write_message(&response, &mut builder, &ctrl);
        let mut wire = builder.destructive_get();

        // Responses don't go through the connection-header handshake.
        client.handshake.lock().unwrap().done = true;
        let (status, raw) = client.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::Cut);
        match client.try_parse(raw.unwrap(), &mut Controller::new(false)) {
            ParseOutcome::Decoded(decoded) => {
                assert_eq!(decoded.status, Status::MethodNotFound as i32);
            }
            _ => panic!("expected decoded message"),
        }
    }
}
