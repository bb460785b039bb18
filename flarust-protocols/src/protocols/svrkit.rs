//! Svrkit: §4.5.4 / §6.
//!
//! `[BE u32 total_size][32-byte fixed header][body]`, no proto meta at all -
//! every piece of framing state lives in fixed header fields. This is the
//! only driver in this crate with a non-injective status mapping (§9 design
//! note a): several framework statuses collapse onto the same wire
//! sentinel, so only the wire→framework direction is guaranteed exact.

use std::sync::Arc;

use bytes::Bytes;
use flarust_core::buffer::{NoncontiguousBuffer, NoncontiguousBufferBuilder, flatten_slow};
use flarust_core::compression::{self, Algorithm};
use flarust_core::status::{Status, STATUS_RESERVED_MAX};

use crate::locator::{MethodLocator, ProtocolTag};
use crate::wire::{
    Controller, ControllerFactory, DecodedMessage, DefaultControllerFactory, EarlyErrorMessage, FactoryMessageKind,
    MessageCutStatus, MessageFactory, NullMessageFactory, ParseOutcome, Payload, ProtocolDriver, RawMessage,
};

const MAGIC: u16 = 0xABCD;
const HEADER_LEN: usize = 32;
const SEGMENT_TRAILER: &[u8; 3] = b"END";
const SEGMENT_TYPE_PROTO: u32 = 1;
const SEGMENT_TYPE_COOKIE: u32 = 2;

/// `(magic, cmd_id)`: the spec's `(u16, u16)` example key shape.
pub struct SvrkitTag;

impl ProtocolTag for SvrkitTag {
    type Key = (u16, u16);
}

/// Byte 2 bit 2 of `dirty_flags`: request body is compressed.
const FLAG_REQUEST_COMPRESSED: (usize, u8) = (2, 1 << 2);
/// Byte 1 bit 1: response body is compressed.
const FLAG_RESPONSE_COMPRESSED: (usize, u8) = (1, 1 << 1);
/// Byte 2 bit 1: compression is allowed for the response.
const FLAG_RESPONSE_COMPRESSION_ALLOWED: (usize, u8) = (2, 1 << 1);

fn flag(flags: &[u8; 4], pos: (usize, u8)) -> bool {
    flags[pos.0] & pos.1 != 0
}

fn set_flag(flags: &mut [u8; 4], pos: (usize, u8), value: bool) {
    if value {
        flags[pos.0] |= pos.1;
    } else {
        flags[pos.0] &= !pos.1;
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    magic: u16,
    version: u8,
    head_len: u8,
    body_len: u32,
    cmd_id: u16,
    checksum: u16,
    xff: u32,
    dirty_flags: [u8; 4],
    uin: u32,
    status: i32,
    always_one: u8,
    reserved: u8,
    segs_present: u8,
    verbose_log: u8,
}

impl Header {
    fn parse(bytes: &[u8]) -> Header {
        Header {
            magic: u16::from_be_bytes(bytes[0..2].try_into().unwrap()),
            version: bytes[2],
            head_len: bytes[3],
            body_len: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            cmd_id: u16::from_be_bytes(bytes[8..10].try_into().unwrap()),
            checksum: u16::from_be_bytes(bytes[10..12].try_into().unwrap()),
            xff: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            dirty_flags: bytes[16..20].try_into().unwrap(),
            uin: u32::from_be_bytes(bytes[20..24].try_into().unwrap()),
            status: i32::from_be_bytes(bytes[24..28].try_into().unwrap()),
            always_one: bytes[28],
            reserved: bytes[29],
            segs_present: bytes[30],
            verbose_log: bytes[31],
        }
    }

    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.magic.to_be_bytes());
        out[2] = self.version;
        out[3] = self.head_len;
        out[4..8].copy_from_slice(&self.body_len.to_be_bytes());
        out[8..10].copy_from_slice(&self.cmd_id.to_be_bytes());
        out[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum filled in afterward
        out[12..16].copy_from_slice(&self.xff.to_be_bytes());
        out[16..20].copy_from_slice(&self.dirty_flags);
        out[20..24].copy_from_slice(&self.uin.to_be_bytes());
        out[24..28].copy_from_slice(&self.status.to_be_bytes());
        out[28] = self.always_one;
        out[29] = self.reserved;
        out[30] = self.segs_present;
        out[31] = self.verbose_log;
        let sum = checksum16(&out);
        out[10..12].copy_from_slice(&sum.to_be_bytes());
        out
    }
}

/// 16-bit one's-complement word sum, per §6, with the checksum field itself
/// treated as zero (the caller must already have zeroed it).
fn checksum16(header: &[u8; HEADER_LEN]) -> u16 {
    let mut sum: u32 = 0;
    for word in header.chunks_exact(2) {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn checksum_valid(header: &[u8; HEADER_LEN]) -> bool {
    let mut zeroed = *header;
    zeroed[10..12].copy_from_slice(&0u16.to_be_bytes());
    checksum16(&zeroed) == u16::from_be_bytes(header[10..12].try_into().unwrap())
}

/// Parses the spec's two-segment body form: `[BE u32 type][BE u32
/// size][payload]["END"]` twice, rejecting unknown types, missing
/// trailers, or trailing garbage.
fn parse_segments(body: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut proto_payload = None;
    let mut cookie = None;
    let mut pos = 0;
    for _ in 0..2 {
        if body.len() < pos + 8 {
            return None;
        }
        let seg_type = u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap());
        let seg_size = u32::from_be_bytes(body[pos + 4..pos + 8].try_into().unwrap()) as usize;
        pos += 8;
        if body.len() < pos + seg_size + SEGMENT_TRAILER.len() {
            return None;
        }
        let payload = body[pos..pos + seg_size].to_vec();
        pos += seg_size;
        if &body[pos..pos + SEGMENT_TRAILER.len()] != SEGMENT_TRAILER {
            return None;
        }
        pos += SEGMENT_TRAILER.len();
        match seg_type {
            SEGMENT_TYPE_PROTO => proto_payload = Some(payload),
            SEGMENT_TYPE_COOKIE => cookie = Some(payload),
            _ => return None,
        }
    }
    if pos != body.len() {
        return None;
    }
    Some((proto_payload?, cookie.unwrap_or_default()))
}

fn write_segments(buffer: &mut NoncontiguousBufferBuilder, proto_payload: &[u8], cookie: &[u8]) {
    buffer.append_slice(&SEGMENT_TYPE_PROTO.to_be_bytes());
    buffer.append_slice(&(proto_payload.len() as u32).to_be_bytes());
    buffer.append_slice(proto_payload);
    buffer.append_slice(SEGMENT_TRAILER);
    buffer.append_slice(&SEGMENT_TYPE_COOKIE.to_be_bytes());
    buffer.append_slice(&(cookie.len() as u32).to_be_bytes());
    buffer.append_slice(cookie);
    buffer.append_slice(SEGMENT_TRAILER);
}

/// A "fixed large positive offset" separating wire-native negative error
/// sentinels from re-based user status codes (§4.5.4, §9 design note a).
const USER_STATUS_BASE: i32 = 10_000;
/// Sentinel used for any framework status with no more specific mapping.
const GENERIC_FAILURE_SENTINEL: i32 = -3;

fn framework_status_to_svrkit(status: i32) -> i32 {
    if status == Status::Success as i32 {
        return 0;
    }
    if status >= STATUS_RESERVED_MAX {
        return USER_STATUS_BASE + (status - STATUS_RESERVED_MAX);
    }
    match Status_from_i32(status) {
        Some(Status::MethodNotFound) => -1,
        Some(Status::Overloaded) | Some(Status::OutOfService) => -2,
        Some(Status::Timeout) => -4,
        Some(Status::NoPeer) => -5,
        _ => GENERIC_FAILURE_SENTINEL,
    }
}

fn svrkit_status_to_framework(code: i32) -> i32 {
    match code {
        0 => Status::Success as i32,
        c if c >= USER_STATUS_BASE => STATUS_RESERVED_MAX + (c - USER_STATUS_BASE),
        -1 => Status::MethodNotFound as i32,
        -2 => Status::Overloaded as i32,
        -4 => Status::Timeout as i32,
        -5 => Status::NoPeer as i32,
        _ => Status::Failed as i32,
    }
}

#[allow(non_snake_case)]
fn Status_from_i32(v: i32) -> Option<Status> {
    Status::try_from(v).ok()
}

fn algorithm_from_wire() -> Option<Algorithm> {
    // Svrkit's dirty-flag bits are boolean (compressed or not); the
    // framework-wide default algorithm is used whenever the bit is set.
    Some(Algorithm::Gzip)
}

pub struct SvrkitDriver {
    locator: Arc<MethodLocator>,
    controller_factory: DefaultControllerFactory,
}

impl SvrkitDriver {
    pub fn new(locator: Arc<MethodLocator>) -> Self {
        Self { locator, controller_factory: DefaultControllerFactory }
    }
}

impl ProtocolDriver for SvrkitDriver {
    fn name(&self) -> &'static str {
        "svrkit"
    }

    fn message_factory(&self) -> &dyn MessageFactory {
        &NullMessageFactory
    }

    fn controller_factory(&self) -> &dyn ControllerFactory {
        &self.controller_factory
    }

    fn try_cut_message(&self, buffer: &mut NoncontiguousBuffer) -> (MessageCutStatus, Option<RawMessage>) {
        // Every check below reads a non-destructive peek of `buffer`; the
        // buffer is only ever mutated (via `cut`) once every check has
        // passed and `Cut` is the decided outcome, per §4.4's no-bytes-
        // consumed-unless-Cut rule.
        if buffer.byte_size() < 4 + HEADER_LEN {
            return (MessageCutStatus::NeedMore, None);
        }
        let peeked = flatten_slow(buffer, 4 + HEADER_LEN);
        let total_size = u32::from_be_bytes(peeked[0..4].try_into().unwrap()) as usize;
        let header_bytes: [u8; HEADER_LEN] = peeked[4..4 + HEADER_LEN].try_into().unwrap();
        let header = Header::parse(&header_bytes);

        if header.magic != MAGIC {
            return (MessageCutStatus::ProtocolMismatch, None);
        }
        if total_size < HEADER_LEN || !checksum_valid(&header_bytes) {
            return (MessageCutStatus::Error, None);
        }
        if self.locator.try_get_method_desc::<SvrkitTag>(&(header.magic, header.cmd_id)).is_none() {
            return (MessageCutStatus::ProtocolMismatch, None);
        }
        if buffer.byte_size() < 4 + total_size {
            return (MessageCutStatus::NeedMore, None);
        }

        let whole_frame = flatten_slow(buffer, 4 + total_size);
        let body_bytes = whole_frame[4 + HEADER_LEN..].to_vec();

        let segs_present = header.segs_present != 0;
        let (proto_bytes, cookie) = if segs_present {
            match parse_segments(&body_bytes) {
                Some(v) => v,
                None => return (MessageCutStatus::Error, None),
            }
        } else {
            (body_bytes, Vec::new())
        };
        let _ = cookie; // carried on the controller in a full implementation; unused here

        buffer.skip(4 + total_size);
        let correlation_id = ((header.cmd_id as u64) << 16) | header.uin as u64;
        let body = flarust_core::buffer::create_buffer(&proto_bytes);

        (
            MessageCutStatus::Cut,
            Some(RawMessage { correlation_id, is_stream: false, protocol_meta: Box::new(header), body, attachment: None }),
        )
    }

    fn try_parse(&self, message: RawMessage, controller: &mut Controller) -> ParseOutcome {
        let header = match message.protocol_meta.downcast::<Header>() {
            Ok(h) => *h,
            Err(_) => return ParseOutcome::ProtocolError,
        };

        // `try_parse` doesn't know which direction it's decoding (this driver
        // has no `server_side` flag like Trpc's), so both compressed-body
        // bits are honored regardless of which side set them.
        let compressed =
            flag(&header.dirty_flags, FLAG_REQUEST_COMPRESSED) || flag(&header.dirty_flags, FLAG_RESPONSE_COMPRESSED);
        controller.compression_algorithm = if compressed { algorithm_from_wire() } else { None };

        let Some(desc) = self.locator.try_get_method_desc::<SvrkitTag>(&(header.magic, header.cmd_id)) else {
            return ParseOutcome::EarlyError(EarlyErrorMessage {
                correlation_id: message.correlation_id,
                status: Status::MethodNotFound as i32,
                description: "unregistered (magic, cmd_id)".into(),
            });
        };

        let raw_body = flatten_slow(&message.body, message.body.byte_size());
        let body_bytes = match controller.compression_algorithm {
            Some(algo) => match compression::decompress(algo, &message.body) {
                Ok(nb) => flatten_slow(&nb, nb.byte_size()),
                Err(_) => {
                    return ParseOutcome::EarlyError(EarlyErrorMessage {
                        correlation_id: message.correlation_id,
                        status: Status::ParseRequest as i32,
                        description: "failed to decompress svrkit body".into(),
                    });
                }
            },
            None => raw_body,
        };

        let decoded = match (desc.decode_request)(&body_bytes) {
            Ok(d) => d,
            Err(_) => {
                return ParseOutcome::EarlyError(EarlyErrorMessage {
                    correlation_id: message.correlation_id,
                    status: Status::ParseRequest as i32,
                    description: "failed to decode svrkit body".into(),
                });
            }
        };

        ParseOutcome::Decoded(DecodedMessage {
            correlation_id: message.correlation_id,
            is_stream: false,
            method_full_name: Some(desc.full_name.clone()),
            status: svrkit_status_to_framework(header.status),
            payload: Payload::Decoded(decoded),
            attachment: None,
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
        let body_bytes = flatten_slow(&body_builder.destructive_get(), usize::MAX);

        let cmd_id = (message.correlation_id >> 16) as u16;
        let uin = (message.correlation_id & 0xFFFF) as u32;
        let mut dirty_flags = [0u8; 4];
        set_flag(&mut dirty_flags, FLAG_RESPONSE_COMPRESSED, controller.compression_algorithm.is_some());
        set_flag(&mut dirty_flags, FLAG_RESPONSE_COMPRESSION_ALLOWED, true);

        let header = Header {
            magic: MAGIC,
            version: 0,
            head_len: HEADER_LEN as u8,
            body_len: body_bytes.len() as u32,
            cmd_id,
            checksum: 0,
            xff: 0,
            dirty_flags,
            uin,
            status: framework_status_to_svrkit(message.status),
            always_one: 1,
            reserved: 0,
            segs_present: 0,
            verbose_log: 0,
        };
        let header_bytes = header.to_bytes();
        let total_size = HEADER_LEN + body_bytes.len();

        buffer.append_slice(&(total_size as u32).to_be_bytes());
        buffer.append_slice(&header_bytes);
        buffer.append_slice(&body_bytes);
    }

    fn write_early_error(&self, message: &EarlyErrorMessage, buffer: &mut NoncontiguousBufferBuilder) {
        let header = Header {
            magic: MAGIC,
            version: 0,
            head_len: HEADER_LEN as u8,
            body_len: 0,
            cmd_id: (message.correlation_id >> 16) as u16,
            checksum: 0,
            xff: 0,
            dirty_flags: [0; 4],
            uin: (message.correlation_id & 0xFFFF) as u32,
            status: framework_status_to_svrkit(message.status),
            always_one: 1,
            reserved: 0,
            segs_present: 0,
            verbose_log: 0,
        };
        buffer.append_slice(&(HEADER_LEN as u32).to_be_bytes());
        buffer.append_slice(&header.to_bytes());
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
            service_full_name: "svrkit".into(),
            method_name: "Echo".into(),
            is_stream: false,
            decode_request: Box::new(|b| Ok(Box::new(b.to_vec()))),
            encode_response: Box::new(|a| a.downcast_ref::<Vec<u8>>().unwrap().clone()),
        });
        locator.register_method::<SvrkitTag>(desc, (MAGIC, 7));
        locator
    }

    #[test]
    fn unknown_cmd_id_is_protocol_mismatch() {
        let driver = SvrkitDriver::new(Arc::new(MethodLocator::new()));
        let header = Header {
            magic: MAGIC,
            version: 0,
            head_len: HEADER_LEN as u8,
            body_len: 0,
            cmd_id: 999,
            checksum: 0,
            xff: 0,
            dirty_flags: [0; 4],
            uin: 1,
            status: 0,
            always_one: 1,
            reserved: 0,
            segs_present: 0,
            verbose_log: 0,
        };
        let mut builder = NoncontiguousBufferBuilder::new();
        builder.append_slice(&(HEADER_LEN as u32).to_be_bytes());
        builder.append_slice(&header.to_bytes());
        let mut wire = builder.destructive_get();
        let (status, _) = driver.try_cut_message(&mut wire);
        assert_eq!(status, MessageCutStatus::ProtocolMismatch);
    }

    #[test]
    fn status_round_trip_s3() {
        let user_status = STATUS_RESERVED_MAX + 17;
        let wire_code = framework_status_to_svrkit(user_status);
        assert_eq!(wire_code, USER_STATUS_BASE + 17);
        assert_eq!(svrkit_status_to_framework(wire_code), user_status);
    }

    #[test]
    fn checksum_round_trips() {
        let header = Header {
            magic: MAGIC,
            version: 1,
            head_len: HEADER_LEN as u8,
            body_len: 12,
            cmd_id: 7,
            checksum: 0,
            xff: 0,
            dirty_flags: [0; 4],
            uin: 42,
            status: 0,
            always_one: 1,
            reserved: 0,
            segs_present: 0,
            verbose_log: 0,
        };
        let bytes = header.to_bytes();
        assert!(checksum_valid(&bytes));
    }
}
