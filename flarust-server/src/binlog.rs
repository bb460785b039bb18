//! Binlog capture and dry-run replay: §4.7.
//!
//! Grounded on `flare::binlog::{Dumper, DumpingCall, DumpingLog}`
//! (`dumper.h`) and `flare::binlog::{DryRunner, DryRunContext,
//! DryRunIncomingCall, DryRunOutgoingCall}` (`dry_runner.h`). Both sides are
//! meant to cost nothing when no dumper/dry-runner is configured, so
//! [`Connection`] only ever touches this module through an `Option`.
//!
//! [`Connection`]: crate::connection::Connection

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use rand::Rng;

pub type Tags = HashMap<String, String>;

/// One packet captured (dump side) or replayed (dry-run side).
#[derive(Debug, Clone)]
pub struct DumpingPacket {
    pub time_since_start: Duration,
    /// Filled by the binlog provider; opaque to the framework.
    pub provider_context: Vec<u8>,
    /// Filled by the framework; the provider keeps it around verbatim so a
    /// later dry-run can hand it back unmodified.
    pub system_context: Vec<u8>,
}

/// Sampling strategy checked once per incoming RPC, before any capture work
/// happens. The whole point is that an RPC that isn't sampled pays for
/// nothing beyond this check.
#[derive(Debug, Clone)]
pub enum SamplingStrategy {
    /// Admit at most one sample per `interval`, dropping everything else.
    MinInterval(Duration),
    /// Admit roughly 1 in `n` calls, picked independently per call.
    OneInN(u32),
}

/// Tracks sampling admission across the process. One instance is normally
/// shared by every connection via the listener's [`crate::context::ServerContext`].
pub struct SamplingQuota {
    strategy: SamplingStrategy,
    last_sampled: AtomicU64,
    epoch: Instant,
}

/// Sentinel for "no sample admitted yet": the first `acquire()` under
/// `MinInterval` must always succeed, per `AcquireSamplingQuotaForDumping`.
const NEVER_SAMPLED: u64 = u64::MAX;

impl SamplingQuota {
    pub fn new(strategy: SamplingStrategy) -> Self {
        Self { strategy, last_sampled: AtomicU64::new(NEVER_SAMPLED), epoch: Instant::now() }
    }

    /// Mirrors `AcquireSamplingQuotaForDumping`: returns whether this call
    /// should be dumped.
    pub fn acquire(&self) -> bool {
        match self.strategy {
            SamplingStrategy::OneInN(n) => {
                if n == 0 {
                    return false;
                }
                rand::rng().random_range(0..n) == 0
            }
            SamplingStrategy::MinInterval(interval) => {
                let now = self.epoch.elapsed().as_nanos() as u64;
                let prev = self.last_sampled.load(Ordering::Relaxed);
                if prev != NEVER_SAMPLED && now.saturating_sub(prev) < interval.as_nanos() as u64 {
                    return false;
                }
                self.last_sampled
                    .compare_exchange(prev, now, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            }
        }
    }
}

/// Mirrors `NewCorrelationId`: a process-random, collision-resistant-enough
/// identifier for a captured call.
pub fn new_correlation_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Lazily-evaluated fields of one incoming or outgoing call being captured.
/// Every setter is cheap; the expensive work (serializing packets, hashing
/// tags) happens inside [`Dumper::flush`], off the connection's read
/// callback.
pub struct DumpingCall {
    pub correlation_id: String,
    pub start_ts: Option<Instant>,
    pub finish_ts: Option<Instant>,
    pub system_tags: Tags,
    pub user_tags: Tags,
    pub logs: Vec<String>,
    pub system_context: Vec<u8>,
    pub incoming_packets: Vec<DumpingPacket>,
    pub outgoing_packets: Vec<DumpingPacket>,
}

impl DumpingCall {
    pub fn new(correlation_id: String) -> Self {
        Self {
            correlation_id,
            start_ts: None,
            finish_ts: None,
            system_tags: Tags::new(),
            user_tags: Tags::new(),
            logs: Vec::new(),
            system_context: Vec::new(),
            incoming_packets: Vec::new(),
            outgoing_packets: Vec::new(),
        }
    }

    /// Called on the connection's critical path: must stay cheap. Real
    /// serialization happens later in `flush()`.
    pub fn capture_incoming_packet(&mut self, time_since_start: Duration, provider_context: Vec<u8>, system_context: Vec<u8>) {
        self.incoming_packets.push(DumpingPacket { time_since_start, provider_context, system_context });
    }

    pub fn capture_outgoing_packet(&mut self, time_since_start: Duration, provider_context: Vec<u8>, system_context: Vec<u8>) {
        self.outgoing_packets.push(DumpingPacket { time_since_start, provider_context, system_context });
    }

    pub fn set_timestamps(&mut self, start: Instant, finish: Instant) {
        self.start_ts = Some(start);
        self.finish_ts = Some(finish);
    }
}

/// An entire RPC's capture: one incoming call plus zero or more outgoing
/// calls made while handling it.
pub struct DumpingLog {
    pub incoming: DumpingCall,
    pub outgoing: Vec<DumpingCall>,
    aborted: bool,
}

impl DumpingLog {
    pub fn new(correlation_id: String) -> Self {
        Self { incoming: DumpingCall::new(correlation_id), outgoing: Vec::new(), aborted: false }
    }

    /// Mirrors `DumpingLog::StartOutgoingCall`. The outgoing call's
    /// correlation ID is derived from the caller's correlation ID, the
    /// target method, the channel URL and a per-call nonce, all hashed
    /// together so it's stable for dry-run lookups but doesn't leak the
    /// inputs.
    pub fn start_outgoing_call(&mut self, method_full_name: &str, channel_url: &str) -> &mut DumpingCall {
        let nonce: u64 = rand::rng().random();
        let derived = derive_outgoing_correlation_id(&self.incoming.correlation_id, method_full_name, channel_url, nonce);
        self.outgoing.push(DumpingCall::new(derived));
        self.outgoing.last_mut().unwrap()
    }

    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

fn derive_outgoing_correlation_id(caller_correlation_id: &str, method_full_name: &str, channel_url: &str, nonce: u64) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    caller_correlation_id.hash(&mut hasher);
    method_full_name.hash(&mut hasher);
    channel_url.hash(&mut hasher);
    nonce.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Sink a fully-populated [`DumpingLog`] is handed to once the RPC
/// completes. Implementations persist it however they like (file, network
/// log service, ...); `flush` is always called off the connection's
/// critical path.
pub trait Dumper: Send + Sync {
    fn flush(&self, log: DumpingLog);
}

/// A `Dumper` that discards everything; the default when no binlog sink is
/// configured, so the "pay nothing when disabled" requirement holds without
/// special-casing call sites.
pub struct NullDumper;

impl Dumper for NullDumper {
    fn flush(&self, _log: DumpingLog) {}
}

/// A `Dumper` that keeps everything it's handed in memory, for tests and
/// for feeding a [`DryRunner`] end to end without a real storage backend.
#[derive(Default)]
pub struct InMemoryDumper {
    logs: StdMutex<Vec<DumpingLog>>,
}

impl InMemoryDumper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_logs(&self) -> Vec<DumpingLog> {
        std::mem::take(&mut *self.logs.lock().unwrap())
    }
}

impl Dumper for InMemoryDumper {
    fn flush(&self, log: DumpingLog) {
        self.logs.lock().unwrap().push(log);
    }
}

// --- Dry-run replay -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DryRunStatus {
    Eof,
    NotFound,
    InternalError,
}

#[derive(Debug, Clone)]
pub struct DryRunPacket {
    pub time_since_start: Duration,
    pub provider_context: Vec<u8>,
    pub system_context: Vec<u8>,
}

impl From<DumpingPacket> for DryRunPacket {
    fn from(p: DumpingPacket) -> Self {
        Self { time_since_start: p.time_since_start, provider_context: p.provider_context, system_context: p.system_context }
    }
}

/// Replay side of a captured incoming call: the request generator feeds the
/// framework the packets it recorded, and the framework parses/dispatches
/// them as if they'd just arrived off a real socket.
pub struct DryRunIncomingCall {
    pub correlation_id: String,
    pub system_tags: Tags,
    pub user_tags: Tags,
    pub system_context: Vec<u8>,
    pub incoming_packets: Vec<DryRunPacket>,
    captured_outgoing: StdMutex<Vec<DryRunPacket>>,
}

impl DryRunIncomingCall {
    pub fn capture_outgoing_packet(&self, packet: DryRunPacket) {
        self.captured_outgoing.lock().unwrap().push(packet);
    }
}

/// Replay side of one outgoing call made while handling the incoming one.
/// `try_get_incoming_packet` is the latency-emulation hook: the returned
/// future resolves only once `pkt[i].time_since_start` has elapsed relative
/// to `stream_start`, mirroring the original RPC's pacing.
pub struct DryRunOutgoingCall {
    pub correlation_id: String,
    pub system_tags: Tags,
    pub user_tags: Tags,
    pub system_context: Vec<u8>,
    incoming_packets: Vec<DryRunPacket>,
    stream_start: Instant,
    captured_outgoing: StdMutex<Vec<DryRunPacket>>,
}

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

impl DryRunOutgoingCall {
    pub fn new(correlation_id: String, incoming_packets: Vec<DryRunPacket>, stream_start: Instant) -> Self {
        Self { correlation_id, system_tags: Tags::new(), user_tags: Tags::new(), system_context: Vec::new(), incoming_packets, stream_start, captured_outgoing: StdMutex::new(Vec::new()) }
    }

    pub fn capture_outgoing_packet(&self, packet: DryRunPacket) {
        self.captured_outgoing.lock().unwrap().push(packet);
    }

    /// Delays until `pkt[index].time_since_start - (now - stream_start)`,
    /// clipped to zero, then yields the packet. Errors with `Eof` past the
    /// end of the recorded stream.
    pub fn try_get_incoming_packet(&self, index: usize) -> BoxFuture<Result<DryRunPacket, DryRunStatus>> {
        let Some(pkt) = self.incoming_packets.get(index).cloned() else {
            return Box::pin(async { Err(DryRunStatus::Eof) });
        };
        let stream_start = self.stream_start;
        Box::pin(async move {
            let target = stream_start + pkt.time_since_start;
            let now = Instant::now();
            if target > now {
                tokio::time::sleep(target - now).await;
            }
            Ok(pkt)
        })
    }
}

/// One dry-run session: the incoming call being replayed plus every
/// outgoing call it's allowed to look up by correlation ID.
pub struct DryRunContext {
    pub incoming: DryRunIncomingCall,
    outgoing: HashMap<String, DryRunOutgoingCall>,
    invocation_status: StdMutex<Option<String>>,
}

impl DryRunContext {
    pub fn new(incoming: DryRunIncomingCall, outgoing: HashMap<String, DryRunOutgoingCall>) -> Self {
        Self { incoming, outgoing, invocation_status: StdMutex::new(None) }
    }

    pub fn try_get_outgoing_call(&self, correlation_id: &str) -> Result<&DryRunOutgoingCall, DryRunStatus> {
        self.outgoing.get(correlation_id).ok_or(DryRunStatus::NotFound)
    }

    pub fn set_invocation_status(&self, status: String) {
        *self.invocation_status.lock().unwrap() = Some(status);
    }

    pub fn invocation_status(&self) -> Option<String> {
        self.invocation_status.lock().unwrap().clone()
    }

    /// Serializes the dry-run result for the request generator. Real report
    /// formats are provider-defined; this default emits the recorded
    /// invocation status as the whole report, which is enough for
    /// round-tripping through tests.
    pub fn write_report(&self) -> Vec<u8> {
        self.invocation_status().unwrap_or_default().into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteStreamParseStatus {
    Success,
    NeedMore,
    Error,
}

/// Extracts `DryRunContext`s from a persisted binlog byte stream so the
/// connection state machine can replay them without any real network I/O:
/// §4.6's "dry-run variant".
pub trait DryRunner: Send + Sync {
    fn parse_byte_stream(&self, buffer: &mut flarust_core::buffer::NoncontiguousBuffer) -> (ByteStreamParseStatus, Option<DryRunContext>);
}

/// A `DryRunner` backed by whatever an [`InMemoryDumper`] captured, keyed by
/// incoming correlation ID. Consumes the whole buffer's bytes as one opaque
/// lookup key per context rather than parsing a real wire format, since the
/// wire format a real deployment would use is storage-specific.
pub struct InMemoryDryRunner {
    logs: HashMap<String, DumpingLog>,
}

impl InMemoryDryRunner {
    pub fn from_logs(logs: Vec<DumpingLog>) -> Self {
        Self { logs: logs.into_iter().map(|l| (l.incoming.correlation_id.clone(), l)).collect() }
    }
}

impl DryRunner for InMemoryDryRunner {
    fn parse_byte_stream(&self, buffer: &mut flarust_core::buffer::NoncontiguousBuffer) -> (ByteStreamParseStatus, Option<DryRunContext>) {
        if buffer.is_empty() {
            return (ByteStreamParseStatus::NeedMore, None);
        }
        let key_bytes = flarust_core::buffer::flatten_slow(buffer, buffer.byte_size());
        let key = match String::from_utf8(key_bytes) {
            Ok(k) => k,
            Err(_) => return (ByteStreamParseStatus::Error, None),
        };
        buffer.skip(buffer.byte_size());

        let Some(log) = self.logs.get(&key) else {
            return (ByteStreamParseStatus::Error, None);
        };

        let stream_start = Instant::now();
        let incoming = DryRunIncomingCall {
            correlation_id: log.incoming.correlation_id.clone(),
            system_tags: log.incoming.system_tags.clone(),
            user_tags: log.incoming.user_tags.clone(),
            system_context: log.incoming.system_context.clone(),
            incoming_packets: log.incoming.incoming_packets.iter().cloned().map(Into::into).collect(),
            captured_outgoing: StdMutex::new(Vec::new()),
        };
        let outgoing = log
            .outgoing
            .iter()
            .map(|call| {
                let packets = call.incoming_packets.iter().cloned().map(Into::into).collect();
                (call.correlation_id.clone(), DryRunOutgoingCall::new(call.correlation_id.clone(), packets, stream_start))
            })
            .collect();

        (ByteStreamParseStatus::Success, Some(DryRunContext::new(incoming, outgoing)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_interval_quota_admits_then_drops() {
        let quota = SamplingQuota::new(SamplingStrategy::MinInterval(Duration::from_secs(3600)));
        assert!(quota.acquire());
        assert!(!quota.acquire());
    }

    #[test]
    fn correlation_ids_are_distinct() {
        assert_ne!(new_correlation_id(), new_correlation_id());
    }

    #[test]
    fn outgoing_call_ids_depend_on_all_inputs() {
        let a = derive_outgoing_correlation_id("c1", "svc.Method", "url1", 1);
        let b = derive_outgoing_correlation_id("c1", "svc.Method", "url2", 1);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn dry_run_round_trips_through_in_memory_dumper() {
        let dumper = InMemoryDumper::new();
        let mut log = DumpingLog::new("abc".to_string());
        log.incoming.set_timestamps(Instant::now(), Instant::now());
        log.incoming.capture_incoming_packet(Duration::from_millis(0), vec![1, 2, 3], vec![]);
        dumper.flush(log);

        let runner = InMemoryDryRunner::from_logs(dumper.take_logs());
        let mut buffer = flarust_core::buffer::create_buffer(b"abc");
        let (status, ctx) = runner.parse_byte_stream(&mut buffer);
        assert_eq!(status, ByteStreamParseStatus::Success);
        let ctx = ctx.unwrap();
        assert_eq!(ctx.incoming.correlation_id, "abc");
        assert_eq!(ctx.incoming.incoming_packets.len(), 1);
    }

    #[tokio::test]
    async fn try_get_incoming_packet_past_end_is_eof() {
        let call = DryRunOutgoingCall::new("x".to_string(), vec![], Instant::now());
        let result = call.try_get_incoming_packet(0).await;
        assert_eq!(result.unwrap_err(), DryRunStatus::Eof);
    }
}
