//! Scatter-list zero-copy buffer.
//!
//! [`NoncontiguousBuffer`] is the defining primitive the rest of this crate is
//! built around: an ordered list of immutable, reference-counted
//! [`PolymorphicBuffer`] slices. Cutting, skipping and appending never copy
//! bytes (aside from the builder's small-payload fast path) - they just move
//! `Arc` handles around.
//!
//! Ported from `flare/base/buffer.h` (Tencent flare). The C++ original uses an
//! intrusive singly-linked list to avoid an allocation per node; here we use a
//! `VecDeque`, which gives the same O(1) amortized push/pop characteristics
//! without unsafe intrusive pointers.

use std::collections::VecDeque;
use std::sync::Arc;

/// Blocks smaller than this are copied into the builder's current block
/// rather than spliced in by reference, to keep fragmentation down.
const APPEND_VIA_COPY_THRESHOLD: usize = 128;

/// Default capacity of a pooled builtin block.
const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Maximum size `NoncontiguousBufferBuilder::reserve` will hand out.
const MAX_RESERVE_SIZE: usize = 1024;

/// A pooled, fixed-capacity byte array owned by a [`Block::Builtin`].
///
/// While a builder holds the only `Arc` to one of these, it can mutate it via
/// `Arc::get_mut`; once the block is sealed into a `NoncontiguousBuffer` it is
/// shared and therefore immutable.
struct BuiltinBlock {
    data: Box<[u8]>,
}

impl BuiltinBlock {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Backing storage for a [`Block::Foreign`] block: some caller-supplied
/// owning container (`Vec<u8>`, `String`, `bytes::Bytes`, ...) whose
/// destruction frees the referenced bytes.
pub trait ForeignStorage: Send + Sync + 'static {
    fn as_bytes(&self) -> &[u8];
}

impl ForeignStorage for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

impl ForeignStorage for String {
    fn as_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ForeignStorage for bytes::Bytes {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

impl ForeignStorage for Box<[u8]> {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

/// Backing storage for a [`Block::Referencing`] block: a non-owning view over
/// memory the caller guarantees stays valid (and unmutated) until the block is
/// dropped, with an optional completion callback run on drop.
struct ReferencingBlock {
    ptr: *const u8,
    len: usize,
    on_release: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

// SAFETY: callers of `make_referencing_buffer` guarantee `ptr..ptr+len` is
// valid for the block's lifetime and is not mutated concurrently.
unsafe impl Send for ReferencingBlock {}
unsafe impl Sync for ReferencingBlock {}

impl Drop for ReferencingBlock {
    fn drop(&mut self) {
        if let Some(cb) = self.on_release.lock().take() {
            cb();
        }
    }
}

/// One of the three ownership models a [`PolymorphicBuffer`] can point into.
#[derive(Clone)]
enum Block {
    Builtin(Arc<BuiltinBlock>),
    Foreign(Arc<dyn ForeignStorage>),
    Referencing(Arc<ReferencingBlock>),
}

impl Block {
    fn as_slice(&self) -> &[u8] {
        match self {
            Block::Builtin(b) => &b.data,
            Block::Foreign(f) => f.as_bytes(),
            // SAFETY: see `ReferencingBlock`'s invariants.
            Block::Referencing(r) => unsafe { std::slice::from_raw_parts(r.ptr, r.len) },
        }
    }
}

/// A (block, offset, size) slice into a [`Block`]. Cheap to clone (bumps a
/// reference count).
#[derive(Clone)]
pub struct PolymorphicBuffer {
    block: Block,
    offset: usize,
    size: usize,
}

impl PolymorphicBuffer {
    fn new(block: Block, offset: usize, size: usize) -> Self {
        Self { block, offset, size }
    }

    /// Bytes covered by this slice.
    pub fn data(&self) -> &[u8] {
        &self.block.as_slice()[self.offset..self.offset + self.size]
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Advances `offset` and shrinks `size` by `n`, without touching the
    /// underlying block.
    pub fn skip(&mut self, n: usize) {
        debug_assert!(n <= self.size);
        self.offset += n;
        self.size -= n;
    }

    /// Shrinks `size` to `n`, keeping `offset` unchanged.
    pub fn set_size(&mut self, n: usize) {
        debug_assert!(n <= self.size);
        self.size = n;
    }
}

/// Make a buffer block that references memory pointed to by `ptr`.
///
/// # Safety
///
/// The caller must ensure `ptr..ptr+len` stays valid and is not mutated until
/// the resulting buffer (and every clone taken of it) is dropped. `on_release`
/// runs exactly once, when the last reference is dropped.
pub unsafe fn make_referencing_buffer<F>(ptr: *const u8, len: usize, on_release: F) -> PolymorphicBuffer
where
    F: FnOnce() + Send + 'static,
{
    let block = Block::Referencing(Arc::new(ReferencingBlock {
        ptr,
        len,
        on_release: parking_lot::Mutex::new(Some(Box::new(on_release))),
    }));
    PolymorphicBuffer::new(block, 0, len)
}

/// Create a buffer block that takes ownership of `storage`.
pub fn make_foreign_buffer<T: ForeignStorage>(storage: T) -> PolymorphicBuffer {
    let arc: Arc<dyn ForeignStorage> = Arc::new(storage);
    let len = arc.as_bytes().len();
    PolymorphicBuffer::new(Block::Foreign(arc), 0, len)
}

/// An ordered list of non-empty [`PolymorphicBuffer`]s plus a cached total
/// byte size.
///
/// Invariants: `byte_size() == sum(member sizes)`; the list is empty iff
/// `byte_size() == 0`; every member is non-empty.
#[derive(Clone, Default)]
pub struct NoncontiguousBuffer {
    blocks: VecDeque<PolymorphicBuffer>,
    byte_size: usize,
}

impl NoncontiguousBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn is_empty(&self) -> bool {
        self.byte_size == 0
    }

    /// Returns the first block's bytes.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is empty.
    pub fn first_contiguous(&self) -> &[u8] {
        self.blocks.front().expect("first_contiguous on empty buffer").data()
    }

    /// Drops the first `n` bytes.
    ///
    /// `n` may be larger than `first_contiguous().len()`, in which case
    /// whole blocks are popped.
    pub fn skip(&mut self, n: usize) {
        debug_assert!(n <= self.byte_size);
        if n == 0 {
            return;
        }
        let front_size = self.blocks.front().map(|b| b.size()).unwrap_or(0);
        if n < front_size {
            self.blocks.front_mut().unwrap().skip(n);
            self.byte_size -= n;
            return;
        }
        let mut left = n;
        while left > 0 && left >= self.blocks.front().map(|b| b.size()).unwrap_or(0) {
            let front = self.blocks.pop_front().expect("skip() exceeds byte_size");
            left -= front.size();
        }
        if left > 0 {
            self.blocks.front_mut().unwrap().skip(left);
        }
        self.byte_size -= n;
    }

    /// Removes and returns the first `n` bytes.
    pub fn cut(&mut self, n: usize) -> NoncontiguousBuffer {
        debug_assert!(n <= self.byte_size);
        let mut out = NoncontiguousBuffer::new();
        if n == 0 {
            return out;
        }

        let mut left = n;
        while left > 0 && left >= self.blocks.front().map(|b| b.size()).unwrap_or(0) {
            let front = self.blocks.pop_front().expect("cut() exceeds byte_size");
            left -= front.size();
            out.blocks.push_back(front);
        }
        if left > 0 {
            let front = self.blocks.front_mut().unwrap();
            let mut shared = front.clone();
            shared.set_size(left);
            front.skip(left);
            out.blocks.push_back(shared);
        }
        out.byte_size = n;
        self.byte_size -= n;
        out
    }

    /// Appends a single slice, ignoring it if empty.
    pub fn append(&mut self, buffer: PolymorphicBuffer) {
        if buffer.is_empty() {
            return;
        }
        self.byte_size += buffer.size();
        self.blocks.push_back(buffer);
    }

    /// Splices `other`'s blocks onto the tail in O(1).
    pub fn append_buffer(&mut self, mut other: NoncontiguousBuffer) {
        self.byte_size += other.byte_size;
        other.byte_size = 0;
        self.blocks.append(&mut other.blocks);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolymorphicBuffer> {
        self.blocks.iter()
    }
}

impl std::iter::Extend<PolymorphicBuffer> for NoncontiguousBuffer {
    fn extend<I: IntoIterator<Item = PolymorphicBuffer>>(&mut self, iter: I) {
        for b in iter {
            self.append(b);
        }
    }
}

/// Builds a [`NoncontiguousBuffer`] incrementally, batching small writes into
/// pooled blocks to avoid fragmentation.
pub struct NoncontiguousBufferBuilder {
    nb: NoncontiguousBuffer,
    used: usize,
    current: Arc<BuiltinBlock>,
    block_size: usize,
}

impl Default for NoncontiguousBufferBuilder {
    fn default() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }
}

impl NoncontiguousBufferBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build with a custom block size. Mostly useful for exercising the
    /// allocate-new-block path in tests with small inputs.
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            nb: NoncontiguousBuffer::new(),
            used: 0,
            current: Arc::new(BuiltinBlock::with_capacity(block_size.max(1))),
            block_size: block_size.max(1),
        }
    }

    fn current_mut(&mut self) -> &mut BuiltinBlock {
        Arc::get_mut(&mut self.current).expect("builder holds the sole reference to its current block")
    }

    /// The writable window at the end of the current block. Flushes and
    /// allocates a fresh block first if the current one is already full, so
    /// this always returns a non-empty slice. This is the primitive the
    /// compression sink (`compression::BuilderSink`) is built on.
    pub fn writable(&mut self) -> &mut [u8] {
        if self.size_available() == 0 {
            self.flush_current_block();
        }
        let used = self.used;
        &mut self.current_mut().data[used..]
    }

    pub fn size_available(&self) -> usize {
        self.current.capacity() - self.used
    }

    /// Marks `n` bytes (already written into `writable()`) as consumed,
    /// flushing and replacing the current block if it's now full.
    pub fn mark_written(&mut self, n: usize) {
        debug_assert!(n <= self.size_available());
        self.used += n;
        if self.size_available() == 0 {
            self.flush_current_block();
        }
    }

    fn flush_current_block(&mut self) {
        if self.used == 0 {
            return;
        }
        let block = std::mem::replace(&mut self.current, Arc::new(BuiltinBlock::with_capacity(self.block_size)));
        self.nb.append(PolymorphicBuffer::new(Block::Builtin(block), 0, self.used));
        self.used = 0;
    }

    /// Reserves a contiguous window of `bytes` (<= 1024) for deferred
    /// overwrite, returning a pointer to its start. The bytes are immediately
    /// marked written.
    pub fn reserve(&mut self, bytes: usize) -> &mut [u8] {
        assert!(bytes <= MAX_RESERVE_SIZE, "at most {MAX_RESERVE_SIZE} bytes may be reserved at once");
        if self.size_available() < bytes {
            self.flush_current_block();
            if self.current.capacity() < bytes {
                self.current = Arc::new(BuiltinBlock::with_capacity(bytes));
            }
        }
        self.mark_written(bytes);
        let used = self.used;
        &mut self.current_mut().data[used - bytes..used]
    }

    /// Total number of bytes written so far.
    pub fn byte_size(&self) -> usize {
        self.nb.byte_size() + self.used
    }

    /// Appends raw bytes, copying into the current block (allocating a new
    /// one if it doesn't fit).
    pub fn append_slice(&mut self, data: &[u8]) {
        if data.len() <= self.size_available() {
            let used = self.used;
            self.current_mut().data[used..used + data.len()].copy_from_slice(data);
            self.mark_written(data.len());
            return;
        }
        self.append_slice_slow(data);
    }

    fn append_slice_slow(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let avail = self.size_available();
            if avail == 0 {
                self.flush_current_block();
                continue;
            }
            let take = avail.min(data.len());
            let used = self.used;
            self.current_mut().data[used..used + take].copy_from_slice(&data[..take]);
            self.mark_written(take);
            data = &data[take..];
        }
    }

    /// Appends a single byte.
    pub fn append_byte(&mut self, b: u8) {
        self.append_slice(&[b]);
    }

    /// Appends `buffer`, copying small payloads and splicing by reference
    /// otherwise.
    pub fn append_buffer(&mut self, buffer: PolymorphicBuffer) {
        if buffer.size() < APPEND_VIA_COPY_THRESHOLD && buffer.size() <= self.size_available() {
            self.append_slice(buffer.data());
            return;
        }
        self.flush_current_block();
        self.nb.append(buffer);
    }

    /// Appends a whole [`NoncontiguousBuffer`], copying it if small enough to
    /// fit in the current block, splicing by reference otherwise.
    pub fn append_noncontiguous(&mut self, buffer: NoncontiguousBuffer) {
        if buffer.byte_size() < APPEND_VIA_COPY_THRESHOLD && buffer.byte_size() <= self.size_available() {
            for block in buffer.iter() {
                self.append_slice(block.data());
            }
            return;
        }
        self.flush_current_block();
        self.nb.append_buffer(buffer);
    }

    /// Flushes the current block and returns the accumulated buffer. The
    /// builder must not be used afterwards.
    pub fn destructive_get(mut self) -> NoncontiguousBuffer {
        self.flush_current_block();
        std::mem::take(&mut self.nb)
    }
}

/// Builds a buffer containing a copy of `s`.
pub fn create_buffer(s: &[u8]) -> NoncontiguousBuffer {
    let mut builder = NoncontiguousBufferBuilder::new();
    builder.append_slice(s);
    builder.destructive_get()
}

/// Copies all blocks of `nb` (up to `max_bytes`) into one contiguous `Vec`.
pub fn flatten_slow(nb: &NoncontiguousBuffer, max_bytes: usize) -> Vec<u8> {
    let total = nb.byte_size().min(max_bytes);
    let mut out = Vec::with_capacity(total);
    for block in nb.iter() {
        if out.len() >= total {
            break;
        }
        let remaining = total - out.len();
        let take = block.size().min(remaining);
        out.extend_from_slice(&block.data()[..take]);
    }
    out
}

/// Returns the prefix of `nb` up to and including the first occurrence of
/// `delim`, or up to `max_bytes` if `delim` doesn't appear within that many
/// bytes.
pub fn flatten_until(nb: &NoncontiguousBuffer, delim: &[u8], max_bytes: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for block in nb.iter() {
        for &byte in block.data() {
            out.push(byte);
            if out.len() >= delim.len() && &out[out.len() - delim.len()..] == delim {
                return out;
            }
            if out.len() >= max_bytes {
                return out;
            }
        }
    }
    out
}

/// Copies exactly `dest.len()` bytes from `nb` into `dest`.
///
/// # Panics
///
/// Panics if `nb.byte_size() < dest.len()`.
pub fn flatten_to(nb: &NoncontiguousBuffer, dest: &mut [u8]) {
    assert!(nb.byte_size() >= dest.len());
    let mut written = 0;
    for block in nb.iter() {
        if written >= dest.len() {
            break;
        }
        let remaining = dest.len() - written;
        let take = block.size().min(remaining);
        dest[written..written + take].copy_from_slice(&block.data()[..take]);
        written += take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_and_reassemble() {
        let mut builder = NoncontiguousBufferBuilder::new();
        builder.append_slice(b"hello world");
        let mut nb = builder.destructive_get();
        assert_eq!(nb.byte_size(), 11);

        let a = nb.cut(5);
        assert_eq!(flatten_slow(&a, usize::MAX), b"hello");
        assert_eq!(flatten_slow(&nb, usize::MAX), b" world");
        assert_eq!(nb.byte_size(), 6);
    }

    #[test]
    fn cut_zero_is_noop() {
        let mut nb = create_buffer(b"abc");
        let cut = nb.cut(0);
        assert!(cut.is_empty());
        assert_eq!(nb.byte_size(), 3);
    }

    #[test]
    fn skip_zero_is_noop() {
        let mut nb = create_buffer(b"abc");
        nb.skip(0);
        assert_eq!(flatten_slow(&nb, usize::MAX), b"abc");
    }

    #[test]
    fn cut_across_many_small_blocks() {
        let mut builder = NoncontiguousBufferBuilder::with_block_size(2);
        for _ in 0..(1024 * 1024 / 8) {
            builder.append_slice(b"abcdefgh");
        }
        let mut nb = builder.destructive_get();
        let total = nb.byte_size();
        let a = nb.cut(total - 3);
        assert_eq!(a.byte_size() + nb.byte_size(), total);
        assert_eq!(flatten_slow(&nb, usize::MAX), b"fgh");
    }

    #[test]
    fn builder_flushes_and_reallocates() {
        let mut builder = NoncontiguousBufferBuilder::with_block_size(4);
        builder.append_slice(b"12345678");
        let nb = builder.destructive_get();
        assert_eq!(flatten_slow(&nb, usize::MAX), b"12345678");
    }

    #[test]
    fn reserve_allows_deferred_overwrite() {
        let mut builder = NoncontiguousBufferBuilder::new();
        let slot = builder.reserve(4);
        slot.copy_from_slice(b"head");
        builder.append_slice(b"-body");
        let nb = builder.destructive_get();
        assert_eq!(flatten_slow(&nb, usize::MAX), b"head-body");
    }

    #[test]
    fn append_buffer_splices_large_payload_by_reference() {
        let big = create_buffer(&vec![b'x'; 1024]);
        let mut builder = NoncontiguousBufferBuilder::new();
        builder.append_slice(b"hdr:");
        builder.append_noncontiguous(big);
        let nb = builder.destructive_get();
        assert_eq!(nb.byte_size(), 4 + 1024);
    }

    #[test]
    fn foreign_and_referencing_blocks() {
        let owned = make_foreign_buffer(b"owned bytes".to_vec());
        assert_eq!(owned.data(), b"owned bytes");

        let data: &'static [u8] = b"static data";
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let released2 = released.clone();
        let refd = unsafe { make_referencing_buffer(data.as_ptr(), data.len(), move || released2.store(true, std::sync::atomic::Ordering::SeqCst)) };
        assert_eq!(refd.data(), data);
        drop(refd);
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn flatten_until_includes_delimiter() {
        let nb = create_buffer(b"GET / HTTP/1.1\r\n\r\nbody");
        let head = flatten_until(&nb, b"\r\n\r\n", usize::MAX);
        assert_eq!(head, b"GET / HTTP/1.1\r\n\r\n");
    }
}
