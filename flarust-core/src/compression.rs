//! Compression framing: §4.2.
//!
//! A [`CompressionOutputStream`] hands a compressor or decompressor a
//! writable window of bytes (`next`) and lets it give back the unused tail
//! (`backup`) once it knows how much it actually wrote. [`BuilderSink`] is
//! the canonical implementation, built directly atop
//! [`NoncontiguousBufferBuilder`]: `next` returns the builder's current
//! contiguous write window, allocating a new block transparently when the
//! old one is exhausted; `backup` un-marks the unused tail.
//!
//! [`Compressor`]/[`Decompressor`] drive that sink for one of the four
//! algorithms named on the wire: `gzip`, `snappy`, `lz4-frame`, `zstd`. Each
//! is a thin adapter over the corresponding native codec crate - none of
//! those crates' types leak out of this module.

use std::io::{self, Read, Write};

use crate::buffer::{
    NoncontiguousBuffer, NoncontiguousBufferBuilder, flatten_slow, make_foreign_buffer,
};
use crate::error::CompressionError;

/// A write sink that hands out successive buffer windows. See module docs.
pub trait CompressionOutputStream {
    /// Returns the next writable window. Never empty.
    fn next(&mut self) -> &mut [u8];

    /// Gives back the last `count` bytes of the window most recently
    /// returned by `next` - i.e. only `window.len() - count` of it was
    /// actually used.
    fn backup(&mut self, count: usize);
}

/// The canonical [`CompressionOutputStream`], backed by a
/// [`NoncontiguousBufferBuilder`].
pub struct BuilderSink<'a> {
    builder: &'a mut NoncontiguousBufferBuilder,
    /// Length of the window handed out by the last `next()` call that
    /// hasn't been resolved by a matching `backup()` yet.
    pending: usize,
}

impl<'a> BuilderSink<'a> {
    pub fn new(builder: &'a mut NoncontiguousBufferBuilder) -> Self {
        Self { builder, pending: 0 }
    }

    /// Splices `data` onto the buffer by reference in one shot, bypassing
    /// the window protocol entirely. Used by the snappy one-shot path,
    /// which already holds a fully-compressed `Vec<u8>` and has no reason
    /// to copy it through small windows.
    fn append_owned(&mut self, data: Vec<u8>) {
        self.resolve_pending();
        self.builder.append_buffer(make_foreign_buffer(data));
    }

    fn resolve_pending(&mut self) {
        if self.pending != 0 {
            self.builder.mark_written(self.pending);
            self.pending = 0;
        }
    }
}

impl CompressionOutputStream for BuilderSink<'_> {
    fn next(&mut self) -> &mut [u8] {
        self.resolve_pending();
        let w = self.builder.writable();
        self.pending = w.len();
        w
    }

    fn backup(&mut self, count: usize) {
        debug_assert!(count <= self.pending);
        self.builder.mark_written(self.pending - count);
        self.pending = 0;
    }
}

/// Adapts a [`CompressionOutputStream`] to `std::io::Write`, so streaming
/// codecs that are written against `Write` (flate2, lz4_flex) can drive it
/// without knowing about the window protocol.
struct SinkWriter<'a>(&'a mut dyn CompressionOutputStream);

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let w = self.0.next();
        let take = w.len().min(buf.len());
        w[..take].copy_from_slice(&buf[..take]);
        if take < w.len() {
            self.0.backup(w.len() - take);
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Copies `src` into successive sink windows, calling `backup` on the final
/// short window. Used directly by algorithms that produce their whole
/// output up front (snappy) and as the plumbing underneath `SinkWriter`.
pub fn copy_to_compression_output_stream(sink: &mut dyn CompressionOutputStream, mut src: &[u8]) {
    while !src.is_empty() {
        let w = sink.next();
        let take = w.len().min(src.len());
        w[..take].copy_from_slice(&src[..take]);
        if take < w.len() {
            sink.backup(w.len() - take);
        }
        src = &src[take..];
    }
}

/// A streaming compressor for one algorithm, driving a
/// [`CompressionOutputStream`].
pub trait Compressor {
    fn compress(&mut self, input: &[u8], sink: &mut dyn CompressionOutputStream) -> Result<(), CompressionError>;
}

/// A streaming decompressor for one algorithm, driving a
/// [`CompressionOutputStream`].
pub trait Decompressor {
    fn decompress(&mut self, input: &[u8], sink: &mut dyn CompressionOutputStream) -> Result<(), CompressionError>;
}

/// Pulls bytes from `reader` into `sink` until EOF. Shared by every
/// Read-based decompressor (gzip, lz4-frame).
fn pump_reader(mut reader: impl Read, sink: &mut dyn CompressionOutputStream) -> Result<(), CompressionError> {
    loop {
        let w = sink.next();
        let n = reader.read(w)?;
        if n < w.len() {
            sink.backup(w.len() - n);
        }
        if n == 0 {
            return Ok(());
        }
    }
}

// ---------------------------------------------------------------- gzip ----

#[cfg(feature = "compression-gzip")]
pub struct GzipCompressor {
    level: flate2::Compression,
}

#[cfg(feature = "compression-gzip")]
impl GzipCompressor {
    pub fn new() -> Self {
        Self { level: flate2::Compression::default() }
    }
}

#[cfg(feature = "compression-gzip")]
impl Compressor for GzipCompressor {
    fn compress(&mut self, input: &[u8], sink: &mut dyn CompressionOutputStream) -> Result<(), CompressionError> {
        let writer = SinkWriter(sink);
        let mut encoder = flate2::write::GzEncoder::new(writer, self.level);
        encoder.write_all(input)?;
        encoder.finish()?;
        Ok(())
    }
}

#[cfg(feature = "compression-gzip")]
#[derive(Default)]
pub struct GzipDecompressor;

#[cfg(feature = "compression-gzip")]
impl Decompressor for GzipDecompressor {
    fn decompress(&mut self, input: &[u8], sink: &mut dyn CompressionOutputStream) -> Result<(), CompressionError> {
        pump_reader(flate2::read::GzDecoder::new(input), sink)
    }
}

// -------------------------------------------------------------- snappy ----

/// One-shot: snappy has no useful streaming mode for single RPC payloads,
/// so the whole input is compressed/decompressed up front and the result
/// spliced onto the buffer as a single reference (see
/// [`BuilderSink::append_owned`]).
#[cfg(feature = "compression-snappy")]
#[derive(Default)]
pub struct SnappyCompressor;

#[cfg(feature = "compression-snappy")]
impl SnappyCompressor {
    /// Compresses directly into a builder, taking the one-append fast path.
    /// Bypasses the generic `Compressor` trait because that trait only
    /// knows about the windowed sink.
    pub fn compress_into(&mut self, input: &[u8], builder: &mut NoncontiguousBufferBuilder) -> Result<(), CompressionError> {
        let compressed = snap::raw::Encoder::new().compress_vec(input)?;
        BuilderSink::new(builder).append_owned(compressed);
        Ok(())
    }
}

#[cfg(feature = "compression-snappy")]
#[derive(Default)]
pub struct SnappyDecompressor;

#[cfg(feature = "compression-snappy")]
impl SnappyDecompressor {
    pub fn decompress_into(&mut self, input: &[u8], builder: &mut NoncontiguousBufferBuilder) -> Result<(), CompressionError> {
        let decompressed = snap::raw::Decoder::new().decompress_vec(input)?;
        BuilderSink::new(builder).append_owned(decompressed);
        Ok(())
    }
}

// ------------------------------------------------------------ lz4-frame ---

#[cfg(feature = "compression-lz4")]
#[derive(Default)]
pub struct Lz4FrameCompressor;

#[cfg(feature = "compression-lz4")]
impl Compressor for Lz4FrameCompressor {
    fn compress(&mut self, input: &[u8], sink: &mut dyn CompressionOutputStream) -> Result<(), CompressionError> {
        let writer = SinkWriter(sink);
        let mut encoder = lz4_flex::frame::FrameEncoder::new(writer);
        encoder.write_all(input)?;
        encoder
            .finish()
            .map_err(|e| CompressionError::Malformed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(feature = "compression-lz4")]
#[derive(Default)]
pub struct Lz4FrameDecompressor;

#[cfg(feature = "compression-lz4")]
impl Decompressor for Lz4FrameDecompressor {
    fn decompress(&mut self, input: &[u8], sink: &mut dyn CompressionOutputStream) -> Result<(), CompressionError> {
        pump_reader(lz4_flex::frame::FrameDecoder::new(input), sink)
    }
}

// ----------------------------------------------------------------- zstd ---

/// Drives the raw streaming `zstd` operation API directly (rather than the
/// `Read`/`Write`-based high-level wrappers), per §4.2: loop `run` with
/// `CONTINUE` until the source is exhausted, then loop with `END` until it
/// reports nothing left to flush. A fresh context is created per call, which
/// is the "reset session on each call" the spec calls for.
#[cfg(feature = "compression-zstd")]
pub struct ZstdCompressor {
    level: i32,
}

#[cfg(feature = "compression-zstd")]
impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

#[cfg(feature = "compression-zstd")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(feature = "compression-zstd")]
impl Compressor for ZstdCompressor {
    fn compress(&mut self, input: &[u8], sink: &mut dyn CompressionOutputStream) -> Result<(), CompressionError> {
        use zstd::stream::raw::{Encoder as RawEncoder, InBuffer, Operation, OutBuffer};

        let mut op = RawEncoder::new(self.level)?;
        let total_len = input.len();
        let mut in_buf = InBuffer::around(input);

        while in_buf.pos() < total_len {
            let w = sink.next();
            let mut out_buf = OutBuffer::around(w);
            op.run(&mut in_buf, &mut out_buf)?;
            let written = out_buf.pos();
            if written < w.len() {
                sink.backup(w.len() - written);
            }
        }

        loop {
            let w = sink.next();
            let mut out_buf = OutBuffer::around(w);
            let remaining = op.finish(&mut out_buf, true)?;
            let written = out_buf.pos();
            if written < w.len() {
                sink.backup(w.len() - written);
            }
            if remaining == 0 {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "compression-zstd")]
#[derive(Default)]
pub struct ZstdDecompressor;

#[cfg(feature = "compression-zstd")]
impl Decompressor for ZstdDecompressor {
    fn decompress(&mut self, input: &[u8], sink: &mut dyn CompressionOutputStream) -> Result<(), CompressionError> {
        use zstd::stream::raw::{Decoder as RawDecoder, InBuffer, Operation, OutBuffer};

        let mut op = RawDecoder::new()?;
        let total_len = input.len();
        let mut in_buf = InBuffer::around(input);

        loop {
            let w = sink.next();
            let mut out_buf = OutBuffer::around(w);
            let hint = op.run(&mut in_buf, &mut out_buf)?;
            let written = out_buf.pos();
            if written < w.len() {
                sink.backup(w.len() - written);
            }
            // Non-progressing flush: the decoder reported more work to do
            // (`hint != 0`) but produced nothing and consumed no more
            // input. Left unchecked this spins forever on malformed input.
            if written == 0 && hint != 0 && in_buf.pos() == total_len {
                return Err(CompressionError::Malformed(
                    "zstd decoder made no progress on a non-empty hint".into(),
                ));
            }
            if hint == 0 {
                break;
            }
        }
        Ok(())
    }
}

// -------------------------------------------------------------- dispatch --

/// One of the four algorithm names selectable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Gzip,
    Snappy,
    Lz4Frame,
    Zstd,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Gzip => "gzip",
            Algorithm::Snappy => "snappy",
            Algorithm::Lz4Frame => "lz4-frame",
            Algorithm::Zstd => "zstd",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CompressionError> {
        match s {
            "gzip" => Ok(Algorithm::Gzip),
            "snappy" => Ok(Algorithm::Snappy),
            "lz4-frame" => Ok(Algorithm::Lz4Frame),
            "zstd" => Ok(Algorithm::Zstd),
            other => Err(CompressionError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Compresses `input` with `algo`, appending the result to `builder`.
pub fn compress(algo: Algorithm, input: &[u8], builder: &mut NoncontiguousBufferBuilder) -> Result<(), CompressionError> {
    match algo {
        #[cfg(feature = "compression-snappy")]
        Algorithm::Snappy => SnappyCompressor::default().compress_into(input, builder),
        #[cfg(feature = "compression-gzip")]
        Algorithm::Gzip => GzipCompressor::new().compress(input, &mut BuilderSink::new(builder)),
        #[cfg(feature = "compression-lz4")]
        Algorithm::Lz4Frame => Lz4FrameCompressor.compress(input, &mut BuilderSink::new(builder)),
        #[cfg(feature = "compression-zstd")]
        Algorithm::Zstd => ZstdCompressor::default().compress(input, &mut BuilderSink::new(builder)),
        #[allow(unreachable_patterns)]
        other => Err(CompressionError::UnknownAlgorithm(other.as_str().into())),
    }
}

/// Decompresses `input` (flattened once into a contiguous scratch buffer)
/// with `algo`, returning a freshly-built [`NoncontiguousBuffer`].
pub fn decompress(algo: Algorithm, input: &NoncontiguousBuffer) -> Result<NoncontiguousBuffer, CompressionError> {
    let flat = flatten_slow(input, usize::MAX);
    let mut builder = NoncontiguousBufferBuilder::new();
    match algo {
        #[cfg(feature = "compression-snappy")]
        Algorithm::Snappy => SnappyDecompressor::default().decompress_into(&flat, &mut builder)?,
        #[cfg(feature = "compression-gzip")]
        Algorithm::Gzip => GzipDecompressor.decompress(&flat, &mut BuilderSink::new(&mut builder))?,
        #[cfg(feature = "compression-lz4")]
        Algorithm::Lz4Frame => Lz4FrameDecompressor.decompress(&flat, &mut BuilderSink::new(&mut builder))?,
        #[cfg(feature = "compression-zstd")]
        Algorithm::Zstd => ZstdDecompressor.decompress(&flat, &mut BuilderSink::new(&mut builder))?,
        #[allow(unreachable_patterns)]
        other => return Err(CompressionError::UnknownAlgorithm(other.as_str().into())),
    }
    Ok(builder.destructive_get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::create_buffer;

    fn roundtrip(algo: Algorithm, data: &[u8]) {
        let mut builder = NoncontiguousBufferBuilder::with_block_size(2);
        compress(algo, data, &mut builder).unwrap();
        let compressed = builder.destructive_get();
        let decompressed = decompress(algo, &compressed).unwrap();
        assert_eq!(flatten_slow(&decompressed, usize::MAX), data, "algo={algo:?}");
    }

    #[test]
    fn gzip_roundtrip_sizes() {
        roundtrip(Algorithm::Gzip, b"");
        roundtrip(Algorithm::Gzip, &vec![b'a'; 1024]);
    }

    #[test]
    fn snappy_roundtrip() {
        roundtrip(Algorithm::Snappy, b"the quick brown fox");
    }

    #[test]
    fn lz4_frame_roundtrip() {
        roundtrip(Algorithm::Lz4Frame, &vec![b'x'; 10 * 1024]);
    }

    #[test]
    fn zstd_roundtrip_tiny_windows() {
        // Exercises the allocate-new-block-every-2-bytes path through the
        // builder sink, per S5 in the spec.
        roundtrip(Algorithm::Zstd, &vec![b'a'; 1024 * 1024]);
    }

    #[test]
    fn zstd_rejects_garbage() {
        let nb = create_buffer(b"this buffer is likely an invalid compressed buffer.");
        assert!(decompress(Algorithm::Zstd, &nb).is_err());
    }

    #[test]
    fn gzip_rejects_garbage() {
        let nb = create_buffer(b"this buffer is likely an invalid compressed buffer.");
        assert!(decompress(Algorithm::Gzip, &nb).is_err());
    }

    #[test]
    fn lz4_frame_rejects_garbage() {
        let nb = create_buffer(b"this buffer is likely an invalid compressed buffer.");
        assert!(decompress(Algorithm::Lz4Frame, &nb).is_err());
    }

    #[test]
    fn unknown_algorithm_name() {
        assert!(Algorithm::from_str("lz4").is_err());
        assert_eq!(Algorithm::from_str("zstd").unwrap(), Algorithm::Zstd);
    }
}
