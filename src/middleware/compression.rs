//! Gzip compression and decompression stages

use std::io::{self, Write};

use flate2::write::{GzEncoder, MultiGzDecoder};
use flate2::Compression;
use tracing::warn;

use crate::config::{CodecStep, COMPRESSION_LEVEL_KEY};
use crate::error::{LantasError, Result};
use crate::middleware::chain::Constructor;
use crate::middleware::handler::{ConnHandler, HandlerContext};

const GZIP: &str = "gzip";

/// Bytes one read may decompress to, as a multiple of the read buffer size
pub const MAX_EXPANSION: usize = 64;

/// Map a configured level name onto a flate2 level.
///
/// flate2 has no Huffman-only mode, so `HuffmanOnly` gets the fastest
/// level, which is the closest match in cost.
pub fn parse_level(value: Option<&serde_yaml::Value>) -> Result<Compression> {
    let Some(value) = value else {
        return Ok(Compression::default());
    };
    let level = value
        .as_str()
        .ok_or_else(|| LantasError::InvalidMiddlewareOption {
            key: COMPRESSION_LEVEL_KEY.to_string(),
            reason: format!("expected a string, got {:?}", value),
        })?;

    Ok(match level {
        "NoCompression" => Compression::none(),
        "BestSpeed" | "HuffmanOnly" => Compression::fast(),
        "BestCompression" => Compression::best(),
        "DefaultCompression" => Compression::default(),
        other => {
            warn!(level = other, "Unknown gzip compression level, using default");
            Compression::default()
        }
    })
}

fn codec_error(err: io::Error) -> LantasError {
    LantasError::Codec {
        algorithm: GZIP,
        reason: err.to_string(),
    }
}

/// Compresses each read event into one gzip member
pub struct GzipHandler {
    level: Compression,
    next: Box<dyn ConnHandler>,
}

impl GzipHandler {
    pub fn new(level: Compression, next: Box<dyn ConnHandler>) -> Self {
        Self { level, next }
    }
}

impl ConnHandler for GzipHandler {
    fn handle(&self, ctx: &mut HandlerContext) -> Result<()> {
        {
            let (input, output) = ctx.stage_buffers()?;
            let mut encoder = GzEncoder::new(output, self.level);
            encoder.write_all(input).map_err(codec_error)?;
            encoder.finish().map_err(codec_error)?;
        }
        ctx.advance_buf_chain()?;
        self.next.handle(ctx)
    }
}

/// Collects decoded bytes for one read, refusing to grow past `limit`
struct CappedSink {
    buf: Vec<u8>,
    limit: usize,
}

impl Write for CappedSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("decompressed output of one read exceeds {} bytes", self.limit),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type StreamDecoder = MultiGzDecoder<CappedSink>;

/// Decompresses the gzip stream carried by a direction.
///
/// The decoder is parked in the context between reads, so a member may
/// span any number of reads. Only corrupt bytes, or one read expanding past
/// `MAX_EXPANSION` read buffers, are codec errors.
pub struct GunzipHandler {
    next: Box<dyn ConnHandler>,
}

impl GunzipHandler {
    pub fn new(next: Box<dyn ConnHandler>) -> Self {
        Self { next }
    }
}

impl ConnHandler for GunzipHandler {
    fn handle(&self, ctx: &mut HandlerContext) -> Result<()> {
        let mut decoder = match ctx.take_stage_state::<StreamDecoder>() {
            Some(decoder) => decoder,
            None => Box::new(MultiGzDecoder::new(CappedSink {
                buf: Vec::new(),
                limit: ctx.buffer_size().saturating_mul(MAX_EXPANSION),
            })),
        };
        {
            let (input, output) = ctx.stage_buffers()?;
            decoder.write_all(input).map_err(codec_error)?;
            decoder.flush().map_err(codec_error)?;
            let decoded = &mut decoder.get_mut().buf;
            output.extend_from_slice(decoded);
            decoded.clear();
        }
        ctx.put_stage_state(decoder);
        ctx.advance_buf_chain()?;
        self.next.handle(ctx)
    }
}

/// Builds a compression stage from a `compression` step
#[derive(Debug, Clone)]
pub struct CompressionConstructor {
    level: Compression,
}

impl CompressionConstructor {
    pub fn from_step(step: &CodecStep) -> Result<Self> {
        if step.algorithm != GZIP {
            return Err(LantasError::UnknownAlgorithm {
                kind: "compression",
                algorithm: step.algorithm.clone(),
            });
        }
        let level = parse_level(step.config.get(COMPRESSION_LEVEL_KEY))?;
        Ok(Self { level })
    }

    pub fn level(&self) -> Compression {
        self.level
    }
}

impl Constructor for CompressionConstructor {
    fn build(&self, next: Box<dyn ConnHandler>) -> Result<Box<dyn ConnHandler>> {
        Ok(Box::new(GzipHandler::new(self.level, next)))
    }

    fn buffer_depth(&self) -> usize {
        1
    }

    fn name(&self) -> &str {
        "compression"
    }
}

/// Builds a decompression stage from a `decompression` step
#[derive(Debug, Clone, Default)]
pub struct DecompressionConstructor;

impl DecompressionConstructor {
    pub fn from_step(step: &CodecStep) -> Result<Self> {
        if step.algorithm != GZIP {
            return Err(LantasError::UnknownAlgorithm {
                kind: "decompression",
                algorithm: step.algorithm.clone(),
            });
        }
        Ok(Self)
    }
}

impl Constructor for DecompressionConstructor {
    fn build(&self, next: Box<dyn ConnHandler>) -> Result<Box<dyn ConnHandler>> {
        Ok(Box::new(GunzipHandler::new(next)))
    }

    fn buffer_depth(&self) -> usize {
        1
    }

    fn name(&self) -> &str {
        "decompression"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler::{Direction, Passthrough};
    use crate::pool::BufferPool;
    use std::collections::BTreeMap;

    fn step(algorithm: &str, level: Option<serde_yaml::Value>) -> CodecStep {
        let mut config = BTreeMap::new();
        if let Some(level) = level {
            config.insert(COMPRESSION_LEVEL_KEY.to_string(), level);
        }
        CodecStep {
            algorithm: algorithm.to_string(),
            config,
        }
    }

    /// Read buffer big enough for `payload`, scratch buffers deliberately small
    fn context(payload: &[u8], chain_len: usize) -> HandlerContext {
        let read_pool = BufferPool::new(0, payload.len().max(1));
        let scratch_pool = BufferPool::new(0, 64);
        let chain = (0..chain_len).map(|_| scratch_pool.get()).collect();
        let mut ctx =
            HandlerContext::new(Direction::ClientToUpstream, read_pool.get_read_buf(), chain);
        ctx.read_buf_mut()[..payload.len()].copy_from_slice(payload);
        ctx.set_read_n(payload.len());
        ctx
    }

    fn round_trip(payload: &[u8]) -> Vec<u8> {
        let gzip = CompressionConstructor::from_step(&step("gzip", None)).unwrap();
        let gunzip = DecompressionConstructor::from_step(&step("gzip", None)).unwrap();
        let handler = gzip
            .build(gunzip.build(Box::new(Passthrough)).unwrap())
            .unwrap();

        let mut ctx = context(payload, 3);
        handler.handle(&mut ctx).unwrap();
        assert_eq!(ctx.stages_run(), 2);
        ctx.output().to_vec()
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x2545_f491;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    #[test]
    fn test_round_trip_empty() {
        assert_eq!(round_trip(b""), b"");
    }

    #[test]
    fn test_round_trip_single_byte() {
        assert_eq!(round_trip(b"x"), b"x");
    }

    #[test]
    fn test_round_trip_larger_than_scratch_buffer() {
        let payload = noise(4096);
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn test_gzip_output_is_gzip_framed() {
        let gzip = CompressionConstructor::from_step(&step("gzip", None)).unwrap();
        let handler = gzip.build(Box::new(Passthrough)).unwrap();
        let mut ctx = context(b"hello hello hello", 2);
        handler.handle(&mut ctx).unwrap();

        let out = ctx.output();
        assert_eq!(&out[..2], &[0x1f, 0x8b]);
        assert_ne!(out, b"hello hello hello");
    }

    #[test]
    fn test_gunzip_rejects_plain_bytes() {
        let handler = DecompressionConstructor
            .build(Box::new(Passthrough))
            .unwrap();
        let mut ctx = context(b"definitely not gzip", 2);
        let err = handler.handle(&mut ctx).unwrap_err();
        assert!(matches!(err, LantasError::Codec { algorithm: "gzip", .. }));
    }

    fn gzip_bytes(payload: &[u8], level: Compression) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), level);
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_gunzip_resumes_member_split_across_reads() {
        let payload = noise(2000);
        let mut compressed = gzip_bytes(&payload, Compression::none());
        compressed.extend(gzip_bytes(b"second member", Compression::best()));

        let handler = DecompressionConstructor
            .build(Box::new(Passthrough))
            .unwrap();
        // one context for the whole stream, as a direction's loop keeps it
        let read_pool = BufferPool::new(0, 333);
        let scratch_pool = BufferPool::new(0, 64);
        let chain = (0..2).map(|_| scratch_pool.get()).collect();
        let mut ctx =
            HandlerContext::new(Direction::UpstreamToClient, read_pool.get_read_buf(), chain);

        let mut decoded = Vec::new();
        for chunk in compressed.chunks(333) {
            ctx.read_buf_mut()[..chunk.len()].copy_from_slice(chunk);
            ctx.set_read_n(chunk.len());
            handler.handle(&mut ctx).unwrap();
            decoded.extend_from_slice(ctx.output());
            ctx.reset();
        }

        let mut expected = payload;
        expected.extend_from_slice(b"second member");
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_gunzip_caps_expansion_of_one_read() {
        let bomb = gzip_bytes(&vec![0u8; 4 << 20], Compression::best());
        assert!(bomb.len() * MAX_EXPANSION < 4 << 20);

        let handler = DecompressionConstructor
            .build(Box::new(Passthrough))
            .unwrap();
        let mut ctx = context(&bomb, 2);
        let err = handler.handle(&mut ctx).unwrap_err();
        assert!(matches!(err, LantasError::Codec { algorithm: "gzip", .. }));
    }

    #[test]
    fn test_gzip_without_spare_buffer_fails() {
        let gzip = CompressionConstructor::from_step(&step("gzip", None)).unwrap();
        let handler = gzip.build(Box::new(Passthrough)).unwrap();
        let mut ctx = context(b"abc", 1);
        assert!(matches!(
            handler.handle(&mut ctx),
            Err(LantasError::BufferChainExhausted { .. })
        ));
    }

    #[test]
    fn test_unknown_algorithms_are_rejected() {
        assert!(matches!(
            CompressionConstructor::from_step(&step("brotli", None)),
            Err(LantasError::UnknownAlgorithm { kind: "compression", .. })
        ));
        assert!(matches!(
            DecompressionConstructor::from_step(&step("zstd", None)),
            Err(LantasError::UnknownAlgorithm { kind: "decompression", .. })
        ));
    }

    #[test]
    fn test_parse_level() {
        let s = |v: &str| serde_yaml::Value::String(v.to_string());

        assert_eq!(parse_level(None).unwrap(), Compression::default());
        assert_eq!(parse_level(Some(&s("NoCompression"))).unwrap(), Compression::none());
        assert_eq!(parse_level(Some(&s("BestSpeed"))).unwrap(), Compression::fast());
        assert_eq!(parse_level(Some(&s("BestCompression"))).unwrap(), Compression::best());
        assert_eq!(parse_level(Some(&s("HuffmanOnly"))).unwrap(), Compression::fast());
        // unknown names fall back instead of failing
        assert_eq!(parse_level(Some(&s("Turbo"))).unwrap(), Compression::default());

        assert!(matches!(
            parse_level(Some(&serde_yaml::Value::Bool(true))),
            Err(LantasError::InvalidMiddlewareOption { .. })
        ));
    }

    #[test]
    fn test_level_from_step_config() {
        let ctor = CompressionConstructor::from_step(&step(
            "gzip",
            Some(serde_yaml::Value::String("BestCompression".into())),
        ))
        .unwrap();
        assert_eq!(ctor.level(), Compression::best());
    }
}
