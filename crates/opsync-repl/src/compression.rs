//! Compression codec for replication blocks.
//!
//! Every broker message and every initial-load stream is one self-delimiting compressed frame
//! (LZ4 frame format or a zstd frame), so a receiver can decompress a complete block without
//! external length metadata. The algorithm is detected from the frame magic on decode.

use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];
const ZSTD_FRAME_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Compression algorithm for replication blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgo {
    /// LZ4 frame format (low latency).
    #[default]
    Lz4,
    /// Zstd (higher ratio, slightly more CPU).
    Zstd,
}

impl CompressionAlgo {
    /// Identify the algorithm from the first bytes of a frame.
    pub fn detect(data: &[u8]) -> Option<Self> {
        match data.get(..4) {
            Some(magic) if magic == LZ4_FRAME_MAGIC => Some(Self::Lz4),
            Some(magic) if magic == ZSTD_FRAME_MAGIC => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Compression configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm to use for outbound blocks.
    pub algo: CompressionAlgo,
    /// Zstd compression level (1–22; default 3). Ignored for LZ4.
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algo: CompressionAlgo::Lz4,
            zstd_level: 3,
        }
    }
}

/// Streaming compressor writing one frame into an in-memory buffer.
pub enum CompressingSink {
    /// LZ4 frame encoder.
    Lz4(lz4_flex::frame::FrameEncoder<Vec<u8>>),
    /// Zstd stream encoder.
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl CompressingSink {
    /// Open a new frame with the configured algorithm.
    pub fn new(config: &CompressionConfig) -> Result<Self> {
        match config.algo {
            CompressionAlgo::Lz4 => Ok(Self::Lz4(lz4_flex::frame::FrameEncoder::new(Vec::new()))),
            CompressionAlgo::Zstd => {
                let level = config.zstd_level.clamp(1, 22);
                let encoder = zstd::stream::write::Encoder::new(Vec::new(), level)
                    .map_err(|e| ReplError::Compression(e.to_string()))?;
                Ok(Self::Zstd(encoder))
            }
        }
    }

    /// Close the frame and return the compressed bytes.
    pub fn finish(self) -> Result<Vec<u8>> {
        match self {
            Self::Lz4(encoder) => encoder
                .finish()
                .map_err(|e| ReplError::Compression(e.to_string())),
            Self::Zstd(encoder) => encoder
                .finish()
                .map_err(|e| ReplError::Compression(e.to_string())),
        }
    }
}

impl Write for CompressingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Lz4(encoder) => encoder.write(buf),
            Self::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Lz4(encoder) => encoder.flush(),
            Self::Zstd(encoder) => encoder.flush(),
        }
    }
}

/// Compress `data` into a single frame.
pub fn compress(config: &CompressionConfig, data: &[u8]) -> Result<Vec<u8>> {
    let mut sink = CompressingSink::new(config)?;
    sink.write_all(data)?;
    sink.finish()
}

/// Wrap `input` in a decompressing reader for the given algorithm.
pub fn decompressing_reader<'a, R: Read + 'a>(
    algo: CompressionAlgo,
    input: R,
) -> Result<Box<dyn Read + 'a>> {
    match algo {
        CompressionAlgo::Lz4 => Ok(Box::new(lz4_flex::frame::FrameDecoder::new(input))),
        CompressionAlgo::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(input)
                .map_err(|e| ReplError::Compression(e.to_string()))?;
            Ok(Box::new(decoder))
        }
    }
}

/// Decompress one complete frame, detecting the algorithm from its magic.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let algo = CompressionAlgo::detect(data)
        .ok_or_else(|| ReplError::Compression("unrecognized frame magic".to_string()))?;
    let mut reader = decompressing_reader(algo, data)?;
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|e| ReplError::Compression(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_default_config() {
        let config = CompressionConfig::default();
        assert_eq!(config.algo, CompressionAlgo::Lz4);
        assert_eq!(config.zstd_level, 3);
    }

    #[test]
    fn test_lz4_frame_detected_and_restored() {
        let data = sample(10_000);
        let compressed = compress(&CompressionConfig::default(), &data).unwrap();
        assert_eq!(CompressionAlgo::detect(&compressed), Some(CompressionAlgo::Lz4));
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_zstd_frame_detected_and_restored() {
        let config = CompressionConfig {
            algo: CompressionAlgo::Zstd,
            zstd_level: 99,
        };
        let data = sample(10_000);
        let compressed = compress(&config, &data).unwrap();
        assert_eq!(CompressionAlgo::detect(&compressed), Some(CompressionAlgo::Zstd));
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_empty_frame() {
        let compressed = compress(&CompressionConfig::default(), &[]).unwrap();
        assert!(decompress(&compressed).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_magic_rejected() {
        let err = decompress(b"not a frame").unwrap_err();
        assert!(matches!(err, ReplError::Compression(_)));
        assert_eq!(CompressionAlgo::detect(&[0x04, 0x22]), None);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let compressed = compress(&CompressionConfig::default(), &sample(50_000)).unwrap();
        let truncated = &compressed[..compressed.len() / 2];
        assert!(decompress(truncated).is_err());
    }

    #[test]
    fn test_sink_streams_multiple_writes() {
        let mut sink = CompressingSink::new(&CompressionConfig::default()).unwrap();
        sink.write_all(b"hello ").unwrap();
        sink.write_all(b"world").unwrap();
        let frame = sink.finish().unwrap();
        assert_eq!(decompress(&frame).unwrap(), b"hello world");
    }
}
