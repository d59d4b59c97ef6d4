//! Best-effort payload compression for the storage write path.
//!
//! Runs synchronously inside save operations, so every attempt is bounded by a time
//! budget and a target ratio. Anything that misses either is stored as-is. The native
//! stream compressor (deflate) sits behind the `deflate` feature; without it, or when
//! it fails, a dictionary-substitution compressor tuned for progress JSON is used.

use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CompressionConfig;

const ESCAPE: u8 = 0x01;
const LITERAL_ESCAPE: u8 = 0xFF;

/// Substrings that dominate serialized progress, game and session records.
/// Longest first so the greedy matcher prefers them. At most 255 entries.
const DICTIONARY: &[&str] = &[
    "\"termToDefinition\":{",
    "\"definitionToTerm\":{",
    "\"timesIncorrect\":",
    "\"lastPracticed\":\"",
    "\"correctStreak\":",
    "\"timesCorrect\":",
    "\"languageCode\":",
    "\"sessionType\":",
    "\"incorrect\":",
    "\"timestamp\":",
    "\"direction\":",
    "\"correct\":",
    "\"wordId\":\"",
    "\"streak\":",
    "\"mastery\":",
    "\"score\":",
    "\"level\":",
    "\"xp\":",
    "null",
    "true",
    "false",
    "\":{\"",
    "},\"",
    "\":\"",
    "\",\"",
    ":0,\"",
    ":1,\"",
    "T00:",
    ".000Z",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Deflate,
    Dictionary,
}

impl CompressionAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Deflate => "deflate",
            CompressionAlgorithm::Dictionary => "dictionary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPayload {
    pub payload: Vec<u8>,
    pub algorithm: CompressionAlgorithm,
    pub original_size: usize,
    pub compressed_size: usize,
}

impl CompressedPayload {
    fn uncompressed(data: &str) -> Self {
        Self {
            payload: data.as_bytes().to_vec(),
            algorithm: CompressionAlgorithm::None,
            original_size: data.len(),
            compressed_size: data.len(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.algorithm != CompressionAlgorithm::None
    }

    /// compressed / original; 1.0 when nothing was saved.
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 1.0;
        }
        self.compressed_size as f64 / self.original_size as f64
    }
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),
    #[error("decompression failed: {0}")]
    DecompressFailed(String),
    #[error("algorithm {0} is not available in this build")]
    Unsupported(&'static str),
    #[error("decompressed payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    pub attempts: u64,
    pub compressed: u64,
    pub skipped_small: u64,
    pub rejected: u64,
    pub failures: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl CompressionStats {
    /// Fraction of bytes saved across every payload that went through the codec.
    pub fn savings(&self) -> f64 {
        if self.bytes_in == 0 {
            return 0.0;
        }
        1.0 - (self.bytes_out as f64 / self.bytes_in as f64)
    }
}

pub struct CompressionCodec {
    config: CompressionConfig,
    stats: Mutex<CompressionStats>,
}

impl CompressionCodec {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(CompressionStats::default()),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn stats(&self) -> CompressionStats {
        *self.stats.lock()
    }

    pub fn should_compress(&self, size_bytes: usize) -> bool {
        self.config.enabled && size_bytes >= self.config.min_size_bytes
    }

    pub fn compress(&self, data: &str) -> CompressedPayload {
        let original_size = data.len();
        if !self.should_compress(original_size) {
            self.record(|s| {
                s.attempts += 1;
                s.skipped_small += 1;
                s.bytes_in += original_size as u64;
                s.bytes_out += original_size as u64;
            });
            return CompressedPayload::uncompressed(data);
        }

        let started = Instant::now();
        let (algorithm, payload) = match native_compress(data.as_bytes(), self.config.level) {
            Some(Ok(bytes)) => (CompressionAlgorithm::Deflate, bytes),
            Some(Err(err)) => {
                warn!(error = %err, "native compression failed, using dictionary compressor");
                self.record(|s| s.failures += 1);
                (CompressionAlgorithm::Dictionary, dictionary_encode(data.as_bytes()))
            }
            None => (CompressionAlgorithm::Dictionary, dictionary_encode(data.as_bytes())),
        };
        let elapsed = started.elapsed();

        let compressed_size = payload.len();
        let ratio = compressed_size as f64 / original_size as f64;
        if elapsed > self.config.max_compress_time || ratio >= self.config.target_ratio {
            debug!(
                algorithm = algorithm.as_str(),
                ratio = format!("{:.3}", ratio),
                elapsed_ms = elapsed.as_millis() as u64,
                "compression not worthwhile, storing original"
            );
            self.record(|s| {
                s.attempts += 1;
                s.rejected += 1;
                s.bytes_in += original_size as u64;
                s.bytes_out += original_size as u64;
            });
            return CompressedPayload::uncompressed(data);
        }

        self.record(|s| {
            s.attempts += 1;
            s.compressed += 1;
            s.bytes_in += original_size as u64;
            s.bytes_out += compressed_size as u64;
        });

        CompressedPayload {
            payload,
            algorithm,
            original_size,
            compressed_size,
        }
    }

    pub fn decompress(&self, compressed: &CompressedPayload) -> Result<String, CompressionError> {
        decompress_bytes(compressed.algorithm, &compressed.payload)
    }

    fn record(&self, update: impl FnOnce(&mut CompressionStats)) {
        update(&mut self.stats.lock());
    }
}

pub fn decompress_bytes(algorithm: CompressionAlgorithm, payload: &[u8]) -> Result<String, CompressionError> {
    let bytes = match algorithm {
        CompressionAlgorithm::None => payload.to_vec(),
        CompressionAlgorithm::Deflate => native_decompress(payload)?,
        CompressionAlgorithm::Dictionary => dictionary_decode(payload)?,
    };
    Ok(String::from_utf8(bytes)?)
}

#[cfg(feature = "deflate")]
fn native_compress(data: &[u8], level: u32) -> Option<Result<Vec<u8>, CompressionError>> {
    use std::io::Write;

    use flate2::write::DeflateEncoder;
    use flate2::Compression;

    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    let result = encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| CompressionError::CompressFailed(e.to_string()));
    Some(result)
}

#[cfg(not(feature = "deflate"))]
fn native_compress(_data: &[u8], _level: u32) -> Option<Result<Vec<u8>, CompressionError>> {
    None
}

#[cfg(feature = "deflate")]
fn native_decompress(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    use std::io::Read;

    use flate2::read::DeflateDecoder;

    let mut decoder = DeflateDecoder::new(payload);
    let mut out = Vec::with_capacity(payload.len() * 3);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CompressionError::DecompressFailed(e.to_string()))?;
    Ok(out)
}

#[cfg(not(feature = "deflate"))]
fn native_decompress(_payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    Err(CompressionError::Unsupported("deflate"))
}

fn dictionary_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    'outer: while i < data.len() {
        if data[i] == ESCAPE {
            out.push(ESCAPE);
            out.push(LITERAL_ESCAPE);
            i += 1;
            continue;
        }
        for (index, entry) in DICTIONARY.iter().enumerate() {
            if data[i..].starts_with(entry.as_bytes()) {
                out.push(ESCAPE);
                out.push(index as u8);
                i += entry.len();
                continue 'outer;
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

fn dictionary_decode(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(payload.len() * 2);
    let mut iter = payload.iter();
    while let Some(&byte) = iter.next() {
        if byte != ESCAPE {
            out.push(byte);
            continue;
        }
        let code = *iter
            .next()
            .ok_or_else(|| CompressionError::DecompressFailed("truncated escape sequence".into()))?;
        if code == LITERAL_ESCAPE {
            out.push(ESCAPE);
            continue;
        }
        let entry = DICTIONARY
            .get(code as usize)
            .ok_or_else(|| CompressionError::DecompressFailed(format!("unknown dictionary code {code}")))?;
        out.extend_from_slice(entry.as_bytes());
    }
    Ok(out)
}
