//! Response compressor (C9)
//!
//! Only engaged for non-streaming responses above `min_size_bytes`.
//! Algorithm choice is cached per payload fingerprint (first 4KiB
//! BLAKE3-hashed) so repeated shapes of the same tool's output don't
//! re-run the selection trial on every call. Compression runs on
//! `tokio::task::spawn_blocking` so a large payload never stalls the
//! async I/O reactor.

use std::io::{Read, Write};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::{CompressionAlgorithm, CompressionConfig};

const FINGERPRINT_SAMPLE_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Identity,
    Zstd,
    Gzip,
    Brotli,
}

impl Encoding {
    pub fn content_encoding_header(self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Zstd => Some("zstd"),
            Encoding::Gzip => Some("gzip"),
            Encoding::Brotli => Some("br"),
        }
    }
}

pub struct Compressor {
    config: CompressionConfig,
    /// Fingerprint -> best-performing algorithm observed so far.
    fingerprint_choice: DashMap<[u8; 8], Encoding>,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            fingerprint_choice: DashMap::new(),
        })
    }

    fn fingerprint(payload: &[u8]) -> [u8; 8] {
        let sample = &payload[..payload.len().min(FINGERPRINT_SAMPLE_BYTES)];
        let hash = blake3::hash(sample);
        let mut out = [0u8; 8];
        out.copy_from_slice(&hash.as_bytes()[..8]);
        out
    }

    /// Compress `payload` if eligible; returns the (possibly unchanged)
    /// bytes and the encoding actually applied.
    pub async fn compress(self: &Arc<Self>, payload: Vec<u8>) -> (Vec<u8>, Encoding) {
        if !self.config.enabled || payload.len() < self.config.min_size_bytes || self.config.algorithms.is_empty() {
            return (payload, Encoding::Identity);
        }

        let fingerprint = Self::fingerprint(&payload);
        let algorithm = self
            .fingerprint_choice
            .get(&fingerprint)
            .map(|e| *e)
            .unwrap_or_else(|| config_default(&self.config.algorithms));

        let this = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || this.try_algorithms(&payload, algorithm))
            .await
            .unwrap_or((vec![], Encoding::Identity));

        if result.1 != Encoding::Identity {
            self.fingerprint_choice.insert(fingerprint, result.1);
        }
        result
    }

    /// Try the preferred algorithm first, falling back through the
    /// configured list if a codec errors; returns Identity (the
    /// original bytes, unmodified) if every configured codec fails.
    fn try_algorithms(&self, payload: &[u8], preferred: Encoding) -> (Vec<u8>, Encoding) {
        let mut order: Vec<Encoding> = vec![preferred];
        for alg in &self.config.algorithms {
            let enc = from_config(*alg);
            if !order.contains(&enc) {
                order.push(enc);
            }
        }
        for encoding in order {
            if let Some(bytes) = compress_with(encoding, payload) {
                return (bytes, encoding);
            }
        }
        (payload.to_vec(), Encoding::Identity)
    }

    pub fn decompress(&self, payload: &[u8], encoding: Encoding) -> std::io::Result<Vec<u8>> {
        match encoding {
            Encoding::Identity => Ok(payload.to_vec()),
            Encoding::Zstd => zstd::stream::decode_all(payload),
            Encoding::Gzip => {
                let mut out = Vec::new();
                flate2::read::GzDecoder::new(payload).read_to_end(&mut out)?;
                Ok(out)
            }
            Encoding::Brotli => {
                let mut out = Vec::new();
                brotli::BrotliDecompress(&mut std::io::Cursor::new(payload), &mut out)?;
                Ok(out)
            }
        }
    }
}

fn config_default(algorithms: &[CompressionAlgorithm]) -> Encoding {
    algorithms.first().map(|a| from_config(*a)).unwrap_or(Encoding::Zstd)
}

fn from_config(alg: CompressionAlgorithm) -> Encoding {
    match alg {
        CompressionAlgorithm::Zstd => Encoding::Zstd,
        CompressionAlgorithm::Gzip => Encoding::Gzip,
        CompressionAlgorithm::Brotli => Encoding::Brotli,
    }
}

fn compress_with(encoding: Encoding, payload: &[u8]) -> Option<Vec<u8>> {
    match encoding {
        Encoding::Identity => None,
        Encoding::Zstd => zstd::stream::encode_all(payload, 3).ok(),
        Encoding::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(payload).ok()?;
            encoder.finish().ok()
        }
        Encoding::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            brotli::BrotliCompress(&mut std::io::Cursor::new(payload), &mut out, &params).ok()?;
            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CompressionConfig {
        CompressionConfig {
            enabled: true,
            min_size_bytes: 16,
            algorithms: vec![CompressionAlgorithm::Zstd, CompressionAlgorithm::Gzip, CompressionAlgorithm::Brotli],
        }
    }

    #[tokio::test]
    async fn small_payload_is_not_compressed() {
        let compressor = Compressor::new(config());
        let (bytes, encoding) = compressor.compress(b"tiny".to_vec()).await;
        assert_eq!(encoding, Encoding::Identity);
        assert_eq!(bytes, b"tiny");
    }

    #[tokio::test]
    async fn large_payload_round_trips_through_zstd() {
        let compressor = Compressor::new(config());
        let payload = "a".repeat(4096).into_bytes();
        let (compressed, encoding) = compressor.compress(payload.clone()).await;
        assert_eq!(encoding, Encoding::Zstd);
        assert!(compressed.len() < payload.len());
        let restored = compressor.decompress(&compressed, encoding).unwrap();
        assert_eq!(restored, payload);
    }

    #[tokio::test]
    async fn disabled_config_never_compresses() {
        let mut cfg = config();
        cfg.enabled = false;
        let compressor = Compressor::new(cfg);
        let payload = "a".repeat(4096).into_bytes();
        let (_, encoding) = compressor.compress(payload).await;
        assert_eq!(encoding, Encoding::Identity);
    }

    #[tokio::test]
    async fn fingerprint_choice_is_reused_across_calls() {
        let compressor = Compressor::new(config());
        let payload = "b".repeat(4096).into_bytes();
        let (_, first) = compressor.compress(payload.clone()).await;
        assert_eq!(compressor.fingerprint_choice.len(), 1);
        let (_, second) = compressor.compress(payload).await;
        assert_eq!(first, second);
    }

    #[test]
    fn gzip_round_trips() {
        let compressor = Compressor::new(config());
        let payload = "c".repeat(2048).into_bytes();
        let compressed = compress_with(Encoding::Gzip, &payload).unwrap();
        let restored = compressor.decompress(&compressed, Encoding::Gzip).unwrap();
        assert_eq!(restored, payload);
    }
}
