//! # Page Payload Compression
//!
//! Pages optionally compress their key/value payload before framing. Two
//! compressor profiles are offered, selected by the store's compression
//! level:
//!
//! - **fast** (level 1): raw deflate at the fastest setting, for workloads
//!   that favor write throughput
//! - **high** (level 2): raw deflate at the best setting, for workloads that
//!   favor on-disk size
//!
//! The page codec records which profile produced a payload in the page's
//! type byte, so a store opened at a different compression level still reads
//! older pages correctly.
//!
//! Compression is advisory: the page codec only keeps the compressed form
//! when it is strictly smaller than the original after accounting for the
//! added-length varint. `expand` is handed the exact expanded length from
//! that varint, so decompression allocates once and never guesses.

use std::io::{Read, Write};

use eyre::{ensure, Result, WrapErr};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Byte-block compressor used on page payloads.
pub trait Compressor: Send + Sync {
    /// Compresses `src`, returning the compressed bytes.
    fn compress(&self, src: &[u8]) -> Result<Vec<u8>>;

    /// Expands `src` into exactly `expanded_len` bytes.
    fn expand(&self, src: &[u8], expanded_len: usize) -> Result<Vec<u8>>;
}

/// Raw-deflate compressor at a fixed compression setting.
#[derive(Debug, Clone, Copy)]
pub struct Deflate {
    level: Compression,
}

impl Deflate {
    /// The "fast" profile (compression level 1).
    pub fn fast() -> Self {
        Self {
            level: Compression::fast(),
        }
    }

    /// The "high" profile (compression level 2).
    pub fn high() -> Self {
        Self {
            level: Compression::best(),
        }
    }
}

impl Compressor for Deflate {
    fn compress(&self, src: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(src.len() / 2), self.level);
        encoder
            .write_all(src)
            .wrap_err("deflate compression failed")?;
        encoder.finish().wrap_err("deflate compression failed")
    }

    fn expand(&self, src: &[u8], expanded_len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; expanded_len];
        let mut decoder = DeflateDecoder::new(src);
        decoder
            .read_exact(&mut out)
            .wrap_err("deflate expansion failed")?;
        // a corrupt stream can decode to the right prefix but keep going
        let mut overrun = [0u8; 1];
        let extra = decoder
            .read(&mut overrun)
            .wrap_err("deflate expansion failed")?;
        ensure!(extra == 0, "deflate stream longer than expected {} bytes", expanded_len);
        Ok(out)
    }
}
