//! # Page Serialization Buffers
//!
//! `WriteBuffer` is the growable, random-access output buffer pages are
//! serialized into. A whole chunk is assembled in one buffer: the chunk
//! header, every page, and the root table, in file order.
//!
//! Two write modes are provided:
//!
//! - **Relative**: `put_*` appends at the current end of the buffer.
//! - **Absolute**: `put_*_at` overwrites bytes that were already written.
//!
//! Absolute writes are what make the page format's forward references
//! workable: the page length and check value are framed as zeros and patched
//! once the page is fully serialized, and an internal page's child-position
//! table is rewritten after its children have been assigned positions.
//! `truncate` rewinds the buffer end, which the compression path uses to
//! replace an already-written payload with its compressed form.
//!
//! `ByteReader` is the matching bounds-checked cursor over a byte slice used
//! by the deserialization path.
//!
//! All multi-byte integers are little-endian.

use eyre::{ensure, Result};

use super::varint::{
    decode_var_u32, decode_var_u64, encode_var_u32, encode_var_u64, MAX_VAR_U32_LEN,
    MAX_VAR_U64_LEN,
};

#[derive(Debug, Default)]
pub struct WriteBuffer {
    data: Vec<u8>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Current write position, equal to the number of bytes written so far.
    pub fn position(&self) -> usize {
        self.data.len()
    }

    /// Appends `n` zero bytes, reserving space to be patched later.
    pub fn advance(&mut self, n: usize) {
        self.data.resize(self.data.len() + n, 0);
    }

    /// Rewinds the buffer end to `len`, discarding everything after it.
    pub fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.data.truncate(len);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_var_u32(&mut self, v: u32) {
        let mut tmp = [0u8; MAX_VAR_U32_LEN];
        let n = encode_var_u32(v, &mut tmp);
        self.data.extend_from_slice(&tmp[..n]);
    }

    pub fn put_var_u64(&mut self, v: u64) {
        let mut tmp = [0u8; MAX_VAR_U64_LEN];
        let n = encode_var_u64(v, &mut tmp);
        self.data.extend_from_slice(&tmp[..n]);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn put_u8_at(&mut self, pos: usize, v: u8) {
        self.data[pos] = v;
    }

    pub fn put_u16_at(&mut self, pos: usize, v: u16) {
        self.data[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32_at(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64_at(&mut self, pos: usize, v: u64) {
        self.data[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes_at(&mut self, pos: usize, bytes: &[u8]) {
        self.data[pos..pos + bytes.len()].copy_from_slice(bytes);
    }

    /// A view of a previously written region.
    pub fn slice(&self, start: usize, len: usize) -> &[u8] {
        &self.data[start..start + len]
    }

    /// Everything written so far.
    pub fn written(&self) -> &[u8] {
        &self.data
    }
}

/// Bounds-checked read cursor over a byte slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take_raw(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.remaining() >= n,
            "buffer underflow: need {} bytes, {} remaining",
            n,
            self.remaining()
        );
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_raw(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take_raw(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take_raw(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take_raw(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_var_u32(&mut self) -> Result<u32> {
        let (value, read) = decode_var_u32(&self.data[self.pos..])?;
        self.pos += read;
        Ok(value)
    }

    pub fn get_var_u64(&mut self) -> Result<u64> {
        let (value, read) = decode_var_u64(&self.data[self.pos..])?;
        self.pos += read;
        Ok(value)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take_raw(n)
    }

    /// The unread remainder of the slice.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}
