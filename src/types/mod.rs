//! # Data Type Codecs
//!
//! A map never introspects its keys or values; everything it needs is
//! supplied by a [`DataType`] implementation per side:
//!
//! - **ordering** (`compare`) for search and insert position
//! - **memory estimation** (`memory`) feeding the page memory accounting
//! - **batch serialization** (`write` / `read`) for the page payload
//!
//! Serialization is batched over whole arrays rather than per element so a
//! codec can amortize work across a page (and so fixed-width types compile
//! to a tight loop).
//!
//! Stock codecs cover the common cases: `U64Type` for fixed-width integer
//! keys, `StrType` for UTF-8 strings, `BytesType` for raw blobs. Memory
//! estimates count the container header plus payload for owned types, and
//! the raw width for integers.

use std::cmp::Ordering;

use eyre::{Result, WrapErr};

use crate::encoding::{ByteReader, WriteBuffer};

/// Capability set a map requires of its key and value types.
pub trait DataType<T>: Send + Sync {
    /// Total order over values of the type.
    fn compare(&self, a: &T, b: &T) -> Ordering;

    /// Estimated in-memory size of one value, in bytes.
    fn memory(&self, value: &T) -> usize;

    /// Serializes `values` into the buffer.
    fn write(&self, buff: &mut WriteBuffer, values: &[T]);

    /// Deserializes exactly `count` values.
    fn read(&self, reader: &mut ByteReader<'_>, count: usize) -> Result<Vec<T>>;
}

/// Fixed-width `u64` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Type;

impl DataType<u64> for U64Type {
    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, _value: &u64) -> usize {
        8
    }

    fn write(&self, buff: &mut WriteBuffer, values: &[u64]) {
        for &v in values {
            buff.put_u64(v);
        }
    }

    fn read(&self, reader: &mut ByteReader<'_>, count: usize) -> Result<Vec<u64>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(reader.get_u64()?);
        }
        Ok(out)
    }
}

/// Length-prefixed UTF-8 string codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrType;

impl DataType<String> for StrType {
    fn compare(&self, a: &String, b: &String) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, value: &String) -> usize {
        std::mem::size_of::<String>() + value.len()
    }

    fn write(&self, buff: &mut WriteBuffer, values: &[String]) {
        for v in values {
            buff.put_var_u32(v.len() as u32);
            buff.put_bytes(v.as_bytes());
        }
    }

    fn read(&self, reader: &mut ByteReader<'_>, count: usize) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let len = reader.get_var_u32()? as usize;
            let bytes = reader.take(len)?;
            let s = std::str::from_utf8(bytes).wrap_err("invalid utf-8 in string payload")?;
            out.push(s.to_owned());
        }
        Ok(out)
    }
}

/// Length-prefixed raw byte blob codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesType;

impl DataType<Vec<u8>> for BytesType {
    fn compare(&self, a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
        a.cmp(b)
    }

    fn memory(&self, value: &Vec<u8>) -> usize {
        std::mem::size_of::<Vec<u8>>() + value.len()
    }

    fn write(&self, buff: &mut WriteBuffer, values: &[Vec<u8>]) {
        for v in values {
            buff.put_var_u32(v.len() as u32);
            buff.put_bytes(v);
        }
    }

    fn read(&self, reader: &mut ByteReader<'_>, count: usize) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let len = reader.get_var_u32()? as usize;
            out.push(reader.take(len)?.to_vec());
        }
        Ok(out)
    }
}
