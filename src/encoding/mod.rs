//! # Encoding Module
//!
//! Low-level byte plumbing shared by the page codec and the store:
//!
//! - `varint`: LEB128 variable-length integers
//! - `buffer`: `WriteBuffer` (relative + absolute writes) and `ByteReader`
//! - `position`: packed 64-bit page positions, length classes, check values
//!
//! Everything here is pure and allocation-conscious; the only heap user is
//! `WriteBuffer`'s backing vector.

pub mod buffer;
pub mod position;
pub mod varint;

pub use buffer::{ByteReader, WriteBuffer};
