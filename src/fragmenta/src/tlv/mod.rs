//! Self-describing TLV (type-length-value) codec (§3.4, §4.1).
//!
//! On the wire a TLV item is `{type: u8, length_marker: u8, length: varies,
//! value: bytes}`. All multi-byte scalars here are little-endian — this is
//! the opposite convention from [`crate::header`] and [`crate::block`],
//! which are big-endian. Do not "fix" this; on-disk compatibility depends
//! on both conventions holding simultaneously (see Design Note 4 in
//! SPEC_FULL.md).

mod codec;
mod value;

pub use codec::{decode, decode_from, encode};
pub use value::TlvValue;

/// Containers nested deeper than this fail decode with `DecodeError{Depth}`.
pub const MAX_DEPTH: usize = 64;

pub(crate) const TYPE_NULL: u8 = 0x00;
pub(crate) const TYPE_INT8: u8 = 0x01;
pub(crate) const TYPE_INT16: u8 = 0x02;
pub(crate) const TYPE_INT32: u8 = 0x03;
pub(crate) const TYPE_INT64: u8 = 0x04;
pub(crate) const TYPE_UINT8: u8 = 0x05;
pub(crate) const TYPE_UINT16: u8 = 0x06;
pub(crate) const TYPE_UINT32: u8 = 0x07;
pub(crate) const TYPE_UINT64: u8 = 0x08;
pub(crate) const TYPE_FLOAT32: u8 = 0x09;
pub(crate) const TYPE_FLOAT64: u8 = 0x0A;
pub(crate) const TYPE_STRING: u8 = 0x0B;
pub(crate) const TYPE_BYTES: u8 = 0x0C;
pub(crate) const TYPE_BOOL: u8 = 0x0D;
pub(crate) const TYPE_ARRAY: u8 = 0x0E;
pub(crate) const TYPE_MAP: u8 = 0x0F;
pub(crate) const TYPE_CUSTOM: u8 = 0x10;
