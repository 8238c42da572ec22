use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{value::TlvValue, MAX_DEPTH, *};
use crate::error::{FragmentaError, Result};

/// Encodes `value` as `(type, length_marker, length, value)`, little-endian
/// throughout (§4.1).
pub fn encode(value: &TlvValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &TlvValue, out: &mut Vec<u8>) {
    match value {
        TlvValue::Null => write_item(out, TYPE_NULL, &[]),
        TlvValue::Int8(v) => write_item(out, TYPE_INT8, &v.to_le_bytes()),
        TlvValue::Int16(v) => write_item(out, TYPE_INT16, &v.to_le_bytes()),
        TlvValue::Int32(v) => write_item(out, TYPE_INT32, &v.to_le_bytes()),
        TlvValue::Int64(v) => write_item(out, TYPE_INT64, &v.to_le_bytes()),
        TlvValue::UInt8(v) => write_item(out, TYPE_UINT8, &v.to_le_bytes()),
        TlvValue::UInt16(v) => write_item(out, TYPE_UINT16, &v.to_le_bytes()),
        TlvValue::UInt32(v) => write_item(out, TYPE_UINT32, &v.to_le_bytes()),
        TlvValue::UInt64(v) => write_item(out, TYPE_UINT64, &v.to_le_bytes()),
        TlvValue::Float32(v) => write_item(out, TYPE_FLOAT32, &v.to_le_bytes()),
        TlvValue::Float64(v) => write_item(out, TYPE_FLOAT64, &v.to_le_bytes()),
        TlvValue::String(s) => write_item(out, TYPE_STRING, s.as_bytes()),
        TlvValue::Bytes(b) => write_item(out, TYPE_BYTES, b),
        TlvValue::Bool(b) => write_item(out, TYPE_BOOL, &[if *b { 1 } else { 0 }]),
        TlvValue::Custom(b) => write_item(out, TYPE_CUSTOM, b),
        TlvValue::Array(items) => {
            let mut body = Vec::new();
            for item in items {
                encode_into(item, &mut body);
            }
            write_item(out, TYPE_ARRAY, &body);
        }
        TlvValue::Map(entries) => {
            let mut body = Vec::new();
            for (key, val) in entries {
                encode_into(&TlvValue::String(key.clone()), &mut body);
                encode_into(val, &mut body);
            }
            write_item(out, TYPE_MAP, &body);
        }
    }
}

/// Picks the narrowest length-marker width (0=u8,1=u16,2=u32,3=u64) that
/// holds `len`, then writes `type`, marker, length, and payload.
fn write_item(out: &mut Vec<u8>, type_code: u8, payload: &[u8]) {
    out.push(type_code);
    let len = payload.len() as u64;
    if len <= u8::MAX as u64 {
        out.push(0);
        out.push(len as u8);
    } else if len <= u16::MAX as u64 {
        out.push(1);
        out.write_u16::<LittleEndian>(len as u16).unwrap();
    } else if len <= u32::MAX as u64 {
        out.push(2);
        out.write_u32::<LittleEndian>(len as u32).unwrap();
    } else {
        out.push(3);
        out.write_u64::<LittleEndian>(len).unwrap();
    }
    out.extend_from_slice(payload);
}

/// Decodes a single top-level value from `bytes`, returning the value and
/// the number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(TlvValue, usize)> {
    let mut cursor = CountingReader::new(bytes);
    let value = decode_from(&mut cursor, 0)?;
    Ok((value, cursor.offset as usize))
}

/// Decodes one TLV item from `reader`, recursing into arrays/maps.
/// `depth` is the current nesting level; exceeding [`MAX_DEPTH`] fails
/// decode rather than recursing unboundedly.
pub fn decode_from<R: Read>(reader: &mut CountingReader<R>, depth: usize) -> Result<TlvValue> {
    if depth > MAX_DEPTH {
        return Err(FragmentaError::decode("max nesting depth exceeded", reader.offset));
    }

    let type_code = reader.read_u8_tracked()?;
    let marker = reader.read_u8_tracked()?;
    let width = marker & 0x07;
    let length = match width {
        0 => reader.read_u8_tracked()? as u64,
        1 => reader.read_u16_tracked()? as u64,
        2 => reader.read_u32_tracked()? as u64,
        3 => reader.read_u64_tracked()?,
        other => {
            return Err(FragmentaError::decode(
                format!("invalid length-marker width {other}"),
                reader.offset,
            ))
        }
    };

    let payload = reader.read_exact_tracked(length as usize)?;

    match type_code {
        TYPE_NULL => Ok(TlvValue::Null),
        TYPE_INT8 => Ok(TlvValue::Int8(i8::from_le_bytes(fixed(&payload, reader.offset)?))),
        TYPE_INT16 => Ok(TlvValue::Int16(i16::from_le_bytes(fixed(&payload, reader.offset)?))),
        TYPE_INT32 => Ok(TlvValue::Int32(i32::from_le_bytes(fixed(&payload, reader.offset)?))),
        TYPE_INT64 => Ok(TlvValue::Int64(i64::from_le_bytes(fixed(&payload, reader.offset)?))),
        TYPE_UINT8 => Ok(TlvValue::UInt8(u8::from_le_bytes(fixed(&payload, reader.offset)?))),
        TYPE_UINT16 => Ok(TlvValue::UInt16(u16::from_le_bytes(fixed(&payload, reader.offset)?))),
        TYPE_UINT32 => Ok(TlvValue::UInt32(u32::from_le_bytes(fixed(&payload, reader.offset)?))),
        TYPE_UINT64 => Ok(TlvValue::UInt64(u64::from_le_bytes(fixed(&payload, reader.offset)?))),
        TYPE_FLOAT32 => Ok(TlvValue::Float32(f32::from_le_bytes(fixed(&payload, reader.offset)?))),
        TYPE_FLOAT64 => Ok(TlvValue::Float64(f64::from_le_bytes(fixed(&payload, reader.offset)?))),
        TYPE_STRING => Ok(TlvValue::String(decode_utf8(payload, reader.offset)?)),
        TYPE_BYTES => Ok(TlvValue::Bytes(payload)),
        TYPE_BOOL => Ok(TlvValue::Bool(fixed::<1>(&payload, reader.offset)?[0] != 0)),
        TYPE_CUSTOM => Ok(TlvValue::Custom(payload)),
        TYPE_ARRAY => {
            let mut items = Vec::new();
            let mut inner = CountingReader::new(&payload[..]);
            while inner.remaining() > 0 {
                items.push(decode_from(&mut inner, depth + 1)?);
            }
            Ok(TlvValue::Array(items))
        }
        TYPE_MAP => {
            let mut entries = Vec::new();
            let mut inner = CountingReader::new(&payload[..]);
            while inner.remaining() > 0 {
                let key = decode_from(&mut inner, depth + 1)?;
                let key = key.as_str().map(str::to_string).ok_or_else(|| {
                    FragmentaError::decode("map key did not decode as a string", inner.offset)
                })?;
                let val = decode_from(&mut inner, depth + 1)?;
                entries.push((key, val));
            }
            Ok(TlvValue::Map(entries))
        }
        other => Err(FragmentaError::decode(
            format!("unknown TLV type code {other:#04x}"),
            reader.offset,
        )),
    }
}

fn fixed<const N: usize>(bytes: &[u8], offset: u64) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| FragmentaError::decode(format!("expected {N} bytes, got {}", bytes.len()), offset))
}

fn decode_utf8(bytes: Vec<u8>, offset: u64) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| FragmentaError::decode(format!("invalid utf-8: {e}"), offset))
}

/// A thin `Read` wrapper that tracks the number of bytes consumed, so
/// decode errors can report a byte offset (§4.1 `DecodeError{reason, offset}`).
pub struct CountingReader<R> {
    inner: R,
    offset: u64,
    len_hint: Option<usize>,
}

impl<'a> CountingReader<&'a [u8]> {
    pub fn new(bytes: &'a [u8]) -> Self {
        CountingReader {
            len_hint: Some(bytes.len()),
            inner: bytes,
            offset: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.len_hint.unwrap_or(0).saturating_sub(self.offset as usize)
    }
}

impl<R: Read> CountingReader<R> {
    fn read_u8_tracked(&mut self) -> Result<u8> {
        let v = self.inner.read_u8()?;
        self.offset += 1;
        Ok(v)
    }

    fn read_u16_tracked(&mut self) -> Result<u16> {
        let v = self.inner.read_u16::<LittleEndian>()?;
        self.offset += 2;
        Ok(v)
    }

    fn read_u32_tracked(&mut self) -> Result<u32> {
        let v = self.inner.read_u32::<LittleEndian>()?;
        self.offset += 4;
        Ok(v)
    }

    fn read_u64_tracked(&mut self) -> Result<u64> {
        let v = self.inner.read_u64::<LittleEndian>()?;
        self.offset += 8;
        Ok(v)
    }

    fn read_exact_tracked(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FragmentaError::decode("item truncated", self.offset)
            } else {
                FragmentaError::Io(e)
            }
        })?;
        self.offset += len as u64;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: TlvValue) {
        let bytes = encode(&value);
        let (decoded, consumed) = decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, value);
    }

    #[test]
    fn roundtrips_scalars() {
        roundtrip(TlvValue::Null);
        roundtrip(TlvValue::Bool(true));
        roundtrip(TlvValue::Bool(false));
        roundtrip(TlvValue::signed(-5));
        roundtrip(TlvValue::signed(40_000));
        roundtrip(TlvValue::unsigned(300));
        roundtrip(TlvValue::float(0.5));
        roundtrip(TlvValue::float(std::f64::consts::PI));
    }

    #[test]
    fn chooses_narrowest_integer_width() {
        assert!(matches!(TlvValue::signed(10), TlvValue::Int8(_)));
        assert!(matches!(TlvValue::signed(1000), TlvValue::Int16(_)));
        assert!(matches!(TlvValue::signed(100_000), TlvValue::Int32(_)));
        assert!(matches!(TlvValue::signed(i64::MAX), TlvValue::Int64(_)));
        assert!(matches!(TlvValue::unsigned(10), TlvValue::UInt8(_)));
        assert!(matches!(TlvValue::unsigned(70_000), TlvValue::UInt32(_)));
    }

    #[test]
    fn chooses_float32_only_when_exact() {
        assert!(matches!(TlvValue::float(0.5), TlvValue::Float32(_)));
        assert!(matches!(TlvValue::float(0.1), TlvValue::Float64(_)));
    }

    #[test]
    fn roundtrips_strings_and_bytes() {
        roundtrip(TlvValue::String(String::new()));
        roundtrip(TlvValue::String("测试数据".to_string()));
        roundtrip(TlvValue::Bytes(vec![]));
        roundtrip(TlvValue::Bytes(vec![1, 2, 3, 4]));
    }

    #[test]
    fn roundtrips_nested_array_and_map() {
        roundtrip(TlvValue::Array(vec![
            TlvValue::signed(1),
            TlvValue::String("a".into()),
            TlvValue::Array(vec![TlvValue::Bool(true)]),
        ]));
        roundtrip(TlvValue::Map(vec![
            ("a".to_string(), TlvValue::signed(1)),
            ("b".to_string(), TlvValue::String("x".to_string())),
        ]));
    }

    #[test]
    fn map_with_non_string_key_fails() {
        // Hand-craft a map whose "key" item is actually an integer.
        let mut body = Vec::new();
        encode_into(&TlvValue::signed(1), &mut body); // bogus key
        encode_into(&TlvValue::signed(2), &mut body); // value
        let mut item = Vec::new();
        write_item(&mut item, TYPE_MAP, &body);

        let err = decode(&item).unwrap_err();
        assert!(matches!(err, FragmentaError::Decode { .. }));
    }

    #[test]
    fn unknown_type_code_fails() {
        let bytes = vec![0xFF, 0, 0];
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FragmentaError::Decode { .. }));
    }

    #[test]
    fn truncated_item_fails() {
        let bytes = vec![TYPE_STRING, 0, 5, b'h', b'i']; // claims 5 bytes, has 2
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FragmentaError::Decode { .. }));
    }

    #[test]
    fn depth_limit_enforced() {
        // Build a chain of nested single-element arrays deeper than MAX_DEPTH.
        let mut value = TlvValue::Bool(true);
        for _ in 0..(MAX_DEPTH + 5) {
            value = TlvValue::Array(vec![value]);
        }
        let bytes = encode(&value);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FragmentaError::Decode { .. }));
    }
}
