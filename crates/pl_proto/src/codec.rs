//! Varint and tagged-field primitives, wire-compatible with protobuf.
//!
//! A field is `(field_number << 3) | wire_type` as a varint, followed by the
//! payload. Readers skip unknown fields of any supported wire type, which
//! keeps old parsers working when the record grows.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated record")]
    Truncated,

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u8),

    #[error("required field missing: {0}")]
    FieldMissing(&'static str),

    #[error("field {0} has unexpected length")]
    FieldLength(u32),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

// ── Writing ──────────────────────────────────────────────────────────────────

pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_tag(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    put_varint(buf, (u64::from(field) << 3) | u64::from(wire_type));
}

pub fn put_uint_field(buf: &mut Vec<u8>, field: u32, value: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, value);
}

pub fn put_bytes_field(buf: &mut Vec<u8>, field: u32, data: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn put_string_field(buf: &mut Vec<u8>, field: u32, value: &str) {
    put_bytes_field(buf, field, value.as_bytes());
}

// ── Reading ──────────────────────────────────────────────────────────────────

pub fn get_varint(data: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i == 10 {
            return Err(CodecError::VarintOverflow);
        }
        if i == 9 && byte > 1 {
            return Err(CodecError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CodecError::Truncated)
}

pub enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

pub struct Field<'a> {
    pub number: u32,
    pub value: FieldValue<'a>,
}

/// Sequential reader over a tagged record. Fixed-width fields are consumed
/// and skipped; the caller only ever sees varint and length-delimited
/// values.
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn next_field(&mut self) -> Result<Option<Field<'a>>, CodecError> {
        loop {
            if self.pos >= self.data.len() {
                return Ok(None);
            }
            let (key, used) = get_varint(&self.data[self.pos..])?;
            self.pos += used;

            let number = (key >> 3) as u32;
            let wire_type = (key & 0x7) as u8;
            match wire_type {
                WIRE_VARINT => {
                    let (value, used) = get_varint(&self.data[self.pos..])?;
                    self.pos += used;
                    return Ok(Some(Field { number, value: FieldValue::Varint(value) }));
                }
                WIRE_LEN => {
                    let (len, used) = get_varint(&self.data[self.pos..])?;
                    self.pos += used;
                    let len = usize::try_from(len).map_err(|_| CodecError::Truncated)?;
                    if self.data.len() - self.pos < len {
                        return Err(CodecError::Truncated);
                    }
                    let bytes = &self.data[self.pos..self.pos + len];
                    self.pos += len;
                    return Ok(Some(Field { number, value: FieldValue::Bytes(bytes) }));
                }
                WIRE_FIXED64 => {
                    if self.data.len() - self.pos < 8 {
                        return Err(CodecError::Truncated);
                    }
                    self.pos += 8;
                }
                WIRE_FIXED32 => {
                    if self.data.len() - self.pos < 4 {
                        return Err(CodecError::Truncated);
                    }
                    self.pos += 4;
                }
                other => return Err(CodecError::UnsupportedWireType(other)),
            }
        }
    }
}
