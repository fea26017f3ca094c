//! ## SERIALIZER / PARSER
//! **HTSP binary wire format**
//!
//! Outer frame: `length: u32 BE` followed by that many bytes of a field
//! list. Each field is `type: u8, namelen: u8, datalen: u32 BE, name:
//! namelen bytes, data: datalen bytes`. A root [`Message`] is encoded
//! directly as a field list with no enclosing Map field; a nested `Map` or
//! `List` value is the same field-list encoding recursively, with `List`
//! fields carrying an empty name.
//!
//! All multi-byte lengths are big-endian, matching HTSP (not the host's
//! native order).

use crate::error::HtspError;
use crate::message::{Message, Value};

const TYPE_MAP: u8 = 1;
const TYPE_S64: u8 = 2;
const TYPE_STR: u8 = 3;
const TYPE_BIN: u8 = 4;
const TYPE_LIST: u8 = 5;

/// Encodes a complete message into a ready-to-write frame: four-byte
/// big-endian length prefix followed by the field list.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let body = encode_fields(msg.fields());
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Decodes a frame body (length prefix already stripped by the [Reader])
/// into a [Message].
///
/// [Reader]: crate::reader::Reader
pub fn decode_message(body: &[u8]) -> Result<Message, HtspError> {
    let fields = decode_fields(body)?;
    Ok(Message::new().with_fields(fields))
}

fn encode_fields(fields: &[(String, Value)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in fields {
        encode_field(&mut out, name, value);
    }
    out
}

fn encode_field(out: &mut Vec<u8>, name: &str, value: &Value) {
    let name_bytes = name.as_bytes();
    debug_assert!(name_bytes.len() <= u8::MAX as usize, "field name too long to encode");

    let (type_byte, data): (u8, Vec<u8>) = match value {
        Value::S64(v) => (TYPE_S64, encode_s64(*v)),
        Value::Str(b) => (TYPE_STR, b.clone()),
        Value::Bin(b) => (TYPE_BIN, b.clone()),
        Value::List(items) => {
            let mut body = Vec::new();
            for item in items {
                encode_field(&mut body, "", item);
            }
            (TYPE_LIST, body)
        }
        Value::Map(msg) => (TYPE_MAP, encode_fields(msg.fields())),
    };

    out.push(type_byte);
    out.push(name_bytes.len() as u8);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(name_bytes);
    out.extend_from_slice(&data);
}

fn decode_fields(mut bytes: &[u8]) -> Result<Vec<(String, Value)>, HtspError> {
    let mut fields = Vec::new();
    while !bytes.is_empty() {
        let (field, rest) = decode_field(bytes)?;
        fields.push(field);
        bytes = rest;
    }
    Ok(fields)
}

fn decode_field(bytes: &[u8]) -> Result<((String, Value), &[u8]), HtspError> {
    if bytes.len() < 6 {
        return Err(HtspError::Malformed("truncated field header".into()));
    }
    let type_byte = bytes[0];
    let namelen = bytes[1] as usize;
    let datalen = u32::from_be_bytes(bytes[2..6].try_into().unwrap()) as usize;
    let rest = &bytes[6..];

    if rest.len() < namelen + datalen {
        return Err(HtspError::Malformed("field sub-length exceeds container".into()));
    }
    let name_bytes = &rest[..namelen];
    let data = &rest[namelen..namelen + datalen];
    let tail = &rest[namelen + datalen..];

    // Field names are always plain ASCII identifiers in practice; treat
    // invalid UTF-8 here (not in a string *value*) as framing corruption.
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| HtspError::Malformed("field name is not valid utf-8".into()))?
        .to_string();

    let value = match type_byte {
        TYPE_MAP => Value::Map(Message::new().with_fields(decode_fields(data)?)),
        TYPE_S64 => Value::S64(decode_s64(data)),
        TYPE_STR => Value::Str(data.to_vec()),
        TYPE_BIN => Value::Bin(data.to_vec()),
        TYPE_LIST => {
            let items = decode_fields(data)?.into_iter().map(|(_, v)| v).collect();
            Value::List(items)
        }
        other => return Err(HtspError::Malformed(format!("unknown field type byte {other}"))),
    };

    Ok(((name, value), tail))
}

/// Minimum-byte big-endian signed representation; `0` encodes to zero bytes.
fn encode_s64(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let full = value.to_be_bytes();
    for n in 1..=8 {
        let candidate = &full[8 - n..];
        if sign_extend(candidate) == value {
            return candidate.to_vec();
        }
    }
    full.to_vec()
}

fn decode_s64(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        0
    } else {
        sign_extend(bytes)
    }
}

fn sign_extend(bytes: &[u8]) -> i64 {
    let mut buf = if bytes[0] & 0x80 != 0 { [0xFFu8; 8] } else { [0u8; 8] };
    buf[8 - bytes.len()..].copy_from_slice(bytes);
    i64::from_be_bytes(buf)
}

impl Message {
    fn with_fields(mut self, fields: Vec<(String, Value)>) -> Self {
        for (k, v) in fields {
            self.set(k, v);
        }
        self
    }
}
