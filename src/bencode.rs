//! Bencode encoder/decoder, see [BEP0003](https://www.bittorrent.org/beps/bep_0003.html).
//!
//! The decoder walks the byte buffer with a cursor rather than building on
//! `serde`: the wire format is small and fixed, and the invariants we must
//! enforce (sorted dict keys, no leading zeros, exact-length byte strings)
//! are easier to check directly against the bytes than to retrofit onto a
//! generic deserializer.

use crate::error::BencodeError;
use std::collections::BTreeMap;

const INT_START: u8 = b'i';
const LIST_START: u8 = b'l';
const DICT_START: u8 = b'd';
const END: u8 = b'e';
const STR_SEP: u8 = b':';

/// A bencode value: one of the four kinds the grammar allows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn as_int(&self) -> Result<i64, BencodeError> {
        match self {
            Value::Int(i) => Ok(*i),
            _ => Err(BencodeError::TypeMismatch {
                field: "value",
                expected: "int",
            }),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], BencodeError> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => Err(BencodeError::TypeMismatch {
                field: "value",
                expected: "bytes",
            }),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], BencodeError> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(BencodeError::TypeMismatch {
                field: "value",
                expected: "list",
            }),
        }
    }

    pub fn as_dict(&self) -> Result<&BTreeMap<Vec<u8>, Value>, BencodeError> {
        match self {
            Value::Dict(d) => Ok(d),
            _ => Err(BencodeError::TypeMismatch {
                field: "value",
                expected: "dict",
            }),
        }
    }

    /// Looks up a key in a dict value, failing with `TypeMismatch` if this
    /// isn't a dict and returning `None` if the key is absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<&Value>, BencodeError> {
        Ok(self.as_dict()?.get(key))
    }
}

/// Maximum number of ASCII digits accepted in an integer literal. Guards
/// against unbounded allocation from a hostile `i999999...e`.
const MAX_INT_DIGITS: usize = 100;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::Malformed(self.pos))
    }

    fn advance(&mut self) -> Result<u8, BencodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BencodeError> {
        let start = self.pos;
        let end = start
            .checked_add(n)
            .ok_or(BencodeError::Malformed(start))?;
        if end > self.buf.len() {
            return Err(BencodeError::Malformed(start));
        }
        self.pos = end;
        Ok(&self.buf[start..end])
    }

    fn read_until(&mut self, stop: u8) -> Result<&'a [u8], BencodeError> {
        let start = self.pos;
        loop {
            let b = self.advance()?;
            if b == stop {
                return Ok(&self.buf[start..self.pos - 1]);
            }
        }
    }
}

fn decode_uint(byte_ind: usize, digits: &[u8]) -> Result<u64, BencodeError> {
    if digits.is_empty() {
        return Err(BencodeError::Malformed(byte_ind));
    }
    if digits.len() > MAX_INT_DIGITS {
        return Err(BencodeError::Malformed(byte_ind));
    }
    if digits[0] == b'0' && digits.len() > 1 {
        return Err(BencodeError::Malformed(byte_ind));
    }
    let s = std::str::from_utf8(digits).map_err(|_| BencodeError::Malformed(byte_ind))?;
    s.parse::<u64>().map_err(|_| BencodeError::Malformed(byte_ind))
}

fn decode_int(cursor: &mut Cursor) -> Result<Value, BencodeError> {
    let start = cursor.pos;
    let raw = cursor.read_until(END)?;
    if raw.first() == Some(&b'-') {
        let digits = &raw[1..];
        if digits.first() == Some(&b'0') {
            // "-0" is rejected outright, regardless of trailing digits.
            return Err(BencodeError::Malformed(start));
        }
        let n = decode_uint(start, digits)? as i64;
        Ok(Value::Int(-n))
    } else {
        let n = decode_uint(start, raw)? as i64;
        Ok(Value::Int(n))
    }
}

fn decode_bytestring(cursor: &mut Cursor) -> Result<Vec<u8>, BencodeError> {
    let start = cursor.pos;
    let len_digits = cursor.read_until(STR_SEP)?;
    let len = decode_uint(start, len_digits)? as usize;
    Ok(cursor.take(len)?.to_vec())
}

fn decode_list(cursor: &mut Cursor) -> Result<Value, BencodeError> {
    let mut out = Vec::new();
    loop {
        if cursor.peek()? == END {
            cursor.pos += 1;
            return Ok(Value::List(out));
        }
        out.push(decode_value(cursor)?);
    }
}

fn decode_dict(cursor: &mut Cursor) -> Result<Value, BencodeError> {
    // Readers tolerate dicts whose keys arrive out of lexicographic order on
    // the wire; `BTreeMap` re-sorts them regardless. Only writers must emit
    // sorted keys (see `encode_into`).
    let mut out = BTreeMap::new();
    loop {
        if cursor.peek()? == END {
            cursor.pos += 1;
            return Ok(Value::Dict(out));
        }
        let key = decode_bytestring(cursor)?;
        let val = decode_value(cursor)?;
        out.insert(key, val);
    }
}

fn decode_value(cursor: &mut Cursor) -> Result<Value, BencodeError> {
    match cursor.peek()? {
        INT_START => {
            cursor.pos += 1;
            decode_int(cursor)
        }
        LIST_START => {
            cursor.pos += 1;
            decode_list(cursor)
        }
        DICT_START => {
            cursor.pos += 1;
            decode_dict(cursor)
        }
        b'0'..=b'9' => Ok(Value::Bytes(decode_bytestring(cursor)?)),
        _ => Err(BencodeError::Malformed(cursor.pos)),
    }
}

/// Decodes a single bencode value from the front of `buf`, returning the
/// value and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Value, usize), BencodeError> {
    if buf.is_empty() {
        return Err(BencodeError::Malformed(0));
    }
    let mut cursor = Cursor::new(buf);
    let value = decode_value(&mut cursor)?;
    Ok((value, cursor.pos))
}

/// Decodes a single bencode value, requiring that it consumes the entire
/// buffer with nothing left over.
pub fn decode_all(buf: &[u8]) -> Result<Value, BencodeError> {
    let (value, consumed) = decode(buf)?;
    if consumed != buf.len() {
        return Err(BencodeError::Malformed(consumed));
    }
    Ok(value)
}

/// Encodes a value, writing canonical (sorted-key) bencode bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(INT_START);
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(END);
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(STR_SEP);
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(LIST_START);
            for item in items {
                encode_into(item, out);
            }
            out.push(END);
        }
        Value::Dict(map) => {
            // `BTreeMap` already iterates in ascending key order, which is
            // exactly bencode's required lexicographic dict ordering.
            out.push(DICT_START);
            for (k, v) in map {
                encode_into(&Value::Bytes(k.clone()), out);
                encode_into(v, out);
            }
            out.push(END);
        }
    }
}
