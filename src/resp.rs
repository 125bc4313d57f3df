use crate::error::{ClientResult, ProtocolError, TransactionError};
use crate::framer::{LineCursor, MAX_LINE_LENGTH};
use std::fmt::Display;

/// A decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// +OK\r\n
    SimpleString(String),
    /// -ERR message\r\n
    Error(String),
    /// :1000\r\n
    Integer(i64),
    /// $6\r\nfoobar\r\n  or  $-1\r\n (null)
    BulkString(Option<String>),
    /// *2\r\n...  or  *-1\r\n (null)
    Array(Option<Vec<RespValue>>),
    /// A flat even-length array read as ordered key/value pairs.
    Map(Vec<(RespValue, RespValue)>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn bulk_string(data: impl Into<String>) -> Self {
        RespValue::BulkString(Some(data.into()))
    }

    pub fn null_bulk_string() -> Self {
        RespValue::BulkString(None)
    }

    pub fn array(items: Vec<RespValue>) -> Self {
        RespValue::Array(Some(items))
    }

    /// Text content of simple and bulk strings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::BulkString(Some(data)) => Some(data),
            RespValue::SimpleString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// Look up a key in a `Map` reply by its text.
    pub fn get(&self, key: &str) -> Option<&RespValue> {
        match self {
            RespValue::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Reinterpret a flat array as key/value pairs.
    ///
    /// Only non-empty arrays are converted; every other value passes through.
    pub fn into_object(self) -> Result<RespValue, TransactionError> {
        match self {
            RespValue::Array(Some(items)) if !items.is_empty() => {
                if items.len() % 2 != 0 {
                    return Err(TransactionError::OddObjectArity(items.len()));
                }
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    pairs.push((key, value));
                }
                Ok(RespValue::Map(pairs))
            }
            other => Ok(other),
        }
    }
}

/// Encode a command as a RESP array of bulk strings.
///
/// Tokens are anything printable; numbers go out in their decimal form.
pub fn encode_command<I, T>(tokens: I) -> Vec<u8>
where
    I: IntoIterator<Item = T>,
    T: Display,
{
    let args: Vec<String> = tokens.into_iter().map(|t| t.to_string()).collect();
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    write_header(&mut buf, b'*', args.len());
    for arg in &args {
        write_bulk(&mut buf, arg.as_bytes());
    }
    buf
}

/// Decode one reply from the buffered lines.
///
/// Returns `Ok(None)` when the lines run out before the reply is complete;
/// the caller should buffer at least `lines.needed()` bytes and decode again
/// from the start. When
/// `want_object` is set a top-level array is turned into a `Map`. An odd-length
/// array still has all of its elements consumed before the error is reported,
/// so `lines.position()` stays on a reply boundary.
pub fn decode(lines: &mut LineCursor<'_>, want_object: bool) -> ClientResult<Option<RespValue>> {
    let value = match decode_value(lines)? {
        Some(value) => value,
        None => return Ok(None),
    };
    if want_object {
        Ok(Some(value.into_object()?))
    } else {
        Ok(Some(value))
    }
}

/// Decode a complete reply held in memory. Missing lines are a protocol error.
pub fn decode_exact(data: &[u8], want_object: bool) -> ClientResult<RespValue> {
    let mut lines = LineCursor::new(data);
    decode(&mut lines, want_object)?.ok_or_else(|| ProtocolError::UnexpectedEnd.into())
}

fn decode_value(lines: &mut LineCursor<'_>) -> Result<Option<RespValue>, ProtocolError> {
    let line = match lines.next_line()? {
        Some(line) => line,
        None => return Ok(None),
    };
    let (&kind, rest) = line.split_first().ok_or(ProtocolError::EmptyLine)?;

    match kind {
        b'+' => Ok(Some(RespValue::SimpleString(text(rest)))),
        b'-' => Ok(Some(RespValue::Error(text(rest)))),
        b':' => Ok(Some(RespValue::Integer(parse_integer(rest)?))),
        b'$' => decode_bulk(lines, parse_integer(rest)?),
        b'*' => decode_array(lines, parse_integer(rest)?),
        other => Err(ProtocolError::InvalidByte(other)),
    }
}

fn decode_bulk(lines: &mut LineCursor<'_>, len: i64) -> Result<Option<RespValue>, ProtocolError> {
    if len == -1 {
        return Ok(Some(RespValue::BulkString(None)));
    }
    if len < -1 {
        return Err(ProtocolError::InvalidLength(len));
    }
    if len == 0 {
        // the empty payload still occupies its own line
        return Ok(lines
            .next_line()?
            .map(|_| RespValue::BulkString(Some(String::new()))));
    }

    let want = len as usize;
    let start = lines.position();
    let frame = want + 2;
    // Short of the whole payload no line inside it can trip the cap yet.
    if lines.remaining() < frame && lines.remaining() <= MAX_LINE_LENGTH {
        lines.require(start + frame);
        return Ok(None);
    }

    let mut data: Vec<u8> = Vec::new();
    let mut first = true;
    while data.len() < want {
        let line = match lines.next_line()? {
            Some(line) => line,
            None => {
                lines.require(start + frame);
                return Ok(None);
            }
        };
        // A CRLF inside the payload split it into several lines; put it back.
        if !first {
            data.extend_from_slice(b"\r\n");
        }
        first = false;
        data.extend_from_slice(line);
    }
    data.truncate(want);
    Ok(Some(RespValue::BulkString(Some(
        String::from_utf8_lossy(&data).into_owned(),
    ))))
}

fn decode_array(lines: &mut LineCursor<'_>, len: i64) -> Result<Option<RespValue>, ProtocolError> {
    if len < 0 {
        return Ok(Some(RespValue::Array(None)));
    }

    let len = len as usize;
    let mut items = Vec::with_capacity(len.min(1024));
    for index in 0..len {
        match decode_value(lines)? {
            Some(item) => items.push(item),
            None => {
                // every element left takes at least "+\r\n"
                let end = lines.position().saturating_add((len - index).saturating_mul(3));
                lines.require(end);
                return Ok(None);
            }
        }
    }
    Ok(Some(RespValue::Array(Some(items))))
}

fn parse_integer(data: &[u8]) -> Result<i64, ProtocolError> {
    let s = std::str::from_utf8(data)
        .map_err(|_| ProtocolError::InvalidInteger(text(data)))?;
    s.trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidInteger(s.to_string()))
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn write_header(buf: &mut Vec<u8>, kind: u8, len: usize) {
    buf.push(kind);
    buf.extend_from_slice(len.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
}

fn write_bulk(buf: &mut Vec<u8>, data: &[u8]) {
    write_header(buf, b'$', data.len());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}
