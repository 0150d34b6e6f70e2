use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::com::{AsError, AsResult};

use super::types::RespValue;

/// Deepest array nesting accepted from a peer.
pub const MAX_NESTING: usize = 64;
/// Largest bulk string accepted from a peer.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// RESP2 framing for whole values, used where a plain value stream is
/// enough: topology fetches and test harnesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = AsError;

    fn decode(&mut self, src: &mut BytesMut) -> AsResult<Option<Self::Item>> {
        decode_value(src)
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = AsError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> AsResult<()> {
        write_value(&item, dst);
        Ok(())
    }
}

/// Decode one value and advance `src` past it.
pub fn decode_value(src: &mut BytesMut) -> AsResult<Option<RespValue>> {
    let mut pos = 0usize;
    match parse_value(&src[..], &mut pos, 0)? {
        Some(frame) => {
            src.advance(pos);
            Ok(Some(frame))
        }
        None => Ok(None),
    }
}

pub(crate) fn parse_value(src: &[u8], pos: &mut usize, depth: usize) -> AsResult<Option<RespValue>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let start = *pos;
    let prefix = src[*pos];
    *pos += 1;

    match prefix {
        b'+' | b'-' | b':' => {
            let line = match read_line(src, pos) {
                Some(line) => line,
                None => {
                    *pos = start;
                    return Ok(None);
                }
            };
            let value = match prefix {
                b'+' => RespValue::SimpleString(Bytes::copy_from_slice(line)),
                b'-' => RespValue::Error(Bytes::copy_from_slice(line)),
                _ => RespValue::Integer(btoi::btoi::<i64>(line)?),
            };
            Ok(Some(value))
        }
        b'$' => parse_bulk_string(src, pos, start),
        b'*' => parse_array(src, pos, start, depth),
        _ => Err(AsError::BadMessage),
    }
}

fn parse_bulk_string(src: &[u8], pos: &mut usize, start: usize) -> AsResult<Option<RespValue>> {
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = btoi::btoi::<isize>(line)?;
    if len < 0 {
        return Ok(Some(RespValue::NullBulk));
    }
    let len = len as usize;
    if len > MAX_BULK_LEN {
        return Err(AsError::BadMessage);
    }
    let end = *pos + len;
    if end + 2 > src.len() {
        *pos = start;
        return Ok(None);
    }
    if &src[end..end + 2] != b"\r\n" {
        return Err(AsError::BadMessage);
    }
    let data = &src[*pos..end];
    *pos = end + 2;
    Ok(Some(RespValue::BulkString(Bytes::copy_from_slice(data))))
}

fn parse_array(src: &[u8], pos: &mut usize, start: usize, depth: usize) -> AsResult<Option<RespValue>> {
    if depth >= MAX_NESTING {
        return Err(AsError::BadMessage);
    }
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = btoi::btoi::<isize>(line)?;
    if len < 0 {
        return Ok(Some(RespValue::NullArray));
    }
    let mut values = Vec::with_capacity((len as usize).min(1024));
    for _ in 0..len {
        match parse_value(src, pos, depth + 1)? {
            Some(value) => values.push(value),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    Ok(Some(RespValue::Array(values)))
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    if *pos >= src.len() {
        return None;
    }
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Some(line);
        }
        idx += 1;
    }
    None
}

pub fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(data) => {
            dst.extend_from_slice(b"+");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Error(data) => {
            dst.extend_from_slice(b"-");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(value) => {
            dst.extend_from_slice(b":");
            dst.extend_from_slice(value.to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(data) => write_bulk(data, dst),
        RespValue::NullBulk => dst.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(values) => {
            dst.extend_from_slice(b"*");
            dst.extend_from_slice(values.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            for value in values {
                write_value(value, dst);
            }
        }
        RespValue::NullArray => dst.extend_from_slice(b"*-1\r\n"),
    }
}

pub fn write_bulk(data: &[u8], dst: &mut BytesMut) {
    dst.extend_from_slice(b"$");
    dst.extend_from_slice(data.len().to_string().as_bytes());
    dst.extend_from_slice(b"\r\n");
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nested_array_and_advances() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo\r\n:42\r\n+OK\r\n"[..]);
        let value = decode_value(&mut buf).unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![RespValue::bulk("foo"), RespValue::Integer(42)])
        );
        assert_eq!(&buf[..], b"+OK\r\n");
    }

    #[test]
    fn partial_frames_leave_buffer_untouched() {
        let raw = b"*2\r\n$3\r\nfoo\r\n$5\r\nba";
        let mut buf = BytesMut::from(&raw[..]);
        assert!(decode_value(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &raw[..]);
    }

    #[test]
    fn null_values_round_out() {
        let mut buf = BytesMut::from(&b"$-1\r\n*-1\r\n"[..]);
        assert_eq!(decode_value(&mut buf).unwrap(), Some(RespValue::NullBulk));
        assert_eq!(decode_value(&mut buf).unwrap(), Some(RespValue::NullArray));
    }

    #[test]
    fn rejects_unknown_prefix() {
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert_eq!(decode_value(&mut buf), Err(AsError::BadMessage));
    }

    #[test]
    fn rejects_deep_nesting() {
        let mut buf = BytesMut::from(&b"*1\r\n".repeat(200_000)[..]);
        assert_eq!(decode_value(&mut buf), Err(AsError::BadMessage));

        let mut nested = b"*1\r\n".repeat(MAX_NESTING - 1);
        nested.extend_from_slice(b":1\r\n");
        let mut buf = BytesMut::from(&nested[..]);
        assert!(decode_value(&mut buf).unwrap().is_some());
    }

    #[test]
    fn rejects_oversized_bulk_length() {
        let mut buf = BytesMut::from(&b"$9223372036854775807\r\nx\r\n"[..]);
        assert_eq!(decode_value(&mut buf), Err(AsError::BadMessage));
    }

    #[test]
    fn encodes_error_and_array() {
        let mut buf = BytesMut::new();
        let mut codec = RespCodec;
        codec
            .encode(
                RespValue::Array(vec![RespValue::error("ERR x"), RespValue::NullBulk]),
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], b"*2\r\n-ERR x\r\n$-1\r\n");
    }
}
