use std::fmt;

use bytes::{Buf, Bytes, BytesMut};

use crate::com::{AsError, AsResult};
use crate::protocol::MergeType;

const CRLF: &[u8] = b"\r\n";
const END: &[u8] = b"END\r\n";
const NOREPLY: &[u8] = b"noreply";
const MAX_KEY_LEN: usize = 250;
/// Largest data block accepted, memcached's `-I` ceiling.
pub const MAX_VALUE_LEN: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McKind {
    Get,
    Gets,
    Gat,
    Gats,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
    Delete,
    Incr,
    Decr,
    Touch,
}

impl McKind {
    fn from_name(name: &[u8]) -> Option<McKind> {
        let kind = match name {
            b"get" => McKind::Get,
            b"gets" => McKind::Gets,
            b"gat" => McKind::Gat,
            b"gats" => McKind::Gats,
            b"set" => McKind::Set,
            b"add" => McKind::Add,
            b"replace" => McKind::Replace,
            b"append" => McKind::Append,
            b"prepend" => McKind::Prepend,
            b"cas" => McKind::Cas,
            b"delete" => McKind::Delete,
            b"incr" => McKind::Incr,
            b"decr" => McKind::Decr,
            b"touch" => McKind::Touch,
            _ => return None,
        };
        Some(kind)
    }

    fn name(self) -> &'static [u8] {
        match self {
            McKind::Get => b"get",
            McKind::Gets => b"gets",
            McKind::Gat => b"gat",
            McKind::Gats => b"gats",
            McKind::Set => b"set",
            McKind::Add => b"add",
            McKind::Replace => b"replace",
            McKind::Append => b"append",
            McKind::Prepend => b"prepend",
            McKind::Cas => b"cas",
            McKind::Delete => b"delete",
            McKind::Incr => b"incr",
            McKind::Decr => b"decr",
            McKind::Touch => b"touch",
        }
    }

    /// Retrieval replies are `VALUE` blocks closed by `END`.
    pub fn is_retrieval(self) -> bool {
        matches!(self, McKind::Get | McKind::Gets | McKind::Gat | McKind::Gats)
    }
}

/// One backend-ready memcache request for a single key.
#[derive(Clone, PartialEq, Eq)]
pub struct McRequest {
    kind: McKind,
    key: Bytes,
    raw: Bytes,
}

impl fmt::Debug for McRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McRequest")
            .field("kind", &self.kind)
            .field("key", &String::from_utf8_lossy(&self.key))
            .finish()
    }
}

impl McRequest {
    pub fn kind(&self) -> McKind {
        self.kind
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Wire bytes sent to the backend.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn retrieval(kind: McKind, exptime: Option<&[u8]>, key: &[u8]) -> McRequest {
        let mut raw = BytesMut::with_capacity(key.len() + 16);
        raw.extend_from_slice(kind.name());
        if let Some(exptime) = exptime {
            raw.extend_from_slice(b" ");
            raw.extend_from_slice(exptime);
        }
        raw.extend_from_slice(b" ");
        raw.extend_from_slice(key);
        raw.extend_from_slice(CRLF);
        McRequest {
            kind,
            key: Bytes::copy_from_slice(key),
            raw: raw.freeze(),
        }
    }

    fn line(kind: McKind, fields: &[&[u8]], data: Option<&[u8]>) -> McRequest {
        let mut raw = BytesMut::new();
        raw.extend_from_slice(kind.name());
        for field in fields {
            raw.extend_from_slice(b" ");
            raw.extend_from_slice(field);
        }
        raw.extend_from_slice(CRLF);
        if let Some(data) = data {
            raw.extend_from_slice(data);
            raw.extend_from_slice(CRLF);
        }
        McRequest {
            kind,
            key: Bytes::copy_from_slice(fields[0]),
            raw: raw.freeze(),
        }
    }
}

/// Raw reply bytes of one request, terminator included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McReply(pub Bytes);

impl McReply {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_error(&self) -> bool {
        is_error_line(&self.0)
    }
}

/// Outcome of decoding one client command line.
#[derive(Debug)]
pub enum McDecoded {
    Forward {
        reqs: Vec<McRequest>,
        merge: MergeType,
        noreply: bool,
    },
    Version,
    Quit,
    Reject(AsError),
}

fn find_crlf(src: &[u8], from: usize) -> Option<usize> {
    src.get(from..)?
        .windows(2)
        .position(|w| w == CRLF)
        .map(|offset| from + offset)
}

pub(crate) fn legal_key(key: &[u8]) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.iter().all(|b| !b.is_ascii_control() && *b != b' ')
}

fn is_error_line(line: &[u8]) -> bool {
    line.starts_with(b"ERROR")
        || line.starts_with(b"CLIENT_ERROR")
        || line.starts_with(b"SERVER_ERROR")
}

fn numeric(field: &[u8]) -> bool {
    btoi::btou::<u64>(field).is_ok()
}

fn signed(field: &[u8]) -> bool {
    btoi::btoi::<i64>(field).is_ok()
}

/// Decode one client command. `Ok(None)` means more bytes are needed.
pub fn decode_command(src: &mut BytesMut) -> AsResult<Option<McDecoded>> {
    let line_end = match find_crlf(src, 0) {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let line = src[..line_end].to_vec();
    let fields: Vec<&[u8]> = line
        .split(|b| *b == b' ')
        .filter(|field| !field.is_empty())
        .collect();
    let name = match fields.first() {
        Some(name) => name.to_ascii_lowercase(),
        None => {
            src.advance(line_end + 2);
            return Ok(Some(McDecoded::Reject(AsError::BadMessage)));
        }
    };

    match name.as_slice() {
        b"version" => {
            src.advance(line_end + 2);
            return Ok(Some(McDecoded::Version));
        }
        b"quit" => {
            src.advance(line_end + 2);
            return Ok(Some(McDecoded::Quit));
        }
        _ => {}
    }

    let kind = match McKind::from_name(&name) {
        Some(kind) => kind,
        None => {
            src.advance(line_end + 2);
            return Ok(Some(McDecoded::Reject(AsError::RequestNotSupport)));
        }
    };

    let args = &fields[1..];
    let decoded = match kind {
        McKind::Get | McKind::Gets => decode_retrieval(kind, None, args),
        McKind::Gat | McKind::Gats => match args.split_first() {
            Some((exptime, keys)) if signed(exptime) => decode_retrieval(kind, Some(exptime), keys),
            _ => McDecoded::Reject(AsError::BadMessage),
        },
        McKind::Set
        | McKind::Add
        | McKind::Replace
        | McKind::Append
        | McKind::Prepend
        | McKind::Cas => {
            return decode_storage(src, kind, args, line_end);
        }
        McKind::Delete => decode_keyed(kind, args, 0, |_| true),
        McKind::Incr | McKind::Decr => decode_keyed(kind, args, 1, |fields| numeric(fields[0])),
        McKind::Touch => decode_keyed(kind, args, 1, |fields| signed(fields[0])),
    };
    src.advance(line_end + 2);
    Ok(Some(decoded))
}

fn decode_retrieval(kind: McKind, exptime: Option<&[u8]>, keys: &[&[u8]]) -> McDecoded {
    if keys.is_empty() {
        return McDecoded::Reject(AsError::BadMessage);
    }
    if !keys.iter().all(|key| legal_key(key)) {
        return McDecoded::Reject(AsError::BadKey);
    }
    McDecoded::Forward {
        reqs: keys
            .iter()
            .map(|key| McRequest::retrieval(kind, exptime, key))
            .collect(),
        merge: MergeType::Join,
        noreply: false,
    }
}

/// `<cmd> <key> <value fields..> [noreply]` with exactly `values` value fields.
fn decode_keyed<F>(kind: McKind, args: &[&[u8]], values: usize, check: F) -> McDecoded
where
    F: Fn(&[&[u8]]) -> bool,
{
    let (args, noreply) = strip_noreply(args);
    if args.len() != values + 1 {
        return McDecoded::Reject(AsError::BadMessage);
    }
    if !legal_key(args[0]) {
        return McDecoded::Reject(AsError::BadKey);
    }
    if !check(&args[1..]) {
        return McDecoded::Reject(AsError::BadMessage);
    }
    McDecoded::Forward {
        reqs: vec![McRequest::line(kind, args, None)],
        merge: MergeType::Passthrough,
        noreply,
    }
}

fn strip_noreply<'a, 'b>(args: &'a [&'b [u8]]) -> (&'a [&'b [u8]], bool) {
    match args.split_last() {
        Some((last, rest)) if *last == NOREPLY => (rest, true),
        _ => (args, false),
    }
}

/// `<cmd> <key> <flags> <exptime> <bytes> [cas unique] [noreply]\r\n<data>\r\n`
fn decode_storage(
    src: &mut BytesMut,
    kind: McKind,
    args: &[&[u8]],
    line_end: usize,
) -> AsResult<Option<McDecoded>> {
    let (args, noreply) = strip_noreply(args);
    let expect = if kind == McKind::Cas { 5 } else { 4 };
    let reject = |src: &mut BytesMut, err: AsError| {
        src.advance(line_end + 2);
        Ok(Some(McDecoded::Reject(err)))
    };
    if args.len() != expect {
        return reject(src, AsError::BadMessage);
    }
    if !legal_key(args[0]) {
        return reject(src, AsError::BadKey);
    }
    if !numeric(args[1]) || !signed(args[2]) || (kind == McKind::Cas && !numeric(args[4])) {
        return reject(src, AsError::BadMessage);
    }
    let len = match btoi::btou::<usize>(args[3]) {
        Ok(len) if len <= MAX_VALUE_LEN => len,
        _ => return reject(src, AsError::BadMessage),
    };

    let data_start = line_end + 2;
    let total = data_start + len + 2;
    if src.len() < total {
        return Ok(None);
    }
    if &src[data_start + len..total] != CRLF {
        src.advance(total);
        return Ok(Some(McDecoded::Reject(AsError::BadMessage)));
    }
    let req = McRequest::line(kind, args, Some(&src[data_start..data_start + len]));
    src.advance(total);
    Ok(Some(McDecoded::Forward {
        reqs: vec![req],
        merge: MergeType::Passthrough,
        noreply,
    }))
}

/// Decode the backend reply to `req`. `Ok(None)` means more bytes are needed.
pub fn decode_reply(req: &McRequest, src: &mut BytesMut) -> AsResult<Option<McReply>> {
    if !req.kind().is_retrieval() {
        return match find_crlf(src, 0) {
            Some(pos) => Ok(Some(McReply(src.split_to(pos + 2).freeze()))),
            None => Ok(None),
        };
    }

    let mut pos = 0usize;
    loop {
        let line_end = match find_crlf(src, pos) {
            Some(end) => end,
            None => return Ok(None),
        };
        let line = &src[pos..line_end];
        if line == b"END" || is_error_line(line) {
            return Ok(Some(McReply(src.split_to(line_end + 2).freeze())));
        }
        if !line.starts_with(b"VALUE ") {
            return Err(AsError::BadReply);
        }
        let len = line
            .split(|b| *b == b' ')
            .filter(|field| !field.is_empty())
            .nth(3)
            .ok_or(AsError::BadReply)
            .and_then(|field| btoi::btou::<usize>(field).map_err(|_| AsError::BadReply))?;
        if len > MAX_VALUE_LEN {
            return Err(AsError::BadReply);
        }
        let next = line_end + 2 + len + 2;
        if src.len() < next {
            return Ok(None);
        }
        pos = next;
    }
}

/// Fold retrieval replies: every `VALUE` block in key order and one `END`.
pub fn join_retrievals(replies: &[McReply], dst: &mut BytesMut) -> Result<(), McReply> {
    for reply in replies {
        if reply.is_error() {
            return Err(reply.clone());
        }
        let body = reply.as_bytes();
        dst.extend_from_slice(body.strip_suffix(END).unwrap_or(body));
    }
    dst.extend_from_slice(END);
    Ok(())
}
