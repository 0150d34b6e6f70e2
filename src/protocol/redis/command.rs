use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::com::{AsError, AsResult};
use crate::protocol::MergeType;

use super::codec::write_bulk;
use super::types::RespValue;

pub const SLOT_COUNT: u16 = 16384;

const ASKING_REQUEST: &[u8] = b"*1\r\n$6\r\nASKING\r\n";

/// Commands that need connection state or every shard at once.
const UNSUPPORTED: &[&[u8]] = &[
    b"AUTH",
    b"BGREWRITEAOF",
    b"BGSAVE",
    b"BLPOP",
    b"BRPOP",
    b"BRPOPLPUSH",
    b"CLIENT",
    b"CONFIG",
    b"DBSIZE",
    b"DEBUG",
    b"DISCARD",
    b"EXEC",
    b"FLUSHALL",
    b"FLUSHDB",
    b"KEYS",
    b"MIGRATE",
    b"MONITOR",
    b"MOVE",
    b"MSETNX",
    b"MULTI",
    b"PSUBSCRIBE",
    b"PUBLISH",
    b"PUNSUBSCRIBE",
    b"RANDOMKEY",
    b"RENAME",
    b"RENAMENX",
    b"SAVE",
    b"SCAN",
    b"SCRIPT",
    b"SELECT",
    b"SHUTDOWN",
    b"SLAVEOF",
    b"SUBSCRIBE",
    b"SYNC",
    b"UNSUBSCRIBE",
    b"UNWATCH",
    b"WAIT",
    b"WATCH",
];

#[derive(Clone, PartialEq, Eq)]
pub struct RedisCommand {
    parts: Vec<Bytes>,
}

impl fmt::Debug for RedisCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCommand")
            .field(
                "parts",
                &self
                    .parts
                    .iter()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl RedisCommand {
    pub fn new(parts: Vec<Bytes>) -> AsResult<Self> {
        if parts.is_empty() {
            return Err(AsError::BadMessage);
        }
        Ok(Self { parts })
    }

    pub fn from_resp(value: RespValue) -> AsResult<Self> {
        match value {
            RespValue::Array(values) => {
                let mut parts = Vec::with_capacity(values.len());
                for value in values {
                    match value {
                        RespValue::BulkString(data) | RespValue::SimpleString(data) => {
                            parts.push(data)
                        }
                        RespValue::Integer(int) => {
                            parts.push(Bytes::copy_from_slice(int.to_string().as_bytes()))
                        }
                        _ => return Err(AsError::BadMessage),
                    }
                }
                Self::new(parts)
            }
            _ => Err(AsError::BadMessage),
        }
    }

    pub fn command_name(&self) -> &[u8] {
        self.parts.first().map(|b| b.as_ref()).unwrap_or(&[])
    }

    pub fn primary_key(&self) -> &[u8] {
        self.parts.get(1).map(|b| b.as_ref()).unwrap_or(&[])
    }

    pub fn encode(&self, asking: bool, dst: &mut BytesMut) {
        if asking {
            dst.extend_from_slice(ASKING_REQUEST);
        }
        dst.extend_from_slice(b"*");
        dst.extend_from_slice(self.parts.len().to_string().as_bytes());
        dst.extend_from_slice(b"\r\n");
        for part in &self.parts {
            write_bulk(part, dst);
        }
    }
}

/// What the client side decoder decided for one command.
#[derive(Debug)]
pub enum Dispatch {
    /// Forward the sub-commands and fold the replies with the merge type.
    Forward(Vec<RedisCommand>, MergeType),
    /// Answer locally.
    Local(RespValue),
    /// Answer `+OK` and close the connection.
    Quit,
    Reject(AsError),
}

/// Split a client command into backend sub-commands.
pub fn dispatch(cmd: RedisCommand) -> Dispatch {
    let name = uppercase_name(cmd.command_name());
    let argc = cmd.parts.len();
    match name.as_slice() {
        b"PING" => match cmd.parts.get(1) {
            Some(echo) => Dispatch::Local(RespValue::BulkString(echo.clone())),
            None => Dispatch::Local(RespValue::simple("PONG")),
        },
        b"QUIT" => Dispatch::Quit,
        b"MGET" if argc >= 2 => Dispatch::Forward(
            split_keys(&cmd.parts[1..], Bytes::from_static(b"GET")),
            MergeType::Join,
        ),
        b"DEL" | b"UNLINK" | b"EXISTS" | b"TOUCH" if argc >= 2 => {
            let head = cmd.parts[0].clone();
            Dispatch::Forward(split_keys(&cmd.parts[1..], head), MergeType::Count)
        }
        b"MSET" if argc >= 3 && argc % 2 == 1 => {
            let subs = cmd.parts[1..]
                .chunks(2)
                .map(|pair| RedisCommand {
                    parts: vec![Bytes::from_static(b"SET"), pair[0].clone(), pair[1].clone()],
                })
                .collect();
            Dispatch::Forward(subs, MergeType::OkAll)
        }
        b"MGET" | b"DEL" | b"UNLINK" | b"EXISTS" | b"TOUCH" | b"MSET" => {
            Dispatch::Reject(AsError::BadMessage)
        }
        _ if UNSUPPORTED.contains(&name.as_slice()) => {
            Dispatch::Reject(AsError::RequestNotSupport)
        }
        _ if argc < 2 => Dispatch::Reject(AsError::RequestNotSupport),
        _ => Dispatch::Forward(vec![cmd], MergeType::Passthrough),
    }
}

fn split_keys(keys: &[Bytes], head: Bytes) -> Vec<RedisCommand> {
    keys.iter()
        .map(|key| RedisCommand {
            parts: vec![head.clone(), key.clone()],
        })
        .collect()
}

fn uppercase_name(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b.to_ascii_uppercase()).collect()
}

pub fn error_value(err: &AsError) -> RespValue {
    RespValue::Error(Bytes::from(format!("ERR {err}")))
}

/// Fold sub-replies, given in sub-command order, into the client reply.
pub fn merge_replies(
    merge: MergeType,
    replies: Vec<Option<Result<RespValue, AsError>>>,
) -> RespValue {
    let mut values = replies
        .into_iter()
        .map(|reply| match reply {
            Some(Ok(value)) => value,
            Some(Err(err)) => error_value(&err),
            None => error_value(&AsError::BadReply),
        });

    match merge {
        MergeType::Passthrough => values
            .next()
            .unwrap_or_else(|| error_value(&AsError::BadReply)),
        MergeType::Join => RespValue::Array(values.collect()),
        MergeType::Count => {
            let mut sum = 0i64;
            for value in values {
                match value {
                    RespValue::Integer(n) => sum = sum.saturating_add(n),
                    RespValue::Error(_) => return value,
                    _ => return error_value(&AsError::BadReply),
                }
            }
            RespValue::Integer(sum)
        }
        MergeType::OkAll => {
            for value in values {
                match value {
                    RespValue::SimpleString(ref s) if s.as_ref() == b"OK" => {}
                    RespValue::Error(_) => return value,
                    _ => return error_value(&AsError::BadReply),
                }
            }
            RespValue::ok()
        }
    }
}
