mod codec;
mod command;
mod types;

use bytes::BytesMut;

pub use codec::{decode_value, write_value, RespCodec};
pub use command::{dispatch, merge_replies, Dispatch, RedisCommand, SLOT_COUNT};
pub use types::RespValue;

use crate::com::{AsError, AsResult};
use crate::protocol::{Protocol, Redirect};
use crate::proxy::message::{Message, MessageKind};

/// RESP2 front and back end, used by both `redis` and `redis_cluster`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisProtocol;

impl Protocol for RedisProtocol {
    type Request = RedisCommand;
    type Reply = RespValue;

    const NAME: &'static str = "redis";

    fn decode_message(src: &mut BytesMut) -> AsResult<Option<Message<Self>>> {
        let value = match decode_value(src)? {
            Some(value) => value,
            None => return Ok(None),
        };
        let cmd = match RedisCommand::from_resp(value) {
            Ok(cmd) => cmd,
            Err(err) => return Ok(Some(Message::failed(err))),
        };
        let msg = match dispatch(cmd) {
            Dispatch::Forward(subs, merge) => Message::new(subs, merge),
            Dispatch::Local(reply) => Message::local(reply),
            Dispatch::Quit => Message::local(RespValue::ok()).with_kind(MessageKind::Quit),
            Dispatch::Reject(err) => Message::failed(err),
        };
        Ok(Some(msg))
    }

    fn encode_message(msg: &Message<Self>, dst: &mut BytesMut) -> AsResult<()> {
        if let Some(err) = msg.error() {
            Self::encode_error(err, dst);
            return Ok(());
        }
        if let Some(reply) = msg.local_reply() {
            write_value(reply, dst);
            return Ok(());
        }
        let replies = msg.subs().iter().map(|cmd| cmd.result()).collect();
        write_value(&merge_replies(msg.merge(), replies), dst);
        Ok(())
    }

    fn encode_error(err: &AsError, dst: &mut BytesMut) {
        write_value(&command::error_value(err), dst);
    }

    fn request_key(req: &Self::Request) -> &[u8] {
        req.primary_key()
    }

    fn encode_request(req: &Self::Request, asking: bool, dst: &mut BytesMut) {
        req.encode(asking, dst);
    }

    fn decode_reply(_req: &Self::Request, src: &mut BytesMut) -> AsResult<Option<Self::Reply>> {
        decode_value(src)
    }

    fn redirect(reply: &Self::Reply) -> AsResult<Option<Redirect>> {
        parse_redirect(reply)
    }

    fn asking_acked(reply: &Self::Reply) -> bool {
        *reply == RespValue::ok()
    }

    fn ping_request() -> (&'static [u8], &'static [u8]) {
        (b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n")
    }
}

/// Parse `-MOVED <slot> <addr>` and `-ASK <slot> <addr>` replies.
pub fn parse_redirect(value: &RespValue) -> AsResult<Option<Redirect>> {
    let err = match value {
        RespValue::Error(err) => err,
        _ => return Ok(None),
    };
    let ask = if err.starts_with(b"MOVED ") {
        false
    } else if err.starts_with(b"ASK ") {
        true
    } else {
        return Ok(None);
    };

    let text = String::from_utf8_lossy(err);
    let mut parts = text.split_whitespace();
    let _ = parts.next();
    let slot = parts
        .next()
        .and_then(|slot| slot.parse::<u16>().ok())
        .filter(|slot| *slot < SLOT_COUNT)
        .ok_or(AsError::BadRedirect)?;
    let addr = parts
        .next()
        .map(|addr| addr.to_string())
        .ok_or(AsError::BadRedirect)?;
    if ask {
        Ok(Some(Redirect::Ask { slot, addr }))
    } else {
        Ok(Some(Redirect::Moved { slot, addr }))
    }
}
