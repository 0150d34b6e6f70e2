mod msg;

use bytes::{Bytes, BytesMut};

pub use msg::{decode_command, decode_reply, join_retrievals, McDecoded, McKind, McReply, McRequest};

use crate::com::{AsError, AsResult};
use crate::protocol::{MergeType, Protocol};
use crate::proxy::message::{Message, MessageKind};

const VERSION_REPLY: &str = concat!("VERSION shardline-", env!("CARGO_PKG_VERSION"), "\r\n");

/// Memcache text protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct McProtocol;

impl Protocol for McProtocol {
    type Request = McRequest;
    type Reply = McReply;

    const NAME: &'static str = "memcache";

    fn decode_message(src: &mut BytesMut) -> AsResult<Option<Message<Self>>> {
        let decoded = match decode_command(src)? {
            Some(decoded) => decoded,
            None => return Ok(None),
        };
        let msg = match decoded {
            McDecoded::Forward {
                reqs,
                merge,
                noreply,
            } => {
                let msg = Message::new(reqs, merge);
                if noreply {
                    msg.with_kind(MessageKind::Silent)
                } else {
                    msg
                }
            }
            McDecoded::Version => Message::local(McReply(Bytes::from_static(VERSION_REPLY.as_bytes()))),
            McDecoded::Quit => Message::local(McReply(Bytes::new())).with_kind(MessageKind::Quit),
            McDecoded::Reject(err) => Message::failed(err),
        };
        Ok(Some(msg))
    }

    fn encode_message(msg: &Message<Self>, dst: &mut BytesMut) -> AsResult<()> {
        if let Some(err) = msg.error() {
            Self::encode_error(err, dst);
            return Ok(());
        }
        if msg.kind() == MessageKind::Silent {
            return Ok(());
        }
        if let Some(reply) = msg.local_reply() {
            dst.extend_from_slice(reply.as_bytes());
            return Ok(());
        }

        let mut replies = Vec::with_capacity(msg.subs().len());
        for cmd in msg.subs() {
            match cmd.result() {
                Some(Ok(reply)) => replies.push(reply),
                Some(Err(err)) => {
                    Self::encode_error(&err, dst);
                    return Ok(());
                }
                None => {
                    Self::encode_error(&AsError::BadReply, dst);
                    return Ok(());
                }
            }
        }

        match msg.merge() {
            MergeType::Join => {
                let mut joined = BytesMut::new();
                match join_retrievals(&replies, &mut joined) {
                    Ok(()) => dst.extend_from_slice(&joined),
                    Err(failed) => dst.extend_from_slice(failed.as_bytes()),
                }
            }
            _ => match replies.first() {
                Some(reply) => dst.extend_from_slice(reply.as_bytes()),
                None => Self::encode_error(&AsError::BadReply, dst),
            },
        }
        Ok(())
    }

    fn encode_error(err: &AsError, dst: &mut BytesMut) {
        match err {
            AsError::RequestNotSupport => dst.extend_from_slice(b"ERROR\r\n"),
            AsError::BadMessage | AsError::BadKey => {
                dst.extend_from_slice(format!("CLIENT_ERROR {err}\r\n").as_bytes())
            }
            _ => dst.extend_from_slice(format!("SERVER_ERROR {err}\r\n").as_bytes()),
        }
    }

    fn request_key(req: &Self::Request) -> &[u8] {
        req.key()
    }

    fn encode_request(req: &Self::Request, _asking: bool, dst: &mut BytesMut) {
        dst.extend_from_slice(req.raw());
    }

    fn decode_reply(req: &Self::Request, src: &mut BytesMut) -> AsResult<Option<Self::Reply>> {
        decode_reply(req, src)
    }

    fn ping_request() -> (&'static [u8], &'static [u8]) {
        (b"set _ping 0 0 4\r\npong\r\n", b"STORED\r\n")
    }
}
