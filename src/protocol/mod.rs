pub mod mc;
pub mod redis;

use std::fmt;

use bytes::BytesMut;

use crate::com::{AsError, AsResult};
use crate::proxy::message::Message;

/// How the sub-replies of a split message are folded back into one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeType {
    /// Single sub-request, reply forwarded as is.
    Passthrough,
    /// Sum of integer replies (DEL, EXISTS, ...).
    Count,
    /// Ordered concatenation of sub-replies (MGET, memcache get).
    Join,
    /// `+OK` only when every sub-reply is `+OK` (MSET).
    OkAll,
}

/// Cluster redirection parsed out of a backend error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Moved { slot: u16, addr: String },
    Ask { slot: u16, addr: String },
}

impl Redirect {
    pub fn addr(&self) -> &str {
        match self {
            Redirect::Moved { addr, .. } | Redirect::Ask { addr, .. } => addr,
        }
    }

    pub fn is_ask(&self) -> bool {
        matches!(self, Redirect::Ask { .. })
    }
}

/// Wire protocol spoken on both sides of the proxy.
///
/// Client side: `decode_message` splits one client command into routable
/// sub-requests and `encode_message` folds the sub-replies back. Backend
/// side: `encode_request` and `decode_reply` frame one sub-request and its
/// reply; replies are matched to requests purely by order.
pub trait Protocol: Send + Sync + Sized + 'static {
    type Request: Send + Sync + fmt::Debug + 'static;
    type Reply: Send + Sync + Clone + fmt::Debug + 'static;

    const NAME: &'static str;

    /// Decode one client message. `Ok(None)` means more bytes are needed.
    fn decode_message(src: &mut BytesMut) -> AsResult<Option<Message<Self>>>;

    /// Encode the reply of a finished message.
    fn encode_message(msg: &Message<Self>, dst: &mut BytesMut) -> AsResult<()>;

    /// Encode an error reply for a message that could not be decoded.
    fn encode_error(err: &AsError, dst: &mut BytesMut);

    /// Routing key of a sub-request.
    fn request_key(req: &Self::Request) -> &[u8];

    /// Encode a sub-request for a backend, preceded by `ASKING` when asked.
    fn encode_request(req: &Self::Request, asking: bool, dst: &mut BytesMut);

    /// Decode one backend reply to `req`. `Ok(None)` means more bytes are needed.
    fn decode_reply(req: &Self::Request, src: &mut BytesMut) -> AsResult<Option<Self::Reply>>;

    /// Cluster redirect carried by a reply, if any.
    fn redirect(_reply: &Self::Reply) -> AsResult<Option<Redirect>> {
        Ok(None)
    }

    /// Whether the reply to an `ASKING` prefix accepted it.
    fn asking_acked(_reply: &Self::Reply) -> bool {
        true
    }

    /// Liveness check request and the exact reply expected for it.
    fn ping_request() -> (&'static [u8], &'static [u8]);
}
