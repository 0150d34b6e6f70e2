use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::com::AsError;
use crate::protocol::{MergeType, Protocol};

struct CommandState<R> {
    result: Option<Result<R, AsError>>,
    sent_at: Option<Instant>,
    recv_at: Option<Instant>,
}

/// One backend-visible sub-request.
///
/// Shared between the connection handler, which owns the enclosing
/// [`Message`], and the pipeline serving the current round trip.
pub struct Command<P: Protocol> {
    req: P::Request,
    state: Mutex<CommandState<P::Reply>>,
    redirects: AtomicU8,
    asking: AtomicBool,
}

impl<P: Protocol> fmt::Debug for Command<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("req", &self.req)
            .field("redirects", &self.redirects.load(Ordering::Relaxed))
            .finish()
    }
}

impl<P: Protocol> Command<P> {
    pub fn new(req: P::Request) -> Self {
        Self {
            req,
            state: Mutex::new(CommandState {
                result: None,
                sent_at: None,
                recv_at: None,
            }),
            redirects: AtomicU8::new(0),
            asking: AtomicBool::new(false),
        }
    }

    pub fn request(&self) -> &P::Request {
        &self.req
    }

    pub fn key(&self) -> &[u8] {
        P::request_key(&self.req)
    }

    pub fn set_reply(&self, reply: P::Reply) {
        self.state.lock().result = Some(Ok(reply));
    }

    pub fn set_error(&self, err: AsError) {
        self.state.lock().result = Some(Err(err));
    }

    pub fn result(&self) -> Option<Result<P::Reply, AsError>> {
        self.state.lock().result.clone()
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().result.is_some()
    }

    pub fn mark_write(&self) {
        self.state.lock().sent_at = Some(Instant::now());
    }

    pub fn mark_read(&self) {
        self.state.lock().recv_at = Some(Instant::now());
    }

    /// Time between the last flush and the reply being read.
    pub fn remote_elapsed(&self) -> Option<Duration> {
        let state = self.state.lock();
        match (state.sent_at, state.recv_at) {
            (Some(sent), Some(recv)) => Some(recv.saturating_duration_since(sent)),
            _ => None,
        }
    }

    pub fn is_asking(&self) -> bool {
        self.asking.load(Ordering::Acquire)
    }

    pub fn set_asking(&self, asking: bool) {
        self.asking.store(asking, Ordering::Release);
    }

    /// Count one more redirect and return the new total.
    pub fn add_redirect(&self) -> u8 {
        self.redirects.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    pub fn redirects(&self) -> u8 {
        self.redirects.load(Ordering::Acquire)
    }
}

/// Extra handling a message needs beyond forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Normal,
    /// Forwarded, but the client asked for no reply.
    Silent,
    /// Close the client connection after flushing earlier replies.
    Quit,
}

/// One client-visible unit of work.
pub struct Message<P: Protocol> {
    subs: Vec<Arc<Command<P>>>,
    merge: MergeType,
    kind: MessageKind,
    local: Option<P::Reply>,
    error: Option<AsError>,
    start: Instant,
    end: Option<Instant>,
}

impl<P: Protocol> fmt::Debug for Message<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subs", &self.subs)
            .field("merge", &self.merge)
            .field("kind", &self.kind)
            .field("local", &self.local)
            .field("error", &self.error)
            .finish()
    }
}

impl<P: Protocol> Message<P> {
    pub fn new(reqs: Vec<P::Request>, merge: MergeType) -> Self {
        Self {
            subs: reqs
                .into_iter()
                .map(|req| Arc::new(Command::new(req)))
                .collect(),
            merge,
            kind: MessageKind::Normal,
            local: None,
            error: None,
            start: Instant::now(),
            end: None,
        }
    }

    pub fn single(req: P::Request) -> Self {
        Self::new(vec![req], MergeType::Passthrough)
    }

    /// A message answered by the proxy itself.
    pub fn local(reply: P::Reply) -> Self {
        let mut msg = Self::new(Vec::new(), MergeType::Passthrough);
        msg.local = Some(reply);
        msg
    }

    /// A message answered by the proxy with an error.
    pub fn failed(err: AsError) -> Self {
        let mut msg = Self::new(Vec::new(), MergeType::Passthrough);
        msg.error = Some(err);
        msg
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn subs(&self) -> &[Arc<Command<P>>] {
        &self.subs
    }

    pub fn merge(&self) -> MergeType {
        self.merge
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn local_reply(&self) -> Option<&P::Reply> {
        self.local.as_ref()
    }

    /// Whether the message needs a backend at all.
    pub fn is_forwarded(&self) -> bool {
        !self.subs.is_empty() && self.error.is_none()
    }

    pub fn set_error(&mut self, err: AsError) {
        self.error = Some(err);
    }

    pub fn error(&self) -> Option<&AsError> {
        self.error.as_ref()
    }

    pub fn mark_end(&mut self) {
        self.end = Some(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        self.end
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.start)
    }
}
