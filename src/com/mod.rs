use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;

/// Default deadline for dialing a backend, in milliseconds.
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 1_000;
/// Default deadline for a single backend read, in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1_000;
/// Default deadline for flushing a batch group to a backend, in milliseconds.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_NODE_CONNECTIONS: usize = 2;

pub const DEFAULT_PING_FAIL_LIMIT: usize = 3;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_PING_QUARANTINE_MS: u64 = 300_000;

pub const DEFAULT_FETCH_INTERVAL_MS: u64 = 60_000;
/// Messages slower than this many microseconds land in the slowlog.
pub const DEFAULT_SLOWLOG_SLOWER_THAN_US: i64 = 10_000;

/// Errors raised inside the proxy core.
///
/// The type is `Clone` because a single transport failure is attached to
/// every command that was riding on the broken connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AsError {
    #[error("config is bad for fields {0}")]
    BadConfig(String),

    #[error("invalid message")]
    BadMessage,

    #[error("invalid key")]
    BadKey,

    #[error("request not support")]
    RequestNotSupport,

    #[error("message reply is bad")]
    BadReply,

    #[error("no backend available")]
    NoBackend,

    #[error("slot {0} is not covered by any node")]
    SlotUncovered(u16),

    #[error("fail to dial backend {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("backend io error: {0}")]
    BackendIo(String),

    #[error("remote connection has active close connection {0}")]
    BackendClosed(String),

    #[error("backend request timed out")]
    Timeout,

    #[error("fail due redirect too much")]
    RedirectLimit,

    #[error("fail to parse redirect reply")]
    BadRedirect,

    #[error("forwarder has been closed")]
    ForwarderClosed,

    #[error("fail to init cluster {0} due to all seed nodes is die")]
    ClusterAllSeedsDie(String),
}

impl AsError {
    /// Timeouts are transient: the connection they happened on is kept.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AsError::Timeout)
    }

    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            AsError::Timeout => "timeout",
            AsError::Dial { .. } => "dial",
            AsError::BackendIo(_) => "io",
            AsError::BackendClosed(_) => "closed",
            AsError::BadReply => "protocol",
            AsError::RedirectLimit | AsError::BadRedirect => "redirect",
            AsError::NoBackend | AsError::SlotUncovered(_) => "route",
            _ => "other",
        }
    }
}

impl From<io::Error> for AsError {
    fn from(err: io::Error) -> AsError {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => AsError::Timeout,
            io::ErrorKind::UnexpectedEof => AsError::BackendClosed(err.to_string()),
            _ => AsError::BackendIo(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for AsError {
    fn from(_: tokio::time::error::Elapsed) -> AsError {
        AsError::Timeout
    }
}

impl From<btoi::ParseIntegerError> for AsError {
    fn from(_: btoi::ParseIntegerError) -> AsError {
        AsError::BadMessage
    }
}

pub type AsResult<T> = Result<T, AsError>;

/// Bind a listener with `SO_REUSEADDR` (and `SO_REUSEPORT` on unix) set.
/// Must run inside a tokio runtime.
pub fn create_reuse_port_listener(addr: &SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_map_to_transient_errors() {
        let err: AsError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(err.is_timeout());
        let err: AsError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(!err.is_timeout());
        assert_eq!(err.kind(), "io");
    }

    #[tokio::test]
    async fn reuse_port_listener_binds_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = match create_reuse_port_listener(&addr) {
            Ok(listener) => listener,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => return,
            Err(err) => panic!("bind failed: {err}"),
        };
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn no_backend_message_is_stable() {
        assert_eq!(AsError::NoBackend.to_string(), "no backend available");
    }
}
