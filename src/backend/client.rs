use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::metrics;

/// Sequential identifier for frontend client connections, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Keeps the per-cluster frontend connection gauge in step with a session.
pub struct FrontConnectionGuard {
    cluster: Arc<str>,
}

impl FrontConnectionGuard {
    pub fn new(cluster: Arc<str>) -> Self {
        metrics::front_conn_open(&cluster);
        Self { cluster }
    }
}

impl Drop for FrontConnectionGuard {
    fn drop(&mut self) {
        metrics::front_conn_close(&self.cluster);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_monotonic() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert!(b.as_u64() > a.as_u64());
        assert_eq!(b.to_string(), format!("client-{}", b.as_u64()));
    }

    #[test]
    fn front_connection_guard_tracks_session_lifetime() {
        let cluster: Arc<str> = "guard-cluster".into();
        let initial_current = metrics::front_connections_current(&cluster);
        let initial_total = metrics::front_connections_total(&cluster);

        let guards: Vec<_> = (0..2)
            .map(|_| FrontConnectionGuard::new(cluster.clone()))
            .collect();
        assert_eq!(
            metrics::front_connections_current(&cluster),
            initial_current + 2
        );
        drop(guards);

        assert_eq!(metrics::front_connections_current(&cluster), initial_current);
        assert_eq!(metrics::front_connections_total(&cluster), initial_total + 2);
    }
}
