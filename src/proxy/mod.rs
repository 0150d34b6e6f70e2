pub mod batch;
pub mod handler;
pub mod message;
pub mod reload;

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::dialer::Dialer;
use crate::cluster::ClusterForwarder;
use crate::com::{AsError, AsResult};
use crate::config::{CacheType, ClusterConfig};
use crate::protocol::Protocol;
use crate::standalone::StandaloneForwarder;

use self::batch::BatchAllocator;
use self::message::Message;

/// Routes decoded messages to backend pipelines.
#[async_trait]
pub trait Forwarder<P: Protocol>: Send + Sync + 'static {
    /// Route every sub-command of `msgs` into `alloc` and hand the batches
    /// to their pipelines. Completion is observed through `alloc`.
    async fn forward(&self, alloc: &mut BatchAllocator<P>, msgs: &[Message<P>]) -> AsResult<()>;

    /// Stop background tasks and drop backend pipelines.
    fn close(&self);
}

/// Build the forwarder variant matching `cc.cache_type`.
pub async fn build_forwarder<P: Protocol>(
    cc: &ClusterConfig,
    dialer: Arc<dyn Dialer>,
) -> AsResult<Arc<dyn Forwarder<P>>> {
    let forwarder: Arc<dyn Forwarder<P>> = match cc.cache_type {
        CacheType::Memcache | CacheType::Redis => Arc::new(StandaloneForwarder::<P>::new(cc, dialer)?),
        CacheType::RedisCluster => Arc::new(ClusterForwarder::<P>::connect(cc, dialer).await?),
    };
    Ok(forwarder)
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Open,
    Closed,
}

/// Reference-counted owner of one forwarder generation.
///
/// Connections take a reference for each request cycle. Once the handle is
/// closed and the last reference is released, the forwarder is closed
/// exactly once.
pub struct ForwarderHandle<P: Protocol> {
    cluster: Arc<str>,
    generation: u64,
    inner: Arc<dyn Forwarder<P>>,
    state: AtomicU8,
    refs: AtomicUsize,
    torn_down: AtomicBool,
}

impl<P: Protocol> ForwarderHandle<P> {
    pub fn new(cluster: Arc<str>, generation: u64, inner: Arc<dyn Forwarder<P>>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            generation,
            inner,
            state: AtomicU8::new(STATE_OPEN),
            refs: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ForwarderState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => ForwarderState::Open,
            _ => ForwarderState::Closed,
        }
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Take one reference. Fails once the handle is closed.
    pub fn add_ref(&self) -> AsResult<()> {
        self.refs.fetch_add(1, Ordering::SeqCst);
        if self.state() == ForwarderState::Closed {
            self.release();
            return Err(AsError::ForwarderClosed);
        }
        Ok(())
    }

    /// Drop one reference, tearing down when it was the last one of a
    /// closed handle.
    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "forwarder handle released more than acquired");
        if prev == 1 && self.state() == ForwarderState::Closed {
            self.teardown();
        }
    }

    /// Take one reference wrapped in a guard that releases it on drop.
    pub fn acquire(self: &Arc<Self>) -> AsResult<ForwarderGuard<P>> {
        self.add_ref()?;
        Ok(ForwarderGuard {
            handle: Arc::clone(self),
        })
    }

    /// Refuse new references; tear down now if nobody holds one.
    pub fn close(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        debug!(cluster = %self.cluster, generation = self.generation, "forwarder handle closed");
        if self.refs() == 0 {
            self.teardown();
        }
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(cluster = %self.cluster, generation = self.generation, "tearing down forwarder");
        self.inner.close();
    }
}

/// One held reference on a [`ForwarderHandle`].
pub struct ForwarderGuard<P: Protocol> {
    handle: Arc<ForwarderHandle<P>>,
}

impl<P: Protocol> ForwarderGuard<P> {
    pub async fn forward(&self, alloc: &mut BatchAllocator<P>, msgs: &[Message<P>]) -> AsResult<()> {
        self.handle.inner.forward(alloc, msgs).await
    }
}

impl<P: Protocol> Deref for ForwarderGuard<P> {
    type Target = ForwarderHandle<P>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<P: Protocol> Drop for ForwarderGuard<P> {
    fn drop(&mut self) {
        self.handle.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::redis::RedisProtocol;

    #[derive(Default)]
    struct CountingForwarder {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Forwarder<RedisProtocol> for CountingForwarder {
        async fn forward(
            &self,
            _alloc: &mut BatchAllocator<RedisProtocol>,
            _msgs: &[Message<RedisProtocol>],
        ) -> AsResult<()> {
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handle() -> (Arc<CountingForwarder>, Arc<ForwarderHandle<RedisProtocol>>) {
        let inner = Arc::new(CountingForwarder::default());
        let handle = ForwarderHandle::new("handle-test".into(), 1, inner.clone());
        (inner, handle)
    }

    #[test]
    fn close_without_users_tears_down_immediately() {
        let (inner, handle) = handle();
        assert_eq!(handle.state(), ForwarderState::Open);
        handle.close();
        handle.close();
        assert_eq!(handle.state(), ForwarderState::Closed);
        assert!(handle.is_torn_down());
        assert_eq!(inner.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_waits_for_last_release() {
        let (inner, handle) = handle();
        let first = handle.acquire().unwrap();
        let second = handle.acquire().unwrap();
        assert_eq!(handle.refs(), 2);

        handle.close();
        assert!(!handle.is_torn_down());
        assert_eq!(handle.acquire().err(), Some(AsError::ForwarderClosed));
        assert_eq!(handle.refs(), 2);

        drop(first);
        assert_eq!(inner.closes.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(handle.refs(), 0);
        assert_eq!(inner.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn guard_forwards_to_inner() {
        let (_inner, handle) = handle();
        let guard = handle.acquire().unwrap();
        let mut alloc = BatchAllocator::new(batch::BatchPool::new());
        assert_eq!(guard.forward(&mut alloc, &[]).await, Ok(()));
        assert_eq!(guard.generation(), 1);
    }
}
