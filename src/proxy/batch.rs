use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::com::AsError;
use crate::protocol::Protocol;
use crate::proxy::message::Command;

const POOL_LIMIT: usize = 64;

/// Counter of outstanding batches for one decode cycle.
///
/// Every non-empty batch adds one before it is handed to a pipeline and
/// calls [`Completion::done`] once all of its commands have a result.
#[derive(Debug, Default)]
pub struct Completion {
    pending: AtomicUsize,
    notify: Notify,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }

    pub fn done(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "completion released more than added");
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Resolve once the outstanding count reaches zero.
    pub fn wait(&self) -> impl Future<Output = ()> + '_ {
        async move {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.pending() == 0 {
                    return;
                }
                notified.await;
            }
        }
    }
}

/// Commands bound for one backend address, in submission order.
pub struct Batch<P: Protocol> {
    cmds: Vec<Arc<Command<P>>>,
    done: Option<Arc<Completion>>,
    pool: Weak<BatchPool<P>>,
}

impl<P: Protocol> Batch<P> {
    pub fn new() -> Self {
        Self {
            cmds: Vec::new(),
            done: None,
            pool: Weak::new(),
        }
    }

    /// A one-command batch already counted in `done`.
    pub fn single(cmd: Arc<Command<P>>, done: Arc<Completion>) -> Self {
        Self {
            cmds: vec![cmd],
            done: Some(done),
            pool: Weak::new(),
        }
    }

    pub fn push(&mut self, cmd: Arc<Command<P>>) {
        self.cmds.push(cmd);
    }

    pub fn cmds(&self) -> &[Arc<Command<P>>] {
        &self.cmds
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn completion(&self) -> Option<&Arc<Completion>> {
        self.done.as_ref()
    }

    pub(crate) fn attach(&mut self, done: Arc<Completion>) {
        self.done = Some(done);
    }

    /// Fail every command that has no result yet, then finish.
    pub fn fail(self, err: &AsError) {
        for cmd in &self.cmds {
            if !cmd.is_done() {
                cmd.set_error(err.clone());
            }
        }
        self.finish();
    }

    /// Signal the completion and hand the batch back to its pool.
    pub fn finish(mut self) {
        self.cmds.clear();
        let done = self.done.take();
        if let Some(pool) = self.pool.upgrade() {
            pool.put(self);
        }
        if let Some(done) = done {
            done.done();
        }
    }
}

impl<P: Protocol> Default for Batch<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reusable batch containers.
pub struct BatchPool<P: Protocol> {
    free: Mutex<Vec<Batch<P>>>,
}

impl<P: Protocol> BatchPool<P> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn get(self: &Arc<Self>) -> Batch<P> {
        let mut batch = self.free.lock().pop().unwrap_or_default();
        batch.pool = Arc::downgrade(self);
        batch
    }

    fn put(&self, batch: Batch<P>) {
        let mut free = self.free.lock();
        if free.len() < POOL_LIMIT {
            free.push(batch);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// Groups the commands of one decode cycle by destination address.
pub struct BatchAllocator<P: Protocol> {
    pool: Arc<BatchPool<P>>,
    order: Vec<Arc<str>>,
    batches: HashMap<Arc<str>, Batch<P>>,
    completion: Arc<Completion>,
}

impl<P: Protocol> BatchAllocator<P> {
    pub fn new(pool: Arc<BatchPool<P>>) -> Self {
        Self {
            pool,
            order: Vec::new(),
            batches: HashMap::new(),
            completion: Completion::new(),
        }
    }

    pub fn add_msg(&mut self, addr: &str, cmd: Arc<Command<P>>) {
        if let Some(batch) = self.batches.get_mut(addr) {
            batch.push(cmd);
            return;
        }
        let addr: Arc<str> = addr.into();
        let mut batch = self.pool.get();
        batch.push(cmd);
        self.order.push(addr.clone());
        self.batches.insert(addr, batch);
    }

    pub fn batch(&self, addr: &str) -> Option<&Batch<P>> {
        self.batches.get(addr)
    }

    pub fn completion(&self) -> &Arc<Completion> {
        &self.completion
    }

    pub fn add(&self, n: usize) {
        self.completion.add(n);
    }

    pub async fn wait(&self) {
        self.completion.wait().await
    }

    /// Take every non-empty batch in first-seen address order, each counted
    /// once in the shared completion.
    pub fn take_batches(&mut self) -> Vec<(Arc<str>, Batch<P>)> {
        let mut out = Vec::with_capacity(self.order.len());
        for addr in self.order.drain(..) {
            if let Some(mut batch) = self.batches.remove(&addr) {
                if batch.is_empty() {
                    continue;
                }
                self.completion.add(1);
                batch.attach(self.completion.clone());
                out.push((addr, batch));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::redis::{RedisCommand, RedisProtocol, RespValue};
    use bytes::Bytes;
    use std::time::Duration;

    fn cmd(key: &str) -> Arc<Command<RedisProtocol>> {
        Arc::new(Command::new(
            RedisCommand::new(vec![Bytes::from_static(b"GET"), Bytes::from(key.to_string())])
                .unwrap(),
        ))
    }

    #[test]
    fn groups_by_address_in_arrival_order() {
        let mut alloc = BatchAllocator::new(BatchPool::<RedisProtocol>::new());
        alloc.add_msg("a:1", cmd("k1"));
        alloc.add_msg("b:1", cmd("k2"));
        alloc.add_msg("a:1", cmd("k3"));
        assert_eq!(alloc.batch("a:1").unwrap().len(), 2);
        assert_eq!(alloc.batch("a:1").unwrap().cmds()[1].key(), b"k3");

        let batches = alloc.take_batches();
        let addrs: Vec<&str> = batches.iter().map(|(addr, _)| addr.as_ref()).collect();
        assert_eq!(addrs, vec!["a:1", "b:1"]);
        assert_eq!(alloc.completion().pending(), 2);
        assert!(alloc.batch("a:1").is_none());
    }

    #[test]
    fn finished_batches_return_to_pool() {
        let pool = BatchPool::<RedisProtocol>::new();
        let mut alloc = BatchAllocator::new(pool.clone());
        alloc.add_msg("a:1", cmd("k1"));
        for (_, batch) in alloc.take_batches() {
            batch.finish();
        }
        assert_eq!(pool.idle(), 1);
        assert_eq!(alloc.completion().pending(), 0);
    }

    #[tokio::test]
    async fn wait_resolves_only_after_every_batch() {
        let mut alloc = BatchAllocator::new(BatchPool::<RedisProtocol>::new());
        alloc.add_msg("a:1", cmd("k1"));
        alloc.add_msg("b:1", cmd("k2"));
        let mut batches = alloc.take_batches();
        let (_, second) = batches.pop().unwrap();
        let (_, first) = batches.pop().unwrap();

        first.cmds()[0].set_reply(RespValue::NullBulk);
        first.finish();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), alloc.wait())
                .await
                .is_err(),
            "barrier released with one batch outstanding"
        );

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            second.fail(&AsError::Timeout);
        });
        tokio::time::timeout(Duration::from_secs(1), alloc.wait())
            .await
            .expect("barrier released");
        handle.await.unwrap();
    }

    #[test]
    fn fail_keeps_existing_results() {
        let done = Completion::new();
        done.add(1);
        let ok = cmd("k1");
        ok.set_reply(RespValue::Integer(1));
        let pending = cmd("k2");
        let mut batch = Batch::single(ok.clone(), done.clone());
        batch.push(pending.clone());
        batch.fail(&AsError::NoBackend);
        assert_eq!(ok.result(), Some(Ok(RespValue::Integer(1))));
        assert_eq!(pending.result(), Some(Err(AsError::NoBackend)));
        assert_eq!(done.pending(), 0);
    }
}
