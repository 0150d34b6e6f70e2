pub mod fetcher;
pub mod redirect;
pub mod slots;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::dialer::Dialer;
use crate::backend::pipeline::{NodePipes, PipeContext, PipeOptions};
use crate::com::{AsError, AsResult};
use crate::config::ClusterConfig;
use crate::protocol::Protocol;
use crate::proxy::batch::BatchAllocator;
use crate::proxy::message::Message;
use crate::proxy::Forwarder;

use self::fetcher::{fetch_once, RespTopology, TopologySource};
use self::redirect::redirect_loop;
use self::slots::{slot_for_key, SlotTable};

/// State shared by the forwarder, its fetcher and its redirect worker.
pub(crate) struct ClusterInner<P: Protocol> {
    cluster: Arc<str>,
    table: SlotTable,
    pipes: RwLock<HashMap<Arc<str>, Arc<NodePipes<P>>>>,
    ctx: PipeContext<P>,
    node_connections: usize,
    closed: AtomicBool,
}

impl<P: Protocol> ClusterInner<P> {
    /// Pipelines for `addr`, spawned on first use. `None` once closed.
    fn pipes_for(&self, addr: &str) -> Option<Arc<NodePipes<P>>> {
        if let Some(pipes) = self.pipes.read().get(addr) {
            return Some(pipes.clone());
        }
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let mut pipes = self.pipes.write();
        let entry = pipes.entry(Arc::from(addr)).or_insert_with(|| {
            debug!(cluster = %self.cluster, backend = %addr, "spawning backend pipelines");
            Arc::new(NodePipes::spawn(addr, self.node_connections, &self.ctx))
        });
        Some(entry.clone())
    }

    /// Open pipelines for new masters and close the ones that left.
    fn sync_pipes(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let masters = self.table.masters();
        let mut pipes = self.pipes.write();
        pipes.retain(|addr, _| {
            let keep = masters.contains(addr);
            if !keep {
                info!(cluster = %self.cluster, backend = %addr, "closing pipelines of departed node");
            }
            keep
        });
        for addr in masters {
            pipes
                .entry(addr.clone())
                .or_insert_with(|| Arc::new(NodePipes::spawn(&addr, self.node_connections, &self.ctx)));
        }
    }
}

/// Slot-map forwarder for redis cluster.
pub struct ClusterForwarder<P: Protocol> {
    inner: Arc<ClusterInner<P>>,
    hash_tag: Option<Vec<u8>>,
    cancel: CancellationToken,
}

impl<P: Protocol> ClusterForwarder<P> {
    pub async fn connect(cc: &ClusterConfig, dialer: Arc<dyn Dialer>) -> AsResult<Self> {
        let source = Arc::new(RespTopology::new(
            dialer.clone(),
            cc.dial_timeout(),
            cc.read_timeout(),
        ));
        Self::with_source(cc, dialer, source).await
    }

    /// Fetch the first topology from the seeds and start the background
    /// fetcher and redirect worker.
    pub async fn with_source(
        cc: &ClusterConfig,
        dialer: Arc<dyn Dialer>,
        source: Arc<dyn TopologySource>,
    ) -> AsResult<Self> {
        let cluster: Arc<str> = cc.name.as_str().into();
        let seeds: Vec<String> = cc
            .server_specs()
            .map_err(|err| AsError::BadConfig(format!("servers: {err:#}")))?
            .into_iter()
            .map(|spec| spec.addr)
            .collect();

        let table = SlotTable::new(cluster.clone());
        if let Err(err) = fetch_once(&cluster, &seeds, source.as_ref(), &table).await {
            warn!(cluster = %cluster, error = %err, "failed to load initial cluster topology");
            return Err(AsError::ClusterAllSeedsDie(cluster.to_string()));
        }

        let (redirect_tx, redirect_rx) = mpsc::unbounded_channel();
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let ctx = PipeContext::new(cluster.clone(), dialer, PipeOptions::from_config(cc))
            .with_redirects(redirect_tx)
            .with_refresh(refresh_tx);
        let inner = Arc::new(ClusterInner {
            cluster: cluster.clone(),
            table,
            pipes: RwLock::new(HashMap::new()),
            ctx,
            node_connections: cc.node_connections,
            closed: AtomicBool::new(false),
        });
        inner.sync_pipes();

        let cancel = CancellationToken::new();
        tokio::spawn(redirect_loop(inner.clone(), redirect_rx, cancel.child_token()));
        tokio::spawn(fetch_loop(
            inner.clone(),
            seeds,
            source,
            cc.fetch_interval(),
            refresh_rx,
            cancel.child_token(),
        ));

        info!(
            cluster = %cluster,
            masters = inner.table.masters().len(),
            "cluster forwarder ready"
        );
        Ok(Self {
            inner,
            hash_tag: cc.hash_tag_bytes(),
            cancel,
        })
    }

    pub fn slots(&self) -> &SlotTable {
        &self.inner.table
    }
}

async fn fetch_loop<P: Protocol>(
    inner: Arc<ClusterInner<P>>,
    seeds: Vec<String>,
    source: Arc<dyn TopologySource>,
    every: Duration,
    mut trigger: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {},
            Some(()) = trigger.recv() => {
                debug!(cluster = %inner.cluster, "topology refresh triggered by backend error");
            },
        }

        match fetch_once(&inner.cluster, &seeds, source.as_ref(), &inner.table).await {
            Ok(true) => inner.sync_pipes(),
            Ok(false) => {}
            Err(err) => {
                warn!(cluster = %inner.cluster, error = %err, "failed to refresh cluster topology");
            }
        }
    }
    debug!(cluster = %inner.cluster, "topology fetcher stopped");
}

#[async_trait]
impl<P: Protocol> Forwarder<P> for ClusterForwarder<P> {
    async fn forward(&self, alloc: &mut BatchAllocator<P>, msgs: &[Message<P>]) -> AsResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AsError::ForwarderClosed);
        }
        for msg in msgs.iter().filter(|msg| msg.is_forwarded()) {
            for cmd in msg.subs() {
                let slot = slot_for_key(cmd.key(), self.hash_tag.as_deref());
                match self.inner.table.get_master(slot) {
                    Some(addr) => alloc.add_msg(&addr, cmd.clone()),
                    None => cmd.set_error(AsError::NoBackend),
                }
            }
        }

        for (addr, batch) in alloc.take_batches() {
            match self.inner.pipes_for(&addr) {
                Some(pipes) => pipes.send(batch).await,
                None => batch.fail(&AsError::ForwarderClosed),
            }
        }
        Ok(())
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let pipes = std::mem::take(&mut *self.inner.pipes.write());
        debug!(cluster = %self.inner.cluster, nodes = pipes.len(), "cluster forwarder closed");
    }
}

impl<P: Protocol> Drop for ClusterForwarder<P> {
    fn drop(&mut self) {
        <Self as Forwarder<P>>::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dialer::{BoxRead, BoxWrite};
    use crate::cluster::slots::tests::THREE_MASTERS;
    use crate::config::Config;
    use crate::protocol::redis::{decode_value, write_value, RedisCommand, RedisProtocol, RespValue};
    use crate::protocol::MergeType;
    use crate::proxy::batch::BatchPool;
    use bytes::{Bytes, BytesMut};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[derive(Clone)]
    enum Node {
        /// Reply with the key of every command.
        Owner,
        /// Reply `MOVED <slot> <to>`.
        Moved(&'static str),
        /// Reply `ASK <slot> <to>`.
        Ask(&'static str),
        /// Reply with the key only right after `ASKING`, else `MOVED` home.
        Importing(&'static str),
    }

    struct FakeCluster {
        nodes: HashMap<String, Node>,
        topology: parking_lot::Mutex<String>,
        fetches: AtomicUsize,
    }

    impl FakeCluster {
        fn new(nodes: &[(&str, Node)]) -> Arc<Self> {
            Arc::new(Self {
                nodes: nodes
                    .iter()
                    .map(|(addr, node)| (addr.to_string(), node.clone()))
                    .collect(),
                topology: parking_lot::Mutex::new(THREE_MASTERS.to_string()),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TopologySource for FakeCluster {
        async fn fetch(&self, _addr: &str) -> AsResult<String> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.topology.lock().clone())
        }
    }

    #[async_trait]
    impl Dialer for FakeCluster {
        async fn dial(&self, addr: &str, _deadline: Duration) -> AsResult<(BoxRead, BoxWrite)> {
            let node = self.nodes.get(addr).cloned().ok_or_else(|| AsError::Dial {
                addr: addr.to_string(),
                reason: "no such node".to_string(),
            })?;
            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve(server, node));
            let (read, write) = tokio::io::split(client);
            Ok((Box::new(read), Box::new(write)))
        }
    }

    async fn serve(mut stream: DuplexStream, node: Node) {
        let mut buf = BytesMut::new();
        let mut asking = false;
        loop {
            while let Some(value) = decode_value(&mut buf).unwrap() {
                let parts = value.as_array().unwrap_or(&[]).to_vec();
                let name = parts.first().and_then(|p| p.as_bytes()).unwrap_or(b"").to_vec();
                let key = parts.get(1).cloned().unwrap_or(RespValue::NullBulk);
                let slot = key
                    .as_bytes()
                    .map(|key| slot_for_key(key, None))
                    .unwrap_or(0);
                let reply = if name.eq_ignore_ascii_case(b"ASKING") {
                    asking = true;
                    RespValue::ok()
                } else {
                    let reply = match &node {
                        Node::Owner => key,
                        Node::Moved(to) => RespValue::error(format!("MOVED {slot} {to}")),
                        Node::Ask(to) => RespValue::error(format!("ASK {slot} {to}")),
                        Node::Importing(_) if asking => key,
                        Node::Importing(home) => RespValue::error(format!("MOVED {slot} {home}")),
                    };
                    asking = false;
                    reply
                };
                let mut out = BytesMut::new();
                write_value(&reply, &mut out);
                if stream.write_all(&out).await.is_err() {
                    return;
                }
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    fn cluster_config() -> ClusterConfig {
        let raw = "[[clusters]]\nname = \"rc\"\nlisten_addr = \"127.0.0.1:0\"\ncache_type = \"redis_cluster\"\nservers = [\"127.0.0.1:7000\"]\nread_timeout = 500\n";
        Config::parse(raw).unwrap().clusters()[0].clone()
    }

    async fn forwarder(fake: &Arc<FakeCluster>) -> ClusterForwarder<RedisProtocol> {
        let mut cc = cluster_config();
        cc.name = format!("rc-{}", rand::random::<u32>());
        ClusterForwarder::with_source(&cc, fake.clone(), fake.clone())
            .await
            .unwrap()
    }

    fn get(key: &str) -> Message<RedisProtocol> {
        Message::new(
            vec![RedisCommand::new(vec![Bytes::from_static(b"GET"), Bytes::from(key.to_string())]).unwrap()],
            MergeType::Passthrough,
        )
    }

    async fn roundtrip(fwd: &ClusterForwarder<RedisProtocol>, msg: &Message<RedisProtocol>) {
        let mut alloc = BatchAllocator::new(BatchPool::new());
        fwd.forward(&mut alloc, std::slice::from_ref(msg)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), alloc.wait())
            .await
            .expect("round trip settled");
    }

    // "foo" hashes to slot 12182, owned by 127.0.0.1:7002
    #[tokio::test]
    async fn routes_by_slot_owner() {
        let fake = FakeCluster::new(&[
            ("127.0.0.1:7000", Node::Owner),
            ("127.0.0.1:7001", Node::Owner),
            ("127.0.0.1:7002", Node::Owner),
        ]);
        let fwd = forwarder(&fake).await;
        let msg = get("foo");
        roundtrip(&fwd, &msg).await;
        assert_eq!(msg.subs()[0].result(), Some(Ok(RespValue::bulk("foo"))));
        fwd.close();
    }

    #[tokio::test]
    async fn moved_patches_slot_and_resends_once() {
        let fake = FakeCluster::new(&[
            ("127.0.0.1:7000", Node::Owner),
            ("127.0.0.1:7001", Node::Owner),
            ("127.0.0.1:7002", Node::Moved("127.0.0.1:7001")),
        ]);
        let fwd = forwarder(&fake).await;
        let msg = get("foo");
        roundtrip(&fwd, &msg).await;
        assert_eq!(msg.subs()[0].result(), Some(Ok(RespValue::bulk("foo"))));
        assert_eq!(msg.subs()[0].redirects(), 1);
        assert_eq!(fwd.slots().get_master(12182).as_deref(), Some("127.0.0.1:7001"));
        fwd.close();
    }

    #[tokio::test]
    async fn ask_resends_with_asking_without_patching() {
        let fake = FakeCluster::new(&[
            ("127.0.0.1:7000", Node::Importing("127.0.0.1:7002")),
            ("127.0.0.1:7001", Node::Owner),
            ("127.0.0.1:7002", Node::Ask("127.0.0.1:7000")),
        ]);
        let fwd = forwarder(&fake).await;
        let msg = get("foo");
        roundtrip(&fwd, &msg).await;
        assert_eq!(msg.subs()[0].result(), Some(Ok(RespValue::bulk("foo"))));
        assert_eq!(fwd.slots().get_master(12182).as_deref(), Some("127.0.0.1:7002"));
        fwd.close();
    }

    #[tokio::test]
    async fn second_redirect_fails_the_command() {
        let fake = FakeCluster::new(&[
            ("127.0.0.1:7000", Node::Moved("127.0.0.1:7002")),
            ("127.0.0.1:7001", Node::Owner),
            ("127.0.0.1:7002", Node::Moved("127.0.0.1:7000")),
        ]);
        let fwd = forwarder(&fake).await;
        let msg = get("foo");
        roundtrip(&fwd, &msg).await;
        assert_eq!(msg.subs()[0].result(), Some(Err(AsError::RedirectLimit)));
        fwd.close();
    }

    #[tokio::test]
    async fn dead_seeds_fail_construction() {
        struct Down;

        #[async_trait]
        impl TopologySource for Down {
            async fn fetch(&self, addr: &str) -> AsResult<String> {
                Err(AsError::Dial {
                    addr: addr.to_string(),
                    reason: "down".to_string(),
                })
            }
        }

        let fake = FakeCluster::new(&[]);
        let cc = cluster_config();
        let result = ClusterForwarder::<RedisProtocol>::with_source(&cc, fake, Arc::new(Down)).await;
        assert!(matches!(result, Err(AsError::ClusterAllSeedsDie(_))));
    }

    #[tokio::test]
    async fn backend_errors_trigger_early_refresh() {
        let fake = FakeCluster::new(&[
            ("127.0.0.1:7000", Node::Owner),
            ("127.0.0.1:7001", Node::Owner),
        ]);
        let fwd = forwarder(&fake).await;
        let before = fake.fetches.load(Ordering::SeqCst);
        let msg = get("foo");
        roundtrip(&fwd, &msg).await;
        assert!(matches!(msg.subs()[0].result(), Some(Err(AsError::Dial { .. }))));

        let deadline = Instant::now() + Duration::from_secs(2);
        while fake.fetches.load(Ordering::SeqCst) == before && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fake.fetches.load(Ordering::SeqCst) > before);
        fwd.close();
    }
}
