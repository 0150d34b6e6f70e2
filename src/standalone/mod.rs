pub mod fnv;
pub mod ketama;
pub mod ping;

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::dialer::Dialer;
use crate::backend::pipeline::{NodePipes, PipeContext, PipeOptions};
use crate::com::{AsError, AsResult};
use crate::config::ClusterConfig;
use crate::protocol::Protocol;
use crate::proxy::batch::BatchAllocator;
use crate::proxy::message::Message;
use crate::proxy::Forwarder;
use crate::utils::trim_hash_tag;

use self::ketama::HashRing;
use self::ping::{ConnPinger, HealthMonitor, MonitorOptions};

/// Hash-ring forwarder for plain memcache and redis backends.
pub struct StandaloneForwarder<P: Protocol> {
    cluster: Arc<str>,
    hash_tag: Option<Vec<u8>>,
    ring: Arc<HashRing>,
    // ring name -> address, only when servers carry aliases
    alias: HashMap<Arc<str>, Arc<str>>,
    pipes: RwLock<HashMap<Arc<str>, Arc<NodePipes<P>>>>,
    cancel: CancellationToken,
}

impl<P: Protocol> StandaloneForwarder<P> {
    /// Build the ring, one set of pipelines per server and, when enabled,
    /// one health monitor per server. Must run inside a tokio runtime.
    pub fn new(cc: &ClusterConfig, dialer: Arc<dyn Dialer>) -> AsResult<Self> {
        let specs = cc
            .server_specs()
            .map_err(|err| AsError::BadConfig(format!("servers: {err:#}")))?;
        if specs.is_empty() {
            return Err(AsError::BadConfig("servers".to_string()));
        }
        let cluster: Arc<str> = cc.name.as_str().into();
        let ring = Arc::new(HashRing::new(
            cc.hash_method,
            specs.iter().map(|spec| spec.name().to_string()).collect(),
            specs.iter().map(|spec| spec.weight).collect(),
        )?);

        let mut alias = HashMap::new();
        for spec in specs.iter().filter(|spec| spec.alias.is_some()) {
            alias.insert(Arc::from(spec.name()), Arc::from(spec.addr.as_str()));
        }

        let ctx = PipeContext::<P>::new(cluster.clone(), dialer.clone(), PipeOptions::from_config(cc));
        let mut pipes = HashMap::new();
        for spec in &specs {
            let addr: Arc<str> = spec.addr.as_str().into();
            pipes
                .entry(addr)
                .or_insert_with(|| Arc::new(NodePipes::spawn(&spec.addr, cc.node_connections, &ctx)));
        }

        let cancel = CancellationToken::new();
        if cc.ping_auto_eject {
            let options = MonitorOptions {
                fail_limit: cc.ping_fail_limit,
                interval: cc.ping_interval(),
                quarantine: cc.ping_quarantine(),
            };
            for spec in &specs {
                let monitor = HealthMonitor::new(
                    cluster.clone(),
                    spec.name().into(),
                    spec.weight,
                    ring.clone(),
                    ConnPinger::<P>::new(&spec.addr, dialer.clone()),
                    options,
                );
                tokio::spawn(monitor.run(cancel.child_token()));
            }
        }

        info!(
            cluster = %cluster,
            protocol = P::NAME,
            servers = specs.len(),
            auto_eject = cc.ping_auto_eject,
            "standalone forwarder ready"
        );
        Ok(Self {
            cluster,
            hash_tag: cc.hash_tag_bytes(),
            ring,
            alias,
            pipes: RwLock::new(pipes),
            cancel,
        })
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    /// Backend address serving `key`, after hash tag trimming and alias lookup.
    pub fn route(&self, key: &[u8]) -> Option<Arc<str>> {
        let name = self
            .ring
            .get_node(trim_hash_tag(key, self.hash_tag.as_deref()))?;
        match self.alias.get(&name) {
            Some(addr) => Some(addr.clone()),
            None => Some(name),
        }
    }
}

#[async_trait]
impl<P: Protocol> Forwarder<P> for StandaloneForwarder<P> {
    async fn forward(&self, alloc: &mut BatchAllocator<P>, msgs: &[Message<P>]) -> AsResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AsError::ForwarderClosed);
        }
        for msg in msgs.iter().filter(|msg| msg.is_forwarded()) {
            for cmd in msg.subs() {
                match self.route(cmd.key()) {
                    Some(addr) => alloc.add_msg(&addr, cmd.clone()),
                    None => cmd.set_error(AsError::NoBackend),
                }
            }
        }

        for (addr, batch) in alloc.take_batches() {
            let pipes = self.pipes.read().get(&addr).cloned();
            match pipes {
                Some(pipes) => pipes.send(batch).await,
                None => batch.fail(&AsError::NoBackend),
            }
        }
        Ok(())
    }

    fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let pipes = std::mem::take(&mut *self.pipes.write());
        debug!(cluster = %self.cluster, nodes = pipes.len(), "standalone forwarder closed");
    }
}

impl<P: Protocol> Drop for StandaloneForwarder<P> {
    fn drop(&mut self) {
        <Self as Forwarder<P>>::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dialer::{BoxRead, BoxWrite};
    use crate::config::Config;
    use crate::protocol::redis::{RedisCommand, RedisProtocol};
    use crate::proxy::batch::BatchPool;
    use crate::protocol::MergeType;
    use bytes::Bytes;
    use std::time::Duration;

    struct NoDial;

    #[async_trait]
    impl Dialer for NoDial {
        async fn dial(&self, addr: &str, _deadline: Duration) -> AsResult<(BoxRead, BoxWrite)> {
            Err(AsError::Dial {
                addr: addr.to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    fn cluster_config(servers: &[&str]) -> ClusterConfig {
        let servers = servers
            .iter()
            .map(|s| format!("\"{s}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let raw = format!(
            "[[clusters]]\nname = \"sa\"\nlisten_addr = \"127.0.0.1:0\"\ncache_type = \"memcache\"\nservers = [{servers}]\n"
        );
        Config::parse(&raw).unwrap().clusters()[0].clone()
    }

    #[tokio::test]
    async fn aliases_route_to_addresses() {
        let cc = cluster_config(&["127.0.0.1:11211:10 mc-1", "127.0.0.1:11212:10 mc-2"]);
        let fwd = StandaloneForwarder::<RedisProtocol>::new(&cc, Arc::new(NoDial)).unwrap();
        let addr_of = |name: &str| match name {
            "mc-1" => "127.0.0.1:11211",
            "mc-2" => "127.0.0.1:11212",
            other => panic!("unexpected ring node {other}"),
        };
        for i in 0..256 {
            let key = format!("key-{i}");
            let name = fwd.ring().get_node(key.as_bytes()).unwrap();
            assert_eq!(&*fwd.route(key.as_bytes()).unwrap(), addr_of(&*name));
        }

        fwd.ring().del_node("mc-1");
        assert_eq!(&*fwd.route(b"key-0").unwrap(), "127.0.0.1:11212");
        fwd.ring().add_node("mc-1", 10);
        fwd.ring().del_node("mc-2");
        assert_eq!(&*fwd.route(b"key-0").unwrap(), "127.0.0.1:11211");
        fwd.close();
    }

    #[tokio::test]
    async fn hash_tag_pins_related_keys() {
        let mut cc = cluster_config(&["127.0.0.1:11211", "127.0.0.1:11212", "127.0.0.1:11213"]);
        cc.hash_tag = Some("{}".to_string());
        let fwd = StandaloneForwarder::<RedisProtocol>::new(&cc, Arc::new(NoDial)).unwrap();
        let first = fwd.route(b"{user:1}:name").unwrap();
        for suffix in ["age", "mail", "token", "city"] {
            let key = format!("{{user:1}}:{suffix}");
            assert_eq!(fwd.route(key.as_bytes()).unwrap(), first);
        }
    }

    #[tokio::test]
    async fn empty_ring_fails_commands_without_backend() {
        let cc = cluster_config(&["127.0.0.1:11211"]);
        let fwd = StandaloneForwarder::<RedisProtocol>::new(&cc, Arc::new(NoDial)).unwrap();
        fwd.ring().del_node("127.0.0.1:11211");

        let msg = Message::<RedisProtocol>::new(
            vec![RedisCommand::new(vec![Bytes::from_static(b"GET"), Bytes::from_static(b"k")]).unwrap()],
            MergeType::Passthrough,
        );
        let mut alloc = BatchAllocator::new(BatchPool::new());
        fwd.forward(&mut alloc, std::slice::from_ref(&msg)).await.unwrap();
        alloc.wait().await;
        assert_eq!(msg.subs()[0].result(), Some(Err(AsError::NoBackend)));
    }

    #[tokio::test]
    async fn closed_forwarder_rejects_work() {
        let cc = cluster_config(&["127.0.0.1:11211"]);
        let fwd = StandaloneForwarder::<RedisProtocol>::new(&cc, Arc::new(NoDial)).unwrap();
        fwd.close();
        let mut alloc = BatchAllocator::new(BatchPool::new());
        assert_eq!(
            fwd.forward(&mut alloc, &[]).await,
            Err(AsError::ForwarderClosed)
        );
    }
}
