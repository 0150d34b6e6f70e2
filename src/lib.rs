pub mod backend;
pub mod cluster;
pub mod com;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod standalone;
pub mod utils;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hashbrown::HashMap;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::dialer::{Dialer, TcpDialer};
use crate::com::create_reuse_port_listener;
use crate::config::{CacheType, ClusterConfig, Config};
use crate::metrics::Slowlog;
use crate::protocol::mc::McProtocol;
use crate::protocol::redis::RedisProtocol;
use crate::protocol::Protocol;
use crate::proxy::handler::{handle_connection, FrontContext};
use crate::proxy::reload::{ForwarderSlot, Reloader, Swappable};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Every configured cluster, bound and serving.
pub struct Proxy {
    config: Config,
    listeners: HashMap<String, SocketAddr>,
    slots: HashMap<String, Arc<dyn Swappable>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Proxy {
    /// Bind every cluster listener, build its forwarder and start accepting.
    pub async fn start(config: Config, dialer: Arc<dyn Dialer>) -> Result<Self> {
        let cancel = CancellationToken::new();
        let mut listeners = HashMap::new();
        let mut slots: HashMap<String, Arc<dyn Swappable>> = HashMap::new();
        let mut tasks = Vec::new();

        for cc in config.clusters() {
            let addr: SocketAddr = cc
                .listen_addr
                .parse()
                .with_context(|| format!("cluster {} listen_addr {} is not a socket address", cc.name, cc.listen_addr))?;
            let listener = create_reuse_port_listener(&addr)
                .with_context(|| format!("cluster {} failed to listen on {}", cc.name, addr))?;
            listeners.insert(cc.name.clone(), listener.local_addr()?);

            let (slot, task) = match cc.cache_type {
                CacheType::Memcache => {
                    start_cluster::<McProtocol>(cc, listener, dialer.clone(), cancel.child_token()).await?
                }
                CacheType::Redis | CacheType::RedisCluster => {
                    start_cluster::<RedisProtocol>(cc, listener, dialer.clone(), cancel.child_token()).await?
                }
            };
            slots.insert(cc.name.clone(), slot);
            tasks.push(task);
        }

        Ok(Self {
            config,
            listeners,
            slots,
            tasks,
            cancel,
        })
    }

    /// Bound address of a cluster's listener.
    pub fn local_addr(&self, cluster: &str) -> Option<SocketAddr> {
        self.listeners.get(cluster).copied()
    }

    /// Poll `path` and hot swap forwarders until shutdown.
    pub fn spawn_reloader(&self, path: PathBuf) -> JoinHandle<()> {
        let reloader = Reloader::new(path, &self.config, self.slots.clone());
        tokio::spawn(reloader.run(self.cancel.child_token()))
    }

    /// Stop accepting, stop the reloader and retire every forwarder.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        for slot in self.slots.values() {
            slot.close();
        }
        info!("proxy stopped");
    }
}

async fn start_cluster<P: Protocol>(
    cc: &ClusterConfig,
    listener: TcpListener,
    dialer: Arc<dyn Dialer>,
    cancel: CancellationToken,
) -> Result<(Arc<dyn Swappable>, JoinHandle<()>)> {
    let slot = Arc::new(
        ForwarderSlot::<P>::build(cc, dialer)
            .await
            .with_context(|| format!("failed to build forwarder for cluster {}", cc.name))?,
    );
    let cluster: Arc<str> = cc.name.as_str().into();
    let slowlog = Slowlog::new(cluster.clone(), cc.slowlog_log_slower_than);
    let ctx = Arc::new(FrontContext::new(cluster, slot.current().clone()).with_slowlog(slowlog));
    info!(
        cluster = %cc.name,
        listen_addr = %cc.listen_addr,
        cache_type = ?cc.cache_type,
        protocol = P::NAME,
        "cluster listening"
    );
    let task = tokio::spawn(accept_loop(listener, ctx, cancel));
    let slot: Arc<dyn Swappable> = slot;
    Ok((slot, task))
}

async fn accept_loop<P: Protocol>(listener: TcpListener, ctx: Arc<FrontContext<P>>, cancel: CancellationToken) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    metrics::global_error_incr();
                    warn!(cluster = %ctx.cluster(), error = %err, "failed to accept client");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(ctx.clone(), socket).await {
                debug!(
                    cluster = %ctx.cluster(),
                    peer = %peer,
                    error = %format!("{err:#}"),
                    "client connection closed with error"
                );
            }
        });
    }
    debug!(cluster = %ctx.cluster(), "accept loop stopped");
}

/// Load `path`, serve every cluster and run until ctrl-c.
pub async fn run(path: PathBuf, reload: bool) -> Result<()> {
    info!(path = %path.display(), "loading config");
    let config = Config::load(&path).await?;
    debug!(config = ?config, "use config");

    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new());
    let proxy = Proxy::start(config, dialer).await?;
    let _reloader = reload.then(|| proxy.spawn_reloader(path));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    proxy.shutdown().await;
    Ok(())
}
