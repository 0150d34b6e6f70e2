use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::dialer::Dialer;
use crate::com::AsResult;
use crate::config::{ClusterConfig, Config};
use crate::protocol::Protocol;
use crate::proxy::{build_forwarder, ForwarderHandle};

pub const RELOAD_INTERVAL: Duration = Duration::from_secs(1);

/// Something the reloader can install a new forwarder generation into.
#[async_trait]
pub trait Swappable: Send + Sync + 'static {
    /// Build a forwarder for `cc`, install it and retire the previous one.
    /// Returns the new generation number.
    async fn replace(&self, cc: &ClusterConfig) -> AsResult<u64>;

    /// Close the installed generation on shutdown.
    fn close(&self);
}

/// The current forwarder generation of one cluster.
pub struct ForwarderSlot<P: Protocol> {
    cluster: Arc<str>,
    current: Arc<ArcSwap<ForwarderHandle<P>>>,
    dialer: Arc<dyn Dialer>,
    generation: AtomicU64,
}

impl<P: Protocol> ForwarderSlot<P> {
    /// Build the first generation.
    pub async fn build(cc: &ClusterConfig, dialer: Arc<dyn Dialer>) -> AsResult<Self> {
        let cluster: Arc<str> = cc.name.as_str().into();
        let forwarder = build_forwarder::<P>(cc, dialer.clone()).await?;
        let handle = ForwarderHandle::new(cluster.clone(), 1, forwarder);
        Ok(Self {
            cluster,
            current: Arc::new(ArcSwap::new(handle)),
            dialer,
            generation: AtomicU64::new(1),
        })
    }

    pub fn current(&self) -> &Arc<ArcSwap<ForwarderHandle<P>>> {
        &self.current
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[async_trait]
impl<P: Protocol> Swappable for ForwarderSlot<P> {
    async fn replace(&self, cc: &ClusterConfig) -> AsResult<u64> {
        let forwarder = build_forwarder::<P>(cc, self.dialer.clone()).await?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let retired = self
            .current
            .swap(ForwarderHandle::new(self.cluster.clone(), generation, forwarder));
        retired.close();
        info!(
            cluster = %self.cluster,
            generation,
            draining = retired.refs(),
            "installed new forwarder generation"
        );
        Ok(generation)
    }

    fn close(&self) {
        self.current.load().close();
    }
}

/// Polls the configuration file and swaps forwarders of clusters whose
/// routing changed.
pub struct Reloader {
    path: PathBuf,
    applied: HashMap<String, ClusterConfig>,
    slots: HashMap<String, Arc<dyn Swappable>>,
    every: Duration,
}

impl Reloader {
    pub fn new(path: impl Into<PathBuf>, config: &Config, slots: HashMap<String, Arc<dyn Swappable>>) -> Self {
        Self {
            path: path.into(),
            applied: config
                .clusters()
                .iter()
                .map(|cc| (cc.name.clone(), cc.clone()))
                .collect(),
            slots,
            every: RELOAD_INTERVAL,
        }
    }

    pub fn with_interval(mut self, every: Duration) -> Self {
        self.every = every;
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.every, self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(path = %self.path.display(), "config reloader started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            match Config::load(&self.path).await {
                Ok(config) => {
                    self.apply(&config).await;
                }
                Err(err) => {
                    warn!(path = %self.path.display(), error = %format!("{err:#}"), "ignoring unreadable config");
                }
            }
        }
        debug!("config reloader stopped");
    }

    /// Swap forwarders for every cluster whose routing changed. Returns the
    /// number of clusters that got a new generation.
    pub async fn apply(&mut self, config: &Config) -> usize {
        let mut swapped = 0;
        for next in config.clusters() {
            let prev = match self.applied.get(&next.name) {
                Some(prev) => prev,
                None => {
                    warn!(cluster = %next.name, "new cluster in config requires a restart");
                    continue;
                }
            };
            if prev.listen_addr != next.listen_addr || prev.cache_type != next.cache_type {
                warn!(cluster = %next.name, "listen_addr or cache_type change requires a restart");
                continue;
            }
            if !prev.routing_changed(next) {
                continue;
            }
            let slot = match self.slots.get(&next.name) {
                Some(slot) => slot,
                None => continue,
            };
            match slot.replace(next).await {
                Ok(generation) => {
                    info!(cluster = %next.name, generation, "cluster reloaded");
                    self.applied.insert(next.name.clone(), next.clone());
                    swapped += 1;
                }
                Err(err) => {
                    warn!(cluster = %next.name, error = %err, "failed to build forwarder from new config");
                }
            }
        }
        swapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dialer::{BoxRead, BoxWrite};
    use crate::com::AsError;
    use crate::protocol::mc::McProtocol;
    use crate::proxy::ForwarderState;
    use parking_lot::Mutex;

    const BASE: &str = r#"
[[clusters]]
name = "mc"
listen_addr = "127.0.0.1:21211"
cache_type = "memcache"
servers = ["127.0.0.1:11211:1", "127.0.0.1:11212:1"]
"#;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Swappable for Recorder {
        async fn replace(&self, cc: &ClusterConfig) -> AsResult<u64> {
            let mut seen = self.seen.lock();
            seen.push(cc.servers.clone());
            Ok(seen.len() as u64 + 1)
        }

        fn close(&self) {}
    }

    fn reloader(recorder: Arc<Recorder>) -> Reloader {
        let mut slots: HashMap<String, Arc<dyn Swappable>> = HashMap::new();
        slots.insert("mc".to_string(), recorder);
        Reloader::new("unused.toml", &Config::parse(BASE).unwrap(), slots)
    }

    #[tokio::test]
    async fn swaps_only_on_routing_changes() {
        let recorder = Arc::new(Recorder::default());
        let mut reloader = reloader(recorder.clone());

        assert_eq!(reloader.apply(&Config::parse(BASE).unwrap()).await, 0);

        let edited = BASE.replace(", \"127.0.0.1:11212:1\"", "");
        assert_eq!(reloader.apply(&Config::parse(&edited).unwrap()).await, 1);
        assert_eq!(reloader.apply(&Config::parse(&edited).unwrap()).await, 0);
        assert_eq!(*recorder.seen.lock(), vec![vec!["127.0.0.1:11211:1".to_string()]]);
    }

    #[tokio::test]
    async fn listener_changes_are_not_applied() {
        let recorder = Arc::new(Recorder::default());
        let mut reloader = reloader(recorder.clone());
        let moved = BASE
            .replace("21211", "21212")
            .replace(", \"127.0.0.1:11212:1\"", "");
        assert_eq!(reloader.apply(&Config::parse(&moved).unwrap()).await, 0);
        assert!(recorder.seen.lock().is_empty());
    }

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

    #[tokio::test]
    async fn slot_replace_retires_previous_generation() {
        let config = Config::parse(BASE).unwrap();
        let cc = config.cluster("mc").unwrap();
        let slot = ForwarderSlot::<McProtocol>::build(cc, Arc::new(NoDial)).await.unwrap();
        let first = slot.current().load_full();
        let held = first.acquire().unwrap();

        assert_eq!(slot.replace(cc).await.unwrap(), 2);
        assert_eq!(slot.current().load().generation(), 2);
        assert_eq!(first.state(), ForwarderState::Closed);
        assert!(!first.is_torn_down());

        drop(held);
        assert!(first.is_torn_down());
    }
}
