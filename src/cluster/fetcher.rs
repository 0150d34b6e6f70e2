use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::{seq::SliceRandom, thread_rng};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::backend::dialer::Dialer;
use crate::cluster::slots::SlotTable;
use crate::com::{AsError, AsResult};
use crate::protocol::redis::{RespCodec, RespValue};

const CLUSTER_NODES_REQUEST: &[u8] = b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nNODES\r\n";

/// Where `CLUSTER NODES` text comes from.
#[async_trait]
pub trait TopologySource: Send + Sync + 'static {
    async fn fetch(&self, addr: &str) -> AsResult<String>;
}

/// Sends `CLUSTER NODES` over a fresh connection.
pub struct RespTopology {
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
    read_timeout: Duration,
}

impl RespTopology {
    pub fn new(dialer: Arc<dyn Dialer>, dial_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            dialer,
            dial_timeout,
            read_timeout,
        }
    }
}

#[async_trait]
impl TopologySource for RespTopology {
    async fn fetch(&self, addr: &str) -> AsResult<String> {
        let (read, mut write) = self.dialer.dial(addr, self.dial_timeout).await?;
        let mut frames = FramedRead::new(read, RespCodec);
        let reply = timeout(self.read_timeout, async {
            write.write_all(CLUSTER_NODES_REQUEST).await?;
            write.flush().await?;
            match frames.next().await {
                Some(frame) => frame,
                None => Err(AsError::BackendClosed(addr.to_string())),
            }
        })
        .await??;

        match reply {
            RespValue::BulkString(text) => Ok(String::from_utf8_lossy(&text).into_owned()),
            other => {
                debug!(backend = %addr, reply = ?other, "unexpected CLUSTER NODES reply");
                Err(AsError::BadReply)
            }
        }
    }
}

/// Try seeds in random order until one yields a topology the table
/// accepts. Returns whether the table changed.
pub async fn fetch_once(
    cluster: &str,
    seeds: &[String],
    source: &dyn TopologySource,
    table: &SlotTable,
) -> AsResult<bool> {
    let mut candidates = seeds.to_vec();
    for master in table.masters() {
        if !candidates.iter().any(|seed| seed.as_str() == master.as_ref()) {
            candidates.push(master.to_string());
        }
    }
    {
        let mut rng = thread_rng();
        candidates.shuffle(&mut rng);
    }

    for seed in &candidates {
        let text = match source.fetch(seed).await {
            Ok(text) => text,
            Err(err) => {
                warn!(cluster = %cluster, seed = %seed, error = %err, "failed to fetch cluster nodes from seed");
                continue;
            }
        };
        match table.refresh(&text) {
            Ok(changed) => return Ok(changed),
            Err(err) => {
                warn!(cluster = %cluster, seed = %seed, error = %err, "seed returned unusable topology");
            }
        }
    }
    Err(AsError::ClusterAllSeedsDie(cluster.to_string()))
}
