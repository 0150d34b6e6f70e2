use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::com::{AsError, AsResult};
use crate::config::HashMethod;
use crate::standalone::fnv::hash_with;

const POINTER_PER_SERVER: f64 = 160.0;
const POINTER_PER_HASH: usize = 4;
const MAX_HOST_LEN: usize = 64;

#[derive(Debug, Clone)]
struct NodeHash {
    hash: u32,
    node: Arc<str>,
}

/// Ketama consistent hash ring.
///
/// Lookups read an immutable snapshot of the sorted points; `add_node` and
/// `del_node` rebuild the points under a writer lock and publish a new
/// snapshot, so lookups never block on membership changes.
pub struct HashRing {
    method: HashMethod,
    members: Mutex<Vec<(Arc<str>, usize)>>,
    ticks: ArcSwap<Vec<NodeHash>>,
}

impl HashRing {
    pub fn empty(method: HashMethod) -> Self {
        HashRing {
            method,
            members: Mutex::new(Vec::new()),
            ticks: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn new(method: HashMethod, nodes: Vec<String>, spots: Vec<usize>) -> AsResult<Self> {
        let ring = Self::empty(method);
        ring.init(nodes, spots)?;
        Ok(ring)
    }

    /// Replace the whole membership.
    pub fn init(&self, nodes: Vec<String>, spots: Vec<usize>) -> AsResult<()> {
        if nodes.len() != spots.len() {
            return Err(AsError::BadConfig(
                "servers: all server must have(or not) weight together".to_string(),
            ));
        }
        let mut members = self.members.lock();
        *members = nodes
            .into_iter()
            .map(Arc::<str>::from)
            .zip(spots)
            .collect();
        self.publish(&members);
        Ok(())
    }

    /// Add `node` with `spot` weight, or update the weight of an existing node.
    pub fn add_node(&self, node: &str, spot: usize) {
        let mut members = self.members.lock();
        if let Some(entry) = members.iter_mut().find(|(name, _)| name.as_ref() == node) {
            info!(node, from = entry.1, to = spot, "ketama update exist node spot");
            entry.1 = spot;
        } else {
            info!(node, spot, "ketama add node");
            members.push((node.into(), spot));
        }
        self.publish(&members);
    }

    /// Remove `node`; unknown nodes are ignored.
    pub fn del_node(&self, node: &str) {
        let mut members = self.members.lock();
        let before = members.len();
        members.retain(|(name, _)| name.as_ref() != node);
        if members.len() != before {
            info!(node, "ketama del node");
            self.publish(&members);
        }
    }

    pub fn get_node(&self, key: &[u8]) -> Option<Arc<str>> {
        self.get_node_by_hash(hash_with(self.method, key))
    }

    pub fn get_node_by_hash(&self, hash: u32) -> Option<Arc<str>> {
        let ticks = self.ticks.load();
        if ticks.is_empty() {
            return None;
        }
        let mut pos = ticks.partition_point(|tick| tick.hash < hash);
        if pos == ticks.len() {
            pos = 0;
        }
        Some(ticks[pos].node.clone())
    }

    /// Current members and their weights.
    pub fn members(&self) -> Vec<(String, usize)> {
        self.members
            .lock()
            .iter()
            .map(|(name, spot)| (name.to_string(), *spot))
            .collect()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.members
            .lock()
            .iter()
            .any(|(name, _)| name.as_ref() == node)
    }

    fn publish(&self, members: &[(Arc<str>, usize)]) {
        let ticks = build_ticks(members);
        debug!(points = ticks.len(), nodes = members.len(), "ketama ring rebuilt");
        self.ticks.store(Arc::new(ticks));
    }
}

fn node_hash(host: &[u8], align: usize) -> u32 {
    let md5::Digest(bs) = md5::compute(host);
    (u32::from(bs[3 + align * 4]) << 24)
        | (u32::from(bs[2 + align * 4]) << 16)
        | (u32::from(bs[1 + align * 4]) << 8)
        | u32::from(bs[align * 4])
}

fn build_ticks(members: &[(Arc<str>, usize)]) -> Vec<NodeHash> {
    let servern = members.len() as f64;
    let totalw = members.iter().map(|(_, spot)| *spot).sum::<usize>() as f64;
    if totalw == 0.0 {
        return Vec::new();
    }

    let mut ticks = Vec::new();
    for (node, spot) in members {
        let percent = (*spot as f64) / totalw;
        let per_servern =
            ((percent * POINTER_PER_SERVER / 4.0 * servern + 0.000_000_000_1) * 4.0) as usize;
        for pidx in 0..(per_servern / POINTER_PER_HASH) {
            let host = format!("{}-{}", node, pidx);
            let host = &host.as_bytes()[..host.len().min(MAX_HOST_LEN)];
            for x in 0..POINTER_PER_HASH {
                ticks.push(NodeHash {
                    hash: node_hash(host, x),
                    node: node.clone(),
                });
            }
        }
    }
    ticks.sort_by_key(|tick| tick.hash);
    ticks
}
