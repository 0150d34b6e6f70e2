use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::com::{AsError, AsResult};
use crate::protocol::redis::SLOT_COUNT;
use crate::utils::{crc16, trim_hash_tag};

const SLOTS: usize = SLOT_COUNT as usize;

/// Slot of `key` after hash tag trimming.
pub fn slot_for_key(key: &[u8], hash_tag: Option<&[u8]>) -> u16 {
    crc16(trim_hash_tag(key, hash_tag)) & (SLOT_COUNT - 1)
}

/// Slot ownership parsed from one `CLUSTER NODES` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub masters: Vec<Arc<str>>,
    pub replicas: Vec<Vec<Arc<str>>>,
}

impl Topology {
    /// Distinct master addresses in slot order.
    pub fn master_addrs(&self) -> Vec<Arc<str>> {
        let mut seen = HashSet::new();
        self.masters
            .iter()
            .filter(|addr| seen.insert(Arc::clone(addr)))
            .cloned()
            .collect()
    }
}

struct NodeLine<'a> {
    id: &'a str,
    addr: &'a str,
    master: bool,
    slave: bool,
    master_id: &'a str,
    slots: Vec<u16>,
}

fn parse_node_line(line: &str) -> AsResult<NodeLine<'_>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return Err(AsError::BadReply);
    }
    let addr = fields[1].split('@').next().unwrap_or(fields[1]);
    let flags = fields[2];
    let mut slots = Vec::new();
    for field in &fields[8..] {
        parse_slot_field(field, &mut slots)?;
    }
    Ok(NodeLine {
        id: fields[0],
        addr,
        master: flags.contains("master"),
        slave: !flags.contains("master") && flags.contains("slave"),
        master_id: fields[3],
        slots,
    })
}

/// `N`, `A-B` and `[N->-id]` add slots; `[N-<-id]` and `-` add nothing.
fn parse_slot_field(field: &str, slots: &mut Vec<u16>) -> AsResult<()> {
    if field.is_empty() || field == "-" {
        return Ok(());
    }
    if let Some(inner) = field.strip_prefix('[') {
        if let Some((slot, _)) = inner.split_once("->-") {
            slots.push(parse_slot(slot)?);
        }
        return Ok(());
    }
    match field.split_once('-') {
        Some((begin, end)) => {
            let (begin, end) = (parse_slot(begin)?, parse_slot(end)?);
            if end < begin {
                return Err(AsError::BadReply);
            }
            slots.extend(begin..=end);
        }
        None => slots.push(parse_slot(field)?),
    }
    Ok(())
}

fn parse_slot(raw: &str) -> AsResult<u16> {
    raw.parse::<u16>()
        .ok()
        .filter(|slot| *slot < SLOT_COUNT)
        .ok_or(AsError::BadReply)
}

/// Parse a `CLUSTER NODES` reply. Every slot must have a master.
pub fn parse_cluster_nodes(text: &str) -> AsResult<Topology> {
    let lines = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_node_line)
        .collect::<AsResult<Vec<_>>>()?;

    let mut masters: Vec<Option<Arc<str>>> = vec![None; SLOTS];
    let mut by_id: HashMap<&str, &NodeLine<'_>> = HashMap::new();
    for node in lines.iter().filter(|node| node.master) {
        by_id.insert(node.id, node);
        let addr: Arc<str> = node.addr.into();
        for slot in &node.slots {
            masters[*slot as usize] = Some(addr.clone());
        }
    }

    let mut replicas: Vec<Vec<Arc<str>>> = vec![Vec::new(); SLOTS];
    for node in lines.iter().filter(|node| node.slave) {
        if let Some(master) = by_id.get(node.master_id) {
            let addr: Arc<str> = node.addr.into();
            for slot in &master.slots {
                replicas[*slot as usize].push(addr.clone());
            }
        }
    }

    let masters = masters
        .into_iter()
        .enumerate()
        .map(|(slot, owner)| owner.ok_or(AsError::SlotUncovered(slot as u16)))
        .collect::<AsResult<Vec<_>>>()?;
    Ok(Topology { masters, replicas })
}

struct SlotState {
    topology: Option<Topology>,
    checksum: Option<[u8; 16]>,
}

/// 16384-entry slot to master table.
pub struct SlotTable {
    cluster: Arc<str>,
    state: RwLock<SlotState>,
}

impl SlotTable {
    pub fn new(cluster: Arc<str>) -> Self {
        Self {
            cluster,
            state: RwLock::new(SlotState {
                topology: None,
                checksum: None,
            }),
        }
    }

    /// Apply a `CLUSTER NODES` reply. Returns whether a new table was
    /// published; identical text is skipped, bad text keeps the old table.
    pub fn refresh(&self, text: &str) -> AsResult<bool> {
        let md5::Digest(checksum) = md5::compute(text.as_bytes());
        if self.state.read().checksum == Some(checksum) {
            debug!(cluster = %self.cluster, "cluster topology unchanged");
            return Ok(false);
        }
        let topology = match parse_cluster_nodes(text) {
            Ok(topology) => topology,
            Err(err) => {
                warn!(cluster = %self.cluster, error = %err, "rejecting cluster topology");
                return Err(err);
            }
        };

        let mut state = self.state.write();
        state.checksum = Some(checksum);
        if state.topology.as_ref() == Some(&topology) {
            return Ok(false);
        }
        info!(
            cluster = %self.cluster,
            masters = topology.master_addrs().len(),
            "cluster slot table refreshed"
        );
        state.topology = Some(topology);
        Ok(true)
    }

    pub fn get_master(&self, slot: u16) -> Option<Arc<str>> {
        let state = self.state.read();
        state
            .topology
            .as_ref()
            .and_then(|topology| topology.masters.get(slot as usize).cloned())
    }

    /// Point `slot` at `addr` after a `MOVED` reply.
    ///
    /// The stored checksum is dropped so the next fetch republishes even
    /// if the cluster reports the same text as before.
    pub fn apply_moved(&self, slot: u16, addr: &str) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let topology = match state.topology.as_mut() {
            Some(topology) => topology,
            None => return,
        };
        match topology.masters.get_mut(slot as usize) {
            Some(owner) if owner.as_ref() != addr => {
                debug!(cluster = %self.cluster, slot, from = %owner, to = %addr, "slot moved");
                *owner = addr.into();
                state.checksum = None;
            }
            _ => {}
        }
    }

    /// Distinct master addresses currently owning slots.
    pub fn masters(&self) -> Vec<Arc<str>> {
        self.state
            .read()
            .topology
            .as_ref()
            .map(Topology::master_addrs)
            .unwrap_or_default()
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().topology.is_some()
    }
}
