use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::com::{
    DEFAULT_DIAL_TIMEOUT_MS, DEFAULT_FETCH_INTERVAL_MS, DEFAULT_NODE_CONNECTIONS,
    DEFAULT_PING_FAIL_LIMIT, DEFAULT_PING_INTERVAL_MS, DEFAULT_PING_QUARANTINE_MS,
    DEFAULT_READ_TIMEOUT_MS, DEFAULT_SLOWLOG_SLOWER_THAN_US,
    DEFAULT_WRITE_TIMEOUT_MS,
};

fn default_node_connections() -> usize {
    DEFAULT_NODE_CONNECTIONS
}

fn default_dial_timeout() -> u64 {
    DEFAULT_DIAL_TIMEOUT_MS
}

fn default_read_timeout() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_write_timeout() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

fn default_ping_fail_limit() -> usize {
    DEFAULT_PING_FAIL_LIMIT
}

fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_ping_quarantine() -> u64 {
    DEFAULT_PING_QUARANTINE_MS
}

fn default_fetch_interval() -> u64 {
    DEFAULT_FETCH_INTERVAL_MS
}

fn default_slowlog_log_slower_than() -> i64 {
    DEFAULT_SLOWLOG_SLOWER_THAN_US
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    clusters: Vec<ClusterConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse and validate configuration text.
    pub fn parse(raw: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(raw).context("failed to parse toml")?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    /// Ensure configuration correctness.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.clusters.is_empty() {
            bail!("configuration must declare at least one cluster");
        }

        let mut names = HashSet::new();
        let mut listens = HashSet::new();
        for cluster in &self.clusters {
            cluster.ensure_valid()?;
            if !names.insert(cluster.name.to_lowercase()) {
                bail!("duplicate cluster name detected: {}", cluster.name);
            }
            if !listens.insert(cluster.listen_addr.trim().to_string()) {
                bail!("duplicate listen_addr detected: {}", cluster.listen_addr);
            }
        }
        Ok(())
    }

    /// All configured clusters.
    pub fn clusters(&self) -> &[ClusterConfig] {
        &self.clusters
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|cc| cc.name == name)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    Memcache,
    Redis,
    RedisCluster,
}

impl Default for CacheType {
    fn default() -> Self {
        CacheType::RedisCluster
    }
}

/// Key hash functions available to the ketama ring.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum HashMethod {
    #[serde(rename = "fnv1a_64")]
    Fnv1a64,
    #[serde(rename = "fnv1_64")]
    Fnv164,
    #[serde(rename = "fnv1a_32")]
    Fnv1a32,
    #[serde(rename = "fnv1_32")]
    Fnv132,
}

impl Default for HashMethod {
    fn default() -> Self {
        HashMethod::Fnv1a64
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashDistribution {
    Ketama,
}

impl Default for HashDistribution {
    fn default() -> Self {
        HashDistribution::Ketama
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClusterConfig {
    pub name: String,
    pub listen_addr: String,
    #[serde(default)]
    pub cache_type: CacheType,
    #[serde(default)]
    pub hash_method: HashMethod,
    #[serde(default)]
    pub hash_distribution: HashDistribution,
    #[serde(default)]
    pub hash_tag: Option<String>,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "default_node_connections")]
    pub node_connections: usize,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
    #[serde(default)]
    pub ping_auto_eject: bool,
    #[serde(default = "default_ping_fail_limit")]
    pub ping_fail_limit: usize,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_quarantine")]
    pub ping_quarantine: u64,
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: u64,
    /// Microseconds; `-1` disables the slowlog.
    #[serde(default = "default_slowlog_log_slower_than")]
    pub slowlog_log_slower_than: i64,
}

impl ClusterConfig {
    /// Validate consistency of a cluster configuration.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("cluster name cannot be empty");
        }
        if self.listen_addr.trim().is_empty() {
            bail!("cluster {} listen_addr cannot be empty", self.name);
        }
        parse_port(&self.listen_addr).with_context(|| {
            format!(
                "cluster {} listen_addr {} is not a valid address",
                self.name, self.listen_addr
            )
        })?;
        if self.servers.is_empty() {
            bail!(
                "cluster {} must provide at least one backend server",
                self.name
            );
        }
        if self.node_connections == 0 {
            bail!("cluster {} node_connections must be > 0", self.name);
        }
        if let Some(tag) = &self.hash_tag {
            if !tag.is_empty() && tag.len() != 2 {
                bail!(
                    "cluster {} hash_tag must be exactly two bytes, got {:?}",
                    self.name,
                    tag
                );
            }
        }
        if self.ping_auto_eject {
            if self.ping_fail_limit == 0 {
                bail!("cluster {} ping_fail_limit must be > 0", self.name);
            }
            if self.ping_interval == 0 {
                bail!("cluster {} ping_interval must be > 0", self.name);
            }
            if self.ping_quarantine == 0 {
                bail!("cluster {} ping_quarantine must be > 0", self.name);
            }
        }
        if self.slowlog_log_slower_than < -1 {
            bail!(
                "cluster {} slowlog_log_slower_than must be >= -1",
                self.name
            );
        }

        match self.cache_type {
            CacheType::RedisCluster => {
                if self.fetch_interval == 0 {
                    bail!("cluster {} fetch_interval must be > 0", self.name);
                }
                for server in &self.servers {
                    let spec = ServerSpec::parse(server)
                        .with_context(|| format!("cluster {} has bad seed", self.name))?;
                    if spec.alias.is_some() {
                        bail!(
                            "cluster {} seed {} must not carry an alias",
                            self.name,
                            server
                        );
                    }
                }
            }
            CacheType::Memcache | CacheType::Redis => {
                let specs = self
                    .server_specs()
                    .with_context(|| format!("cluster {} has bad servers", self.name))?;
                let aliased = specs.iter().filter(|spec| spec.alias.is_some()).count();
                if aliased != 0 && aliased != specs.len() {
                    bail!(
                        "cluster {} servers must all have (or not have) an alias",
                        self.name
                    );
                }
                let mut seen = HashSet::new();
                for spec in &specs {
                    if !seen.insert(spec.name().to_string()) {
                        bail!("cluster {} has duplicate server {}", self.name, spec.name());
                    }
                }
            }
        }
        Ok(())
    }

    /// Parsed backend server lines.
    pub fn server_specs(&self) -> Result<Vec<ServerSpec>> {
        self.servers
            .iter()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| ServerSpec::parse(raw))
            .collect()
    }

    pub fn hash_tag_bytes(&self) -> Option<Vec<u8>> {
        self.hash_tag
            .as_ref()
            .filter(|tag| tag.len() == 2)
            .map(|tag| tag.as_bytes().to_vec())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval)
    }

    pub fn ping_quarantine(&self) -> Duration {
        Duration::from_millis(self.ping_quarantine)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval)
    }

    /// Whether a reload from `self` to `other` needs a new forwarder.
    ///
    /// The listener is never rebound, so `listen_addr` and `cache_type`
    /// changes are ignored here and reported by the reloader instead.
    pub fn routing_changed(&self, other: &ClusterConfig) -> bool {
        self.servers != other.servers
            || self.hash_method != other.hash_method
            || self.hash_distribution != other.hash_distribution
            || self.hash_tag != other.hash_tag
            || self.node_connections != other.node_connections
            || self.dial_timeout != other.dial_timeout
            || self.read_timeout != other.read_timeout
            || self.write_timeout != other.write_timeout
            || self.ping_auto_eject != other.ping_auto_eject
            || self.ping_fail_limit != other.ping_fail_limit
            || self.ping_interval != other.ping_interval
            || self.ping_quarantine != other.ping_quarantine
            || self.fetch_interval != other.fetch_interval
    }
}

/// One backend line: `host:port[:weight] [alias]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub addr: String,
    pub weight: usize,
    pub alias: Option<String>,
}

impl ServerSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split_whitespace();
        let address_part = match parts.next() {
            Some(part) => part,
            None => bail!("invalid server entry: {:?}", raw),
        };
        let alias = parts.next().map(|s| s.to_string());
        if parts.next().is_some() {
            bail!("invalid server entry: {:?}", raw);
        }
        let (addr, weight) = parse_address_weight(address_part)?;
        parse_port(&addr).with_context(|| format!("invalid server address {}", addr))?;
        Ok(Self {
            addr,
            weight,
            alias,
        })
    }

    /// Name placed on the hash ring: the alias when present, else the address.
    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.addr)
    }
}

fn parse_address_weight(token: &str) -> Result<(String, usize)> {
    let mut weight = 1usize;
    let mut address = token.to_string();

    if let Some(pos) = token.rfind(':') {
        let suffix = &token[pos + 1..];
        let prefix = &token[..pos];
        if !suffix.is_empty()
            && suffix.chars().all(|c| c.is_ascii_digit())
            && prefix.rsplit_once(':').is_some()
        {
            weight = suffix
                .parse::<usize>()
                .with_context(|| format!("invalid weight in {}", token))?;
            if weight == 0 {
                bail!("server {} weight must be > 0", token);
            }
            address = prefix.to_string();
        }
    }

    Ok((address, weight))
}

fn parse_port(addr: &str) -> Result<u16> {
    if let Ok(socket) = addr.parse::<std::net::SocketAddr>() {
        return Ok(socket.port());
    }

    if let Some((_, port_str)) = addr.rsplit_once(':') {
        let port = port_str
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid port component {}", port_str))?;
        return Ok(port);
    }

    bail!("unable to extract port from address {}", addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[clusters]]
name = "mc"
listen_addr = "127.0.0.1:21211"
cache_type = "memcache"
hash_tag = "{}"
servers = ["127.0.0.1:11211:10 mc1", "127.0.0.1:11212:20 mc2"]
ping_auto_eject = true

[[clusters]]
name = "rc"
listen_addr = "127.0.0.1:26379"
cache_type = "redis_cluster"
servers = ["127.0.0.1:7000", "127.0.0.1:7001"]
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.clusters().len(), 2);
        let mc = cfg.cluster("mc").unwrap();
        assert_eq!(mc.cache_type, CacheType::Memcache);
        assert_eq!(mc.hash_method, HashMethod::Fnv1a64);
        assert_eq!(mc.node_connections, DEFAULT_NODE_CONNECTIONS);
        assert_eq!(mc.ping_fail_limit, DEFAULT_PING_FAIL_LIMIT);
        assert_eq!(mc.ping_quarantine(), Duration::from_secs(300));
        assert_eq!(mc.hash_tag_bytes(), Some(b"{}".to_vec()));

        let specs = mc.server_specs().unwrap();
        assert_eq!(
            specs[1],
            ServerSpec {
                addr: "127.0.0.1:11212".to_string(),
                weight: 20,
                alias: Some("mc2".to_string()),
            }
        );
        assert_eq!(specs[1].name(), "mc2");
    }

    #[test]
    fn server_without_weight_defaults_to_one() {
        let spec = ServerSpec::parse("10.0.0.1:6379").unwrap();
        assert_eq!(spec.addr, "10.0.0.1:6379");
        assert_eq!(spec.weight, 1);
        assert_eq!(spec.name(), "10.0.0.1:6379");
    }

    #[test]
    fn rejects_mixed_alias_usage() {
        let raw = r#"
[[clusters]]
name = "mc"
listen_addr = "127.0.0.1:21211"
cache_type = "memcache"
servers = ["127.0.0.1:11211:1 a", "127.0.0.1:11212:1"]
"#;
        let err = Config::parse(raw).unwrap_err();
        assert!(format!("{err:#}").contains("alias"));
    }

    #[test]
    fn rejects_bad_hash_tag_and_duplicates() {
        let raw = r#"
[[clusters]]
name = "r"
listen_addr = "127.0.0.1:6000"
cache_type = "redis"
hash_tag = "{"
servers = ["127.0.0.1:6379:1"]
"#;
        assert!(Config::parse(raw).is_err());

        let raw = r#"
[[clusters]]
name = "r"
listen_addr = "127.0.0.1:6000"
cache_type = "redis"
servers = ["127.0.0.1:6379:1"]

[[clusters]]
name = "R"
listen_addr = "127.0.0.1:6001"
cache_type = "redis"
servers = ["127.0.0.1:6379:1"]
"#;
        assert!(Config::parse(raw).is_err());
    }

    #[test]
    fn rejects_zero_ping_timings_when_ejecting() {
        for field in ["ping_interval", "ping_quarantine"] {
            let raw = format!(
                "[[clusters]]\nname = \"mc\"\nlisten_addr = \"127.0.0.1:21211\"\ncache_type = \"memcache\"\nservers = [\"127.0.0.1:11211:1\"]\nping_auto_eject = true\n{field} = 0\n"
            );
            let err = Config::parse(&raw).unwrap_err();
            assert!(format!("{err:#}").contains(field));

            let relaxed = raw.replace("ping_auto_eject = true", "ping_auto_eject = false");
            assert!(Config::parse(&relaxed).is_ok());
        }
    }

    #[test]
    fn slowlog_defaults_and_bounds() {
        let cfg = Config::parse(SAMPLE).unwrap();
        let mc = cfg.cluster("mc").unwrap();
        assert_eq!(mc.slowlog_log_slower_than, DEFAULT_SLOWLOG_SLOWER_THAN_US);

        let off = SAMPLE.replace("ping_auto_eject = true", "ping_auto_eject = true\nslowlog_log_slower_than = -1");
        let off = Config::parse(&off).unwrap();
        assert_eq!(off.cluster("mc").unwrap().slowlog_log_slower_than, -1);
        let bad = SAMPLE.replace("ping_auto_eject = true", "ping_auto_eject = true\nslowlog_log_slower_than = -2");
        assert!(Config::parse(&bad).is_err());
    }

    #[test]
    fn routing_changes_detected_on_servers_only_edits() {
        let cfg = Config::parse(SAMPLE).unwrap();
        let mc = cfg.cluster("mc").unwrap().clone();
        let mut edited = mc.clone();
        assert!(!mc.routing_changed(&edited));
        edited.servers.pop();
        assert!(mc.routing_changed(&edited));
    }
}
