//! Command line and environment configuration

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Result};
use clap::Parser;

use crate::mesh::{ClusterConfig, Node, ReconcilerConfig, UdpConfig};

/// Exponential backoff applied to the startup join.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSettings {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "gossipkv", version, about = "Gossip-replicated key-value store")]
pub struct Config {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, env = "GOSSIPKV_DEBUG")]
    pub debug: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "GOSSIPKV_LOG_JSON")]
    pub log_json: bool,

    /// HTTP API port.
    #[arg(long = "api-port", alias = "apiport", env = "GOSSIPKV_API_PORT", default_value_t = 7080)]
    pub api_port: u16,

    /// Give up joining the cluster after this many seconds.
    #[arg(long = "retry-secs", alias = "retrysecs", env = "GOSSIPKV_RETRY_SECS", default_value_t = 300)]
    pub retry_secs: u64,

    /// Address the cluster transport binds to and advertises.
    #[arg(long = "cluster-ip", alias = "clusterip", env = "GOSSIPKV_CLUSTER_IP", default_value = "127.0.0.1")]
    pub cluster_ip: String,

    #[arg(long = "cluster-port", alias = "clusterport", env = "GOSSIPKV_CLUSTER_PORT", default_value_t = 7947)]
    pub cluster_port: u16,

    /// Unique node name.
    #[arg(long = "cluster-node", alias = "clusternode", env = "HOSTNAME", default_value = "node1")]
    pub cluster_node: String,

    /// Host whose addresses are used as join seeds. This is an address
    /// lookup, not an SRV query: every discovered seed is contacted on the
    /// local cluster port. Use --seeds for peers on other ports. An empty
    /// value together with no --seeds starts a new cluster.
    #[arg(
        long = "service-discovery-host",
        alias = "servicediscoveryhost",
        env = "GOSSIPKV_SERVICE_DISCOVERY_HOST",
        default_value = "localhost"
    )]
    pub service_discovery_host: String,

    /// Extra seeds (`host:port`), comma separated.
    #[arg(long, env = "GOSSIPKV_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<String>,

    #[arg(long, env = "GOSSIPKV_RETRANSMIT_MULT", default_value_t = 3)]
    pub retransmit_mult: usize,

    #[arg(long, env = "GOSSIPKV_GOSSIP_INTERVAL_MS", default_value_t = 200)]
    pub gossip_interval_ms: u64,

    /// Peers contacted per gossip round.
    #[arg(long, env = "GOSSIPKV_GOSSIP_NODES", default_value_t = 3)]
    pub gossip_nodes: usize,

    #[arg(long, env = "GOSSIPKV_DEAD_TIMEOUT_SECS", default_value_t = 5)]
    pub dead_timeout_secs: u64,

    #[arg(long, env = "GOSSIPKV_MEMBER_REPORT_SECS", default_value_t = 30)]
    pub member_report_secs: u64,

    #[arg(long, env = "GOSSIPKV_LEAVE_TIMEOUT_SECS", default_value_t = 5)]
    pub leave_timeout_secs: u64,

    /// Periodic full state exchange with a random peer; 0 disables it.
    /// Deleted keys may come back from peers that still hold them once the
    /// delete's tombstone has been pruned.
    #[arg(long, env = "GOSSIPKV_ANTI_ENTROPY_SECS", default_value_t = 0)]
    pub anti_entropy_secs: u64,

    /// How long a delete keeps rejecting older writes of the same key.
    #[arg(long, env = "GOSSIPKV_TOMBSTONE_TTL_SECS", default_value_t = 600)]
    pub tombstone_ttl_secs: u64,

    /// Capacity of the inbound message channel.
    #[arg(long, env = "GOSSIPKV_INBOUND_CAPACITY", default_value_t = 1024)]
    pub inbound_capacity: usize,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.cluster_node.trim().is_empty() {
            bail!("cluster node name must not be empty");
        }
        if self.retransmit_mult == 0 {
            bail!("retransmit multiplier must be at least 1");
        }
        if self.gossip_interval_ms == 0 {
            bail!("gossip interval must be positive");
        }
        if self.gossip_nodes == 0 {
            bail!("gossip nodes must be at least 1");
        }
        if self.inbound_capacity == 0 {
            bail!("inbound capacity must be at least 1");
        }
        self.node().socket_addr()?;
        Ok(())
    }

    pub fn node(&self) -> Node {
        Node::new(&self.cluster_node, &self.cluster_ip, self.cluster_port)
    }

    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.api_port))
    }

    pub fn anti_entropy_interval(&self) -> Option<Duration> {
        (self.anti_entropy_secs > 0).then(|| Duration::from_secs(self.anti_entropy_secs))
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            retransmit_mult: self.retransmit_mult,
            anti_entropy: self.anti_entropy_interval().is_some(),
        }
    }

    pub fn udp_config(&self) -> UdpConfig {
        UdpConfig {
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            gossip_nodes: self.gossip_nodes,
            dead_timeout: Duration::from_secs(self.dead_timeout_secs),
            push_pull_interval: self.anti_entropy_interval(),
            ..UdpConfig::default()
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            member_report_interval: Duration::from_secs(self.member_report_secs.max(1)),
            leave_timeout: Duration::from_secs(self.leave_timeout_secs),
            tombstone_ttl: Duration::from_secs(self.tombstone_ttl_secs),
        }
    }

    pub fn backoff_settings(&self) -> BackoffSettings {
        BackoffSettings {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(self.retry_secs),
        }
    }
}
