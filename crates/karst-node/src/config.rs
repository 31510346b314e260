//! Node configuration.
//!
//! Consensus-critical knobs live in [`ChainConfig`]; everything here is
//! node-local. Configurations load from the resources directory or are
//! built programmatically (tests, embedded use).

use serde::Deserialize;

use karst_core::chain_config::ChainConfig;
use karst_core::error::KarstError;

fn default_port() -> u16 {
    7900
}

fn default_api_port() -> u16 {
    7901
}

fn default_max_connections() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

/// Start and repeat delay for one scheduled task, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskTiming {
    pub start_delay_ms: u64,
    pub repeat_delay_ms: u64,
}

impl TaskTiming {
    pub fn new(start_delay_ms: u64, repeat_delay_ms: u64) -> Self {
        Self { start_delay_ms, repeat_delay_ms }
    }
}

/// Timings for the mandatory tasks.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskScheduleConfig {
    pub connect_peers: TaskTiming,
    pub synchronizer: TaskTiming,
    pub harvesting: TaskTiming,
}

impl Default for TaskScheduleConfig {
    fn default() -> Self {
        Self {
            connect_peers: TaskTiming::new(2_000, 10_000),
            synchronizer: TaskTiming::new(5_000, 3_000),
            harvesting: TaskTiming::new(10_000, 1_000),
        }
    }
}

/// Configuration for a full node instance.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Peer-to-peer port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Hex-encoded 32-byte seed of the node's boot key. Harvesting keys
    /// are unlocked separately; the boot key only identifies the node.
    #[serde(default)]
    pub boot_key: String,
    /// Upper bound on simultaneously connected peers.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Whether this node forges blocks.
    #[serde(default = "default_true")]
    pub harvesting_enabled: bool,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub tasks: TaskScheduleConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_port: default_api_port(),
            boot_key: String::new(),
            max_connections: default_max_connections(),
            harvesting_enabled: true,
            chain: ChainConfig::default(),
            tasks: TaskScheduleConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Validate cross-field constraints; violations are startup-fatal.
    pub fn validate(&self) -> Result<(), KarstError> {
        self.chain.validate()?;
        if self.port == self.api_port {
            return Err(KarstError::Config(format!(
                "port and api_port must differ (both {})",
                self.port,
            )));
        }
        if !self.boot_key.is_empty() {
            let decoded = decode_hex_key(&self.boot_key)?;
            if decoded.len() != 32 {
                return Err(KarstError::Config(format!(
                    "boot_key must be 32 bytes, got {}",
                    decoded.len(),
                )));
            }
        }
        if self.max_connections == 0 {
            return Err(KarstError::Config("max_connections must be nonzero".into()));
        }
        Ok(())
    }

    /// The boot-key seed, if configured.
    pub fn boot_key_seed(&self) -> Result<Option<[u8; 32]>, KarstError> {
        if self.boot_key.is_empty() {
            return Ok(None);
        }
        let decoded = decode_hex_key(&self.boot_key)?;
        let seed: [u8; 32] = decoded
            .try_into()
            .map_err(|_| KarstError::Config("boot_key must be 32 bytes".into()))?;
        Ok(Some(seed))
    }
}

fn decode_hex_key(hex: &str) -> Result<Vec<u8>, KarstError> {
    if hex.len() % 2 != 0 {
        return Err(KarstError::Config("boot_key has odd length".into()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| KarstError::Config(format!("boot_key is not hex: {hex}")))
        })
        .collect()
}
