//! Agent configuration: an optional YAML file merged with command-line arguments

use anyhow::{Context, Result};
use burrow_proto::SessionMode;
use burrow_relay::{ReconnectConfig, RelayConfig, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::Args;

pub const DEFAULT_GATEWAY: &str = "127.0.0.1:8080";

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,

    #[serde(default)]
    pub agent: AgentSection,

    /// Relay worker tunables
    #[serde(default)]
    pub relay: RelaySection,

    #[serde(default)]
    pub reconnect: ReconnectSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Gateway address (host:port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// `stream` or `call`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<SessionMode>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelaySection {
    pub chunk_size: Option<usize>,
    pub dial_timeout_secs: Option<u64>,
    /// 0 leaves the OS keep-alive settings alone
    pub keepalive_secs: Option<u64>,
    /// 0 disables the idle watchdog
    pub idle_timeout_secs: Option<u64>,
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReconnectSection {
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub max_attempts: Option<usize>,
}

/// Everything the agent needs to run
#[derive(Debug)]
pub struct AgentSettings {
    pub agent_id: String,
    pub gateway_addr: String,
    pub mode: SessionMode,
    pub relay: RelayConfig,
    pub reconnect: ReconnectConfig,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file, giving precedence to CLI args
pub fn build_agent_settings(args: Args) -> Result<AgentSettings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    merge(args, file)
}

fn merge(args: Args, file: ConfigFile) -> Result<AgentSettings> {
    let gateway_addr = args
        .gateway
        .or(file.gateway.address)
        .unwrap_or_else(|| DEFAULT_GATEWAY.to_string());
    validate_address(&gateway_addr, "gateway")?;

    let mode = args.mode.or(file.gateway.mode).unwrap_or_default();

    let agent_id = args.agent_id.or(file.agent.id).unwrap_or_else(|| {
        let id = format!("agent-{}", Uuid::new_v4());
        info!("Auto-generated agent ID: {}", id);
        id
    });
    if agent_id.trim().is_empty() {
        anyhow::bail!("Agent ID cannot be empty");
    }

    let mut relay = RelayConfig::default();
    let section = file.relay;
    if let Some(chunk_size) = args.chunk_size.or(section.chunk_size) {
        relay.chunk_size = chunk_size;
    }
    if let Some(secs) = args.dial_timeout.or(section.dial_timeout_secs) {
        relay.dial_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = section.keepalive_secs {
        relay.keepalive = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(secs) = args.idle_timeout.or(section.idle_timeout_secs) {
        relay.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(secs) = section.drain_timeout_secs {
        relay.drain_timeout = Duration::from_secs(secs);
    }
    validate_chunk_size(relay.chunk_size)?;

    let mut reconnect = ReconnectConfig::default();
    let section = file.reconnect;
    if let Some(ms) = section.initial_backoff_ms {
        reconnect.initial_backoff = Duration::from_millis(ms);
    }
    if let Some(secs) = section.max_backoff_secs {
        reconnect.max_backoff = Duration::from_secs(secs);
    }
    if let Some(max_attempts) = args.max_attempts.or(section.max_attempts) {
        reconnect.max_attempts = Some(max_attempts);
    }

    Ok(AgentSettings {
        agent_id,
        gateway_addr,
        mode,
        relay,
        reconnect,
    })
}

fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        anyhow::bail!(
            "Invalid chunk size {} (expected 1..={})",
            chunk_size,
            MAX_CHUNK_SIZE
        );
    }
    Ok(())
}

/// Validate address format (should be host:port)
pub fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    };

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}
