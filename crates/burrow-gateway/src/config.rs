//! Gateway configuration: forward rules, an optional YAML file, and CLI overrides

use anyhow::{Context, Result};
use burrow_relay::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::Args;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// A local listener whose clients are tunneled to `destination`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub local: String,
    pub destination: String,
}

impl FromStr for ForwardRule {
    type Err = String;

    /// Parse `LOCAL=DEST`, e.g. `127.0.0.1:15432=db.internal:5432`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, destination) = s
            .split_once('=')
            .ok_or_else(|| format!("Invalid forward '{}' (expected LOCAL=DEST)", s))?;

        let rule = ForwardRule {
            local: local.trim().to_string(),
            destination: destination.trim().to_string(),
        };
        rule.validate().map_err(|e| e.to_string())?;
        Ok(rule)
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.destination)
    }
}

impl ForwardRule {
    fn validate(&self) -> Result<()> {
        validate_address(&self.local, "local")?;
        validate_address(&self.destination, "destination")
    }
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Address agents connect to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    #[serde(default)]
    pub forwards: Vec<ForwardRule>,

    #[serde(default)]
    pub gateway: GatewaySection,

    /// Relay worker tunables
    #[serde(default)]
    pub relay: RelaySection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Origin of gateway-side tunnel ids
    pub label: Option<String>,
    pub agent_wait_secs: Option<u64>,
    pub dial_attempts: Option<usize>,
    pub response_timeout_secs: Option<u64>,
    pub max_idle_streams: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelaySection {
    pub chunk_size: Option<usize>,
    /// 0 disables the idle watchdog
    pub idle_timeout_secs: Option<u64>,
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Debug)]
pub struct GatewaySettings {
    pub listen: String,
    pub forwards: Vec<ForwardRule>,
    pub gateway: GatewayConfig,
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
pub fn build_gateway_settings(args: Args) -> Result<GatewaySettings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    merge(args, file)
}

fn merge(args: Args, file: ConfigFile) -> Result<GatewaySettings> {
    let listen = args
        .listen
        .or(file.listen)
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    validate_address(&listen, "listen")?;

    // Forwards on the command line replace the file's list
    let forwards = if args.forward.is_empty() {
        for rule in &file.forwards {
            rule.validate()
                .with_context(|| format!("Invalid forward in config file: {}", rule))?;
        }
        file.forwards
    } else {
        args.forward
    };

    let mut gateway = GatewayConfig::default();
    let section = file.gateway;
    if let Some(label) = section.label {
        gateway.label = label;
    }
    if let Some(secs) = args.agent_wait.or(section.agent_wait_secs) {
        gateway.agent_wait = Duration::from_secs(secs);
    }
    if let Some(attempts) = section.dial_attempts {
        gateway.dial_attempts = attempts;
    }
    if let Some(secs) = section.response_timeout_secs {
        gateway.response_timeout = Duration::from_secs(secs);
    }
    if let Some(max) = section.max_idle_streams {
        gateway.max_idle_streams = max;
    }

    let section = file.relay;
    if let Some(chunk_size) = section.chunk_size {
        if chunk_size == 0 || chunk_size > burrow_relay::MAX_CHUNK_SIZE {
            anyhow::bail!("Invalid chunk size {}", chunk_size);
        }
        gateway.relay.chunk_size = chunk_size;
    }
    if let Some(secs) = args.idle_timeout.or(section.idle_timeout_secs) {
        gateway.relay.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(secs) = section.drain_timeout_secs {
        gateway.relay.drain_timeout = Duration::from_secs(secs);
    }

    Ok(GatewaySettings {
        listen,
        forwards,
        gateway,
    })
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
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
