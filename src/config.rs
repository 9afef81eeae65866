use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::webrtc::types::RtcConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub ipfs: IpfsConfig,
    #[serde(default)]
    pub rtc: RtcSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Fullnode JSON-RPC endpoint
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Published package carrying the rtc_connect module
    #[serde(default = "default_package_id")]
    pub package_id: String,
    /// Upper bound on the finality wait after submission
    #[serde(default = "default_finality_timeout_ms")]
    pub finality_timeout_ms: u64,
    /// Delay between finality checks
    #[serde(default = "default_finality_poll_ms")]
    pub finality_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpfsConfig {
    /// Pinning endpoint (POST, JSON payload)
    #[serde(default = "default_ipfs_api_url")]
    pub api_url: String,
    /// Gateway serving /ipfs/{cid}
    #[serde(default = "default_ipfs_gateway_url")]
    pub gateway_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcSection {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Fixed delay between ledger event queries
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum events fetched per query
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_package_id() -> String {
    "0x0".to_string()
}

fn default_finality_timeout_ms() -> u64 {
    30_000
}

fn default_finality_poll_ms() -> u64 {
    500
}

fn default_ipfs_api_url() -> String {
    "https://api.pinata.cloud/pinning/pinJSONToIPFS".to_string()
}

fn default_ipfs_gateway_url() -> String {
    "https://gateway.pinata.cloud".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_poll_interval_ms() -> u64 {
    15_000
}

fn default_page_size() -> usize {
    5
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            package_id: default_package_id(),
            finality_timeout_ms: default_finality_timeout_ms(),
            finality_poll_ms: default_finality_poll_ms(),
        }
    }
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            api_url: default_ipfs_api_url(),
            gateway_url: default_ipfs_gateway_url(),
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

impl Default for RtcSection {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            poll_interval_ms: default_poll_interval_ms(),
            page_size: default_page_size(),
        }
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            let content =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn rtc_config(&self) -> RtcConfig {
        RtcConfig {
            stun_servers: self.rtc.stun_servers.clone(),
            poll_interval_ms: self.rtc.poll_interval_ms,
            page_size: self.rtc.page_size,
        }
    }
}

/// Get the chainrtc directory (~/.chainrtc)
pub fn get_chainrtc_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chainrtc")
}

/// Get the config file path (~/.chainrtc/config.toml)
pub fn get_config_path() -> PathBuf {
    get_chainrtc_dir().join("config.toml")
}

/// Get the identity key path (~/.chainrtc/identity.key)
pub fn get_key_path() -> PathBuf {
    get_chainrtc_dir().join("identity.key")
}

/// Ensure the identity key exists, generating one if not present.
/// Returns (key, was_generated)
pub fn ensure_signing_key() -> Result<(SigningKey, bool)> {
    let key_path = get_key_path();

    if key_path.exists() {
        Ok((read_signing_key()?, false))
    } else {
        Ok((generate_signing_key()?, true))
    }
}

/// Read the existing identity key
pub fn read_signing_key() -> Result<SigningKey> {
    let key_path = get_key_path();
    let content = fs::read_to_string(&key_path).context("Failed to read identity key")?;
    let bytes = hex::decode(content.trim()).context("Identity key is not valid hex")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Identity key must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Generate a new identity key and save it to file
pub fn generate_signing_key() -> Result<SigningKey> {
    let key_path = get_key_path();

    if let Some(parent) = key_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let key = SigningKey::generate(&mut OsRng);
    fs::write(&key_path, hex::encode(key.to_bytes()))?;

    // Set permissions to 0600 (owner read/write only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(&key_path, perms)?;
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.ledger.rpc_url, "http://127.0.0.1:9000");
        assert_eq!(config.rtc.poll_interval_ms, 15_000);
        assert_eq!(config.rtc.page_size, 5);
        assert!(config
            .ipfs
            .api_url
            .ends_with("/pinning/pinJSONToIPFS"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.ledger.package_id, config.ledger.package_id);
        assert_eq!(parsed.rtc.stun_servers, config.rtc.stun_servers);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [ledger]
            package_id = "0xdeadbeef"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.ledger.package_id, "0xdeadbeef");
        assert_eq!(parsed.ledger.rpc_url, default_rpc_url());
        assert_eq!(parsed.rtc.page_size, 5);
    }

    #[test]
    fn test_signing_key_generation() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::env::set_var("HOME", temp_dir.path());

        let (key, was_generated) = ensure_signing_key()?;
        assert!(was_generated);
        assert!(get_key_path().exists());

        let (key2, was_generated2) = ensure_signing_key()?;
        assert!(!was_generated2);
        assert_eq!(key.to_bytes(), key2.to_bytes());

        Ok(())
    }
}
