//! Proxy and daemon configuration loaded from TOML.
//!
//! Raw configs are what operators write; `validate` turns them into settings
//! the servers run with, reporting every problem at once.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use reqwest::Url;
use russh::keys::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys;

/// Startup configuration problems. The process must not accept connections.
#[derive(Debug, Error)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

impl ConfigError {
    fn check(problems: Vec<String>) -> Result<(), Self> {
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Self { problems })
        }
    }
}

/// Load a TOML config file, or return defaults if the file doesn't exist.
pub fn load_or_default<T>(path: &Path) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

fn parse_listen_addr(addr: &str, problems: &mut Vec<String>) -> Option<SocketAddr> {
    match addr.parse() {
        Ok(addr) => Some(addr),
        Err(e) => {
            problems.push(format!("failed to parse listen address {:?}: {}", addr, e));
            None
        }
    }
}

/// Proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// SSH listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Host key presented to clients, as OpenSSH/PEM text
    pub host_key: Option<String>,

    /// Path to the host key, used when `host_key` is unset
    pub host_key_path: Option<PathBuf>,

    /// Base URL of the placement service (required)
    pub placement_url: String,

    /// Base URL of the authorization service; unset disables the delegated realm
    pub authorization_url: Option<String>,

    /// Only admit delegated-realm clients
    pub delegated_only: bool,

    /// Username the proxy presents to backend daemons
    pub backend_user: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key: None,
            host_key_path: None,
            placement_url: String::new(),
            authorization_url: None,
            delegated_only: false,
            backend_user: "vcap".to_string(),
        }
    }
}

/// Validated proxy settings.
#[derive(Debug)]
pub struct ProxySettings {
    pub listen_addr: SocketAddr,
    pub host_key: PrivateKey,
    pub placement_url: Url,
    pub authorization_url: Option<Url>,
    pub delegated_only: bool,
    pub backend_user: String,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<ProxySettings, ConfigError> {
        let mut problems = Vec::new();

        let listen_addr = parse_listen_addr(&self.listen_addr, &mut problems);

        let host_key = match keys::load_host_key(
            self.host_key.as_deref(),
            self.host_key_path.as_deref(),
        ) {
            Ok(Some(key)) => Some(key),
            Ok(None) => {
                problems.push("host key is required".to_string());
                None
            }
            Err(e) => {
                problems.push(format!("failed to parse host key: {:#}", e));
                None
            }
        };

        let placement_url = if self.placement_url.trim().is_empty() {
            problems.push("placement URL is required".to_string());
            None
        } else {
            match Url::parse(self.placement_url.trim()) {
                Ok(url) => Some(url),
                Err(e) => {
                    problems.push(format!("failed to parse placement URL: {}", e));
                    None
                }
            }
        };

        let authorization_url = match self.authorization_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match Url::parse(raw) {
                Ok(url) => Some(url),
                Err(e) => {
                    problems.push(format!("failed to parse authorization URL: {}", e));
                    None
                }
            },
        };

        // Both realms would be unusable.
        let authorization_configured = self
            .authorization_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty());
        if self.delegated_only && !authorization_configured {
            problems.push("delegated-only mode requires an authorization URL".to_string());
        }

        ConfigError::check(problems)?;

        match (listen_addr, host_key, placement_url) {
            (Some(listen_addr), Some(host_key), Some(placement_url)) => Ok(ProxySettings {
                listen_addr,
                host_key,
                placement_url,
                authorization_url,
                delegated_only: self.delegated_only,
                backend_user: self.backend_user.clone(),
            }),
            _ => Err(ConfigError {
                problems: vec!["incomplete configuration".to_string()],
            }),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// SSH listen address (default: "127.0.0.1:2222")
    pub listen_addr: String,

    /// Host key as OpenSSH/PEM text; a fresh key is generated when no key is configured
    pub host_key: Option<String>,

    /// Path to the host key, used when `host_key` is unset
    pub host_key_path: Option<PathBuf>,

    /// The single public key accepted for client authentication ("ssh-ed25519 AAAA...")
    pub authorized_key: Option<String>,

    /// Skip client authentication entirely
    pub allow_unauthenticated: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2222".to_string(),
            host_key: None,
            host_key_path: None,
            authorized_key: None,
            allow_unauthenticated: false,
        }
    }
}

/// Validated daemon settings.
#[derive(Debug)]
pub struct DaemonSettings {
    pub listen_addr: SocketAddr,
    pub host_key: PrivateKey,
    pub authorized_key: Option<PublicKey>,
    pub allow_unauthenticated: bool,
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<DaemonSettings, ConfigError> {
        let mut problems = Vec::new();

        let listen_addr = parse_listen_addr(&self.listen_addr, &mut problems);

        let host_key = match keys::load_host_key(
            self.host_key.as_deref(),
            self.host_key_path.as_deref(),
        ) {
            Ok(Some(key)) => Some(key),
            Ok(None) => match keys::generate_ed25519() {
                Ok(key) => Some(key),
                Err(e) => {
                    problems.push(format!("failed to generate host key: {:#}", e));
                    None
                }
            },
            Err(e) => {
                problems.push(format!("failed to parse host key: {:#}", e));
                None
            }
        };

        let authorized_key = match self.authorized_key.as_deref().map(str::trim) {
            None | Some("") => {
                if !self.allow_unauthenticated {
                    problems.push("public user key is required".to_string());
                }
                None
            }
            Some(line) => match keys::parse_public_key(line) {
                Ok(key) => Some(key),
                Err(e) => {
                    problems.push(format!("failed to parse public user key: {:#}", e));
                    None
                }
            },
        };

        ConfigError::check(problems)?;

        match (listen_addr, host_key) {
            (Some(listen_addr), Some(host_key)) => Ok(DaemonSettings {
                listen_addr,
                host_key,
                authorized_key,
                allow_unauthenticated: self.allow_unauthenticated,
            }),
            _ => Err(ConfigError {
                problems: vec!["incomplete configuration".to_string()],
            }),
        }
    }
}
