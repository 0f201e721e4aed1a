// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Configuration management for the server and the card client

use crate::card::{CardIdentity, MacAddress, StaticDirectory, UploadKey};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// A card allowed to upload
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CardConfig {
    /// Hex MAC address, separators allowed
    pub mac_address: String,

    /// Hex upload key shown in the card's settings
    pub upload_key: String,

    /// Folder for this card's photos (defaults to the server `upload_dir`)
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
}

impl CardConfig {
    pub fn to_identity(&self) -> Result<CardIdentity> {
        let mac: MacAddress = self
            .mac_address
            .parse()
            .map_err(|e| Error::Config(format!("Card {:?}: {}", self.mac_address, e)))?;
        let key = UploadKey::from_hex(&self.upload_key)?;
        if key.len() != UploadKey::LEN {
            return Err(Error::Config(format!(
                "Card {}: upload_key must be {} bytes, got {}",
                mac,
                UploadKey::LEN,
                key.len()
            )));
        }

        let card = CardIdentity::new(mac, key);
        Ok(match &self.upload_dir {
            Some(dir) => card.with_upload_dir(dir),
            None => card,
        })
    }
}

/// Upload server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address for HTTP server
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Uploads processed at the same time
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Longest wait for the next chunk of an upload body
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Deadline for a whole control call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Where photos go when a card has no folder of its own
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// How much of an unrecognised upload part is logged
    #[serde(default = "default_max_logged_part_bytes")]
    pub max_logged_part_bytes: usize,

    /// Registered cards
    #[serde(default)]
    pub cards: Vec<CardConfig>,
}

/// Scalar settings read from the environment; cards come from `EYEFI_CARDS`
#[derive(Debug, Deserialize)]
struct EnvServerConfig {
    #[serde(default = "default_listen_address")]
    listen_address: String,
    #[serde(default = "default_workers")]
    workers: usize,
    #[serde(default = "default_read_timeout_secs")]
    read_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_upload_dir")]
    upload_dir: PathBuf,
    #[serde(default = "default_max_logged_part_bytes")]
    max_logged_part_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            workers: default_workers(),
            read_timeout_secs: default_read_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            upload_dir: default_upload_dir(),
            max_logged_part_bytes: default_max_logged_part_bytes(),
            cards: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let env: EnvServerConfig = envy::prefixed("EYEFI_")
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;

        let cards = match std::env::var("EYEFI_CARDS") {
            Ok(list) => parse_card_list(&list)?,
            Err(_) => Vec::new(),
        };

        let config = Self {
            listen_address: env.listen_address,
            workers: env.workers,
            read_timeout_secs: env.read_timeout_secs,
            request_timeout_secs: env.request_timeout_secs,
            upload_dir: env.upload_dir,
            max_logged_part_bytes: env.max_logged_part_bytes,
            cards,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be > 0".to_string()));
        }
        if self.read_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(Error::Config("Timeouts must be > 0".to_string()));
        }
        if self.cards.is_empty() {
            return Err(Error::Config(
                "At least one card required (cards, or EYEFI_CARDS=mac=key,...)".to_string(),
            ));
        }
        self.directory()?;
        Ok(())
    }

    /// Build the card directory, rejecting malformed or duplicate cards
    pub fn directory(&self) -> Result<StaticDirectory> {
        let mut directory = StaticDirectory::new();
        for card in &self.cards {
            directory.insert(card.to_identity()?)?;
        }
        Ok(directory)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Parse `mac=key[,mac=key...]`
fn parse_card_list(list: &str) -> Result<Vec<CardConfig>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (mac, key) = entry
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("Card entry {:?} is not mac=key", entry)))?;
            Ok(CardConfig {
                mac_address: mac.trim().to_string(),
                upload_key: key.trim().to_string(),
                upload_dir: None,
            })
        })
        .collect()
}

/// Card emulator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CardClientConfig {
    /// Base URL of the server, e.g. `http://localhost:59278`
    pub server_url: String,

    pub mac_address: String,

    /// Hex upload key
    pub upload_key: String,

    /// Maximum retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl CardClientConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `EYEFI_CARD_*` environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("EYEFI_CARD_")
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration and resolve the card it describes
    pub fn validate(&self) -> Result<CardIdentity> {
        let url = Url::parse(&self.server_url)
            .map_err(|e| Error::Config(format!("Invalid server_url: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::Config(format!("Unsupported scheme {}", url.scheme())));
        }
        CardConfig {
            mac_address: self.mac_address.clone(),
            upload_key: self.upload_key.clone(),
            upload_dir: None,
        }
        .to_identity()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Default value functions
fn default_listen_address() -> String {
    format!("0.0.0.0:{}", crate::EYEFI_PORT)
}

fn default_workers() -> usize {
    2
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

fn default_max_logged_part_bytes() -> usize {
    crate::upload::DEFAULT_MAX_LOGGED_PART_BYTES
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}
