//! Server configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use chatrelay::frame::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to bind on
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Maximum number of connected users
    pub max_users: u32,

    /// Maximum payload length of a single frame, in bytes
    pub max_frame_len: usize,

    /// Message of the day sent after a successful login (empty = none)
    pub motd: String,

    /// Credential store file (`username:hash` lines)
    pub users_file: PathBuf,

    /// Group store file (`group:member1,member2` lines)
    pub groups_file: PathBuf,

    /// Activity log file
    pub log_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 12345,
            max_users: 1000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            motd: String::new(),
            users_file: PathBuf::from("users.txt"),
            groups_file: PathBuf::from("groups.txt"),
            log_file: PathBuf::from("chat_log.txt"),
        }
    }
}

impl Config {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        if let Ok(host) = std::env::var("CHATRELAY_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("CHATRELAY_PORT") {
            config.port = port.parse()?;
        }

        Ok(config)
    }
}
