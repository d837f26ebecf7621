use anyhow::{anyhow, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Upper bounds accepted from a config file
pub const MAX_TYPING_TTL_SECS: u64 = 3_600;
pub const MAX_TYPING_DELAY_MS: u64 = 60_000;

/// Tunables for the sync engine
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub typing_start_delay_ms: u64, // Coalesces keystrokes into one write
    pub typing_stop_delay_ms: u64,  // Flushes a stop quickly
    pub typing_ttl_secs: u64,
    pub typing_refresh_secs: u64, // Re-write an active typing record after this long
    pub temp_id_prefix: String,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            typing_start_delay_ms: 500,
            typing_stop_delay_ms: 100,
            typing_ttl_secs: 5,
            typing_refresh_secs: 3,
            temp_id_prefix: "local-".to_string(),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn typing_start_delay(&self) -> Duration {
        Duration::from_millis(self.typing_start_delay_ms)
    }

    pub fn typing_stop_delay(&self) -> Duration {
        Duration::from_millis(self.typing_stop_delay_ms)
    }

    /// Record lifetime, clamped to `MAX_TYPING_TTL_SECS`
    pub fn typing_ttl(&self) -> chrono::Duration {
        bounded_secs(self.typing_ttl_secs)
    }

    pub fn typing_refresh(&self) -> chrono::Duration {
        bounded_secs(self.typing_refresh_secs)
    }

    fn validate(self) -> Result<Self> {
        if self.typing_ttl_secs == 0 || self.typing_ttl_secs > MAX_TYPING_TTL_SECS {
            return Err(anyhow!(
                "typing_ttl_secs must be between 1 and {}, got {}",
                MAX_TYPING_TTL_SECS,
                self.typing_ttl_secs
            ));
        }
        if self.typing_refresh_secs == 0 {
            return Err(anyhow!("typing_refresh_secs must be at least 1"));
        }
        for (name, value) in [
            ("typing_start_delay_ms", self.typing_start_delay_ms),
            ("typing_stop_delay_ms", self.typing_stop_delay_ms),
        ] {
            if value > MAX_TYPING_DELAY_MS {
                return Err(anyhow!("{} must be at most {}, got {}", name, MAX_TYPING_DELAY_MS, value));
            }
        }
        if self.typing_refresh_secs >= self.typing_ttl_secs {
            return Err(anyhow!(
                "typing_refresh_secs ({}) must be shorter than typing_ttl_secs ({})",
                self.typing_refresh_secs,
                self.typing_ttl_secs
            ));
        }
        if self.event_capacity == 0 {
            return Err(anyhow!("event_capacity must be at least 1"));
        }
        Ok(self)
    }
}

fn bounded_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_TYPING_TTL_SECS) as i64)
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point config loading at a fixed file for the rest of the process
pub fn set_config_path_override(path: PathBuf) -> Result<()> {
    CONFIG_PATH_OVERRIDE
        .set(path)
        .map_err(|p| anyhow!("Config path already overridden, ignoring {}", p.display()))
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("chatterbox-sync");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}

/// Load the config from the default location, falling back to defaults
pub fn load_config() -> Result<SyncConfig> {
    load_config_from(&get_config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<SyncConfig> {
    if !path.exists() {
        info!("No config at {}, using defaults", path.display());
        return Ok(SyncConfig::default());
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: SyncConfig = serde_json::from_str(&contents)?;
    info!("Loaded sync config from {}", path.display());
    config.validate()
}

pub fn save_config(config: &SyncConfig) -> Result<()> {
    save_config_to(config, &get_config_path()?)
}

pub fn save_config_to(config: &SyncConfig, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;
    info!("Sync config saved to {}", path.display());
    Ok(())
}
