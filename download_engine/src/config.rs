use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    /// Where downloads (and their sidecar records) land by default.
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub buffer_size_in_kb: u64,
    /// Minimum gap between two progress events of one task.
    pub progress_interval_in_ms: u64,
    pub connect_timeout_in_secs: u64,
    /// Overall deadline for a single attempt; unlimited when absent.
    pub attempt_timeout_in_secs: Option<u64>,
    /// Compare the final file size against the declared total.
    pub verify_size: bool,
    /// Delete the partial file when a download is cancelled.
    pub remove_file_on_cancel: bool,
    pub user_agent: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            download_dir: PathBuf::from("./downloads"),
            max_concurrent_downloads: 3,
            buffer_size_in_kb: 1024,
            progress_interval_in_ms: 500,
            connect_timeout_in_secs: 30,
            attempt_timeout_in_secs: None,
            verify_size: true,
            remove_file_on_cancel: true,
            user_agent: None,
        }
    }
}

impl EngineConfig {
    pub fn load_config(config_path: PathBuf) -> Result<Self> {
        // Check if config file exists
        if !config_path.exists() {
            // Create default config
            let default_config = Self::default();
            default_config.save_config(config_path)?;
            return Ok(default_config);
        }

        let config_str = fs::read_to_string(config_path)?;

        // Parse TOML
        let config: EngineConfig = toml::from_str(&config_str)?;

        Ok(config)
    }

    pub fn save_config(&self, config_path: PathBuf) -> Result<()> {
        let toml_string = toml::to_string(self)?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to file
        let mut file = fs::File::create(config_path)?;
        file.write_all(toml_string.as_bytes())?;

        Ok(())
    }

    pub fn buffer_size(&self) -> usize {
        (self.buffer_size_in_kb * 1024) as usize
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_in_ms)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_in_secs.map(Duration::from_secs)
    }
}
