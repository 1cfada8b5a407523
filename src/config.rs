use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::{DEFAULT_BLOCK_SIZE, DEFAULT_IDLE_BLOCK_COUNT, DEFAULT_SAMPLE_RATE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub paths: PathConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub block_size: usize,
    pub sample_rate: f64,
    pub preferred_output_device: Option<String>,
    /// Consecutive silent blocks before a bus is parked as idle.
    pub idle_block_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub plugin_scan_paths: Vec<PathBuf>,
    pub default_render_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Worker-pool ceiling for concurrently running render jobs.
    pub max_concurrent_jobs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig {
                block_size: DEFAULT_BLOCK_SIZE,
                sample_rate: DEFAULT_SAMPLE_RATE,
                preferred_output_device: None,
                idle_block_count: DEFAULT_IDLE_BLOCK_COUNT,
            },
            paths: PathConfig {
                plugin_scan_paths: crate::plugin_host::PluginScanner::default_search_paths(),
                default_render_dir: None,
            },
            render: RenderConfig {
                max_concurrent_jobs: (num_cpus::get() / 2).max(1),
            },
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        if let Some(path) = Self::config_path()
            && path.exists()
        {
            let contents = std::fs::read_to_string(path)?;
            return Ok(serde_json::from_str(&contents)?);
        }
        Ok(Self::default())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(self)?;
            std::fs::write(path, contents)?;
        }
        Ok(())
    }

    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mixcore").join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.audio.block_size, config.audio.block_size);
        assert_eq!(back.render.max_concurrent_jobs, config.render.max_concurrent_jobs);
    }
}
