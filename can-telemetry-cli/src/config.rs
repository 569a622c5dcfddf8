//! Configuration loading and parsing

use anyhow::{Context, Result};
use can_telemetry_core::{EngineConfig, RawFrame};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (config.toml or config.json)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputConfig {
    #[serde(default)]
    pub dbc_files: Vec<PathBuf>,
    /// JSON array of frames to replay through the simulated interface
    pub sim_frames: Option<PathBuf>,
    /// Acquire only messages whose DBC name contains one of these
    #[serde(default)]
    pub filter_messages: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Rows printed from the store after the run
    #[serde(default = "default_recent")]
    pub recent: usize,
    /// Run time limit in seconds (none = until the source ends)
    pub duration_secs: Option<f64>,
}

fn default_recent() -> usize {
    10
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            recent: default_recent(),
            duration_secs: None,
        }
    }
}

/// Load configuration from a TOML or JSON file, chosen by extension
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let config: AppConfig = if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?
    } else {
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?
    };

    Ok(config)
}

/// Load a JSON array of frames for simulated replay
pub fn load_sim_frames(path: &Path) -> Result<Vec<RawFrame>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read frame file: {:?}", path))?;
    let frames: Vec<RawFrame> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse frame file: {:?}", path))?;
    Ok(frames)
}
