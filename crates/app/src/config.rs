use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use voxproc_core::{EngineKind, Profile};

/// Persisted defaults for the CLI. Every flag overrides its field.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_device")]
    pub last_input: String,
    #[serde(default = "default_device")]
    pub last_output: String,
    #[serde(default)]
    pub reference_device: Option<String>,
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: i32,
    #[serde(default = "default_gain_db")]
    pub gain_db: i32,
    #[serde(default)]
    pub manual_gain: bool,
    #[serde(default = "default_auto_delay")]
    pub auto_delay: bool,
}

fn default_device() -> String {
    "default".to_string()
}

fn default_profile() -> String {
    "call".to_string()
}

fn default_engine() -> String {
    "standard".to_string()
}

fn default_initial_delay() -> i32 {
    40
}

fn default_gain_db() -> i32 {
    9 // Same as the engine's default compression gain
}

fn default_auto_delay() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            last_input: default_device(),
            last_output: default_device(),
            reference_device: None,
            profile: default_profile(),
            engine: default_engine(),
            initial_delay_ms: default_initial_delay(),
            gain_db: default_gain_db(),
            manual_gain: false,
            auto_delay: default_auto_delay(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from disk, or returns default if not found.
    pub fn load() -> Self {
        if let Some(path) = config_path() {
            if let Ok(content) = fs::read_to_string(path) {
                match serde_json::from_str(&content) {
                    Ok(cfg) => return cfg,
                    Err(e) => log::warn!("Ignoring malformed config file: {}", e),
                }
            }
        }
        Self::default()
    }

    /// Saves configuration to disk in JSON format.
    pub fn save(&self) {
        if let Some(path) = config_path() {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Ok(json) = serde_json::to_string_pretty(self) {
                if let Err(e) = fs::write(&path, json) {
                    log::warn!("Failed to write {}: {}", path.display(), e);
                }
            }
        }
    }

    pub fn profile(&self) -> Profile {
        parse_profile(&self.profile).unwrap_or_default()
    }

    pub fn engine_kind(&self) -> EngineKind {
        parse_engine(&self.engine).unwrap_or_default()
    }
}

pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "voxproc", "voxproc").map(|dirs| dirs.config_dir().join("config.json"))
}

pub fn parse_profile(name: &str) -> Option<Profile> {
    match name.to_ascii_lowercase().as_str() {
        "call" => Some(Profile::Call),
        "message" => Some(Profile::Message),
        _ => None,
    }
}

pub fn parse_engine(name: &str) -> Option<EngineKind> {
    match name.to_ascii_lowercase().as_str() {
        "standard" => Some(EngineKind::Standard),
        "lite" => Some(EngineKind::Lite),
        _ => None,
    }
}
