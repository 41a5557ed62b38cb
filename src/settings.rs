use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{QuillError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_window_days")]
    pub context_window_days: i64,
    #[serde(default = "default_assistant_timeout_ms")]
    pub assistant_timeout_ms: u64,
    #[serde(default = "default_step_quota_ms")]
    pub step_quota_ms: u64,
}

fn default_max_iterations() -> usize {
    3
}

fn default_window_days() -> i64 {
    7
}

fn default_assistant_timeout_ms() -> u64 {
    10_000
}

fn default_step_quota_ms() -> u64 {
    1_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            max_iterations: default_max_iterations(),
            context_window_days: default_window_days(),
            assistant_timeout_ms: default_assistant_timeout_ms(),
            step_quota_ms: default_step_quota_ms(),
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("quill")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("quill")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| QuillError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn get_data_dir() -> PathBuf {
    PathBuf::from(&load_settings().data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            data_dir: "/tmp/test".to_string(),
            max_iterations: 5,
            context_window_days: 14,
            assistant_timeout_ms: 2_000,
            step_quota_ms: 250,
        };
        let json = serde_json::to_string_pretty(&settings).unwrap();
        std::fs::write(&path, &json).unwrap();
        let loaded: Settings = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.data_dir, "/tmp/test");
        assert_eq!(loaded.max_iterations, 5);
        assert_eq!(loaded.context_window_days, 14);
    }

    #[test]
    fn test_missing_fields_get_defaults() {
        let json = r#"{"data_dir": "/tmp/test"}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.max_iterations, 3);
        assert_eq!(s.context_window_days, 7);
        assert_eq!(s.assistant_timeout_ms, 10_000);
        assert_eq!(s.step_quota_ms, 1_000);
    }
}
