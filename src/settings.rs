use crate::token::Persona;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base URL of the trusted backend issuing credentials and debiting usage.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_modalities")]
    pub modalities: Vec<String>,
    /// Empty means the host's default input device.
    #[serde(default)]
    pub mic_device: String,
    #[serde(default)]
    pub persona: Persona,
    /// Append a line per session to usage-session.jsonl.
    #[serde(default = "default_usage_journal")]
    pub usage_journal: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            realtime_url: default_realtime_url(),
            model: default_model(),
            voice: default_voice(),
            transcription_model: default_transcription_model(),
            language: default_language(),
            modalities: default_modalities(),
            mic_device: String::new(),
            persona: Persona::default(),
            usage_journal: default_usage_journal(),
        }
    }
}

fn default_backend_url() -> String {
    "http://localhost:3000".into()
}
fn default_realtime_url() -> String {
    "wss://api.openai.com/v1/realtime".into()
}
fn default_model() -> String {
    "gpt-4o-realtime-preview".into()
}
fn default_voice() -> String {
    "alloy".into()
}
fn default_transcription_model() -> String {
    "gpt-4o-mini-transcribe".into()
}
fn default_language() -> String {
    "ja".into()
}
fn default_modalities() -> Vec<String> {
    vec!["text".into(), "audio".into()]
}
fn default_usage_journal() -> bool {
    true
}

pub fn data_dir() -> Option<PathBuf> {
    if let Some(dir) = dirs::data_local_dir() {
        return Some(dir.join("Kaiwa"));
    }
    if let Some(home) = dirs::home_dir() {
        return Some(home.join(".kaiwa"));
    }
    None
}

pub fn settings_path() -> Result<PathBuf, String> {
    data_dir()
        .map(|dir| dir.join("settings.json"))
        .ok_or_else(|| "Failed to resolve data directory".into())
}

pub fn load() -> Settings {
    match settings_path() {
        Ok(path) => load_from(&path),
        Err(_) => Settings::default(),
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_from(path: &Path) -> Settings {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return Settings::default(),
    };
    match serde_json::from_str(&text) {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("[settings] ignoring unreadable {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

pub fn save(settings: &Settings) -> Result<(), String> {
    save_to(&settings_path()?, settings)
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}
