//! Persistent application settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};

use sangwari_core::{
    audio::device::normalize_device_name,
    call::CallConfig,
    capture::CaptureConfig,
    chat::{gemini::DEFAULT_CHAT_MODEL, DEFAULT_MAX_HISTORY_TURNS},
    transport::{DEFAULT_ENDPOINT, DEFAULT_LIVE_MODEL, DEFAULT_VOICE},
    SessionConfig,
};
use serde::{Deserialize, Serialize};

/// Environment variables checked for the API key, in priority order.
pub const API_KEY_ENV_VARS: [&str; 2] = ["SANGWARI_API_KEY", "GEMINI_API_KEY"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub api_key: Option<String>,
    pub live_endpoint: String,
    pub live_model: String,
    pub voice: String,
    pub chat_model: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub output_gain: f32,
    pub frame_samples: usize,
    pub max_history_turns: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            live_endpoint: DEFAULT_ENDPOINT.into(),
            live_model: DEFAULT_LIVE_MODEL.into(),
            voice: DEFAULT_VOICE.into(),
            chat_model: DEFAULT_CHAT_MODEL.into(),
            preferred_input_device: None,
            preferred_output_device: None,
            output_gain: 1.0,
            frame_samples: 4096,
            max_history_turns: DEFAULT_MAX_HISTORY_TURNS,
        }
    }
}

fn or_default(raw: &str, default: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        default.into()
    } else {
        trimmed.into()
    }
}

/// Live models are addressed as `models/<name>`.
pub fn normalize_live_model(raw: &str) -> String {
    let model = or_default(raw, DEFAULT_LIVE_MODEL);
    if model.starts_with("models/") {
        model
    } else {
        format!("models/{model}")
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.api_key = self
            .api_key
            .as_ref()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        self.live_endpoint = or_default(&self.live_endpoint, DEFAULT_ENDPOINT);
        self.live_model = normalize_live_model(&self.live_model);
        self.voice = or_default(&self.voice, DEFAULT_VOICE);
        self.chat_model = or_default(&self.chat_model, DEFAULT_CHAT_MODEL)
            .trim_start_matches("models/")
            .to_string();
        self.preferred_input_device = normalize_device_name(self.preferred_input_device.as_deref());
        self.preferred_output_device =
            normalize_device_name(self.preferred_output_device.as_deref());
        self.output_gain = if self.output_gain.is_finite() {
            self.output_gain.clamp(0.0, 4.0)
        } else {
            1.0
        };
        self.frame_samples = self.frame_samples.clamp(512, 16_384);
        self.max_history_turns = self.max_history_turns.clamp(2, 400);
    }

    /// Key from the environment first, then from the file.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    fn resolve_api_key_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        API_KEY_ENV_VARS
            .iter()
            .filter_map(|name| lookup(name))
            .map(|k| k.trim().to_string())
            .find(|k| !k.is_empty())
            .or_else(|| self.api_key.clone())
    }

    pub fn call_config(&self, api_key: String) -> CallConfig {
        let defaults = CallConfig::default();
        CallConfig {
            session: SessionConfig {
                endpoint: self.live_endpoint.clone(),
                api_key,
                model: self.live_model.clone(),
                voice: self.voice.clone(),
                system_instruction: defaults.session.system_instruction,
            },
            capture: CaptureConfig {
                frame_samples: self.frame_samples,
                ..defaults.capture
            },
            output_gain: self.output_gain,
            input_device: self.preferred_input_device.clone(),
            output_device: self.preferred_output_device.clone(),
            ..defaults
        }
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Sangwari")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("sangwari")
            .join("settings.json")
    }
}

/// Missing or unreadable files give the defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
