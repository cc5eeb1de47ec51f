//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use studyvoice_core::config::{DEFAULT_LIVE_MODEL, DEFAULT_TTS_VOICE, DEFAULT_VOICE};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub api_key: Option<String>,
    pub live_model: String,
    pub live_voice: String,
    pub speech_voice: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    /// Language used by `say` when none is given.
    pub speech_language: String,
    pub speech_rate: f64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            live_model: DEFAULT_LIVE_MODEL.into(),
            live_voice: DEFAULT_VOICE.into(),
            speech_voice: DEFAULT_TTS_VOICE.into(),
            preferred_input_device: None,
            preferred_output_device: None,
            speech_language: "English".into(),
            speech_rate: 1.0,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.api_key = trimmed(self.api_key.take());
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.preferred_output_device = trimmed(self.preferred_output_device.take());
        self.live_model = or_default(&self.live_model, DEFAULT_LIVE_MODEL);
        self.live_voice = or_default(&self.live_voice, DEFAULT_VOICE);
        self.speech_voice = or_default(&self.speech_voice, DEFAULT_TTS_VOICE);
        self.speech_language = or_default(&self.speech_language, "English");
        self.speech_rate = if self.speech_rate.is_finite() {
            self.speech_rate.clamp(0.5, 2.0)
        } else {
            1.0
        };
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn or_default(raw: &str, fallback: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        fallback.into()
    } else {
        value.into()
    }
}

/// Export settings as `STUDYVOICE_*` variables. Variables already present
/// in the environment win over the settings file.
pub fn apply_runtime_env_from_settings(settings: &AppSettings) {
    if let Some(key) = settings.api_key.as_ref() {
        set_if_unset("STUDYVOICE_API_KEY", key);
    }
    set_if_unset("STUDYVOICE_LIVE_MODEL", &settings.live_model);
    set_if_unset("STUDYVOICE_VOICE", &settings.live_voice);
    set_if_unset("STUDYVOICE_TTS_VOICE", &settings.speech_voice);
    if let Some(device) = settings.preferred_input_device.as_ref() {
        set_if_unset("STUDYVOICE_INPUT_DEVICE", device);
    }
}

fn set_if_unset(name: &str, value: &str) {
    if std::env::var(name).is_err() {
        std::env::set_var(name, value);
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Studyvoice")
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
            .join("studyvoice")
            .join("settings.json")
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_and_normalizes() {
        let mut s: AppSettings =
            serde_json::from_str(r#"{"apiKey": "  ", "liveVoice": "", "speechRate": 9.0}"#)
                .unwrap();
        s.normalize();
        assert_eq!(s.api_key, None);
        assert_eq!(s.live_voice, DEFAULT_VOICE);
        assert_eq!(s.live_model, DEFAULT_LIVE_MODEL);
        assert_eq!(s.speech_rate, 2.0);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = std::env::temp_dir().join(format!("studyvoice-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let saved = AppSettings {
            speech_language: "Spanish".into(),
            preferred_input_device: Some("USB Microphone".into()),
            ..AppSettings::default()
        };
        save_settings(&path, &saved).unwrap();
        let loaded = load_settings(&path);
        assert_eq!(loaded.speech_language, "Spanish");
        assert_eq!(loaded.preferred_input_device.as_deref(), Some("USB Microphone"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = load_settings(Path::new("/nonexistent/studyvoice/settings.json"));
        assert_eq!(loaded.speech_rate, 1.0);
        assert_eq!(loaded.speech_voice, DEFAULT_TTS_VOICE);
    }
}
