//! Runtime configuration for capture, playback and the live session.
//!
//! Every struct has a `Default` matching what the live endpoint expects.
//! `LiveConfig::apply_env` lets the host override fields from
//! `STUDYVOICE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};

/// Default Live API WebSocket endpoint.
pub const DEFAULT_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default REST base for one-shot generation calls.
pub const DEFAULT_REST_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_TTS_VOICE: &str = "Kore";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// Rate the endpoint expects for microphone input.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Rate of audio produced by the model.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per outbound block (≈ 256 ms at 16 kHz).
pub const CAPTURE_BLOCK_SIZE: usize = 4096;

const DEFAULT_INSTRUCTION_PREFIX: &str = "You are an AI assistant helping a user with a PDF document. \
Use the provided context to answer their questions. The context will be updated as the user navigates.";

/// Microphone capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    /// Rate of the encoded blocks (the device may run at another rate).
    pub sample_rate: u32,
    /// Samples per block.
    pub block_size: usize,
    pub preferred_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            block_size: CAPTURE_BLOCK_SIZE,
            preferred_device: None,
        }
    }
}

/// Output device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    /// Requested device rate; the device default is used if unsupported.
    pub sample_rate: u32,
    pub preferred_device: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: OUTPUT_SAMPLE_RATE,
            preferred_device: None,
        }
    }
}

/// Live session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    /// Text placed before the context string in the system instruction.
    pub instruction_prefix: String,
    /// Rate of inbound model audio.
    pub output_sample_rate: u32,
    pub connect_timeout_ms: u64,
    /// Capacity of the outbound frame queue; full means blocks are dropped.
    pub outbound_queue: usize,
    pub capture: CaptureConfig,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_LIVE_ENDPOINT.into(),
            model: DEFAULT_LIVE_MODEL.into(),
            voice: DEFAULT_VOICE.into(),
            instruction_prefix: DEFAULT_INSTRUCTION_PREFIX.into(),
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            connect_timeout_ms: 15_000,
            outbound_queue: 64,
            capture: CaptureConfig::default(),
        }
    }
}

impl LiveConfig {
    /// Override fields from the environment. Unset or unparsable variables
    /// leave the current value untouched.
    pub fn apply_env(&mut self) {
        if let Some(key) = env_string("STUDYVOICE_API_KEY").or_else(|| env_string("API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(v) = env_string("STUDYVOICE_LIVE_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = env_string("STUDYVOICE_LIVE_MODEL") {
            self.model = v;
        }
        if let Some(v) = env_string("STUDYVOICE_VOICE") {
            self.voice = v;
        }
        if let Some(v) = env_string("STUDYVOICE_INPUT_DEVICE") {
            self.capture.preferred_device = Some(v);
        }
        if let Some(v) = env_string("STUDYVOICE_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.connect_timeout_ms = v;
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// Build the system instruction seeded with `context`.
    pub fn system_instruction(&self, context: &str) -> String {
        format!("{} Current context: {}", self.instruction_prefix, context)
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                VoiceError::Config("API key not set (STUDYVOICE_API_KEY or API_KEY)".into())
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.block_size == 0 {
            return Err(VoiceError::Config("capture block size must be non-zero".into()));
        }
        if self.capture.sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(VoiceError::Config("sample rates must be non-zero".into()));
        }
        if self.outbound_queue == 0 {
            return Err(VoiceError::Config("outbound queue must hold at least one frame".into()));
        }
        Ok(())
    }
}

/// One-shot generation settings (text, speech, image).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub text_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub image_model: String,
    pub request_timeout_ms: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_REST_BASE.into(),
            text_model: DEFAULT_TEXT_MODEL.into(),
            tts_model: DEFAULT_TTS_MODEL.into(),
            tts_voice: DEFAULT_TTS_VOICE.into(),
            image_model: DEFAULT_IMAGE_MODEL.into(),
            request_timeout_ms: 60_000,
        }
    }
}

impl RestConfig {
    pub fn apply_env(&mut self) {
        if let Some(key) = env_string("STUDYVOICE_API_KEY").or_else(|| env_string("API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(v) = env_string("STUDYVOICE_REST_BASE") {
            self.base_url = v;
        }
        if let Some(v) = env_string("STUDYVOICE_TEXT_MODEL") {
            self.text_model = v;
        }
        if let Some(v) = env_string("STUDYVOICE_TTS_MODEL") {
            self.tts_model = v;
        }
        if let Some(v) = env_string("STUDYVOICE_TTS_VOICE") {
            self.tts_voice = v;
        }
        if let Some(v) = env_string("STUDYVOICE_IMAGE_MODEL") {
            self.image_model = v;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                VoiceError::Config("API key not set (STUDYVOICE_API_KEY or API_KEY)".into())
            })
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_format() {
        let cfg = LiveConfig::default();
        assert_eq!(cfg.capture.sample_rate, 16_000);
        assert_eq!(cfg.capture.block_size, 4096);
        assert_eq!(cfg.output_sample_rate, 24_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn system_instruction_embeds_context() {
        let cfg = LiveConfig::default();
        let text = cfg.system_instruction("Chapter 3: Photosynthesis");
        assert!(text.starts_with("You are an AI assistant"));
        assert!(text.ends_with("Current context: Chapter 3: Photosynthesis"));
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let cfg = LiveConfig {
            api_key: Some("   ".into()),
            ..LiveConfig::default()
        };
        assert!(matches!(cfg.require_api_key(), Err(VoiceError::Config(_))));
    }

    #[test]
    fn rest_defaults_name_the_one_shot_models() {
        let cfg = RestConfig::default();
        assert_eq!(cfg.tts_voice, "Kore");
        assert_eq!(cfg.image_model, "gemini-2.5-flash-image");
        assert!(cfg.require_api_key().is_err());
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let mut cfg = LiveConfig::default();
        cfg.capture.block_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_partial_camel_case_json() {
        let cfg: LiveConfig =
            serde_json::from_str(r#"{"voice":"Kore","capture":{"preferredDevice":"USB Mic"}}"#)
                .unwrap();
        assert_eq!(cfg.voice, "Kore");
        assert_eq!(cfg.capture.preferred_device.as_deref(), Some("USB Mic"));
        assert_eq!(cfg.capture.block_size, 4096);
    }
}
