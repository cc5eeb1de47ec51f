//! `GeminiRestClient`: `generateContent` over HTTPS with reqwest.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{contextual_prompt, speech_prompt, GenerationService};
use crate::codec::MediaBlob;
use crate::config::RestConfig;
use crate::error::{Result, VoiceError};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    pub block_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<CandidateContent>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePart {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

impl GenerateContentResponse {
    fn parts(&self) -> impl Iterator<Item = &ResponsePart> {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .into_iter()
            .flat_map(|c| c.parts.iter())
    }

    /// Concatenated text of the first candidate.
    pub fn text(&self) -> String {
        self.parts().filter_map(|p| p.text.as_deref()).collect()
    }

    /// Text of the first candidate, failing when there is none.
    pub fn into_text(self) -> Result<String> {
        let text = self.text();
        if text.trim().is_empty() {
            return Err(VoiceError::Parse("response contained no text".into()));
        }
        Ok(text)
    }

    /// Inline audio of the first part of the first candidate.
    pub fn into_speech(self) -> Result<String> {
        self.parts()
            .next()
            .and_then(|p| p.inline_data.as_ref())
            .map(|d| d.data.clone())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| VoiceError::Parse("no audio data received from speech model".into()))
    }

    /// Inline image data, or the most specific reason there is none.
    pub fn into_image(self) -> Result<String> {
        let Some(candidate) = self.candidates.first() else {
            let blocked = self
                .prompt_feedback
                .as_ref()
                .and_then(|f| f.block_reason.as_deref());
            return Err(match blocked {
                Some(reason) => VoiceError::Parse(format!(
                    "request was blocked: {reason}; adjust the prompt"
                )),
                None => VoiceError::Parse(
                    "response contained no candidates; the request may have been filtered".into(),
                ),
            });
        };

        if let Some(data) = self
            .parts()
            .filter_map(|p| p.inline_data.as_ref())
            .map(|d| d.data.as_str())
            .find(|d| !d.is_empty())
        {
            return Ok(data.to_owned());
        }

        if let Some(reason) = candidate.finish_reason.as_deref().filter(|r| *r != "STOP") {
            return Err(VoiceError::Parse(format!(
                "image generation stopped early ({reason}); safety filters may have applied"
            )));
        }

        let text = self.text();
        let text = text.trim();
        if !text.is_empty() {
            return Err(VoiceError::Parse(format!(
                "model returned text instead of an image: \"{text}\""
            )));
        }
        Err(VoiceError::Parse("no image data was generated".into()))
    }
}

/// REST client for one-shot generation.
#[derive(Debug, Clone)]
pub struct GeminiRestClient {
    http: reqwest::Client,
    config: RestConfig,
    api_key: String,
}

impl GeminiRestClient {
    /// # Errors
    /// `VoiceError::Config` without an API key; `VoiceError::Http` if the
    /// HTTP client cannot be built.
    pub fn new(config: RestConfig) -> Result<Self> {
        let api_key = config.require_api_key()?.to_owned();
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            config,
            api_key,
        })
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        )
    }

    async fn call(&self, model: &str, body: Value) -> Result<GenerateContentResponse> {
        debug!(model, "generateContent request");
        let response = self
            .http
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(model, %status, "generateContent failed");
            return Err(VoiceError::Connection(format!("HTTP {status}: {detail}")));
        }
        Ok(response.json::<GenerateContentResponse>().await?)
    }
}

impl GenerationService for GeminiRestClient {
    async fn generate(&self, prompt: &str, context: &str) -> Result<String> {
        let body = json!({
            "contents": [{ "parts": [{ "text": contextual_prompt(prompt, context) }] }]
        });
        self.call(&self.config.text_model, body).await?.into_text()
    }

    async fn generate_speech(&self, text: &str, language: &str) -> Result<String> {
        let body = json!({
            "contents": [{ "parts": [{ "text": speech_prompt(text, language) }] }],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": self.config.tts_voice } }
                }
            }
        });
        self.call(&self.config.tts_model, body).await?.into_speech()
    }

    async fn generate_image(&self, prompt: &str, input_image: Option<&MediaBlob>) -> Result<String> {
        let mut parts = Vec::with_capacity(2);
        if let Some(image) = input_image {
            parts.push(json!({ "inlineData": { "mimeType": image.mime_type, "data": image.data } }));
        }
        parts.push(json!({ "text": prompt }));
        let body = json!({
            "contents": [{ "parts": parts }],
            "generationConfig": { "responseModalities": ["IMAGE"] }
        });
        self.call(&self.config.image_model, body).await?.into_image()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(v: Value) -> GenerateContentResponse {
        serde_json::from_value(v).unwrap()
    }

    fn parse_err(r: Result<String>) -> String {
        match r {
            Err(VoiceError::Parse(m)) => m,
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn blocked_prompt_reports_block_reason() {
        let r = parse(json!({"promptFeedback": {"blockReason": "SAFETY"}}));
        assert!(parse_err(r.into_image()).contains("blocked: SAFETY"));
    }

    #[test]
    fn no_candidates_without_feedback() {
        let r = parse(json!({}));
        assert!(parse_err(r.into_image()).contains("no candidates"));
    }

    #[test]
    fn inline_image_is_returned_from_any_part() {
        let r = parse(json!({"candidates": [{
            "content": {"parts": [{"text": "here you go"}, {"inlineData": {"mimeType": "image/png", "data": "iVBOR"}}]},
            "finishReason": "STOP"
        }]}));
        assert_eq!(r.into_image().unwrap(), "iVBOR");
    }

    #[test]
    fn non_stop_finish_reason_without_image() {
        let r = parse(json!({"candidates": [{"content": {"parts": []}, "finishReason": "IMAGE_SAFETY"}]}));
        assert!(parse_err(r.into_image()).contains("IMAGE_SAFETY"));
    }

    #[test]
    fn text_instead_of_image() {
        let r = parse(json!({"candidates": [{
            "content": {"parts": [{"text": " I cannot draw that. "}]},
            "finishReason": "STOP"
        }]}));
        assert_eq!(
            parse_err(r.into_image()),
            "model returned text instead of an image: \"I cannot draw that.\""
        );
    }

    #[test]
    fn empty_stop_candidate_is_a_generic_failure() {
        let r = parse(json!({"candidates": [{"finishReason": "STOP"}]}));
        assert_eq!(parse_err(r.into_image()), "no image data was generated");
    }

    #[test]
    fn speech_requires_inline_audio_in_first_part() {
        let ok = parse(json!({"candidates": [{"content": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}}]}}]}));
        assert_eq!(ok.into_speech().unwrap(), "AAAA");
        let missing = parse(json!({"candidates": [{"content": {"parts": [{"text": "no"}]}}]}));
        assert!(parse_err(missing.into_speech()).contains("no audio data"));
    }

    #[test]
    fn text_joins_parts_and_rejects_empty() {
        let r = parse(json!({"candidates": [{"content": {"parts": [{"text": "Hello, "}, {"text": "world"}]}}]}));
        assert_eq!(r.into_text().unwrap(), "Hello, world");
        assert!(parse(json!({"candidates": []})).into_text().is_err());
    }

    #[test]
    fn client_needs_a_key_and_builds_model_urls() {
        assert!(GeminiRestClient::new(RestConfig::default()).is_err());
        let client = GeminiRestClient::new(RestConfig {
            api_key: Some("k".into()),
            base_url: "https://example.test/v1beta/".into(),
            ..RestConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.endpoint("gemini-2.5-pro"),
            "https://example.test/v1beta/models/gemini-2.5-pro:generateContent"
        );
    }
}
