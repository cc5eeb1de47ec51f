//! Live API wire format.
//!
//! Outbound frames are built from typed structs; inbound frames are parsed
//! leniently (every field optional) and flattened into [`LiveMessage`]s.

use serde::{Deserialize, Serialize};

use crate::codec::MediaBlob;
use crate::config::LiveConfig;
use crate::error::Result;

/// One inbound event, after flattening a server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveMessage {
    /// Fragment of the user's speech transcription.
    UserTranscript(String),
    /// Fragment of the model's speech transcription.
    ModelTranscript(String),
    /// Base64 PCM16 audio at the model output rate.
    Audio(String),
    TurnComplete,
    /// The user barged in; queued model audio is stale.
    Interrupted,
    Error(String),
    Close { code: u16, reason: String },
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_owned),
            parts: vec![Part { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

/// First frame of every session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub input_audio_transcription: Empty,
    pub output_audio_transcription: Empty,
}

impl SetupMessage {
    /// Audio responses, both transcriptions on, instruction seeded with `context`.
    pub fn new(config: &LiveConfig, context: &str) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };
        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".into()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content::text(None, config.system_instruction(context)),
            input_audio_transcription: Empty {},
            output_audio_transcription: Empty {},
        }
    }

    pub fn to_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            setup: &'a SetupMessage,
        }
        Ok(serde_json::to_string(&Envelope { setup: self })?)
    }
}

// ---------------------------------------------------------------------------
// Client frames
// ---------------------------------------------------------------------------

/// Frames the session pushes to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// One encoded microphone block.
    Audio(MediaBlob),
    /// Updated document context, sent as a non-final user turn.
    ContextUpdate(String),
    /// Close the connection.
    Close,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [&'a MediaBlob; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    turns: Vec<Content>,
    turn_complete: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum OutboundFrame<'a> {
    RealtimeInput(RealtimeInput<'a>),
    ClientContent(ClientContent),
}

impl ClientFrame {
    /// JSON text for the frame; `None` for [`ClientFrame::Close`].
    pub fn to_json(&self) -> Result<Option<String>> {
        let frame = match self {
            ClientFrame::Audio(blob) => OutboundFrame::RealtimeInput(RealtimeInput {
                media_chunks: [blob],
            }),
            ClientFrame::ContextUpdate(text) => OutboundFrame::ClientContent(ClientContent {
                turns: vec![Content::text(
                    Some("user"),
                    format!("Context update: {text}"),
                )],
                turn_complete: false,
            }),
            ClientFrame::Close => return Ok(None),
        };
        Ok(Some(serde_json::to_string(&frame)?))
    }
}

// ---------------------------------------------------------------------------
// Server frames
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    error: Option<ServerError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ModelPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelPart {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerError {
    Text(String),
    Object {
        #[serde(default)]
        message: String,
        #[serde(default)]
        code: Option<i64>,
    },
}

impl ServerError {
    fn into_message(self) -> String {
        match self {
            ServerError::Text(text) => text,
            ServerError::Object { message, code: Some(code) } => format!("{message} (code {code})"),
            ServerError::Object { message, code: None } => message,
        }
    }
}

/// A parsed server frame.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedFrame {
    pub setup_complete: bool,
    pub messages: Vec<LiveMessage>,
}

/// Parse one JSON server frame.
///
/// Fields are emitted in a fixed order: user transcript, model transcript,
/// audio parts, interrupted, turn complete, error.
pub fn parse_server_frame(text: &str) -> Result<ParsedFrame> {
    let frame: ServerFrame = serde_json::from_str(text)?;
    let mut messages = Vec::new();

    if let Some(content) = frame.server_content {
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            messages.push(LiveMessage::UserTranscript(t.text));
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            messages.push(LiveMessage::ModelTranscript(t.text));
        }
        if let Some(turn) = content.model_turn {
            messages.extend(
                turn.parts
                    .into_iter()
                    .filter_map(|p| p.inline_data)
                    .filter(|d| !d.data.is_empty())
                    .map(|d| LiveMessage::Audio(d.data)),
            );
        }
        if content.interrupted {
            messages.push(LiveMessage::Interrupted);
        }
        if content.turn_complete {
            messages.push(LiveMessage::TurnComplete);
        }
    }
    if let Some(err) = frame.error {
        messages.push(LiveMessage::Error(err.into_message()));
    }

    Ok(ParsedFrame {
        setup_complete: frame.setup_complete.is_some(),
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_frame_enables_audio_and_both_transcriptions() {
        let setup = SetupMessage::new(&LiveConfig::default(), "Page 4 of 10");
        let value: serde_json::Value = serde_json::from_str(&setup.to_json().unwrap()).unwrap();
        let s = &value["setup"];
        assert_eq!(s["model"], "models/gemini-2.5-flash-native-audio-preview-09-2025");
        assert_eq!(s["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            s["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Zephyr"
        );
        assert_eq!(s["inputAudioTranscription"], json!({}));
        assert_eq!(s["outputAudioTranscription"], json!({}));
        let instruction = s["systemInstruction"]["parts"][0]["text"].as_str().unwrap();
        assert!(instruction.ends_with("Current context: Page 4 of 10"));
        assert!(s["systemInstruction"].get("role").is_none());
    }

    #[test]
    fn audio_frame_matches_realtime_input_shape() {
        let frame = ClientFrame::Audio(MediaBlob {
            mime_type: "audio/pcm;rate=16000".into(),
            data: "AAA=".into(),
        });
        let value: serde_json::Value =
            serde_json::from_str(&frame.to_json().unwrap().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"realtimeInput":{"mediaChunks":[{"mimeType":"audio/pcm;rate=16000","data":"AAA="}]}})
        );
    }

    #[test]
    fn context_update_is_a_non_final_user_turn() {
        let frame = ClientFrame::ContextUpdate("Page 5".into());
        let value: serde_json::Value =
            serde_json::from_str(&frame.to_json().unwrap().unwrap()).unwrap();
        assert_eq!(value["clientContent"]["turnComplete"], false);
        assert_eq!(value["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(
            value["clientContent"]["turns"][0]["parts"][0]["text"],
            "Context update: Page 5"
        );
        assert_eq!(ClientFrame::Close.to_json().unwrap(), None);
    }

    #[test]
    fn combined_frame_flattens_in_fixed_order() {
        let raw = json!({
            "serverContent": {
                "turnComplete": true,
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQI="}}, {"text": "ignored"}]},
                "outputTranscription": {"text": "Hi"},
                "inputTranscription": {"text": "Hola"}
            }
        })
        .to_string();
        let parsed = parse_server_frame(&raw).unwrap();
        assert!(!parsed.setup_complete);
        assert_eq!(
            parsed.messages,
            vec![
                LiveMessage::UserTranscript("Hola".into()),
                LiveMessage::ModelTranscript("Hi".into()),
                LiveMessage::Audio("AQI=".into()),
                LiveMessage::TurnComplete,
            ]
        );
    }

    #[test]
    fn setup_complete_and_errors_are_recognised() {
        assert!(parse_server_frame(r#"{"setupComplete":{}}"#).unwrap().setup_complete);
        let parsed =
            parse_server_frame(r#"{"error":{"message":"quota exceeded","code":429}}"#).unwrap();
        assert_eq!(
            parsed.messages,
            vec![LiveMessage::Error("quota exceeded (code 429)".into())]
        );
        let parsed = parse_server_frame(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(parsed.messages, vec![LiveMessage::Interrupted]);
    }

    #[test]
    fn unknown_fields_are_ignored_and_garbage_is_rejected() {
        let parsed = parse_server_frame(r#"{"usageMetadata":{"totalTokenCount":12}}"#).unwrap();
        assert!(parsed.messages.is_empty());
        assert!(parse_server_frame("not json").is_err());
    }
}
