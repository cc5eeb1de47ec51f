//! Per-message session state machine.
//!
//! `SessionState::apply` is a pure step: it folds one [`LiveMessage`] into
//! the transcript buffers and returns what the session task should do. It
//! touches neither the network nor the audio device, so the whole
//! conversation flow is testable without either.

use super::protocol::LiveMessage;

/// User-side and model-side transcript buffers for the current turn.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TranscriptAccumulator {
    user: String,
    model: String,
}

impl TranscriptAccumulator {
    pub fn push_user(&mut self, fragment: &str) -> &str {
        self.user.push_str(fragment);
        &self.user
    }

    pub fn push_model(&mut self, fragment: &str) -> &str {
        self.model.push_str(fragment);
        &self.model
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Take both buffers, leaving them empty.
    pub fn take(&mut self) -> (String, String) {
        (std::mem::take(&mut self.user), std::mem::take(&mut self.model))
    }
}

/// What the session task must do after one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Report the full user transcript so far.
    UserTranscript(String),
    /// Report the full model transcript so far.
    ModelTranscript(String),
    /// Decode and schedule base64 audio on the live lane.
    PlayAudio(String),
    /// Flush queued model audio.
    FlushPlayback,
    /// Report the finished turn; buffers are already empty.
    TurnComplete { user: String, model: String },
    /// Fatal transport error; tear down.
    Fail(String),
    /// Remote close; tear down.
    Closed { code: u16, reason: String },
}

#[derive(Debug, Default)]
pub struct SessionState {
    transcripts: TranscriptAccumulator,
    ended: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one message. Returns `None` for messages that need no action,
    /// including everything after the session has ended.
    pub fn apply(&mut self, message: LiveMessage) -> Option<Effect> {
        if self.ended {
            return None;
        }
        match message {
            LiveMessage::UserTranscript(fragment) => Some(Effect::UserTranscript(
                self.transcripts.push_user(&fragment).to_owned(),
            )),
            LiveMessage::ModelTranscript(fragment) => Some(Effect::ModelTranscript(
                self.transcripts.push_model(&fragment).to_owned(),
            )),
            LiveMessage::Audio(data) if data.is_empty() => None,
            LiveMessage::Audio(data) => Some(Effect::PlayAudio(data)),
            LiveMessage::Interrupted => Some(Effect::FlushPlayback),
            LiveMessage::TurnComplete => {
                let (user, model) = self.transcripts.take();
                Some(Effect::TurnComplete { user, model })
            }
            LiveMessage::Error(message) => {
                self.ended = true;
                Some(Effect::Fail(message))
            }
            LiveMessage::Close { code, reason } => {
                self.ended = true;
                Some(Effect::Closed { code, reason })
            }
        }
    }

    pub fn transcripts(&self) -> &TranscriptAccumulator {
        &self.transcripts
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}
