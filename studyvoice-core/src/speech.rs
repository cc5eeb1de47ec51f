//! Text-to-speech on the utterance lane.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::codec::decode_pcm_payload;
use crate::collab::{GeminiRestClient, GenerationService};
use crate::config::OUTPUT_SAMPLE_RATE;
use crate::error::Result;
use crate::playback::AudioOutputService;

/// Produces base64 PCM16 speech at [`OUTPUT_SAMPLE_RATE`].
pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize(&self, text: &str, language: &str)
        -> impl Future<Output = Result<String>> + Send;
}

impl SpeechSynthesizer for GeminiRestClient {
    fn synthesize(
        &self,
        text: &str,
        language: &str,
    ) -> impl Future<Output = Result<String>> + Send {
        self.generate_speech(text, language)
    }
}

pub struct SpeechPlayer<S: SpeechSynthesizer> {
    synthesizer: S,
    output: AudioOutputService,
    sample_rate: u32,
    generation: AtomicU64,
}

impl<S: SpeechSynthesizer> SpeechPlayer<S> {
    pub fn new(synthesizer: S, output: AudioOutputService) -> Self {
        Self {
            synthesizer,
            output,
            sample_rate: OUTPUT_SAMPLE_RATE,
            generation: AtomicU64::new(0),
        }
    }

    /// Stop whatever is speaking, synthesize `text` and play it at
    /// `playback_rate`.
    ///
    /// Returns `Ok(false)` when a newer `speak` call superseded this one
    /// while it was synthesizing; `on_ended` is not called in that case.
    pub async fn speak<F>(
        &self,
        text: &str,
        language: &str,
        playback_rate: f64,
        on_ended: F,
    ) -> Result<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.output.stop_utterance();

        let audio = self.synthesizer.synthesize(text, language).await?;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "speech superseded before playback");
            return Ok(false);
        }

        let chunk = decode_pcm_payload(&audio, self.sample_rate)?;
        debug!(
            samples = chunk.len(),
            duration = chunk.duration_secs(),
            playback_rate,
            "playing synthesized speech"
        );
        self.output.play_utterance(chunk, playback_rate, on_ended)?;
        Ok(true)
    }

    /// Halt current speech. Idempotent.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.output.stop_utterance();
    }

    pub fn is_speaking(&self) -> bool {
        self.output.is_utterance_playing()
    }
}
