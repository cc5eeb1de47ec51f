//! One-shot generation calls used alongside the live session.
//!
//! These are plain request/response calls: document Q&A text, speech for
//! the utterance lane, and image generation.

pub mod gemini;

use std::future::Future;

use crate::codec::MediaBlob;
use crate::error::Result;

pub use gemini::GeminiRestClient;

pub trait GenerationService: Send + Sync {
    /// Answer `prompt`, grounded on `context` when it is non-empty.
    fn generate(&self, prompt: &str, context: &str) -> impl Future<Output = Result<String>> + Send;

    /// Base64 PCM16 speech (24 kHz mono) for `text` spoken in `language`.
    fn generate_speech(
        &self,
        text: &str,
        language: &str,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Base64 image data generated from `prompt`, optionally starting from
    /// `input_image`.
    fn generate_image(
        &self,
        prompt: &str,
        input_image: Option<&MediaBlob>,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Wrap `prompt` with document context.
pub fn contextual_prompt(prompt: &str, context: &str) -> String {
    if context.trim().is_empty() {
        return prompt.to_owned();
    }
    format!(
        "Based on the following context from a PDF document, please answer the user's request.\n\n\
         --- CONTEXT ---\n{context}\n--- END CONTEXT ---\n\nUser Request: {prompt}"
    )
}

pub fn speech_prompt(text: &str, language: &str) -> String {
    format!("Please say the following in {language}: {text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_passes_prompt_through() {
        assert_eq!(contextual_prompt("Summarize", "  "), "Summarize");
    }

    #[test]
    fn context_is_fenced_before_the_request() {
        let p = contextual_prompt("Explain osmosis", "Chapter 2 text");
        let ctx = p.find("--- CONTEXT ---\nChapter 2 text\n--- END CONTEXT ---").unwrap();
        let req = p.find("User Request: Explain osmosis").unwrap();
        assert!(ctx < req);
    }

    #[test]
    fn speech_prompt_names_the_language() {
        assert_eq!(
            speech_prompt("hola", "Spanish"),
            "Please say the following in Spanish: hola"
        );
    }
}
