//! PCM codec: f32 samples ⇄ 16-bit little-endian PCM, bytes ⇄ transport text.
//!
//! Everything here is a pure function. The live endpoint speaks raw mono
//! PCM16 wrapped in base64, so these are the only conversions the session
//! needs on the hot path.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::buffering::chunk::AudioChunk;
use crate::error::{Result, VoiceError};

/// Full-scale factor for signed 16-bit PCM.
pub const PCM16_SCALE: f32 = 32768.0;

/// A base64 payload tagged with its MIME type, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub mime_type: String,
    pub data: String,
}

/// MIME type for raw mono PCM16 at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Encode bytes as standard (padded) base64.
pub fn encode_transport_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64 back into bytes.
///
/// # Errors
/// `VoiceError::Decode` if `text` is not valid base64.
pub fn decode_transport_text(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| VoiceError::Decode(format!("invalid base64: {e}")))
}

/// Convert f32 samples to little-endian PCM16 bytes.
///
/// Each sample maps to `round(s * 32768)`. There is no clamping: values that
/// fall outside the i16 range wrap around (`+1.0` becomes `-32768`). Keeping
/// input inside `[-1.0, 1.0)` is the caller's job.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let wide = (s * PCM16_SCALE).round() as i32;
        out.extend_from_slice(&(wide as i16).to_le_bytes());
    }
    out
}

/// Convert little-endian mono PCM16 bytes into an [`AudioChunk`].
///
/// # Errors
/// `VoiceError::Decode` when the byte count is odd or `sample_rate` is zero.
pub fn pcm16_to_chunk(bytes: &[u8], sample_rate: u32) -> Result<AudioChunk> {
    if sample_rate == 0 {
        return Err(VoiceError::Decode("sample rate must be non-zero".into()));
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect();
    Ok(AudioChunk::new(samples, sample_rate))
}

/// Decode a base64 PCM16 payload straight into an [`AudioChunk`].
pub fn decode_pcm_payload(text: &str, sample_rate: u32) -> Result<AudioChunk> {
    let bytes = decode_transport_text(text)?;
    pcm16_to_chunk(&bytes, sample_rate)
}

/// Encode one captured block for the outbound stream.
pub fn encode_block(samples: &[f32], sample_rate: u32) -> MediaBlob {
    MediaBlob {
        mime_type: pcm_mime_type(sample_rate),
        data: encode_transport_text(&float_to_pcm16(samples)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn transport_text_round_trips_every_byte_value() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let text = encode_transport_text(&bytes);
        assert_eq!(decode_transport_text(&text).unwrap(), bytes);
    }

    #[test]
    fn malformed_transport_text_is_a_decode_error() {
        let err = decode_transport_text("not*base64!").unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
    }

    #[test]
    fn float_to_pcm16_rounds_and_writes_little_endian() {
        let bytes = float_to_pcm16(&[0.0, 0.5, -0.5, -1.0]);
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x40, 0x00, 0xC0, 0x00, 0x80]);

        // 0.25/32768 rounds down, 0.75/32768 rounds up.
        let tiny = float_to_pcm16(&[0.25 / 32768.0, 0.75 / 32768.0]);
        assert_eq!(tiny, vec![0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn positive_full_scale_wraps_instead_of_clamping() {
        let bytes = float_to_pcm16(&[1.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MIN);
    }

    #[test]
    fn pcm_round_trip_stays_within_one_quantization_step() {
        let samples: Vec<f32> = (0..2000)
            .map(|i| -1.0 + i as f32 * (2.0 / 2000.0))
            .collect();
        let chunk = pcm16_to_chunk(&float_to_pcm16(&samples), 16_000).unwrap();
        assert_eq!(chunk.samples.len(), samples.len());
        for (orig, back) in samples.iter().zip(&chunk.samples) {
            assert_abs_diff_eq!(*orig, *back, epsilon = 1.0 / 32768.0);
        }
    }

    #[test]
    fn odd_length_pcm_is_rejected() {
        let err = pcm16_to_chunk(&[0x00, 0x01, 0x02], 24_000).unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
    }

    #[test]
    fn zero_sample_rate_is_rejected() {
        assert!(pcm16_to_chunk(&[0, 0], 0).is_err());
    }

    #[test]
    fn encoded_block_carries_rate_in_mime_type() {
        let blob = encode_block(&[0.0; 4], 16_000);
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        assert_eq!(decode_transport_text(&blob.data).unwrap().len(), 8);

        let json = serde_json::to_value(&blob).unwrap();
        assert_eq!(json["mimeType"], "audio/pcm;rate=16000");
    }
}
