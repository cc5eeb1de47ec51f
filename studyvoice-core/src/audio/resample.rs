//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Two directions need it:
//! - capture: the microphone runs at the device rate (commonly 48 kHz), the
//!   live endpoint expects 16 kHz blocks;
//! - playback: model audio arrives at 24 kHz and the output device may run
//!   at 44.1 or 48 kHz.
//!
//! When both rates match, [`RateConverter`] is a passthrough and no rubato
//! session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{Result, VoiceError};

/// Input frame count per rubato call used for whole-buffer conversion.
const BUFFER_CHUNK: usize = 1024;

/// Streaming f32 mono converter from one fixed rate to another.
pub struct RateConverter {
    /// `None` when `from == to`.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// Pre-allocated `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    from_rate: u32,
    to_rate: u32,
}

impl RateConverter {
    /// Create a converter taking `chunk_size` input frames per rubato call.
    ///
    /// # Errors
    /// `VoiceError::AudioDevice` if either rate is zero or rubato refuses the ratio.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(VoiceError::AudioDevice(format!(
                "invalid resampling rates {from_rate} -> {to_rate}"
            )));
        }

        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                from_rate,
                to_rate,
            });
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler =
            FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
                .map_err(|e| VoiceError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        debug!(from_rate, to_rate, chunk_size, max_out, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf: vec![vec![0f32; max_out]; 1],
            from_rate,
            to_rate,
        })
    }

    /// Feed samples and return whatever full rubato blocks produced (may be empty).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Push out the buffered remainder by zero-padding it to a full block.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.input_buf.is_empty() {
            self.input_buf.clear();
            return Vec::new();
        }
        let pad = self.chunk_size - self.input_buf.len();
        let padding = vec![0.0f32; pad];
        self.process(&padding)
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }
}

/// Number of frames `len` input frames occupy at `to_rate`.
pub fn converted_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == to_rate || from_rate == 0 {
        return len;
    }
    ((len as u128 * to_rate as u128 + from_rate as u128 / 2) / from_rate as u128) as usize
}

/// Convert a complete buffer, returning exactly [`converted_len`] frames.
///
/// rubato's filter delay is trimmed from the front and the output is padded
/// or truncated so that the buffer duration is preserved frame-exactly.
pub fn convert_buffer(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    let target_len = converted_len(samples.len(), from_rate, to_rate);
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let mut rc = RateConverter::new(from_rate, to_rate, BUFFER_CHUNK)?;
    let delay = rc
        .resampler
        .as_ref()
        .map(|r| r.output_delay())
        .unwrap_or(0);

    let mut out = rc.process(samples);
    out.extend(rc.flush());
    // One extra block drains the filter tail so the trimmed output is not short.
    if out.len() < target_len + delay {
        out.extend(rc.process(&vec![0.0f32; BUFFER_CHUNK]));
    }

    let start = delay.min(out.len());
    let mut trimmed: Vec<f32> = out.drain(start..).collect();
    trimmed.resize(target_len, 0.0);
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn ratio_48k_to_16k_correct_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={} expected≈320",
            out.len()
        );
    }

    #[test]
    fn partial_input_waits_for_full_block() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn flush_drains_the_remainder() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.1f32; 300]).is_empty());
        assert!(!rc.flush().is_empty());
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(RateConverter::new(0, 16_000, 960).is_err());
    }

    #[test]
    fn converted_len_rounds_to_nearest_frame() {
        assert_eq!(converted_len(24_000, 24_000, 48_000), 48_000);
        assert_eq!(converted_len(4_096, 48_000, 16_000), 1_365);
        assert_eq!(converted_len(100, 24_000, 44_100), 184);
    }

    #[test]
    fn convert_buffer_preserves_duration_exactly() {
        let samples = vec![0.25f32; 24_000];
        let out = convert_buffer(&samples, 24_000, 48_000).unwrap();
        assert_eq!(out.len(), 48_000);

        let odd = vec![0.0f32; 1_234];
        let out = convert_buffer(&odd, 24_000, 44_100).unwrap();
        assert_eq!(out.len(), converted_len(1_234, 24_000, 44_100));
    }
}
