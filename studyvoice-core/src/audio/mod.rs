//! Microphone access via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** block on a mutex, perform I/O or grow buffers in steady
//! state. The callback below only down-mixes into a reusable scratch buffer
//! and writes into the SPSC ring producer.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`AudioCapture`] must be created and dropped on the same thread;
//! the capture pipeline does both on its own worker thread.

pub mod device;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use crate::{
    buffering::{AudioProducer, Producer},
    error::{Result, VoiceError},
};
#[cfg(feature = "audio-cpal")]
use std::sync::atomic::Ordering;
use std::sync::{atomic::AtomicBool, Arc};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Handle to an active microphone stream.
///
/// **Not `Send`**: create and drop on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
    /// Name of the opened device, for logs and diagnostics.
    pub device_name: String,
}

/// Map a backend error message onto the error taxonomy.
///
/// cpal has no dedicated permission variant; platforms report refusal
/// through backend-specific text.
pub fn classify_stream_error(message: String) -> VoiceError {
    let lowered = message.to_ascii_lowercase();
    let denied = ["permission", "denied", "not authorized", "unauthorized"]
        .iter()
        .any(|k| lowered.contains(k));
    if denied {
        VoiceError::Permission(message)
    } else {
        VoiceError::AudioStream(message)
    }
}

/// Down-mix an interleaved callback buffer to mono f32 and push it.
#[cfg(feature = "audio-cpal")]
fn push_mono<T: Copy>(
    data: &[T],
    channels: usize,
    scratch: &mut Vec<f32>,
    producer: &mut AudioProducer,
    to_f32: impl Fn(T) -> f32,
) {
    let ch = channels.max(1);
    let frames = data.len() / ch;
    scratch.resize(frames, 0.0);
    for (f, out) in scratch.iter_mut().enumerate() {
        let base = f * ch;
        let sum: f32 = data[base..base + ch].iter().map(|s| to_f32(*s)).sum();
        *out = sum / ch as f32;
    }
    let written = producer.push_slice(scratch);
    if written < scratch.len() {
        warn!("capture ring full: dropped {} frames", scratch.len() - written);
    }
}

#[cfg(feature = "audio-cpal")]
fn pick_input_config(
    device: &cpal::Device,
    preferred_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let wanted = SampleRate(preferred_rate);
    if let Ok(ranges) = device.supported_input_configs() {
        let mut candidates: Vec<_> = ranges
            .filter(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
            .filter(|r| {
                matches!(
                    r.sample_format(),
                    SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U8
                )
            })
            .collect();
        // Mono first, then f32 over integer formats.
        candidates.sort_by_key(|r| (r.channels(), r.sample_format() != SampleFormat::F32));
        if let Some(range) = candidates.into_iter().next() {
            return Ok(range.with_sample_rate(wanted));
        }
    }
    device
        .default_input_config()
        .map_err(|e| classify_stream_error(e.to_string()))
}

impl AudioCapture {
    /// Open an input device by preferred name, falling back to the default
    /// input and then to the best-scoring available microphone.
    ///
    /// `preferred_rate` is requested when the device supports it; otherwise
    /// the device default rate is used and the caller resamples. The
    /// callback discards input while `running` is `false`.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
        preferred_rate: u32,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = device::select_input_device(&host, preferred_device_name)?;
        let device_name = device.name().unwrap_or_default();

        info!(device = device_name.as_str(), "opening input device");

        let supported = pick_input_config(&device, preferred_rate)?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, format = ?supported.sample_format(), "input config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let ch = channels as usize;
        let flag = running;
        let mut scratch: Vec<f32> = Vec::with_capacity(8192);
        let on_error = |err: cpal::StreamError| error!("input stream error: {err}");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    if flag.load(Ordering::Relaxed) {
                        push_mono(data, ch, &mut scratch, &mut producer, |s| s);
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _info| {
                    if flag.load(Ordering::Relaxed) {
                        push_mono(data, ch, &mut scratch, &mut producer, |s| {
                            s as f32 / 32768.0
                        });
                    }
                },
                on_error,
                None,
            ),
            SampleFormat::U8 => device.build_input_stream(
                &config,
                move |data: &[u8], _info| {
                    if flag.load(Ordering::Relaxed) {
                        push_mono(data, ch, &mut scratch, &mut producer, |s| {
                            (s as f32 - 128.0) / 128.0
                        });
                    }
                },
                on_error,
                None,
            ),
            fmt => {
                return Err(VoiceError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| classify_stream_error(e.to_string()))?;

        stream
            .play()
            .map_err(|e| classify_stream_error(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
            device_name,
        })
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
        _preferred_rate: u32,
    ) -> Result<Self> {
        Err(VoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::classify_stream_error;
    use crate::error::VoiceError;

    #[test]
    fn permission_text_maps_to_permission_error() {
        let err = classify_stream_error("The user denied microphone access".into());
        assert!(matches!(err, VoiceError::Permission(_)));
    }

    #[test]
    fn other_backend_text_maps_to_stream_error() {
        let err = classify_stream_error("device disconnected".into());
        assert!(matches!(err, VoiceError::AudioStream(_)));
    }

    #[cfg(not(feature = "audio-cpal"))]
    #[test]
    fn headless_build_refuses_to_open_a_microphone() {
        use super::AudioCapture;
        use crate::buffering::create_audio_ring_with_capacity;
        use std::sync::{atomic::AtomicBool, Arc};

        let (producer, _consumer) = create_audio_ring_with_capacity(1024);
        let err = AudioCapture::open(producer, Arc::new(AtomicBool::new(true)), None, 16_000)
            .err()
            .expect("no backend compiled in");
        assert!(matches!(err, VoiceError::AudioStream(_)));
    }
}
