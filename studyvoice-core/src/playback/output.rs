//! cpal output stream feeding the shared [`Mixer`].
//!
//! Like the input side, `cpal::Stream` is thread-affine, so the stream is
//! built, played and dropped on a dedicated thread. The thread parks on a
//! shutdown channel; dropping [`OutputStreamHandle`] releases the device.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::mixer::Mixer;
use crate::config::OutputConfig;
use crate::error::{Result, VoiceError};

/// Owner of an open output device.
pub struct OutputStreamHandle {
    shutdown: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    pub sample_rate: u32,
    pub channels: u16,
    pub device_name: String,
}

impl OutputStreamHandle {
    /// Open the output device and start pulling audio from `mixer`.
    ///
    /// The mixer is reset to the device rate before the stream starts, so
    /// the playback clock restarts at zero for every opened device.
    #[cfg(feature = "audio-cpal")]
    pub fn open(config: &OutputConfig, mixer: Arc<Mutex<Mixer>>) -> Result<Self> {
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<(u32, u16, String)>>();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let config = config.clone();

        let worker = std::thread::Builder::new()
            .name("studyvoice-output".into())
            .spawn(move || {
                let stream = match build_stream(&config, mixer) {
                    Ok((stream, rate, channels, name)) => {
                        let _ = open_tx.send(Ok((rate, channels, name)));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                // Park until the handle is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                info!("output device released");
            })
            .map_err(VoiceError::Io)?;

        match open_rx.recv() {
            Ok(Ok((sample_rate, channels, device_name))) => Ok(Self {
                shutdown: Some(shutdown_tx),
                worker: Some(worker),
                sample_rate,
                channels,
                device_name,
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(VoiceError::AudioStream(
                "output thread died before opening the device".into(),
            )),
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(_config: &OutputConfig, _mixer: Arc<Mutex<Mixer>>) -> Result<Self> {
        Err(VoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl Drop for OutputStreamHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("output thread panicked during shutdown");
            }
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn build_stream(
    config: &OutputConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<(cpal::Stream, u32, u16, String)> {
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{SampleFormat, SampleRate, StreamConfig};

    let host = cpal::default_host();
    let device = crate::audio::device::select_output_device(&host, config.preferred_device.as_deref())?;
    let device_name = device.name().unwrap_or_default();

    let wanted = SampleRate(config.sample_rate);
    let supported = device
        .supported_output_configs()
        .ok()
        .and_then(|ranges| {
            ranges
                .filter(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
                .find(|r| matches!(r.sample_format(), SampleFormat::F32 | SampleFormat::I16))
                .map(|r| r.with_sample_rate(wanted))
        })
        .map(Ok)
        .unwrap_or_else(|| device.default_output_config())
        .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    info!(
        device = device_name.as_str(),
        sample_rate,
        channels,
        format = ?supported.sample_format(),
        "opening output device"
    );

    mixer.lock().reset(sample_rate);

    let stream_config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let ch = channels as usize;
    let on_error = |err: cpal::StreamError| error!("output stream error: {err}");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                mixer.lock().render_interleaved(data, ch);
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => {
            let mut buf: Vec<f32> = Vec::with_capacity(8192);
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _info: &cpal::OutputCallbackInfo| {
                    buf.resize(data.len(), 0.0);
                    mixer.lock().render_interleaved(&mut buf, ch);
                    for (dst, src) in data.iter_mut().zip(buf.iter()) {
                        *dst = (src.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    }
                },
                on_error,
                None,
            )
        }
        fmt => {
            return Err(VoiceError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| VoiceError::AudioStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| VoiceError::AudioStream(e.to_string()))?;

    Ok((stream, sample_rate, channels, device_name))
}
