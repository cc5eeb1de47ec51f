//! Microphone capture pipeline.
//!
//! ```text
//! cpal callback ─► SPSC ring ─► capture thread: drain → resample → frame
//!                                                            │
//!                                              encode_block ─┴─► BlockSink
//! ```
//!
//! The microphone stream is opened and dropped on the capture thread because
//! cpal streams are thread-affine. `open` blocks until the device is open or
//! has failed, and reports the failure to the caller.
//!
//! The thread polls the ring and sleeps `SLEEP_EMPTY_MS` when it is empty,
//! so a block is handed to the sink at most one poll interval after its last
//! sample reaches the ring, plus whatever the resampler still holds (under
//! `DRAIN_CHUNK` device frames). Against a 256 ms block at 16 kHz this
//! stays well inside one block period.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    audio::{resample::RateConverter, AudioCapture},
    buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer},
    codec::{encode_block, MediaBlob},
    config::CaptureConfig,
    error::{Result, VoiceError},
};

/// Samples drained from the ring per iteration.
const DRAIN_CHUNK: usize = 1024;
/// Sleep when the ring is empty. Upper bound on the framing delay when the
/// device rate already matches the target rate.
const SLEEP_EMPTY_MS: u64 = 5;

/// An open microphone. Dropping it releases the device.
pub trait MicrophoneStream {
    /// Rate at which samples are pushed into the ring.
    fn sample_rate(&self) -> u32;
    fn device_name(&self) -> &str {
        ""
    }
}

/// Opens microphones. `open` is called on the capture thread, so the
/// returned stream need not be `Send`.
pub trait MicrophoneSource: Send + Sync {
    fn open(
        &self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        config: &CaptureConfig,
    ) -> Result<Box<dyn MicrophoneStream>>;
}

/// Receives encoded blocks. Must not block.
pub trait BlockSink: Send + Sync {
    fn send_block(&self, block: MediaBlob);
}

impl<F> BlockSink for F
where
    F: Fn(MediaBlob) + Send + Sync,
{
    fn send_block(&self, block: MediaBlob) {
        self(block)
    }
}

/// System microphone through cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl MicrophoneStream for AudioCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(
        &self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        config: &CaptureConfig,
    ) -> Result<Box<dyn MicrophoneStream>> {
        let capture = AudioCapture::open(
            producer,
            running,
            config.preferred_device.as_deref(),
            config.sample_rate,
        )?;
        Ok(Box::new(capture))
    }
}

#[derive(Default)]
pub struct CaptureDiagnostics {
    pub frames_in: AtomicUsize,
    pub frames_resampled: AtomicUsize,
    pub blocks_sent: AtomicUsize,
}

impl CaptureDiagnostics {
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_resampled: self.frames_resampled.load(Ordering::Relaxed),
            blocks_sent: self.blocks_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSnapshot {
    pub frames_in: usize,
    pub frames_resampled: usize,
    pub blocks_sent: usize,
}

/// A running capture. Close it (or drop it) to release the microphone.
pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    active_tracks: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
    diagnostics: Arc<CaptureDiagnostics>,
    device_sample_rate: u32,
}

impl CapturePipeline {
    /// Open the microphone and start streaming blocks into `sink`.
    ///
    /// # Errors
    /// - `VoiceError::Permission` if microphone access is refused.
    /// - `VoiceError::NoDefaultInputDevice` / `VoiceError::AudioStream` on
    ///   device failure.
    pub fn open(
        config: CaptureConfig,
        source: Arc<dyn MicrophoneSource>,
        sink: Arc<dyn BlockSink>,
    ) -> Result<Self> {
        if config.block_size == 0 || config.sample_rate == 0 {
            return Err(VoiceError::Config(
                "capture block size and sample rate must be non-zero".into(),
            ));
        }

        let running = Arc::new(AtomicBool::new(true));
        let active_tracks = Arc::new(AtomicUsize::new(0));
        let diagnostics = Arc::new(CaptureDiagnostics::default());
        let (producer, consumer) = create_audio_ring();
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let worker = {
            let running = Arc::clone(&running);
            let active_tracks = Arc::clone(&active_tracks);
            let diagnostics = Arc::clone(&diagnostics);
            std::thread::Builder::new()
                .name("studyvoice-capture".into())
                .spawn(move || {
                    let stream = match source.open(producer, Arc::clone(&running), &config) {
                        Ok(stream) => stream,
                        Err(e) => {
                            running.store(false, Ordering::SeqCst);
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };
                    let device_rate = stream.sample_rate();
                    let converter = match RateConverter::new(device_rate, config.sample_rate, DRAIN_CHUNK) {
                        Ok(c) => c,
                        Err(e) => {
                            running.store(false, Ordering::SeqCst);
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };
                    active_tracks.store(1, Ordering::SeqCst);
                    info!(
                        device = stream.device_name(),
                        device_rate = converter.from_rate(),
                        target_rate = converter.to_rate(),
                        resampling = !converter.is_passthrough(),
                        "microphone open"
                    );
                    let _ = open_tx.send(Ok(device_rate));

                    run(CaptureContext {
                        consumer,
                        converter,
                        running: Arc::clone(&running),
                        sink,
                        block_size: config.block_size,
                        sample_rate: config.sample_rate,
                        diagnostics,
                    });

                    // Stream drops on this thread, releasing the device.
                    drop(stream);
                    active_tracks.store(0, Ordering::SeqCst);
                    info!("microphone released");
                })
                .map_err(VoiceError::Io)?
        };

        match open_rx.recv() {
            Ok(Ok(device_sample_rate)) => Ok(Self {
                running,
                active_tracks,
                worker: Mutex::new(Some(worker)),
                diagnostics,
                device_sample_rate,
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                warn!(error = %e, "microphone open failed");
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(VoiceError::Other(anyhow::anyhow!(
                    "capture thread died before opening the microphone"
                )))
            }
        }
    }

    /// Stop capturing and release the microphone. Idempotent.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.join().is_err() {
            warn!("capture thread panicked during shutdown");
            self.active_tracks.store(0, Ordering::SeqCst);
        }
        debug!("capture pipeline closed");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of open microphone tracks (0 or 1).
    pub fn active_tracks(&self) -> usize {
        self.active_tracks.load(Ordering::SeqCst)
    }

    pub fn device_sample_rate(&self) -> u32 {
        self.device_sample_rate
    }

    pub fn diagnostics(&self) -> CaptureSnapshot {
        self.diagnostics.snapshot()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.close();
    }
}

struct CaptureContext {
    consumer: AudioConsumer,
    converter: RateConverter,
    running: Arc<AtomicBool>,
    sink: Arc<dyn BlockSink>,
    block_size: usize,
    sample_rate: u32,
    diagnostics: Arc<CaptureDiagnostics>,
}

fn run(mut ctx: CaptureContext) {
    let mut drain = vec![0.0f32; DRAIN_CHUNK];
    let mut pending: Vec<f32> = Vec::with_capacity(ctx.block_size * 2);

    while ctx.running.load(Ordering::Relaxed) {
        let n = ctx.consumer.pop_slice(&mut drain);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(SLEEP_EMPTY_MS));
            continue;
        }
        ctx.diagnostics.frames_in.fetch_add(n, Ordering::Relaxed);

        let converted = ctx.converter.process(&drain[..n]);
        ctx.diagnostics
            .frames_resampled
            .fetch_add(converted.len(), Ordering::Relaxed);
        pending.extend_from_slice(&converted);

        while pending.len() >= ctx.block_size {
            let block = encode_block(&pending[..ctx.block_size], ctx.sample_rate);
            pending.drain(..ctx.block_size);
            ctx.sink.send_block(block);
            ctx.diagnostics.blocks_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
    // A partial trailing block is discarded; the endpoint only sees full blocks.
    debug!(discarded = pending.len(), "capture loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::Producer;
    use crate::codec::decode_pcm_payload;

    /// Pushes a fixed buffer once, then stays open until dropped.
    struct FakeMic {
        samples: Vec<f32>,
        rate: u32,
        opened: Arc<AtomicUsize>,
    }

    struct FakeStream {
        rate: u32,
    }

    impl MicrophoneStream for FakeStream {
        fn sample_rate(&self) -> u32 {
            self.rate
        }
    }

    impl MicrophoneSource for FakeMic {
        fn open(
            &self,
            mut producer: AudioProducer,
            _running: Arc<AtomicBool>,
            _config: &CaptureConfig,
        ) -> Result<Box<dyn MicrophoneStream>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            producer.push_slice(&self.samples);
            Ok(Box::new(FakeStream { rate: self.rate }))
        }
    }

    /// Hands the ring producer back to the test so samples arrive late.
    #[derive(Default)]
    struct LateMic {
        producer: Mutex<Option<AudioProducer>>,
    }

    impl MicrophoneSource for LateMic {
        fn open(
            &self,
            producer: AudioProducer,
            _running: Arc<AtomicBool>,
            _config: &CaptureConfig,
        ) -> Result<Box<dyn MicrophoneStream>> {
            *self.producer.lock() = Some(producer);
            Ok(Box::new(FakeStream { rate: 16_000 }))
        }
    }

    struct DeniedMic;

    impl MicrophoneSource for DeniedMic {
        fn open(
            &self,
            _producer: AudioProducer,
            _running: Arc<AtomicBool>,
            _config: &CaptureConfig,
        ) -> Result<Box<dyn MicrophoneStream>> {
            Err(VoiceError::Permission("microphone access denied".into()))
        }
    }

    fn collecting_sink() -> (Arc<Mutex<Vec<MediaBlob>>>, Arc<dyn BlockSink>) {
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::clone(&blocks);
        let sink: Arc<dyn BlockSink> = Arc::new(move |blob: MediaBlob| b.lock().push(blob));
        (blocks, sink)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn frames_exact_blocks_at_the_target_rate() {
        let mic = Arc::new(FakeMic {
            samples: (0..4096 * 2 + 100).map(|i| ((i % 64) as f32 - 32.0) / 64.0).collect(),
            rate: 16_000,
            opened: Arc::new(AtomicUsize::new(0)),
        });
        let (blocks, sink) = collecting_sink();
        let pipeline = CapturePipeline::open(CaptureConfig::default(), mic, sink).unwrap();
        assert_eq!(pipeline.active_tracks(), 1);

        wait_for(|| blocks.lock().len() == 2 && pipeline.diagnostics().frames_in == 4096 * 2 + 100);
        pipeline.close();

        let blocks = blocks.lock();
        assert_eq!(blocks.len(), 2);
        for blob in blocks.iter() {
            assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
            let chunk = decode_pcm_payload(&blob.data, 16_000).unwrap();
            assert_eq!(chunk.len(), 4096);
        }
        let snap = pipeline.diagnostics();
        assert_eq!(snap.frames_in, 4096 * 2 + 100);
        assert_eq!(snap.blocks_sent, 2);
    }

    #[test]
    fn idle_thread_frames_a_late_block_within_a_few_polls() {
        let mic = Arc::new(LateMic::default());
        let (blocks, sink) = collecting_sink();
        let pipeline = CapturePipeline::open(CaptureConfig::default(), mic.clone(), sink).unwrap();

        // Let the thread settle into its empty-ring sleep.
        std::thread::sleep(Duration::from_millis(50));
        let mut producer = mic.producer.lock().take().expect("microphone opened");
        let pushed_at = std::time::Instant::now();
        assert_eq!(producer.push_slice(&vec![0.25; 4096]), 4096);

        wait_for(|| blocks.lock().len() == 1);
        let delay = pushed_at.elapsed();
        pipeline.close();
        assert!(
            delay < Duration::from_millis(SLEEP_EMPTY_MS * 40),
            "block framed after {delay:?}"
        );
    }

    #[test]
    fn permission_denial_surfaces_as_permission_error() {
        let (blocks, sink) = collecting_sink();
        let err = CapturePipeline::open(CaptureConfig::default(), Arc::new(DeniedMic), sink)
            .err()
            .expect("open must fail");
        assert!(matches!(err, VoiceError::Permission(_)));
        assert!(blocks.lock().is_empty());
    }

    #[test]
    fn close_releases_every_track_and_is_idempotent() {
        let opened = Arc::new(AtomicUsize::new(0));
        let mic = Arc::new(FakeMic {
            samples: Vec::new(),
            rate: 48_000,
            opened: Arc::clone(&opened),
        });
        let (_blocks, sink) = collecting_sink();
        let pipeline = CapturePipeline::open(CaptureConfig::default(), mic, sink).unwrap();
        assert_eq!(pipeline.device_sample_rate(), 48_000);
        pipeline.close();
        assert_eq!(pipeline.active_tracks(), 0);
        assert!(!pipeline.is_running());
        pipeline.close();
        assert_eq!(pipeline.active_tracks(), 0);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let (_blocks, sink) = collecting_sink();
        let cfg = CaptureConfig {
            block_size: 0,
            ..CaptureConfig::default()
        };
        assert!(CapturePipeline::open(cfg, Arc::new(DeniedMic), sink).is_err());
    }
}
