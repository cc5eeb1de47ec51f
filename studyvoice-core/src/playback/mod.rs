//! `AudioOutputService`: the shared output device and its two lanes.
//!
//! ```text
//!  play_utterance ─┐                       ┌─► cpal callback (render)
//!                  ├─► lanes ─► Mixer ◄────┤
//!  enqueue_live ───┘     ▲                 └─► VoiceEvent::Ended ─► dispatcher
//!                        └──────────────────────────────────────────────┘
//! ```
//!
//! Lock order is `device → lanes → mixer`. The audio callback only takes the
//! mixer lock. Completion callbacks run on the dispatcher thread (device
//! mode) or inside `render` / `dispatch_pending` (headless mode), never while
//! a lane lock is held.

pub mod lanes;
pub mod mixer;
pub mod output;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    audio::resample::convert_buffer,
    buffering::chunk::AudioChunk,
    config::OutputConfig,
    error::{Result, VoiceError},
};
use lanes::{LiveLane, OnEnded, UtteranceLane};
use mixer::{Mixer, VoiceEvent, VoiceId};
use output::OutputStreamHandle;

/// Pending completion events before the mixer starts dropping them.
const EVENT_QUEUE_CAP: usize = 1024;

/// Set while a device-backed service exists in this process.
static OUTPUT_ACQUIRED: AtomicBool = AtomicBool::new(false);

/// Where a live chunk landed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start_secs: f64,
    pub duration_secs: f64,
}

impl ScheduledChunk {
    pub fn end_secs(&self) -> f64 {
        self.start_secs + self.duration_secs
    }
}

enum Backend {
    Device(OutputConfig),
    Headless,
}

#[derive(Default)]
struct Lanes {
    utterance: UtteranceLane,
    live: LiveLane,
}

struct OutputInner {
    backend: Backend,
    mixer: Arc<Mutex<Mixer>>,
    device: Mutex<Option<OutputStreamHandle>>,
    lanes: Mutex<Lanes>,
    events: Receiver<VoiceEvent>,
    holds_guard: bool,
}

/// Cloneable handle to the process output device.
#[derive(Clone)]
pub struct AudioOutputService {
    inner: Arc<OutputInner>,
}

impl std::fmt::Debug for AudioOutputService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioOutputService")
            .field("headless", &matches!(self.inner.backend, Backend::Headless))
            .finish_non_exhaustive()
    }
}

impl AudioOutputService {
    /// Acquire the device-backed output service.
    ///
    /// The device itself is opened lazily on the first playback call.
    ///
    /// # Errors
    /// `VoiceError::OutputBusy` if another device-backed service is alive.
    pub fn acquire(config: OutputConfig) -> Result<Self> {
        if OUTPUT_ACQUIRED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(VoiceError::OutputBusy);
        }
        let rate = config.sample_rate;
        let service = Self::build(Backend::Device(config), rate, true);
        service.spawn_dispatcher()?;
        info!("audio output service acquired");
        Ok(service)
    }

    /// A service without a device: the clock only moves through [`render`].
    ///
    /// [`render`]: AudioOutputService::render
    pub fn headless(sample_rate: u32) -> Self {
        Self::build(Backend::Headless, sample_rate.max(1), false)
    }

    fn build(backend: Backend, sample_rate: u32, holds_guard: bool) -> Self {
        let (tx, rx) = bounded(EVENT_QUEUE_CAP);
        Self {
            inner: Arc::new(OutputInner {
                backend,
                mixer: Arc::new(Mutex::new(Mixer::new(sample_rate, tx))),
                device: Mutex::new(None),
                lanes: Mutex::new(Lanes::default()),
                events: rx,
                holds_guard,
            }),
        }
    }

    fn spawn_dispatcher(&self) -> Result<()> {
        let weak: Weak<OutputInner> = Arc::downgrade(&self.inner);
        let events = self.inner.events.clone();
        std::thread::Builder::new()
            .name("studyvoice-playback-events".into())
            .spawn(move || {
                while let Ok(event) = events.recv() {
                    match weak.upgrade() {
                        Some(inner) => inner.handle_event(event),
                        None => break,
                    }
                }
                debug!("playback event dispatcher exiting");
            })
            .map(|_| ())
            .map_err(VoiceError::Io)
    }

    /// Give the device back and clear the process guard.
    pub fn release(self) {
        self.close_device();
    }

    pub fn is_headless(&self) -> bool {
        matches!(self.inner.backend, Backend::Headless)
    }

    /// Whether the underlying output device is currently open.
    pub fn is_device_open(&self) -> bool {
        self.inner.device.lock().is_some()
    }

    /// Device sample rate (the requested rate until the device opens).
    pub fn sample_rate(&self) -> u32 {
        self.inner.mixer.lock().sample_rate()
    }

    /// Current position of the playback clock in seconds.
    pub fn clock_time(&self) -> f64 {
        self.inner.mixer.lock().clock_secs()
    }

    /// Where the next live chunk would start if the clock were at zero.
    pub fn next_start_time(&self) -> f64 {
        let frames = self.inner.lanes.lock().live.next_start_frame();
        frames as f64 / self.sample_rate() as f64
    }

    pub fn active_live_count(&self) -> usize {
        self.inner.lanes.lock().live.active_count()
    }

    pub fn is_utterance_playing(&self) -> bool {
        self.inner.lanes.lock().utterance.current().is_some()
    }

    /// Play a single utterance, replacing any utterance already playing.
    ///
    /// `on_ended` runs exactly once, when playback finishes or is stopped.
    pub fn play_utterance<F>(&self, chunk: AudioChunk, playback_rate: f64, on_ended: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !(playback_rate.is_finite() && playback_rate > 0.0) {
            return Err(VoiceError::Config(format!(
                "playback rate must be positive, got {playback_rate}"
            )));
        }
        self.stop_utterance();
        let device_rate = self.ensure_device()?;
        let samples = to_device_rate(&chunk, device_rate)?;
        let frames = samples.len();

        let callback: OnEnded = Box::new(on_ended);
        let mut lanes = self.inner.lanes.lock();
        let mut mixer = self.inner.mixer.lock();
        if let Some(previous) = lanes.utterance.take_current() {
            mixer.stop(previous);
        }
        let now = mixer.clock_frames();
        let id = mixer.add_voice(now, samples, playback_rate);
        lanes.utterance.start(id, callback);
        debug!(voice = id, frames, playback_rate, "utterance started");
        Ok(())
    }

    /// Halt the current utterance. No-op when nothing is playing.
    pub fn stop_utterance(&self) {
        let mut lanes = self.inner.lanes.lock();
        if let Some(id) = lanes.utterance.take_current() {
            self.inner.mixer.lock().stop(id);
            debug!(voice = id, "utterance stopped");
        }
    }

    /// Schedule a live chunk right after the previously scheduled one.
    pub fn enqueue_live_chunk(&self, chunk: AudioChunk) -> Result<ScheduledChunk> {
        let device_rate = self.ensure_device()?;
        let samples = to_device_rate(&chunk, device_rate)?;
        let frames = samples.len() as u64;

        let mut lanes = self.inner.lanes.lock();
        let mut mixer = self.inner.mixer.lock();
        let rate = mixer.sample_rate() as f64;
        let start = lanes.live.reserve(mixer.clock_frames(), frames);
        if frames > 0 {
            let id = mixer.add_voice(start, samples, 1.0);
            lanes.live.register(id);
            debug!(voice = id, start_frame = start, frames, "live chunk scheduled");
        }
        Ok(ScheduledChunk {
            start_secs: start as f64 / rate,
            duration_secs: frames as f64 / rate,
        })
    }

    /// Halt every live voice and reset the live cursor to zero.
    pub fn stop_all_live(&self) {
        let mut lanes = self.inner.lanes.lock();
        let ids = lanes.live.reset();
        if ids.is_empty() {
            return;
        }
        let mut mixer = self.inner.mixer.lock();
        for id in &ids {
            mixer.stop(*id);
        }
        debug!(stopped = ids.len(), "live lane cleared");
    }

    /// Stop both lanes and close the device. The next playback reopens it.
    pub fn close_device(&self) {
        let mut device = self.inner.device.lock();
        {
            let mut lanes = self.inner.lanes.lock();
            lanes.live.reset();
            lanes.utterance.take_current();
            self.inner.mixer.lock().stop_all();
        }
        if device.take().is_some() {
            info!("output device closed");
        }
        drop(device);
        self.dispatch_pending();
    }

    /// Render `frames` mono frames and dispatch resulting completions.
    ///
    /// This is how a headless service advances its clock. On a device-backed
    /// service it would race the device callback, so it is rejected there.
    pub fn render(&self, frames: usize) -> Result<Vec<f32>> {
        if !self.is_headless() {
            return Err(VoiceError::Config(
                "render is only available on headless output services".into(),
            ));
        }
        let mut out = vec![0.0f32; frames];
        self.inner.mixer.lock().render(&mut out);
        self.dispatch_pending();
        Ok(out)
    }

    /// Run completion callbacks for events already emitted by the mixer.
    pub fn dispatch_pending(&self) {
        while let Ok(event) = self.inner.events.try_recv() {
            self.inner.handle_event(event);
        }
    }

    fn ensure_device(&self) -> Result<u32> {
        let Backend::Device(ref config) = self.inner.backend else {
            return Ok(self.sample_rate());
        };
        let mut device = self.inner.device.lock();
        if let Some(handle) = device.as_ref() {
            return Ok(handle.sample_rate);
        }
        let handle = OutputStreamHandle::open(config, Arc::clone(&self.inner.mixer))?;
        // Fresh device, fresh clock: the live cursor restarts too.
        {
            let mut lanes = self.inner.lanes.lock();
            lanes.live.reset();
            lanes.utterance.take_current();
        }
        let rate = handle.sample_rate;
        info!(
            device = handle.device_name.as_str(),
            sample_rate = rate,
            channels = handle.channels,
            "output device opened"
        );
        *device = Some(handle);
        Ok(rate)
    }
}

impl OutputInner {
    fn handle_event(&self, event: VoiceEvent) {
        let VoiceEvent::Ended(id) = event;
        let callback = {
            let mut lanes = self.lanes.lock();
            lanes.live.finish(id);
            lanes.utterance.finish(id)
        };
        if let Some(cb) = callback {
            cb();
        }
    }
}

impl Drop for OutputInner {
    fn drop(&mut self) {
        self.device.get_mut().take();
        // Voices that never finished still owe their callbacks.
        let pending = self.lanes.get_mut().utterance.drain_pending();
        for cb in pending {
            cb();
        }
        if self.holds_guard {
            OUTPUT_ACQUIRED.store(false, Ordering::Release);
            info!("audio output service released");
        }
    }
}

fn to_device_rate(chunk: &AudioChunk, device_rate: u32) -> Result<Vec<f32>> {
    if chunk.sample_rate == 0 {
        return Err(VoiceError::Decode("chunk has a zero sample rate".into()));
    }
    convert_buffer(&chunk.samples, chunk.sample_rate, device_rate).map_err(|e| {
        warn!(error = %e, "failed to convert chunk to device rate");
        VoiceError::Decode(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn second(rate: u32) -> AudioChunk {
        AudioChunk::new(vec![0.1; rate as usize], rate)
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let c = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&c);
        (c, move || {
            c2.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn live_chunks_play_back_to_back() {
        let out = AudioOutputService::headless(1_000);
        let a = out.enqueue_live_chunk(second(1_000)).unwrap();
        out.render(250).unwrap();
        let b = out.enqueue_live_chunk(second(1_000)).unwrap();
        let c = out.enqueue_live_chunk(second(1_000)).unwrap();
        assert_eq!(a.start_secs, 0.0);
        assert_eq!(b.start_secs, a.end_secs());
        assert_eq!(c.start_secs, b.end_secs());
        assert_eq!(out.next_start_time(), 3.0);
        assert_eq!(out.active_live_count(), 3);
    }

    #[test]
    fn late_chunk_starts_at_the_device_clock() {
        let out = AudioOutputService::headless(1_000);
        out.enqueue_live_chunk(second(1_000)).unwrap();
        out.render(1_500).unwrap();
        assert_eq!(out.active_live_count(), 0);
        let late = out.enqueue_live_chunk(second(1_000)).unwrap();
        assert_eq!(late.start_secs, 1.5);
    }

    #[test]
    fn live_chunks_are_resampled_to_the_device_rate() {
        let out = AudioOutputService::headless(48_000);
        let s = out.enqueue_live_chunk(AudioChunk::new(vec![0.0; 2_400], 24_000)).unwrap();
        assert_eq!(s.duration_secs, 0.1);
        assert_eq!(out.next_start_time(), 0.1);
    }

    #[test]
    fn zero_rate_chunk_is_rejected_without_registering() {
        let out = AudioOutputService::headless(1_000);
        let err = out.enqueue_live_chunk(AudioChunk::new(vec![0.0; 10], 0)).unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
        assert_eq!(out.active_live_count(), 0);
        assert_eq!(out.next_start_time(), 0.0);
    }

    #[test]
    fn stop_all_live_is_idempotent_and_resets_cursor() {
        let out = AudioOutputService::headless(1_000);
        out.enqueue_live_chunk(second(1_000)).unwrap();
        out.enqueue_live_chunk(second(1_000)).unwrap();
        out.stop_all_live();
        assert_eq!(out.active_live_count(), 0);
        assert_eq!(out.next_start_time(), 0.0);
        out.stop_all_live();
        assert_eq!(out.active_live_count(), 0);
        assert_eq!(out.next_start_time(), 0.0);
        assert!(out.render(100).unwrap().iter().all(|s| *s == 0.0));
    }

    #[test]
    fn utterance_fires_on_ended_after_natural_completion() {
        let out = AudioOutputService::headless(1_000);
        let (fired, cb) = counter();
        out.play_utterance(AudioChunk::new(vec![0.2; 100], 1_000), 1.0, cb)
            .unwrap();
        assert!(out.is_utterance_playing());
        out.render(50).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        out.render(50).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!out.is_utterance_playing());
    }

    #[test]
    fn new_utterance_replaces_the_old_one() {
        let out = AudioOutputService::headless(1_000);
        let (first, cb1) = counter();
        let (second_fired, cb2) = counter();
        out.play_utterance(AudioChunk::new(vec![0.2; 1_000], 1_000), 1.0, cb1)
            .unwrap();
        out.play_utterance(AudioChunk::new(vec![0.4; 10], 1_000), 1.0, cb2)
            .unwrap();
        let block = out.render(20).unwrap();
        // Only the second utterance is audible.
        assert!(block[..10].iter().all(|s| (*s - 0.4).abs() < 1e-6));
        assert!(block[10..].iter().all(|s| *s == 0.0));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_utterance_is_idempotent() {
        let out = AudioOutputService::headless(1_000);
        out.stop_utterance();
        let (fired, cb) = counter();
        out.play_utterance(AudioChunk::new(vec![0.2; 1_000], 1_000), 1.0, cb)
            .unwrap();
        out.stop_utterance();
        out.stop_utterance();
        out.dispatch_pending();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!out.is_utterance_playing());
    }

    #[test]
    fn utterance_and_live_lanes_do_not_disturb_each_other() {
        let out = AudioOutputService::headless(1_000);
        out.enqueue_live_chunk(second(1_000)).unwrap();
        out.play_utterance(AudioChunk::new(vec![0.2; 10], 1_000), 1.0, || {})
            .unwrap();
        out.stop_utterance();
        assert_eq!(out.active_live_count(), 1);
        assert_eq!(out.next_start_time(), 1.0);
        out.stop_all_live();
        out.dispatch_pending();
        assert_eq!(out.active_live_count(), 0);
    }

    #[test]
    fn invalid_playback_rate_is_rejected() {
        let out = AudioOutputService::headless(1_000);
        assert!(out
            .play_utterance(AudioChunk::new(vec![0.0; 10], 1_000), 0.0, || {})
            .is_err());
    }
}
