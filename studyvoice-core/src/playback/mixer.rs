//! Sample-accurate voice mixer driven by the output callback.
//!
//! The mixer owns the playback clock: it advances by exactly the number of
//! frames rendered. Voices carry an absolute start frame, so scheduling is
//! independent of when the callback happens to run.
//!
//! `render*` runs on the audio thread. It does not allocate once the scratch
//! buffer has grown to the device period size, and completion is reported
//! through a bounded channel with `try_send`.

use crossbeam_channel::Sender;
use tracing::warn;

pub type VoiceId = u64;

/// Emitted when a voice stops producing sound (naturally or by `stop`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEvent {
    Ended(VoiceId),
}

struct Voice {
    id: VoiceId,
    start_frame: u64,
    samples: Vec<f32>,
    /// Source frames advanced per output frame.
    rate: f64,
    position: f64,
    done: bool,
}

pub struct Mixer {
    sample_rate: u32,
    clock: u64,
    voices: Vec<Voice>,
    next_id: VoiceId,
    events: Sender<VoiceEvent>,
    scratch: Vec<f32>,
}

impl Mixer {
    pub fn new(sample_rate: u32, events: Sender<VoiceEvent>) -> Self {
        Self {
            sample_rate,
            clock: 0,
            voices: Vec::with_capacity(64),
            next_id: 1,
            events,
            scratch: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered since the last reset.
    pub fn clock_frames(&self) -> u64 {
        self.clock
    }

    pub fn clock_secs(&self) -> f64 {
        self.clock as f64 / self.sample_rate as f64
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Schedule `samples` (already at the device rate) to begin at `start_frame`.
    pub fn add_voice(&mut self, start_frame: u64, samples: Vec<f32>, rate: f64) -> VoiceId {
        let id = self.next_id;
        self.next_id += 1;
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
            rate: if rate.is_finite() && rate > 0.0 { rate } else { 1.0 },
            position: 0.0,
            done: false,
        });
        id
    }

    /// Stop a voice immediately. Returns `false` if it was not playing.
    pub fn stop(&mut self, id: VoiceId) -> bool {
        let Some(idx) = self.voices.iter().position(|v| v.id == id) else {
            return false;
        };
        self.voices.swap_remove(idx);
        self.emit(id);
        true
    }

    pub fn stop_all(&mut self) {
        for voice in std::mem::take(&mut self.voices) {
            self.emit(voice.id);
        }
    }

    /// Stop everything, switch rate and restart the clock at zero.
    pub fn reset(&mut self, sample_rate: u32) {
        self.stop_all();
        self.sample_rate = sample_rate;
        self.clock = 0;
    }

    /// Mix one mono block and advance the clock by `out.len()` frames.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let block_start = self.clock;
        let block_end = block_start + out.len() as u64;

        for voice in self.voices.iter_mut() {
            if voice.start_frame >= block_end {
                continue;
            }
            let begin = voice.start_frame.saturating_sub(block_start) as usize;
            let len = voice.samples.len();
            for slot in out[begin..].iter_mut() {
                let idx = voice.position as usize;
                if idx >= len {
                    break;
                }
                let frac = (voice.position - idx as f64) as f32;
                let a = voice.samples[idx];
                let b = if idx + 1 < len { voice.samples[idx + 1] } else { a };
                *slot += a + (b - a) * frac;
                voice.position += voice.rate;
            }
            if voice.position as usize >= len {
                voice.done = true;
            }
        }

        self.clock = block_end;

        let mut i = 0;
        while i < self.voices.len() {
            if self.voices[i].done {
                let id = self.voices.swap_remove(i).id;
                self.emit(id);
            } else {
                i += 1;
            }
        }
    }

    /// Mix into an interleaved buffer with `channels` channels.
    pub fn render_interleaved(&mut self, out: &mut [f32], channels: usize) {
        let ch = channels.max(1);
        let frames = out.len() / ch;
        let mut mono = std::mem::take(&mut self.scratch);
        mono.resize(frames, 0.0);
        self.render(&mut mono);
        for (frame, sample) in out.chunks_mut(ch).zip(mono.iter()) {
            frame.fill(*sample);
        }
        self.scratch = mono;
    }

    fn emit(&self, id: VoiceId) {
        if self.events.try_send(VoiceEvent::Ended(id)).is_err() {
            warn!(voice = id, "voice event queue full or closed; completion dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crossbeam_channel::bounded;

    fn mixer(rate: u32) -> (Mixer, crossbeam_channel::Receiver<VoiceEvent>) {
        let (tx, rx) = bounded(64);
        (Mixer::new(rate, tx), rx)
    }

    #[test]
    fn voice_starts_exactly_at_its_start_frame() {
        let (mut m, _rx) = mixer(100);
        m.add_voice(5, vec![1.0; 3], 1.0);
        let mut out = vec![0.0; 10];
        m.render(&mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
        assert_eq!(m.clock_frames(), 10);
    }

    #[test]
    fn contiguous_voices_leave_no_gap_across_blocks() {
        let (mut m, rx) = mixer(100);
        m.add_voice(0, vec![0.5; 7], 1.0);
        m.add_voice(7, vec![0.25; 7], 1.0);
        let mut first = vec![0.0; 4];
        let mut rest = vec![0.0; 12];
        m.render(&mut first);
        m.render(&mut rest);
        let all: Vec<f32> = first.into_iter().chain(rest).collect();
        assert!(all[..7].iter().all(|s| *s == 0.5));
        assert!(all[7..14].iter().all(|s| *s == 0.25));
        assert!(all[14..].iter().all(|s| *s == 0.0));
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn half_rate_playback_takes_twice_as_long() {
        let (mut m, rx) = mixer(100);
        m.add_voice(0, vec![0.0, 1.0], 0.5);
        let mut out = vec![0.0; 4];
        m.render(&mut out);
        assert_abs_diff_eq!(out[0], 0.0);
        assert_abs_diff_eq!(out[1], 0.5);
        assert_abs_diff_eq!(out[2], 1.0);
        assert_eq!(rx.try_recv().ok(), Some(VoiceEvent::Ended(1)));
    }

    #[test]
    fn stop_emits_ended_once() {
        let (mut m, rx) = mixer(100);
        let id = m.add_voice(0, vec![1.0; 1000], 1.0);
        assert!(m.stop(id));
        assert!(!m.stop(id));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![VoiceEvent::Ended(id)]);
        assert_eq!(m.active_voices(), 0);
    }

    #[test]
    fn interleaved_render_duplicates_mono_into_channels() {
        let (mut m, _rx) = mixer(100);
        m.add_voice(0, vec![0.3, 0.6], 1.0);
        let mut out = vec![0.0; 6];
        m.render_interleaved(&mut out, 2);
        assert_eq!(out, vec![0.3, 0.3, 0.6, 0.6, 0.0, 0.0]);
        assert_eq!(m.clock_frames(), 3);
    }

    #[test]
    fn reset_restarts_clock_and_stops_voices() {
        let (mut m, rx) = mixer(100);
        m.add_voice(50, vec![1.0; 10], 1.0);
        m.render(&mut vec![0.0; 20]);
        m.reset(200);
        assert_eq!(m.clock_frames(), 0);
        assert_eq!(m.sample_rate(), 200);
        assert_eq!(rx.try_iter().count(), 1);
    }
}
