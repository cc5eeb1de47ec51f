//! Bookkeeping for the two playback lanes sharing one output device.
//!
//! The lanes never touch the device; they only decide *when* a voice starts
//! and which voices belong to whom. All positions are device frames.

use std::collections::{HashMap, HashSet};

use super::mixer::VoiceId;

pub type OnEnded = Box<dyn FnOnce() + Send + 'static>;

/// Single-utterance lane: at most one current voice.
#[derive(Default)]
pub struct UtteranceLane {
    current: Option<VoiceId>,
    /// Completion callbacks, including those of voices already replaced.
    pending: HashMap<VoiceId, OnEnded>,
}

impl UtteranceLane {
    /// Register `id` as the current voice. A replaced voice keeps its
    /// callback until it finishes.
    pub fn start(&mut self, id: VoiceId, on_ended: OnEnded) {
        self.pending.insert(id, on_ended);
        self.current = Some(id);
    }

    /// Forget the current voice (it has been asked to stop).
    pub fn take_current(&mut self) -> Option<VoiceId> {
        self.current.take()
    }

    /// A voice finished; returns its callback if it was ours.
    pub fn finish(&mut self, id: VoiceId) -> Option<OnEnded> {
        if self.current == Some(id) {
            self.current = None;
        }
        self.pending.remove(&id)
    }

    pub fn current(&self) -> Option<VoiceId> {
        self.current
    }

    /// Take every outstanding callback and forget the current voice. The
    /// caller decides whether to fire them.
    pub fn drain_pending(&mut self) -> Vec<OnEnded> {
        self.current = None;
        self.pending.drain().map(|(_, cb)| cb).collect()
    }
}

/// Continuous live lane with a monotonic start cursor.
#[derive(Debug, Default)]
pub struct LiveLane {
    next_start_frame: u64,
    active: HashSet<VoiceId>,
}

impl LiveLane {
    /// Reserve `frames` of playback: the returned start is
    /// `max(next_start, now)` and the cursor moves to its end.
    pub fn reserve(&mut self, now_frame: u64, frames: u64) -> u64 {
        let start = self.next_start_frame.max(now_frame);
        self.next_start_frame = start + frames;
        start
    }

    pub fn register(&mut self, id: VoiceId) {
        self.active.insert(id);
    }

    pub fn finish(&mut self, id: VoiceId) -> bool {
        self.active.remove(&id)
    }

    /// Clear the lane and reset the cursor; returns the voices to stop.
    pub fn reset(&mut self) -> Vec<VoiceId> {
        self.next_start_frame = 0;
        self.active.drain().collect()
    }

    pub fn next_start_frame(&self) -> u64 {
        self.next_start_frame
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
