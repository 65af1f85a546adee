// src/track.rs

use crate::buffer::AudioBuffer;
use crate::fx::EffectChain;
use crate::fx_components::EffectNode;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

pub const NUM_TRACKS: usize = 4;
pub const PROGRESS_SCALER: f32 = 1_000_000.0;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    Ready,
    Waiting,
    Recording,
    Playing,
    Overdub,
    Stopped,
}

impl From<u8> for TrackState {
    fn from(val: u8) -> Self {
        match val {
            1 => TrackState::Waiting,
            2 => TrackState::Recording,
            3 => TrackState::Playing,
            4 => TrackState::Overdub,
            5 => TrackState::Stopped,
            _ => TrackState::Ready,
        }
    }
}

/// State shared between the engine and observers (UI, shell, tests).
#[derive(Clone)]
pub struct SharedTrackState {
    state: Arc<AtomicU8>,
    progress: Arc<AtomicU32>,
    playhead: Arc<AtomicUsize>,
    ui_disabled: Arc<AtomicBool>,
    peak: Arc<AtomicU32>,
}

impl SharedTrackState {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(TrackState::Ready as u8)),
            progress: Arc::new(AtomicU32::new(0)),
            playhead: Arc::new(AtomicUsize::new(0)),
            ui_disabled: Arc::new(AtomicBool::new(false)),
            peak: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn get(&self) -> TrackState {
        self.state.load(Ordering::Relaxed).into()
    }

    pub fn set(&self, state: TrackState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Recording or pitch progress, 0..1.
    pub fn progress(&self) -> f32 {
        self.progress.load(Ordering::Relaxed) as f32 / PROGRESS_SCALER
    }

    pub fn set_progress(&self, ratio: f32) {
        self.progress
            .store((ratio.clamp(0.0, 1.0) * PROGRESS_SCALER) as u32, Ordering::Relaxed);
    }

    pub fn playhead(&self) -> usize {
        self.playhead.load(Ordering::Relaxed)
    }

    pub fn set_playhead(&self, frame: usize) {
        self.playhead.store(frame, Ordering::Relaxed);
    }

    pub fn ui_disabled(&self) -> bool {
        self.ui_disabled.load(Ordering::Relaxed)
    }

    pub fn set_ui_disabled(&self, disabled: bool) {
        self.ui_disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn peak(&self) -> f32 {
        self.peak.load(Ordering::Relaxed) as f32 / PROGRESS_SCALER
    }

    pub fn set_peak(&self, peak: f32) {
        self.peak
            .store((peak.clamp(0.0, 1.0) * PROGRESS_SCALER) as u32, Ordering::Relaxed);
    }
}

impl Default for SharedTrackState {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a destructive mutation must be able to roll back.
#[derive(Debug, Clone)]
pub struct UndoSnapshot {
    pub buffer: Option<AudioBuffer>,
    pub chain: EffectChain,
    pub pitch_semitones: f32,
}

/// A dependent-track recording scheduled for a bar boundary.
#[derive(Debug, Clone, Copy)]
pub struct PendingRecord {
    pub start_at: f64,
    pub target_frames: usize,
}

pub struct LoopTrack {
    pub index: usize,
    pub shared: SharedTrackState,
    pub buffer: Option<AudioBuffer>,
    /// Audio-clock timestamp of the sample at buffer offset 0 (mod duration).
    pub loop_start_time: f64,
    pub loop_duration: f64,
    pub divider: u32,
    pub chain: EffectChain,
    pub nodes: Vec<Box<dyn EffectNode>>,
    pub undo_stack: Vec<UndoSnapshot>,
    pub pitch_semitones: f32,
    pub pending_record: Option<PendingRecord>,
    /// Overdub capture scheduled for the next loop boundary.
    pub overdub_arm_at: Option<f64>,
}

impl LoopTrack {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            shared: SharedTrackState::new(),
            buffer: None,
            loop_start_time: 0.0,
            loop_duration: 0.0,
            divider: 1,
            chain: EffectChain::default(),
            nodes: Vec::new(),
            undo_stack: Vec::new(),
            pitch_semitones: 0.0,
            pending_record: None,
            overdub_arm_at: None,
        }
    }

    pub fn state(&self) -> TrackState {
        self.shared.get()
    }

    pub fn set_state(&self, state: TrackState) {
        self.shared.set(state);
    }

    pub fn is_master(&self) -> bool {
        self.index == 0
    }

    pub fn has_loop(&self) -> bool {
        self.buffer.is_some()
    }

    /// Snapshot before a destructive mutation; oldest entries fall off past
    /// the limit.
    pub fn push_undo(&mut self, limit: usize) {
        self.undo_stack.push(UndoSnapshot {
            buffer: self.buffer.clone(),
            chain: self.chain.clone(),
            pitch_semitones: self.pitch_semitones,
        });
        while self.undo_stack.len() > limit {
            self.undo_stack.remove(0);
        }
    }

    /// Restore the most recent snapshot. Playback timing keeps the current
    /// start time; the duration follows the restored buffer.
    pub fn undo(&mut self, sample_rate: f32) -> bool {
        let Some(snapshot) = self.undo_stack.pop() else {
            return false;
        };
        self.buffer = snapshot.buffer;
        self.chain = snapshot.chain;
        self.pitch_semitones = snapshot.pitch_semitones;
        self.loop_duration = self.buffer.as_ref().map_or(0.0, |b| b.duration_secs());
        self.rebuild_nodes(sample_rate);
        true
    }

    pub fn install_buffer(&mut self, buffer: AudioBuffer, start_time: f64) {
        self.loop_duration = buffer.duration_secs();
        self.buffer = Some(buffer);
        self.loop_start_time = start_time;
    }

    pub fn rebuild_nodes(&mut self, sample_rate: f32) {
        self.nodes = self.chain.build_nodes(sample_rate);
    }

    /// Frame index the loop plays at time `t`, None when empty.
    pub fn frame_at(&self, t: f64) -> Option<usize> {
        let buffer = self.buffer.as_ref()?;
        if buffer.frames() == 0 || self.loop_duration <= 0.0 {
            return None;
        }
        let offset = (t - self.loop_start_time).rem_euclid(self.loop_duration);
        let frame = (offset * buffer.sample_rate() as f64) as usize;
        Some(frame.min(buffer.frames() - 1))
    }

    /// Full reset back to Ready. The caller is responsible for cascading
    /// (master clear) and lease release.
    pub fn clear(&mut self) {
        self.buffer = None;
        self.loop_start_time = 0.0;
        self.loop_duration = 0.0;
        self.chain.clear();
        self.nodes.clear();
        self.undo_stack.clear();
        self.pitch_semitones = 0.0;
        self.pending_record = None;
        self.overdub_arm_at = None;
        self.shared.set(TrackState::Ready);
        self.shared.set_progress(0.0);
        self.shared.set_playhead(0);
        self.shared.set_peak(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fx::EffectKind;

    fn loop_of(value: f32, frames: usize) -> AudioBuffer {
        AudioBuffer::from_mono(vec![value; frames], 44_100).unwrap()
    }

    #[test]
    fn test_state_round_trips_through_atomic() {
        let shared = SharedTrackState::new();
        for state in [
            TrackState::Ready,
            TrackState::Waiting,
            TrackState::Recording,
            TrackState::Playing,
            TrackState::Overdub,
            TrackState::Stopped,
        ] {
            shared.set(state);
            assert_eq!(shared.get(), state);
        }
    }

    #[test]
    fn test_undo_restores_buffer_exactly() {
        let mut track = LoopTrack::new(1);
        track.install_buffer(loop_of(0.25, 1000), 0.0);
        track.push_undo(6);
        track.install_buffer(loop_of(0.5, 500), 1.0);
        assert!(track.undo(44_100.0));
        let restored = track.buffer.as_ref().unwrap();
        assert_eq!(restored.frames(), 1000);
        assert!(restored.channel(0).iter().all(|&s| s == 0.25));
        assert!((track.loop_duration - 1000.0 / 44_100.0).abs() < 1e-9);
    }

    #[test]
    fn test_undo_stack_is_bounded() {
        let mut track = LoopTrack::new(2);
        for i in 0..10 {
            track.install_buffer(loop_of(i as f32 * 0.1, 100), 0.0);
            track.push_undo(6);
        }
        assert_eq!(track.undo_stack.len(), 6);
    }

    #[test]
    fn test_consecutive_undos_walk_back_in_order() {
        let mut track = LoopTrack::new(0);
        for i in 1..=3 {
            track.push_undo(6);
            track.install_buffer(loop_of(i as f32 * 0.1, 100), 0.0);
        }
        track.undo(44_100.0);
        assert!((track.buffer.as_ref().unwrap().channel(0)[0] - 0.2).abs() < 1e-6);
        track.undo(44_100.0);
        assert!((track.buffer.as_ref().unwrap().channel(0)[0] - 0.1).abs() < 1e-6);
        track.undo(44_100.0);
        assert!(track.buffer.is_none());
        assert!(!track.undo(44_100.0));
    }

    #[test]
    fn test_undo_restores_effect_chain() {
        let mut track = LoopTrack::new(3);
        track.chain.add(EffectKind::Delay);
        track.push_undo(6);
        track.chain.add(EffectKind::Pan);
        assert_eq!(track.chain.effects().len(), 2);
        track.undo(44_100.0);
        assert_eq!(track.chain.effects().len(), 1);
    }

    #[test]
    fn test_frame_at_wraps_with_duration() {
        let mut track = LoopTrack::new(1);
        track.install_buffer(loop_of(0.0, 44_100), 1.0); // 1 s loop starting at t=1
        assert_eq!(track.frame_at(1.0), Some(0));
        assert_eq!(track.frame_at(1.5), Some(22_050));
        assert_eq!(track.frame_at(2.25), Some(11_025));
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut track = LoopTrack::new(1);
        track.install_buffer(loop_of(0.3, 100), 0.0);
        track.chain.add(EffectKind::Delay);
        track.push_undo(6);
        track.shared.set(TrackState::Playing);
        track.clear();
        assert!(track.buffer.is_none());
        assert!(track.chain.is_empty());
        assert!(track.undo_stack.is_empty());
        assert_eq!(track.state(), TrackState::Ready);
    }
}
