// src/session.rs

//! The session coordinator. Owns the four loop tracks, the transport timing,
//! the recorder and the pitch pool, and runs the whole state machine behind
//! a command queue: the shell pushes `Command`s, the audio callback (or a
//! test harness) calls `process`, and discrete notifications come back on
//! the event channel.

use crate::buffer::AudioBuffer;
use crate::clock::{MasterTiming, TransportClock};
use crate::command::Command;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::export;
use crate::fx::EffectParams;
use crate::overdub::mix_overdub;
use crate::pitch;
use crate::pitch_pool::{PitchJob, PitchPool, PoolMessage};
use crate::recorder::{CaptureKind, Recorder};
use crate::resample::resample_buffer;
use crate::track::{LoopTrack, PendingRecord, SharedTrackState, TrackState, NUM_TRACKS};
use crossbeam_channel::{unbounded, Receiver, Sender};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PARAM_SCALER: f32 = 1_000_000.0;
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

const LOOPBACK_PROBE_SECS: f64 = 0.12;
const LOOPBACK_PROBE_HZ: f32 = 1_000.0;
const LOOPBACK_PROBE_LEVEL: f32 = 0.5;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    TrackStateChanged { track: usize, state: TrackState },
    TrackProgress { track: usize, ratio: f32 },
    TransportChanged { duration: f64, bpm: u32 },
    PitchProgress { track: usize, pct: f32 },
    MixCaptured(AudioBuffer),
    Error { kind: &'static str, message: String },
}

/// The shell-side half of an engine: command producer, event receiver and
/// the lock-free observables.
pub struct EngineController {
    command_tx: HeapProducer<Command>,
    pub events: Receiver<EngineEvent>,
    pub tracks: [SharedTrackState; NUM_TRACKS],
    pub master_gain: Arc<AtomicU32>,
    pub monitor_enabled: Arc<AtomicBool>,
    pub mic_connected: Arc<AtomicBool>,
}

impl EngineController {
    /// Push a command; false when the queue is full.
    pub fn send(&mut self, command: Command) -> bool {
        self.command_tx.push(command).is_ok()
    }
}

/// Bus settings stashed while an overdub capture mutes the outputs.
struct BusSnapshot {
    master_gain: u32,
    monitor: bool,
}

struct LoopbackProbe {
    remaining_frames: usize,
    phase: f32,
    mic_sum_sq: f64,
    mic_frames: usize,
}

struct PendingPitch {
    job: PitchJob,
    target_semitones: f32,
}

pub struct LoopEngine {
    cfg: EngineConfig,
    sample_rate: f32,
    clock: TransportClock,
    tracks: Vec<LoopTrack>,
    master: Option<MasterTiming>,
    recorder: Recorder,
    pool: PitchPool,
    jobs: Vec<Option<PendingPitch>>,
    command_rx: HeapConsumer<Command>,
    event_tx: Sender<EngineEvent>,
    master_gain: Arc<AtomicU32>,
    monitor_enabled: Arc<AtomicBool>,
    mic_connected: Arc<AtomicBool>,
    saved_bus: Option<BusSnapshot>,
    mix_capture: Option<Vec<f32>>,
    probe: Option<LoopbackProbe>,
    loopback_detected: bool,
    loopback_confirmed: bool,
}

impl LoopEngine {
    pub fn new(cfg: EngineConfig, sample_rate: f32) -> (Self, EngineController) {
        let (command_tx, command_rx) = HeapRb::<Command>::new(COMMAND_QUEUE_CAPACITY).split();
        let (event_tx, events) = unbounded();

        let tracks: Vec<LoopTrack> = (0..NUM_TRACKS).map(LoopTrack::new).collect();
        // Dependents stay gated until a master exists.
        for track in tracks.iter().skip(1) {
            track.shared.set_ui_disabled(true);
        }
        let shared: Vec<SharedTrackState> = tracks.iter().map(|t| t.shared.clone()).collect();
        let shared: [SharedTrackState; NUM_TRACKS] =
            shared.try_into().unwrap_or_else(|_| unreachable!());

        let master_gain = Arc::new(AtomicU32::new(PARAM_SCALER as u32));
        let monitor_enabled = Arc::new(AtomicBool::new(false));
        let mic_connected = Arc::new(AtomicBool::new(true));

        let recorder = Recorder::new(sample_rate, cfg.recorder_global_timeout_ms);

        let engine = Self {
            cfg,
            sample_rate,
            clock: TransportClock::new(sample_rate),
            tracks,
            master: None,
            recorder,
            pool: PitchPool::new(),
            jobs: (0..NUM_TRACKS).map(|_| None).collect(),
            command_rx,
            event_tx,
            master_gain: master_gain.clone(),
            monitor_enabled: monitor_enabled.clone(),
            mic_connected: mic_connected.clone(),
            saved_bus: None,
            mix_capture: None,
            probe: None,
            loopback_detected: false,
            loopback_confirmed: false,
        };
        let controller = EngineController {
            command_tx,
            events,
            tracks: shared,
            master_gain,
            monitor_enabled,
            mic_connected,
        };
        (engine, controller)
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn master_timing(&self) -> Option<&MasterTiming> {
        self.master.as_ref()
    }

    pub fn track(&self, index: usize) -> &LoopTrack {
        &self.tracks[index]
    }

    pub fn loopback_detected(&self) -> bool {
        self.loopback_detected
    }

    /// Play a short sine burst through the master bus while measuring mic
    /// RMS; run once at session start.
    pub fn begin_loopback_probe(&mut self) {
        self.probe = Some(LoopbackProbe {
            remaining_frames: (LOOPBACK_PROBE_SECS * self.sample_rate as f64) as usize,
            phase: 0.0,
            mic_sum_sq: 0.0,
            mic_frames: 0,
        });
    }

    /// One block of engine work: drain commands and pool messages, advance
    /// captures and scheduled starts sample-accurately, and render the mix.
    /// `out` is interleaved stereo, two samples per mic frame.
    pub fn process(&mut self, mic: &[f32], out: &mut [f32]) {
        out.fill(0.0);
        let frames = mic.len().min(out.len() / 2);

        self.handle_commands();
        self.drain_pool_messages();
        self.check_pitch_timeouts();

        let monitor = self.monitor_enabled.load(Ordering::Relaxed);
        let mut track_peaks = [0.0f32; NUM_TRACKS];

        for i in 0..frames {
            let t = self.clock.at_offset(i);
            self.fire_scheduled_records(t);
            self.fire_overdub_arms(t);

            if self.recorder.is_active() {
                self.recorder.push(mic[i]);
                if self.recorder.target_reached() || self.recorder.watchdog_expired(t) {
                    // The capture "now" is one frame past the pushed sample.
                    self.finish_capture(self.clock.at_offset(i + 1));
                }
            }

            let mut left = 0.0f32;
            let mut right = 0.0f32;
            for index in 0..NUM_TRACKS {
                let track = &mut self.tracks[index];
                let state = track.state();
                if state != TrackState::Playing && state != TrackState::Overdub {
                    continue;
                }
                let Some(buffer) = track.buffer.as_ref() else {
                    continue;
                };
                if buffer.frames() == 0 || track.loop_duration <= 0.0 {
                    continue;
                }
                let offset = (t - track.loop_start_time).rem_euclid(track.loop_duration);
                let frame =
                    ((offset * buffer.sample_rate() as f64) as usize).min(buffer.frames() - 1);
                let (mut l, mut r) = if buffer.channel_count() >= 2 {
                    (buffer.channel(0)[frame], buffer.channel(1)[frame])
                } else {
                    let s = buffer.channel(0)[frame];
                    (s, s)
                };
                for node in &mut track.nodes {
                    (l, r) = node.process(l, r);
                }
                track_peaks[index] = track_peaks[index].max(l.abs().max(r.abs()));
                left += l;
                right += r;
            }

            if let Some(probe) = &mut self.probe {
                let burst = (2.0 * std::f32::consts::PI * LOOPBACK_PROBE_HZ * probe.phase
                    / self.sample_rate)
                    .sin()
                    * LOOPBACK_PROBE_LEVEL;
                probe.phase += 1.0;
                left += burst;
                right += burst;
                probe.mic_sum_sq += (mic[i] as f64) * (mic[i] as f64);
                probe.mic_frames += 1;
                probe.remaining_frames -= 1;
                if probe.remaining_frames == 0 {
                    let rms = (probe.mic_sum_sq / probe.mic_frames as f64).sqrt() as f32;
                    self.probe = None;
                    if rms > self.cfg.loopback_rms_threshold {
                        self.loopback_detected = true;
                        self.emit_error(EngineError::LoopbackDetected {
                            rms,
                            threshold: self.cfg.loopback_rms_threshold,
                        });
                    }
                }
            }

            if monitor {
                left += mic[i];
                right += mic[i];
            }

            let gain = self.master_gain.load(Ordering::Relaxed) as f32 / PARAM_SCALER;
            left = (left * gain).clamp(-1.0, 1.0);
            right = (right * gain).clamp(-1.0, 1.0);
            out[2 * i] = left;
            out[2 * i + 1] = right;
            if let Some(capture) = &mut self.mix_capture {
                capture.push(left);
                capture.push(right);
            }
        }

        self.clock.advance(frames);
        self.publish_shared_state(&track_peaks);
    }

    // --- Command handling ---

    fn handle_commands(&mut self) {
        while let Some(command) = self.command_rx.pop() {
            match command {
                Command::Press(track) if track < NUM_TRACKS => self.handle_press(track),
                Command::Stop(track) if track < NUM_TRACKS => self.handle_stop(track),
                Command::Clear(track) if track < NUM_TRACKS => self.handle_clear(track),
                Command::SetDivider { track, divider } if track < NUM_TRACKS => {
                    self.tracks[track].divider = divider.max(1);
                }
                Command::AddEffect { track, kind } if track < NUM_TRACKS => {
                    if self.reject_while_processing(track) {
                        continue;
                    }
                    self.tracks[track].chain.add(kind);
                    let rate = self.sample_rate;
                    self.tracks[track].rebuild_nodes(rate);
                }
                Command::MoveEffect {
                    track,
                    id,
                    direction,
                } if track < NUM_TRACKS => {
                    if self.reject_while_processing(track) {
                        continue;
                    }
                    if self.tracks[track].chain.move_effect(id, direction) {
                        let rate = self.sample_rate;
                        self.tracks[track].rebuild_nodes(rate);
                    }
                }
                Command::RemoveEffect { track, id } if track < NUM_TRACKS => {
                    if self.reject_while_processing(track) {
                        continue;
                    }
                    if self.tracks[track].chain.remove(id) {
                        let rate = self.sample_rate;
                        self.tracks[track].rebuild_nodes(rate);
                    } else {
                        self.emit_error(EngineError::InvalidState(format!(
                            "no effect {} on track {}",
                            id, track
                        )));
                    }
                }
                Command::ToggleBypass { track, id } if track < NUM_TRACKS => {
                    if self.reject_while_processing(track) {
                        continue;
                    }
                    if self.tracks[track].chain.toggle_bypass(id) {
                        let rate = self.sample_rate;
                        self.tracks[track].rebuild_nodes(rate);
                    }
                }
                Command::SetParam {
                    track,
                    id,
                    key,
                    value,
                } if track < NUM_TRACKS => self.handle_set_param(track, id, &key, value),
                Command::Undo(track) if track < NUM_TRACKS => self.handle_undo(track),
                Command::LoadLoop { track, path } if track < NUM_TRACKS => {
                    self.handle_load_loop(track, &path)
                }
                Command::ToggleMonitor => {
                    let on = self.monitor_enabled.load(Ordering::Relaxed);
                    self.monitor_enabled.store(!on, Ordering::Relaxed);
                }
                Command::StartMixRecord => {
                    if self.mix_capture.is_none() {
                        self.mix_capture = Some(Vec::new());
                    }
                }
                Command::StopMixRecord => {
                    if let Some(raw) = self.mix_capture.take() {
                        match AudioBuffer::from_interleaved(&raw, 2, self.sample_rate as u32) {
                            Ok(buffer) => {
                                let trimmed = export::trim_silence(&buffer);
                                let _ = self.event_tx.send(EngineEvent::MixCaptured(trimmed));
                            }
                            Err(e) => self.emit_error(e),
                        }
                    }
                }
                Command::ConfirmLoopback => self.loopback_confirmed = true,
                Command::SetMasterVolume(vol) => {
                    self.master_gain
                        .store((vol.clamp(0.0, 2.0) * PARAM_SCALER) as u32, Ordering::Relaxed);
                }
                other => {
                    log::warn!("command for out-of-range track dropped: {:?}", other);
                }
            }
        }
    }

    fn handle_press(&mut self, index: usize) {
        if self.reject_while_processing(index) {
            return;
        }
        let now = self.clock.now();
        match self.tracks[index].state() {
            TrackState::Ready => {
                if index == 0 {
                    self.start_master_record(now);
                } else {
                    self.schedule_dependent_record(index, now);
                }
            }
            TrackState::Waiting => {
                // Second press cancels the pending bar-aligned start.
                self.tracks[index].pending_record = None;
                self.set_track_state(index, TrackState::Ready);
            }
            TrackState::Recording => {
                if self.recorder.active_track() == Some(index) {
                    self.finish_capture(now);
                }
            }
            TrackState::Playing => self.arm_overdub(index, now),
            TrackState::Overdub => {
                if self.recorder.active_track() == Some(index)
                    && self.recorder.active_kind() == Some(CaptureKind::OverdubLayer)
                {
                    // Finish early; the mixer reconciles the short capture.
                    self.finish_capture(now);
                } else {
                    // Armed but not yet capturing.
                    self.tracks[index].overdub_arm_at = None;
                    self.set_track_state(index, TrackState::Playing);
                }
            }
            TrackState::Stopped => self.resume_track(index, now),
        }
    }

    fn handle_stop(&mut self, index: usize) {
        if self.reject_while_processing(index) {
            return;
        }
        let now = self.clock.now();
        match self.tracks[index].state() {
            TrackState::Recording => {
                if self.recorder.active_track() == Some(index) {
                    self.recorder.abort();
                }
                self.set_track_state(index, TrackState::Ready);
            }
            TrackState::Waiting => {
                self.tracks[index].pending_record = None;
                self.set_track_state(index, TrackState::Ready);
            }
            TrackState::Playing => self.set_track_state(index, TrackState::Stopped),
            TrackState::Overdub => {
                if self.recorder.active_track() == Some(index) {
                    self.recorder.abort();
                    self.restore_bus();
                }
                self.tracks[index].overdub_arm_at = None;
                self.set_track_state(index, TrackState::Stopped);
            }
            TrackState::Stopped => self.resume_track(index, now),
            TrackState::Ready => {}
        }
    }

    fn handle_clear(&mut self, index: usize) {
        // Clear always applies; it is the escape hatch out of a stuck pitch
        // job (the job is cancelled and its result discarded).
        self.cancel_pitch_job(index);
        if self.recorder.active_track() == Some(index) {
            if self.recorder.active_kind() == Some(CaptureKind::OverdubLayer) {
                self.restore_bus();
            }
            self.recorder.abort();
        }
        self.tracks[index].clear();
        self.emit_state(index);

        if index == 0 {
            // Master clear resets the transport and cascades to dependents.
            self.master = None;
            for dep in 1..NUM_TRACKS {
                self.cancel_pitch_job(dep);
                if self.recorder.active_track() == Some(dep) {
                    if self.recorder.active_kind() == Some(CaptureKind::OverdubLayer) {
                        self.restore_bus();
                    }
                    self.recorder.abort();
                }
                self.tracks[dep].clear();
                self.tracks[dep].shared.set_ui_disabled(true);
                self.emit_state(dep);
            }
            let _ = self.event_tx.send(EngineEvent::TransportChanged {
                duration: 0.0,
                bpm: 0,
            });
        }
    }

    fn handle_set_param(&mut self, track: usize, id: u64, key: &str, value: f32) {
        let is_pitch = matches!(
            self.tracks[track].chain.get(id).map(|e| &e.params),
            Some(EffectParams::Pitch { .. })
        );
        if is_pitch && key == "semitones" {
            self.tracks[track].chain.set_param(id, key, value);
            self.submit_pitch_job(track, value.clamp(-12.0, 12.0));
            return;
        }
        if self.reject_while_processing(track) {
            return;
        }
        if self.tracks[track].chain.set_param(id, key, value) {
            let rate = self.sample_rate;
            self.tracks[track].rebuild_nodes(rate);
        } else {
            self.emit_error(EngineError::InvalidState(format!(
                "no parameter {} on effect {} of track {}",
                key, id, track
            )));
        }
    }

    fn handle_undo(&mut self, index: usize) {
        // Undo during offline processing abandons the job; the subsequent
        // stack pop then restores the pre-submission snapshot, so one undo
        // covers the whole aborted operation.
        self.cancel_pitch_job(index);
        let rate = self.sample_rate;
        if !self.tracks[index].undo(rate) {
            log::debug!("undo on track {} with empty stack", index);
        }
    }

    fn handle_load_loop(&mut self, index: usize, path: &std::path::Path) {
        if self.reject_while_processing(index) {
            return;
        }
        let loaded = export::load_wav(path)
            .and_then(|b| resample_buffer(&b, self.sample_rate as u32));
        let buffer = match loaded {
            Ok(b) if b.frames() > 0 => b,
            Ok(_) => {
                self.emit_error(EngineError::DecodeError(format!(
                    "{} contains no audio",
                    path.display()
                )));
                return;
            }
            Err(e) => {
                self.emit_error(EngineError::DecodeError(e.to_string()));
                return;
            }
        };
        let now = self.clock.now();
        self.tracks[index].push_undo(self.cfg.undo_stack_limit);
        self.tracks[index].install_buffer(buffer, now);
        let rate = self.sample_rate;
        self.tracks[index].rebuild_nodes(rate);
        self.set_track_state(index, TrackState::Playing);
        if index == 0 {
            self.establish_master(now);
        }
    }

    // --- Recording paths ---

    fn start_master_record(&mut self, now: f64) {
        if !self.mic_connected.load(Ordering::Relaxed) {
            self.emit_error(EngineError::MicUnavailable("no capture source".into()));
            return;
        }
        let cap_secs = self.cfg.max_master_record_secs;
        let cap_frames = (cap_secs * self.sample_rate) as usize;
        match self.recorder.start(
            now,
            0,
            CaptureKind::MasterLoop,
            (cap_secs * 1000.0) as u64,
            Some(cap_frames),
        ) {
            Ok(_) => self.set_track_state(0, TrackState::Recording),
            Err(e) => self.emit_error(e),
        }
    }

    fn schedule_dependent_record(&mut self, index: usize, now: f64) {
        let Some(master) = self.master.as_ref() else {
            self.emit_error(EngineError::InvalidState(format!(
                "track {} cannot record before the master loop exists",
                index + 1
            )));
            return;
        };
        if !self.mic_connected.load(Ordering::Relaxed) {
            self.emit_error(EngineError::MicUnavailable("no capture source".into()));
            return;
        }
        let schedule = TransportClock::schedule_next_bar(now, Some(master));
        let length_secs = master.duration * self.tracks[index].divider as f64;
        let target_frames = (length_secs * self.sample_rate as f64).round() as usize;
        self.tracks[index].pending_record = Some(PendingRecord {
            start_at: schedule.start_at,
            target_frames,
        });
        self.set_track_state(index, TrackState::Waiting);
    }

    fn fire_scheduled_records(&mut self, t: f64) {
        let half_frame = 0.5 / self.sample_rate as f64;
        for index in 1..NUM_TRACKS {
            let Some(pending) = self.tracks[index].pending_record else {
                continue;
            };
            if t + half_frame < pending.start_at {
                continue;
            }
            self.tracks[index].pending_record = None;
            if !self.mic_connected.load(Ordering::Relaxed) {
                self.emit_error(EngineError::MicUnavailable("no capture source".into()));
                self.set_track_state(index, TrackState::Ready);
                continue;
            }
            let expected_ms =
                (pending.target_frames as f64 / self.sample_rate as f64 * 1000.0) as u64;
            match self.recorder.start(
                t,
                index,
                CaptureKind::DependentLoop,
                expected_ms,
                Some(pending.target_frames),
            ) {
                Ok(_) => self.set_track_state(index, TrackState::Recording),
                Err(e) => {
                    self.emit_error(e);
                    self.set_track_state(index, TrackState::Ready);
                }
            }
        }
    }

    fn arm_overdub(&mut self, index: usize, now: f64) {
        if self.loopback_detected && !self.loopback_confirmed {
            self.emit_error(EngineError::LoopbackDetected {
                rms: 0.0,
                threshold: self.cfg.loopback_rms_threshold,
            });
            return;
        }
        if !self.mic_connected.load(Ordering::Relaxed) {
            self.emit_error(EngineError::MicUnavailable("no capture source".into()));
            return;
        }
        let track = &mut self.tracks[index];
        if track.buffer.is_none() || track.loop_duration <= 0.0 {
            self.emit_error(EngineError::InvalidState(format!(
                "track {} has no loop to overdub",
                index + 1
            )));
            return;
        }
        let delay =
            track.loop_duration - (now - track.loop_start_time).rem_euclid(track.loop_duration);
        track.overdub_arm_at = Some(now + delay);
        self.set_track_state(index, TrackState::Overdub);
    }

    fn fire_overdub_arms(&mut self, t: f64) {
        let half_frame = 0.5 / self.sample_rate as f64;
        for index in 0..NUM_TRACKS {
            let Some(arm_at) = self.tracks[index].overdub_arm_at else {
                continue;
            };
            if t + half_frame < arm_at {
                continue;
            }
            self.tracks[index].overdub_arm_at = None;
            let target_frames = self.tracks[index]
                .buffer
                .as_ref()
                .map_or(0, |b| b.frames());
            if target_frames == 0 {
                self.set_track_state(index, TrackState::Playing);
                continue;
            }
            let expected_ms = (self.tracks[index].loop_duration * 1000.0) as u64;
            match self.recorder.start(
                t,
                index,
                CaptureKind::OverdubLayer,
                expected_ms,
                Some(target_frames),
            ) {
                Ok(_) => self.mute_bus_for_overdub(),
                Err(e) => {
                    self.emit_error(e);
                    self.set_track_state(index, TrackState::Playing);
                }
            }
        }
    }

    fn finish_capture(&mut self, t: f64) {
        let Some(kind) = self.recorder.active_kind() else {
            return;
        };
        let capture_track = self.recorder.active_track();
        let completed = match self.recorder.stop(t) {
            Ok(c) => c,
            Err(e) => {
                // Decode failed; the capturing track falls back to its prior
                // state and the bus mute (if any) is lifted.
                if kind == CaptureKind::OverdubLayer {
                    self.restore_bus();
                }
                if let Some(index) = capture_track {
                    let fallback = if kind == CaptureKind::OverdubLayer {
                        TrackState::Playing
                    } else {
                        TrackState::Ready
                    };
                    self.set_track_state(index, fallback);
                }
                self.emit_error(e);
                return;
            }
        };

        let index = completed.track;
        match completed.kind {
            CaptureKind::MasterLoop | CaptureKind::DependentLoop => {
                self.tracks[index].push_undo(self.cfg.undo_stack_limit);
                self.tracks[index].install_buffer(completed.buffer, completed.started_at);
                let rate = self.sample_rate;
                self.tracks[index].rebuild_nodes(rate);
                self.set_track_state(index, TrackState::Playing);
                if index == 0 {
                    self.establish_master(t);
                }
            }
            CaptureKind::OverdubLayer => {
                self.restore_bus();
                let existing = self.tracks[index]
                    .buffer
                    .as_ref()
                    .cloned();
                let Some(existing) = existing else {
                    self.set_track_state(index, TrackState::Playing);
                    return;
                };
                self.tracks[index].push_undo(self.cfg.undo_stack_limit);
                match mix_overdub(&existing, &completed.buffer, self.cfg.allow_wrap_overdub) {
                    Ok(mixed) => {
                        // Length is invariant, so timing fields stay as-is.
                        self.tracks[index].buffer = Some(mixed);
                    }
                    Err(e) => {
                        self.tracks[index].undo_stack.pop();
                        self.emit_error(e);
                    }
                }
                self.set_track_state(index, TrackState::Playing);
            }
        }
    }

    /// Master timing from track 0's freshly installed loop: derive the bar
    /// period and tempo, un-gate the dependents, and phase-re-align any that
    /// are already sounding.
    fn establish_master(&mut self, now: f64) {
        let duration = self.tracks[0].loop_duration;
        if duration <= 0.0 {
            return;
        }
        let start_time = self.tracks[0].loop_start_time;
        let master = MasterTiming::from_duration(duration, start_time);
        let _ = self.event_tx.send(EngineEvent::TransportChanged {
            duration: master.duration,
            bpm: master.bpm,
        });
        self.master = Some(master);

        for dep in 1..NUM_TRACKS {
            self.tracks[dep].shared.set_ui_disabled(self.jobs[dep].is_some());
            let state = self.tracks[dep].state();
            if (state == TrackState::Playing || state == TrackState::Overdub)
                && self.tracks[dep].loop_duration > 0.0
            {
                self.tracks[dep].loop_start_time = TransportClock::realigned_start(
                    now,
                    self.tracks[dep].loop_start_time,
                    self.tracks[dep].loop_duration,
                );
            }
        }
    }

    fn resume_track(&mut self, index: usize, now: f64) {
        if self.tracks[index].buffer.is_none() {
            self.set_track_state(index, TrackState::Ready);
            return;
        }
        // Resume locked to the master grid when one exists; from the top
        // otherwise.
        self.tracks[index].loop_start_time = match &self.master {
            Some(m) => m.start_time,
            None => now,
        };
        self.set_track_state(index, TrackState::Playing);
    }

    // --- Pitch jobs ---

    fn submit_pitch_job(&mut self, index: usize, target_semitones: f32) {
        // Resubmission supersedes the old job and its snapshot; exactly one
        // snapshot guards the in-flight operation.
        if self.cancel_pitch_job(index) {
            self.tracks[index].undo_stack.pop();
        }
        let Some(buffer) = self.tracks[index].buffer.as_ref().cloned() else {
            self.emit_error(EngineError::InvalidState(format!(
                "track {} has no loop to pitch-shift",
                index + 1
            )));
            return;
        };
        let delta = target_semitones - self.tracks[index].pitch_semitones;
        if delta.abs() < 1e-6 {
            return;
        }
        self.tracks[index].push_undo(self.cfg.undo_stack_limit);
        self.tracks[index].shared.set_ui_disabled(true);
        let job = self.pool.submit(
            index,
            buffer,
            delta,
            self.cfg.pitch_grain_size,
            self.cfg.pitch_hop_ratio,
        );
        self.jobs[index] = Some(PendingPitch {
            job,
            target_semitones,
        });
    }

    /// Cancel the in-flight job and re-enable the track. The submission
    /// snapshot stays on the undo stack; callers decide its fate. The stale
    /// worker result is ignored by id when it arrives.
    fn cancel_pitch_job(&mut self, index: usize) -> bool {
        if let Some(pending) = self.jobs[index].take() {
            pending.job.cancel();
            self.refresh_ui_gate(index);
            true
        } else {
            false
        }
    }

    fn drain_pool_messages(&mut self) {
        let messages = self.pool.messages().clone();
        while let Ok(message) = messages.try_recv() {
            match message {
                PoolMessage::Progress { job, track, pct } => {
                    if self.job_id(track) == Some(job) {
                        self.tracks[track].shared.set_progress(pct);
                        let _ = self
                            .event_tx
                            .send(EngineEvent::PitchProgress { track, pct });
                    }
                }
                PoolMessage::Done { job, track, buffer } => {
                    if self.job_id(track) == Some(job) {
                        let pending = self.jobs[track].take().expect("job id matched");
                        self.apply_pitch_result(track, buffer, pending.target_semitones);
                    }
                }
                PoolMessage::Cancelled { job, track } => {
                    if self.job_id(track) == Some(job) {
                        self.jobs[track] = None;
                        self.tracks[track].undo_stack.pop();
                        self.refresh_ui_gate(track);
                        self.emit_error(EngineError::PitchCancelled(track));
                    }
                }
                PoolMessage::Failed {
                    job,
                    track,
                    message,
                } => {
                    if self.job_id(track) == Some(job) {
                        self.jobs[track] = None;
                        self.tracks[track].undo_stack.pop();
                        self.refresh_ui_gate(track);
                        self.emit_error(EngineError::PitchFailed { track, message });
                    }
                }
            }
        }
    }

    fn job_id(&self, track: usize) -> Option<u64> {
        self.jobs[track].as_ref().map(|p| p.job.id)
    }

    /// Pool stuck past the deadline: cancel the worker and run the same pass
    /// inline so the operation still completes.
    fn check_pitch_timeouts(&mut self) {
        let timeout = Duration::from_millis(self.cfg.pitch_job_timeout_ms);
        for index in 0..NUM_TRACKS {
            let timed_out = self.jobs[index]
                .as_ref()
                .map_or(false, |p| p.job.submitted_at.elapsed() >= timeout);
            if !timed_out {
                continue;
            }
            let pending = self.jobs[index].take().expect("checked above");
            pending.job.cancel();
            log::warn!(
                "pitch job {} on track {} timed out; running inline",
                pending.job.id,
                index
            );
            let shifted = pitch::shift_pitch_blocking(
                &pending.job.input,
                pending.job.semitones,
                self.cfg.pitch_grain_size,
                self.cfg.pitch_hop_ratio,
            );
            self.apply_pitch_result(index, shifted, pending.target_semitones);
        }
    }

    fn apply_pitch_result(&mut self, index: usize, buffer: AudioBuffer, target: f32) {
        // Atomic swap of the loop content; duration follows the new buffer
        // (identical by the duration-invariance of the shifter).
        self.tracks[index].loop_duration = buffer.duration_secs();
        self.tracks[index].buffer = Some(buffer);
        self.tracks[index].pitch_semitones = target;
        self.tracks[index].shared.set_progress(1.0);
        self.refresh_ui_gate(index);
        let _ = self.event_tx.send(EngineEvent::PitchProgress {
            track: index,
            pct: 1.0,
        });
    }

    // --- Bus and bookkeeping ---

    fn mute_bus_for_overdub(&mut self) {
        if !self.cfg.auto_mute_monitor_on_overdub || self.saved_bus.is_some() {
            return;
        }
        self.saved_bus = Some(BusSnapshot {
            master_gain: self.master_gain.load(Ordering::Relaxed),
            monitor: self.monitor_enabled.load(Ordering::Relaxed),
        });
        self.master_gain.store(0, Ordering::Relaxed);
        self.monitor_enabled.store(false, Ordering::Relaxed);
    }

    fn restore_bus(&mut self) {
        if let Some(saved) = self.saved_bus.take() {
            self.master_gain.store(saved.master_gain, Ordering::Relaxed);
            self.monitor_enabled.store(saved.monitor, Ordering::Relaxed);
        }
    }

    /// A track is gated while a pitch job runs, and dependents are gated
    /// while no master exists.
    fn refresh_ui_gate(&mut self, index: usize) {
        let gated =
            self.jobs[index].is_some() || (index > 0 && self.master.is_none());
        self.tracks[index].shared.set_ui_disabled(gated);
    }

    fn reject_while_processing(&mut self, index: usize) -> bool {
        if self.jobs[index].is_some() {
            self.emit_error(EngineError::InvalidState(format!(
                "track {} is busy with offline processing",
                index + 1
            )));
            return true;
        }
        false
    }

    fn set_track_state(&mut self, index: usize, state: TrackState) {
        if self.tracks[index].state() != state {
            self.tracks[index].set_state(state);
            let _ = self
                .event_tx
                .send(EngineEvent::TrackStateChanged { track: index, state });
        }
    }

    fn emit_state(&mut self, index: usize) {
        let state = self.tracks[index].state();
        let _ = self
            .event_tx
            .send(EngineEvent::TrackStateChanged { track: index, state });
    }

    fn emit_error(&mut self, error: EngineError) {
        log::warn!("{}", error);
        let _ = self.event_tx.send(EngineEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn publish_shared_state(&mut self, peaks: &[f32; NUM_TRACKS]) {
        let now = self.clock.now();
        for index in 0..NUM_TRACKS {
            let track = &self.tracks[index];
            track.shared.set_peak(peaks[index]);
            match track.state() {
                TrackState::Playing | TrackState::Overdub => {
                    if let Some(frame) = track.frame_at(now) {
                        track.shared.set_playhead(frame);
                    }
                }
                TrackState::Recording => {
                    let ratio = self.recorder.progress();
                    track.shared.set_progress(ratio);
                    let _ = self
                        .event_tx
                        .send(EngineEvent::TrackProgress { track: index, ratio });
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f32 = 44_100.0;

    fn engine() -> (LoopEngine, EngineController) {
        LoopEngine::new(EngineConfig::default(), RATE)
    }

    fn run_silence(engine: &mut LoopEngine, frames: usize) {
        let mic = vec![0.0f32; frames];
        let mut out = vec![0.0f32; frames * 2];
        engine.process(&mic, &mut out);
    }

    fn run_signal(engine: &mut LoopEngine, frames: usize, value: f32) {
        let mic = vec![value; frames];
        let mut out = vec![0.0f32; frames * 2];
        engine.process(&mic, &mut out);
    }

    #[test]
    fn test_master_record_establishes_transport() {
        let (mut engine, mut controller) = engine();
        controller.send(Command::Press(0));
        run_signal(&mut engine, 512, 0.2);
        assert_eq!(engine.track(0).state(), TrackState::Recording);

        // 2.0 s of material, then stop.
        run_signal(&mut engine, (2.0 * RATE) as usize - 512, 0.2);
        controller.send(Command::Press(0));
        run_silence(&mut engine, 64);

        assert_eq!(engine.track(0).state(), TrackState::Playing);
        let master = engine.master_timing().expect("master set");
        assert!((master.duration - 2.0).abs() < 0.01, "{}", master.duration);
        assert_eq!(master.bpm, 120);
        // Dependents are un-gated.
        assert!(!controller.tracks[1].ui_disabled());
    }

    #[test]
    fn test_dependent_press_without_master_is_rejected() {
        let (mut engine, mut controller) = engine();
        controller.send(Command::Press(2));
        run_silence(&mut engine, 64);
        assert_eq!(engine.track(2).state(), TrackState::Ready);
        let mut saw_invalid = false;
        while let Ok(event) = controller.events.try_recv() {
            if let EngineEvent::Error { kind, .. } = event {
                if kind == "InvalidState" {
                    saw_invalid = true;
                }
            }
        }
        assert!(saw_invalid);
    }

    #[test]
    fn test_mic_unavailable_leaves_ready() {
        let (mut engine, mut controller) = engine();
        controller.mic_connected.store(false, Ordering::Relaxed);
        controller.send(Command::Press(0));
        run_silence(&mut engine, 64);
        assert_eq!(engine.track(0).state(), TrackState::Ready);
        let mut saw = false;
        while let Ok(event) = controller.events.try_recv() {
            if let EngineEvent::Error { kind, .. } = event {
                if kind == "MicUnavailable" {
                    saw = true;
                }
            }
        }
        assert!(saw);
    }

    #[test]
    fn test_stop_during_recording_aborts() {
        let (mut engine, mut controller) = engine();
        controller.send(Command::Press(0));
        run_signal(&mut engine, 1024, 0.3);
        assert_eq!(engine.track(0).state(), TrackState::Recording);
        controller.send(Command::Stop(0));
        run_silence(&mut engine, 64);
        assert_eq!(engine.track(0).state(), TrackState::Ready);
        assert!(engine.track(0).buffer.is_none());
        assert!(engine.master_timing().is_none());
    }

    #[test]
    fn test_master_cap_stops_recording() {
        let cfg = EngineConfig {
            max_master_record_secs: 0.05,
            ..Default::default()
        };
        let (mut engine, mut controller) = LoopEngine::new(cfg, RATE);
        controller.send(Command::Press(0));
        run_signal(&mut engine, (0.2 * RATE) as usize, 0.2);
        assert_eq!(engine.track(0).state(), TrackState::Playing);
        let frames = engine.track(0).buffer.as_ref().unwrap().frames();
        assert_eq!(frames, (0.05 * RATE) as usize);
    }

    #[test]
    fn test_loopback_probe_detects_feedback() {
        let (mut engine, _controller) = engine();
        engine.begin_loopback_probe();
        // Feed a "mic" that hears the playback loudly.
        run_signal(&mut engine, (0.2 * RATE) as usize, 0.3);
        assert!(engine.loopback_detected());
    }

    #[test]
    fn test_loopback_probe_quiet_mic_passes() {
        let (mut engine, _controller) = engine();
        engine.begin_loopback_probe();
        run_silence(&mut engine, (0.2 * RATE) as usize);
        assert!(!engine.loopback_detected());
    }
}
