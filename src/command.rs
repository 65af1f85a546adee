// src/command.rs

use crate::fx::{EffectKind, MoveDirection};
use std::path::PathBuf;

/// User commands, pushed onto the engine's queue by the shell and drained at
/// the top of every processing block. Track indices are 0-based; track 0 is
/// the master.
#[derive(Debug, Clone)]
pub enum Command {
    /// Context-sensitive: record / stop-record / arm-overdub / finish-overdub.
    Press(usize),
    /// Context-sensitive: stop / resume / abort-recording.
    Stop(usize),
    Clear(usize),
    SetDivider {
        track: usize,
        divider: u32,
    },
    AddEffect {
        track: usize,
        kind: EffectKind,
    },
    MoveEffect {
        track: usize,
        id: u64,
        direction: MoveDirection,
    },
    RemoveEffect {
        track: usize,
        id: u64,
    },
    ToggleBypass {
        track: usize,
        id: u64,
    },
    SetParam {
        track: usize,
        id: u64,
        key: String,
        value: f32,
    },
    Undo(usize),
    /// Import a WAV file as the track's loop, resampling to the engine rate.
    LoadLoop {
        track: usize,
        path: PathBuf,
    },
    ToggleMonitor,
    StartMixRecord,
    StopMixRecord,
    /// Acknowledge the loopback warning so overdubs may arm anyway.
    ConfirmLoopback,
    SetMasterVolume(f32),
}
