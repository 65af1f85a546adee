//! # quadloop
//!
//! Four-track phase-locked live looper engine, modeled on hardware loop
//! stations. Track 1 sets the bar period; dependent tracks record at bar
//! boundaries in integer multiples of it, loops can be overdubbed in place,
//! and per-track effect chains include an offline, duration-preserving
//! pitch shift running on a cancellable worker pool.
//!
//! The engine is shell-agnostic: the platform (or a test) feeds mono mic
//! frames into [`LoopEngine::process`] and reads back the stereo mix, while
//! commands and events flow through the [`EngineController`]. A cpal-based
//! duplex shell lives in [`audio_io`].

pub mod analysis;
pub mod audio_io;
pub mod buffer;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod export;
pub mod fx;
pub mod fx_components;
pub mod overdub;
pub mod pitch;
pub mod pitch_pool;
pub mod recorder;
pub mod resample;
pub mod session;
pub mod track;

pub use buffer::AudioBuffer;
pub use clock::{MasterTiming, TransportClock};
pub use command::Command;
pub use config::EngineConfig;
pub use error::EngineError;
pub use fx::{EffectChain, EffectKind, EffectParams, MoveDirection};
pub use session::{EngineController, EngineEvent, LoopEngine};
pub use track::{SharedTrackState, TrackState, NUM_TRACKS};
