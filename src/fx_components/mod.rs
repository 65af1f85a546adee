// src/fx_components/mod.rs

// Declare all component modules
pub mod compressor;
pub mod delay;
pub mod filter;
pub mod pan;

pub use compressor::CompressorNode;
pub use delay::DelayNode;
pub use filter::{FilterMode, FilterNode};
pub use pan::PanNode;

use crate::fx::EffectParams;

/// A runtime node in a track's effect series. Nodes carry only audio state;
/// their parameters are frozen in at build time and a chain edit rebuilds
/// the whole series.
pub trait EffectNode: Send {
    /// Process one stereo frame.
    fn process(&mut self, left: f32, right: f32) -> (f32, f32);

    /// Clear delay lines and envelopes so no tail survives a rebuild.
    fn reset(&mut self);
}

/// Instantiate the runtime node for a descriptor. `Pitch` has no runtime
/// node (the offline engine rewrites the buffer instead) and maps to `None`.
pub fn build_node(params: &EffectParams, sample_rate: f32) -> Option<Box<dyn EffectNode>> {
    match *params {
        EffectParams::Pitch { .. } => None,
        EffectParams::LowPass { cutoff_hz, q } => Some(Box::new(FilterNode::new(
            FilterMode::LowPass,
            cutoff_hz,
            q,
            sample_rate,
        ))),
        EffectParams::HighPass { cutoff_hz, q } => Some(Box::new(FilterNode::new(
            FilterMode::HighPass,
            cutoff_hz,
            q,
            sample_rate,
        ))),
        EffectParams::Pan { position } => Some(Box::new(PanNode::new(position))),
        EffectParams::Delay {
            time_ms,
            feedback,
            mix,
        } => Some(Box::new(DelayNode::new(time_ms, feedback, mix, sample_rate))),
        EffectParams::Compressor {
            threshold,
            ratio,
            attack_ms,
            release_ms,
        } => Some(Box::new(CompressorNode::new(
            threshold,
            ratio,
            attack_ms,
            release_ms,
            sample_rate,
        ))),
    }
}
