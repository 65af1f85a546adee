// src/fx_components/compressor.rs

//! Feed-forward compressor with a peak envelope follower. The envelope runs
//! on the stereo maximum so the image does not wander under gain reduction.

use crate::fx_components::EffectNode;

#[derive(Debug)]
pub struct CompressorNode {
    threshold: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    envelope: f32,
}

impl CompressorNode {
    pub fn new(threshold: f32, ratio: f32, attack_ms: f32, release_ms: f32, sample_rate: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.01, 1.0),
            ratio: ratio.max(1.0),
            attack_coeff: (-(1.0 / (attack_ms.max(0.1) * 0.001 * sample_rate))).exp(),
            release_coeff: (-(1.0 / (release_ms.max(1.0) * 0.001 * sample_rate))).exp(),
            envelope: 0.0,
        }
    }

    #[inline]
    fn gain_for(&mut self, input_abs: f32) -> f32 {
        self.envelope = if input_abs > self.envelope {
            self.attack_coeff * (self.envelope - input_abs) + input_abs
        } else {
            self.release_coeff * (self.envelope - input_abs) + input_abs
        };
        self.envelope = self.envelope.max(1e-6);

        if self.envelope <= self.threshold {
            return 1.0;
        }
        let compressed = self.threshold + (self.envelope - self.threshold) / self.ratio;
        compressed / self.envelope
    }
}

impl EffectNode for CompressorNode {
    fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let gain = self.gain_for(left.abs().max(right.abs()));
        (left * gain, right * gain)
    }

    fn reset(&mut self) {
        self.envelope = 0.0;
    }
}
