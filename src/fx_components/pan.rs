// src/fx_components/pan.rs

//! Constant-power stereo pan.

use crate::fx_components::EffectNode;
use std::f32::consts::FRAC_PI_4;

#[derive(Debug)]
pub struct PanNode {
    gain_left: f32,
    gain_right: f32,
}

impl PanNode {
    /// `position` runs -1 (hard left) to +1 (hard right).
    pub fn new(position: f32) -> Self {
        let angle = (position.clamp(-1.0, 1.0) + 1.0) * FRAC_PI_4;
        Self {
            gain_left: angle.cos(),
            gain_right: angle.sin(),
        }
    }
}

impl EffectNode for PanNode {
    fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        (left * self.gain_left, right * self.gain_right)
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_keeps_both_sides_equal() {
        let mut node = PanNode::new(0.0);
        let (l, r) = node.process(1.0, 1.0);
        assert!((l - r).abs() < 1e-6);
        // Constant-power: each side at cos(45 deg).
        assert!((l - 0.7071).abs() < 1e-3);
    }

    #[test]
    fn test_hard_left_silences_right() {
        let mut node = PanNode::new(-1.0);
        let (l, r) = node.process(1.0, 1.0);
        assert!((l - 1.0).abs() < 1e-6);
        assert!(r.abs() < 1e-6);
    }

    #[test]
    fn test_hard_right_silences_left() {
        let mut node = PanNode::new(1.0);
        let (l, r) = node.process(1.0, 1.0);
        assert!(l.abs() < 1e-6);
        assert!((r - 1.0).abs() < 1e-6);
    }
}
