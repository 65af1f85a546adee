// src/fx.rs

//! Effect descriptors and the per-track chain. The chain is plain data; the
//! runtime nodes are rebuilt from it whenever composition changes or playback
//! starts. `Pitch` is a descriptor like any other but never becomes a runtime
//! node; its handler is the offline pitch engine.

use crate::fx_components::{self, EffectNode};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Pitch,
    LowPass,
    HighPass,
    Pan,
    Delay,
    Compressor,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum EffectParams {
    Pitch { semitones: f32 },
    LowPass { cutoff_hz: f32, q: f32 },
    HighPass { cutoff_hz: f32, q: f32 },
    Pan { position: f32 },
    Delay { time_ms: f32, feedback: f32, mix: f32 },
    Compressor { threshold: f32, ratio: f32, attack_ms: f32, release_ms: f32 },
}

impl EffectParams {
    pub fn default_for(kind: EffectKind) -> Self {
        match kind {
            EffectKind::Pitch => EffectParams::Pitch { semitones: 0.0 },
            EffectKind::LowPass => EffectParams::LowPass {
                cutoff_hz: 2_000.0,
                q: 0.707,
            },
            EffectKind::HighPass => EffectParams::HighPass {
                cutoff_hz: 200.0,
                q: 0.707,
            },
            EffectKind::Pan => EffectParams::Pan { position: 0.0 },
            EffectKind::Delay => EffectParams::Delay {
                time_ms: 250.0,
                feedback: 0.3,
                mix: 0.35,
            },
            EffectKind::Compressor => EffectParams::Compressor {
                threshold: 0.5,
                ratio: 4.0,
                attack_ms: 5.0,
                release_ms: 80.0,
            },
        }
    }

    pub fn kind(&self) -> EffectKind {
        match self {
            EffectParams::Pitch { .. } => EffectKind::Pitch,
            EffectParams::LowPass { .. } => EffectKind::LowPass,
            EffectParams::HighPass { .. } => EffectKind::HighPass,
            EffectParams::Pan { .. } => EffectKind::Pan,
            EffectParams::Delay { .. } => EffectKind::Delay,
            EffectParams::Compressor { .. } => EffectKind::Compressor,
        }
    }

    /// Named-parameter write used by `SetParam`. Returns false for a key the
    /// variant does not have.
    pub fn set(&mut self, key: &str, value: f32) -> bool {
        match (self, key) {
            (EffectParams::Pitch { semitones }, "semitones") => {
                *semitones = value.clamp(-12.0, 12.0)
            }
            (EffectParams::LowPass { cutoff_hz, .. }, "cutoff_hz") => {
                *cutoff_hz = value.max(10.0)
            }
            (EffectParams::LowPass { q, .. }, "q") => *q = value.max(0.01),
            (EffectParams::HighPass { cutoff_hz, .. }, "cutoff_hz") => {
                *cutoff_hz = value.max(10.0)
            }
            (EffectParams::HighPass { q, .. }, "q") => *q = value.max(0.01),
            (EffectParams::Pan { position }, "position") => *position = value.clamp(-1.0, 1.0),
            (EffectParams::Delay { time_ms, .. }, "time_ms") => *time_ms = value.clamp(1.0, 2_000.0),
            (EffectParams::Delay { feedback, .. }, "feedback") => {
                *feedback = value.clamp(0.0, 0.95)
            }
            (EffectParams::Delay { mix, .. }, "mix") => *mix = value.clamp(0.0, 1.0),
            (EffectParams::Compressor { threshold, .. }, "threshold") => {
                *threshold = value.clamp(0.01, 1.0)
            }
            (EffectParams::Compressor { ratio, .. }, "ratio") => *ratio = value.clamp(1.0, 20.0),
            (EffectParams::Compressor { attack_ms, .. }, "attack_ms") => {
                *attack_ms = value.clamp(0.1, 200.0)
            }
            (EffectParams::Compressor { release_ms, .. }, "release_ms") => {
                *release_ms = value.clamp(1.0, 2_000.0)
            }
            _ => return false,
        }
        true
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EffectDescriptor {
    pub id: u64,
    pub params: EffectParams,
    pub bypass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

/// Ordered effect list with stable per-track ids.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EffectChain {
    effects: Vec<EffectDescriptor>,
    next_id: u64,
}

impl EffectChain {
    pub fn add(&mut self, kind: EffectKind) -> u64 {
        self.next_id += 1;
        self.effects.push(EffectDescriptor {
            id: self.next_id,
            params: EffectParams::default_for(kind),
            bypass: false,
        });
        self.next_id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.effects.len();
        self.effects.retain(|e| e.id != id);
        self.effects.len() != before
    }

    pub fn move_effect(&mut self, id: u64, direction: MoveDirection) -> bool {
        let Some(index) = self.effects.iter().position(|e| e.id == id) else {
            return false;
        };
        match direction {
            MoveDirection::Up if index > 0 => {
                self.effects.swap(index, index - 1);
                true
            }
            MoveDirection::Down if index + 1 < self.effects.len() => {
                self.effects.swap(index, index + 1);
                true
            }
            _ => false,
        }
    }

    pub fn toggle_bypass(&mut self, id: u64) -> bool {
        if let Some(e) = self.effects.iter_mut().find(|e| e.id == id) {
            e.bypass = !e.bypass;
            true
        } else {
            false
        }
    }

    pub fn set_param(&mut self, id: u64, key: &str, value: f32) -> bool {
        self.effects
            .iter_mut()
            .find(|e| e.id == id)
            .map_or(false, |e| e.params.set(key, value))
    }

    pub fn get(&self, id: u64) -> Option<&EffectDescriptor> {
        self.effects.iter().find(|e| e.id == id)
    }

    pub fn effects(&self) -> &[EffectDescriptor] {
        &self.effects
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn clear(&mut self) {
        self.effects.clear();
    }

    /// Build the runtime node series: non-bypassed effects in order, with
    /// `Pitch` skipped (it is pre-baked into the buffer). Dropping the old
    /// node vector disposes the previous incarnation.
    pub fn build_nodes(&self, sample_rate: f32) -> Vec<Box<dyn EffectNode>> {
        self.effects
            .iter()
            .filter(|e| !e.bypass)
            .filter_map(|e| fx_components::build_node(&e.params, sample_rate))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable_across_removal() {
        let mut chain = EffectChain::default();
        let a = chain.add(EffectKind::Delay);
        let b = chain.add(EffectKind::Pan);
        assert!(chain.remove(a));
        let c = chain.add(EffectKind::LowPass);
        assert_ne!(b, c);
        assert!(chain.get(b).is_some());
        assert!(chain.get(a).is_none());
    }

    #[test]
    fn test_move_up_and_down() {
        let mut chain = EffectChain::default();
        let a = chain.add(EffectKind::Delay);
        let b = chain.add(EffectKind::Pan);
        assert!(chain.move_effect(b, MoveDirection::Up));
        assert_eq!(chain.effects()[0].id, b);
        assert!(!chain.move_effect(b, MoveDirection::Up));
        assert!(chain.move_effect(b, MoveDirection::Down));
        assert_eq!(chain.effects()[1].id, b);
        assert_eq!(chain.effects()[0].id, a);
    }

    #[test]
    fn test_set_param_rejects_unknown_key() {
        let mut chain = EffectChain::default();
        let id = chain.add(EffectKind::Delay);
        assert!(chain.set_param(id, "feedback", 0.5));
        assert!(!chain.set_param(id, "cutoff_hz", 500.0));
        assert!(!chain.set_param(9999, "feedback", 0.5));
    }

    #[test]
    fn test_build_skips_bypassed_and_pitch() {
        let mut chain = EffectChain::default();
        chain.add(EffectKind::Pitch);
        let delay = chain.add(EffectKind::Delay);
        chain.add(EffectKind::Pan);
        chain.toggle_bypass(delay);
        let nodes = chain.build_nodes(44_100.0);
        assert_eq!(nodes.len(), 1); // only the pan survives
    }

    #[test]
    fn test_pitch_semitones_clamped() {
        let mut chain = EffectChain::default();
        let id = chain.add(EffectKind::Pitch);
        chain.set_param(id, "semitones", 30.0);
        match chain.get(id).unwrap().params {
            EffectParams::Pitch { semitones } => assert_eq!(semitones, 12.0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_chain_round_trips_through_serde() {
        let mut chain = EffectChain::default();
        chain.add(EffectKind::Compressor);
        chain.add(EffectKind::HighPass);
        let json = serde_json::to_string(&chain).unwrap();
        let back: EffectChain = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chain);
    }
}
