// src/config.rs

use serde::{Deserialize, Serialize};

/// Engine configuration. Every field has a standalone default so partial
/// config files deserialize cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default grain size for the offline pitch shifter, in samples.
    pub pitch_grain_size: usize,
    /// Hop length as a fraction of the grain size.
    pub pitch_hop_ratio: f32,
    /// Wall-clock budget for a pooled pitch job before the engine falls back
    /// to running the same pass inline.
    pub pitch_job_timeout_ms: u64,
    /// Maximum retained undo snapshots per track.
    pub undo_stack_limit: usize,
    /// Hard expiration of the recording lease.
    pub recorder_global_timeout_ms: u64,
    /// Mute the master bus and the live monitor while an overdub capture is
    /// active, restoring both afterwards.
    pub auto_mute_monitor_on_overdub: bool,
    /// Overdub material shorter than the loop wraps instead of zero-padding.
    pub allow_wrap_overdub: bool,
    /// Mic RMS above this during the startup probe marks the session as
    /// loopback-prone.
    pub loopback_rms_threshold: f32,
    /// Hard cap on the first (master) recording, in seconds.
    pub max_master_record_secs: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pitch_grain_size: 2048,
            pitch_hop_ratio: 0.25,
            pitch_job_timeout_ms: 45_000,
            undo_stack_limit: 6,
            recorder_global_timeout_ms: 120_000,
            auto_mute_monitor_on_overdub: true,
            allow_wrap_overdub: false,
            loopback_rms_threshold: 0.02,
            max_master_record_secs: 60.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.pitch_grain_size, 2048);
        assert_eq!(cfg.pitch_hop_ratio, 0.25);
        assert_eq!(cfg.pitch_job_timeout_ms, 45_000);
        assert_eq!(cfg.undo_stack_limit, 6);
        assert_eq!(cfg.recorder_global_timeout_ms, 120_000);
        assert!(cfg.auto_mute_monitor_on_overdub);
        assert!(!cfg.allow_wrap_overdub);
        assert!((cfg.loopback_rms_threshold - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"undo_stack_limit": 3}"#).unwrap();
        assert_eq!(cfg.undo_stack_limit, 3);
        assert_eq!(cfg.pitch_grain_size, 2048);
    }
}
