// src/overdub.rs

//! Overdub mix-in. The freshly captured material is reconciled to the loop's
//! sample rate and length, then summed into the existing buffer under a hard
//! limiter. The loop's length and duration never change here.

use crate::buffer::AudioBuffer;
use crate::error::EngineError;
use crate::resample::resample_buffer;

pub fn mix_overdub(
    existing: &AudioBuffer,
    overdub: &AudioBuffer,
    allow_wrap: bool,
) -> Result<AudioBuffer, EngineError> {
    let overdub_matched;
    let overdub = if overdub.sample_rate() != existing.sample_rate() {
        overdub_matched = resample_buffer(overdub, existing.sample_rate())
            .map_err(|e| EngineError::DecodeError(format!("overdub resample: {}", e)))?;
        &overdub_matched
    } else {
        overdub
    };

    let frames = existing.frames();
    let channels = existing.channel_count().max(overdub.channel_count());
    let overdub_frames = overdub.frames();

    let mut out = Vec::with_capacity(channels);
    for c in 0..channels {
        let mut channel = Vec::with_capacity(frames);
        for i in 0..frames {
            let dub = if allow_wrap && overdub_frames > 0 {
                overdub.sample_or_zero(c, i % overdub_frames)
            } else {
                overdub.sample_or_zero(c, i)
            };
            let sum = existing.sample_or_zero(c, i) + dub;
            channel.push(sum.clamp(-1.0, 1.0));
        }
        out.push(channel);
    }

    AudioBuffer::new(out, existing.sample_rate())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(value: f32, frames: usize, rate: u32) -> AudioBuffer {
        AudioBuffer::from_mono(vec![value; frames], rate).unwrap()
    }

    #[test]
    fn test_length_preserved() {
        let existing = constant(0.2, 88_200, 44_100);
        let overdub = constant(0.3, 79_380, 44_100); // 1.8 s against a 2.0 s loop
        let mixed = mix_overdub(&existing, &overdub, false).unwrap();
        assert_eq!(mixed.frames(), 88_200);
        assert!((mixed.duration_secs() - existing.duration_secs()).abs() < 1e-12);
    }

    #[test]
    fn test_short_overdub_zero_pads_tail() {
        let existing = constant(0.2, 1000, 44_100);
        let overdub = constant(0.3, 600, 44_100);
        let mixed = mix_overdub(&existing, &overdub, false).unwrap();
        assert!((mixed.channel(0)[0] - 0.5).abs() < 1e-6);
        assert!((mixed.channel(0)[599] - 0.5).abs() < 1e-6);
        // Beyond the capture the original is untouched.
        assert!((mixed.channel(0)[600] - 0.2).abs() < 1e-6);
        assert!((mixed.channel(0)[999] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_wrap_policy_repeats_overdub() {
        let existing = constant(0.0, 1000, 44_100);
        let overdub = constant(0.25, 400, 44_100);
        let mixed = mix_overdub(&existing, &overdub, true).unwrap();
        assert!((mixed.channel(0)[999] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_long_overdub_truncated() {
        let existing = constant(0.1, 500, 44_100);
        let overdub = constant(0.1, 900, 44_100);
        let mixed = mix_overdub(&existing, &overdub, false).unwrap();
        assert_eq!(mixed.frames(), 500);
    }

    #[test]
    fn test_sum_is_hard_limited() {
        let existing = constant(0.8, 100, 44_100);
        let overdub = constant(0.7, 100, 44_100);
        let mixed = mix_overdub(&existing, &overdub, false).unwrap();
        assert!(mixed.channel(0).iter().all(|&s| s <= 1.0));
        assert!((mixed.channel(0)[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_channel_count_is_max_of_inputs() {
        let existing = constant(0.2, 100, 44_100);
        let overdub =
            AudioBuffer::new(vec![vec![0.1; 100], vec![0.3; 100]], 44_100).unwrap();
        let mixed = mix_overdub(&existing, &overdub, false).unwrap();
        assert_eq!(mixed.channel_count(), 2);
        // Mono loop contributes zero to the second channel.
        assert!((mixed.channel(1)[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_rate_mismatch_is_reconciled() {
        let existing = constant(0.0, 44_100, 44_100);
        let overdub = constant(0.2, 48_000, 48_000);
        let mixed = mix_overdub(&existing, &overdub, false).unwrap();
        assert_eq!(mixed.frames(), 44_100);
        assert_eq!(mixed.sample_rate(), 44_100);
    }
}
