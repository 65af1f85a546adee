// src/pitch.rs

//! Offline granular pitch shifter. Overlapping Hann-windowed grains are
//! resampled by the pitch factor around their centers and overlap-added at
//! the original hop, which transposes the content while keeping the output
//! exactly as long as the input. A final envelope normalization removes the
//! window's amplitude ripple.

use crate::buffer::AudioBuffer;

pub const SHORT_BUFFER_FRAMES: usize = 22_050;
pub const SHORT_BUFFER_GRAIN: usize = 1024;
pub const WIDE_SHIFT_GRAIN: usize = 4096;
pub const WIDE_SHIFT_SEMITONES: f32 = 8.0;
/// Cancel and progress are observed once per this many hops.
pub const OBSERVE_HOP_INTERVAL: usize = 32;
const ENVELOPE_FLOOR: f32 = 1e-8;

pub fn semitone_ratio(semitones: f32) -> f64 {
    2f64.powf(semitones as f64 / 12.0)
}

/// Short buffers get short grains; extreme shifts get long ones.
pub fn grain_size_for(frames: usize, semitones: f32, default_grain: usize) -> usize {
    if frames < SHORT_BUFFER_FRAMES {
        SHORT_BUFFER_GRAIN
    } else if semitones.abs() > WIDE_SHIFT_SEMITONES {
        WIDE_SHIFT_GRAIN
    } else {
        default_grain
    }
}

/// Linear-interpolated read, silent outside the buffer.
fn sample_at(src: &[f32], pos: f64) -> f32 {
    if pos < 0.0 {
        return 0.0;
    }
    let i0 = pos.floor() as usize;
    if i0 >= src.len() {
        return 0.0;
    }
    let frac = (pos - i0 as f64) as f32;
    let s0 = src[i0];
    let s1 = if i0 + 1 < src.len() { src[i0 + 1] } else { 0.0 };
    s0 + frac * (s1 - s0)
}

pub fn hann_window(len: usize) -> Vec<f32> {
    if len < 2 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (len - 1) as f32).cos())
        })
        .collect()
}

/// Shift `input` by `semitones` (clamped to ±12), preserving frame count and
/// sample rate. `observer` receives progress in [0, 1] and returns `false` to
/// abort; it is consulted between channels and every [`OBSERVE_HOP_INTERVAL`]
/// hops. Returns `None` when aborted.
pub fn shift_pitch(
    input: &AudioBuffer,
    semitones: f32,
    default_grain: usize,
    hop_ratio: f32,
    observer: &mut dyn FnMut(f32) -> bool,
) -> Option<AudioBuffer> {
    let semitones = semitones.clamp(-12.0, 12.0);
    let frames = input.frames();
    if frames == 0 || input.channel_count() == 0 {
        return Some(input.clone());
    }

    let grain = grain_size_for(frames, semitones, default_grain);
    let hop = ((grain as f32 * hop_ratio).floor() as usize).max(1);
    let half = grain / 2;
    let ratio = semitone_ratio(semitones);
    let window = hann_window(grain);

    // Number of hop positions k = 0, H, 2H, ... with k < N + H.
    let hops_per_channel = (frames + hop - 1) / hop + 1;
    let total_hops = hops_per_channel * input.channel_count();
    let mut hops_done = 0usize;

    // The window envelope is identical for every channel.
    let mut envelope = vec![0.0f32; frames];
    let mut k = 0usize;
    while k < frames + hop {
        for (i, &w) in window.iter().enumerate() {
            let target = k as isize + i as isize - half as isize;
            if target >= 0 && (target as usize) < frames {
                envelope[target as usize] += w;
            }
        }
        k += hop;
    }

    let mut out_channels: Vec<Vec<f32>> = Vec::with_capacity(input.channel_count());
    for c in 0..input.channel_count() {
        if !observer(hops_done as f32 / total_hops as f32) {
            return None;
        }
        let src = input.channel(c);
        let mut out = vec![0.0f32; frames];
        let mut k = 0usize;
        let mut hops_since_observe = 0usize;
        while k < frames + hop {
            // Grain centers track the output position one-to-one; the
            // transposition comes from the resampled read inside the grain.
            for (i, &w) in window.iter().enumerate() {
                let src_pos = k as f64 + (i as f64 - half as f64) * ratio;
                let x = sample_at(src, src_pos);
                let target = k as isize + i as isize - half as isize;
                if target >= 0 && (target as usize) < frames {
                    out[target as usize] += x * w;
                }
            }
            k += hop;
            hops_done += 1;
            hops_since_observe += 1;
            if hops_since_observe >= OBSERVE_HOP_INTERVAL {
                hops_since_observe = 0;
                if !observer(hops_done as f32 / total_hops as f32) {
                    return None;
                }
            }
        }
        for (o, &e) in out.iter_mut().zip(envelope.iter()) {
            *o /= e.max(ENVELOPE_FLOOR);
        }
        out_channels.push(out);
    }
    observer(1.0);

    // Channel lengths and rate are preserved by construction.
    Some(AudioBuffer::new(out_channels, input.sample_rate()).expect("shifted channels uniform"))
}

/// Non-cancellable pass, used for the inline timeout fallback.
pub fn shift_pitch_blocking(
    input: &AudioBuffer,
    semitones: f32,
    default_grain: usize,
    hop_ratio: f32,
) -> AudioBuffer {
    shift_pitch(input, semitones, default_grain, hop_ratio, &mut |_| true)
        .expect("uncancellable shift completed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, secs: f32, rate: u32) -> AudioBuffer {
        let n = (secs * rate as f32) as usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.5)
            .collect();
        AudioBuffer::from_mono(samples, rate).unwrap()
    }

    fn zero_crossings(samples: &[f32]) -> usize {
        samples
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count()
    }

    #[test]
    fn test_grain_selection() {
        assert_eq!(grain_size_for(10_000, 2.0, 2048), SHORT_BUFFER_GRAIN);
        assert_eq!(grain_size_for(44_100, 2.0, 2048), 2048);
        assert_eq!(grain_size_for(44_100, 11.0, 2048), WIDE_SHIFT_GRAIN);
        assert_eq!(grain_size_for(44_100, -9.0, 2048), WIDE_SHIFT_GRAIN);
    }

    #[test]
    fn test_hann_window_endpoints() {
        let w = hann_window(512);
        assert!(w[0].abs() < 1e-6);
        assert!(w[511].abs() < 1e-6);
        assert!((w[255] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_duration_preserved_across_shifts() {
        let buf = sine(440.0, 1.0, 44_100);
        for s in [-12.0, -5.0, 0.0, 3.0, 8.5, 12.0] {
            let out = shift_pitch(&buf, s, 2048, 0.25, &mut |_| true).unwrap();
            assert_eq!(out.frames(), buf.frames(), "semitones {}", s);
            assert_eq!(out.sample_rate(), buf.sample_rate());
        }
    }

    #[test]
    fn test_zero_shift_is_near_identity() {
        let buf = sine(440.0, 1.0, 44_100);
        let out = shift_pitch(&buf, 0.0, 2048, 0.25, &mut |_| true).unwrap();
        let mut err = 0.0f64;
        for i in 0..buf.frames() {
            let d = (out.channel(0)[i] - buf.channel(0)[i]) as f64;
            err += d * d;
        }
        let rms = (err / buf.frames() as f64).sqrt();
        assert!(rms < 1e-3, "rms {}", rms);
    }

    #[test]
    fn test_octave_up_doubles_frequency() {
        let buf = sine(440.0, 1.0, 44_100);
        let out = shift_pitch(&buf, 12.0, 2048, 0.25, &mut |_| true).unwrap();
        let original = zero_crossings(buf.channel(0));
        // Skip the windowed edges when counting.
        let inner = &out.channel(0)[2048..out.frames() - 2048];
        let inner_secs = inner.len() as f32 / 44_100.0;
        let shifted_per_sec = zero_crossings(inner) as f32 / inner_secs;
        let original_per_sec = original as f32 / 1.0;
        let ratio = shifted_per_sec / original_per_sec;
        assert!((ratio - 2.0).abs() < 0.05, "ratio {}", ratio);
    }

    #[test]
    fn test_cancellation_returns_none() {
        let buf = sine(440.0, 2.0, 44_100);
        let mut calls = 0;
        let result = shift_pitch(&buf, 7.0, 2048, 0.25, &mut |_| {
            calls += 1;
            calls < 3
        });
        assert!(result.is_none());
    }

    #[test]
    fn test_progress_monotonic_and_complete() {
        let buf = sine(220.0, 0.7, 44_100);
        let mut last = -1.0f32;
        let out = shift_pitch(&buf, 4.0, 2048, 0.25, &mut |p| {
            assert!(p >= last);
            last = p;
            true
        });
        assert!(out.is_some());
        assert!((last - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_stereo_channels_shift_independently() {
        let n = 44_100;
        let left: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44_100.0).sin() * 0.5)
            .collect();
        let right = vec![0.0f32; n];
        let buf = AudioBuffer::new(vec![left, right], 44_100).unwrap();
        let out = shift_pitch(&buf, 12.0, 2048, 0.25, &mut |_| true).unwrap();
        let right_peak = out.channel(1).iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        assert!(right_peak < 1e-6, "silent channel stayed silent");
    }
}
