// src/analysis.rs

//! Offline signal measurements: YIN fundamental-frequency estimation and RMS.
//! The pitch estimator backs the test suite's frequency assertions and is
//! exposed for tuner-style consumers.

const YIN_THRESHOLD: f32 = 0.15;
const MIN_FREQUENCY_HZ: f32 = 100.0;

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// YIN estimate of the fundamental frequency, or `None` when no period
/// clears the threshold (silence, noise, or a fundamental below the floor).
pub fn estimate_pitch(samples: &[f32], sample_rate: f32) -> Option<f32> {
    estimate_pitch_with(samples, sample_rate, YIN_THRESHOLD, MIN_FREQUENCY_HZ)
}

pub fn estimate_pitch_with(
    samples: &[f32],
    sample_rate: f32,
    threshold: f32,
    min_frequency: f32,
) -> Option<f32> {
    let max_lag = (sample_rate / min_frequency) as usize;
    if samples.len() <= max_lag || max_lag < 2 {
        return None;
    }

    // Difference function.
    let mut yin = vec![0.0f32; max_lag];
    for tau in 1..max_lag {
        let mut diff_sum = 0.0f32;
        for i in 0..samples.len() - tau {
            let delta = samples[i] - samples[i + tau];
            diff_sum += delta * delta;
        }
        yin[tau] = diff_sum;
    }

    // Cumulative mean normalized difference.
    let mut running_sum = 0.0f32;
    yin[0] = 1.0;
    for tau in 1..max_lag {
        running_sum += yin[tau];
        if running_sum > 0.0 {
            yin[tau] *= tau as f32 / running_sum;
        }
    }

    // Absolute threshold, then walk down to the local minimum.
    let mut tau = 1;
    while tau < max_lag {
        if yin[tau] < threshold {
            let mut better_tau = tau;
            while tau + 1 < max_lag && yin[tau + 1] < yin[tau] {
                tau += 1;
                better_tau = tau;
            }
            // Parabolic interpolation around the minimum.
            if better_tau > 0 && better_tau < max_lag - 1 {
                let s0 = yin[better_tau - 1];
                let s1 = yin[better_tau];
                let s2 = yin[better_tau + 1];
                let divisor = 2.0 * s1 - s2 - s0;
                let adjustment = if divisor != 0.0 {
                    (s2 - s0) / (2.0 * divisor)
                } else {
                    0.0
                };
                return Some(sample_rate / (better_tau as f32 + adjustment));
            }
            return Some(sample_rate / better_tau as f32);
        }
        tau += 1;
    }

    None
}
