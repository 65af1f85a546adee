// src/resample.rs

use crate::buffer::AudioBuffer;
use anyhow::Result;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Offline sample-rate conversion. Returns a new buffer at `target_rate`;
/// a no-op (deep copy) when the rates already match.
pub fn resample_buffer(input: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    if input.sample_rate() == target_rate {
        return Ok(input.clone());
    }
    if input.frames() == 0 {
        return Ok(AudioBuffer::new(
            vec![Vec::new(); input.channel_count()],
            target_rate,
        )?);
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(
        target_rate as f64 / input.sample_rate() as f64,
        2.0,
        params,
        input.frames(),
        input.channel_count(),
    )?;

    let waves_in: Vec<Vec<f32>> = (0..input.channel_count())
        .map(|c| input.channel(c).to_vec())
        .collect();
    let waves_out = resampler.process(&waves_in, None)?;

    Ok(AudioBuffer::new(waves_out, target_rate)?)
}
