// src/export.rs

//! WAV import/export. Files are PCM16 little-endian with the canonical RIFF
//! layout; import accepts PCM16 and float WAVs and resamples to the engine
//! rate at the call site.

use crate::buffer::AudioBuffer;
use anyhow::Result;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

const SILENCE_THRESHOLD: f32 = 0.005; // block RMS
const BLOCK_FRAMES: usize = 512;
const REQUIRED_BLOCKS: usize = 3;

pub fn write_wav(path: &Path, buffer: &AudioBuffer) -> Result<()> {
    let spec = hound::WavSpec {
        channels: buffer.channel_count().max(1) as u16,
        sample_rate: buffer.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    let amplitude = i16::MAX as f32;
    for i in 0..buffer.frames() {
        for c in 0..buffer.channel_count() {
            let sample = buffer.channel(c)[i].clamp(-1.0, 1.0);
            writer.write_sample((sample * amplitude) as i16)?;
        }
    }
    writer.finalize()?;
    Ok(())
}

pub fn load_wav(path: &Path) -> Result<AudioBuffer> {
    let file = BufReader::new(File::open(path)?);
    let reader = hound::WavReader::new(file)?;
    let spec = reader.spec();
    let channel_count = spec.channels as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .into_samples::<i16>()
            .filter_map(Result::ok)
            .map(|s| s as f32 / i16::MAX as f32)
            .collect(),
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .filter_map(Result::ok)
            .collect(),
    };

    Ok(AudioBuffer::from_interleaved(
        &interleaved,
        channel_count,
        spec.sample_rate,
    )?)
}

/// Strip leading and trailing silence, block-wise. A block counts as sound
/// when its RMS over all channels clears the threshold for three blocks
/// running. Returns an empty buffer when everything is silent.
pub fn trim_silence(buffer: &AudioBuffer) -> AudioBuffer {
    let frames = buffer.frames();
    let channels = buffer.channel_count();
    if frames == 0 || channels == 0 {
        return buffer.clone();
    }
    let num_blocks = frames / BLOCK_FRAMES;

    let block_rms = |block: usize| -> f32 {
        let start = block * BLOCK_FRAMES;
        let end = (start + BLOCK_FRAMES).min(frames);
        let mut sum_sq = 0.0f32;
        for i in start..end {
            for c in 0..channels {
                let s = buffer.channel(c)[i];
                sum_sq += s * s;
            }
        }
        (sum_sq / ((end - start) * channels) as f32).sqrt()
    };

    let mut consecutive = 0;
    let mut start_block = None;
    for b in 0..num_blocks {
        if block_rms(b) > SILENCE_THRESHOLD {
            consecutive += 1;
            if consecutive >= REQUIRED_BLOCKS {
                start_block = Some(b.saturating_sub(REQUIRED_BLOCKS - 1));
                break;
            }
        } else {
            consecutive = 0;
        }
    }
    let Some(start_block) = start_block else {
        return AudioBuffer::new(vec![Vec::new(); channels], buffer.sample_rate())
            .expect("empty channels are uniform");
    };

    consecutive = 0;
    let mut end_block = None;
    for b in (0..num_blocks).rev() {
        if block_rms(b) > SILENCE_THRESHOLD {
            consecutive += 1;
            if consecutive >= REQUIRED_BLOCKS {
                end_block = Some(b);
                break;
            }
        } else {
            consecutive = 0;
        }
    }

    let start = start_block * BLOCK_FRAMES;
    let end = end_block.map_or(frames, |b| ((b + 1) * BLOCK_FRAMES).min(frames));
    if start >= end {
        return AudioBuffer::new(vec![Vec::new(); channels], buffer.sample_rate())
            .expect("empty channels are uniform");
    }

    let trimmed: Vec<Vec<f32>> = (0..channels)
        .map(|c| buffer.channel(c)[start..end].to_vec())
        .collect();
    AudioBuffer::new(trimmed, buffer.sample_rate()).expect("slices are uniform")
}
