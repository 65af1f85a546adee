// src/buffer.rs

//! Owned multichannel PCM. Loop buffers, overdub captures and pitch-engine
//! results all move through this type; it is deliberately plain data with no
//! interior sharing, so a deep copy is just `clone()`.

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// All channels must be the same length and the rate must be positive.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self, EngineError> {
        if sample_rate == 0 {
            return Err(EngineError::DecodeError("sample rate must be > 0".into()));
        }
        if let Some(first) = channels.first() {
            let len = first.len();
            if channels.iter().any(|c| c.len() != len) {
                return Err(EngineError::DecodeError(
                    "channels have unequal lengths".into(),
                ));
            }
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self, EngineError> {
        Self::new(vec![samples], sample_rate)
    }

    /// De-interleave a captured frame stream. Fails when the stream is empty
    /// or not a whole number of frames.
    pub fn from_interleaved(
        data: &[f32],
        channel_count: usize,
        sample_rate: u32,
    ) -> Result<Self, EngineError> {
        if channel_count == 0 || data.is_empty() {
            return Err(EngineError::DecodeError("no frames captured".into()));
        }
        if data.len() % channel_count != 0 {
            return Err(EngineError::DecodeError(format!(
                "{} samples do not divide into {} channels",
                data.len(),
                channel_count
            )));
        }
        let frames = data.len() / channel_count;
        let mut channels = vec![Vec::with_capacity(frames); channel_count];
        for frame in data.chunks(channel_count) {
            for (c, &s) in frame.iter().enumerate() {
                channels[c].push(s);
            }
        }
        Self::new(channels, sample_rate)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, |c| c.len())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    /// Sample read that treats missing channels and out-of-range indices as
    /// silence. The overdub mixer leans on this for channel-count and length
    /// reconciliation.
    pub fn sample_or_zero(&self, channel: usize, index: usize) -> f32 {
        self.channels
            .get(channel)
            .and_then(|c| c.get(index))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn into_channels(self) -> Vec<Vec<f32>> {
        self.channels
    }
}
