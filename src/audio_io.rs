// src/audio_io.rs

//! Optional cpal shell: a duplex pair of streams bridging the platform
//! devices to a `LoopEngine`. Mic frames are folded to mono and queued on a
//! lock-free ring; the output callback drains the ring, runs the engine and
//! writes the stereo mix to the device. Device enumeration and permission
//! handling stay with the platform.

use crate::session::LoopEngine;
use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, FromSample, Sample, SampleFormat, Stream, StreamConfig};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Mic frames buffered between the input and output callbacks.
pub const MIC_RING_CAPACITY: usize = 1 << 15;

pub fn mic_ring() -> (HeapProducer<f32>, HeapConsumer<f32>) {
    HeapRb::<f32>::new(MIC_RING_CAPACITY).split()
}

pub struct RunningStreams {
    pub input: Stream,
    pub output: Stream,
    pub sample_rate: u32,
}

/// Open the default duplex pair and start processing. The engine must have
/// been constructed at the device's sample rate.
pub fn init_and_run_streams(
    engine: LoopEngine,
    mic_producer: HeapProducer<f32>,
    mic_consumer: HeapConsumer<f32>,
    mic_connected: Arc<AtomicBool>,
    requested_sample_rate: Option<u32>,
    requested_buffer_size: Option<u32>,
) -> Result<RunningStreams> {
    let host = cpal::default_host();
    let input_device = host
        .default_input_device()
        .ok_or_else(|| anyhow::anyhow!("No default input device"))?;
    let output_device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("No default output device"))?;
    log::info!(
        "using input device: {}",
        input_device.name().unwrap_or_default()
    );
    log::info!(
        "using output device: {}",
        output_device.name().unwrap_or_default()
    );

    let default_input_config = input_device.default_input_config()?;
    let default_output_config = output_device.default_output_config()?;
    let sample_format = default_output_config.sample_format();

    let mut input_config: StreamConfig = default_input_config.into();
    let mut output_config: StreamConfig = default_output_config.into();
    if let Some(sr) = requested_sample_rate {
        input_config.sample_rate = cpal::SampleRate(sr);
        output_config.sample_rate = cpal::SampleRate(sr);
    }
    if let Some(bs) = requested_buffer_size {
        input_config.buffer_size = BufferSize::Fixed(bs);
        output_config.buffer_size = BufferSize::Fixed(bs);
    }

    let (input, output) = match sample_format {
        SampleFormat::F32 => run::<f32>(
            &input_device,
            &input_config,
            &output_device,
            &output_config,
            mic_producer,
            mic_consumer,
            mic_connected,
            engine,
        )?,
        SampleFormat::I16 => run::<i16>(
            &input_device,
            &input_config,
            &output_device,
            &output_config,
            mic_producer,
            mic_consumer,
            mic_connected,
            engine,
        )?,
        SampleFormat::U16 => run::<u16>(
            &input_device,
            &input_config,
            &output_device,
            &output_config,
            mic_producer,
            mic_consumer,
            mic_connected,
            engine,
        )?,
        format => return Err(anyhow::anyhow!("Unsupported sample format {}", format)),
    };

    Ok(RunningStreams {
        input,
        output,
        sample_rate: output_config.sample_rate.0,
    })
}

#[allow(clippy::too_many_arguments)]
fn run<T>(
    input_device: &Device,
    input_config: &StreamConfig,
    output_device: &Device,
    output_config: &StreamConfig,
    mic_producer: HeapProducer<f32>,
    mic_consumer: HeapConsumer<f32>,
    mic_connected: Arc<AtomicBool>,
    engine: LoopEngine,
) -> Result<(Stream, Stream)>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
    f32: FromSample<T>,
{
    let input_stream =
        build_input_stream::<T>(input_device, input_config, mic_producer, mic_connected)?;
    let output_stream =
        build_output_stream::<T>(output_device, output_config, mic_consumer, engine)?;
    input_stream.play()?;
    output_stream.play()?;
    Ok((input_stream, output_stream))
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: HeapProducer<f32>,
    mic_connected: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let err_fn = {
        let mic_connected = mic_connected.clone();
        move |err| {
            log::error!("input stream error: {}", err);
            mic_connected.store(false, Ordering::Relaxed);
        }
    };

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mic_connected.store(true, Ordering::Relaxed);
            for frame in data.chunks(channels) {
                let mono =
                    frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / channels as f32;
                if producer.push(mono).is_err() {
                    // ring full, drop frame
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut mic_consumer: HeapConsumer<f32>,
    mut engine: LoopEngine,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let err_fn = |err| log::error!("output stream error: {}", err);
    let mut mic_scratch: Vec<f32> = Vec::new();
    let mut mix_scratch: Vec<f32> = Vec::new();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            mic_scratch.resize(frames, 0.0);
            mix_scratch.resize(frames * 2, 0.0);

            let read = mic_consumer.pop_slice(&mut mic_scratch);
            mic_scratch[read..].iter_mut().for_each(|s| *s = 0.0);

            engine.process(&mic_scratch, &mut mix_scratch);

            for (i, frame) in data.chunks_mut(channels).enumerate() {
                let left = mix_scratch[2 * i];
                let right = mix_scratch[2 * i + 1];
                match frame.len() {
                    0 => {}
                    1 => frame[0] = T::from_sample((left + right) * 0.5),
                    _ => {
                        frame[0] = T::from_sample(left);
                        frame[1] = T::from_sample(right);
                        for sample in frame.iter_mut().skip(2) {
                            *sample = T::from_sample(0.0);
                        }
                    }
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
