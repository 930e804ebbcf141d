use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;
use log::{info, warn};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use voxproc_core::constants::{FRAME_SIZE, SAMPLE_RATE};
use voxproc_core::{DelayAdjustment, DelayMetrics, Session};

/// Samples pulled from the capture ring per pass. Deliberately not a multiple
/// of the frame size so the session's accumulator does the framing.
const CHUNK: usize = 1024;

/// Passes between two stats snapshots (~0.5s at 48 kHz).
const STATS_INTERVAL: u32 = 24;

/// What the processing thread reports to the foreground.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveStats {
    pub stream_delay_ms: i32,
    pub metrics: DelayMetrics,
    pub has_voice: Option<bool>,
    pub suggested_analog_level: i32,
    pub frames: u64,
}

/// Live capture -> session -> playback, with an optional reference capture
/// (e.g. a monitor of the speakers) feeding the reverse stream.
///
/// The session lives on one processing thread, which serializes all forward,
/// reverse and control calls.
pub struct AudioEngine {
    _input_stream: cpal::Stream,
    _output_stream: cpal::Stream,
    _reference_stream: Option<cpal::Stream>,
    is_running: Arc<AtomicBool>,
}

impl AudioEngine {
    pub fn start(
        input_device_name: &str,
        output_device_name: &str,
        reference_device_name: Option<&str>,
        mut session: Session,
        auto_delay: bool,
        stats_sender: Option<Sender<LiveStats>>,
    ) -> Result<Self> {
        let host = cpal::default_host();
        info!("Audio host: {}", host.id().name());

        let input_device = find_input(&host, input_device_name).context("Input device not found")?;
        info!(
            "Using input device: {}",
            input_device.name().unwrap_or_default()
        );

        let output_device = if output_device_name == "default" {
            host.default_output_device()
                .context("No default output found")?
        } else {
            host.output_devices()?
                .find(|d| d.name().ok().as_deref() == Some(output_device_name))
                .context("Output device not found")?
        };
        info!(
            "Using output device: {}",
            output_device.name().unwrap_or_default()
        );

        let reference_device = reference_device_name.and_then(|name| {
            let dev = find_input(&host, name);
            match &dev {
                Some(d) => info!("Using reference device: {}", d.name().unwrap_or_default()),
                None => warn!("Reference device '{}' not found, echo path disabled", name),
            }
            dev
        });

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        // Latency management (100ms buffer)
        let buffer_size = (SAMPLE_RATE as usize) / 10;

        let rb_in = HeapRb::<f32>::new(buffer_size);
        let (mut prod_in, mut cons_in) = rb_in.split();

        let rb_out = HeapRb::<f32>::new(buffer_size);
        let (mut prod_out, mut cons_out) = rb_out.split();

        let rb_ref = HeapRb::<f32>::new(buffer_size);
        let (mut prod_ref, mut cons_ref) = rb_ref.split();

        let reference_stream: Option<cpal::Stream> = if let Some(ref_dev) = &reference_device {
            match ref_dev.build_input_stream(
                &config,
                move |data: &[f32], _| {
                    let _ = prod_ref.push_slice(data);
                },
                |err| warn!("Reference input error: {}", err),
                None,
            ) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!("Failed to open reference device: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let input_stream = input_device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                let _ = prod_in.push_slice(data);
            },
            |err| warn!("Input error: {}", err),
            None,
        )?;

        let output_stream = output_device.build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                let read = cons_out.pop_slice(data);
                if read < data.len() {
                    for sample in data.iter_mut().skip(read) {
                        *sample = 0.0;
                    }
                }
            },
            |err| warn!("Output error: {}", err),
            None,
        )?;

        let is_running = Arc::new(AtomicBool::new(true));
        let run_flag = is_running.clone();
        let has_reference = reference_stream.is_some();

        thread::Builder::new()
            .name("voxproc-audio".into())
            .spawn(move || {
                let mut capture = [0.0f32; CHUNK];
                let mut reference = [0.0f32; CHUNK];
                let mut near = [0i16; CHUNK];
                let mut far = [0i16; CHUNK];
                let mut playback = [0.0f32; CHUNK];
                let mut frames: u64 = 0;
                let mut passes: u32 = 0;

                while run_flag.load(Ordering::Relaxed) {
                    let available = cons_in.occupied_len().min(CHUNK);
                    if available < FRAME_SIZE {
                        thread::sleep(Duration::from_micros(500));
                        continue;
                    }

                    let read = cons_in.pop_slice(&mut capture[..available]);
                    floats_to_i16(&capture[..read], &mut near[..read]);

                    // Far end first so the echo canceller has the matching render frame.
                    if has_reference {
                        let ref_read = cons_ref.pop_slice(&mut reference[..read]);
                        floats_to_i16(&reference[..ref_read], &mut far[..ref_read]);
                        session.process_reverse_chunk(&far[..ref_read]);
                    }

                    frames += session.process_chunk(&mut near[..read]) as u64;

                    if auto_delay {
                        if let DelayAdjustment::Moved { from, to } = session.adjust_delay() {
                            info!("Stream delay {}ms -> {}ms", from, to);
                        }
                    }

                    i16_to_floats(&near[..read], &mut playback[..read]);
                    // Write Audio - retry briefly if output buffer is full
                    let mut retries = 0;
                    while prod_out.vacant_len() < read {
                        thread::yield_now();
                        retries += 1;
                        if retries > 100 {
                            break;
                        }
                    }
                    let _ = prod_out.push_slice(&playback[..read]);

                    passes += 1;
                    if passes >= STATS_INTERVAL {
                        passes = 0;
                        if let Some(sender) = &stats_sender {
                            let _ = sender.try_send(LiveStats {
                                stream_delay_ms: session.stream_delay_ms(),
                                metrics: session.metrics(),
                                has_voice: session.has_voice(),
                                suggested_analog_level: session.suggested_analog_gain_level(),
                                frames,
                            });
                        }
                    }
                }
                session.destroy();
            })
            .context("Failed to spawn audio processing thread")?;

        input_stream.play()?;
        output_stream.play()?;
        if let Some(ref ref_stream) = reference_stream {
            ref_stream.play()?;
        }

        Ok(Self {
            _input_stream: input_stream,
            _output_stream: output_stream,
            _reference_stream: reference_stream,
            is_running,
        })
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Relaxed);
    }
}

fn find_input(host: &cpal::Host, name: &str) -> Option<cpal::Device> {
    if name == "default" {
        return host.default_input_device();
    }
    match host.input_devices() {
        Ok(mut devs) => devs.find(|d| d.name().ok().as_deref() == Some(name)),
        Err(e) => {
            warn!("Failed to enumerate input devices: {}", e);
            None
        }
    }
}

pub fn floats_to_i16(src: &[f32], dst: &mut [i16]) {
    for (out, &sample) in dst.iter_mut().zip(src) {
        *out = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
    }
}

pub fn i16_to_floats(src: &[i16], dst: &mut [f32]) {
    for (out, &sample) in dst.iter_mut().zip(src) {
        *out = sample as f32 / 32768.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_conversion_saturates() {
        let mut out = [0i16; 4];
        floats_to_i16(&[0.0, 1.0, -1.5, 2.0], &mut out);
        assert_eq!(out, [0, 32767, -32768, 32767]);
    }

    #[test]
    fn test_float_conversion_round_trip_is_close() {
        let samples = [-32768i16, -1000, 0, 1000, 32767];
        let mut floats = [0.0f32; 5];
        let mut back = [0i16; 5];
        i16_to_floats(&samples, &mut floats);
        floats_to_i16(&floats, &mut back);
        for (a, b) in samples.iter().zip(back.iter()) {
            assert!((a - b).abs() <= 1, "{} vs {}", a, b);
        }
    }
}
