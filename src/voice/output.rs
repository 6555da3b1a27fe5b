//! Audio output device driven by scheduled slots

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};

use super::playback::{AudioSink, PlaybackSlot};
use crate::clock::{AudioClock, duration_to_frames};
use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Samples committed to start at an absolute output frame
struct ScheduledBuffer {
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl ScheduledBuffer {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Buffers shared between the scheduler and the device callback
#[derive(Default)]
struct Timeline {
    buffers: VecDeque<ScheduledBuffer>,
}

impl Timeline {
    /// Sample at an absolute output frame, or silence
    fn sample_at(&self, frame: u64) -> f32 {
        self.buffers
            .iter()
            .find(|b| b.start_frame <= frame && frame < b.end_frame())
            .and_then(|b| {
                let index = usize::try_from(frame - b.start_frame).ok()?;
                b.samples.get(index).copied()
            })
            .unwrap_or(0.0)
    }

    fn prune(&mut self, before: u64) {
        while self.buffers.front().is_some_and(|b| b.end_frame() <= before) {
            self.buffers.pop_front();
        }
    }
}

/// Owns the output stream; its rendered frame count is the audio clock
pub struct DeviceOutput {
    _stream: Stream,
    timeline: Arc<Mutex<Timeline>>,
    clock: AudioClock,
}

impl DeviceOutput {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no output device supports the rate
    pub fn open(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

        let supports = |channels: u16| {
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == channels
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        };

        let supported_config = supports(1)
            .or_else(|| {
                // Fallback: try stereo
                supports(2)
            })
            .ok_or_else(|| {
                Error::DeviceUnavailable(format!("no output config at {sample_rate} Hz"))
            })?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();
        let channels = usize::from(config.channels);

        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let clock = AudioClock::new(sample_rate);

        let render_timeline = Arc::clone(&timeline);
        let render_clock = clock.clone();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let first = render_clock.frames();
                    let frames = data.len() / channels.max(1);

                    match render_timeline.lock() {
                        Ok(mut timeline) => {
                            for (i, frame) in data.chunks_mut(channels.max(1)).enumerate() {
                                let sample = timeline.sample_at(first + i as u64);
                                frame.fill(sample);
                            }
                            timeline.prune(first + frames as u64);
                        }
                        Err(_) => data.fill(0.0),
                    }

                    // The clock keeps moving even when nothing is scheduled
                    render_clock.advance_frames(frames as u64);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels,
            "audio output initialized"
        );

        Ok(Self {
            _stream: stream,
            timeline,
            clock,
        })
    }

    /// Clock advanced by the device callback
    #[must_use]
    pub fn clock(&self) -> AudioClock {
        self.clock.clone()
    }

    /// Create a sink for the scheduler
    #[must_use]
    pub fn sink(&self) -> DeviceSink {
        DeviceSink {
            timeline: Arc::clone(&self.timeline),
            sample_rate: self.clock.sample_rate(),
        }
    }
}

/// Sink handle that writes into a device timeline
pub struct DeviceSink {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
}

impl AudioSink for DeviceSink {
    fn schedule(&mut self, slot: &PlaybackSlot) -> Result<()> {
        if slot.chunk.sample_rate() != self.sample_rate {
            return Err(Error::Audio(format!(
                "chunk rate {} does not match output rate {}",
                slot.chunk.sample_rate(),
                self.sample_rate
            )));
        }

        let start_frame = duration_to_frames(slot.scheduled_start, self.sample_rate);
        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| Error::Audio("output timeline poisoned".to_string()))?;
        timeline.buffers.push_back(ScheduledBuffer {
            start_frame,
            samples: slot.chunk.shared_samples(),
        });
        Ok(())
    }

    fn stop_all(&mut self) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.buffers.clear();
        }
    }
}
