//! Audio capture from microphone

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;

use super::frame::AudioFrame;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per emitted frame (32 ms at 16kHz)
pub const DEFAULT_FRAME_SIZE: usize = 512;

/// Frames buffered between the device callback and the pipeline loop
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Device input chunk fed to the resampler
const RESAMPLER_CHUNK: usize = 1024;

/// Owns the microphone stream and emits fixed-size mono frames
pub struct AudioCaptureSource {
    device: Device,
    config: StreamConfig,
    frame_size: usize,
    stream: Option<Stream>,
}

impl AudioCaptureSource {
    /// Open the default input device
    ///
    /// Prefers a native mono 16kHz config and falls back to the device
    /// default, which is then downmixed and resampled.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no usable input device exists
    pub fn open(frame_size: usize) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

        let native = device
            .supported_input_configs()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            });

        let config = match native {
            Some(supported) => supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config(),
            None => device
                .default_input_config()
                .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
                .config(),
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate = config.sample_rate.0,
            channels = config.channels,
            frame_size,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            frame_size: frame_size.max(1),
            stream: None,
        })
    }

    /// Start capturing, returning the frame receiver
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started
    pub fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.stream.is_some() {
            return Err(Error::DeviceUnavailable(
                "microphone already owned by this capture source".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let mut assembler = FrameAssembler::new(
            self.config.sample_rate.0,
            usize::from(self.config.channels),
            self.frame_size,
        )?;

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for frame in assembler.push(data) {
                        if tx.try_send(frame).is_err() {
                            tracing::warn!("capture channel full, dropping frame");
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(rx)
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// Sample rate of emitted frames
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

/// Turns interleaved device buffers into fixed-size 16kHz mono frames
pub struct FrameAssembler {
    channels: usize,
    frame_size: usize,
    resampler: Option<FftFixedIn<f32>>,
    pending_in: Vec<f32>,
    pending_out: Vec<f32>,
}

impl FrameAssembler {
    /// Build an assembler for a device running at `device_rate` with `channels`
    ///
    /// # Errors
    ///
    /// Returns error if a resampler cannot be constructed for the rate pair
    pub fn new(device_rate: u32, channels: usize, frame_size: usize) -> Result<Self> {
        let resampler = if device_rate == SAMPLE_RATE {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                device_rate as usize,
                SAMPLE_RATE as usize,
                RESAMPLER_CHUNK,
                2,
                1,
            )
            .map_err(|e| Error::Audio(format!("resampler setup failed: {e}")))?;
            Some(resampler)
        };

        Ok(Self {
            channels: channels.max(1),
            frame_size: frame_size.max(1),
            resampler,
            pending_in: Vec::new(),
            pending_out: Vec::new(),
        })
    }

    /// Feed interleaved device samples, returning any completed frames
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<AudioFrame> {
        let mono = downmix(interleaved, self.channels);

        match self.resampler.as_mut() {
            None => self.pending_out.extend_from_slice(&mono),
            Some(resampler) => {
                self.pending_in.extend_from_slice(&mono);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.pending_in.len() < needed {
                        break;
                    }
                    let chunk: Vec<f32> = self.pending_in.drain(..needed).collect();
                    match resampler.process(std::slice::from_ref(&chunk), None) {
                        Ok(mut out) => {
                            if let Some(channel) = out.pop() {
                                self.pending_out.extend_from_slice(&channel);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "resampling failed, dropping input");
                        }
                    }
                }
            }
        }

        let mut frames = Vec::new();
        while self.pending_out.len() >= self.frame_size {
            let samples: Vec<f32> = self.pending_out.drain(..self.frame_size).collect();
            frames.push(AudioFrame::new(samples, SAMPLE_RATE));
        }
        frames
    }
}

/// Average interleaved channels into mono
#[allow(clippy::cast_precision_loss)]
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_emits_fixed_frames_without_resampling() {
        let mut assembler = FrameAssembler::new(SAMPLE_RATE, 1, 160).unwrap();

        assert!(assembler.push(&[0.1; 100]).is_empty());
        let frames = assembler.push(&[0.1; 300]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 160));
        assert!(frames.iter().all(|f| f.sample_rate() == SAMPLE_RATE));
    }

    #[test]
    fn assembler_downmixes_stereo() {
        let mut assembler = FrameAssembler::new(SAMPLE_RATE, 2, 4).unwrap();
        let frames = assembler.push(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0, 0.2, 0.4]);
        assert_eq!(frames.len(), 1);
        let s = frames[0].samples();
        assert!((s[0] - 0.5).abs() < 1e-6);
        assert!((s[1] - 0.5).abs() < 1e-6);
        assert!(s[2].abs() < 1e-6);
        assert!((s[3] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn assembler_resamples_to_speech_rate() {
        let mut assembler = FrameAssembler::new(48_000, 1, 160).unwrap();

        // One second at 48kHz should yield close to one second at 16kHz
        let mut total = 0;
        for _ in 0..48 {
            total += assembler.push(&[0.0; 1000]).len() * 160;
        }
        assert!(total > 14_000, "got {total} samples");
        assert!(total <= 16_000, "got {total} samples");
    }
}
