//! Logical clocks for timer-driven pipeline stages
//!
//! The segmenter, scheduler and animation driver never read wall time
//! directly. They take a [`Clock`] so tests can drive them with a
//! [`ManualClock`] and production can use the audio device's own clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic time source measured from an arbitrary epoch
pub trait Clock: Send + Sync {
    /// Current time since the clock's epoch
    fn now(&self) -> Duration;
}

/// Wall-clock time since construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Clock advanced explicitly by the caller
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(duration_nanos(by), Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, to: Duration) {
        self.nanos.store(duration_nanos(to), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Audio clock driven by the number of frames an output device has rendered
///
/// The device callback calls [`AudioClock::advance_frames`]; everything else
/// only reads.
#[derive(Debug, Clone)]
pub struct AudioClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl AudioClock {
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate: sample_rate.max(1),
        }
    }

    /// Record frames rendered by the device
    pub fn advance_frames(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Relaxed);
    }

    /// Total frames rendered so far
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Clock for AudioClock {
    fn now(&self) -> Duration {
        frames_to_duration(self.frames(), self.sample_rate)
    }
}

/// Convert a frame count at `sample_rate` into a duration
#[must_use]
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    let rate = u64::from(sample_rate.max(1));
    let secs = frames / rate;
    let rem = frames % rate;
    Duration::from_secs(secs) + Duration::from_nanos(rem * 1_000_000_000 / rate)
}

/// Convert a duration into a frame count at `sample_rate`, rounding down
#[must_use]
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    let nanos = duration.as_nanos() * u128::from(sample_rate);
    u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX)
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_millis(150));
        clock.advance(Duration::from_millis(50));
        assert_eq!(clock.now(), Duration::from_millis(200));

        // Clones share the same time
        let other = clock.clone();
        other.set(Duration::from_secs(3));
        assert_eq!(clock.now(), Duration::from_secs(3));
    }

    #[test]
    fn audio_clock_tracks_rendered_frames() {
        let clock = AudioClock::new(24_000);
        clock.advance_frames(12_000);
        assert_eq!(clock.now(), Duration::from_millis(500));
        clock.advance_frames(2_400);
        assert_eq!(clock.now(), Duration::from_millis(600));
    }

    #[test]
    fn frame_conversions_agree() {
        assert_eq!(frames_to_duration(16_000, 16_000), Duration::from_secs(1));
        assert_eq!(duration_to_frames(Duration::from_millis(100), 24_000), 2_400);
        assert_eq!(
            duration_to_frames(frames_to_duration(4_410, 44_100), 44_100),
            4_410
        );
    }
}
