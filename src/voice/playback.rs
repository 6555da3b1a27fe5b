//! Gapless playback scheduling
//!
//! Synthesis chunks are committed to fixed start times on an audio clock.
//! Playback does not begin until a lead-in of chunks has buffered; after
//! that every chunk is placed directly behind the previous one unless the
//! clock has already passed that point, in which case the schedule snaps
//! forward by the gap recovery time instead of stacking audio in the past.

use std::collections::VecDeque;
use std::time::Duration;

use super::frame::{AudioChunk, rms};
use crate::Result;
use crate::clock::{Clock, duration_to_frames};

/// Tuning for the playback scheduler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackConfig {
    /// Chunks buffered before playback starts
    pub lead_in_chunks: usize,
    /// Head start given to the first slot relative to the clock
    pub minimum_queued_time: Duration,
    /// Offset applied when the schedule has fallen behind the clock
    pub gap_recovery_time: Duration,
    /// Multiplier from RMS level to amplitude before clamping
    pub amplitude_gain: f32,
    /// Span of playing audio measured for each amplitude sample
    pub amplitude_window: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            lead_in_chunks: 5,
            minimum_queued_time: Duration::from_millis(150),
            gap_recovery_time: Duration::from_millis(100),
            amplitude_gain: 4.0,
            amplitude_window: Duration::from_millis(40),
        }
    }
}

/// A chunk committed to a start time on the audio clock
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSlot {
    pub chunk: AudioChunk,
    pub scheduled_start: Duration,
}

impl PlaybackSlot {
    /// Clock time at which the slot finishes
    #[must_use]
    pub fn end(&self) -> Duration {
        self.scheduled_start + self.chunk.duration()
    }
}

/// Destination for scheduled audio
pub trait AudioSink {
    /// Commit a slot for playback at its scheduled start
    ///
    /// # Errors
    ///
    /// Returns error if the output cannot accept the slot
    fn schedule(&mut self, slot: &PlaybackSlot) -> Result<()>;

    /// Halt every scheduled or playing slot immediately
    fn stop_all(&mut self);
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing queued or playing
    Silent,
    /// Chunks arriving, waiting for the lead-in
    Buffering,
    /// Slots committed to the clock
    Playing,
}

/// Result of a render tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    /// Amplitude of the currently playing audio in `[0, 1]`
    pub amplitude: f32,
    /// True on the tick where the owning session fully finished playing
    pub finished: bool,
}

/// Schedules synthesis chunks for gapless playback
pub struct PlaybackScheduler<C, S> {
    config: PlaybackConfig,
    clock: C,
    sink: S,
    session_id: Option<String>,
    session_closed: bool,
    queue: VecDeque<AudioChunk>,
    slots: VecDeque<PlaybackSlot>,
    next_start_time: Duration,
    /// Start of the session's first slot
    speech_start: Option<Duration>,
    state: PlaybackState,
    amplitude: f32,
}

impl<C: Clock, S: AudioSink> PlaybackScheduler<C, S> {
    #[must_use]
    pub const fn new(config: PlaybackConfig, clock: C, sink: S) -> Self {
        Self {
            config,
            clock,
            sink,
            session_id: None,
            session_closed: false,
            queue: VecDeque::new(),
            slots: VecDeque::new(),
            next_start_time: Duration::ZERO,
            speech_start: None,
            state: PlaybackState::Silent,
            amplitude: 0.0,
        }
    }

    /// Bind the scheduler to a synthesis session
    ///
    /// Audio still pending for a different session is discarded.
    pub fn begin_session(&mut self, session_id: &str) {
        if self.session_id.as_deref() == Some(session_id) {
            return;
        }
        if self.session_id.is_some() {
            self.cancel();
        }
        tracing::debug!(session_id, "playback bound to session");
        self.session_id = Some(session_id.to_string());
        self.session_closed = false;
    }

    /// Mark the owning session as done; no further chunks will arrive
    pub fn close_session(&mut self, session_id: &str) {
        if self.session_id.as_deref() == Some(session_id) {
            self.session_closed = true;
            // A short reply may never reach the lead-in count
            self.pump();
        }
    }

    /// Queue a chunk, scheduling it immediately when playback is underway
    pub fn enqueue(&mut self, chunk: AudioChunk) {
        if self.session_id.as_deref() != Some(chunk.session_id.as_str()) {
            tracing::debug!(
                session_id = %chunk.session_id,
                sequence = chunk.sequence,
                "dropping chunk for inactive session"
            );
            return;
        }

        self.queue.push_back(chunk);
        if self.state == PlaybackState::Silent {
            self.state = PlaybackState::Buffering;
        }
        self.pump();
    }

    /// Advance to the clock's current time and sample the amplitude
    pub fn tick(&mut self) -> TickOutcome {
        self.pump();

        let now = self.clock.now();
        while self.slots.front().is_some_and(|slot| slot.end() <= now) {
            self.slots.pop_front();
        }

        self.amplitude = self.measure_amplitude(now);

        let drained = self.slots.is_empty() && self.queue.is_empty();
        let finished = self.state == PlaybackState::Playing && drained && self.session_closed;
        if finished {
            tracing::debug!(session_id = ?self.session_id, "playback finished");
            self.state = PlaybackState::Silent;
            self.amplitude = 0.0;
            self.next_start_time = Duration::ZERO;
            self.speech_start = None;
            self.session_id = None;
            self.session_closed = false;
        }

        TickOutcome {
            amplitude: self.amplitude,
            finished,
        }
    }

    /// Stop immediately and discard everything queued or scheduled
    ///
    /// Returns the session that owned the discarded audio, if any, so the
    /// caller can close it with the synthesis service.
    pub fn cancel(&mut self) -> Option<String> {
        self.sink.stop_all();
        self.queue.clear();
        self.slots.clear();
        self.next_start_time = Duration::ZERO;
        self.speech_start = None;
        self.state = PlaybackState::Silent;
        self.amplitude = 0.0;
        self.session_closed = false;

        let session = self.session_id.take();
        if let Some(id) = &session {
            tracing::debug!(session_id = %id, "playback cancelled");
        }
        session
    }

    #[must_use]
    pub const fn state(&self) -> PlaybackState {
        self.state
    }

    /// Latest amplitude in `[0, 1]`
    #[must_use]
    pub const fn current_amplitude(&self) -> f32 {
        self.amplitude
    }

    /// Clock time at which the next chunk would start
    #[must_use]
    pub const fn next_start_time(&self) -> Duration {
        self.next_start_time
    }

    /// Whether audio is queued or scheduled
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state != PlaybackState::Silent
    }

    /// Fraction of the audio scheduled so far that has already played
    ///
    /// Grows toward 1.0 as the clock catches up with the schedule; more
    /// audio arriving pushes it back down. Zero while nothing is playing.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn speech_progress(&self) -> f32 {
        let Some(start) = self.speech_start else {
            return 0.0;
        };
        let total = self.next_start_time.saturating_sub(start);
        if total.is_zero() {
            return 0.0;
        }
        let played = self.clock.now().saturating_sub(start);
        (played.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0) as f32
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[must_use]
    pub fn pending_slots(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    /// Commit queued chunks to the clock once the lead-in is satisfied
    fn pump(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        if self.state == PlaybackState::Buffering {
            let lead_in_met = self.queue.len() >= self.config.lead_in_chunks.max(1);
            if !lead_in_met && !self.session_closed {
                return;
            }
            self.next_start_time = self.clock.now() + self.config.minimum_queued_time;
            self.speech_start = Some(self.next_start_time);
            self.state = PlaybackState::Playing;
            tracing::debug!(
                buffered = self.queue.len(),
                start_ms = self.next_start_time.as_millis(),
                "playback starting"
            );
        }

        while let Some(chunk) = self.queue.pop_front() {
            let now = self.clock.now();
            if self.next_start_time < now {
                tracing::debug!(
                    behind_ms = (now - self.next_start_time).as_millis(),
                    "playback fell behind, recovering"
                );
                self.next_start_time = now + self.config.gap_recovery_time;
            }

            let slot = PlaybackSlot {
                scheduled_start: self.next_start_time,
                chunk,
            };

            if let Err(e) = self.sink.schedule(&slot) {
                tracing::warn!(
                    error = %e,
                    sequence = slot.chunk.sequence,
                    "failed to schedule chunk, skipping"
                );
                continue;
            }

            self.next_start_time = slot.end();
            self.slots.push_back(slot);
        }
    }

    /// RMS of the playing slot over the amplitude window, scaled and clamped
    fn measure_amplitude(&self, now: Duration) -> f32 {
        let Some(slot) = self
            .slots
            .iter()
            .find(|slot| slot.scheduled_start <= now && now < slot.end())
        else {
            return 0.0;
        };

        let rate = slot.chunk.sample_rate();
        let samples = slot.chunk.samples();
        let offset = usize::try_from(duration_to_frames(now - slot.scheduled_start, rate))
            .unwrap_or(usize::MAX)
            .min(samples.len());
        let window = usize::try_from(duration_to_frames(self.config.amplitude_window, rate))
            .unwrap_or(usize::MAX)
            .max(1);
        let end = offset.saturating_add(window).min(samples.len());

        (rms(&samples[offset..end]) * self.config.amplitude_gain).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Default)]
    struct Recorder {
        scheduled: Vec<Duration>,
        stops: usize,
    }

    impl AudioSink for Recorder {
        fn schedule(&mut self, slot: &PlaybackSlot) -> Result<()> {
            self.scheduled.push(slot.scheduled_start);
            Ok(())
        }

        fn stop_all(&mut self) {
            self.stops += 1;
        }
    }

    fn chunk(session: &str, seq: u64, ms: u64, level: f32) -> AudioChunk {
        let n = usize::try_from(24 * ms).unwrap();
        AudioChunk::new(session, seq, vec![level; n], 24_000)
    }

    #[test]
    fn short_reply_starts_when_session_closes() {
        let clock = ManualClock::new();
        let mut scheduler =
            PlaybackScheduler::new(PlaybackConfig::default(), clock.clone(), Recorder::default());
        scheduler.begin_session("s1");

        scheduler.enqueue(chunk("s1", 0, 100, 0.1));
        scheduler.enqueue(chunk("s1", 1, 100, 0.1));
        assert_eq!(scheduler.state(), PlaybackState::Buffering);
        assert!(scheduler.sink().scheduled.is_empty());

        scheduler.close_session("s1");
        assert_eq!(scheduler.state(), PlaybackState::Playing);
        assert_eq!(
            scheduler.sink().scheduled,
            vec![Duration::from_millis(150), Duration::from_millis(250)]
        );
    }

    #[test]
    fn amplitude_follows_playing_audio_and_resets_when_finished() {
        let clock = ManualClock::new();
        let mut scheduler =
            PlaybackScheduler::new(PlaybackConfig::default(), clock.clone(), Recorder::default());
        scheduler.begin_session("s1");
        scheduler.enqueue(chunk("s1", 0, 100, 0.1));
        scheduler.close_session("s1");

        // Before the slot starts nothing is audible
        assert!(scheduler.tick().amplitude < f32::EPSILON);

        clock.set(Duration::from_millis(180));
        let outcome = scheduler.tick();
        assert!((outcome.amplitude - 0.4).abs() < 1e-4);
        assert!(!outcome.finished);

        clock.set(Duration::from_millis(260));
        let outcome = scheduler.tick();
        assert!(outcome.finished);
        assert!(outcome.amplitude < f32::EPSILON);
        assert_eq!(scheduler.state(), PlaybackState::Silent);
    }

    #[test]
    fn loud_audio_is_clamped() {
        let clock = ManualClock::new();
        let mut scheduler =
            PlaybackScheduler::new(PlaybackConfig::default(), clock.clone(), Recorder::default());
        scheduler.begin_session("s1");
        scheduler.enqueue(chunk("s1", 0, 100, 0.9));
        scheduler.close_session("s1");

        clock.set(Duration::from_millis(200));
        assert!((scheduler.tick().amplitude - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn chunks_for_other_sessions_are_dropped() {
        let clock = ManualClock::new();
        let mut scheduler =
            PlaybackScheduler::new(PlaybackConfig::default(), clock, Recorder::default());
        scheduler.enqueue(chunk("nobody", 0, 100, 0.1));
        assert_eq!(scheduler.state(), PlaybackState::Silent);

        scheduler.begin_session("s2");
        scheduler.enqueue(chunk("s1", 0, 100, 0.1));
        assert_eq!(scheduler.state(), PlaybackState::Silent);
    }

    #[test]
    fn switching_sessions_discards_old_audio() {
        let clock = ManualClock::new();
        let mut scheduler =
            PlaybackScheduler::new(PlaybackConfig::default(), clock, Recorder::default());
        scheduler.begin_session("s1");
        scheduler.enqueue(chunk("s1", 0, 100, 0.1));

        scheduler.begin_session("s2");
        assert_eq!(scheduler.sink().stops, 1);
        assert_eq!(scheduler.session_id(), Some("s2"));
        assert_eq!(scheduler.state(), PlaybackState::Silent);
    }

    #[test]
    fn speech_progress_tracks_the_clock_through_the_schedule() {
        let clock = ManualClock::new();
        let mut scheduler =
            PlaybackScheduler::new(PlaybackConfig::default(), clock.clone(), Recorder::default());
        scheduler.begin_session("s1");
        scheduler.enqueue(chunk("s1", 0, 100, 0.1));
        scheduler.enqueue(chunk("s1", 1, 100, 0.1));
        assert!(scheduler.speech_progress() < f32::EPSILON);

        scheduler.close_session("s1");
        clock.set(Duration::from_millis(250));
        assert!((scheduler.speech_progress() - 0.5).abs() < 1e-4);

        clock.set(Duration::from_millis(400));
        assert!((scheduler.speech_progress() - 1.0).abs() < f32::EPSILON);
        scheduler.tick();
        assert!(scheduler.speech_progress() < f32::EPSILON);
    }

    #[test]
    fn cancel_before_anything_started_is_safe() {
        let clock = ManualClock::new();
        let mut scheduler =
            PlaybackScheduler::new(PlaybackConfig::default(), clock, Recorder::default());
        assert_eq!(scheduler.cancel(), None);
        assert_eq!(scheduler.next_start_time(), Duration::ZERO);
        assert!(!scheduler.tick().finished);
    }
}
