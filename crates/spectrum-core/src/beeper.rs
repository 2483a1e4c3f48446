//! Beeper audio pipeline.
//!
//! The emulation thread records `(T-state, level)` events into a bounded
//! ring; the host audio callback resamples them onto its own timeline.
//! `level` is the sum of three ±1 components (speaker bit, tape playback,
//! tape MIC), so it ranges over {-3, -1, +1, +3}.
//!
//! The consumer advances a fractional cursor by `CPU_HZ / sample_rate`
//! T-states per output sample, drains every event at or before it, and
//! high-passes the result to keep the waveform centred at zero.
//!
//! Producer and consumer drift apart when the emulator outpaces the audio
//! device; the push path trims the backlog once it exceeds the trim
//! threshold, and with audio disabled it silently keeps the cursor close
//! behind the writer.

use std::collections::VecDeque;

/// CPU clock, the producer's time base.
pub const CPU_HZ: f64 = 3_500_000.0;

/// Ring capacity; on overflow the oldest event is dropped.
const RING_CAPACITY: usize = 8192;

/// Target backlog ceiling, in output samples.
const MAX_LATENCY_SAMPLES: f64 = 2048.0;
/// Extra backlog tolerated before the producer intervenes.
const THROTTLE_HEADROOM: f64 = 512.0;
/// Further margin past throttle at which the backlog is trimmed.
const TRIM_MARGIN: f64 = 512.0;

/// Ring-empty gap after which the consumer re-baselines the filter.
const IDLE_RESET_SAMPLES: f64 = 512.0;

/// An event this far behind the previous one forces a full resync
/// (clock reset, snapshot load).
const RESYNC_THRESHOLD_T: u64 = 69_888;

/// One-pole high-pass coefficient.
const HP_ALPHA: f32 = 0.995;

/// Output amplitude per level unit (level spans ±3).
const UNIT_AMPLITUDE: f32 = 4096.0;

/// A speaker level change, timestamped in T-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeeperEvent {
    pub t_state: u64,
    /// Summed component level: -3, -1, +1 or +3.
    pub level: i8,
}

/// The ring plus both cursors. Shared between the emulation thread and
/// the audio callback behind a mutex; all methods are brief.
pub struct BeeperAudio {
    ring: VecDeque<BeeperEvent>,
    enabled: bool,
    cycles_per_sample: f64,
    /// Consumer cursor in T-states (fractional).
    playback_position: f64,
    /// Time of the newest accepted event.
    last_event_t: u64,
    /// Level after all consumed events.
    level: i8,
    hp_x_prev: f32,
    hp_y_prev: f32,
}

impl BeeperAudio {
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            enabled: false,
            cycles_per_sample: CPU_HZ / f64::from(sample_rate),
            playback_position: 0.0,
            last_event_t: 0,
            level: -3,
            hp_x_prev: 0.0,
            hp_y_prev: 0.0,
        }
    }

    /// Enable when a host audio callback is attached; disabled, the push
    /// path keeps the cursor caught up so a later enable starts fresh.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Clear everything (model reconfiguration).
    pub fn reset(&mut self) {
        let rate_preserving = self.cycles_per_sample;
        let enabled = self.enabled;
        *self = Self::new(48_000);
        self.cycles_per_sample = rate_preserving;
        self.enabled = enabled;
    }

    /// Producer side: record a level change at T-state `t`.
    pub fn push(&mut self, mut t: u64, level: i8) {
        if t < self.last_event_t {
            if self.last_event_t - t > RESYNC_THRESHOLD_T {
                // Time went backwards wholesale: resynchronise both
                // cursors to the new timeline.
                log::warn!(
                    "beeper resync: event at {t} is {} T behind the ring",
                    self.last_event_t - t
                );
                self.ring.clear();
                self.playback_position = t as f64;
                self.level = level;
                self.rebaseline();
            } else {
                // Small inversion: promote to the previous event time.
                log::debug!("beeper event clamped forward to {}", self.last_event_t);
                t = self.last_event_t;
            }
        }
        self.last_event_t = t;

        if self.ring.len() == RING_CAPACITY {
            // Overflow drops the oldest event; not an error.
            self.ring.pop_front();
        }
        self.ring.push_back(BeeperEvent { t_state: t, level });

        if self.enabled {
            let latency = (t as f64 - self.playback_position) / self.cycles_per_sample;
            if latency > MAX_LATENCY_SAMPLES + THROTTLE_HEADROOM + TRIM_MARGIN {
                // Trim the backlog down to the throttle threshold.
                let target = t as f64
                    - (MAX_LATENCY_SAMPLES + THROTTLE_HEADROOM) * self.cycles_per_sample;
                log::debug!("beeper backlog trimmed ({latency:.0} samples behind)");
                self.consume_to(target);
                self.rebaseline();
            }
        } else {
            // No audio host: follow the writer at a fixed distance.
            let target = t as f64 - MAX_LATENCY_SAMPLES * self.cycles_per_sample;
            if target > self.playback_position {
                self.consume_to(target);
            }
        }
    }

    /// Consumer side: produce one output sample (i16 scale, pre-mix).
    pub fn next_sample(&mut self) -> f32 {
        self.playback_position += self.cycles_per_sample;
        self.consume_to(self.playback_position);

        let idle_gap = self.playback_position - self.last_event_t as f64;
        if self.ring.is_empty()
            && idle_gap > IDLE_RESET_SAMPLES * self.cycles_per_sample
        {
            // Long silence: flush integrator drift and emit true zero.
            self.rebaseline();
            return 0.0;
        }

        let x = f32::from(self.level) * UNIT_AMPLITUDE;
        let y = x - self.hp_x_prev + HP_ALPHA * self.hp_y_prev;
        self.hp_x_prev = x;
        self.hp_y_prev = y;
        y
    }

    /// Number of events waiting in the ring.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.ring.len()
    }

    /// Level after all consumed events.
    #[must_use]
    pub fn level(&self) -> i8 {
        self.level
    }

    /// Advance the consumer cursor to `pos`, folding in every event at or
    /// before it, in insertion order.
    fn consume_to(&mut self, pos: f64) {
        if pos > self.playback_position {
            self.playback_position = pos;
        }
        while let Some(front) = self.ring.front() {
            if front.t_state as f64 > pos {
                break;
            }
            self.level = front.level;
            self.ring.pop_front();
        }
    }

    /// Point the high-pass filter at the current level so the next sample
    /// starts from silence.
    fn rebaseline(&mut self) {
        self.hp_x_prev = f32::from(self.level) * UNIT_AMPLITUDE;
        self.hp_y_prev = 0.0;
    }
}
