//! Tape subsystem: block-encoded playback, waveform playback, recording.
//!
//! Playback is deterministic: the player is a state machine over the
//! standard Spectrum signal phases (pilot tone, sync pair, data bits,
//! inter-block pause) that schedules EAR transitions at exact T-states.
//! `update(now)` emits every transition due at or before `now`.

pub mod recorder;
pub mod tap;
pub mod tzx;
pub mod wav;

/// Pilot pulse width in T-states.
pub const PILOT_PULSE: u32 = 2168;
/// First sync pulse width.
pub const SYNC1_PULSE: u32 = 667;
/// Second sync pulse width.
pub const SYNC2_PULSE: u32 = 735;
/// Half-width of a 0 bit.
pub const ZERO_PULSE: u32 = 855;
/// Half-width of a 1 bit.
pub const ONE_PULSE: u32 = 1710;
/// Pilot pulses for a header block (flag byte 0x00).
pub const HEADER_PILOT_COUNT: u32 = 8063;
/// Pilot pulses for a data block.
pub const DATA_PILOT_COUNT: u32 = 3223;
/// T-states per millisecond at 3.5 MHz.
pub const TSTATES_PER_MS: u32 = 3500;

/// One tape block with everything needed to synthesise its pulses.
#[derive(Debug, Clone)]
pub enum TapeBlock {
    /// ROM-timed block: full raw bytes (flag, payload, checksum).
    Standard { data: Vec<u8>, pause_ms: u16 },
    /// Custom-timed block (TZX 0x11).
    Turbo {
        pilot_pulse: u16,
        pilot_count: u16,
        sync1: u16,
        sync2: u16,
        zero_pulse: u16,
        one_pulse: u16,
        used_bits: u8,
        pause_ms: u16,
        data: Vec<u8>,
    },
    /// Repeated single pulse (TZX 0x12).
    PureTone { pulse_len: u16, count: u16 },
    /// Explicit pulse widths (TZX 0x13).
    PulseSequence { pulses: Vec<u16> },
    /// Data without pilot or sync (TZX 0x14).
    PureData {
        zero_pulse: u16,
        one_pulse: u16,
        used_bits: u8,
        pause_ms: u16,
        data: Vec<u8>,
    },
    /// Sampled levels, already converted to run lengths (TZX 0x15).
    DirectRecording {
        initial_level: bool,
        durations: Vec<u32>,
        pause_ms: u16,
    },
}

/// What the player is reading from: a block list (TAP/TZX) or a linear
/// waveform of transition run lengths (WAV).
#[derive(Debug, Clone)]
pub enum TapeSource {
    Blocks(Vec<TapeBlock>),
    Waveform {
        initial_level: bool,
        durations: Vec<u32>,
    },
}

/// An EAR line transition scheduled by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapeTransition {
    pub t_state: u64,
    pub level: bool,
}

/// Signal phase within the current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Between blocks; the next segment request advances the block cursor.
    Idle,
    Pilot { remaining: u32 },
    Sync1,
    Sync2,
    Data { byte: usize, bit: u8, second_half: bool },
    Tone { remaining: u32 },
    PulseSeq { index: usize },
    Direct { index: usize, final_flip: bool },
    Wave { index: usize, final_flip: bool },
    Pause,
    Done,
}

/// One signal segment: what the level does at its start, and how long it
/// lasts.
enum Segment {
    /// Flip the level, hold for the duration.
    Pulse(u32),
    /// Force the level, hold for the duration.
    Set(bool, u32),
}

/// Deterministic tape player.
pub struct TapePlayer {
    source: Option<TapeSource>,
    block_index: usize,
    phase: Phase,
    level: bool,
    playing: bool,
    /// Absolute T-state of the next segment boundary.
    next_transition_t: u64,
    /// T-states left on the in-flight segment when playback stopped.
    paused_remaining_t: u64,
    /// Total tape time consumed, in T-states.
    position_tstates: u64,
    /// Start of the in-flight segment (for position bookkeeping).
    segment_start_t: u64,
}

impl TapePlayer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            source: None,
            block_index: 0,
            phase: Phase::Idle,
            level: true, // fresh tape idles high
            playing: false,
            next_transition_t: 0,
            paused_remaining_t: 0,
            position_tstates: 0,
            segment_start_t: 0,
        }
    }

    /// Insert a tape and rewind it.
    pub fn insert(&mut self, source: TapeSource) {
        if let TapeSource::Waveform { initial_level, .. } = &source {
            self.level = *initial_level;
        } else {
            self.level = true;
        }
        self.source = Some(source);
        self.block_index = 0;
        self.phase = Phase::Idle;
        self.playing = false;
        self.paused_remaining_t = 0;
        self.position_tstates = 0;
    }

    /// Eject the tape.
    pub fn eject(&mut self) {
        self.source = None;
        self.playing = false;
        self.phase = Phase::Idle;
        self.level = true;
        self.position_tstates = 0;
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.source.is_some()
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Current EAR level.
    #[must_use]
    pub fn level(&self) -> bool {
        self.level
    }

    /// Tape position in T-states of signal consumed.
    #[must_use]
    pub fn position_tstates(&self) -> u64 {
        self.position_tstates
    }

    /// Start (or resume) playback at T-state `now`.
    pub fn play(&mut self, now: u64) {
        if self.source.is_none() || self.playing || self.phase == Phase::Done {
            return;
        }
        self.playing = true;
        self.segment_start_t = now;
        self.next_transition_t = now + self.paused_remaining_t;
        self.paused_remaining_t = 0;
    }

    /// Pause playback, remembering the in-flight segment remainder.
    pub fn stop(&mut self, now: u64) {
        if !self.playing {
            return;
        }
        self.playing = false;
        self.paused_remaining_t = self.next_transition_t.saturating_sub(now);
        self.position_tstates += now.saturating_sub(self.segment_start_t);
        self.segment_start_t = now;
    }

    /// Rewind to the start of the tape.
    pub fn rewind(&mut self) {
        self.block_index = 0;
        self.phase = Phase::Idle;
        self.playing = false;
        self.paused_remaining_t = 0;
        self.position_tstates = 0;
        self.level = match &self.source {
            Some(TapeSource::Waveform { initial_level, .. }) => *initial_level,
            _ => true,
        };
    }

    /// Emit every transition due at or before `now` into `out`.
    pub fn update(&mut self, now: u64, out: &mut Vec<TapeTransition>) {
        while self.playing && self.next_transition_t <= now {
            let t = self.next_transition_t;
            self.position_tstates += t - self.segment_start_t;
            self.segment_start_t = t;

            match self.next_segment() {
                Some(Segment::Pulse(d)) => {
                    self.level = !self.level;
                    out.push(TapeTransition {
                        t_state: t,
                        level: self.level,
                    });
                    self.next_transition_t = t + u64::from(d);
                }
                Some(Segment::Set(level, d)) => {
                    if self.level != level {
                        self.level = level;
                        out.push(TapeTransition {
                            t_state: t,
                            level,
                        });
                    }
                    self.next_transition_t = t + u64::from(d);
                }
                None => {
                    self.playing = false;
                    self.phase = Phase::Done;
                }
            }
        }
    }

    /// Advance the phase machine to the next signal segment.
    fn next_segment(&mut self) -> Option<Segment> {
        loop {
            match self.phase {
                Phase::Idle => {
                    if !self.begin_next_block() {
                        return None;
                    }
                }

                Phase::Pilot { remaining } => {
                    if remaining == 0 {
                        self.phase = Phase::Sync1;
                    } else {
                        self.phase = Phase::Pilot {
                            remaining: remaining - 1,
                        };
                        return Some(Segment::Pulse(self.pilot_pulse_len()));
                    }
                }

                Phase::Sync1 => {
                    self.phase = Phase::Sync2;
                    return Some(Segment::Pulse(self.sync_pulse_len(0)));
                }

                Phase::Sync2 => {
                    self.phase = Phase::Data {
                        byte: 0,
                        bit: 0,
                        second_half: false,
                    };
                    return Some(Segment::Pulse(self.sync_pulse_len(1)));
                }

                Phase::Data {
                    byte,
                    bit,
                    second_half,
                } => {
                    let (data_len, used_bits) = self.data_shape();
                    if byte >= data_len {
                        self.phase = Phase::Pause;
                        continue;
                    }
                    let bits_in_byte = if byte + 1 == data_len { used_bits } else { 8 };
                    if bit >= bits_in_byte {
                        self.phase = Phase::Data {
                            byte: byte + 1,
                            bit: 0,
                            second_half: false,
                        };
                        continue;
                    }

                    let pulse = self.bit_pulse_len(byte, bit);
                    self.phase = if second_half {
                        Phase::Data {
                            byte,
                            bit: bit + 1,
                            second_half: false,
                        }
                    } else {
                        Phase::Data {
                            byte,
                            bit,
                            second_half: true,
                        }
                    };
                    return Some(Segment::Pulse(pulse));
                }

                Phase::Tone { remaining } => {
                    if remaining == 0 {
                        self.finish_block();
                    } else {
                        self.phase = Phase::Tone {
                            remaining: remaining - 1,
                        };
                        return Some(Segment::Pulse(self.pilot_pulse_len()));
                    }
                }

                Phase::PulseSeq { index } => {
                    let pulse = match self.current_block() {
                        Some(TapeBlock::PulseSequence { pulses }) => {
                            pulses.get(index).copied()
                        }
                        _ => None,
                    };
                    match pulse {
                        Some(len) => {
                            self.phase = Phase::PulseSeq { index: index + 1 };
                            return Some(Segment::Pulse(u32::from(len)));
                        }
                        None => self.finish_block(),
                    }
                }

                Phase::Direct { index, final_flip } => {
                    let run = match self.current_block() {
                        Some(TapeBlock::DirectRecording {
                            initial_level,
                            durations,
                            ..
                        }) => Some((*initial_level, durations.get(index).copied())),
                        _ => None,
                    };
                    match run {
                        None => self.finish_block(),
                        Some((initial, Some(d))) => {
                            self.phase = Phase::Direct {
                                index: index + 1,
                                final_flip,
                            };
                            return if index == 0 {
                                // The first run forces the recorded level.
                                Some(Segment::Set(initial, d))
                            } else {
                                Some(Segment::Pulse(d))
                            };
                        }
                        Some((_, None)) => {
                            if final_flip {
                                self.phase = Phase::Pause;
                            } else {
                                self.phase = Phase::Direct {
                                    index,
                                    final_flip: true,
                                };
                                return Some(Segment::Pulse(0));
                            }
                        }
                    }
                }

                Phase::Wave { index, final_flip } => {
                    let run = match &self.source {
                        Some(TapeSource::Waveform { durations, .. }) => {
                            Some(durations.get(index).copied())
                        }
                        _ => None,
                    };
                    match run {
                        None => return None,
                        Some(Some(d)) => {
                            self.phase = Phase::Wave {
                                index: index + 1,
                                final_flip,
                            };
                            // A waveform element holds the level for its
                            // duration; the flip lands at the element's
                            // end, i.e. the start of the next segment.
                            return if index == 0 {
                                Some(Segment::Set(self.level, d))
                            } else {
                                Some(Segment::Pulse(d))
                            };
                        }
                        Some(None) => {
                            if final_flip {
                                return None;
                            }
                            self.phase = Phase::Wave {
                                index,
                                final_flip: true,
                            };
                            return Some(Segment::Pulse(0));
                        }
                    }
                }

                Phase::Pause => {
                    let pause_ms = self.pause_ms();
                    self.finish_block();
                    if pause_ms > 0 {
                        let t = u32::from(pause_ms) * TSTATES_PER_MS;
                        return Some(Segment::Set(false, t));
                    }
                }

                Phase::Done => return None,
            }
        }
    }

    /// Step the block cursor and set up the entry phase. Returns false at
    /// end of tape.
    fn begin_next_block(&mut self) -> bool {
        match &self.source {
            Some(TapeSource::Waveform { .. }) => {
                self.phase = Phase::Wave {
                    index: 0,
                    final_flip: false,
                };
                true
            }
            Some(TapeSource::Blocks(blocks)) => {
                let Some(block) = blocks.get(self.block_index) else {
                    return false;
                };
                self.phase = match block {
                    TapeBlock::Standard { data, .. } => {
                        let count = if data.first().copied().unwrap_or(0xFF) == 0x00 {
                            HEADER_PILOT_COUNT
                        } else {
                            DATA_PILOT_COUNT
                        };
                        Phase::Pilot { remaining: count }
                    }
                    TapeBlock::Turbo { pilot_count, .. } => Phase::Pilot {
                        remaining: u32::from(*pilot_count),
                    },
                    TapeBlock::PureTone { count, .. } => Phase::Tone {
                        remaining: u32::from(*count),
                    },
                    TapeBlock::PulseSequence { .. } => Phase::PulseSeq { index: 0 },
                    TapeBlock::PureData { .. } => Phase::Data {
                        byte: 0,
                        bit: 0,
                        second_half: false,
                    },
                    TapeBlock::DirectRecording { .. } => Phase::Direct {
                        index: 0,
                        final_flip: false,
                    },
                };
                true
            }
            None => false,
        }
    }

    /// Leave the current block: back to Idle with the cursor advanced.
    fn finish_block(&mut self) {
        self.block_index += 1;
        self.phase = Phase::Idle;
    }

    fn current_block(&self) -> Option<&TapeBlock> {
        match &self.source {
            Some(TapeSource::Blocks(blocks)) => blocks.get(self.block_index),
            _ => None,
        }
    }

    fn pilot_pulse_len(&self) -> u32 {
        match self.current_block() {
            Some(TapeBlock::Turbo { pilot_pulse, .. }) => u32::from(*pilot_pulse),
            Some(TapeBlock::PureTone { pulse_len, .. }) => u32::from(*pulse_len),
            _ => PILOT_PULSE,
        }
    }

    fn sync_pulse_len(&self, which: usize) -> u32 {
        match self.current_block() {
            Some(TapeBlock::Turbo { sync1, sync2, .. }) => {
                u32::from(if which == 0 { *sync1 } else { *sync2 })
            }
            _ => {
                if which == 0 {
                    SYNC1_PULSE
                } else {
                    SYNC2_PULSE
                }
            }
        }
    }

    /// (data length, used bits in the last byte) of the current block.
    fn data_shape(&self) -> (usize, u8) {
        match self.current_block() {
            Some(TapeBlock::Standard { data, .. }) => (data.len(), 8),
            Some(TapeBlock::Turbo {
                data, used_bits, ..
            })
            | Some(TapeBlock::PureData {
                data, used_bits, ..
            }) => {
                let used = if *used_bits == 0 || *used_bits > 8 {
                    8
                } else {
                    *used_bits
                };
                (data.len(), used)
            }
            _ => (0, 8),
        }
    }

    /// Half-bit pulse width for data bit `bit` (MSB first) of byte `byte`.
    fn bit_pulse_len(&self, byte: usize, bit: u8) -> u32 {
        let (zero, one, value) = match self.current_block() {
            Some(TapeBlock::Standard { data, .. }) => {
                (ZERO_PULSE, ONE_PULSE, data.get(byte).copied().unwrap_or(0))
            }
            Some(TapeBlock::Turbo {
                zero_pulse,
                one_pulse,
                data,
                ..
            })
            | Some(TapeBlock::PureData {
                zero_pulse,
                one_pulse,
                data,
                ..
            }) => (
                u32::from(*zero_pulse),
                u32::from(*one_pulse),
                data.get(byte).copied().unwrap_or(0),
            ),
            _ => (ZERO_PULSE, ONE_PULSE, 0),
        };
        if value & (0x80 >> bit) != 0 { one } else { zero }
    }

    fn pause_ms(&self) -> u16 {
        match self.current_block() {
            Some(TapeBlock::Standard { pause_ms, .. })
            | Some(TapeBlock::Turbo { pause_ms, .. })
            | Some(TapeBlock::PureData { pause_ms, .. })
            | Some(TapeBlock::DirectRecording { pause_ms, .. }) => *pause_ms,
            _ => 0,
        }
    }
}

impl Default for TapePlayer {
    fn default() -> Self {
        Self::new()
    }
}
