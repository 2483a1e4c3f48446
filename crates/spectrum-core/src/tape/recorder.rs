//! Tape recording: MIC pulse capture with silence-driven block
//! finalisation, decoded to TAP blocks or rendered to WAV samples.
//!
//! Every MIC transition yields a pulse width; a 0.1 s silence closes the
//! block. TAP output runs the pulses through a pilot/sync/bit-pair
//! decoder; WAV output renders them as ±20,000 sample runs. Two seconds
//! of silence with data pending auto-finalises the whole session.

use std::path::{Path, PathBuf};

use crate::beeper::CPU_HZ;
use crate::tape::{
    ONE_PULSE, PILOT_PULSE, SYNC1_PULSE, SYNC2_PULSE, ZERO_PULSE, tap,
};

/// Output sample magnitude for WAV rendering.
pub const TAPE_WAV_AMPLITUDE: i16 = 20_000;

/// Silence that finalises a block (~0.1 s).
const BLOCK_GAP_TSTATES: u64 = 350_000;

/// Silence that auto-finalises the session (~2 s).
const AUTO_STOP_TSTATES: u64 = 7_000_000;

/// Minimum consecutive pilot-like pulses for TAP decoding.
const MIN_PILOT_RUN: usize = 100;

/// What the recorder produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Tap,
    Wav,
}

/// MIC capture state machine.
pub struct TapeRecorder {
    format: RecordFormat,
    path: Option<PathBuf>,
    append_mode: bool,
    sample_rate: u32,

    recording: bool,
    session_dirty: bool,

    /// Pulse widths of the block being captured.
    pulses: Vec<u32>,
    block_active: bool,
    /// MIC level after the block's opening transition.
    block_level: bool,
    last_level: bool,
    last_transition_t: u64,

    /// Decoded TAP stream for the session.
    tap_data: Vec<u8>,
    /// Rendered PCM for the session (WAV format).
    audio_samples: Vec<i16>,
    /// Fractional sample carry across pulse rendering.
    sample_error: f64,
}

impl TapeRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            format: RecordFormat::Tap,
            path: None,
            append_mode: false,
            sample_rate: 44_100,
            recording: false,
            session_dirty: false,
            pulses: Vec::new(),
            block_active: false,
            block_level: false,
            last_level: false,
            last_transition_t: 0,
            tap_data: Vec::new(),
            audio_samples: Vec::new(),
            sample_error: 0.0,
        }
    }

    /// Begin a TAP capture. `path = None` keeps the session in memory.
    pub fn start_tap(&mut self, path: Option<PathBuf>, append: bool, now: u64) {
        self.begin(RecordFormat::Tap, path, append, now);
    }

    /// Begin a WAV capture at `sample_rate`.
    ///
    /// A fresh capture over an existing file keeps its samples up to the
    /// current tape position and overwrites the tail; append mode leaves
    /// the file alone until the session is written.
    pub fn start_wav(
        &mut self,
        path: Option<PathBuf>,
        append: bool,
        sample_rate: u32,
        tape_position_tstates: u64,
        now: u64,
    ) -> Result<(), String> {
        self.begin(RecordFormat::Wav, path, append, now);
        self.sample_rate = sample_rate;

        if !append
            && let Some(p) = &self.path
            && p.exists()
        {
            let (existing, rate) = super::wav::read_samples(p)?;
            self.sample_rate = rate;
            let head_len = (tape_position_tstates as f64 / (CPU_HZ / f64::from(rate)))
                .round() as usize;
            let keep = head_len.min(existing.len());
            self.audio_samples = existing[..keep].to_vec();
            log::info!(
                "WAV capture keeps {keep} head samples of {}",
                p.display()
            );
        }
        Ok(())
    }

    fn begin(&mut self, format: RecordFormat, path: Option<PathBuf>, append: bool, now: u64) {
        self.format = format;
        self.path = path;
        self.append_mode = append;
        self.recording = true;
        self.session_dirty = false;
        self.pulses.clear();
        self.block_active = false;
        self.last_level = false;
        self.last_transition_t = now;
        self.tap_data.clear();
        self.audio_samples.clear();
        self.sample_error = 0.0;
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    #[must_use]
    pub fn session_dirty(&self) -> bool {
        self.session_dirty
    }

    /// Decoded TAP stream so far (valid after blocks finalise).
    #[must_use]
    pub fn tap_data(&self) -> &[u8] {
        &self.tap_data
    }

    /// Rendered WAV samples so far.
    #[must_use]
    pub fn audio_samples(&self) -> &[i16] {
        &self.audio_samples
    }

    /// Observe the MIC bit of a port 0xFE write at T-state `t`.
    pub fn set_mic(&mut self, t: u64, level: bool) {
        if !self.recording || level == self.last_level {
            return;
        }
        if self.block_active {
            let width = t.saturating_sub(self.last_transition_t);
            self.pulses.push(width.min(u64::from(u32::MAX)) as u32);
        } else {
            self.block_active = true;
            self.block_level = level;
        }
        self.last_level = level;
        self.last_transition_t = t;
    }

    /// Periodic housekeeping: block finalisation on gap, session
    /// auto-stop on prolonged silence.
    pub fn update(&mut self, now: u64) {
        if !self.recording {
            return;
        }
        let silence = now.saturating_sub(self.last_transition_t);
        if self.block_active && silence >= BLOCK_GAP_TSTATES {
            self.finalise_block();
        }
        let pending = !self.tap_data.is_empty() || !self.audio_samples.is_empty();
        if pending && silence >= AUTO_STOP_TSTATES {
            log::info!("tape recorder auto-stop after {silence} T of silence");
            if let Err(e) = self.stop(now) {
                log::warn!("auto-stop write failed: {e}");
            }
        }
    }

    /// Finalise the session: close any open block and write the output.
    ///
    /// # Errors
    ///
    /// A failed write leaves the session dirty; calling `stop` again
    /// retries it.
    pub fn stop(&mut self, _now: u64) -> Result<(), String> {
        if self.block_active {
            self.finalise_block();
        }
        self.recording = false;

        match self.write_output() {
            Ok(()) => {
                self.session_dirty = false;
                Ok(())
            }
            Err(e) => {
                self.session_dirty = true;
                log::warn!("tape session write failed: {e}");
                Err(e)
            }
        }
    }

    /// Close the current block: decode (TAP) or render (WAV).
    fn finalise_block(&mut self) {
        let pulses = core::mem::take(&mut self.pulses);
        self.block_active = false;

        match self.format {
            RecordFormat::Tap => match decode_tap_block(&pulses) {
                Some(bytes) => tap::append_block(&mut self.tap_data, &bytes),
                None => {
                    log::info!(
                        "discarding unrecognisable tape block of {} pulses",
                        pulses.len()
                    );
                }
            },
            RecordFormat::Wav => self.render_pulses(&pulses),
        }
    }

    /// Render a pulse train as PCM runs, followed by the block gap as
    /// silence.
    fn render_pulses(&mut self, pulses: &[u32]) {
        let tstates_per_sample = CPU_HZ / f64::from(self.sample_rate);
        let mut level = self.block_level;
        for &width in pulses {
            let exact = f64::from(width) / tstates_per_sample + self.sample_error;
            let count = exact.floor() as usize;
            self.sample_error = exact - count as f64;
            let value = if level {
                TAPE_WAV_AMPLITUDE
            } else {
                -TAPE_WAV_AMPLITUDE
            };
            self.audio_samples
                .extend(std::iter::repeat_n(value, count));
            level = !level;
        }
        let gap = (BLOCK_GAP_TSTATES as f64 / tstates_per_sample) as usize;
        self.audio_samples.extend(std::iter::repeat_n(0, gap));
    }

    fn write_output(&self) -> Result<(), String> {
        let Some(path) = &self.path else {
            return Ok(()); // in-memory session
        };
        match self.format {
            RecordFormat::Tap => write_tap(path, &self.tap_data, self.append_mode),
            RecordFormat::Wav => {
                if self.append_mode {
                    super::wav::append_samples(path, &self.audio_samples)
                } else {
                    super::wav::write_samples(path, &self.audio_samples, self.sample_rate)
                }
            }
        }
    }
}

impl Default for TapeRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn write_tap(path: &Path, data: &[u8], append: bool) -> Result<(), String> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(append)
        .write(true)
        .truncate(!append)
        .open(path)
        .map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    file.write_all(data)
        .map_err(|e| format!("cannot write {}: {e}", path.display()))
}

/// Tolerance for matching a nominal pulse width: ±25%, floor 200 T.
fn tolerance(nominal: f64) -> f64 {
    (nominal / 4.0).max(200.0)
}

fn matches(pulse: u32, nominal: f64) -> bool {
    (f64::from(pulse) - nominal).abs() <= tolerance(nominal)
}

/// Decode a pulse train as a standard tape block.
///
/// Returns the raw block bytes (flag, payload, checksum) or `None` when
/// the train is not block-shaped.
fn decode_tap_block(pulses: &[u32]) -> Option<Vec<u8>> {
    // 1. Locate a run of at least 100 pilot-like pulses.
    let pilot_nominal = f64::from(PILOT_PULSE);
    let mut run_start = None;
    let mut run_end = 0;
    let mut i = 0;
    while i < pulses.len() {
        if matches(pulses[i], pilot_nominal) {
            let start = i;
            while i < pulses.len() && matches(pulses[i], pilot_nominal) {
                i += 1;
            }
            if i - start >= MIN_PILOT_RUN {
                run_start = Some(start);
                run_end = i;
                break;
            }
        } else {
            i += 1;
        }
    }
    let run_start = run_start?;

    // 2. Derive the speed scale from the measured pilot average.
    let sum: u64 = pulses[run_start..run_end].iter().map(|&p| u64::from(p)).sum();
    let average = sum as f64 / (run_end - run_start) as f64;
    let scale = (average / pilot_nominal).clamp(0.5, 2.0);

    // 3. The next two pulses must be the sync pair.
    let sync1 = *pulses.get(run_end)?;
    let sync2 = *pulses.get(run_end + 1)?;
    if !matches(sync1, f64::from(SYNC1_PULSE) * scale)
        || !matches(sync2, f64::from(SYNC2_PULSE) * scale)
    {
        return None;
    }

    // 4. Pair the rest into bits, best-match against the scaled widths.
    let zero = f64::from(ZERO_PULSE) * scale;
    let one = f64::from(ONE_PULSE) * scale;
    let data_pulses = &pulses[run_end + 2..];

    let mut bits: Vec<bool> = Vec::with_capacity(data_pulses.len() / 2 + 1);
    let mut k = 0;
    while k < data_pulses.len() {
        let p1 = data_pulses[k];
        if k + 1 == data_pulses.len() {
            // The closing edge of the last pulse is swallowed by the
            // block gap; classify the lone half on its own.
            if matches(p1, one) {
                bits.push(true);
            } else if matches(p1, zero) {
                bits.push(false);
            } else {
                return None;
            }
            break;
        }
        let p2 = data_pulses[k + 1];
        let pair = f64::from(p1) + f64::from(p2);

        let fits_zero = matches(p1, zero)
            && matches(p2, zero)
            && (pair - 2.0 * zero).abs() <= tolerance(2.0 * zero);
        let fits_one = matches(p1, one)
            && matches(p2, one)
            && (pair - 2.0 * one).abs() <= tolerance(2.0 * one);

        match (fits_zero, fits_one) {
            (true, false) => bits.push(false),
            (false, true) => bits.push(true),
            (true, true) => bits.push((pair - 2.0 * one).abs() < (pair - 2.0 * zero).abs()),
            (false, false) => return None,
        }
        k += 2;
    }

    // 5. Pack MSB-first into bytes.
    if bits.len() < 8 {
        return None;
    }
    if bits.len() % 8 != 0 {
        log::debug!("dropping {} trailing bits of decoded block", bits.len() % 8);
    }
    let mut bytes = Vec::with_capacity(bits.len() / 8);
    for chunk in bits.chunks_exact(8) {
        let mut byte = 0u8;
        for &bit in chunk {
            byte = (byte << 1) | u8::from(bit);
        }
        bytes.push(byte);
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthesise the pulse train of a standard block as the recorder
    /// would capture it (the final pulse closed by the pause edge).
    fn block_pulses(bytes: &[u8], pilot_count: usize) -> Vec<u32> {
        let mut pulses = vec![PILOT_PULSE; pilot_count];
        pulses.push(SYNC1_PULSE);
        pulses.push(SYNC2_PULSE);
        for &byte in bytes {
            for bit in 0..8 {
                let w = if byte & (0x80 >> bit) != 0 {
                    ONE_PULSE
                } else {
                    ZERO_PULSE
                };
                pulses.push(w);
                pulses.push(w);
            }
        }
        pulses
    }

    #[test]
    fn decode_round_trip() {
        let bytes = tap::build_block(0xFF, &[0x01, 0x02, 0x03]);
        let pulses = block_pulses(&bytes, 3223);
        let decoded = decode_tap_block(&pulses).expect("decodes");
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn decode_handles_missing_final_half_pulse() {
        let bytes = tap::build_block(0x00, &[0xAA, 0x55]);
        let mut pulses = block_pulses(&bytes, 8063);
        pulses.pop(); // the gap swallowed the closing edge
        let decoded = decode_tap_block(&pulses).expect("decodes");
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn decode_scales_to_fast_tapes() {
        // 20% fast: pilot still within the ±25% window, and the derived
        // scale factor carries the sync and bit thresholds along.
        let bytes = tap::build_block(0xFF, &[0xDE, 0xAD]);
        let pulses: Vec<u32> = block_pulses(&bytes, 1000)
            .into_iter()
            .map(|p| (f64::from(p) / 1.2) as u32)
            .collect();
        let decoded = decode_tap_block(&pulses).expect("decodes");
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn decode_rejects_short_pilot() {
        let bytes = tap::build_block(0xFF, &[0x01]);
        let pulses = block_pulses(&bytes, 50); // under the 100 minimum
        assert!(decode_tap_block(&pulses).is_none());
    }

    #[test]
    fn decode_rejects_noise_pair() {
        let bytes = tap::build_block(0xFF, &[0x01]);
        let mut pulses = block_pulses(&bytes, 500);
        let n = pulses.len();
        pulses[n - 4] = 3000; // neither a 0 nor a 1 half
        assert!(decode_tap_block(&pulses).is_none());
    }

    #[test]
    fn mic_transitions_build_pulses() {
        let mut rec = TapeRecorder::new();
        rec.start_tap(None, false, 0);

        rec.set_mic(1000, true); // opens the block
        rec.set_mic(3168, false); // 2168
        rec.set_mic(5336, true); // 2168
        rec.set_mic(5336, true); // no level change: ignored
        assert_eq!(rec.pulses, vec![2168, 2168]);
    }

    #[test]
    fn gap_finalises_block() {
        let mut rec = TapeRecorder::new();
        rec.start_tap(None, false, 0);

        // A full synthetic block arriving as transitions.
        let bytes = tap::build_block(0xFF, &[0x42]);
        let mut t = 1000u64;
        let mut level = true;
        rec.set_mic(t, level);
        for width in block_pulses(&bytes, 3223) {
            t += u64::from(width);
            level = !level;
            rec.set_mic(t, level);
        }

        rec.update(t + 100_000);
        assert!(rec.tap_data().is_empty(), "gap not yet long enough");

        rec.update(t + BLOCK_GAP_TSTATES);
        let tap = tap::TapFile::parse(rec.tap_data()).expect("valid TAP stream");
        assert_eq!(tap.blocks.len(), 1);
        assert_eq!(tap.blocks[0].flag(), 0xFF);
        assert_eq!(tap.blocks[0].payload(), &[0x42]);
    }

    #[test]
    fn auto_stop_after_two_seconds() {
        let mut rec = TapeRecorder::new();
        rec.start_tap(None, false, 0);

        let bytes = tap::build_block(0x00, &[0x01]);
        let mut t = 0u64;
        let mut level = true;
        rec.set_mic(t, level);
        for width in block_pulses(&bytes, 8063) {
            t += u64::from(width);
            level = !level;
            rec.set_mic(t, level);
        }

        rec.update(t + BLOCK_GAP_TSTATES);
        assert!(rec.is_recording());

        rec.update(t + AUTO_STOP_TSTATES);
        assert!(!rec.is_recording(), "session auto-finalised");
        assert!(!rec.tap_data().is_empty());
    }

    #[test]
    fn wav_rendering_produces_runs() {
        let mut rec = TapeRecorder::new();
        rec.start_wav(None, false, 35_000, 0, 0)
            .expect("start");

        // 100 T per sample at 35 kHz: pulses of 1000 T → 10 samples.
        rec.set_mic(0, true);
        rec.set_mic(1000, false);
        rec.set_mic(2000, true);
        rec.update(2000 + BLOCK_GAP_TSTATES);

        let samples = rec.audio_samples();
        assert!(samples.len() >= 20);
        assert!(samples[..10].iter().all(|&s| s == TAPE_WAV_AMPLITUDE));
        assert!(samples[10..20].iter().all(|&s| s == -TAPE_WAV_AMPLITUDE));
        // Gap rendered as silence.
        assert_eq!(samples[samples.len() - 1], 0);
    }
}
