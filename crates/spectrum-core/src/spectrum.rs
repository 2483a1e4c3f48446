//! Top-level Spectrum machine.
//!
//! Owns the CPU, the bus (clock, memory, ULA, contention, AY, beeper,
//! recorder) and the tape player, and drives them a frame at a time:
//! `run_frame()` steps the CPU until 69,888 T-states have elapsed,
//! polling the tape and recorder between instructions, raises the frame
//! interrupt, and composes the framebuffer from the border event log.
//!
//! Audio runs on the consumer's timeline: `audio_pull()` is meant to be
//! called from the host's sample callback and only touches the shared
//! beeper ring and AY state.

use std::path::Path;
use std::sync::{Arc, Mutex};

use gi_ay_3_8912::{AY_CLOCK, Ay3_8912};
use sinclair_ula::{FRAME_TSTATES, FrameBuffer};
use zilog_z80::Z80;

use crate::beeper::BeeperAudio;
use crate::bus::{SpectrumBus, lock};
use crate::config::SpectrumModel;
use crate::input::{KempstonInput, SpectrumKey};
use crate::tape::{TapePlayer, TapeSource, TapeTransition, tap::TapFile, tzx::TzxFile, wav};
use crate::{rom, sna, z80};

/// Default host audio sample rate.
const AUDIO_SAMPLE_RATE: u32 = 48_000;

/// Scale for mixing the AY's ±1.0 output against the beeper's i16 range.
const AY_MIX_AMPLITUDE: f32 = 8192.0;

/// ZX Spectrum system.
pub struct Spectrum {
    cpu: Z80,
    bus: SpectrumBus,
    tape: TapePlayer,
    video: FrameBuffer,
    model: SpectrumModel,
    sample_rate: u32,
    /// Completed frame counter (drives FLASH).
    frame_count: u64,
    /// T-state at which the current frame began.
    frame_base_t: u64,
    shutdown_done: bool,
    /// Scratch buffer for tape transitions.
    transitions: Vec<TapeTransition>,
}

impl Spectrum {
    /// Create a machine of the given model with empty ROM banks.
    #[must_use]
    pub fn new(model: SpectrumModel) -> Self {
        let beeper = Arc::new(Mutex::new(BeeperAudio::new(AUDIO_SAMPLE_RATE)));
        let ay = model
            .has_ay()
            .then(|| Arc::new(Mutex::new(Ay3_8912::new(AY_CLOCK, AUDIO_SAMPLE_RATE))));
        Self {
            cpu: Z80::new(),
            bus: SpectrumBus::new(model, beeper, ay),
            tape: TapePlayer::new(),
            video: FrameBuffer::new(),
            model,
            sample_rate: AUDIO_SAMPLE_RATE,
            frame_count: 0,
            frame_base_t: 0,
            shutdown_done: false,
            transitions: Vec::new(),
        }
    }

    /// Reconfigure as `model`: resets the CPU, clock, paging, ULA state
    /// and AY; contention switches profile. The inserted tape stays in.
    pub fn configure_model(&mut self, model: SpectrumModel) {
        self.model = model;
        self.cpu.reset();

        let beeper = Arc::clone(&self.bus.beeper);
        lock(&beeper).reset();
        let ay = model
            .has_ay()
            .then(|| Arc::new(Mutex::new(Ay3_8912::new(AY_CLOCK, self.sample_rate))));
        self.bus = SpectrumBus::new(model, beeper, ay);

        self.frame_count = 0;
        self.frame_base_t = 0;
        self.tape.rewind();
    }

    #[must_use]
    pub fn model(&self) -> SpectrumModel {
        self.model
    }

    /// Load the model's ROM banks from `path` (merged image or base file
    /// plus `<stem>-N.rom` companions).
    pub fn load_rom(&mut self, path: &Path) -> Result<(), String> {
        let banks = rom::load_rom_banks(path, self.model.rom_banks())?;
        for (n, bank) in banks.iter().enumerate() {
            self.bus.memory.load_rom_bank(n, bank)?;
        }
        Ok(())
    }

    /// Load one ROM bank from bytes (hosts with embedded ROMs, tests).
    pub fn load_rom_bytes(&mut self, bank: usize, data: &[u8]) -> Result<(), String> {
        self.bus.memory.load_rom_bank(bank, data)
    }

    /// Load an SNA or Z80 snapshot, selected by file extension.
    pub fn load_snapshot(&mut self, path: &Path) -> Result<(), String> {
        let data = std::fs::read(path)
            .map_err(|e| format!("cannot read snapshot {}: {e}", path.display()))?;
        match extension(path).as_deref() {
            Some("sna") => sna::load_sna(self, &data),
            Some("z80") => z80::load_z80(self, &data),
            _ => Err(format!(
                "unknown snapshot extension on {}",
                path.display()
            )),
        }
    }

    /// Load a TAP, TZX or WAV tape, selected by file extension. The tape
    /// is inserted but not started.
    pub fn load_tape(&mut self, path: &Path) -> Result<(), String> {
        let source = match extension(path).as_deref() {
            Some("tap") => {
                let data = std::fs::read(path)
                    .map_err(|e| format!("cannot read tape {}: {e}", path.display()))?;
                TapeSource::Blocks(TapFile::parse(&data)?.into_tape_blocks())
            }
            Some("tzx") => {
                let data = std::fs::read(path)
                    .map_err(|e| format!("cannot read tape {}: {e}", path.display()))?;
                TapeSource::Blocks(TzxFile::parse(&data)?.blocks)
            }
            Some("wav") => wav::import(path)?,
            _ => {
                return Err(format!("unknown tape extension on {}", path.display()));
            }
        };
        self.tape.insert(source);
        Ok(())
    }

    /// Insert an already-built tape (hosts with in-memory images, tests).
    pub fn insert_tape(&mut self, source: TapeSource) {
        self.tape.insert(source);
    }

    pub fn tape_play(&mut self) {
        let now = self.bus.clock.tstates();
        self.tape.play(now);
    }

    pub fn tape_stop(&mut self) {
        let now = self.bus.clock.tstates();
        self.tape.stop(now);
    }

    pub fn tape_rewind(&mut self) {
        self.tape.rewind();
    }

    pub fn tape_eject(&mut self) {
        self.tape.eject();
    }

    #[must_use]
    pub fn tape(&self) -> &TapePlayer {
        &self.tape
    }

    /// Start recording MIC output to a TAP file (`None` keeps it in
    /// memory).
    pub fn record_tap(&mut self, path: Option<std::path::PathBuf>, append: bool) {
        let now = self.bus.clock.tstates();
        self.bus.recorder.start_tap(path, append, now);
    }

    /// Start recording MIC output as WAV samples.
    pub fn record_wav(
        &mut self,
        path: Option<std::path::PathBuf>,
        append: bool,
    ) -> Result<(), String> {
        let now = self.bus.clock.tstates();
        let position = self.tape.position_tstates();
        self.bus
            .recorder
            .start_wav(path, append, self.sample_rate, position, now)
    }

    /// Stop recording and write the session out.
    pub fn record_stop(&mut self) -> Result<(), String> {
        let now = self.bus.clock.tstates();
        self.bus.recorder.stop(now)
    }

    /// Update one keyboard half-row: `mask` bits 0–4, 1 = pressed.
    pub fn key_matrix_set(&mut self, row: usize, mask: u8) {
        self.bus.ula.keyboard_mut().set_row(row, mask);
    }

    /// Press a key (stays down until released).
    pub fn press_key(&mut self, key: SpectrumKey) {
        let (row, bit) = key.matrix();
        self.bus.ula.keyboard_mut().set_key(row, bit, true);
    }

    /// Release a key.
    pub fn release_key(&mut self, key: SpectrumKey) {
        let (row, bit) = key.matrix();
        self.bus.ula.keyboard_mut().set_key(row, bit, false);
    }

    /// Release every key.
    pub fn release_all_keys(&mut self) {
        self.bus.ula.keyboard_mut().release_all();
    }

    /// Kempston joystick state: bits 0–4 = right, left, down, up, fire.
    pub fn set_kempston(&mut self, mask: u8) {
        self.bus.kempston = mask & 0x1F;
    }

    /// Press or release one Kempston input.
    pub fn set_kempston_input(&mut self, input: KempstonInput, active: bool) {
        if active {
            self.bus.kempston |= 1 << input.bit();
        } else {
            self.bus.kempston &= !(1 << input.bit());
        }
    }

    /// Execute one instruction, with tape and recorder kept current.
    /// Returns the T-states consumed.
    pub fn step(&mut self) -> u32 {
        let now = self.bus.clock.tstates();
        self.transitions.clear();
        self.tape.update(now, &mut self.transitions);
        for i in 0..self.transitions.len() {
            let tr = self.transitions[i];
            self.bus.set_tape_in(tr.t_state, tr.level);
        }

        let cycles = self.cpu.step(&mut self.bus);

        let now = self.bus.clock.tstates();
        self.bus.recorder.update(now);
        cycles
    }

    /// Raise a maskable interrupt with `data_bus` on the bus (0xFF when
    /// nothing drives it). Returns the T-states consumed, 0 if masked.
    pub fn interrupt(&mut self, data_bus: u8) -> u32 {
        if self.cpu.irq_ready() {
            self.cpu.accept_irq(&mut self.bus, data_bus)
        } else {
            0
        }
    }

    /// Raise a non-maskable interrupt. Returns the T-states consumed.
    pub fn nmi(&mut self) -> u32 {
        self.cpu.accept_nmi(&mut self.bus)
    }

    /// Run one complete 69,888-T frame. Returns the T-states executed
    /// (slightly more than a frame when the last instruction overshoots).
    pub fn run_frame(&mut self) -> u64 {
        let start = self.bus.clock.tstates();
        let frame_end = self.frame_base_t + FRAME_TSTATES;

        // The ULA raises INT at the top of the frame.
        if self.cpu.irq_ready() {
            self.cpu.accept_irq(&mut self.bus, 0xFF);
        }

        while self.bus.clock.tstates() < frame_end {
            self.step();
        }

        self.frame_base_t = frame_end;
        self.frame_count += 1;

        let (start_border, events) = self.bus.ula.take_border_events(frame_end);
        let flash_on = (self.frame_count >> 5) & 1 == 1;
        self.video
            .render(start_border, &events, self.bus.memory.screen(), flash_on);

        self.bus.clock.tstates() - start
    }

    /// The composed frame: 320×288 RGBA pixels.
    #[must_use]
    pub fn poll_frame_output(&self) -> &[u32] {
        self.video.pixels()
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Enable or disable audio consumption (host callback attached?).
    pub fn set_audio_enabled(&mut self, enabled: bool) {
        lock(&self.bus.beeper).set_enabled(enabled);
    }

    /// Host-driven audio pull: fills `out` with interleaved frames of
    /// `channels` samples (beeper mono + AY stereo).
    pub fn audio_pull(&mut self, out: &mut [i16], channels: usize) {
        if channels == 0 {
            return;
        }
        let mut beeper = lock(&self.bus.beeper);
        let mut ay_guard = self.bus.ay.as_ref().map(|a| lock(a));

        for frame in out.chunks_mut(channels) {
            let b = beeper.next_sample();
            let (ay_l, ay_r) = ay_guard
                .as_mut()
                .map_or((0.0, 0.0), |ay| ay.next_sample());
            let left = b + ay_l * AY_MIX_AMPLITUDE;
            let right = b + ay_r * AY_MIX_AMPLITUDE;

            if channels == 1 {
                frame[0] = clamp_i16((left + right) * 0.5);
            } else {
                frame[0] = clamp_i16(left);
                frame[1] = clamp_i16(right);
                for extra in &mut frame[2..] {
                    *extra = 0;
                }
            }
        }
    }

    /// Flush pending writes (tape session) and mark the machine down.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shutdown_done {
            return;
        }
        self.shutdown_done = true;
        if self.bus.recorder.is_recording() {
            let now = self.bus.clock.tstates();
            if let Err(e) = self.bus.recorder.stop(now) {
                log::warn!("shutdown: tape session flush failed: {e}");
            }
        }
    }

    #[must_use]
    pub fn cpu(&self) -> &Z80 {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Z80 {
        &mut self.cpu
    }

    #[must_use]
    pub fn bus(&self) -> &SpectrumBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut SpectrumBus {
        &mut self.bus
    }
}

fn clamp_i16(v: f32) -> i16 {
    v.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_48k() -> Spectrum {
        let mut spec = Spectrum::new(SpectrumModel::Spectrum48K);
        // Minimal ROM: DI; HALT.
        let mut rom = vec![0u8; 0x4000];
        rom[0] = 0xF3;
        rom[1] = 0x76;
        spec.load_rom_bytes(0, &rom).expect("rom");
        spec
    }

    #[test]
    fn run_frame_consumes_a_frame_of_tstates() {
        let mut spec = make_48k();
        let t = spec.run_frame();
        assert!(
            (FRAME_TSTATES..FRAME_TSTATES + 30).contains(&t),
            "expected ~69888 T, got {t}"
        );
        assert_eq!(spec.frame_count(), 1);
    }

    #[test]
    fn frames_stay_aligned_across_overshoot() {
        let mut spec = make_48k();
        for _ in 0..5 {
            spec.run_frame();
        }
        // The frame grid stays fixed even though instructions overshoot.
        assert_eq!(spec.frame_count(), 5);
        let slack = spec.bus().clock.tstates() - 5 * FRAME_TSTATES;
        assert!(slack < 30, "clock overshoot accumulates, slack = {slack}");
    }

    #[test]
    fn framebuffer_has_output_dimensions() {
        let mut spec = make_48k();
        spec.run_frame();
        assert_eq!(spec.poll_frame_output().len(), 320 * 288);
    }

    #[test]
    fn halted_cpu_accepts_frame_interrupt() {
        let mut spec = Spectrum::new(SpectrumModel::Spectrum48K);
        // EI; HALT; then a handler at 0x38 that just returns: we only
        // check the CPU leaves the HALT state on the next frame.
        let mut rom = vec![0u8; 0x4000];
        rom[0] = 0xFB; // EI
        rom[1] = 0x76; // HALT
        rom[0x38] = 0xC9; // RET (stack is garbage; good enough to unhalt)
        spec.load_rom_bytes(0, &rom).expect("rom");

        spec.run_frame();
        assert!(spec.cpu().is_halted());
        spec.run_frame();
        assert!(!spec.cpu().is_halted(), "IRQ at frame top unhalts");
    }

    #[test]
    fn configure_model_resets_paging_and_clock() {
        let mut spec = Spectrum::new(SpectrumModel::Spectrum128K);
        spec.bus_mut().memory.write_7ffd(0x27); // paged + locked
        spec.run_frame();

        spec.configure_model(SpectrumModel::SpectrumPlus3);
        assert_eq!(spec.model(), SpectrumModel::SpectrumPlus3);
        assert!(!spec.bus().memory.paging_locked());
        assert_eq!(spec.bus().clock.tstates(), 0);
        assert_eq!(spec.frame_count(), 0);
    }

    #[test]
    fn key_matrix_reaches_port_read() {
        let mut spec = make_48k();
        spec.key_matrix_set(0, 0x12);
        let v = spec.bus_mut().ula.read_fe(0xFE);
        assert_eq!(v & 0x1F, !0x12 & 0x1F);
    }

    #[test]
    fn logical_keys_press_and_release() {
        let mut spec = make_48k();
        spec.press_key(SpectrumKey::A);
        // Row 1 selected: A9 low.
        assert_eq!(spec.bus().ula.read_fe(0xFD) & 0x01, 0);
        spec.release_key(SpectrumKey::A);
        assert_eq!(spec.bus().ula.read_fe(0xFD) & 0x01, 1);

        spec.press_key(SpectrumKey::Space);
        spec.release_all_keys();
        assert_eq!(spec.bus().ula.read_fe(0x7F), 0xFF);
    }

    #[test]
    fn kempston_inputs_set_bits() {
        let mut spec = make_48k();
        spec.set_kempston_input(KempstonInput::Fire, true);
        spec.set_kempston_input(KempstonInput::Right, true);
        assert_eq!(spec.bus().kempston, 0x11);
        spec.set_kempston_input(KempstonInput::Fire, false);
        assert_eq!(spec.bus().kempston, 0x01);
    }

    #[test]
    fn audio_pull_fills_stereo_frames() {
        let mut spec = Spectrum::new(SpectrumModel::Spectrum128K);
        spec.set_audio_enabled(true);
        let mut out = vec![0i16; 256];
        spec.audio_pull(&mut out, 2);
        // Just exercises the path: silent machine stays near zero.
        assert!(out.iter().all(|&s| s.abs() < 2000));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut spec = make_48k();
        spec.record_tap(None, false);
        spec.shutdown();
        spec.shutdown();
        assert!(!spec.bus().recorder.is_recording());
    }
}
