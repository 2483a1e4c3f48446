//! The machine bus: memory access with contention billing, and the
//! model-aware I/O port decode.
//!
//! The bus owns the shared clock. Every access advances it by the base
//! machine-cycle length plus the contention penalty computed at the
//! moment the access begins, so port side effects (border, beeper, MIC)
//! observe exact intra-instruction T-states.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use emu_bus::{Bus, Clock};
use gi_ay_3_8912::Ay3_8912;
use sinclair_ula::{Contention, Ula, floating_bus};

use crate::beeper::BeeperAudio;
use crate::config::SpectrumModel;
use crate::memory::Memory;
use crate::tape::recorder::TapeRecorder;

/// Lock a shared audio structure, surviving a poisoned mutex (the audio
/// thread dying must not take the emulator down).
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bus implementation for the Spectrum family.
pub struct SpectrumBus {
    pub clock: Clock,
    pub memory: Memory,
    pub ula: Ula,
    pub contention: Contention,
    pub recorder: TapeRecorder,
    pub beeper: Arc<Mutex<BeeperAudio>>,
    pub ay: Option<Arc<Mutex<Ay3_8912>>>,
    /// Kempston joystick: bits 0–4 = right, left, down, up, fire.
    pub kempston: u8,

    model: SpectrumModel,
    /// Port 0xFE bit 4 (speaker).
    beeper_bit: bool,
    /// Port 0xFE bit 3 (tape MIC).
    mic_bit: bool,
    /// EAR level driven by tape playback.
    tape_in: bool,
    /// Last raw value written to port 0xFE.
    last_fe: u8,
}

impl SpectrumBus {
    #[must_use]
    pub fn new(
        model: SpectrumModel,
        beeper: Arc<Mutex<BeeperAudio>>,
        ay: Option<Arc<Mutex<Ay3_8912>>>,
    ) -> Self {
        Self {
            clock: Clock::new(),
            memory: Memory::new(model),
            ula: Ula::new(),
            contention: model.contention(),
            recorder: TapeRecorder::new(),
            beeper,
            ay,
            kempston: 0,
            model,
            beeper_bit: false,
            mic_bit: false,
            tape_in: true,
            last_fe: 0,
        }
    }

    #[must_use]
    pub fn model(&self) -> SpectrumModel {
        self.model
    }

    #[must_use]
    pub fn last_fe_write(&self) -> u8 {
        self.last_fe
    }

    /// Drive the EAR input from tape playback at T-state `t`.
    pub fn set_tape_in(&mut self, t: u64, level: bool) {
        if level != self.tape_in {
            self.tape_in = level;
            self.ula.set_ear_in(level);
            self.push_beeper_event(t);
        }
    }

    /// Summed speaker level: each of speaker bit, tape playback and MIC
    /// maps 0 ↦ -1, 1 ↦ +1.
    fn mixed_level(&self) -> i8 {
        let unit = |b: bool| if b { 1i8 } else { -1i8 };
        unit(self.beeper_bit) + unit(self.tape_in) + unit(self.mic_bit)
    }

    fn push_beeper_event(&mut self, t: u64) {
        let level = self.mixed_level();
        lock(&self.beeper).push(t, level);
    }

    /// Port write decode, at the clock's current T-state.
    fn decode_io_write(&mut self, port: u16, value: u8) {
        let t = self.clock.tstates();

        // Port 0xFE (any even address): border, MIC, speaker.
        if port & 0x0001 == 0 {
            self.last_fe = value;
            self.ula.set_border(t, value & 0x07);

            let beeper_bit = value & 0x10 != 0;
            let mic_bit = value & 0x08 != 0;
            if mic_bit != self.mic_bit {
                self.recorder.set_mic(t, mic_bit);
            }
            if beeper_bit != self.beeper_bit || mic_bit != self.mic_bit {
                self.beeper_bit = beeper_bit;
                self.mic_bit = mic_bit;
                self.push_beeper_event(t);
            }
            return;
        }

        // Port 0x7FFD paging latch. The 128K decodes only A15 and A1;
        // the +2A/+3 gate array also checks A14, keeping 0x1FFD writes
        // out of this latch.
        let is_7ffd = if self.model.gate_array() {
            port & 0xC002 == 0x4000
        } else {
            port & 0x8002 == 0
        };
        if is_7ffd {
            self.memory.write_7ffd(value);
        }

        // Port 0x1FFD: +2A/+3 paging latch.
        if port & 0xF002 == 0x1000 {
            self.memory.write_1ffd(value);
        }

        // Port 0xFFFD: AY register latch.
        if port & 0xC002 == 0xC000
            && let Some(ay) = &self.ay
        {
            lock(ay).select_register(value);
        }

        // Port 0xBFFD: AY data write.
        if port & 0xC002 == 0x8000
            && let Some(ay) = &self.ay
        {
            lock(ay).write_data(value);
        }
    }

    /// Port read decode, at the clock's current T-state.
    fn decode_io_read(&mut self, port: u16) -> u8 {
        // Port 0xFE: keyboard + EAR.
        if port & 0x0001 == 0 {
            return self.ula.read_fe((port >> 8) as u8);
        }

        // Kempston joystick.
        if port & 0x00FF == 0x001F {
            return self.kempston;
        }

        // Port 0xFFFD: AY register read-back.
        if port & 0xC002 == 0xC000
            && let Some(ay) = &self.ay
        {
            return lock(ay).read_data();
        }

        // Undecoded port: the Sinclair ULA leaks its video fetches; the
        // +2A/+3 gate array does not.
        if !self.model.gate_array()
            && let Some(value) = floating_bus(self.clock.tstates(), self.memory.screen())
        {
            return value;
        }
        0xFF
    }

    fn memory_wait(&self, addr: u16) -> u32 {
        if self.memory.is_contended(addr) {
            u32::from(self.contention.memory_wait(self.clock.tstates()))
        } else {
            0
        }
    }
}

impl Bus for SpectrumBus {
    fn tstates(&self) -> u64 {
        self.clock.tstates()
    }

    fn tick(&mut self, n: u32) {
        self.clock.advance(n);
    }

    fn fetch(&mut self, addr: u16) -> u8 {
        let wait = self.memory_wait(addr);
        self.clock.advance(wait + 4);
        self.memory.read(addr)
    }

    fn read(&mut self, addr: u16) -> u8 {
        let wait = self.memory_wait(addr);
        self.clock.advance(wait + 3);
        self.memory.read(addr)
    }

    fn write(&mut self, addr: u16, value: u8) {
        let wait = self.memory_wait(addr);
        self.clock.advance(wait + 3);
        self.memory.write(addr, value);
    }

    fn io_read(&mut self, port: u16) -> u8 {
        let wait = u32::from(self.contention.io_wait(self.clock.tstates(), port));
        self.clock.advance(wait);
        let value = self.decode_io_read(port);
        self.clock.advance(4);
        value
    }

    fn io_write(&mut self, port: u16, value: u8) {
        let wait = u32::from(self.contention.io_wait(self.clock.tstates(), port));
        self.clock.advance(wait);
        self.decode_io_write(port, value);
        self.clock.advance(4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bus(model: SpectrumModel) -> SpectrumBus {
        let beeper = Arc::new(Mutex::new(BeeperAudio::new(48_000)));
        let ay = model
            .has_ay()
            .then(|| Arc::new(Mutex::new(Ay3_8912::new(gi_ay_3_8912::AY_CLOCK, 48_000))));
        SpectrumBus::new(model, beeper, ay)
    }

    #[test]
    fn memory_read_write_with_timing() {
        let mut bus = make_bus(SpectrumModel::Spectrum48K);
        bus.write(0x8000, 0xAB);
        assert_eq!(bus.read(0x8000), 0xAB);
        assert_eq!(bus.tstates(), 6, "two uncontended accesses, 3 T each");
    }

    #[test]
    fn contended_access_bills_wait_states() {
        let mut bus = make_bus(SpectrumModel::Spectrum48K);
        // Park the clock at the start of the display: pattern[0] = 6.
        bus.tick(sinclair_ula::DISPLAY_START as u32);
        bus.read(0x4000);
        assert_eq!(
            bus.tstates(),
            sinclair_ula::DISPLAY_START + 6 + 3,
            "6 wait states + 3 T access"
        );
    }

    #[test]
    fn border_write_records_event() {
        let mut bus = make_bus(SpectrumModel::Spectrum48K);
        bus.tick(100);
        bus.io_write(0x00FE, 0x05);
        let (_, events) = bus.ula.take_border_events(1_000_000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].colour, 5);
        assert_eq!(events[0].t_state, 100, "event at the access T-state");
    }

    #[test]
    fn keyboard_read_via_fe() {
        let mut bus = make_bus(SpectrumModel::Spectrum48K);
        bus.ula.keyboard_mut().set_key(0, 0, true);
        let v = bus.io_read(0xFEFE);
        assert_eq!(v & 0x01, 0, "shift pressed reads low");
        assert_eq!(v & 0x40, 0x40, "EAR idles high");
    }

    #[test]
    fn speaker_and_mic_produce_beeper_events() {
        let mut bus = make_bus(SpectrumModel::Spectrum48K);
        bus.io_write(0x00FE, 0x10); // speaker high
        bus.io_write(0x00FE, 0x18); // speaker + MIC high
        bus.io_write(0x00FE, 0x18); // no change: no event
        let pending = lock(&bus.beeper).pending();
        assert_eq!(pending, 2);
        // speaker+1, tape idle +1, mic +1 → +3
        let mut guard = lock(&bus.beeper);
        // Drain both events.
        let _ = guard.next_sample();
        assert_eq!(guard.level(), 3);
    }

    #[test]
    fn paging_via_ports() {
        let mut bus = make_bus(SpectrumModel::Spectrum128K);
        bus.io_write(0x7FFD, 0x01);
        assert_eq!(bus.memory.port_7ffd(), 0x01);

        let mut bus = make_bus(SpectrumModel::SpectrumPlus3);
        bus.io_write(0x1FFD, 0x06);
        assert_eq!(bus.memory.port_1ffd(), 0x06);
        assert_eq!(
            bus.memory.port_7ffd(),
            0,
            "0x1FFD writes stay out of the 0x7FFD latch on the gate array"
        );

        bus.io_write(0x7FFD, 0x05);
        assert_eq!(bus.memory.port_7ffd(), 0x05);
    }

    #[test]
    fn fe_write_not_treated_as_paging() {
        let mut bus = make_bus(SpectrumModel::Spectrum128K);
        // 0x7FFC has A1 and A15 low but is an even port: ULA takes it.
        bus.io_write(0x7FFC, 0x07);
        assert_eq!(bus.memory.port_7ffd(), 0, "even ports never page");
    }

    #[test]
    fn ay_register_file_via_ports() {
        let mut bus = make_bus(SpectrumModel::Spectrum128K);
        bus.io_write(0xFFFD, 7);
        bus.io_write(0xBFFD, 0x3F);
        assert_eq!(bus.io_read(0xFFFD), 0x3F);
    }

    #[test]
    fn kempston_read() {
        let mut bus = make_bus(SpectrumModel::Spectrum48K);
        bus.kempston = 0b0001_0001;
        assert_eq!(bus.io_read(0x001F), 0x11);
    }

    #[test]
    fn floating_bus_on_undecoded_port() {
        let mut bus = make_bus(SpectrumModel::Spectrum48K);
        bus.memory.write(0x4000, 0x3C); // first bitmap byte, bank 5
        // Land the sampling point on display sub-cycle 0.
        bus.tick(sinclair_ula::DISPLAY_START as u32);
        let v = bus.io_read(0x00FF);
        assert_eq!(v, 0x3C);
    }

    #[test]
    fn no_floating_bus_on_plus3() {
        let mut bus = make_bus(SpectrumModel::SpectrumPlus3);
        bus.memory.write(0x4000, 0x3C);
        bus.tick(sinclair_ula::DISPLAY_START as u32);
        let v = bus.io_read(0x00FF);
        assert_eq!(v, 0xFF);
    }

    #[test]
    fn tape_in_drives_ear_and_beeper() {
        let mut bus = make_bus(SpectrumModel::Spectrum48K);
        assert_eq!(bus.io_read(0xFEFE) & 0x40, 0x40);
        bus.set_tape_in(50, false);
        assert_eq!(bus.io_read(0xFEFE) & 0x40, 0x00);
        assert_eq!(lock(&bus.beeper).pending(), 1);
    }
}
