//! Standard Sinclair ULA (Uncommitted Logic Array).
//!
//! The ULA combines video, keyboard, beeper and tape interfacing behind
//! port 0xFE, and steals memory cycles from the CPU during the visible
//! display. This crate models it at event granularity: port writes are
//! recorded with their T-state, and a per-frame compositor turns the
//! event log plus screen memory into a framebuffer.
//!
//! # Standalone IC
//!
//! This crate has no dependencies — screen memory is passed in as a slice,
//! keeping it decoupled from any particular banking model.
//!
//! # Timing (48K PAL)
//!
//! - 224 T-states per line, 312 lines per frame → 69,888 T-states
//! - display area: lines 64–255, i.e. T-states 14,336–57,343 of the frame
//! - within a line: T 0–127 fetch the 256-pixel area, the rest is border
//!   and retrace

mod contention;
mod keyboard;
mod palette;
mod video;

pub use contention::{Contention, DISPLAY_END, DISPLAY_START, FRAME_TSTATES, TSTATES_PER_LINE};
pub use keyboard::KeyboardState;
pub use palette::PALETTE;
pub use video::{FB_HEIGHT, FB_WIDTH, FrameBuffer, attr_offset, floating_bus, pixel_offset};

/// A border colour change, timestamped in T-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorderEvent {
    pub t_state: u64,
    /// 3-bit colour index.
    pub colour: u8,
}

/// Cap on recorded border events per frame. A program cannot usefully
/// outpace this; past the cap further writes only update the latch.
const MAX_BORDER_EVENTS: usize = 65_536;

/// ULA front end: port 0xFE state and the border event log.
///
/// The machine's bus decodes the port address and calls in here; the
/// compositor drains the event log once per frame.
pub struct Ula {
    /// Current border colour latch (0–7).
    border: u8,
    /// Border colour changes since the last frame was composed.
    border_events: Vec<BorderEvent>,
    /// Border colour in effect when the current frame began.
    frame_start_border: u8,
    keyboard: KeyboardState,
    /// EAR input level driven by the tape subsystem. Idles high.
    ear_in: bool,
}

impl Ula {
    #[must_use]
    pub fn new() -> Self {
        Self {
            border: 7, // white on power-up
            border_events: Vec::new(),
            frame_start_border: 7,
            keyboard: KeyboardState::new(),
            ear_in: true,
        }
    }

    /// Record a border change from a port 0xFE write at T-state `t`.
    pub fn set_border(&mut self, t: u64, colour: u8) {
        self.border = colour & 0x07;
        if self.border_events.len() < MAX_BORDER_EVENTS {
            self.border_events.push(BorderEvent {
                t_state: t,
                colour: self.border,
            });
        }
    }

    /// Current border colour latch.
    #[must_use]
    pub fn border_colour(&self) -> u8 {
        self.border
    }

    /// Drain the border event log for frame composition: every event
    /// before `frame_end` leaves, later ones (an instruction can overshoot
    /// the frame boundary) stay queued for the next frame. Returns the
    /// drained events plus the colour in effect when the frame began.
    pub fn take_border_events(&mut self, frame_end: u64) -> (u8, Vec<BorderEvent>) {
        let split = self.border_events.partition_point(|e| e.t_state < frame_end);
        let rest = self.border_events.split_off(split);
        let events = core::mem::replace(&mut self.border_events, rest);

        let start = self.frame_start_border;
        self.frame_start_border = events.last().map_or(start, |e| e.colour);
        (start, events)
    }

    /// Read port 0xFE: keyboard half-rows selected by the cleared bits of
    /// `addr_high`, EAR on bit 6, bits 5 and 7 high.
    #[must_use]
    pub fn read_fe(&self, addr_high: u8) -> u8 {
        let keys = self.keyboard.read(addr_high) & 0x1F;
        let ear = if self.ear_in { 0x40 } else { 0x00 };
        keys | 0xA0 | ear
    }

    /// Drive the EAR input from the tape subsystem.
    pub fn set_ear_in(&mut self, level: bool) {
        self.ear_in = level;
    }

    #[must_use]
    pub fn ear_in(&self) -> bool {
        self.ear_in
    }

    #[must_use]
    pub fn keyboard(&self) -> &KeyboardState {
        &self.keyboard
    }

    pub fn keyboard_mut(&mut self) -> &mut KeyboardState {
        &mut self.keyboard
    }

    /// Reset to power-on state (model reconfiguration).
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Ula {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_events_are_recorded_in_order() {
        let mut ula = Ula::new();
        ula.set_border(100, 2);
        ula.set_border(250, 5);
        ula.set_border(300, 0xFF); // masked to 7

        let (start, events) = ula.take_border_events(FRAME_TSTATES);
        assert_eq!(start, 7, "power-on border");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], BorderEvent { t_state: 100, colour: 2 });
        assert_eq!(events[2].colour, 7);
        assert!(events.windows(2).all(|w| w[0].t_state <= w[1].t_state));
    }

    #[test]
    fn frame_start_border_carries_over() {
        let mut ula = Ula::new();
        ula.set_border(10, 3);
        let _ = ula.take_border_events(FRAME_TSTATES);

        let (start, events) = ula.take_border_events(2 * FRAME_TSTATES);
        assert_eq!(start, 3, "second frame starts with the latched colour");
        assert!(events.is_empty());
    }

    #[test]
    fn overshoot_events_stay_for_next_frame() {
        let mut ula = Ula::new();
        ula.set_border(100, 2);
        ula.set_border(FRAME_TSTATES + 5, 4); // past the boundary

        let (_, events) = ula.take_border_events(FRAME_TSTATES);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].colour, 2);

        let (start, events) = ula.take_border_events(2 * FRAME_TSTATES);
        assert_eq!(start, 2, "carry colour from the drained event");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].colour, 4);
    }

    #[test]
    fn read_fe_idle() {
        let ula = Ula::new();
        // No keys, EAR idles high: 0b1111_1111
        assert_eq!(ula.read_fe(0x00), 0xFF);
    }

    #[test]
    fn read_fe_ear_low() {
        let mut ula = Ula::new();
        ula.set_ear_in(false);
        assert_eq!(ula.read_fe(0x00), 0xBF, "bit 6 clear, 5 and 7 high");
    }

    #[test]
    fn read_fe_with_key() {
        let mut ula = Ula::new();
        ula.keyboard_mut().set_key(0, 0, true); // Shift
        let v = ula.read_fe(0xFE); // select row 0
        assert_eq!(v & 0x01, 0, "pressed key reads low");
        assert_eq!(v & 0xA0, 0xA0);
    }
}
