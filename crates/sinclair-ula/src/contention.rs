//! Memory and I/O contention.
//!
//! The ULA shares DRAM with the CPU. During the 192 visible scanlines a
//! CPU access to contended memory stalls until the next free slot. The
//! wait pattern repeats every 8 T-states and differs between the original
//! Sinclair ULA and the later +2A/+3 gate array, whose gate sits one
//! T-state later.

/// T-states per 50 Hz frame.
pub const FRAME_TSTATES: u64 = 69_888;

/// T-states per scanline.
pub const TSTATES_PER_LINE: u64 = 224;

/// Frame phase at which the visible display (and contention) begins:
/// 64 lines × 224 T-states.
pub const DISPLAY_START: u64 = 14_336;

/// Frame phase at which contention ends: `DISPLAY_START` + 192 × 224.
pub const DISPLAY_END: u64 = 57_344;

/// Wait pattern of the original Sinclair ULA (48K and 128K).
const SINCLAIR_PATTERN: [u8; 8] = [6, 5, 4, 3, 2, 1, 0, 0];

/// Wait pattern of the +2A/+3 gate array, shifted by one T-state.
const GATE_ARRAY_PATTERN: [u8; 8] = [0, 6, 5, 4, 3, 2, 1, 0];

/// Flat peripheral wait the +2A/+3 applies to every ULA-port access.
const GATE_ARRAY_IO_WAIT: u8 = 3;

/// Model-specific contention profile.
///
/// `memory_wait` applies once per access to a contended page; which pages
/// are contended is the memory map's business, not this table's.
#[derive(Debug, Clone, Copy)]
pub struct Contention {
    pattern: [u8; 8],
    gate_array: bool,
}

impl Contention {
    /// 48K / 128K profile.
    #[must_use]
    pub const fn sinclair() -> Self {
        Self {
            pattern: SINCLAIR_PATTERN,
            gate_array: false,
        }
    }

    /// +2A / +3 profile.
    #[must_use]
    pub const fn gate_array() -> Self {
        Self {
            pattern: GATE_ARRAY_PATTERN,
            gate_array: true,
        }
    }

    /// Wait states for a contended memory access starting at T-state `t`.
    #[must_use]
    pub fn memory_wait(&self, t: u64) -> u8 {
        let phase = t % FRAME_TSTATES;
        if !(DISPLAY_START..DISPLAY_END).contains(&phase) {
            return 0;
        }
        self.pattern[(phase & 7) as usize]
    }

    /// Wait states for an I/O access to `port` starting at T-state `t`.
    ///
    /// On the Sinclair ULA the pattern applies to ULA-style ports
    /// (A0 = 0) during the display; the gate array instead inserts a flat
    /// 3-T peripheral wait on every ULA-port access.
    #[must_use]
    pub fn io_wait(&self, t: u64, port: u16) -> u8 {
        if port & 1 != 0 {
            return 0;
        }
        if self.gate_array {
            return GATE_ARRAY_IO_WAIT;
        }
        self.memory_wait(t)
    }
}
