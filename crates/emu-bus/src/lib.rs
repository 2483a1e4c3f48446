//! Shared clock and bus abstractions for cycle-accurate emulation.
//!
//! Every subsystem counts time in T-states of the CPU clock. The `Clock`
//! is the single monotonic counter they all share; the `Bus` trait is how
//! a CPU reaches memory and I/O while keeping that counter honest.

mod bus;
mod clock;

pub use bus::Bus;
pub use clock::Clock;
