//! Frame composition and the floating bus.
//!
//! The compositor runs once per frame: it walks the border event log to
//! paint the surround, and decodes the 6144-byte bitmap plus 768
//! attribute bytes for the pixel area, applying FLASH.
//!
//! # Framebuffer
//!
//! 320×288 pixels: 256 active + 32 border either side, 192 active + 48
//! border above and below.
//!
//! # Screen memory layout
//!
//! Bitmap offset: `((y & 0xC0) << 5) | ((y & 7) << 8) | ((y & 0x38) << 2) | x`
//! Attribute offset (after the 6144-byte bitmap): `(y >> 3) * 32 + x`

use crate::BorderEvent;
use crate::contention::{DISPLAY_START, FRAME_TSTATES, TSTATES_PER_LINE};
use crate::palette::PALETTE;

/// Framebuffer width in pixels.
pub const FB_WIDTH: usize = 320;
/// Framebuffer height in pixels.
pub const FB_HEIGHT: usize = 288;

/// Horizontal border width in pixels.
const BORDER_SIDE: usize = 32;
/// First frame line that reaches the framebuffer (top border).
const FIRST_VISIBLE_LINE: usize = 16;
/// First line of the 192-line pixel area.
const FIRST_SCREEN_LINE: usize = 64;
/// Byte offset of the attribute area within screen memory.
const ATTR_BASE: usize = 0x1800;

/// Bitmap byte offset of character column `x` on screen line `y`,
/// using the classic Spectrum address scramble.
#[must_use]
pub fn pixel_offset(y: u8, x: u8) -> usize {
    ((usize::from(y) & 0xC0) << 5)
        | ((usize::from(y) & 0x07) << 8)
        | ((usize::from(y) & 0x38) << 2)
        | usize::from(x)
}

/// Attribute byte offset (relative to the attribute area) of character
/// column `x` on screen line `y`.
#[must_use]
pub fn attr_offset(y: u8, x: u8) -> usize {
    (usize::from(y) >> 3) * 32 + usize::from(x)
}

/// The byte the ULA is fetching at T-state `t`, or `None` when the data
/// bus floats high (border, retrace, idle sub-cycles).
///
/// Within each 8-T fetch group the ULA reads bitmap, attribute, bitmap+1,
/// attribute+1 on sub-cycles 0–3 and idles on 4–7. `screen` must be the
/// *current* screen bank, whatever the paging says.
#[must_use]
pub fn floating_bus(t: u64, screen: &[u8]) -> Option<u8> {
    let phase = t % FRAME_TSTATES;
    if phase < DISPLAY_START {
        return None;
    }
    let display = phase - DISPLAY_START;
    let line = display / TSTATES_PER_LINE;
    let t_in_line = display % TSTATES_PER_LINE;
    if line >= 192 || t_in_line >= 128 {
        return None;
    }

    let sub = t_in_line & 7;
    if sub >= 4 {
        return None;
    }

    let col = ((t_in_line / 8) * 2 + sub / 2) as u8;
    let y = line as u8;
    let offset = if sub & 1 == 0 {
        pixel_offset(y, col)
    } else {
        ATTR_BASE + attr_offset(y, col)
    };
    screen.get(offset).copied()
}

/// Per-frame compositor output: a 320×288 RGBA framebuffer.
pub struct FrameBuffer {
    pixels: Vec<u32>,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pixels: vec![PALETTE[0]; FB_WIDTH * FB_HEIGHT],
        }
    }

    /// The composed frame, row-major RGBA.
    #[must_use]
    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    /// Compose one frame.
    ///
    /// `start_border` is the border colour in effect at the top of the
    /// frame; `events` the (time-ordered) changes since; `screen` the
    /// 6912-byte screen memory of the current screen bank; `flash_on`
    /// whether FLASH cells are currently inverted.
    pub fn render(
        &mut self,
        start_border: u8,
        events: &[BorderEvent],
        screen: &[u8],
        flash_on: bool,
    ) {
        for fb_y in 0..FB_HEIGHT {
            let line = fb_y + FIRST_VISIBLE_LINE;
            let in_screen_rows =
                (FIRST_SCREEN_LINE..FIRST_SCREEN_LINE + 192).contains(&line);

            for fb_x in 0..FB_WIDTH {
                let colour = if in_screen_rows
                    && (BORDER_SIDE..FB_WIDTH - BORDER_SIDE).contains(&fb_x)
                {
                    let y = (line - FIRST_SCREEN_LINE) as u8;
                    let px = fb_x - BORDER_SIDE;
                    let col = (px / 8) as u8;
                    let bit = 7 - (px % 8);

                    let bitmap = screen[pixel_offset(y, col)];
                    let attr = screen[ATTR_BASE + attr_offset(y, col)];

                    let flash = attr & 0x80 != 0;
                    let bright = if attr & 0x40 != 0 { 8 } else { 0 };
                    let paper = (attr >> 3) & 0x07;
                    let ink = attr & 0x07;

                    let (fg, bg) = if flash && flash_on {
                        (paper, ink)
                    } else {
                        (ink, paper)
                    };

                    if bitmap & (1 << bit) != 0 {
                        PALETTE[usize::from(fg + bright)]
                    } else {
                        PALETTE[usize::from(bg + bright)]
                    }
                } else {
                    let t = Self::border_tstate(line, fb_x);
                    let c = Self::border_colour_at(start_border, events, t);
                    PALETTE[usize::from(c)]
                };

                self.pixels[fb_y * FB_WIDTH + fb_x] = colour;
            }
        }
    }

    /// Frame T-state at which the beam draws border pixel (`line`, `fb_x`).
    ///
    /// Horizontal beam order in T-states within a line: 0–127 pixel area
    /// (and right border rows), 128–143 right border, 144–207 retrace,
    /// 208–223 left border of the framebuffer row.
    fn border_tstate(line: usize, fb_x: usize) -> u64 {
        let t_in_line = if fb_x < BORDER_SIDE {
            208 + fb_x / 2
        } else {
            (fb_x - BORDER_SIDE) / 2
        };
        (line as u64) * TSTATES_PER_LINE + t_in_line as u64
    }

    /// Border colour in effect at frame T-state `t`: the last event at or
    /// before `t`, else the frame's starting colour.
    fn border_colour_at(start: u8, events: &[BorderEvent], t: u64) -> u8 {
        let idx = events.partition_point(|e| e.t_state % FRAME_TSTATES <= t);
        if idx == 0 {
            start
        } else {
            events[idx - 1].colour
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
