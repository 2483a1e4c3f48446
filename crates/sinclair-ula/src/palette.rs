//! ZX Spectrum 16-colour palette.
//!
//! The ULA outputs 15 unique colours (black appears twice) from a 3-bit
//! RGB scheme with a BRIGHT modifier. Non-bright colours use a reduced
//! intensity (0xCD), bright colours full intensity.

/// RGBA palette (R in the low byte, opaque alpha): 8 normal + 8 bright.
///
/// Index layout: `bright_bit << 3 | colour_3bit`.
/// Colour order: black, blue, red, magenta, green, cyan, yellow, white.
pub const PALETTE: [u32; 16] = [
    // Normal (bright = 0)
    0xFF00_0000, // 0: black
    0xFFCD_0000, // 1: blue
    0xFF00_00CD, // 2: red
    0xFFCD_00CD, // 3: magenta
    0xFF00_CD00, // 4: green
    0xFFCD_CD00, // 5: cyan
    0xFF00_CDCD, // 6: yellow
    0xFFCD_CDCD, // 7: white
    // Bright (bright = 1)
    0xFF00_0000, // 8: black
    0xFFFF_0000, // 9: bright blue
    0xFF00_00FF, // 10: bright red
    0xFFFF_00FF, // 11: bright magenta
    0xFF00_FF00, // 12: bright green
    0xFFFF_FF00, // 13: bright cyan
    0xFF00_FFFF, // 14: bright yellow
    0xFFFF_FFFF, // 15: bright white
];
