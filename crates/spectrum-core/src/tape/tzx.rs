//! TZX file format parser.
//!
//! TZX wraps tape data in typed blocks with timing metadata. The signal-
//! generating blocks 0x10–0x15 are supported; anything else rejects the
//! file with a diagnostic naming the block, leaving no tape loaded.

use crate::tape::TapeBlock;

/// TZX signature: "ZXTape!" + 0x1A.
const TZX_MAGIC: &[u8; 8] = b"ZXTape!\x1A";

/// A parsed TZX file.
#[derive(Debug, Clone)]
pub struct TzxFile {
    pub major: u8,
    pub minor: u8,
    pub blocks: Vec<TapeBlock>,
}

impl TzxFile {
    /// Parse a TZX image.
    ///
    /// # Errors
    ///
    /// Bad magic, truncation inside a block, or an unsupported block id.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        if data.len() < 10 || &data[..8] != TZX_MAGIC {
            return Err("not a TZX file (bad signature)".to_string());
        }
        let major = data[8];
        let minor = data[9];

        let mut blocks = Vec::new();
        let mut r = Reader {
            data,
            offset: 10,
        };

        while !r.at_end() {
            let block_offset = r.offset;
            let id = r.u8()?;
            let block = match id {
                0x10 => {
                    let pause_ms = r.u16()?;
                    let len = usize::from(r.u16()?);
                    TapeBlock::Standard {
                        data: r.bytes(len)?,
                        pause_ms,
                    }
                }
                0x11 => {
                    let pilot_pulse = r.u16()?;
                    let sync1 = r.u16()?;
                    let sync2 = r.u16()?;
                    let zero_pulse = r.u16()?;
                    let one_pulse = r.u16()?;
                    let pilot_count = r.u16()?;
                    let used_bits = r.u8()?;
                    let pause_ms = r.u16()?;
                    let len = r.u24()?;
                    TapeBlock::Turbo {
                        pilot_pulse,
                        pilot_count,
                        sync1,
                        sync2,
                        zero_pulse,
                        one_pulse,
                        used_bits,
                        pause_ms,
                        data: r.bytes(len)?,
                    }
                }
                0x12 => {
                    let pulse_len = r.u16()?;
                    let count = r.u16()?;
                    TapeBlock::PureTone { pulse_len, count }
                }
                0x13 => {
                    let count = usize::from(r.u8()?);
                    let mut pulses = Vec::with_capacity(count);
                    for _ in 0..count {
                        pulses.push(r.u16()?);
                    }
                    TapeBlock::PulseSequence { pulses }
                }
                0x14 => {
                    let zero_pulse = r.u16()?;
                    let one_pulse = r.u16()?;
                    let used_bits = r.u8()?;
                    let pause_ms = r.u16()?;
                    let len = r.u24()?;
                    TapeBlock::PureData {
                        zero_pulse,
                        one_pulse,
                        used_bits,
                        pause_ms,
                        data: r.bytes(len)?,
                    }
                }
                0x15 => {
                    let tstates_per_sample = r.u16()?;
                    let pause_ms = r.u16()?;
                    let used_bits = r.u8()?;
                    let len = r.u24()?;
                    let samples = r.bytes(len)?;
                    Self::direct_recording(
                        &samples,
                        used_bits,
                        tstates_per_sample,
                        pause_ms,
                    )
                }
                other => {
                    return Err(format!(
                        "TZX block {other:#04X} at offset {block_offset} is not supported"
                    ));
                }
            };
            blocks.push(block);
        }

        Ok(Self {
            major,
            minor,
            blocks,
        })
    }

    /// Convert a direct-recording bit stream into level run lengths.
    fn direct_recording(
        samples: &[u8],
        used_bits: u8,
        tstates_per_sample: u16,
        pause_ms: u16,
    ) -> TapeBlock {
        let used = if used_bits == 0 || used_bits > 8 { 8 } else { used_bits };
        let mut levels = Vec::new();
        for (i, &byte) in samples.iter().enumerate() {
            let bits = if i + 1 == samples.len() { used } else { 8 };
            for bit in 0..bits {
                levels.push(byte & (0x80 >> bit) != 0);
            }
        }

        let initial_level = levels.first().copied().unwrap_or(false);
        let mut durations = Vec::new();
        let mut run: u32 = 0;
        let mut current = initial_level;
        for level in levels {
            if level == current {
                run += u32::from(tstates_per_sample);
            } else {
                durations.push(run);
                current = level;
                run = u32::from(tstates_per_sample);
            }
        }
        if run > 0 {
            durations.push(run);
        }

        TapeBlock::DirectRecording {
            initial_level,
            durations,
            pause_ms,
        }
    }
}

/// Bounds-checked little-endian reader.
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn at_end(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn u8(&mut self) -> Result<u8, String> {
        let v = self
            .data
            .get(self.offset)
            .copied()
            .ok_or_else(|| format!("TZX truncated at offset {}", self.offset))?;
        self.offset += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, String> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from(lo) | (u16::from(hi) << 8))
    }

    fn u24(&mut self) -> Result<usize, String> {
        let lo = self.u8()?;
        let mid = self.u8()?;
        let hi = self.u8()?;
        Ok(usize::from(lo) | (usize::from(mid) << 8) | (usize::from(hi) << 16))
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>, String> {
        if self.offset + len > self.data.len() {
            return Err(format!(
                "TZX truncated: need {len} bytes at offset {}",
                self.offset
            ));
        }
        let v = self.data[self.offset..self.offset + len].to_vec();
        self.offset += len;
        Ok(v)
    }
}
