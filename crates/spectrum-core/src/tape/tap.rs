//! TAP file format: parser and writer.
//!
//! TAP is the simplest Spectrum tape container: sequential blocks, each
//! preceded by a 2-byte little-endian length. Block bytes are the raw
//! tape stream — flag byte, payload, XOR checksum — and are played back
//! verbatim, so the parser keeps them intact.

use crate::tape::TapeBlock;

/// Pause appended after every TAP block, in milliseconds.
pub const TAP_PAUSE_MS: u16 = 1000;

/// One raw TAP block: flag + payload + checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapBlockBytes {
    pub bytes: Vec<u8>,
}

impl TapBlockBytes {
    /// Flag byte: 0x00 = header, 0xFF = data.
    #[must_use]
    pub fn flag(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }

    /// Payload between the flag and the checksum.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        if self.bytes.len() < 2 {
            &[]
        } else {
            &self.bytes[1..self.bytes.len() - 1]
        }
    }
}

/// A parsed TAP file.
#[derive(Debug, Clone)]
pub struct TapFile {
    pub blocks: Vec<TapBlockBytes>,
}

impl TapFile {
    /// Parse a TAP image.
    ///
    /// # Errors
    ///
    /// Truncated length words, short blocks and checksum mismatches all
    /// reject the file.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        let mut blocks = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            if offset + 2 > data.len() {
                return Err(format!(
                    "truncated TAP file: expected 2-byte length at offset {offset}"
                ));
            }
            let block_len =
                usize::from(u16::from(data[offset]) | (u16::from(data[offset + 1]) << 8));
            offset += 2;

            if block_len < 2 {
                return Err(format!(
                    "TAP block at offset {} has length {block_len}, minimum is 2",
                    offset - 2
                ));
            }
            if offset + block_len > data.len() {
                return Err(format!(
                    "truncated TAP block at offset {}: need {block_len} bytes, {} remain",
                    offset - 2,
                    data.len() - offset
                ));
            }

            let bytes = &data[offset..offset + block_len];
            let mut checksum = 0u8;
            for &b in &bytes[..block_len - 1] {
                checksum ^= b;
            }
            if checksum != bytes[block_len - 1] {
                return Err(format!(
                    "TAP block at offset {}: checksum mismatch (expected {checksum:#04X}, got {:#04X})",
                    offset - 2,
                    bytes[block_len - 1]
                ));
            }

            blocks.push(TapBlockBytes {
                bytes: bytes.to_vec(),
            });
            offset += block_len;
        }

        Ok(Self { blocks })
    }

    /// Convert into playback blocks with the standard TAP pause.
    #[must_use]
    pub fn into_tape_blocks(self) -> Vec<TapeBlock> {
        self.blocks
            .into_iter()
            .map(|b| TapeBlock::Standard {
                data: b.bytes,
                pause_ms: TAP_PAUSE_MS,
            })
            .collect()
    }
}

/// Append one raw block (flag..checksum) to a TAP byte stream.
pub fn append_block(out: &mut Vec<u8>, block: &[u8]) {
    let len = block.len() as u16;
    out.push(len as u8);
    out.push((len >> 8) as u8);
    out.extend_from_slice(block);
}

/// Build a raw block from a flag and payload, computing the checksum.
#[must_use]
pub fn build_block(flag: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + 2);
    bytes.push(flag);
    bytes.extend_from_slice(payload);
    let mut checksum = 0u8;
    for &b in &bytes {
        checksum ^= b;
    }
    bytes.push(checksum);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tap(blocks: &[(u8, &[u8])]) -> Vec<u8> {
        let mut raw = Vec::new();
        for &(flag, payload) in blocks {
            append_block(&mut raw, &build_block(flag, payload));
        }
        raw
    }

    #[test]
    fn parse_empty_file() {
        let tap = TapFile::parse(&[]).expect("empty file is valid");
        assert!(tap.blocks.is_empty());
    }

    #[test]
    fn parse_single_block() {
        let raw = make_tap(&[(0x00, &[1, 2, 3, 4, 5])]);
        let tap = TapFile::parse(&raw).expect("should parse");
        assert_eq!(tap.blocks.len(), 1);
        assert_eq!(tap.blocks[0].flag(), 0x00);
        assert_eq!(tap.blocks[0].payload(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn parse_two_blocks() {
        let raw = make_tap(&[(0x00, &[0x11, 0x22]), (0xFF, &[0xAA, 0xBB, 0xCC])]);
        let tap = TapFile::parse(&raw).expect("should parse");
        assert_eq!(tap.blocks.len(), 2);
        assert_eq!(tap.blocks[1].flag(), 0xFF);
        assert_eq!(tap.blocks[1].payload(), &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn raw_bytes_keep_flag_and_checksum() {
        let raw = make_tap(&[(0xFF, &[0x01])]);
        let tap = TapFile::parse(&raw).expect("should parse");
        assert_eq!(tap.blocks[0].bytes, vec![0xFF, 0x01, 0xFE]);
    }

    #[test]
    fn parse_truncated_length() {
        assert!(TapFile::parse(&[0x05]).is_err());
    }

    #[test]
    fn parse_truncated_block() {
        assert!(TapFile::parse(&[0x05, 0x00, 0x00, 0x01, 0x02]).is_err());
    }

    #[test]
    fn parse_bad_checksum() {
        let mut raw = make_tap(&[(0x00, &[1, 2, 3])]);
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(TapFile::parse(&raw).is_err());
    }

    #[test]
    fn parse_minimum_block() {
        // Flag + checksum only.
        let tap = TapFile::parse(&[0x02, 0x00, 0x00, 0x00]).expect("should parse");
        assert_eq!(tap.blocks.len(), 1);
        assert!(tap.blocks[0].payload().is_empty());
    }

    #[test]
    fn parse_zero_length_block() {
        assert!(TapFile::parse(&[0x00, 0x00]).is_err());
        assert!(TapFile::parse(&[0x01, 0x00, 0xFF]).is_err());
    }

    #[test]
    fn into_tape_blocks_carries_pause() {
        let raw = make_tap(&[(0x00, &[0x01])]);
        let blocks = TapFile::parse(&raw).expect("parse").into_tape_blocks();
        match &blocks[0] {
            crate::tape::TapeBlock::Standard { data, pause_ms } => {
                assert_eq!(data.len(), 3);
                assert_eq!(*pause_ms, TAP_PAUSE_MS);
            }
            other => panic!("unexpected block {other:?}"),
        }
    }
}
