//! SNA snapshot loader.
//!
//! 48K layout: 27-byte register header + 49,152 bytes of RAM; PC sits on
//! the stack. 128K layout appends PC, the 0x7FFD latch, a TR-DOS flag
//! and the remaining banks, optionally followed by a 0x1FFD byte on
//! +2A/+3 images.
//!
//! Parsing is staged: the file is validated completely before any
//! machine state changes, so a bad snapshot leaves the emulator intact.

use crate::spectrum::Spectrum;

/// 27-byte header + 48 KiB.
const SNA_48K_SIZE: usize = 49_179;
/// 48K image + PC + 0x7FFD + TR-DOS flag + five extra banks.
const SNA_128K_MIN_SIZE: usize = 131_103;
const HEADER_SIZE: usize = 27;
const BANK_SIZE: usize = 0x4000;

struct SnaRegs {
    i: u8,
    hl_alt: u16,
    de_alt: u16,
    bc_alt: u16,
    af_alt: u16,
    hl: u16,
    de: u16,
    bc: u16,
    iy: u16,
    ix: u16,
    iff2: bool,
    r: u8,
    af: u16,
    sp: u16,
    im: u8,
    border: u8,
}

/// Fully parsed snapshot, ready to apply.
struct SnaState {
    regs: SnaRegs,
    /// The three banks of the 48K image: (5, 2, paged-or-0).
    image: [Vec<u8>; 3],
    ext: Option<SnaExt>,
}

struct SnaExt {
    pc: u16,
    port_7ffd: u8,
    /// Banks beyond the 48K image, in file order.
    banks: Vec<(u8, Vec<u8>)>,
    port_1ffd: Option<u8>,
}

/// Load an SNA snapshot.
///
/// # Errors
///
/// Wrong size, a 48K stack pointer inside ROM, or a model mismatch (a
/// 128K snapshot needs a paging-capable model) abort without touching
/// the machine.
pub fn load_sna(spectrum: &mut Spectrum, data: &[u8]) -> Result<(), String> {
    let state = parse(data)?;

    if state.ext.is_some() && !spectrum.model().has_paging() {
        return Err("128K SNA snapshot needs a 128K-family model".to_string());
    }
    if state
        .ext
        .as_ref()
        .is_some_and(|e| e.port_1ffd.is_some())
        && !spectrum.model().gate_array()
    {
        return Err("+3 SNA snapshot needs a +2A/+3 model".to_string());
    }

    apply(spectrum, &state);
    Ok(())
}

fn word(data: &[u8], offset: usize) -> u16 {
    u16::from(data[offset]) | (u16::from(data[offset + 1]) << 8)
}

fn parse(data: &[u8]) -> Result<SnaState, String> {
    if data.len() != SNA_48K_SIZE && data.len() < SNA_128K_MIN_SIZE {
        return Err(format!(
            "SNA must be {SNA_48K_SIZE} bytes (48K) or at least {SNA_128K_MIN_SIZE} (128K), got {}",
            data.len()
        ));
    }

    let regs = SnaRegs {
        i: data[0],
        hl_alt: word(data, 1),
        de_alt: word(data, 3),
        bc_alt: word(data, 5),
        af_alt: (u16::from(data[8]) << 8) | u16::from(data[7]),
        hl: word(data, 9),
        de: word(data, 11),
        bc: word(data, 13),
        iy: word(data, 15),
        ix: word(data, 17),
        iff2: data[19] & 0x04 != 0,
        r: data[20],
        af: (u16::from(data[22]) << 8) | u16::from(data[21]),
        sp: word(data, 23),
        im: data[25] & 0x03,
        border: data[26] & 0x07,
    };

    let image_bytes = &data[HEADER_SIZE..HEADER_SIZE + 3 * BANK_SIZE];
    let image = [
        image_bytes[..BANK_SIZE].to_vec(),
        image_bytes[BANK_SIZE..2 * BANK_SIZE].to_vec(),
        image_bytes[2 * BANK_SIZE..].to_vec(),
    ];

    if data.len() == SNA_48K_SIZE {
        if regs.sp < 0x4000 {
            return Err(format!(
                "SNA stack pointer {:#06X} points into ROM, cannot pop PC",
                regs.sp
            ));
        }
        return Ok(SnaState {
            regs,
            image,
            ext: None,
        });
    }

    // 128K tail: PC, 0x7FFD, TR-DOS flag, then the banks not already in
    // the 48K image.
    let mut offset = HEADER_SIZE + 3 * BANK_SIZE;
    let pc = word(data, offset);
    let port_7ffd = data[offset + 2];
    offset += 4; // PC + 0x7FFD + TR-DOS flag

    let paged = port_7ffd & 7;
    let mut banks = Vec::new();
    for bank in 0..8u8 {
        if bank == 5 || bank == 2 || bank == paged {
            continue;
        }
        if offset + BANK_SIZE > data.len() {
            return Err(format!(
                "SNA truncated: bank {bank} missing at offset {offset}"
            ));
        }
        banks.push((bank, data[offset..offset + BANK_SIZE].to_vec()));
        offset += BANK_SIZE;
    }

    // Presence of one trailing byte marks a +2A/+3 image carrying the
    // 0x1FFD latch. This is a heuristic on length, not on a hardware
    // field; SNA has none.
    let port_1ffd = if offset < data.len() {
        log::warn!(
            "SNA: trailing byte taken as 0x1FFD latch (+2A/+3); detection is by presence only"
        );
        Some(data[offset])
    } else {
        None
    };

    Ok(SnaState {
        regs,
        image,
        ext: Some(SnaExt {
            pc,
            port_7ffd,
            banks,
            port_1ffd,
        }),
    })
}

fn apply(spectrum: &mut Spectrum, state: &SnaState) {
    let cpu = spectrum.cpu_mut();
    cpu.reset();
    let regs = &mut cpu.regs;
    let s = &state.regs;

    regs.i = s.i;
    regs.set_hl(s.hl);
    regs.set_de(s.de);
    regs.set_bc(s.bc);
    regs.h_alt = (s.hl_alt >> 8) as u8;
    regs.l_alt = s.hl_alt as u8;
    regs.d_alt = (s.de_alt >> 8) as u8;
    regs.e_alt = s.de_alt as u8;
    regs.b_alt = (s.bc_alt >> 8) as u8;
    regs.c_alt = s.bc_alt as u8;
    regs.a_alt = (s.af_alt >> 8) as u8;
    regs.f_alt = s.af_alt as u8;
    regs.iy = s.iy;
    regs.ix = s.ix;
    regs.iff1 = s.iff2;
    regs.iff2 = s.iff2;
    regs.r = s.r;
    regs.set_af(s.af);
    regs.sp = s.sp;
    regs.im = s.im;

    let bus = spectrum.bus_mut();
    let t = bus.clock.tstates();
    bus.ula.set_border(t, s.border);

    bus.memory.reset_paging();
    match &state.ext {
        None => {
            // 48K image: 0x4000 → bank 5, 0x8000 → bank 2, 0xC000 → bank 0.
            bus.memory.load_ram_bank(5, &state.image[0]);
            bus.memory.load_ram_bank(2, &state.image[1]);
            bus.memory.load_ram_bank(0, &state.image[2]);

            // PC lives on the stack.
            let sp = spectrum.cpu().regs.sp;
            let lo = spectrum.bus().memory.read(sp);
            let hi = spectrum.bus().memory.read(sp.wrapping_add(1));
            let cpu = spectrum.cpu_mut();
            cpu.regs.pc = (u16::from(hi) << 8) | u16::from(lo);
            cpu.regs.sp = sp.wrapping_add(2);
        }
        Some(ext) => {
            if let Some(v) = ext.port_1ffd {
                bus.memory.write_1ffd(v);
            }
            bus.memory.write_7ffd(ext.port_7ffd);
            bus.memory.load_ram_bank(5, &state.image[0]);
            bus.memory.load_ram_bank(2, &state.image[1]);
            bus.memory
                .load_ram_bank(usize::from(ext.port_7ffd & 7), &state.image[2]);
            for (bank, bytes) in &ext.banks {
                bus.memory.load_ram_bank(usize::from(*bank), bytes);
            }
            spectrum.cpu_mut().regs.pc = ext.pc;
        }
    }
}
