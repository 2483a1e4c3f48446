//! Unprefixed (and DD/FD-substituted) instruction execution.

use emu_bus::Bus;

use crate::alu;
use crate::flags::{CF, HF, NF, PF, SF, XF, YF, ZF, sz53p};

use super::{Prefix, Z80};

impl Z80 {
    /// Execute a base-page instruction. `prefix` substitutes IX/IY for HL
    /// per the DD/FD rules; 0xCB and 0xED never reach this function.
    pub(super) fn execute_main<B: Bus>(&mut self, bus: &mut B, op: u8, prefix: Prefix) {
        match op {
            // NOP
            0x00 => {}

            // LD rr, nn (01=BC, 11=DE, 21=HL, 31=SP)
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.imm16(bus);
                self.set_reg16((op >> 4) & 3, prefix, value);
            }

            // LD (BC), A
            0x02 => {
                let addr = self.regs.bc();
                bus.write(addr, self.regs.a);
                self.regs.wz =
                    (u16::from(self.regs.a) << 8) | (addr.wrapping_add(1) & 0x00FF);
            }

            // INC rr (03=BC, 13=DE, 23=HL, 33=SP)
            0x03 | 0x13 | 0x23 | 0x33 => {
                bus.tick(2);
                let rp = (op >> 4) & 3;
                let value = self.reg16(rp, prefix).wrapping_add(1);
                self.set_reg16(rp, prefix, value);
            }

            // INC r / INC (HL) (04=B .. 3C=A, 34=(HL))
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let y = (op >> 3) & 7;
                if y == 6 {
                    let addr = self.operand_addr(bus, prefix);
                    let v = bus.read(addr);
                    bus.tick(1);
                    let result = alu::inc8(v);
                    bus.write(addr, result.value);
                    self.regs.f = (self.regs.f & CF) | result.flags;
                } else {
                    let result = alu::inc8(self.reg8(y, prefix));
                    self.set_reg8(y, prefix, result.value);
                    self.regs.f = (self.regs.f & CF) | result.flags;
                }
            }

            // DEC r / DEC (HL)
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let y = (op >> 3) & 7;
                if y == 6 {
                    let addr = self.operand_addr(bus, prefix);
                    let v = bus.read(addr);
                    bus.tick(1);
                    let result = alu::dec8(v);
                    bus.write(addr, result.value);
                    self.regs.f = (self.regs.f & CF) | result.flags;
                } else {
                    let result = alu::dec8(self.reg8(y, prefix));
                    self.set_reg8(y, prefix, result.value);
                    self.regs.f = (self.regs.f & CF) | result.flags;
                }
            }

            // LD r, n / LD (HL), n
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let y = (op >> 3) & 7;
                if y == 6 {
                    // The displacement comes before the immediate, and the
                    // internal delay is 2 T, not the usual 5.
                    let addr = match prefix {
                        Prefix::None => self.regs.hl(),
                        _ => {
                            let d = self.imm8(bus) as i8;
                            let addr = self.index_reg(prefix).wrapping_add(d as i16 as u16);
                            self.regs.wz = addr;
                            addr
                        }
                    };
                    let n = self.imm8(bus);
                    if prefix != Prefix::None {
                        bus.tick(2);
                    }
                    bus.write(addr, n);
                } else {
                    let n = self.imm8(bus);
                    self.set_reg8(y, prefix, n);
                }
            }

            // RLCA
            0x07 => {
                let carry = self.regs.a >> 7;
                self.regs.a = (self.regs.a << 1) | carry;
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | (self.regs.a & (YF | XF))
                    | if carry != 0 { CF } else { 0 };
            }

            // EX AF, AF'
            0x08 => {
                core::mem::swap(&mut self.regs.a, &mut self.regs.a_alt);
                core::mem::swap(&mut self.regs.f, &mut self.regs.f_alt);
            }

            // ADD HL, rr (09=BC, 19=DE, 29=HL, 39=SP)
            0x09 | 0x19 | 0x29 | 0x39 => {
                bus.tick(7);
                let rp = (op >> 4) & 3;
                let hl = self.index_reg(prefix);
                let rr = self.reg16(rp, prefix);
                self.regs.wz = hl.wrapping_add(1);
                let (result, flags) = alu::add16(hl, rr);
                self.set_index_reg(prefix, result);
                self.regs.f = (self.regs.f & (SF | ZF | PF)) | flags;
            }

            // LD A, (BC)
            0x0A => {
                let addr = self.regs.bc();
                self.regs.a = bus.read(addr);
                self.regs.wz = addr.wrapping_add(1);
            }

            // DEC rr
            0x0B | 0x1B | 0x2B | 0x3B => {
                bus.tick(2);
                let rp = (op >> 4) & 3;
                let value = self.reg16(rp, prefix).wrapping_sub(1);
                self.set_reg16(rp, prefix, value);
            }

            // RRCA
            0x0F => {
                let carry = self.regs.a & 1;
                self.regs.a = (self.regs.a >> 1) | (carry << 7);
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | (self.regs.a & (YF | XF))
                    | if carry != 0 { CF } else { 0 };
            }

            // DJNZ e
            0x10 => {
                bus.tick(1);
                let d = self.imm8(bus) as i8;
                self.regs.b = self.regs.b.wrapping_sub(1);
                if self.regs.b != 0 {
                    bus.tick(5);
                    self.regs.pc = self.regs.pc.wrapping_add(d as i16 as u16);
                    self.regs.wz = self.regs.pc;
                }
            }

            // LD (DE), A
            0x12 => {
                let addr = self.regs.de();
                bus.write(addr, self.regs.a);
                self.regs.wz =
                    (u16::from(self.regs.a) << 8) | (addr.wrapping_add(1) & 0x00FF);
            }

            // RLA
            0x17 => {
                let old_carry = self.regs.f & CF;
                let new_carry = self.regs.a >> 7;
                self.regs.a = (self.regs.a << 1) | old_carry;
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | (self.regs.a & (YF | XF))
                    | if new_carry != 0 { CF } else { 0 };
            }

            // JR e
            0x18 => {
                let d = self.imm8(bus) as i8;
                bus.tick(5);
                self.regs.pc = self.regs.pc.wrapping_add(d as i16 as u16);
                self.regs.wz = self.regs.pc;
            }

            // LD A, (DE)
            0x1A => {
                let addr = self.regs.de();
                self.regs.a = bus.read(addr);
                self.regs.wz = addr.wrapping_add(1);
            }

            // RRA
            0x1F => {
                let old_carry = (self.regs.f & CF) << 7;
                let new_carry = self.regs.a & 1;
                self.regs.a = (self.regs.a >> 1) | old_carry;
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | (self.regs.a & (YF | XF))
                    | if new_carry != 0 { CF } else { 0 };
            }

            // JR cc, e (20=NZ, 28=Z, 30=NC, 38=C)
            0x20 | 0x28 | 0x30 | 0x38 => {
                let d = self.imm8(bus) as i8;
                let cc = ((op >> 3) & 7) - 4;
                if self.condition(cc) {
                    bus.tick(5);
                    self.regs.pc = self.regs.pc.wrapping_add(d as i16 as u16);
                    self.regs.wz = self.regs.pc;
                }
            }

            // LD (nn), HL
            0x22 => {
                let nn = self.imm16(bus);
                let value = self.index_reg(prefix);
                bus.write(nn, value as u8);
                bus.write(nn.wrapping_add(1), (value >> 8) as u8);
                self.regs.wz = nn.wrapping_add(1);
            }

            // DAA
            0x27 => {
                let a = self.regs.a;
                let nf = self.regs.f & NF != 0;
                let cf = self.regs.f & CF != 0;
                let hf = self.regs.f & HF != 0;

                let mut correction: u8 = 0;
                let mut new_cf = cf;
                if hf || (a & 0x0F) > 9 {
                    correction |= 0x06;
                }
                if cf || a > 0x99 {
                    correction |= 0x60;
                    new_cf = true;
                }

                let result = if nf {
                    a.wrapping_sub(correction)
                } else {
                    a.wrapping_add(correction)
                };
                let new_hf = if nf {
                    hf && (a & 0x0F) < 6
                } else {
                    (a & 0x0F) > 9
                };

                self.regs.a = result;
                self.regs.f = sz53p(result)
                    | if nf { NF } else { 0 }
                    | if new_cf { CF } else { 0 }
                    | if new_hf { HF } else { 0 };
            }

            // LD HL, (nn)
            0x2A => {
                let nn = self.imm16(bus);
                let lo = bus.read(nn);
                let hi = bus.read(nn.wrapping_add(1));
                self.set_index_reg(prefix, (u16::from(hi) << 8) | u16::from(lo));
                self.regs.wz = nn.wrapping_add(1);
            }

            // CPL
            0x2F => {
                self.regs.a = !self.regs.a;
                self.regs.f = (self.regs.f & (SF | ZF | PF | CF))
                    | HF
                    | NF
                    | (self.regs.a & (XF | YF));
            }

            // LD (nn), A
            0x32 => {
                let nn = self.imm16(bus);
                bus.write(nn, self.regs.a);
                self.regs.wz =
                    (u16::from(self.regs.a) << 8) | (nn.wrapping_add(1) & 0x00FF);
            }

            // SCF
            0x37 => {
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | CF
                    | (self.regs.a & (XF | YF));
            }

            // LD A, (nn)
            0x3A => {
                let nn = self.imm16(bus);
                self.regs.a = bus.read(nn);
                self.regs.wz = nn.wrapping_add(1);
            }

            // CCF
            0x3F => {
                let old_carry = self.regs.f & CF;
                self.regs.f = (self.regs.f & (SF | ZF | PF))
                    | (self.regs.a & (XF | YF))
                    | if old_carry != 0 { HF } else { CF };
            }

            // HALT
            0x76 => {
                self.set_halted();
            }

            // LD r, r' / LD r, (HL) / LD (HL), r
            0x40..=0x7F => {
                let y = (op >> 3) & 7;
                let z = op & 7;
                if z == 6 {
                    // LD r,(HL) — with DD/FD the destination is always the
                    // plain register, never an index half.
                    let addr = self.operand_addr(bus, prefix);
                    let v = bus.read(addr);
                    self.set_reg8(y, Prefix::None, v);
                } else if y == 6 {
                    // LD (HL),r — same rule for the source.
                    let v = self.reg8(z, Prefix::None);
                    let addr = self.operand_addr(bus, prefix);
                    bus.write(addr, v);
                } else {
                    let v = self.reg8(z, prefix);
                    self.set_reg8(y, prefix, v);
                }
            }

            // ALU A, r / ALU A, (HL)
            0x80..=0xBF => {
                let z = op & 7;
                let operand = if z == 6 {
                    let addr = self.operand_addr(bus, prefix);
                    bus.read(addr)
                } else {
                    self.reg8(z, prefix)
                };
                self.apply_alu((op >> 3) & 7, operand);
            }

            // RET cc
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                bus.tick(1);
                if self.condition((op >> 3) & 7) {
                    self.regs.pc = self.pop16(bus);
                    self.regs.wz = self.regs.pc;
                }
            }

            // POP rr (C1=BC, D1=DE, E1=HL, F1=AF)
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let value = self.pop16(bus);
                let p = (op >> 4) & 3;
                if p == 3 {
                    self.regs.set_af(value);
                } else {
                    self.set_reg16(p, prefix, value);
                }
            }

            // JP cc, nn
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                let nn = self.imm16(bus);
                self.regs.wz = nn;
                if self.condition((op >> 3) & 7) {
                    self.regs.pc = nn;
                }
            }

            // JP nn
            0xC3 => {
                let nn = self.imm16(bus);
                self.regs.pc = nn;
                self.regs.wz = nn;
            }

            // CALL cc, nn
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                let nn = self.imm16(bus);
                self.regs.wz = nn;
                if self.condition((op >> 3) & 7) {
                    bus.tick(1);
                    let pc = self.regs.pc;
                    self.push16(bus, pc);
                    self.regs.pc = nn;
                }
            }

            // PUSH rr (C5=BC, D5=DE, E5=HL, F5=AF)
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                bus.tick(1);
                let p = (op >> 4) & 3;
                let value = if p == 3 {
                    self.regs.af()
                } else {
                    self.reg16(p, prefix)
                };
                self.push16(bus, value);
            }

            // ALU A, n
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let n = self.imm8(bus);
                self.apply_alu((op >> 3) & 7, n);
            }

            // RST y*8
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                bus.tick(1);
                let pc = self.regs.pc;
                self.push16(bus, pc);
                self.regs.pc = u16::from(op & 0x38);
                self.regs.wz = self.regs.pc;
            }

            // RET
            0xC9 => {
                self.regs.pc = self.pop16(bus);
                self.regs.wz = self.regs.pc;
            }

            // CALL nn
            0xCD => {
                let nn = self.imm16(bus);
                self.regs.wz = nn;
                bus.tick(1);
                let pc = self.regs.pc;
                self.push16(bus, pc);
                self.regs.pc = nn;
            }

            // OUT (n), A
            0xD3 => {
                let n = self.imm8(bus);
                let port = (u16::from(self.regs.a) << 8) | u16::from(n);
                bus.io_write(port, self.regs.a);
                self.regs.wz = (u16::from(self.regs.a) << 8)
                    | (u16::from(n.wrapping_add(1)));
            }

            // EXX
            0xD9 => {
                core::mem::swap(&mut self.regs.b, &mut self.regs.b_alt);
                core::mem::swap(&mut self.regs.c, &mut self.regs.c_alt);
                core::mem::swap(&mut self.regs.d, &mut self.regs.d_alt);
                core::mem::swap(&mut self.regs.e, &mut self.regs.e_alt);
                core::mem::swap(&mut self.regs.h, &mut self.regs.h_alt);
                core::mem::swap(&mut self.regs.l, &mut self.regs.l_alt);
            }

            // IN A, (n)
            0xDB => {
                let n = self.imm8(bus);
                let port = (u16::from(self.regs.a) << 8) | u16::from(n);
                self.regs.a = bus.io_read(port);
                self.regs.wz = port.wrapping_add(1);
            }

            // EX (SP), HL
            0xE3 => {
                let sp = self.regs.sp;
                let lo = bus.read(sp);
                let hi = bus.read(sp.wrapping_add(1));
                bus.tick(1);
                let value = self.index_reg(prefix);
                bus.write(sp.wrapping_add(1), (value >> 8) as u8);
                bus.write(sp, value as u8);
                bus.tick(2);
                let swapped = (u16::from(hi) << 8) | u16::from(lo);
                self.set_index_reg(prefix, swapped);
                self.regs.wz = swapped;
            }

            // JP (HL)
            0xE9 => {
                self.regs.pc = self.index_reg(prefix);
            }

            // EX DE, HL — always the real HL, even under DD/FD
            0xEB => {
                core::mem::swap(&mut self.regs.d, &mut self.regs.h);
                core::mem::swap(&mut self.regs.e, &mut self.regs.l);
            }

            // DI
            0xF3 => {
                self.regs.iff1 = false;
                self.regs.iff2 = false;
            }

            // LD SP, HL
            0xF9 => {
                bus.tick(2);
                self.regs.sp = self.index_reg(prefix);
            }

            // EI — takes effect after the following instruction
            0xFB => {
                self.regs.iff1 = true;
                self.regs.iff2 = true;
                self.set_ei_pending();
            }

            // 0xCB/0xDD/0xED/0xFD are consumed by the step loop
            _ => unreachable!("prefix byte {op:#04X} reached execute_main"),
        }
    }

    /// ADD/ADC/SUB/SBC/AND/XOR/OR/CP on the accumulator.
    fn apply_alu(&mut self, alu_op: u8, operand: u8) {
        let carry = self.regs.f & CF != 0;
        match alu_op {
            0 => {
                let r = alu::add8(self.regs.a, operand, false);
                self.regs.a = r.value;
                self.regs.f = r.flags;
            }
            1 => {
                let r = alu::add8(self.regs.a, operand, carry);
                self.regs.a = r.value;
                self.regs.f = r.flags;
            }
            2 => {
                let r = alu::sub8(self.regs.a, operand, false);
                self.regs.a = r.value;
                self.regs.f = r.flags;
            }
            3 => {
                let r = alu::sub8(self.regs.a, operand, carry);
                self.regs.a = r.value;
                self.regs.f = r.flags;
            }
            4 => {
                let r = alu::and8(self.regs.a, operand);
                self.regs.a = r.value;
                self.regs.f = r.flags;
            }
            5 => {
                let r = alu::xor8(self.regs.a, operand);
                self.regs.a = r.value;
                self.regs.f = r.flags;
            }
            6 => {
                let r = alu::or8(self.regs.a, operand);
                self.regs.a = r.value;
                self.regs.f = r.flags;
            }
            _ => {
                // CP: A unchanged, XY from the operand rather than the result.
                let r = alu::sub8(self.regs.a, operand, false);
                self.regs.f = (r.flags & !(XF | YF)) | (operand & (XF | YF));
            }
        }
    }
}
