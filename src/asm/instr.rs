//! SM83 instruction encoding.
//!
//! Each mnemonic parses its operands and emits opcode bytes, with operand
//! expressions routed through the section builder so unresolved values
//! become patches. The `ld a, [nn]` to `ldh` rewrite happens here when the
//! load-optimization option is on.

use crate::asm::expr::Expr;
use crate::asm::lexer::{Keyword, Tok};
use crate::asm::Assembler;
use crate::common::PatchKind;
use crate::diag::Fatal;
use crate::rpn::RpnOp;

/// An 8-bit register operand, in encoding order; 6 is `[hl]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reg8 {
    B = 0,
    C = 1,
    D = 2,
    E = 3,
    H = 4,
    L = 5,
    HlInd = 6,
    A = 7,
}

/// A 16-bit register pair, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reg16 {
    Bc = 0,
    De = 1,
    Hl = 2,
    Sp = 3,
}

/// A branch condition code, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cond {
    Nz = 0,
    Z = 1,
    Nc = 2,
    C = 3,
}

/// A memory operand between brackets.
#[derive(Debug)]
enum Mem {
    Bc,
    De,
    Hl,
    Hli,
    Hld,
    C,
    Imm(Expr),
}

impl Assembler {
    /// Assemble one instruction statement; the mnemonic keyword has been
    /// consumed.
    pub(crate) fn instruction(&mut self, kw: Keyword) -> Result<(), Fatal> {
        use Keyword::*;
        match kw {
            Nop => self.emit8(0x00),
            Halt => self.emit8(0x76),
            Stop => {
                self.emit8(0x10);
                self.emit8(0x00);
            }
            Di => self.emit8(0xF3),
            Ei => self.emit8(0xFB),
            Daa => self.emit8(0x27),
            Cpl => self.emit8(0x2F),
            Scf => self.emit8(0x37),
            Ccf => self.emit8(0x3F),
            Rlca => self.emit8(0x07),
            Rla => self.emit8(0x17),
            Rrca => self.emit8(0x0F),
            Rra => self.emit8(0x1F),
            Reti => self.emit8(0xD9),
            Ld => self.ld()?,
            Ldh => self.ldh()?,
            Ldi => self.ld_incdec(0x22, 0x2A)?,
            Ldd => self.ld_incdec(0x32, 0x3A)?,
            Add => self.add()?,
            Adc => self.alu(0x88, 0xCE)?,
            Sub => self.alu(0x90, 0xD6)?,
            Sbc => self.alu(0x98, 0xDE)?,
            And => self.alu(0xA0, 0xE6)?,
            Xor => self.alu(0xA8, 0xEE)?,
            Or => self.alu(0xB0, 0xF6)?,
            Cp => self.alu(0xB8, 0xFE)?,
            Inc => self.incdec(0x04, 0x03)?,
            Dec => self.incdec(0x05, 0x0B)?,
            Jp => self.jp()?,
            Jr => self.jr()?,
            Call => self.call()?,
            Ret => self.ret()?,
            Rst => self.rst()?,
            Push => self.push_pop(0xC5)?,
            Pop => self.push_pop(0xC1)?,
            Rlc => self.cb_rotate(0x00)?,
            Rrc => self.cb_rotate(0x08)?,
            Rl => self.cb_rotate(0x10)?,
            Rr => self.cb_rotate(0x18)?,
            Sla => self.cb_rotate(0x20)?,
            Sra => self.cb_rotate(0x28)?,
            Swap => self.cb_rotate(0x30)?,
            Srl => self.cb_rotate(0x38)?,
            Bit => self.cb_bit(0x40)?,
            Res => self.cb_bit(0x80)?,
            Set => self.cb_bit(0xC0)?,
            _ => {
                self.err_here(format!("`{:?}` is not an instruction", kw));
                self.recover()?;
            }
        }
        Ok(())
    }

    fn try_reg8(&mut self) -> Result<Option<Reg8>, Fatal> {
        let reg = match self.peek_tok()? {
            Tok::Kw(Keyword::A) => Reg8::A,
            Tok::Kw(Keyword::B) => Reg8::B,
            Tok::Kw(Keyword::C) => Reg8::C,
            Tok::Kw(Keyword::D) => Reg8::D,
            Tok::Kw(Keyword::E) => Reg8::E,
            Tok::Kw(Keyword::H) => Reg8::H,
            Tok::Kw(Keyword::L) => Reg8::L,
            _ => return Ok(None),
        };
        self.next()?;
        Ok(Some(reg))
    }

    /// A register operand including `[hl]`; a bracket here can only mean
    /// `[hl]`.
    fn try_reg8_mem(&mut self) -> Result<Option<Reg8>, Fatal> {
        if let Some(reg) = self.try_reg8()? {
            return Ok(Some(reg));
        }
        if self.eat(Tok::LBracket)? {
            self.expect(Tok::Kw(Keyword::Hl))?;
            self.expect(Tok::RBracket)?;
            return Ok(Some(Reg8::HlInd));
        }
        Ok(None)
    }

    fn try_reg16(&mut self) -> Result<Option<Reg16>, Fatal> {
        let reg = match self.peek_tok()? {
            Tok::Kw(Keyword::Bc) => Reg16::Bc,
            Tok::Kw(Keyword::De) => Reg16::De,
            Tok::Kw(Keyword::Hl) => Reg16::Hl,
            Tok::Kw(Keyword::Sp) => Reg16::Sp,
            _ => return Ok(None),
        };
        self.next()?;
        Ok(Some(reg))
    }

    fn try_cond(&mut self) -> Result<Option<Cond>, Fatal> {
        let cond = match self.peek_tok()? {
            Tok::Kw(Keyword::Nz) => Cond::Nz,
            Tok::Kw(Keyword::Z) => Cond::Z,
            Tok::Kw(Keyword::Nc) => Cond::Nc,
            Tok::Kw(Keyword::C) => Cond::C,
            _ => return Ok(None),
        };
        self.next()?;
        Ok(Some(cond))
    }

    /// Parse a bracketed memory operand; the `[` has been consumed.
    fn mem_operand(&mut self) -> Result<Mem, Fatal> {
        let mem = match self.peek_tok()? {
            Tok::Kw(Keyword::Bc) => {
                self.next()?;
                Mem::Bc
            }
            Tok::Kw(Keyword::De) => {
                self.next()?;
                Mem::De
            }
            Tok::Kw(Keyword::C) => {
                self.next()?;
                Mem::C
            }
            Tok::Kw(Keyword::Hli) => {
                self.next()?;
                Mem::Hli
            }
            Tok::Kw(Keyword::Hld) => {
                self.next()?;
                Mem::Hld
            }
            Tok::Kw(Keyword::Hl) => {
                self.next()?;
                match self.peek_tok()? {
                    Tok::Plus => {
                        self.next()?;
                        Mem::Hli
                    }
                    Tok::Minus => {
                        self.next()?;
                        Mem::Hld
                    }
                    _ => Mem::Hl,
                }
            }
            _ => Mem::Imm(self.expr()?),
        };
        self.expect(Tok::RBracket)?;
        Ok(mem)
    }

    fn ld(&mut self) -> Result<(), Fatal> {
        if let Some(reg) = self.try_reg8()? {
            self.expect(Tok::Comma)?;
            return self.ld_into_reg8(reg);
        }
        if let Some(pair) = self.try_reg16()? {
            self.expect(Tok::Comma)?;
            return self.ld_into_reg16(pair);
        }
        if self.eat(Tok::LBracket)? {
            let dest = self.mem_operand()?;
            self.expect(Tok::Comma)?;
            return self.ld_into_mem(dest);
        }
        self.err_here("invalid destination operand for `ld`");
        self.recover()
    }

    fn ld_into_reg8(&mut self, dest: Reg8) -> Result<(), Fatal> {
        if let Some(src) = self.try_reg8()? {
            self.emit8(0x40 | (dest as u8) << 3 | src as u8);
            return Ok(());
        }
        if self.eat(Tok::LBracket)? {
            let src = self.mem_operand()?;
            return match (dest, src) {
                (_, Mem::Hl) => {
                    self.emit8(0x46 | (dest as u8) << 3);
                    Ok(())
                }
                (Reg8::A, Mem::Bc) => {
                    self.emit8(0x0A);
                    Ok(())
                }
                (Reg8::A, Mem::De) => {
                    self.emit8(0x1A);
                    Ok(())
                }
                (Reg8::A, Mem::Hli) => {
                    self.emit8(0x2A);
                    Ok(())
                }
                (Reg8::A, Mem::Hld) => {
                    self.emit8(0x3A);
                    Ok(())
                }
                (Reg8::A, Mem::C) => {
                    self.emit8(0xF2);
                    Ok(())
                }
                (Reg8::A, Mem::Imm(addr)) => {
                    self.ld_a_from_addr(addr);
                    Ok(())
                }
                _ => {
                    self.err_here("invalid source operand for `ld`");
                    self.recover()
                }
            };
        }
        let value = self.expr()?;
        self.emit8(0x06 | (dest as u8) << 3);
        self.emit_expr8(value);
        Ok(())
    }

    /// `ld a, [nn]`, rewritten to `ldh` when the address is provably in
    /// the high page and the optimization is enabled.
    fn ld_a_from_addr(&mut self, addr: Expr) {
        if self.runtime.optimize_loads && addr.is_known() {
            let value = addr.value();
            if (0xFF00..=0xFFFF).contains(&value) {
                self.emit8(0xF0);
                self.emit8((value & 0xFF) as u8);
                return;
            }
        }
        self.emit8(0xFA);
        self.emit_expr16(addr);
    }

    fn ld_into_reg16(&mut self, dest: Reg16) -> Result<(), Fatal> {
        if dest == Reg16::Sp && self.peek_tok()? == Tok::Kw(Keyword::Hl) {
            self.next()?;
            self.emit8(0xF9);
            return Ok(());
        }
        if dest == Reg16::Hl && self.peek_tok()? == Tok::Kw(Keyword::Sp) {
            // ld hl, sp+e
            self.next()?;
            let offset = match self.peek_tok()? {
                Tok::Plus => {
                    self.next()?;
                    self.expr()?
                }
                Tok::Minus => {
                    self.next()?;
                    Expr::unary(crate::rpn::UnOp::Neg, self.expr()?)
                }
                _ => Expr::konst(0),
            };
            self.emit8(0xF8);
            self.emit_expr8(offset);
            return Ok(());
        }
        let value = self.expr()?;
        self.emit8(0x01 | (dest as u8) << 4);
        self.emit_expr16(value);
        Ok(())
    }

    fn ld_into_mem(&mut self, dest: Mem) -> Result<(), Fatal> {
        match dest {
            Mem::Hl => {
                if let Some(src) = self.try_reg8()? {
                    self.emit8(0x70 | src as u8);
                } else {
                    let value = self.expr()?;
                    self.emit8(0x36);
                    self.emit_expr8(value);
                }
                Ok(())
            }
            Mem::Bc => self.expect_a_then(0x02),
            Mem::De => self.expect_a_then(0x12),
            Mem::Hli => self.expect_a_then(0x22),
            Mem::Hld => self.expect_a_then(0x32),
            Mem::C => self.expect_a_then(0xE2),
            Mem::Imm(addr) => {
                if self.peek_tok()? == Tok::Kw(Keyword::Sp) {
                    self.next()?;
                    self.emit8(0x08);
                    self.emit_expr16(addr);
                    return Ok(());
                }
                self.expect(Tok::Kw(Keyword::A))?;
                if self.runtime.optimize_loads && addr.is_known() {
                    let value = addr.value();
                    if (0xFF00..=0xFFFF).contains(&value) {
                        self.emit8(0xE0);
                        self.emit8((value & 0xFF) as u8);
                        return Ok(());
                    }
                }
                self.emit8(0xEA);
                self.emit_expr16(addr);
                Ok(())
            }
        }
    }

    fn expect_a_then(&mut self, opcode: u8) -> Result<(), Fatal> {
        self.expect(Tok::Kw(Keyword::A))?;
        self.emit8(opcode);
        Ok(())
    }

    fn ldh(&mut self) -> Result<(), Fatal> {
        if self.peek_tok()? == Tok::Kw(Keyword::A) {
            // ldh a, [n]
            self.next()?;
            self.expect(Tok::Comma)?;
            self.expect(Tok::LBracket)?;
            let mem = self.mem_operand()?;
            return match mem {
                Mem::C => {
                    self.emit8(0xF2);
                    Ok(())
                }
                Mem::Imm(addr) => {
                    self.emit8(0xF0);
                    self.emit_hram(addr);
                    Ok(())
                }
                _ => {
                    self.err_here("invalid operand for `ldh`");
                    self.recover()
                }
            };
        }
        self.expect(Tok::LBracket)?;
        let mem = self.mem_operand()?;
        self.expect(Tok::Comma)?;
        self.expect(Tok::Kw(Keyword::A))?;
        match mem {
            Mem::C => self.emit8(0xE2),
            Mem::Imm(addr) => {
                self.emit8(0xE0);
                self.emit_hram(addr);
            }
            _ => {
                self.err_here("invalid operand for `ldh`");
                return self.recover();
            }
        }
        Ok(())
    }

    /// `ldi`/`ldd` shorthand: only the `a`/`[hl]` pairings exist.
    fn ld_incdec(&mut self, store: u8, load: u8) -> Result<(), Fatal> {
        if self.peek_tok()? == Tok::Kw(Keyword::A) {
            self.next()?;
            self.expect(Tok::Comma)?;
            self.expect(Tok::LBracket)?;
            self.expect(Tok::Kw(Keyword::Hl))?;
            self.expect(Tok::RBracket)?;
            self.emit8(load);
            return Ok(());
        }
        self.expect(Tok::LBracket)?;
        self.expect(Tok::Kw(Keyword::Hl))?;
        self.expect(Tok::RBracket)?;
        self.expect(Tok::Comma)?;
        self.expect(Tok::Kw(Keyword::A))?;
        self.emit8(store);
        Ok(())
    }

    fn add(&mut self) -> Result<(), Fatal> {
        match self.peek_tok()? {
            Tok::Kw(Keyword::Hl) => {
                self.next()?;
                self.expect(Tok::Comma)?;
                match self.try_reg16()? {
                    Some(pair) => self.emit8(0x09 | (pair as u8) << 4),
                    None => {
                        self.err_here("`add hl` needs a 16-bit register");
                        return self.recover();
                    }
                }
                Ok(())
            }
            Tok::Kw(Keyword::Sp) => {
                self.next()?;
                self.expect(Tok::Comma)?;
                let offset = self.expr()?;
                self.emit8(0xE8);
                self.emit_expr8(offset);
                Ok(())
            }
            _ => self.alu(0x80, 0xC6),
        }
    }

    /// The 8-bit accumulator group; the `a,` prefix is optional.
    fn alu(&mut self, reg_base: u8, imm_opcode: u8) -> Result<(), Fatal> {
        if self.peek_tok()? == Tok::Kw(Keyword::A) {
            self.next()?;
            if !self.eat(Tok::Comma)? {
                // `op a`: the accumulator is the operand itself.
                self.emit8(reg_base | Reg8::A as u8);
                return Ok(());
            }
        }
        if let Some(reg) = self.try_reg8_mem()? {
            self.emit8(reg_base | reg as u8);
            return Ok(());
        }
        let value = self.expr()?;
        self.emit8(imm_opcode);
        self.emit_expr8(value);
        Ok(())
    }

    fn incdec(&mut self, reg8_base: u8, reg16_base: u8) -> Result<(), Fatal> {
        if let Some(reg) = self.try_reg8_mem()? {
            self.emit8(reg8_base | (reg as u8) << 3);
            return Ok(());
        }
        if let Some(pair) = self.try_reg16()? {
            self.emit8(reg16_base | (pair as u8) << 4);
            return Ok(());
        }
        self.err_here("invalid operand for `inc`/`dec`");
        self.recover()
    }

    fn jp(&mut self) -> Result<(), Fatal> {
        if self.peek_tok()? == Tok::Kw(Keyword::Hl) {
            self.next()?;
            self.emit8(0xE9);
            return Ok(());
        }
        if let Some(cond) = self.try_cond()? {
            self.expect(Tok::Comma)?;
            let target = self.expr()?;
            self.emit8(0xC2 | (cond as u8) << 3);
            self.emit_expr16(target);
            return Ok(());
        }
        let target = self.expr()?;
        self.emit8(0xC3);
        self.emit_expr16(target);
        Ok(())
    }

    fn jr(&mut self) -> Result<(), Fatal> {
        if let Some(cond) = self.try_cond()? {
            self.expect(Tok::Comma)?;
            let target = self.expr()?;
            self.emit8(0x20 | (cond as u8) << 3);
            self.emit_jr(target);
            return Ok(());
        }
        let target = self.expr()?;
        self.emit8(0x18);
        self.emit_jr(target);
        Ok(())
    }

    fn call(&mut self) -> Result<(), Fatal> {
        if let Some(cond) = self.try_cond()? {
            self.expect(Tok::Comma)?;
            let target = self.expr()?;
            self.emit8(0xC4 | (cond as u8) << 3);
            self.emit_expr16(target);
            return Ok(());
        }
        let target = self.expr()?;
        self.emit8(0xCD);
        self.emit_expr16(target);
        Ok(())
    }

    fn ret(&mut self) -> Result<(), Fatal> {
        if let Some(cond) = self.try_cond()? {
            self.emit8(0xC0 | (cond as u8) << 3);
            return Ok(());
        }
        self.emit8(0xC9);
        Ok(())
    }

    fn rst(&mut self) -> Result<(), Fatal> {
        let vector = self.expr()?;
        if vector.is_known() {
            let value = vector.value();
            if value & !0x38 != 0 {
                self.err_here(format!(
                    "${:02X} is not a RST vector (must be one of $00, $08, ..., $38)",
                    value
                ));
                self.emit8(0xC7);
                return Ok(());
            }
            self.emit8(0xC7 | value as u8);
            return Ok(());
        }
        let tagged = vector.with_check(RpnOp::RstCheck);
        self.emit_expr_width(PatchKind::Byte, tagged);
        Ok(())
    }

    fn push_pop(&mut self, base: u8) -> Result<(), Fatal> {
        let pair = match self.peek_tok()? {
            Tok::Kw(Keyword::Bc) => 0,
            Tok::Kw(Keyword::De) => 1,
            Tok::Kw(Keyword::Hl) => 2,
            Tok::Kw(Keyword::Af) => 3,
            _ => {
                self.err_here("`push`/`pop` need a 16-bit register");
                return self.recover();
            }
        };
        self.next()?;
        self.emit8(base | pair << 4);
        Ok(())
    }

    fn cb_rotate(&mut self, base: u8) -> Result<(), Fatal> {
        match self.try_reg8_mem()? {
            Some(reg) => {
                self.emit8(0xCB);
                self.emit8(base | reg as u8);
                Ok(())
            }
            None => {
                self.err_here("invalid operand for rotate/shift");
                self.recover()
            }
        }
    }

    fn cb_bit(&mut self, base: u8) -> Result<(), Fatal> {
        let bit = self.expr()?;
        let bit = match bit.get_const("bit number") {
            Ok(value) if (0..8).contains(&value) => value as u8,
            Ok(value) => {
                self.err_here(format!("bit number {} is out of range", value));
                0
            }
            Err(error) => {
                self.err_here(error);
                0
            }
        };
        self.expect(Tok::Comma)?;
        match self.try_reg8_mem()? {
            Some(reg) => {
                self.emit8(0xCB);
                self.emit8(base | bit << 3 | reg as u8);
                Ok(())
            }
            None => {
                self.err_here("invalid operand for bit instruction");
                self.recover()
            }
        }
    }
}
