use super::csr::CsrFile;
use super::excmon::ExclusiveMonitor;
use super::mmu::{AccessKind, Mmu};
use super::trap::{Cause, Exception};
use super::CycleState;
use crate::instruction::{
    AmoOp, BranchCondition, CsrOp, CsrSpecifier, Instruction, LoadWidth, RegImmOp, RegRegOp,
    RegShiftImmOp, StoreWidth,
};
use crate::registers::Specifier;
use crate::PrivilegeLevel;

/// Executes a single decoded instruction against the cycle's working state.
///
/// The working copy of the registers is mutated freely; the driver discards
/// it if a trap ends up pending. Control-flow instructions redirect
/// `next_pc`; everything else leaves the default `pc + 4` in place.
pub(super) struct Executor<'a> {
    pub cycle: &'a mut CycleState,
    pub csr: &'a mut CsrFile,
    pub mmu: &'a mut Mmu,
    pub exc_mon: &'a mut ExclusiveMonitor,
}

impl Executor<'_> {
    pub fn execute(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                let op: fn(u32, i32) -> u32 = match op {
                    RegImmOp::Addi => |s: u32, imm: i32| s.wrapping_add_signed(imm),
                    RegImmOp::Slti => |s: u32, imm: i32| ((s as i32) < imm) as u32,
                    RegImmOp::Sltiu => |s: u32, imm: i32| (s < imm as u32) as u32,
                    RegImmOp::Xori => |s: u32, imm: i32| s ^ imm as u32,
                    RegImmOp::Ori => |s: u32, imm: i32| s | imm as u32,
                    RegImmOp::Andi => |s: u32, imm: i32| s & imm as u32,
                };
                let result = op(self.cycle.regs.x(src), immediate);
                self.cycle.regs.set_x(dest, result);
            }
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shift_amount_u5,
            } => {
                let s = self.cycle.regs.x(src);
                let result = match op {
                    RegShiftImmOp::Slli => s << shift_amount_u5,
                    RegShiftImmOp::Srli => s >> shift_amount_u5,
                    RegShiftImmOp::Srai => ((s as i32) >> shift_amount_u5) as u32,
                };
                self.cycle.regs.set_x(dest, result);
            }
            Instruction::Lui { dest, immediate } => {
                self.cycle.regs.set_x(dest, immediate as u32);
            }
            Instruction::Auipc { dest, immediate } => {
                let result = self.cycle.regs.pc().wrapping_add_signed(immediate);
                self.cycle.regs.set_x(dest, result);
            }
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                let result = reg_reg_op(op, self.cycle.regs.x(src1), self.cycle.regs.x(src2));
                self.cycle.regs.set_x(dest, result);
            }
            Instruction::Jal { dest, offset } => {
                let pc = self.cycle.regs.pc();
                self.jump(dest, pc.wrapping_add_signed(offset));
            }
            Instruction::Jalr { dest, base, offset } => {
                let target = self.cycle.regs.x(base).wrapping_add_signed(offset) & !1;
                self.jump(dest, target);
            }
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                let s1 = self.cycle.regs.x(src1);
                let s2 = self.cycle.regs.x(src2);
                let taken = match condition {
                    BranchCondition::Beq => s1 == s2,
                    BranchCondition::Bne => s1 != s2,
                    BranchCondition::Blt => (s1 as i32) < (s2 as i32),
                    BranchCondition::Bge => (s1 as i32) >= (s2 as i32),
                    BranchCondition::Bltu => s1 < s2,
                    BranchCondition::Bgeu => s1 >= s2,
                };
                if taken {
                    self.cycle.next_pc = self.cycle.regs.pc().wrapping_add_signed(offset);
                }
            }
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => self.load(width, dest, base, offset),
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => self.store(width, src, base, offset),
            Instruction::Amo {
                op,
                dest,
                addr,
                src,
            } => self.amo(op, dest, addr, src),
            // A single in-order hart with no caches has nothing to order or
            // flush.
            Instruction::Fence | Instruction::FenceI => {}
            Instruction::Ecall => {
                let cause = match self.csr.cur_priv() {
                    PrivilegeLevel::User => Exception::EnvironmentCallFromUMode,
                    PrivilegeLevel::Supervisor => Exception::EnvironmentCallFromSMode,
                    PrivilegeLevel::Machine => Exception::EnvironmentCallFromMMode,
                };
                self.cycle.raise(cause.into(), 0);
            }
            Instruction::Ebreak => {
                self.cycle.raise(Exception::Breakpoint.into(), 0);
            }
            Instruction::Mret => self.trap_return(PrivilegeLevel::Machine),
            Instruction::Sret => self.trap_return(PrivilegeLevel::Supervisor),
            // Wait-for-interrupt is allowed to complete as a no-op; the
            // surrounding guest loop re-polls until the interrupt arrives.
            Instruction::Wfi => {}
            Instruction::SfenceVma { .. } => {
                // No TLB to flush, but the privilege gate still applies.
                if self.csr.cur_priv() < PrivilegeLevel::Supervisor {
                    self.raise_illegal();
                }
            }
            Instruction::Csr {
                op,
                dest,
                csr,
                src,
            } => {
                let write_side = op == CsrOp::ReadWrite || src != Specifier::X0;
                let src_value = write_side.then(|| self.cycle.regs.x(src));
                self.csr_op(op, dest, csr, src_value);
            }
            Instruction::Csri {
                op,
                dest,
                csr,
                immediate,
            } => {
                let write_side = op == CsrOp::ReadWrite || immediate != 0;
                self.csr_op(op, dest, csr, write_side.then_some(immediate));
            }
        }
    }

    /// Write the return address and redirect to `target`. A misaligned
    /// target is caught by the driver's `next_pc` check, with the target as
    /// the trap value.
    fn jump(&mut self, dest: Specifier, target: u32) {
        let return_addr = self.cycle.regs.pc().wrapping_add(4);
        self.cycle.regs.set_x(dest, return_addr);
        self.cycle.next_pc = target;
    }

    fn load(&mut self, width: LoadWidth, dest: Specifier, base: Specifier, offset: i32) {
        let addr = self.cycle.regs.x(base).wrapping_add_signed(offset);
        let align_mask = match width {
            LoadWidth::Lb | LoadWidth::Lbu => 0,
            LoadWidth::Lh | LoadWidth::Lhu => 0b1,
            LoadWidth::Lw => 0b11,
        };
        if addr & align_mask != 0 {
            self.cycle
                .raise(Exception::LoadAddressMisaligned.into(), addr);
            return;
        }
        let value = match width {
            LoadWidth::Lb => self.mmu.read_byte(self.csr, addr) as i8 as u32,
            LoadWidth::Lbu => self.mmu.read_byte(self.csr, addr) as u32,
            LoadWidth::Lh => self.mmu.read_half(self.csr, addr) as i16 as u32,
            LoadWidth::Lhu => self.mmu.read_half(self.csr, addr) as u32,
            LoadWidth::Lw => self.mmu.read_word(self.csr, addr),
        };
        if self.check_mem_fault() {
            return;
        }
        self.cycle.regs.set_x(dest, value);
    }

    fn store(&mut self, width: StoreWidth, src: Specifier, base: Specifier, offset: i32) {
        let addr = self.cycle.regs.x(base).wrapping_add_signed(offset);
        let align_mask = match width {
            // A byte store has no alignment requirement.
            StoreWidth::Sb => 0,
            StoreWidth::Sh => 0b1,
            StoreWidth::Sw => 0b11,
        };
        if addr & align_mask != 0 {
            self.cycle
                .raise(Exception::StoreOrAmoAddressMisaligned.into(), addr);
            return;
        }
        let value = self.cycle.regs.x(src);
        match width {
            StoreWidth::Sb => self.mmu.write_byte(self.csr, addr, value as u8),
            StoreWidth::Sh => self.mmu.write_half(self.csr, addr, value as u16),
            StoreWidth::Sw => self.mmu.write_word(self.csr, addr, value),
        }
        self.check_mem_fault();
    }

    fn amo(&mut self, op: AmoOp, dest: Specifier, addr_reg: Specifier, src: Specifier) {
        let addr = self.cycle.regs.x(addr_reg);
        if addr & 0b11 != 0 {
            self.cycle
                .raise(Exception::StoreOrAmoAddressMisaligned.into(), addr);
            return;
        }
        match op {
            AmoOp::LrW => {
                let value = self.mmu.read_word(self.csr, addr);
                if self.check_mem_fault() {
                    return;
                }
                self.exc_mon.set(addr);
                self.cycle.regs.set_x(dest, value);
            }
            AmoOp::ScW => {
                if self.exc_mon.check(addr) {
                    let value = self.cycle.regs.x(src);
                    self.mmu.write_word(self.csr, addr, value);
                    if !self.check_mem_fault() {
                        self.cycle.regs.set_x(dest, 0);
                    }
                } else {
                    self.cycle.regs.set_x(dest, 1);
                }
                // Success or failure, the reservation is consumed.
                self.exc_mon.clear();
            }
            _ => {
                let value = self.mmu.read_word(self.csr, addr);
                if self.check_mem_fault() {
                    return;
                }
                let operand = self.cycle.regs.x(src);
                let result = match op {
                    AmoOp::SwapW => operand,
                    AmoOp::AddW => value.wrapping_add(operand),
                    AmoOp::XorW => value ^ operand,
                    AmoOp::AndW => value & operand,
                    AmoOp::OrW => value | operand,
                    AmoOp::MinW => (value as i32).min(operand as i32) as u32,
                    AmoOp::MaxW => (value as i32).max(operand as i32) as u32,
                    AmoOp::MinuW => value.min(operand),
                    AmoOp::MaxuW => value.max(operand),
                    AmoOp::LrW | AmoOp::ScW => unreachable!(),
                };
                self.mmu.write_word(self.csr, addr, result);
                if self.check_mem_fault() {
                    return;
                }
                self.cycle.regs.set_x(dest, value);
            }
        }
    }

    /// Convert a fault latched by the MMU during this instruction into the
    /// matching page-fault exception. Returns `true` if one was pending.
    fn check_mem_fault(&mut self) -> bool {
        let Some(fault) = self.mmu.fault() else {
            return false;
        };
        let cause = match fault.kind {
            AccessKind::Load => Exception::LoadPageFault,
            AccessKind::Store => Exception::StoreOrAmoPageFault,
            AccessKind::Fetch => Exception::InstructionPageFault,
        };
        self.cycle.raise(cause.into(), fault.vaddr);
        true
    }

    fn trap_return(&mut self, mode: PrivilegeLevel) {
        match self.csr.return_from_trap(mode) {
            Ok(next_pc) => {
                self.cycle.next_pc = next_pc;
                self.exc_mon.clear();
            }
            Err(_) => self.raise_illegal(),
        }
    }

    /// The read side goes to `dest` (skipped for CSRRW with rd = x0), then
    /// the write side applies `src_value` if present. Any CSR failure is an
    /// illegal instruction with the raw word as trap value.
    fn csr_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        csr: CsrSpecifier,
        src_value: Option<u32>,
    ) {
        let read_side = op != CsrOp::ReadWrite || dest != Specifier::X0;
        let mut old_value = 0;
        if read_side {
            match self.csr.read(csr) {
                Ok(value) => old_value = value,
                Err(_) => return self.raise_illegal(),
            }
            self.cycle.regs.set_x(dest, old_value);
        }
        if let Some(src_value) = src_value {
            let value = match op {
                CsrOp::ReadWrite => src_value,
                CsrOp::ReadSet => old_value | src_value,
                CsrOp::ReadClear => old_value & !src_value,
            };
            if self.csr.write(csr, value).is_err() {
                self.raise_illegal();
            }
        }
    }

    fn raise_illegal(&mut self) {
        self.cycle
            .raise(Cause::Exception(Exception::IllegalInstruction), self.cycle.raw);
    }
}

fn reg_reg_op(op: RegRegOp, s1: u32, s2: u32) -> u32 {
    match op {
        RegRegOp::Add => s1.wrapping_add(s2),
        RegRegOp::Sub => s1.wrapping_sub(s2),
        RegRegOp::Slt => ((s1 as i32) < (s2 as i32)) as u32,
        RegRegOp::Sltu => (s1 < s2) as u32,
        RegRegOp::And => s1 & s2,
        RegRegOp::Or => s1 | s2,
        RegRegOp::Xor => s1 ^ s2,
        RegRegOp::Sll => s1 << (s2 & 0x1F),
        RegRegOp::Srl => s1 >> (s2 & 0x1F),
        RegRegOp::Sra => ((s1 as i32) >> (s2 & 0x1F)) as u32,
        RegRegOp::Mul => s1.wrapping_mul(s2),
        RegRegOp::Mulh => ((s1 as i32 as i64).wrapping_mul(s2 as i32 as i64) >> 32) as u32,
        RegRegOp::Mulhsu => ((s1 as i32 as i64).wrapping_mul(s2 as i64) >> 32) as u32,
        RegRegOp::Mulhu => ((s1 as u64 * s2 as u64) >> 32) as u32,
        RegRegOp::Div => match (s1 as i32, s2 as i32) {
            // Division by zero returns all-ones.
            (_, 0) => u32::MAX,
            // The one signed overflow case returns the dividend.
            (i32::MIN, -1) => s1,
            (a, b) => (a / b) as u32,
        },
        RegRegOp::Divu => match s2 {
            0 => u32::MAX,
            _ => s1 / s2,
        },
        RegRegOp::Rem => match (s1 as i32, s2 as i32) {
            // Division by zero returns the dividend.
            (_, 0) => s1,
            // The signed overflow case has remainder zero.
            (i32::MIN, -1) => 0,
            (a, b) => (a % b) as u32,
        },
        RegRegOp::Remu => match s2 {
            0 => s1,
            _ => s1 % s2,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_div_edge_cases() {
        use RegRegOp::*;
        assert_eq!(6, reg_reg_op(Mul, 2, 3));
        assert_eq!(
            0xFFFF_FFFE,
            reg_reg_op(Mul, 0xFFFF_FFFF, 2) // -1 * 2
        );
        assert_eq!(0xFFFF_FFFF, reg_reg_op(Mulh, 0xFFFF_FFFF, 2)); // high(-2)
        assert_eq!(1, reg_reg_op(Mulhu, 0x8000_0000, 2));
        // -1 (signed) times 2^31 (unsigned): -2^31 -> high word is -1.
        assert_eq!(0xFFFF_FFFF, reg_reg_op(Mulhsu, 0xFFFF_FFFF, 0x8000_0000));

        assert_eq!(u32::MAX, reg_reg_op(Div, 5, 0));
        assert_eq!(u32::MAX, reg_reg_op(Divu, 5, 0));
        assert_eq!(0x8000_0000, reg_reg_op(Div, 0x8000_0000, 0xFFFF_FFFF));
        assert_eq!(5, reg_reg_op(Rem, 5, 0));
        assert_eq!(0, reg_reg_op(Rem, 0x8000_0000, 0xFFFF_FFFF));
        assert_eq!(2, reg_reg_op(Remu, 5, 3));
        assert_eq!(0xFFFF_FFFE, reg_reg_op(Rem, 0xFFFF_FFF8, 3)); // -8 % 3 = -2
    }

    #[test]
    fn test_shifts_use_low_five_bits() {
        use RegRegOp::*;
        assert_eq!(4, reg_reg_op(Sll, 1, 2));
        assert_eq!(4, reg_reg_op(Sll, 1, 34));
        assert_eq!(0x3FFF_FFFF, reg_reg_op(Srl, 0xFFFF_FFFF, 2));
        assert_eq!(0xFFFF_FFFF, reg_reg_op(Sra, 0xFFFF_FFFF, 2));
    }
}
