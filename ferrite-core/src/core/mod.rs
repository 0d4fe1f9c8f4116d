//! The hart: fetch/decode/execute driver, trap delivery, and the privileged
//! state it owns.

pub mod csr;
pub mod mmu;
pub mod trap;

mod counters;
mod excmon;
mod execute;
mod status;

use std::cell::Cell;
use std::rc::Rc;

use csr::CsrFile;
use excmon::ExclusiveMonitor;
use execute::Executor;
use mmu::Mmu;
use trap::{Cause, Exception, Interrupt, PendingTrap};

pub use status::Status;

use crate::instruction::Instruction;
use crate::registers::{Registers, Specifier};
use crate::Bus;

/// Address of the first instruction fetched out of reset.
pub const RESET_VECTOR: u32 = 0x0000_1000;

/// The external interrupt inputs of the hart, latched into mip once per
/// cycle. Each line is a shared one-bit cell driven by its source (the
/// interrupt controller for timer and software; the external line is wired
/// for completeness and permanently low on the default machine).
#[derive(Debug, Clone)]
pub struct IrqLines {
    pub timer: Rc<Cell<bool>>,
    pub soft: Rc<Cell<bool>>,
    pub external: Rc<Cell<bool>>,
}

impl Default for IrqLines {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqLines {
    /// Fresh, permanently-low lines. Replace individual cells with the
    /// producers' handles when wiring a machine.
    pub fn new() -> Self {
        Self {
            timer: Rc::new(Cell::new(false)),
            soft: Rc::new(Cell::new(false)),
            external: Rc::new(Cell::new(false)),
        }
    }
}

/// Working state of the cycle in progress.
///
/// `regs` is a free-to-mutate copy of the committed registers; it is thrown
/// away when a trap ends up pending. `next_pc` starts at `pc + 4` and is
/// redirected by jumps, branches, trap returns, and finally trap entry.
pub(crate) struct CycleState {
    pub regs: Registers,
    pub next_pc: u32,
    /// The raw instruction word, used as the trap value of illegal-
    /// instruction exceptions.
    pub raw: u32,
    pub pending: Option<PendingTrap>,
}

impl CycleState {
    /// Record a trap cause for this cycle, keeping the higher-ranked cause
    /// when one is already pending. An equal rank raised later wins.
    pub fn raise(&mut self, cause: Cause, tval: u32) {
        match &self.pending {
            Some(current) if current.cause.priority() > cause.priority() => {}
            _ => self.pending = Some(PendingTrap { cause, tval }),
        }
    }
}

/// A single RV32IMA hart.
///
/// Owns the architectural register file, the CSR file (including the current
/// privilege level), the exclusive monitor, and its view of memory through
/// the [`Mmu`]. One call to [`Core::step`] executes one instruction to
/// completion, including trap delivery.
pub struct Core {
    regs: Registers,
    csr: CsrFile,
    mmu: Mmu,
    exc_mon: ExclusiveMonitor,
    irq: IrqLines,
}

impl Core {
    /// Create a core in its reset state on `bus`. `mtime` is the interrupt
    /// controller's counter (shadowed by the `time` CSR) and `irq` the
    /// external interrupt lines.
    pub fn new(bus: Rc<Bus>, mtime: Rc<Cell<u64>>, irq: IrqLines) -> Self {
        Self {
            regs: Registers::new(RESET_VECTOR),
            csr: CsrFile::new(mtime),
            mmu: Mmu::new(bus),
            exc_mon: ExclusiveMonitor::new(),
            irq,
        }
    }

    /// Force the core back to its reset state: registers zero, `pc` at the
    /// reset vector, privilege level M.
    pub fn reset(&mut self) {
        self.regs = Registers::new(RESET_VECTOR);
        self.csr.reset();
        self.exc_mon.clear();
        self.mmu.clear_fault();
    }

    pub fn pc(&self) -> u32 {
        self.regs.pc()
    }

    /// Value of the register `specifier` as of the last committed cycle.
    pub fn x(&self, specifier: Specifier) -> u32 {
        self.regs.x(specifier)
    }

    pub fn csr(&self) -> &CsrFile {
        &self.csr
    }

    #[cfg(test)]
    pub(crate) fn csr_mut(&mut self) -> &mut CsrFile {
        &mut self.csr
    }

    /// Execute one cycle: fetch, decode, dispatch, interrupt check, then
    /// either trap entry or commit.
    pub fn step(&mut self) {
        self.mmu.clear_fault();
        // Interrupt inputs are sampled once, before the instruction can
        // observe them; mstatus/mie are latched so that a CSR write this
        // cycle cannot preempt its own instruction.
        self.csr.latch_interrupts(
            self.irq.timer.get(),
            self.irq.soft.get(),
            self.irq.external.get(),
        );
        let latched_mie_bit = self.csr.status().mie();
        let latched_mie = self.csr.mie_value();

        let pc = self.regs.pc();
        let raw = self.mmu.read_inst(&self.csr, pc);
        let mut cycle = CycleState {
            regs: self.regs.clone(),
            next_pc: pc.wrapping_add(4),
            raw,
            pending: None,
        };

        match self.mmu.fault() {
            Some(fault) => {
                cycle.raise(Exception::InstructionPageFault.into(), fault.vaddr);
            }
            None => match Instruction::decode(raw) {
                Ok(instruction) => Executor {
                    cycle: &mut cycle,
                    csr: &mut self.csr,
                    mmu: &mut self.mmu,
                    exc_mon: &mut self.exc_mon,
                }
                .execute(instruction),
                Err(_) => cycle.raise(Exception::IllegalInstruction.into(), raw),
            },
        }

        if cycle.next_pc & 0b11 != 0 {
            cycle.raise(Exception::InstructionAddressMisaligned.into(), cycle.next_pc);
        } else {
            self.check_interrupt(&mut cycle, latched_mie_bit, latched_mie);
        }

        match cycle.pending.take() {
            Some(pending) => {
                // Discard the working registers; only the redirected pc
                // survives.
                let vector = self.csr.enter_trap(pc, &pending);
                self.exc_mon.clear();
                *self.regs.pc_mut() = vector;
            }
            None => {
                self.regs = cycle.regs;
                *self.regs.pc_mut() = cycle.next_pc;
            }
        }
        self.csr.counters_mut().increment();
    }

    /// Raise the highest-priority pending-and-enabled interrupt, using the
    /// mstatus/mie values latched at the start of the cycle.
    fn check_interrupt(&self, cycle: &mut CycleState, mie_bit: bool, mie: u32) {
        if !mie_bit {
            return;
        }
        let ready = self.csr.mip_value() & mie;
        let interrupt = [
            Interrupt::MachineExternal,
            Interrupt::MachineTimer,
            Interrupt::MachineSoftware,
        ]
        .into_iter()
        .find(|i| ready & (1 << i.bit()) != 0);
        if let Some(interrupt) = interrupt {
            cycle.raise(Cause::Interrupt(interrupt), 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripherals::ram::Ram;
    use crate::peripherals::rom::Rom;
    use crate::PrivilegeLevel;
    use std::cell::RefCell;

    const RAM_BASE: u32 = 0x8000_0000;

    /// A core with `program` in ROM at the reset vector and 64 KiB of RAM.
    fn core_with(program: &[u8]) -> Core {
        let mut bus = Bus::new();
        bus.map(
            RESET_VECTOR,
            Rc::new(RefCell::new(Rom::new(program.to_vec()))),
        )
        .unwrap();
        bus.map(RAM_BASE, Rc::new(RefCell::new(Ram::new(0x10000))))
            .unwrap();
        Core::new(Rc::new(bus), Rc::new(Cell::new(0)), IrqLines::new())
    }

    fn a0() -> Specifier {
        Specifier::A0
    }

    fn reg(n: u8) -> Specifier {
        Specifier::new(n).unwrap()
    }

    #[test]
    fn test_add_program() {
        // addi a0, zero, 4; addi a1, zero, 1; add a1, a1, a0;
        // sw x16, -1792(zero); ebreak
        let mut core = core_with(&[
            0x13, 0x05, 0x40, 0x00, //
            0x93, 0x05, 0x10, 0x00, //
            0xb3, 0x85, 0xa5, 0x00, //
            0x23, 0x20, 0x00, 0x91, //
            0x73, 0x00, 0x10, 0x00, //
        ]);
        for _ in 0..5 {
            core.step();
        }
        assert_eq!(4, core.x(a0()));
        assert_eq!(5, core.x(reg(11)));
        // The ebreak trapped into M-mode with cause 3.
        assert_eq!(3, core.csr().read_force(csr::MCAUSE).unwrap());
        assert_eq!(
            RESET_VECTOR + 16,
            core.csr().read_force(csr::MEPC).unwrap()
        );
        assert_eq!(0, core.x(Specifier::X0));
    }

    #[test]
    fn test_memory_round_trip() {
        // lui a1, 0x80000; addi a0, zero, -3; sw a0, 8(a1); lw a2, 8(a1);
        // lb a3, 8(a1); lbu a4, 8(a1)
        let mut core = core_with(&[
            0xb7, 0x05, 0x00, 0x80, //
            0x13, 0x05, 0xd0, 0xff, //
            0x23, 0xa4, 0xa5, 0x00, //
            0x03, 0xa6, 0x85, 0x00, //
            0x83, 0x86, 0x85, 0x00, //
            0x03, 0xc7, 0x85, 0x00, //
        ]);
        for _ in 0..6 {
            core.step();
        }
        assert_eq!(0xFFFF_FFFD, core.x(reg(12)));
        assert_eq!(0xFFFF_FFFD, core.x(reg(13))); // sign-extended byte
        assert_eq!(0x0000_00FD, core.x(reg(14))); // zero-extended byte
    }

    #[test]
    fn test_misaligned_load_traps() {
        // lui a1, 0x80000; lw a0, 2(a1)
        let mut core = core_with(&[
            0xb7, 0x05, 0x00, 0x80, //
            0x03, 0xa5, 0x25, 0x00, //
        ]);
        core.step();
        core.step();
        assert_eq!(4, core.csr().read_force(csr::MCAUSE).unwrap());
        assert_eq!(
            RAM_BASE + 2,
            core.csr().read_force(csr::MTVAL).unwrap()
        );
        // The load's register write was discarded.
        assert_eq!(0, core.x(a0()));
    }

    #[test]
    fn test_jal_to_odd_target_traps() {
        // jal ra, +2
        let mut core = core_with(&[0xef, 0x00, 0x20, 0x00]);
        core.step();
        assert_eq!(0, core.csr().read_force(csr::MCAUSE).unwrap());
        assert_eq!(
            RESET_VECTOR + 2,
            core.csr().read_force(csr::MTVAL).unwrap()
        );
        // The link-register write was discarded along with the rest of the
        // cycle.
        assert_eq!(0, core.x(reg(1)));
    }

    #[test]
    fn test_illegal_instruction_tval_is_raw_word() {
        let mut core = core_with(&[0xff, 0xff, 0xff, 0xff]);
        core.step();
        assert_eq!(2, core.csr().read_force(csr::MCAUSE).unwrap());
        assert_eq!(0xFFFF_FFFF, core.csr().read_force(csr::MTVAL).unwrap());
    }

    #[test]
    fn test_mpp_coercion_through_csrrw() {
        // lui a0, 0x2; addi a0, a0, -0x800 ; csrrw zero, mstatus, a0
        // Writes 0x1800 (mpp = M).
        let mut core = core_with(&[
            0x37, 0x25, 0x00, 0x00, //
            0x13, 0x05, 0x05, 0x80, //
            0x73, 0x10, 0x05, 0x30, //
        ]);
        for _ in 0..3 {
            core.step();
        }
        assert_eq!(0x1800, core.csr().read_force(csr::MSTATUS).unwrap());
        // Writing the reserved value 0x1000 leaves mpp = U.
        let mut core = core_with(&[
            0x37, 0x15, 0x00, 0x00, //
            0x73, 0x10, 0x05, 0x30, //
        ]);
        core.step();
        core.step();
        assert_eq!(0, core.csr().read_force(csr::MSTATUS).unwrap() & 0x1800);
    }

    #[test]
    fn test_lr_sc_success_and_failure() {
        // lui a1, 0x80000; addi a2, zero, 7;
        // lr.w a0, (a1); sc.w a3, a2, (a1); sc.w a4, a2, (a1)
        let mut core = core_with(&[
            0xb7, 0x05, 0x00, 0x80, //
            0x13, 0x06, 0x70, 0x00, //
            0x2f, 0xa5, 0x05, 0x10, //
            0xaf, 0xa6, 0xc5, 0x18, //
            0x2f, 0xa7, 0xc5, 0x18, //
        ]);
        for _ in 0..5 {
            core.step();
        }
        // First store-conditional succeeded and wrote the value; the second
        // failed because the first consumed the reservation.
        assert_eq!(0, core.x(reg(13)));
        assert_eq!(1, core.x(reg(14)));
        assert_eq!(7, core.mmu.bus().read_word(RAM_BASE));
    }

    #[test]
    fn test_trap_clears_reservation() {
        // lui a1, 0x80000; lr.w a0, (a1); ecall; (trap to 0x1100:)
        // sc.w a3, a2, (a1)
        let mut program = vec![
            0xb7, 0x05, 0x00, 0x80, //
            0x2f, 0xa5, 0x05, 0x10, //
            0x73, 0x00, 0x00, 0x00, //
        ];
        // Pad up to the trap vector with zeros, then the sc.w.
        program.resize(0x100, 0);
        program.extend_from_slice(&[0xaf, 0xa6, 0xc5, 0x18]);
        let mut core = core_with(&program);
        core.csr_mut().write(csr::MTVEC, RESET_VECTOR + 0x100).unwrap();
        for _ in 0..4 {
            core.step();
        }
        assert_eq!(11, core.csr().read_force(csr::MCAUSE).unwrap());
        // The sc.w after the trap must fail without writing.
        assert_eq!(1, core.x(reg(13)));
        assert_eq!(0, core.mmu.bus().read_word(RAM_BASE));
    }

    #[test]
    fn test_mret_restores_pre_trap_state() {
        // ecall; (vector at +8:) mret
        let mut core = core_with(&[
            0x73, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0x73, 0x00, 0x20, 0x30, //
        ]);
        core.csr_mut().write(csr::MTVEC, RESET_VECTOR + 8).unwrap();
        core.csr_mut().write(csr::MSTATUS, 0x8).unwrap(); // mie = 1
        core.step();
        assert_eq!(PrivilegeLevel::Machine, core.csr().cur_priv());
        assert!(!core.csr().status().mie());
        assert_eq!(RESET_VECTOR + 8, core.pc());
        core.step();
        // mret returns to the faulting pc with mie restored.
        assert_eq!(RESET_VECTOR, core.pc());
        assert!(core.csr().status().mie());
        assert_eq!(PrivilegeLevel::Machine, core.csr().cur_priv());
    }

    #[test]
    fn test_timer_interrupt_delivery() {
        // A WFI loop: wfi; beq zero, zero, -4
        let mut core = core_with(&[
            0x73, 0x00, 0x50, 0x10, //
            0xe3, 0x0e, 0x00, 0xfe, //
        ]);
        core.csr_mut().write(csr::MTVEC, 0x4000).unwrap();
        core.csr_mut().write(csr::MSTATUS, 0x8).unwrap(); // mstatus.mie
        core.csr_mut().write(csr::MIE, 1 << 7).unwrap(); // mie.mtie
        let timer = Rc::clone(&core.irq.timer);
        core.step();
        core.step();
        assert_eq!(RESET_VECTOR, core.pc());
        // Raise the line; the next cycle must vector to mtvec.
        timer.set(true);
        core.step();
        assert_eq!(0x4000, core.pc());
        assert_eq!(
            0x8000_0007,
            core.csr().read_force(csr::MCAUSE).unwrap()
        );
        // The interrupted instruction is re-executed after the handler:
        // mepc points at it.
        assert_eq!(RESET_VECTOR, core.csr().read_force(csr::MEPC).unwrap());
    }

    #[test]
    fn test_csr_write_cannot_preempt_itself() {
        // With a timer interrupt already pending but mstatus.mie clear,
        // the instruction that sets mstatus.mie must complete; the
        // interrupt is taken on the following cycle.
        // csrrsi zero, mstatus, 8; nop
        let mut core = core_with(&[
            0x73, 0x60, 0x04, 0x30, //
            0x13, 0x00, 0x00, 0x00, //
        ]);
        core.csr_mut().write(csr::MTVEC, 0x4000).unwrap();
        core.csr_mut().write(csr::MIE, 1 << 7).unwrap();
        core.irq.timer.set(true);
        core.step();
        // No trap yet: the enable was latched as zero this cycle.
        assert_eq!(RESET_VECTOR + 4, core.pc());
        core.step();
        assert_eq!(0x4000, core.pc());
    }

    /// `addi a3, a3, imm`, for building page-table-entry constants.
    fn addi_a3(imm: i32) -> [u8; 4] {
        let word = ((imm as u32 & 0xFFF) << 20) | 0x0006_8693;
        word.to_le_bytes()
    }

    /// Common prefix of the Sv32 end-to-end tests: build a two-level table
    /// in RAM mapping VA pages 0x2000 (data) and 0x3000 (code) onto physical
    /// page 0x80001, copy a guest program into that page, enable
    /// translation, and mret into it at VA 0x3000. The leaf for the data
    /// page is `V|R|A`; `code_flag_delta` is added on top of that for the
    /// code page's leaf. The guest program is `lui a5, 0x2; lw a0, 0(a5)`
    /// plus a trailing ecall.
    fn sv32_program(code_flag_delta: i32, set_mpp_s: bool) -> Vec<u8> {
        let mut program = vec![
            0xb7, 0x05, 0x00, 0x80, // lui a1, 0x80000       (root table)
            0x37, 0x16, 0x00, 0x20, // lui a2, 0x20001
            0x13, 0x06, 0x16, 0x80, // addi a2, a2, -2047    (ppn 0x80002 | V)
            0x23, 0xa0, 0xc5, 0x00, // sw a2, 0(a1)
            0x37, 0x27, 0x00, 0x80, // lui a4, 0x80002       (second level)
            0xb7, 0x06, 0x00, 0x20, // lui a3, 0x20000
        ];
        program.extend_from_slice(&addi_a3(0x443)); // ppn 0x80001 | V|R|A
        program.extend_from_slice(&[
            0x23, 0x24, 0xd7, 0x00, // sw a3, 8(a4)          (data page leaf)
        ]);
        program.extend_from_slice(&addi_a3(code_flag_delta));
        program.extend_from_slice(&[
            0x23, 0x26, 0xd7, 0x00, // sw a3, 12(a4)         (code page leaf)
            0x37, 0x18, 0x00, 0x80, // lui a6, 0x80001       (guest code page)
            0xb7, 0x28, 0x00, 0x00, // lui a7, 0x2
            0x93, 0x88, 0x78, 0x7b, // addi a7, a7, 0x7b7    (lui a5, 0x2)
            0x23, 0x20, 0x18, 0x01, // sw a7, 0(a6)
            0x37, 0xa9, 0x07, 0x00, // lui s2, 0x7a
            0x13, 0x09, 0x39, 0x50, // addi s2, s2, 0x503    (lw a0, 0(a5))
            0x23, 0x22, 0x28, 0x01, // sw s2, 4(a6)
            0x13, 0x0b, 0x30, 0x07, // addi s6, zero, 0x73   (ecall)
            0x23, 0x24, 0x68, 0x01, // sw s6, 8(a6)
            0xb7, 0x09, 0x08, 0x80, // lui s3, 0x80080
            0x73, 0x90, 0x09, 0x18, // csrrw zero, satp, s3
            0x37, 0x3a, 0x00, 0x00, // lui s4, 0x3
            0x73, 0x10, 0x1a, 0x34, // csrrw zero, mepc, s4
        ]);
        if set_mpp_s {
            program.extend_from_slice(&[
                0x93, 0x0a, 0x10, 0x00, // addi s5, zero, 1
                0x93, 0x9a, 0xba, 0x00, // slli s5, s5, 11
                0x73, 0x90, 0x0a, 0x30, // csrrw zero, mstatus, s5
            ]);
        }
        program.extend_from_slice(&[0x73, 0x00, 0x20, 0x30]); // mret
        program
    }

    #[test]
    fn test_sv32_supervisor_load_succeeds() {
        // Data page V|R|A (u=0), code page V|R|X|A (u=0), entered in S-mode.
        let program = sv32_program(0x8, true);
        let setup_cycles = program.len() / 4;
        let mut core = core_with(&program);
        for _ in 0..setup_cycles + 3 {
            core.step();
        }
        // The guest load read its own first instruction word through the
        // data mapping, then the ecall trapped back into M-mode.
        assert_eq!(0x0000_27B7, core.x(a0()));
        assert_eq!(9, core.csr().read_force(csr::MCAUSE).unwrap());
        assert_eq!(PrivilegeLevel::Machine, core.csr().cur_priv());
    }

    #[test]
    fn test_sv32_user_load_page_fault() {
        // Data page V|R|A with u=0, code page V|R|X|U|A, entered in U-mode.
        let program = sv32_program(0x18, false);
        let setup_cycles = program.len() / 4;
        let mut core = core_with(&program);
        for _ in 0..setup_cycles + 2 {
            core.step();
        }
        // The fetches succeeded (user page), but the load hit the
        // supervisor-only data page.
        assert_eq!(13, core.csr().read_force(csr::MCAUSE).unwrap());
        assert_eq!(0x2000, core.csr().read_force(csr::MTVAL).unwrap());
        assert_eq!(0x3004, core.csr().read_force(csr::MEPC).unwrap());
        // The load's destination write was discarded with the trap.
        assert_eq!(0, core.x(a0()));
        assert_eq!(PrivilegeLevel::Machine, core.csr().cur_priv());
    }

    #[test]
    fn test_counters_advance_once_per_cycle() {
        let mut core = core_with(&[0x13, 0x00, 0x00, 0x00]); // nop
        core.step();
        core.step();
        assert_eq!(2, core.csr().read_force(csr::MCYCLE).unwrap());
        assert_eq!(2, core.csr().read_force(csr::MINSTRET).unwrap());
        assert_eq!(2, core.csr().read_force(csr::CYCLE).unwrap());
    }

    #[test]
    fn test_interrupt_priority_order() {
        let mut core = core_with(&[0x13, 0x00, 0x00, 0x00]);
        core.csr_mut().write(csr::MTVEC, 0x4000).unwrap();
        core.csr_mut().write(csr::MSTATUS, 0x8).unwrap();
        core.csr_mut().write(csr::MIE, 0x888).unwrap();
        core.irq.timer.set(true);
        core.irq.soft.set(true);
        core.irq.external.set(true);
        core.step();
        // External outranks timer outranks software.
        assert_eq!(
            0x8000_000B,
            core.csr().read_force(csr::MCAUSE).unwrap()
        );
    }
}
