//! The control-and-status register file.

use log::trace;
use std::cell::Cell;
use std::rc::Rc;
use thiserror::Error;

use super::counters::Counters;
use super::status::Status;
use super::trap::PendingTrap;
use crate::{PrivilegeLevel, RawPrivilegeLevel};

/// General 12-bit value representing a CSR specifier. Note that this can
/// hold any 12-bit value, even if the value represents an unsupported or
/// non-existent CSR.
pub type CsrSpecifier = u16;

//
// Unprivileged counters/timers.
//
/// Cycle counter for RDCYCLE instruction; read-only shadow of [`MCYCLE`].
pub const CYCLE: CsrSpecifier = 0xC00;
/// Timer for RDTIME instruction; read-only shadow of the memory-mapped mtime.
pub const TIME: CsrSpecifier = 0xC01;
/// Instructions-retired counter; read-only shadow of [`MINSTRET`].
pub const INSTRET: CsrSpecifier = 0xC02;
/// Upper 32 bits of [`CYCLE`].
pub const CYCLEH: CsrSpecifier = 0xC80;
/// Upper 32 bits of [`TIME`].
pub const TIMEH: CsrSpecifier = 0xC81;
/// Upper 32 bits of [`INSTRET`].
pub const INSTRETH: CsrSpecifier = 0xC82;

//
// Supervisor trap setup and handling.
//
/// Supervisor status register; a restricted view of [`MSTATUS`].
pub const SSTATUS: CsrSpecifier = 0x100;
/// Supervisor interrupt-enable register.
pub const SIE: CsrSpecifier = 0x104;
/// Supervisor trap handler base address.
pub const STVEC: CsrSpecifier = 0x105;
/// Supervisor counter enable.
pub const SCOUNTEREN: CsrSpecifier = 0x106;
/// Scratch register for supervisor trap handling.
pub const SSCRATCH: CsrSpecifier = 0x140;
/// Supervisor exception program counter.
pub const SEPC: CsrSpecifier = 0x141;
/// Supervisor trap cause.
pub const SCAUSE: CsrSpecifier = 0x142;
/// Supervisor bad address or instruction.
pub const STVAL: CsrSpecifier = 0x143;
/// Supervisor interrupt pending.
pub const SIP: CsrSpecifier = 0x144;
/// Supervisor address translation and protection.
pub const SATP: CsrSpecifier = 0x180;

//
// Machine information registers (read-only zero).
//
/// Vendor ID.
pub const MVENDORID: CsrSpecifier = 0xF11;
/// Architecture ID.
pub const MARCHID: CsrSpecifier = 0xF12;
/// Implementation ID.
pub const MIMPID: CsrSpecifier = 0xF13;
/// Hardware thread ID.
pub const MHARTID: CsrSpecifier = 0xF14;

//
// Machine trap setup and handling.
//
/// Machine status register.
pub const MSTATUS: CsrSpecifier = 0x300;
/// ISA and extensions.
pub const MISA: CsrSpecifier = 0x301;
/// Machine exception delegation register.
pub const MEDELEG: CsrSpecifier = 0x302;
/// Machine interrupt delegation register.
pub const MIDELEG: CsrSpecifier = 0x303;
/// Machine interrupt-enable register.
pub const MIE: CsrSpecifier = 0x304;
/// Machine trap-handler base address.
pub const MTVEC: CsrSpecifier = 0x305;
/// Machine counter enable.
pub const MCOUNTEREN: CsrSpecifier = 0x306;
/// Scratch register for machine trap handlers.
pub const MSCRATCH: CsrSpecifier = 0x340;
/// Machine exception program counter.
pub const MEPC: CsrSpecifier = 0x341;
/// Machine trap cause.
pub const MCAUSE: CsrSpecifier = 0x342;
/// Machine bad address or instruction.
pub const MTVAL: CsrSpecifier = 0x343;
/// Machine interrupt pending.
pub const MIP: CsrSpecifier = 0x344;

//
// Machine memory protection (storage only, read-only zero here).
//
/// First physical memory protection configuration register.
pub const PMPCFG0: CsrSpecifier = 0x3A0;
/// Last physical memory protection configuration register.
pub const PMPCFG3: CsrSpecifier = 0x3A3;
/// First physical memory protection address register.
pub const PMPADDR0: CsrSpecifier = 0x3B0;
/// Last physical memory protection address register.
pub const PMPADDR15: CsrSpecifier = 0x3BF;

//
// Machine counters.
//
/// Machine cycle counter.
pub const MCYCLE: CsrSpecifier = 0xB00;
/// Machine instructions-retired counter.
pub const MINSTRET: CsrSpecifier = 0xB02;
/// Upper 32 bits of [`MCYCLE`].
pub const MCYCLEH: CsrSpecifier = 0xB80;
/// Upper 32 bits of [`MINSTRET`].
pub const MINSTRETH: CsrSpecifier = 0xB82;
/// Machine counter-inhibit register.
pub const MCOUNTINHIBIT: CsrSpecifier = 0x320;

/// Writable bits of mie and mip: MSIE/MSIP, MTIE/MTIP, MEIE/MEIP.
pub const MIE_MASK: u32 = 0x888;
/// See [`MIE_MASK`].
pub const MIP_MASK: u32 = 0x888;
/// Writable bits of satp: the PPN and the mode bit. The ASID field is
/// hard-wired to zero.
pub const SATP_MASK: u32 = 0x803F_FFFF;

/// Returns the minimum required privilege level to access a CSR.
///
/// Bits `9:8` of the specifier encode the level. The returned value may be
/// the reserved level, which no hart ever holds; comparing it numerically
/// against the current level is therefore sound.
pub fn required_privilege_level(specifier: CsrSpecifier) -> RawPrivilegeLevel {
    RawPrivilegeLevel::from_u2(((specifier >> 8) & 0b11) as u8)
}

/// The control-and-status register file, including the hart's current
/// privilege level and the trap entry/return state machinery.
#[derive(Debug)]
pub struct CsrFile {
    cur_priv: PrivilegeLevel,
    status: Status,
    mie: u32,
    mip: u32,
    mtvec: u32,
    mscratch: u32,
    mepc: u32,
    mcause: u32,
    mtval: u32,
    sscratch: u32,
    sepc: u32,
    satp: u32,
    counters: Counters,
    /// The memory-mapped mtime counter, shared with the interrupt
    /// controller; shadowed by the `time`/`timeh` CSRs.
    mtime: Rc<Cell<u64>>,
}

impl CsrFile {
    /// The misa value: MXL=32, extensions I, M, A, plus S-mode and U-mode.
    pub const MISA: u32 = 0x4014_1101;

    /// Create a CSR file in its reset state: everything zero, current
    /// privilege level M.
    pub fn new(mtime: Rc<Cell<u64>>) -> Self {
        Self {
            cur_priv: PrivilegeLevel::Machine,
            status: Status::new(),
            mie: 0,
            mip: 0,
            mtvec: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            sscratch: 0,
            sepc: 0,
            satp: 0,
            counters: Counters::new(),
            mtime,
        }
    }

    /// Re-establish the reset state.
    pub fn reset(&mut self) {
        *self = Self::new(Rc::clone(&self.mtime));
    }

    /// The hart's current privilege level.
    pub fn cur_priv(&self) -> PrivilegeLevel {
        self.cur_priv
    }

    #[cfg(test)]
    pub(crate) fn set_cur_priv(&mut self, level: PrivilegeLevel) {
        self.cur_priv = level;
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn satp(&self) -> u32 {
        self.satp
    }

    pub fn mie_value(&self) -> u32 {
        self.mie
    }

    pub fn mip_value(&self) -> u32 {
        self.mip
    }

    pub(crate) fn counters_mut(&mut self) -> &mut Counters {
        &mut self.counters
    }

    /// Latch the external interrupt lines into mip. Called once at the start
    /// of every cycle, before the instruction can observe mip.
    pub fn latch_interrupts(&mut self, timer: bool, soft: bool, external: bool) {
        let mut mip = self.mip & !MIP_MASK;
        if soft {
            mip |= 1 << 3;
        }
        if timer {
            mip |= 1 << 7;
        }
        if external {
            mip |= 1 << 11;
        }
        self.mip = mip;
    }

    /// Read a CSR, checking existence and the privilege encoded in its
    /// address.
    pub fn read(&self, specifier: CsrSpecifier) -> Result<u32, CsrError> {
        self.check_access(specifier)?;
        Ok(self.read_raw(specifier).unwrap())
    }

    /// Read a CSR for the debugger, ignoring the privilege gate. Returns
    /// `None` for unmapped addresses.
    pub fn read_force(&self, specifier: CsrSpecifier) -> Option<u32> {
        self.read_raw(specifier)
    }

    /// Write a CSR, applying its write mask and side effects.
    pub fn write(&mut self, specifier: CsrSpecifier, value: u32) -> Result<(), CsrError> {
        self.check_access(specifier)?;
        match specifier {
            SSTATUS => self.status.write_sstatus(value),
            MSTATUS => self.status.write_mstatus(value),
            SATP => self.satp = value & SATP_MASK,
            MIE => self.mie = value & MIE_MASK,
            MIP => self.mip = value & MIP_MASK,
            MTVEC => {
                // The two mode values above `vectored` are reserved; coerce
                // them to `direct`.
                let mut value = value;
                if value & 0b11 >= 2 {
                    value &= !0b11;
                }
                self.mtvec = value;
            }
            MSCRATCH => self.mscratch = value,
            MEPC => self.mepc = value,
            MCAUSE => self.mcause = value,
            MTVAL => self.mtval = value,
            SSCRATCH => self.sscratch = value,
            SEPC => self.sepc = value,
            // Counter, info, and misa writes are silently discarded, as are
            // writes to the zero-backed registers.
            _ => {}
        }
        Ok(())
    }

    fn check_access(&self, specifier: CsrSpecifier) -> Result<(), CsrError> {
        if self.read_raw(specifier).is_none() {
            return Err(CsrError::Nonexistent(specifier));
        }
        let required = required_privilege_level(specifier);
        if self.cur_priv < required {
            return Err(CsrError::Privileged {
                specifier,
                required,
                actual: self.cur_priv,
            });
        }
        Ok(())
    }

    /// Read without any access check. `None` means the address is unmapped,
    /// which the instruction path reports as an illegal instruction.
    fn read_raw(&self, specifier: CsrSpecifier) -> Option<u32> {
        let value = match specifier {
            CYCLE | MCYCLE => self.counters.mcycle(),
            CYCLEH | MCYCLEH => self.counters.mcycleh(),
            INSTRET | MINSTRET => self.counters.minstret(),
            INSTRETH | MINSTRETH => self.counters.minstreth(),
            TIME => self.mtime.get() as u32,
            TIMEH => (self.mtime.get() >> 32) as u32,
            SSTATUS => self.status.read_sstatus(),
            MSTATUS => self.status.read_mstatus(),
            MISA => Self::MISA,
            MIE => self.mie,
            MIP => self.mip,
            MTVEC => self.mtvec,
            MSCRATCH => self.mscratch,
            MEPC => self.mepc,
            MCAUSE => self.mcause,
            MTVAL => self.mtval,
            SSCRATCH => self.sscratch,
            SEPC => self.sepc,
            SATP => self.satp,
            // Hard-wired zero registers: aliases this implementation does
            // not back with storage, the info registers, and the PMP file.
            SIE | STVEC | SCOUNTEREN | SCAUSE | STVAL | SIP => 0,
            MVENDORID | MARCHID | MIMPID | MHARTID => 0,
            MEDELEG | MIDELEG | MCOUNTEREN | MCOUNTINHIBIT => 0,
            PMPCFG0..=PMPCFG3 | PMPADDR0..=PMPADDR15 => 0,
            _ => return None,
        };
        Some(value)
    }

    /// The instruction address control transfers to on trap entry.
    ///
    /// Direct mode vectors everything to the base; vectored mode offsets
    /// interrupts (and only interrupts) by four times the cause code.
    pub fn trap_vec(&self) -> u32 {
        if self.mtvec & 0b11 == 1 && self.mcause & 0x8000_0000 != 0 {
            self.mtvec - 1 + (self.mcause & 0x7FFF_FFFF) * 4
        } else {
            self.mtvec & !0b11
        }
    }

    /// Deliver `trap`, raised at `pc`, into M-mode. Returns the trap vector
    /// the hart must redirect to.
    pub fn enter_trap(&mut self, pc: u32, trap: &PendingTrap) -> u32 {
        self.mcause = trap.cause.mcause();
        self.mtval = trap.tval;
        self.mepc = pc & !0b11;
        self.status.set_mpie(self.status.mie());
        self.status.set_mie(false);
        self.status.set_mpp(self.cur_priv);
        self.cur_priv = PrivilegeLevel::Machine;
        let vector = self.trap_vec();
        trace!(
            "trap: cause={:#010x} tval={:#010x} epc={:#010x} -> {:#010x}",
            self.mcause,
            self.mtval,
            self.mepc,
            vector
        );
        vector
    }

    /// Return from a trap taken into `mode` (M or S). Returns the new
    /// `next_pc` on success; fails when the hart's privilege level is below
    /// `mode`, which the instruction path reports as an illegal instruction.
    pub fn return_from_trap(
        &mut self,
        mode: PrivilegeLevel,
    ) -> Result<u32, TrapReturnError> {
        if self.cur_priv < mode {
            return Err(TrapReturnError {
                mode,
                actual: self.cur_priv,
            });
        }
        let next_pc = match mode {
            PrivilegeLevel::Machine => {
                self.status.set_mie(self.status.mpie());
                self.status.set_mpie(true);
                self.cur_priv = self.status.mpp();
                self.status.set_mpp(PrivilegeLevel::User);
                self.mepc
            }
            PrivilegeLevel::Supervisor => {
                self.status.set_sie(self.status.spie());
                self.status.set_spie(true);
                self.cur_priv = self.status.spp();
                self.status.set_spp(PrivilegeLevel::User);
                self.sepc
            }
            PrivilegeLevel::User => unreachable!("no trap return to U-mode"),
        };
        trace!("trap return to {} at {:#010x}", self.cur_priv, next_pc);
        Ok(next_pc)
    }
}

/// Errors that can occur when accessing a CSR. Every one of them surfaces to
/// guest software as an illegal-instruction trap.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum CsrError {
    #[error("unsupported CSR: {0:#05x}")]
    Nonexistent(CsrSpecifier),
    #[error(
        "cannot access CSR {specifier:#05x} from privilege level {actual}, \
         since it requires privilege level {required}"
    )]
    Privileged {
        specifier: CsrSpecifier,
        required: RawPrivilegeLevel,
        actual: PrivilegeLevel,
    },
}

/// Attempt to execute a trap-return instruction above the hart's privilege.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("cannot return from a {mode}-mode trap at privilege level {actual}")]
pub struct TrapReturnError {
    mode: PrivilegeLevel,
    actual: PrivilegeLevel,
}
