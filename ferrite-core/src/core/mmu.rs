//! Sv32 address translation in front of the physical bus.

use std::rc::Rc;

use super::csr::CsrFile;
use crate::{Bus, PrivilegeLevel};

/// The access kinds the translation distinguishes; each failed check raises
/// the page fault matching the kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessKind {
    Load,
    Store,
    Fetch,
}

/// A latched translation failure: the kind of access that failed and the
/// faulting virtual address (the trap value of the resulting exception).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Fault {
    pub kind: AccessKind,
    pub vaddr: u32,
}

/// Memory access path of the hart.
///
/// When the current privilege level is M or `satp.mode` is off, virtual
/// equals physical. Otherwise every access walks the two-level Sv32 table;
/// there is no TLB.
///
/// A failed walk latches a [`Fault`] that makes every subsequent access a
/// no-op (reads return zero, writes are dropped) until the driver clears it
/// at the top of the next cycle. The instruction path inspects the latch
/// after each memory operation and converts it into the matching page-fault
/// exception.
#[derive(Debug)]
pub struct Mmu {
    bus: Rc<Bus>,
    fault: Option<Fault>,
}

impl Mmu {
    pub fn new(bus: Rc<Bus>) -> Self {
        Self { bus, fault: None }
    }

    /// The raw physical bus, bypassing translation.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    pub fn clear_fault(&mut self) {
        self.fault = None;
    }

    pub fn read_byte(&mut self, csr: &CsrFile, addr: u32) -> u8 {
        match self.access(csr, addr, AccessKind::Load) {
            Some(pa) => self.bus.read_byte(pa),
            None => 0,
        }
    }

    pub fn write_byte(&mut self, csr: &CsrFile, addr: u32, value: u8) {
        if let Some(pa) = self.access(csr, addr, AccessKind::Store) {
            self.bus.write_byte(pa, value);
        }
    }

    pub fn read_half(&mut self, csr: &CsrFile, addr: u32) -> u16 {
        match self.access(csr, addr, AccessKind::Load) {
            Some(pa) => self.bus.read_half(pa),
            None => 0,
        }
    }

    pub fn write_half(&mut self, csr: &CsrFile, addr: u32, value: u16) {
        if let Some(pa) = self.access(csr, addr, AccessKind::Store) {
            self.bus.write_half(pa, value);
        }
    }

    pub fn read_word(&mut self, csr: &CsrFile, addr: u32) -> u32 {
        match self.access(csr, addr, AccessKind::Load) {
            Some(pa) => self.bus.read_word(pa),
            None => 0,
        }
    }

    pub fn write_word(&mut self, csr: &CsrFile, addr: u32, value: u32) {
        if let Some(pa) = self.access(csr, addr, AccessKind::Store) {
            self.bus.write_word(pa, value);
        }
    }

    /// Fetch the instruction word at `addr`.
    pub fn read_inst(&mut self, csr: &CsrFile, addr: u32) -> u32 {
        match self.access(csr, addr, AccessKind::Fetch) {
            Some(pa) => self.bus.read_word(pa),
            None => 0,
        }
    }

    fn access(&mut self, csr: &CsrFile, addr: u32, kind: AccessKind) -> Option<u32> {
        if self.fault.is_some() {
            // A latched fault short-circuits the rest of the cycle.
            return None;
        }
        self.translate(csr, addr, kind)
    }

    fn translate(&mut self, csr: &CsrFile, addr: u32, kind: AccessKind) -> Option<u32> {
        let satp = csr.satp();
        if csr.cur_priv() == PrivilegeLevel::Machine || satp & (1 << 31) == 0 {
            return Some(addr);
        }
        let va = VirtAddr(addr);
        let root = (satp & 0x003F_FFFF).wrapping_shl(12);
        let pte = Pte(self.bus.read_word(root.wrapping_add(va.vpn1() * 4)));
        if !pte.v() || (!pte.r() && pte.w()) {
            return self.page_fault(kind, addr);
        }
        if !pte.r() && !pte.x() {
            // Pointer to the second-level table.
            let table = pte.ppn().wrapping_shl(12);
            let pte = Pte(self.bus.read_word(table.wrapping_add(va.vpn0() * 4)));
            if !pte.v() || (!pte.r() && pte.w()) {
                return self.page_fault(kind, addr);
            }
            if !pte.r() && !pte.x() {
                // A pointer at the leaf level is malformed.
                return self.page_fault(kind, addr);
            }
            if !self.check_leaf(csr, pte, kind) {
                return self.page_fault(kind, addr);
            }
            Some(pte.ppn().wrapping_shl(12) | va.offset())
        } else {
            // Leaf at the top level: a 4 MiB superpage.
            if !self.check_leaf(csr, pte, kind) {
                return self.page_fault(kind, addr);
            }
            if pte.ppn0() != 0 {
                // Misaligned superpage.
                return self.page_fault(kind, addr);
            }
            Some(pte.ppn1().wrapping_shl(22) | va.vpn0() << 12 | va.offset())
        }
    }

    /// Permission and accessed/dirty checks common to both leaf levels.
    fn check_leaf(&self, csr: &CsrFile, pte: Pte, kind: AccessKind) -> bool {
        let permitted = match kind {
            AccessKind::Load => pte.r(),
            AccessKind::Store => pte.w(),
            AccessKind::Fetch => pte.x(),
        };
        if !permitted {
            return false;
        }
        // S-mode must not touch user pages, and U-mode only user pages.
        match csr.cur_priv() {
            PrivilegeLevel::Supervisor if pte.u() => return false,
            PrivilegeLevel::User if !pte.u() => return false,
            _ => {}
        }
        pte.a() && (kind != AccessKind::Store || pte.d())
    }

    fn page_fault(&mut self, kind: AccessKind, vaddr: u32) -> Option<u32> {
        self.fault = Some(Fault { kind, vaddr });
        None
    }
}

/// An Sv32 virtual address: {vpn1[31:22], vpn0[21:12], offset[11:0]}.
#[derive(Debug, Copy, Clone)]
struct VirtAddr(u32);

impl VirtAddr {
    fn offset(self) -> u32 {
        self.0 & 0xFFF
    }

    fn vpn0(self) -> u32 {
        (self.0 >> 12) & 0x3FF
    }

    fn vpn1(self) -> u32 {
        (self.0 >> 22) & 0x3FF
    }
}

/// An Sv32 page-table entry:
/// {ppn1[31:20], ppn0[19:10], rsw[9:8], d, a, g, u, x, w, r, v}.
#[derive(Debug, Copy, Clone)]
struct Pte(u32);

impl Pte {
    fn v(self) -> bool {
        self.0 & 1 != 0
    }

    fn r(self) -> bool {
        self.0 & (1 << 1) != 0
    }

    fn w(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    fn x(self) -> bool {
        self.0 & (1 << 3) != 0
    }

    fn u(self) -> bool {
        self.0 & (1 << 4) != 0
    }

    fn a(self) -> bool {
        self.0 & (1 << 6) != 0
    }

    fn d(self) -> bool {
        self.0 & (1 << 7) != 0
    }

    fn ppn0(self) -> u32 {
        (self.0 >> 10) & 0x3FF
    }

    fn ppn1(self) -> u32 {
        (self.0 >> 20) & 0xFFF
    }

    fn ppn(self) -> u32 {
        (self.0 >> 10) & 0x003F_FFFF
    }
}
