use bitvec::{field::BitField, order::Lsb0, view::BitView};

use crate::PrivilegeLevel;

/// Writable bits of mstatus: SIE, MIE, SPIE, MPIE, SPP, MPP.
pub const MSTATUS_MASK: u32 = 0b0001_1001_1010_1010;

/// Bits of mstatus visible through the sstatus alias: SIE, SPIE, SPP.
pub const SSTATUS_MASK: u32 = 0b0000_0001_0010_0010;

/// The mstatus register, with sstatus as a restricted view of it.
///
/// > The mstatus register keeps track of and controls the hart's current
/// > operating state. A restricted view of mstatus appears as the sstatus
/// > register in the S-level ISA.
///
/// Only the interrupt-enable and previous-state fields are implemented; all
/// other fields read as zero and ignore writes. Writes through either alias
/// leave the bits outside that alias's mask untouched.
#[derive(Debug, Clone)]
pub struct Status {
    mstatus: u32,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        Self { mstatus: 0 }
    }

    pub fn read_mstatus(&self) -> u32 {
        self.mstatus
    }

    /// Write through the mstatus alias.
    ///
    /// The MPP field is WARL: the reserved level `2` is coerced to U before
    /// masking.
    pub fn write_mstatus(&mut self, value: u32) {
        let mut value = value;
        let bits = value.view_bits_mut::<Lsb0>();
        if bits[idx::MPP..idx::MPP + 2].load_le::<u8>() == 2 {
            bits[idx::MPP..idx::MPP + 2].store_le(0u8);
        }
        self.mstatus = value & MSTATUS_MASK;
    }

    pub fn read_sstatus(&self) -> u32 {
        self.mstatus & SSTATUS_MASK
    }

    /// Write through the sstatus alias, preserving every mstatus bit outside
    /// the sstatus view.
    pub fn write_sstatus(&mut self, value: u32) {
        self.mstatus = self.mstatus & !SSTATUS_MASK | value & SSTATUS_MASK;
    }

    /// Returns `true` if the MIE (M-mode Interrupt Enable) bit is set.
    pub fn mie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MIE]
    }

    pub fn set_mie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MIE, value);
    }

    /// Returns `true` if the SIE (S-mode Interrupt Enable) bit is set.
    pub fn sie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SIE]
    }

    pub fn set_sie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SIE, value);
    }

    /// Returns `true` if the MPIE (M-mode Previous Interrupt Enable) bit is
    /// set.
    pub fn mpie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPIE]
    }

    pub fn set_mpie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPIE, value);
    }

    /// Returns `true` if the SPIE (S-mode Previous Interrupt Enable) bit is
    /// set.
    pub fn spie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SPIE]
    }

    pub fn set_spie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPIE, value);
    }

    /// Returns the privilege level encoded by the MPP (M-mode Previous
    /// Privilege level) field.
    ///
    /// The stored value is always a defined level, since writes coerce the
    /// reserved encoding.
    pub fn mpp(&self) -> PrivilegeLevel {
        let bits = self.mstatus.view_bits::<Lsb0>()[idx::MPP..idx::MPP + 2].load_le::<u8>();
        PrivilegeLevel::from_u2(bits).unwrap()
    }

    pub fn set_mpp(&mut self, value: PrivilegeLevel) {
        self.mstatus.view_bits_mut::<Lsb0>()[idx::MPP..idx::MPP + 2].store_le(value as u8);
    }

    /// Returns the privilege level encoded by the (one-bit) SPP (S-mode
    /// Previous Privilege level) field.
    pub fn spp(&self) -> PrivilegeLevel {
        match self.mstatus.view_bits::<Lsb0>()[idx::SPP] {
            false => PrivilegeLevel::User,
            true => PrivilegeLevel::Supervisor,
        }
    }

    pub fn set_spp(&mut self, value: PrivilegeLevel) {
        let bit = value >= PrivilegeLevel::Supervisor;
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPP, bit);
    }
}

/// Bit indices into the mstatus register.
mod idx {
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const MPP: usize = 11;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_accessors() {
        let mut status = Status::new();
        status.set_mie(true);
        status.set_mpie(true);
        status.set_mpp(PrivilegeLevel::Machine);
        assert!(status.mie());
        assert!(status.mpie());
        assert_eq!(PrivilegeLevel::Machine, status.mpp());
        assert_eq!(0b0001_1000_1000_1000, status.read_mstatus());
    }

    #[test]
    fn test_reserved_mpp_coerced_to_user() {
        let mut status = Status::new();
        status.write_mstatus(0x0000_1800);
        assert_eq!(PrivilegeLevel::Machine, status.mpp());
        status.write_mstatus(0x0000_1000);
        assert_eq!(PrivilegeLevel::User, status.mpp());
    }

    #[test]
    fn test_sstatus_is_a_subset_view() {
        let mut status = Status::new();
        status.write_mstatus(MSTATUS_MASK);
        assert_eq!(SSTATUS_MASK, status.read_sstatus());
        // Writing zero through sstatus leaves the M-only bits alone.
        status.write_sstatus(0);
        assert_eq!(MSTATUS_MASK & !SSTATUS_MASK, status.read_mstatus());
        // And the other way around.
        status.write_sstatus(0xFFFF_FFFF);
        assert_eq!(
            status.read_mstatus() & SSTATUS_MASK,
            status.read_sstatus()
        );
    }

    #[test]
    fn test_spp_round_trip() {
        let mut status = Status::new();
        status.set_spp(PrivilegeLevel::Supervisor);
        assert_eq!(PrivilegeLevel::Supervisor, status.spp());
        status.set_spp(PrivilegeLevel::User);
        assert_eq!(PrivilegeLevel::User, status.spp());
    }
}
