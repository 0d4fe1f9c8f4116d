//! Trap causes and their delivery priority.

/// Synchronous exceptions, by their architectural cause codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exception {
    /// Instruction address is not on a four-byte aligned boundary in memory.
    InstructionAddressMisaligned,
    InstructionAccessFault,
    /// Raised for reserved encodings, malformed instructions, and any failed
    /// CSR access (non-existent address, privilege violation).
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned,
    LoadAccessFault,
    StoreOrAmoAddressMisaligned,
    StoreOrAmoAccessFault,
    EnvironmentCallFromUMode,
    EnvironmentCallFromSMode,
    EnvironmentCallFromMMode,
    InstructionPageFault,
    LoadPageFault,
    StoreOrAmoPageFault,
}

impl Exception {
    /// Returns the exception code (cause) for this exception.
    pub fn code(&self) -> u32 {
        match self {
            Self::InstructionAddressMisaligned => 0,
            Self::InstructionAccessFault => 1,
            Self::IllegalInstruction => 2,
            Self::Breakpoint => 3,
            Self::LoadAddressMisaligned => 4,
            Self::LoadAccessFault => 5,
            Self::StoreOrAmoAddressMisaligned => 6,
            Self::StoreOrAmoAccessFault => 7,
            Self::EnvironmentCallFromUMode => 8,
            Self::EnvironmentCallFromSMode => 9,
            Self::EnvironmentCallFromMMode => 11,
            Self::InstructionPageFault => 12,
            Self::LoadPageFault => 13,
            Self::StoreOrAmoPageFault => 15,
        }
    }
}

/// Asynchronous interrupts, by their architectural cause codes.
///
/// Only the machine-level interrupts exist here; the supervisor levels are
/// not delegated and therefore never delivered on their own.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interrupt {
    MachineSoftware,
    MachineTimer,
    MachineExternal,
}

impl Interrupt {
    /// Returns the exception code (cause) for this interrupt.
    pub fn code(&self) -> u32 {
        match self {
            Self::MachineSoftware => 3,
            Self::MachineTimer => 7,
            Self::MachineExternal => 11,
        }
    }

    /// Bit index of this interrupt in the mip/mie registers. Equal to the
    /// cause code.
    pub fn bit(&self) -> u32 {
        self.code()
    }
}

/// Either kind of trap cause.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cause {
    Exception(Exception),
    Interrupt(Interrupt),
}

impl Cause {
    /// The mcause encoding: the cause code, with the high bit set for
    /// interrupts.
    pub fn mcause(&self) -> u32 {
        match self {
            Self::Exception(e) => e.code(),
            Self::Interrupt(i) => i.code() | 0x8000_0000,
        }
    }

    /// Delivery priority; a higher rank preempts a lower one, and an equal
    /// rank raised later replaces the earlier one.
    pub fn priority(&self) -> u8 {
        use Exception::*;
        match self {
            Self::Exception(e) => match e {
                StoreOrAmoAccessFault | LoadAccessFault => 1,
                StoreOrAmoPageFault | LoadPageFault => 2,
                StoreOrAmoAddressMisaligned | LoadAddressMisaligned => 3,
                IllegalInstruction | InstructionAddressMisaligned | Breakpoint
                | EnvironmentCallFromUMode | EnvironmentCallFromSMode
                | EnvironmentCallFromMMode => 4,
                InstructionAccessFault | InstructionPageFault => 5,
            },
            Self::Interrupt(i) => match i {
                Interrupt::MachineSoftware => 6,
                Interrupt::MachineTimer => 7,
                Interrupt::MachineExternal => 8,
            },
        }
    }
}

impl From<Exception> for Cause {
    fn from(value: Exception) -> Self {
        Self::Exception(value)
    }
}

impl From<Interrupt> for Cause {
    fn from(value: Interrupt) -> Self {
        Self::Interrupt(value)
    }
}

/// A trap waiting to be delivered at the end of the current cycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PendingTrap {
    pub cause: Cause,
    pub tval: u32,
}
