//! Physical memory bus: a set of power-of-two windows routing accesses to
//! memory-mapped peripherals.

use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;
use thiserror::Error;

/// A device mapped into the physical address space.
///
/// The six access operations form the closed capability set of the bus:
/// byte, halfword, and word reads and writes. Addresses passed to a
/// peripheral are relative to its window base.
///
/// Halfword and word accesses default to a little-endian composition of byte
/// accesses, which is the right behavior for byte-addressable storage.
/// Peripherals that are strictly word-aligned register files (the interrupt
/// controller, the config register, GPIO) override the wider accesses
/// directly and ignore the narrow ones.
pub trait Peripheral: Debug {
    /// The number of addressable bytes this peripheral occupies. The bus
    /// rounds this up to the next power of two when mapping.
    fn size(&self) -> u32;

    fn read_byte(&mut self, offset: u32) -> u8;

    fn write_byte(&mut self, offset: u32, value: u8);

    fn read_half(&mut self, offset: u32) -> u16 {
        u16::from_le_bytes([self.read_byte(offset), self.read_byte(offset + 1)])
    }

    fn write_half(&mut self, offset: u32, value: u16) {
        let [b0, b1] = value.to_le_bytes();
        self.write_byte(offset, b0);
        self.write_byte(offset + 1, b1);
    }

    fn read_word(&mut self, offset: u32) -> u32 {
        u32::from_le_bytes([
            self.read_byte(offset),
            self.read_byte(offset + 1),
            self.read_byte(offset + 2),
            self.read_byte(offset + 3),
        ])
    }

    fn write_word(&mut self, offset: u32, value: u32) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write_byte(offset + i as u32, b);
        }
    }
}

/// Shared handle to a mapped peripheral.
///
/// The bus owns its peripherals, but device-specific holders (the run loop
/// polling the halt flag, the interrupt controller's timer) keep clones of
/// the same handle; the lifetime is that of the longest holder.
pub type SharedPeripheral = Rc<RefCell<dyn Peripheral>>;

#[derive(Debug)]
struct Window {
    base: u32,
    /// `!(size - 1)` for the power-of-two window size; an address `a` falls
    /// in this window iff `a & mask == base`.
    mask: u32,
    peripheral: SharedPeripheral,
}

/// Routes 32-bit physical addresses to the unique peripheral window covering
/// them.
///
/// Windows are power-of-two sized, naturally aligned, and must not overlap.
/// Accesses outside every window read as zero and discard writes. Lookup is
/// a linear scan; the peripheral count is a small constant.
#[derive(Debug, Default)]
pub struct Bus {
    windows: Vec<Window>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `peripheral` at `base`.
    ///
    /// The window size is the peripheral's declared size rounded up to the
    /// next power of two. Fails if the size is zero, if `base` is not aligned
    /// to the window size, or if the window overlaps a previous mapping.
    pub fn map(&mut self, base: u32, peripheral: SharedPeripheral) -> Result<(), MapError> {
        let declared = peripheral.borrow().size();
        if declared == 0 {
            return Err(MapError::ZeroSize { base });
        }
        let size = declared.next_power_of_two();
        let mask = !(size - 1);
        if base & !mask != 0 {
            return Err(MapError::MisalignedBase { base, size });
        }
        for window in &self.windows {
            // Two naturally aligned power-of-two windows overlap iff the
            // coarser of the two masks maps both bases to the same window.
            let coarse = window.mask & mask;
            if window.base & coarse == base & coarse {
                return Err(MapError::Overlap {
                    base,
                    other: window.base,
                });
            }
        }
        self.windows.push(Window {
            base,
            mask,
            peripheral,
        });
        Ok(())
    }

    fn lookup(&self, addr: u32) -> Option<(&SharedPeripheral, u32)> {
        self.windows
            .iter()
            .find(|w| addr & w.mask == w.base)
            .map(|w| (&w.peripheral, addr & !w.mask))
    }

    pub fn read_byte(&self, addr: u32) -> u8 {
        match self.lookup(addr) {
            Some((p, offset)) => p.borrow_mut().read_byte(offset),
            None => 0,
        }
    }

    pub fn write_byte(&self, addr: u32, value: u8) {
        if let Some((p, offset)) = self.lookup(addr) {
            p.borrow_mut().write_byte(offset, value);
        }
    }

    pub fn read_half(&self, addr: u32) -> u16 {
        match self.lookup(addr) {
            Some((p, offset)) => p.borrow_mut().read_half(offset),
            None => 0,
        }
    }

    pub fn write_half(&self, addr: u32, value: u16) {
        if let Some((p, offset)) = self.lookup(addr) {
            p.borrow_mut().write_half(offset, value);
        }
    }

    pub fn read_word(&self, addr: u32) -> u32 {
        match self.lookup(addr) {
            Some((p, offset)) => p.borrow_mut().read_word(offset),
            None => 0,
        }
    }

    pub fn write_word(&self, addr: u32, value: u32) {
        if let Some((p, offset)) = self.lookup(addr) {
            p.borrow_mut().write_word(offset, value);
        }
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MapError {
    #[error("peripheral at {base:#010x} declares a zero-sized window")]
    ZeroSize { base: u32 },
    #[error("base address {base:#010x} is not aligned to the window size {size:#x}")]
    MisalignedBase { base: u32, size: u32 },
    #[error("window at {base:#010x} overlaps the window at {other:#010x}")]
    Overlap { base: u32, other: u32 },
}
