//! The default machine: a core wired to the standard memory map.

use log::debug;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::bus::{Bus, MapError, SharedPeripheral};
use crate::core::{Core, IrqLines};
use crate::peripherals::clint::Clint;
use crate::peripherals::confreg::ConfReg;
use crate::peripherals::debug_port::DebugPort;
use crate::peripherals::gpio::Gpio;
use crate::peripherals::ram::Ram;
use crate::peripherals::rom::Rom;
use crate::registers::Specifier;

/// Boot ROM window, equal to the reset vector.
pub const ROM_BASE: u32 = crate::core::RESET_VECTOR;
/// Board configuration register window.
pub const CONFREG_BASE: u32 = 0x1000_0000;
/// Main memory window.
pub const RAM_BASE: u32 = 0x8000_0000;
/// GPIO window (halt flag and console byte port).
pub const GPIO_BASE: u32 = 0x9000_0000;
/// Core-local interruptor window.
pub const CLINT_BASE: u32 = 0x9001_0000;
/// Optional flash window.
pub const FLASH_BASE: u32 = 0x9002_0000;
/// Debugger trigger window.
pub const DEBUG_BASE: u32 = 0xFFFF_FFF0;

/// Construction parameters of a [`Board`].
pub struct Config {
    /// Boot image placed in ROM at the reset vector.
    pub rom: Rom,
    /// Main memory size in bytes.
    pub ram_size: usize,
    /// Contents of the optional flash window.
    pub flash: Option<Vec<u8>>,
}

/// A complete machine: one core, the standard memory map, and the interrupt
/// wiring between the CLINT and the core.
pub struct Board {
    core: Core,
    bus: Rc<Bus>,
    clint: Rc<RefCell<Clint>>,
    gpio: Rc<RefCell<Gpio>>,
    debug_pause: Rc<Cell<bool>>,
}

impl Board {
    pub fn new(config: Config) -> Result<Self, MapError> {
        let clint = Clint::new();
        let mtime = clint.mtime();
        let mut irq = IrqLines::new();
        irq.timer = clint.timer_line();
        irq.soft = clint.soft_line();

        let gpio = Rc::new(RefCell::new(Gpio::new()));
        let clint = Rc::new(RefCell::new(clint));
        let debug_port = DebugPort::new();
        let debug_pause = debug_port.pause_flag();

        debug!(
            "rom image: {} bytes at {:#010x}, ram: {} bytes at {:#010x}",
            config.rom.len(),
            ROM_BASE,
            config.ram_size,
            RAM_BASE
        );

        let mut bus = Bus::new();
        bus.map(ROM_BASE, Rc::new(RefCell::new(config.rom)))?;
        bus.map(CONFREG_BASE, Rc::new(RefCell::new(ConfReg::new())))?;
        bus.map(RAM_BASE, Rc::new(RefCell::new(Ram::new(config.ram_size))))?;
        bus.map(GPIO_BASE, Rc::clone(&gpio) as SharedPeripheral)?;
        bus.map(CLINT_BASE, Rc::clone(&clint) as SharedPeripheral)?;
        if let Some(image) = config.flash {
            let flash = Ram::with_image(image.len(), &image);
            bus.map(FLASH_BASE, Rc::new(RefCell::new(flash)))?;
        }
        bus.map(DEBUG_BASE, Rc::new(RefCell::new(debug_port)))?;

        let bus = Rc::new(bus);
        let core = Core::new(Rc::clone(&bus), mtime, irq);
        Ok(Self {
            core,
            bus,
            clint,
            gpio,
            debug_pause,
        })
    }

    /// Run one cycle: advance the timer, then execute one instruction.
    pub fn step(&mut self) {
        self.clint.borrow_mut().tick();
        self.core.step();
    }

    /// `true` once guest software has raised the halt flag.
    pub fn halted(&self) -> bool {
        self.gpio.borrow().halted()
    }

    /// Process exit status of the run: guest register `a0` at halt.
    pub fn exit_code(&self) -> u32 {
        self.core.x(Specifier::A0)
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    /// The raw physical bus, bypassing address translation. Used by the
    /// debugger's memory examination and dereference operator.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Drain the debugger-port pause request.
    pub fn take_debug_pause(&mut self) -> bool {
        self.debug_pause.replace(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_with(program: &[u8]) -> Board {
        Board::new(Config {
            rom: Rom::new(program.to_vec()),
            ram_size: 0x10000,
            flash: None,
        })
        .unwrap()
    }

    #[test]
    fn test_halt_protocol() {
        // lui a1, 0x90000; addi a0, zero, 4; sb a0, 0x100(a1)
        let mut board = board_with(&[
            0xb7, 0x05, 0x00, 0x90, //
            0x13, 0x05, 0x40, 0x00, //
            0x23, 0x80, 0xa5, 0x10, //
        ]);
        let mut cycles = 0;
        while !board.halted() {
            board.step();
            cycles += 1;
            assert!(cycles < 10, "halt flag never raised");
        }
        assert_eq!(4, board.exit_code());
    }

    #[test]
    fn test_timer_interrupt_end_to_end() {
        // Set mtimecmp = 10, enable the timer interrupt, then spin on wfi.
        //   lui a1, 0x90010     ; CLINT base
        //   addi a0, zero, 10
        //   sw a0, 0x100(a1)    ; mtimecmp lo
        //   lui a2, 0x4         ; handler base 0x4000
        //   csrrw zero, mtvec, a2
        //   addi a3, zero, 0x80
        //   csrrw zero, mie, a3 ; mie.mtie
        //   csrrsi zero, mstatus, 8
        //   wfi
        //   beq zero, zero, -4
        let mut board = board_with(&[
            0xb7, 0x05, 0x01, 0x90, //
            0x13, 0x05, 0xa0, 0x00, //
            0x23, 0xa0, 0xa5, 0x10, //
            0x37, 0x46, 0x00, 0x00, //
            0x73, 0x10, 0x56, 0x30, //
            0x93, 0x06, 0x00, 0x08, //
            0x73, 0x90, 0x46, 0x30, //
            0x73, 0x60, 0x04, 0x30, //
            0x73, 0x00, 0x50, 0x10, //
            0xe3, 0x0e, 0x00, 0xfe, //
        ]);
        let mut cycles = 0;
        while board.core().pc() != 0x4000 {
            board.step();
            cycles += 1;
            assert!(cycles < 50, "timer interrupt never delivered");
        }
        assert_eq!(
            0x8000_0007,
            board.core().csr().read_force(crate::core::csr::MCAUSE).unwrap()
        );
    }

    #[test]
    fn test_flash_window() {
        // lui a1, 0x90020; lw a0, 0(a1); + halt via GPIO
        let mut board = Board::new(Config {
            rom: Rom::new(vec![
                0xb7, 0x05, 0x02, 0x90, //
                0x03, 0xa5, 0x05, 0x00, //
            ]),
            ram_size: 0x10000,
            flash: Some(vec![0x78, 0x56, 0x34, 0x12]),
        })
        .unwrap();
        board.step();
        board.step();
        assert_eq!(0x1234_5678, board.core().x(Specifier::A0));
    }
}
