//! Access to a single target core through the debug port.
//!
//! The probe transport itself (SWD, JTAG, ...) lives in a separate driver
//! crate. This module only defines the surface the flash routines need:
//! plain memory access, the handful of core registers involved in calling a
//! routine, and run control. [`MockCore`] implements the same surface
//! against an in-memory target for tests and dry runs.
//!
//! [`MockCore`]: mock::MockCore

pub mod mock;

use std::fmt;
use std::time::Duration;

use flashkit_target::InstructionSet;

/// The core registers used to call a flash algorithm routine.
///
/// These are role names, not architecture register numbers; the driver
/// implementing [`CoreInterface`] maps them onto the actual register file
/// (on Arm: R0-R3, SP, LR, R9, PC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoreRegister {
    /// First argument and result register.
    R0,
    /// Second argument register.
    R1,
    /// Third argument register.
    R2,
    /// Fourth argument register.
    R3,
    /// Static base register holding the address of the data section.
    Sb,
    /// Stack pointer.
    Sp,
    /// Return address register.
    Lr,
    /// Program counter.
    Pc,
}

impl fmt::Display for CoreRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoreRegister::R0 => "R0",
            CoreRegister::R1 => "R1",
            CoreRegister::R2 => "R2",
            CoreRegister::R3 => "R3",
            CoreRegister::Sb => "SB",
            CoreRegister::Sp => "SP",
            CoreRegister::Lr => "LR",
            CoreRegister::Pc => "PC",
        };
        f.write_str(name)
    }
}

/// The status of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    /// The core is running.
    Running,
    /// The core is halted, e.g. after hitting the return breakpoint of a
    /// flash routine.
    Halted,
    /// The core is locked up and will not make progress without a reset.
    LockedUp,
}

/// An error while accessing a core through the debug port.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A memory access failed.
    #[error("memory access at address {address:#010x} failed")]
    MemoryAccess {
        /// The start address of the failed access.
        address: u64,
    },
    /// A core register access failed.
    #[error("access to core register {0} failed")]
    RegisterAccess(CoreRegister),
    /// The core did not reach the halted state in time.
    #[error("the core did not halt within {timeout:?}")]
    HaltTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },
}

/// A handle to one core of an attached target.
///
/// Holding the handle mutably is what guarantees exclusive ownership of the
/// core's register and memory state; the flash routines take `&mut` for the
/// whole duration of a program/erase run.
pub trait CoreInterface {
    /// Read a block of 8 bit words from `address`.
    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), CoreError>;

    /// Write a block of 8 bit words to `address`.
    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), CoreError>;

    /// Read a block of 32 bit words from `address`.
    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), CoreError>;

    /// Write a block of 32 bit words to `address`.
    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), CoreError>;

    /// Read the value of a core register.
    fn read_core_reg(&mut self, register: CoreRegister) -> Result<u32, CoreError>;

    /// Write the value of a core register.
    fn write_core_reg(&mut self, register: CoreRegister, value: u32) -> Result<(), CoreError>;

    /// Halt the core and wait for it to be halted.
    fn halt(&mut self, timeout: Duration) -> Result<(), CoreError>;

    /// Reset the core and halt it immediately afterwards.
    fn reset_and_halt(&mut self, timeout: Duration) -> Result<(), CoreError>;

    /// Resume execution of the core.
    fn run(&mut self) -> Result<(), CoreError>;

    /// Return the current status of the core.
    fn status(&mut self) -> Result<CoreStatus, CoreError>;

    /// The instruction set the core executes flash routines in.
    fn instruction_set(&self) -> InstructionSet;
}
