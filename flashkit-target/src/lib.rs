//! Target description schema
//!
//! For flashing a chip, called *target* in flashkit, some target specific
//! configuration is required. This includes the cores of the chip and how
//! they are reached through the debug probe, the memory map of the target,
//! and the flash algorithms which can be used to program its non-volatile
//! memory.
//!
//! This crate contains the schema structs for the YAML target description
//! files.
#![warn(missing_docs)]

mod chip;
mod chip_family;
mod flash_algorithm;
mod flash_properties;
mod memory;
pub(crate) mod serialize;

pub use chip::{
    ApVersion, ArmCoreAccessOptions, Chip, Core, CoreAccessOptions, RiscvCoreAccessOptions,
};
pub use chip_family::{
    Architecture, ChipFamily, CoreType, InstructionSet, TargetDescriptionSource,
};
pub use flash_algorithm::{RawFlashAlgorithm, ROUTINE_NOT_PRESENT};
pub use flash_properties::FlashProperties;
pub use memory::{
    GenericRegion, MemoryRange, MemoryRegion, NvmRegion, PageInfo, RamRegion, SectorDescription,
    SectorInfo,
};
