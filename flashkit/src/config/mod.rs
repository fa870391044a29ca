//! Target registry and resolution.
//!
//! The registry holds the validated [`ChipFamily`] descriptions, and
//! resolving a chip name produces a [`Target`]: one exact variant with its
//! cores, memory map and applicable flash algorithms.
//!
//! [`ChipFamily`]: flashkit_target::ChipFamily

mod registry;
mod target;

pub use registry::{Registry, RegistryError};
pub use target::Target;

pub use flashkit_target::{
    ApVersion, Architecture, ArmCoreAccessOptions, Chip, ChipFamily, Core, CoreAccessOptions,
    CoreType, FlashProperties, GenericRegion, InstructionSet, MemoryRange, MemoryRegion,
    NvmRegion, PageInfo, RamRegion, RawFlashAlgorithm, RiscvCoreAccessOptions, SectorDescription,
    SectorInfo, TargetDescriptionSource, ROUTINE_NOT_PRESENT,
};
