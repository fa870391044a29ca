use super::memory::MemoryRegion;
use crate::CoreType;
use serde::{Deserialize, Serialize};

/// A single chip variant.
///
/// This describes an exact chip variant, including its cores, flash and
/// memory size. For example, the `STM32F405` family has the variants
/// `STM32F405RG` and `STM32F405OE`; this struct corresponds to one of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chip {
    /// This is the name of the chip in base form.
    /// E.g. `STM32F405RG`.
    pub name: String,
    /// The cores available on the chip.
    pub cores: Vec<Core>,
    /// The memory regions available on the chip.
    pub memory_map: Vec<MemoryRegion>,
    /// Names of all flash algorithms available for this chip.
    ///
    /// This can be used to look up the flash algorithm in the
    /// [`ChipFamily::flash_algorithms`] field.
    ///
    /// [`ChipFamily::flash_algorithms`]: crate::ChipFamily::flash_algorithms
    #[serde(default)]
    pub flash_algorithms: Vec<String>,
}

/// An individual core inside a chip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Core {
    /// The core name.
    pub name: String,

    /// The core type.
    /// E.g. `armv7m`.
    #[serde(rename = "type")]
    pub core_type: CoreType,

    /// The data required to access the core through the debug probe.
    pub core_access_options: CoreAccessOptions,
}

/// The data required to access a core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoreAccessOptions {
    /// Arm specific options
    Arm(ArmCoreAccessOptions),
    /// Riscv specific options
    Riscv(RiscvCoreAccessOptions),
}

/// The version of the access port addressing scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApVersion {
    /// Nested 8 bit AP addresses, used by ADIv5.
    #[default]
    V1,
    /// Flat 64 bit AP addresses, used by ADIv6.
    V2,
}

/// The data required to access an ARM core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArmCoreAccessOptions {
    /// The index of the access port behind which the core sits.
    pub ap: u8,
    /// The addressing scheme the access port index refers to.
    #[serde(default)]
    pub ap_version: ApVersion,
}

/// The data required to access a Risc-V core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiscvCoreAccessOptions {
    /// The hart id
    pub hart_id: Option<u32>,
}
