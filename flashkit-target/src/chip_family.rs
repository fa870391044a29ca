use crate::flash_algorithm::ROUTINE_NOT_PRESENT;
use crate::serialize::hex_jep106_option;
use crate::{CoreAccessOptions, MemoryRange};

use super::chip::Chip;
use super::flash_algorithm::RawFlashAlgorithm;
use jep106::JEP106Code;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Source of a target description.
///
/// This is used for diagnostics, when
/// an error related to a target description occurs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetDescriptionSource {
    /// The target description is a built-in target description,
    /// which was included into flashkit at compile time.
    BuiltIn,
    /// The target description was from an external source
    /// during runtime.
    External,
}

/// Type of a supported core.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreType {
    /// ARMv6-M: Cortex M0, M0+, M1
    Armv6m,
    /// ARMv7-M: Cortex M3
    Armv7m,
    /// ARMv7e-M: Cortex M4, M7
    Armv7em,
    /// ARMv8-M: Cortex M23, M33
    Armv8m,
    /// RISC-V
    Riscv,
}

impl CoreType {
    /// Returns true if the core type is an ARM Cortex-M
    pub fn is_cortex_m(&self) -> bool {
        matches!(
            self,
            CoreType::Armv6m | CoreType::Armv7em | CoreType::Armv7m | CoreType::Armv8m
        )
    }

    fn is_riscv(&self) -> bool {
        matches!(self, CoreType::Riscv)
    }

    /// Returns the parent architecture family of this core type.
    pub fn architecture(&self) -> Architecture {
        match self {
            CoreType::Riscv => Architecture::Riscv,
            _ => Architecture::Arm,
        }
    }

    /// Returns the instruction set a flash algorithm runs in on this core.
    pub fn instruction_set(&self) -> InstructionSet {
        match self {
            CoreType::Riscv => InstructionSet::RV32,
            _ => InstructionSet::Thumb2,
        }
    }
}

/// The architecture family of a specific [`CoreType`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Architecture {
    /// An ARM Cortex-M core.
    Arm,
    /// A RISC-V core.
    Riscv,
}

/// Instruction set used by a core
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionSet {
    /// ARM Thumb 2 instruction set
    Thumb2,
    /// RISC-V 32-bit instruction set
    RV32,
}

/// This describes a chip family with all its variants.
///
/// This struct is usually read from a target description
/// file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChipFamily {
    /// This is the name of the chip family in base form.
    /// E.g. `STM32F405`.
    pub name: String,
    /// The JEP106 code of the manufacturer.
    #[serde(default)]
    #[serde(serialize_with = "hex_jep106_option")]
    pub manufacturer: Option<JEP106Code>,
    /// This vector holds all the variants of the family.
    pub variants: Vec<Chip>,
    /// This vector holds all available algorithms.
    #[serde(default)]
    pub flash_algorithms: Vec<RawFlashAlgorithm>,
    #[serde(skip, default = "default_source")]
    /// Source of the target description, used for diagnostics
    pub source: TargetDescriptionSource,
}

fn default_source() -> TargetDescriptionSource {
    TargetDescriptionSource::External
}

impl ChipFamily {
    /// Validates the [`ChipFamily`] such that further code can make
    /// assumptions about the correctness without validating thereafter.
    ///
    /// This method should be called right after the [`ChipFamily`] is created!
    pub fn validate(&self) -> Result<(), String> {
        self.reject_duplicate_variant_names()?;
        self.ensure_algorithms_exist()?;
        self.ensure_at_least_one_core()?;
        self.reject_incorrect_core_access_options()?;
        self.validate_memory_regions()?;
        self.validate_flash_algorithms()?;

        Ok(())
    }

    /// Rejects target descriptions with duplicate variant names. Only one of
    /// these variants can be selected, so having multiple is probably a mistake.
    fn reject_duplicate_variant_names(&self) -> Result<(), String> {
        let mut seen = HashSet::new();

        for chip in &self.variants {
            if !seen.insert(&chip.name) {
                return Err(format!(
                    "Variant {} appears multiple times in {}",
                    chip.name, self.name,
                ));
            }
        }

        Ok(())
    }

    /// Make sure the algorithms used on the variant actually exist on the
    /// family (this is basically a check for typos).
    fn ensure_algorithms_exist(&self) -> Result<(), String> {
        for variant in &self.variants {
            for algorithm_name in variant.flash_algorithms.iter() {
                if !self
                    .flash_algorithms
                    .iter()
                    .any(|algorithm| &algorithm.name == algorithm_name)
                {
                    return Err(format!(
                        "unknown flash algorithm `{}` for variant `{}`",
                        algorithm_name, variant.name
                    ));
                }
            }
        }

        Ok(())
    }

    // Check that there is at least one core, and that architectures are not mixed.
    fn ensure_at_least_one_core(&self) -> Result<(), String> {
        for variant in &self.variants {
            let Some(core) = variant.cores.first() else {
                return Err(format!(
                    "variant `{}` does not contain any cores",
                    variant.name
                ));
            };

            let architecture = core.core_type.architecture();
            if variant
                .cores
                .iter()
                .any(|core| core.core_type.architecture() != architecture)
            {
                return Err(format!(
                    "variant `{}` contains mixed core architectures",
                    variant.name
                ));
            }
        }

        Ok(())
    }

    fn reject_incorrect_core_access_options(&self) -> Result<(), String> {
        for variant in &self.variants {
            for core in variant.cores.iter() {
                // The core access options must match the core type specified.
                match &core.core_access_options {
                    CoreAccessOptions::Arm(_) if !core.core_type.is_cortex_m() => {
                        return Err(format!(
                            "Arm options don't match core type {:?} on core {}",
                            core.core_type, core.name
                        ));
                    }
                    CoreAccessOptions::Riscv(_) if !core.core_type.is_riscv() => {
                        return Err(format!(
                            "Riscv options don't match core type {:?} on core {}",
                            core.core_type, core.name
                        ));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Ensures that the memory regions are assigned to existing cores, carry
    /// unique names, and only overlap where one side is a documented alias.
    fn validate_memory_regions(&self) -> Result<(), String> {
        for variant in &self.variants {
            let core_names = variant
                .cores
                .iter()
                .map(|core| &core.name)
                .collect::<Vec<_>>();

            let mut region_names = HashSet::new();

            for memory in &variant.memory_map {
                for core in memory.cores() {
                    if !core_names.contains(&core) {
                        return Err(format!(
                            "Variant {}, memory region {:?} is assigned to a non-existent core {}",
                            variant.name, memory, core
                        ));
                    }
                }

                if memory.cores().is_empty() {
                    return Err(format!(
                        "Variant {}, memory region {:?} is not assigned to a core",
                        variant.name, memory
                    ));
                }

                if let Some(name) = memory.name() {
                    if !region_names.insert(name) {
                        return Err(format!(
                            "Variant {} contains multiple memory regions named `{}`",
                            variant.name, name
                        ));
                    }
                }
            }

            // Overlapping regions of different physical backing stores are a
            // description error. Documented bus aliases are the only exception.
            for (index, memory) in variant.memory_map.iter().enumerate() {
                for other in &variant.memory_map[index + 1..] {
                    if memory.address_range().intersects_range(&other.address_range())
                        && !memory.is_alias()
                        && !other.is_alias()
                    {
                        return Err(format!(
                            "Variant {}: memory regions {:?} and {:?} overlap and neither is an alias",
                            variant.name, memory, other
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Runs the geometry checks on each flash algorithm and warns about
    /// sentinel entry point offsets.
    fn validate_flash_algorithms(&self) -> Result<(), String> {
        for algorithm in &self.flash_algorithms {
            algorithm
                .flash_properties
                .validate()
                .map_err(|error| format!("flash algorithm `{}`: {}", algorithm.name, error))?;

            if algorithm.pc_erase_all == Some(ROUTINE_NOT_PRESENT) {
                log::warn!(
                    "Flash algorithm `{}` marks EraseAll with the \"not present\" sentinel; \
                     sector erase will be used instead.",
                    algorithm.name
                );
            }
        }

        Ok(())
    }
}

impl ChipFamily {
    /// Get the different [Chip]s which are part of this family.
    pub fn variants(&self) -> &[Chip] {
        &self.variants
    }

    /// Get all flash algorithms for this family of chips.
    pub fn algorithms(&self) -> &[RawFlashAlgorithm] {
        &self.flash_algorithms
    }

    /// Try to find a [RawFlashAlgorithm] with a given name.
    pub fn get_algorithm(&self, name: impl AsRef<str>) -> Option<&RawFlashAlgorithm> {
        let name = name.as_ref();
        self.flash_algorithms.iter().find(|elem| elem.name == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ArmCoreAccessOptions, Core, FlashProperties, MemoryRegion, NvmRegion, RamRegion,
        SectorDescription,
    };

    fn family_with_map(memory_map: Vec<MemoryRegion>) -> ChipFamily {
        ChipFamily {
            name: "FAM".into(),
            manufacturer: None,
            variants: vec![Chip {
                name: "FAM01".into(),
                cores: vec![Core {
                    name: "main".into(),
                    core_type: CoreType::Armv7em,
                    core_access_options: CoreAccessOptions::Arm(ArmCoreAccessOptions::default()),
                }],
                memory_map,
                flash_algorithms: vec![],
            }],
            flash_algorithms: vec![],
            source: TargetDescriptionSource::External,
        }
    }

    fn nvm(range: std::ops::Range<u64>, is_alias: bool) -> MemoryRegion {
        MemoryRegion::Nvm(NvmRegion {
            name: None,
            range,
            cores: vec!["main".into()],
            is_alias,
        })
    }

    #[test]
    fn disjoint_regions_are_valid() {
        let family = family_with_map(vec![
            nvm(0x0800_0000..0x0810_0000, false),
            MemoryRegion::Ram(RamRegion {
                name: None,
                range: 0x2000_0000..0x2002_0000,
                cores: vec!["main".into()],
            }),
        ]);
        assert!(family.validate().is_ok());
    }

    #[test]
    fn overlapping_non_alias_regions_are_rejected() {
        let family = family_with_map(vec![
            nvm(0x0800_0000..0x0810_0000, false),
            nvm(0x0808_0000..0x0818_0000, false),
        ]);
        assert!(family.validate().is_err());
    }

    #[test]
    fn alias_overlap_is_accepted() {
        let family = family_with_map(vec![
            nvm(0x0800_0000..0x0810_0000, false),
            nvm(0x0800_0000..0x0810_0000, true),
        ]);
        assert!(family.validate().is_ok());
    }

    #[test]
    fn region_on_unknown_core_is_rejected() {
        let family = family_with_map(vec![MemoryRegion::Ram(RamRegion {
            name: None,
            range: 0x2000_0000..0x2002_0000,
            cores: vec!["other".into()],
        })]);
        assert!(family.validate().is_err());
    }

    #[test]
    fn duplicate_region_names_are_rejected() {
        let family = family_with_map(vec![
            MemoryRegion::Ram(RamRegion {
                name: Some("SRAM".into()),
                range: 0x2000_0000..0x2002_0000,
                cores: vec!["main".into()],
            }),
            MemoryRegion::Ram(RamRegion {
                name: Some("SRAM".into()),
                range: 0x2004_0000..0x2005_0000,
                cores: vec!["main".into()],
            }),
        ]);
        assert!(family.validate().is_err());
    }

    #[test]
    fn unknown_algorithm_reference_is_rejected() {
        let mut family = family_with_map(vec![]);
        family.variants[0].flash_algorithms = vec!["missing".into()];
        assert!(family.validate().is_err());
    }

    #[test]
    fn broken_sector_layout_is_rejected() {
        let mut family = family_with_map(vec![]);
        family.flash_algorithms = vec![RawFlashAlgorithm {
            name: "algo".into(),
            flash_properties: FlashProperties {
                address_range: 0x0800_0000..0x0801_0000,
                page_size: 1024,
                erased_byte_value: 0xff,
                program_page_timeout: 500,
                erase_sector_timeout: 3000,
                // Gap: the first group starts at 0x1000 instead of 0.
                sectors: vec![SectorDescription {
                    size: 0x1000,
                    address: 0x1000,
                }],
            },
            ..Default::default()
        }];
        assert!(family.validate().is_err());
    }
}
