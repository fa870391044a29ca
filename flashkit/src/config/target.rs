use std::ops::Range;

use flashkit_target::{
    Chip, ChipFamily, Core, CoreAccessOptions, MemoryRange, MemoryRegion, RawFlashAlgorithm,
    TargetDescriptionSource,
};

use crate::flashing::FlashError;

/// This describes a complete target with a fixed chip model and variant.
#[derive(Debug, Clone)]
pub struct Target {
    /// The name of the target.
    pub name: String,
    /// The cores of the target.
    pub cores: Vec<Core>,
    /// The memory map of the target.
    pub memory_map: Vec<MemoryRegion>,
    /// The flash algorithms applicable to this target.
    pub flash_algorithms: Vec<RawFlashAlgorithm>,
    /// Source of the target description, used for diagnostics.
    pub source: TargetDescriptionSource,
}

impl Target {
    /// Builds a target from a family and one of its variants.
    ///
    /// The family is assumed to be validated, so all algorithm names of the
    /// variant resolve.
    pub(crate) fn from_family_and_variant(family: &ChipFamily, variant: &Chip) -> Target {
        let flash_algorithms = variant
            .flash_algorithms
            .iter()
            .filter_map(|name| family.get_algorithm(name))
            .cloned()
            .collect();

        Target {
            name: variant.name.clone(),
            cores: variant.cores.clone(),
            memory_map: variant.memory_map.clone(),
            flash_algorithms,
            source: family.source.clone(),
        }
    }

    /// Returns the core with the given name.
    pub fn core(&self, name: &str) -> Option<&Core> {
        self.cores.iter().find(|core| core.name == name)
    }

    /// Returns the most specific memory region containing `address` which is
    /// accessible by the given core.
    ///
    /// When an address is covered both by a broad window and a narrower
    /// alias inside it, the smaller region wins.
    pub fn memory_region_for(
        &self,
        address: u64,
        core: &str,
    ) -> Result<&MemoryRegion, FlashError> {
        self.memory_map
            .iter()
            .filter(|region| region.contains(address))
            .filter(|region| region.cores().iter().any(|c| c == core))
            .min_by_key(|region| {
                let range = region.address_range();
                range.end - range.start
            })
            .ok_or_else(|| FlashError::AddressNotMapped {
                address,
                core: core.to_string(),
            })
    }

    /// Selects the flash algorithm whose properties cover the given range.
    ///
    /// When several algorithms cover the range, e.g. because a secure and a
    /// non-secure alias of the same flash overlap, the one marked as default
    /// breaks the tie.
    pub fn resolve_algorithm(
        &self,
        range: &Range<u64>,
    ) -> Result<&RawFlashAlgorithm, FlashError> {
        let matches: Vec<&RawFlashAlgorithm> = self
            .flash_algorithms
            .iter()
            .filter(|algorithm| {
                algorithm
                    .flash_properties
                    .address_range
                    .contains_range(range)
            })
            .collect();

        match matches.as_slice() {
            [] => Err(FlashError::NoAlgorithmForRange {
                start: range.start,
                end: range.end,
            }),
            [algorithm] => Ok(*algorithm),
            _ => matches
                .iter()
                .find(|algorithm| algorithm.default)
                .copied()
                .ok_or(FlashError::AmbiguousAlgorithm {
                    start: range.start,
                    end: range.end,
                }),
        }
    }

    /// Returns whether the two cores can be flashed concurrently.
    ///
    /// This requires disjoint debug access ports and disjoint memory maps;
    /// otherwise the two flash runs would race over shared state.
    pub fn can_flash_concurrently(&self, core_a: &str, core_b: &str) -> bool {
        let (Some(a), Some(b)) = (self.core(core_a), self.core(core_b)) else {
            return false;
        };

        let access_disjoint = match (&a.core_access_options, &b.core_access_options) {
            (CoreAccessOptions::Arm(a), CoreAccessOptions::Arm(b)) => {
                a.ap != b.ap || a.ap_version != b.ap_version
            }
            (CoreAccessOptions::Riscv(a), CoreAccessOptions::Riscv(b)) => a.hart_id != b.hart_id,
            _ => true,
        };
        if !access_disjoint {
            return false;
        }

        let regions_of = |core: &str| {
            self.memory_map
                .iter()
                .filter(move |region| region.cores().iter().any(|c| c == core))
                .collect::<Vec<_>>()
        };

        regions_of(core_a).into_iter().all(|region_a| {
            regions_of(core_b).into_iter().all(|region_b| {
                !region_a
                    .address_range()
                    .intersects_range(&region_b.address_range())
            })
        })
    }
}

#[cfg(test)]
mod test {
    use flashkit_target::{
        ArmCoreAccessOptions, CoreType, FlashProperties, NvmRegion, RamRegion, SectorDescription,
    };

    use super::*;

    fn algorithm(name: &str, range: Range<u64>, default: bool) -> RawFlashAlgorithm {
        RawFlashAlgorithm {
            name: name.into(),
            default,
            flash_properties: FlashProperties {
                address_range: range,
                page_size: 0x400,
                erased_byte_value: 0xff,
                program_page_timeout: 500,
                erase_sector_timeout: 3000,
                sectors: vec![SectorDescription {
                    size: 0x1000,
                    address: 0,
                }],
            },
            ..Default::default()
        }
    }

    fn core(name: &str, ap: u8) -> Core {
        Core {
            name: name.into(),
            core_type: CoreType::Armv8m,
            core_access_options: CoreAccessOptions::Arm(ArmCoreAccessOptions {
                ap,
                ..Default::default()
            }),
        }
    }

    /// A target with a non-secure flash window and a secure alias of it.
    fn dual_alias_target() -> Target {
        Target {
            name: "DEMO_S".into(),
            cores: vec![core("main", 0)],
            memory_map: vec![
                MemoryRegion::Nvm(NvmRegion {
                    name: Some("FLASH_NS".into()),
                    range: 0x0800_0000..0x0810_0000,
                    cores: vec!["main".into()],
                    is_alias: false,
                }),
                MemoryRegion::Nvm(NvmRegion {
                    name: Some("FLASH_S".into()),
                    range: 0x0C00_0000..0x0C10_0000,
                    cores: vec!["main".into()],
                    is_alias: true,
                }),
                MemoryRegion::Ram(RamRegion {
                    name: Some("SRAM".into()),
                    range: 0x2000_0000..0x2002_0000,
                    cores: vec!["main".into()],
                }),
            ],
            flash_algorithms: vec![
                algorithm("demo", 0x0800_0000..0x0810_0000, false),
                algorithm("demo_s", 0x0C00_0000..0x0C10_0000, true),
            ],
            source: TargetDescriptionSource::External,
        }
    }

    #[test]
    fn resolving_a_unique_range_returns_its_algorithm() {
        let target = dual_alias_target();
        let algo = target.resolve_algorithm(&(0x0800_0000..0x0800_1000)).unwrap();
        assert_eq!(algo.name, "demo");
    }

    #[test]
    fn resolving_an_uncovered_range_fails() {
        let target = dual_alias_target();
        assert!(matches!(
            target.resolve_algorithm(&(0x1000_0000..0x1000_1000)),
            Err(FlashError::NoAlgorithmForRange { .. })
        ));
    }

    #[test]
    fn default_flag_breaks_overlapping_coverage() {
        let mut target = dual_alias_target();
        // Make both algorithms cover the same secure window.
        target.flash_algorithms[0].flash_properties.address_range = 0x0C00_0000..0x0C10_0000;

        let algo = target.resolve_algorithm(&(0x0C00_0000..0x0C00_1000)).unwrap();
        assert_eq!(algo.name, "demo_s");
    }

    #[test]
    fn overlapping_coverage_without_default_is_ambiguous() {
        let mut target = dual_alias_target();
        target.flash_algorithms[0].flash_properties.address_range = 0x0C00_0000..0x0C10_0000;
        target.flash_algorithms[1].default = false;

        assert!(matches!(
            target.resolve_algorithm(&(0x0C00_0000..0x0C00_1000)),
            Err(FlashError::AmbiguousAlgorithm { .. })
        ));
    }

    #[test]
    fn region_lookup_prefers_the_most_specific_region() {
        let mut target = dual_alias_target();
        // A narrow alias window inside the broad flash window.
        target.memory_map.push(MemoryRegion::Nvm(NvmRegion {
            name: Some("OPTION_BYTES".into()),
            range: 0x0800_4000..0x0800_5000,
            cores: vec!["main".into()],
            is_alias: true,
        }));

        let region = target.memory_region_for(0x0800_4800, "main").unwrap();
        assert_eq!(region.name(), Some("OPTION_BYTES"));

        let region = target.memory_region_for(0x0800_0010, "main").unwrap();
        assert_eq!(region.name(), Some("FLASH_NS"));
    }

    #[test]
    fn region_lookup_fails_for_unmapped_addresses() {
        let target = dual_alias_target();
        assert!(matches!(
            target.memory_region_for(0x4000_0000, "main"),
            Err(FlashError::AddressNotMapped { .. })
        ));
    }

    #[test]
    fn concurrent_flashing_needs_disjoint_access_ports_and_memory() {
        let target = Target {
            name: "DUAL".into(),
            cores: vec![core("core0", 0), core("core1", 1), core("core2", 0)],
            memory_map: vec![
                MemoryRegion::Ram(RamRegion {
                    name: None,
                    range: 0x2000_0000..0x2001_0000,
                    cores: vec!["core0".into()],
                }),
                MemoryRegion::Ram(RamRegion {
                    name: None,
                    range: 0x3000_0000..0x3001_0000,
                    cores: vec!["core1".into(), "core2".into()],
                }),
            ],
            flash_algorithms: vec![],
            source: TargetDescriptionSource::External,
        };

        assert!(target.can_flash_concurrently("core0", "core1"));
        // Same access port index.
        assert!(!target.can_flash_concurrently("core0", "core2"));
        // Shared RAM region.
        assert!(!target.can_flash_concurrently("core1", "core2"));
    }
}
