use super::FlashError;
use flashkit_target::{
    Architecture, FlashProperties, PageInfo, RamRegion, RawFlashAlgorithm, SectorInfo,
};

/// A flash algorithm, which has been assembled for a specific chip.
///
/// It holds the final RAM layout: where the code is staged, where the stack
/// and the page buffers live, and the absolute addresses of the entry points.
/// To create a [`FlashAlgorithm`], call [`FlashAlgorithm::assemble_from_raw`].
#[derive(Debug, Default, Clone)]
pub struct FlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// Whether this flash algorithm is the default one or not.
    pub default: bool,
    /// Memory address where the flash algo instructions will be loaded to.
    ///
    /// This points at the architecture header; the code itself starts one
    /// header length further up, at the raw algorithm's load address.
    pub load_address: u64,
    /// List of 32-bit words containing the code for the algo,
    /// including the architecture header.
    pub instructions: Vec<u32>,
    /// Address of the `Init()` entry point. Optional.
    pub pc_init: Option<u64>,
    /// Address of the `UnInit()` entry point. Optional.
    pub pc_uninit: Option<u64>,
    /// Address of the `ProgramPage()` entry point.
    pub pc_program_page: u64,
    /// Address of the `EraseSector()` entry point.
    pub pc_erase_sector: u64,
    /// Address of the `EraseAll()` entry point. Optional.
    pub pc_erase_all: Option<u64>,
    /// Initial value of the static base register, which determines where the
    /// position-dependent data of the algorithm resides.
    pub static_base: u64,
    /// Initial value of the stack pointer when calling any flash algo API.
    pub begin_stack: u64,
    /// A list of base addresses for page buffers. The buffers are as large as
    /// the flash's `page_size`. If two buffers fit into RAM, double buffered
    /// programming is possible.
    pub page_buffers: Vec<u64>,
    /// The properties of the flash on the device.
    pub flash_properties: FlashProperties,
}

impl FlashAlgorithm {
    /// Try to retrieve the information about the flash sector
    /// which contains `address`.
    ///
    /// If the `address` is not part of the flash, None will
    /// be returned.
    pub fn sector_info(&self, address: u64) -> Option<SectorInfo> {
        if !self.flash_properties.address_range.contains(&address) {
            tracing::trace!("Address {:08x} not contained in this flash device", address);
            return None;
        }

        let offset_address = address - self.flash_properties.address_range.start;

        let containing_group = self
            .flash_properties
            .sectors
            .iter()
            .rfind(|s| s.address <= offset_address)?;

        let sector_index = (offset_address - containing_group.address) / containing_group.size;

        let sector_address = self.flash_properties.address_range.start
            + containing_group.address
            + sector_index * containing_group.size;

        Some(SectorInfo {
            base_address: sector_address,
            size: containing_group.size,
        })
    }

    /// Returns the necessary information about the page which `address`
    /// resides in, if the address is inside the flash region.
    pub fn page_info(&self, address: u64) -> Option<PageInfo> {
        if !self.flash_properties.address_range.contains(&address) {
            return None;
        }

        Some(PageInfo {
            base_address: address - (address % self.flash_properties.page_size as u64),
            size: self.flash_properties.page_size,
        })
    }

    /// Iterate over all the sectors of the flash.
    pub fn iter_sectors(&self) -> impl Iterator<Item = SectorInfo> + '_ {
        let props = &self.flash_properties;

        let mut address = props.address_range.start;
        let mut group_index = 0;
        std::iter::from_fn(move || {
            if address >= props.address_range.end {
                return None;
            }

            // Advance to the next sector group if this address reached it.
            if let Some(next_group) = props.sectors.get(group_index + 1) {
                if props.address_range.start + next_group.address <= address {
                    group_index += 1;
                }
            }

            let size = props.sectors[group_index].size;
            let sector = SectorInfo {
                base_address: address,
                size,
            };
            address += size;

            Some(sector)
        })
    }

    /// Iterate over all the pages of the flash.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageInfo> + '_ {
        let props = &self.flash_properties;

        let mut address = props.address_range.start;
        std::iter::from_fn(move || {
            if address >= props.address_range.end {
                return None;
            }

            let page = PageInfo {
                base_address: address,
                size: props.page_size,
            };
            address += props.page_size as u64;

            Some(page)
        })
    }

    /// Returns true if the entire contents of the argument array equal the
    /// erased byte value.
    pub fn is_erased(&self, data: &[u8]) -> bool {
        data.iter()
            .all(|b| *b == self.flash_properties.erased_byte_value)
    }

    const FLASH_ALGO_STACK_SIZE: u64 = 512;

    // Breakpoint-return stub the routines return onto, staged right below the
    // algorithm code. The Arm variant is the CMSIS-DAP blob header.
    const ARM_FLASH_BLOB_HEADER: [u32; 8] = [
        0xE00A_BE00,
        0x062D_780D,
        0x2408_4068,
        0xD300_0040,
        0x1E64_4058,
        0x1C49_D1FA,
        0x2A00_1E52,
        0x0477_0D1F,
    ];

    // Two `ebreak` instructions.
    const RISCV_FLASH_BLOB_HEADER: [u32; 2] = [0x0010_0073, 0x0010_0073];

    fn algorithm_header(architecture: Architecture) -> &'static [u32] {
        match architecture {
            Architecture::Arm => &Self::ARM_FLASH_BLOB_HEADER,
            Architecture::Riscv => &Self::RISCV_FLASH_BLOB_HEADER,
        }
    }

    /// Constructs a complete flash algorithm, which is tailored to the sizes
    /// of the given RAM region.
    ///
    /// Memory layout, from the bottom of the RAM region upwards: header,
    /// code, stack (growing down from the first page buffer), page buffers.
    pub fn assemble_from_raw(
        raw: &RawFlashAlgorithm,
        ram_region: &RamRegion,
        architecture: Architecture,
    ) -> Result<Self, FlashError> {
        use std::mem::size_of;

        let page_size = raw.flash_properties.page_size;
        if page_size == 0 || page_size % 4 != 0 {
            return Err(FlashError::InvalidPageSize { size: page_size });
        }

        let header = Self::algorithm_header(architecture);
        let header_size = std::mem::size_of_val(header) as u64;

        // The entry point offsets are relative to the raw load address, so
        // the header has to go right below it.
        let load_address = raw
            .load_address
            .checked_sub(header_size)
            .filter(|addr| *addr >= ram_region.range.start)
            .ok_or(FlashError::InvalidLoadAddress {
                address: raw.load_address,
            })?;

        let mut blob_words = raw.instructions.chunks_exact(size_of::<u32>());
        let remainder = blob_words.remainder();
        let last_word = (!remainder.is_empty()).then(|| {
            let mut bytes = [0u8; 4];
            bytes[..remainder.len()].copy_from_slice(remainder);
            u32::from_le_bytes(bytes)
        });

        let instructions: Vec<u32> = header
            .iter()
            .copied()
            .chain(blob_words.by_ref().map(|bytes| {
                u32::from_le_bytes(bytes.try_into().expect("chunks are 4 bytes each"))
            }))
            .chain(last_word)
            .collect();

        let code_end = load_address + (instructions.len() * size_of::<u32>()) as u64;

        // One page buffer and the stack have to fit above the code, otherwise
        // the algorithm cannot run at all.
        let page_size = page_size as u64;
        let required = (code_end - load_address) + Self::FLASH_ALGO_STACK_SIZE + page_size;
        let available = ram_region.range.end - ram_region.range.start;
        if code_end + Self::FLASH_ALGO_STACK_SIZE + page_size > ram_region.range.end {
            return Err(FlashError::InsufficientRam {
                required,
                available,
            });
        }

        // Use two page buffers when they fit, for double buffered programming.
        let double_buffered =
            code_end + Self::FLASH_ALGO_STACK_SIZE + 2 * page_size <= ram_region.range.end;
        let page_buffers = if double_buffered {
            vec![
                ram_region.range.end - 2 * page_size,
                ram_region.range.end - page_size,
            ]
        } else {
            vec![ram_region.range.end - page_size]
        };

        tracing::debug!("Page buffers: {:#010X?}", page_buffers);

        Ok(FlashAlgorithm {
            name: raw.name.clone(),
            default: raw.default,
            load_address,
            instructions,
            pc_init: raw.pc_init.map(|v| raw.load_address + v as u64),
            pc_uninit: raw.pc_uninit.map(|v| raw.load_address + v as u64),
            pc_program_page: raw.load_address + raw.pc_program_page as u64,
            pc_erase_sector: raw.load_address + raw.pc_erase_sector as u64,
            pc_erase_all: raw.erase_all_offset().map(|v| raw.load_address + v as u64),
            static_base: raw.load_address + raw.data_section_offset as u64,
            // The stack grows down from the bottom of the first page buffer.
            begin_stack: page_buffers[0],
            page_buffers,
            flash_properties: raw.flash_properties.clone(),
        })
    }

    /// The address of the page buffer the next page data is staged in.
    pub fn begin_data(&self) -> u64 {
        self.page_buffers[0]
    }
}

#[cfg(test)]
mod test {
    use flashkit_target::{FlashProperties, RamRegion, SectorDescription, SectorInfo};

    use super::*;

    fn demo_raw_algorithm() -> RawFlashAlgorithm {
        RawFlashAlgorithm {
            name: "demo".into(),
            instructions: vec![0xaa; 64],
            load_address: 0x2000_0020,
            pc_init: Some(0x1),
            pc_uninit: Some(0x11),
            pc_program_page: 0x21,
            pc_erase_sector: 0x31,
            pc_erase_all: None,
            data_section_offset: 0x40,
            flash_properties: FlashProperties {
                address_range: 0x0800_0000..0x0801_0000,
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

    fn demo_ram() -> RamRegion {
        RamRegion {
            name: None,
            range: 0x2000_0000..0x2000_4000,
            cores: vec!["main".into()],
        }
    }

    #[test]
    fn assemble_lays_out_code_stack_and_buffers() {
        let raw = demo_raw_algorithm();
        let algo =
            FlashAlgorithm::assemble_from_raw(&raw, &demo_ram(), Architecture::Arm).unwrap();

        // Header (8 words) sits below the raw load address.
        assert_eq!(algo.load_address, 0x2000_0000);
        assert_eq!(algo.instructions.len(), 8 + 16);

        assert_eq!(algo.pc_init, Some(0x2000_0021));
        assert_eq!(algo.pc_uninit, Some(0x2000_0031));
        assert_eq!(algo.pc_program_page, 0x2000_0041);
        assert_eq!(algo.pc_erase_sector, 0x2000_0051);
        assert_eq!(algo.pc_erase_all, None);
        assert_eq!(algo.static_base, 0x2000_0060);

        // 16 KiB of RAM leave room for two page buffers at the top.
        assert_eq!(algo.page_buffers, vec![0x2000_3800, 0x2000_3C00]);
        assert_eq!(algo.begin_stack, 0x2000_3800);
    }

    #[test]
    fn assemble_falls_back_to_a_single_page_buffer() {
        let raw = demo_raw_algorithm();
        let ram = RamRegion {
            range: 0x2000_0000..0x2000_0800,
            ..demo_ram()
        };

        let algo = FlashAlgorithm::assemble_from_raw(&raw, &ram, Architecture::Arm).unwrap();
        assert_eq!(algo.page_buffers, vec![0x2000_0400]);
    }

    #[test]
    fn assemble_rejects_too_small_ram() {
        let raw = demo_raw_algorithm();
        let ram = RamRegion {
            range: 0x2000_0000..0x2000_0400,
            ..demo_ram()
        };

        assert!(matches!(
            FlashAlgorithm::assemble_from_raw(&raw, &ram, Architecture::Arm),
            Err(FlashError::InsufficientRam { .. })
        ));
    }

    #[test]
    fn assemble_rejects_load_address_without_header_room() {
        let raw = RawFlashAlgorithm {
            load_address: 0x2000_0010,
            ..demo_raw_algorithm()
        };

        assert!(matches!(
            FlashAlgorithm::assemble_from_raw(&raw, &demo_ram(), Architecture::Arm),
            Err(FlashError::InvalidLoadAddress { .. })
        ));
    }

    fn demo_assembled(properties: FlashProperties) -> FlashAlgorithm {
        FlashAlgorithm {
            flash_properties: properties,
            ..Default::default()
        }
    }

    #[test]
    fn flash_sector_single_size() {
        let config = demo_assembled(FlashProperties {
            sectors: vec![SectorDescription {
                size: 0x100,
                address: 0x0,
            }],
            address_range: 0x1000..0x1000 + 0x1000,
            page_size: 0x10,
            ..Default::default()
        });

        let expected_first = SectorInfo {
            base_address: 0x1000,
            size: 0x100,
        };

        assert!(config.sector_info(0x1000 - 1).is_none());

        assert_eq!(Some(expected_first), config.sector_info(0x1000));
        assert_eq!(Some(expected_first), config.sector_info(0x10ff));
        assert_eq!(Some(expected_first), config.sector_info(0x100b));
    }

    #[test]
    fn flash_sector_multiple_sizes() {
        let config = demo_assembled(FlashProperties {
            sectors: vec![
                SectorDescription {
                    size: 0x4000,
                    address: 0x0,
                },
                SectorDescription {
                    size: 0x1_0000,
                    address: 0x1_0000,
                },
                SectorDescription {
                    size: 0x2_0000,
                    address: 0x2_0000,
                },
            ],
            address_range: 0x800_0000..0x800_0000 + 0x10_0000,
            page_size: 0x10,
            ..Default::default()
        });

        assert_eq!(
            Some(SectorInfo {
                base_address: 0x800_4000,
                size: 0x4000,
            }),
            config.sector_info(0x800_4000)
        );
        assert_eq!(
            Some(SectorInfo {
                base_address: 0x801_0000,
                size: 0x1_0000,
            }),
            config.sector_info(0x801_0000)
        );
        assert_eq!(
            Some(SectorInfo {
                base_address: 0x80A_0000,
                size: 0x2_0000,
            }),
            config.sector_info(0x80A_0000)
        );
    }

    #[test]
    fn flash_sector_multiple_sizes_iter() {
        let config = demo_assembled(FlashProperties {
            sectors: vec![
                SectorDescription {
                    size: 0x4000,
                    address: 0x0,
                },
                SectorDescription {
                    size: 0x1_0000,
                    address: 0x1_0000,
                },
                SectorDescription {
                    size: 0x2_0000,
                    address: 0x2_0000,
                },
            ],
            address_range: 0x800_0000..0x800_0000 + 0x8_0000,
            page_size: 0x10,
            ..Default::default()
        });

        let got: Vec<SectorInfo> = config.iter_sectors().collect();

        let expected = &[
            SectorInfo {
                base_address: 0x800_0000,
                size: 0x4000,
            },
            SectorInfo {
                base_address: 0x800_4000,
                size: 0x4000,
            },
            SectorInfo {
                base_address: 0x800_8000,
                size: 0x4000,
            },
            SectorInfo {
                base_address: 0x800_c000,
                size: 0x4000,
            },
            SectorInfo {
                base_address: 0x801_0000,
                size: 0x1_0000,
            },
            SectorInfo {
                base_address: 0x802_0000,
                size: 0x2_0000,
            },
            SectorInfo {
                base_address: 0x804_0000,
                size: 0x2_0000,
            },
            SectorInfo {
                base_address: 0x806_0000,
                size: 0x2_0000,
            },
        ];
        assert_eq!(&got, expected);
    }
}
