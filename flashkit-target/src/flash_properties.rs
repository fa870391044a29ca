use crate::memory::SectorDescription;
use crate::serialize::{hex_range, hex_u_int};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Properties of flash memory, which are used when programming Flash memory.
///
/// These values are read from the YAML target description files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlashProperties {
    /// The range of the device flash.
    #[serde(serialize_with = "hex_range")]
    pub address_range: Range<u64>,
    /// The page size of the device flash.
    #[serde(serialize_with = "hex_u_int")]
    pub page_size: u32,
    /// The value of a byte in flash that was just erased.
    #[serde(serialize_with = "hex_u_int")]
    pub erased_byte_value: u8,
    /// The approximative time it takes to program a page, in milliseconds.
    pub program_page_timeout: u32,
    /// The approximative time it takes to erase a sector, in milliseconds.
    pub erase_sector_timeout: u32,
    /// The available sectors of the device flash.
    #[serde(default)]
    pub sectors: Vec<SectorDescription>,
}

impl Default for FlashProperties {
    #[allow(clippy::reversed_empty_ranges)]
    fn default() -> Self {
        FlashProperties {
            address_range: 0..0,
            page_size: 0,
            erased_byte_value: 0,
            program_page_timeout: 0,
            erase_sector_timeout: 0,
            sectors: vec![],
        }
    }
}

impl FlashProperties {
    /// Validates the flash geometry.
    ///
    /// The sector descriptions must tile the address range exactly: the first
    /// description starts at offset 0, descriptions are sorted ascending, and
    /// every group of equally sized sectors ends exactly where the next group
    /// (or the flash) ends. Sector sizes must be powers of two and a multiple
    /// of the page size.
    pub fn validate(&self) -> Result<(), String> {
        let flash_size = self
            .address_range
            .end
            .checked_sub(self.address_range.start)
            .ok_or_else(|| "flash address range ends before it starts".to_string())?;

        if self.page_size == 0 || self.page_size % 4 != 0 {
            return Err(format!(
                "page size {:#x} is not a non-zero multiple of 4",
                self.page_size
            ));
        }

        if self.address_range.start % self.page_size as u64 != 0 {
            return Err(format!(
                "flash start address {:#x} is not aligned to the page size {:#x}",
                self.address_range.start, self.page_size
            ));
        }

        if self.sectors.is_empty() {
            return Err("no flash sectors are defined".to_string());
        }

        if self.sectors[0].address != 0 {
            return Err(format!(
                "the first sector group starts at offset {:#x} instead of 0, leaving a gap",
                self.sectors[0].address
            ));
        }

        for (i, sector) in self.sectors.iter().enumerate() {
            if sector.address >= flash_size {
                return Err(format!(
                    "the sector group at offset {:#x} starts beyond the end of the flash",
                    sector.address
                ));
            }

            if !sector.size.is_power_of_two() {
                return Err(format!(
                    "sector size {:#x} at offset {:#x} is not a power of two",
                    sector.size, sector.address
                ));
            }

            if sector.size % self.page_size as u64 != 0 {
                return Err(format!(
                    "page size {:#x} does not divide sector size {:#x}",
                    self.page_size, sector.size
                ));
            }

            // End of the group of equally sized sectors described by this entry.
            let group_end = match self.sectors.get(i + 1) {
                Some(next) if next.address <= sector.address => {
                    return Err(format!(
                        "sector groups at offsets {:#x} and {:#x} are not sorted ascending",
                        sector.address, next.address
                    ));
                }
                Some(next) => next.address,
                None => flash_size,
            };

            if (group_end - sector.address) % sector.size != 0 {
                return Err(format!(
                    "sectors of size {:#x} starting at offset {:#x} do not tile the range up to {:#x}",
                    sector.size, sector.address, group_end
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn uniform_properties() -> FlashProperties {
        FlashProperties {
            address_range: 0x0800_0000..0x0801_0000,
            page_size: 1024,
            erased_byte_value: 0xff,
            program_page_timeout: 500,
            erase_sector_timeout: 3000,
            sectors: vec![SectorDescription {
                size: 0x1000,
                address: 0,
            }],
        }
    }

    #[test]
    fn uniform_sectors_are_valid() {
        assert!(uniform_properties().validate().is_ok());
    }

    #[test]
    fn non_uniform_sectors_are_valid() {
        let props = FlashProperties {
            address_range: 0x0800_0000..0x0810_0000,
            sectors: vec![
                SectorDescription {
                    size: 0x4000,
                    address: 0,
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
            ..uniform_properties()
        };
        assert!(props.validate().is_ok());
    }

    #[test]
    fn sector_gap_is_rejected() {
        let props = FlashProperties {
            sectors: vec![SectorDescription {
                size: 0x1000,
                address: 0x1000,
            }],
            ..uniform_properties()
        };
        assert!(props.validate().is_err());
    }

    #[test]
    fn partial_trailing_sector_is_rejected() {
        // 0x1800 worth of flash cannot be tiled with 0x1000 sectors.
        let props = FlashProperties {
            address_range: 0x0800_0000..0x0800_1800,
            ..uniform_properties()
        };
        assert!(props.validate().is_err());
    }

    #[test]
    fn non_power_of_two_sector_is_rejected() {
        let props = FlashProperties {
            address_range: 0x0800_0000..0x0800_0C00,
            sectors: vec![SectorDescription {
                size: 0xC00,
                address: 0,
            }],
            ..uniform_properties()
        };
        assert!(props.validate().is_err());
    }

    #[test]
    fn page_size_must_divide_sector_size() {
        let props = FlashProperties {
            page_size: 0x1800,
            sectors: vec![SectorDescription {
                size: 0x1000,
                address: 0,
            }],
            ..uniform_properties()
        };
        assert!(props.validate().is_err());
    }

    #[test]
    fn unsorted_sector_groups_are_rejected() {
        let props = FlashProperties {
            sectors: vec![
                SectorDescription {
                    size: 0x1000,
                    address: 0,
                },
                SectorDescription {
                    size: 0x1000,
                    address: 0,
                },
            ],
            ..uniform_properties()
        };
        assert!(props.validate().is_err());
    }
}
