use std::fmt::{Debug, Formatter};

use flashkit_target::MemoryRange;

use super::{FlashAlgorithm, FlashError};

/// The description of a page in flash.
///
/// A page always spans the full page size of the algorithm. Bytes which are
/// not covered by staged data keep the erased byte value, so a partially
/// written page is padded instead of being left half-written.
#[derive(Clone, PartialEq, Eq)]
pub struct FlashPage {
    address: u64,
    data: Vec<u8>,
}

impl Debug for FlashPage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashPage")
            .field("address", &format_args!("{:#010x}", self.address))
            .field("size", &format_args!("{:#x}", self.data.len()))
            .finish()
    }
}

impl FlashPage {
    fn new(address: u64, size: u32, erased_byte_value: u8) -> Self {
        Self {
            address,
            data: vec![erased_byte_value; size as usize],
        }
    }

    /// Returns the start address of the page.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the page in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Returns the data slice of the page.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// The description of a sector in flash.
#[derive(Clone, PartialEq, Eq)]
pub struct FlashSector {
    address: u64,
    size: u64,
}

impl Debug for FlashSector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashSector")
            .field("address", &format_args!("{:#010x}", self.address))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

impl FlashSector {
    /// Returns the start address of the sector.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the sector in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// The built layout of the data in flash: the sectors which have to be
/// erased, and the padded pages which have to be programmed, both in
/// ascending address order.
#[derive(Debug, Clone, Default)]
pub struct FlashLayout {
    sectors: Vec<FlashSector>,
    pages: Vec<FlashPage>,
}

impl FlashLayout {
    /// Get the sectors of the flash layout.
    pub fn sectors(&self) -> &[FlashSector] {
        &self.sectors
    }

    /// Get the pages of the flash layout.
    pub fn pages(&self) -> &[FlashPage] {
        &self.pages
    }
}

/// A block of data that is to be written to flash.
#[derive(Clone)]
struct FlashDataBlock {
    address: u64,
    data: Vec<u8>,
}

impl FlashDataBlock {
    fn address_range(&self) -> std::ops::Range<u64> {
        self.address..self.address + self.data.len() as u64
    }
}

/// A helper structure to build a flash layout from a set of data blocks.
#[derive(Clone, Default)]
pub(super) struct FlashBuilder {
    data_blocks: Vec<FlashDataBlock>,
}

impl FlashBuilder {
    /// Creates a new `FlashBuilder` with empty data.
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Add a block of data to be programmed.
    ///
    /// The blocks are kept sorted by address; overlapping blocks are
    /// rejected.
    pub(super) fn add_data(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        let position = match self
            .data_blocks
            .binary_search_by_key(&address, |block| block.address)
        {
            Ok(_) => return Err(FlashError::DataOverlap(address)),
            Err(position) => position,
        };

        let new_range = address..address + data.len() as u64;

        if let Some(previous) = position.checked_sub(1).and_then(|i| self.data_blocks.get(i)) {
            if previous.address_range().intersects_range(&new_range) {
                return Err(FlashError::DataOverlap(address));
            }
        }

        // `position` is the index of the first block past the new one, since
        // nothing has been inserted yet.
        if let Some(next) = self.data_blocks.get(position) {
            if next.address_range().intersects_range(&new_range) {
                return Err(FlashError::DataOverlap(address));
            }
        }

        self.data_blocks.insert(
            position,
            FlashDataBlock {
                address,
                data: data.to_vec(),
            },
        );

        Ok(())
    }

    /// The staged data blocks as `(address, data)` pairs, sorted by address.
    pub(super) fn blocks(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.data_blocks
            .iter()
            .map(|block| (block.address, block.data.as_slice()))
    }

    /// Layouts the staged data for the flash managed by `flash_algorithm`.
    ///
    /// The data is split into pages aligned to the page grid of the flash,
    /// with uncovered bytes padded with the erased byte value, and the
    /// sectors covering those pages are collected for erasing. Blocks are
    /// sorted, so both lists come out in ascending address order.
    pub(super) fn build_sectors_and_pages(
        &self,
        flash_algorithm: &FlashAlgorithm,
    ) -> Result<FlashLayout, FlashError> {
        let page_size = flash_algorithm.flash_properties.page_size;
        let erased_byte_value = flash_algorithm.flash_properties.erased_byte_value;

        let mut pages: Vec<FlashPage> = Vec::new();

        for block in &self.data_blocks {
            let mut offset = 0usize;

            while offset < block.data.len() {
                let address = block.address + offset as u64;

                // Open a new page unless the address still falls into the
                // last one. Blocks are sorted, so checking the last page is
                // enough.
                let needs_new_page = match pages.last() {
                    Some(page) => address >= page.address + page.size() as u64,
                    None => true,
                };
                if needs_new_page {
                    let info = flash_algorithm
                        .page_info(address)
                        .ok_or(FlashError::InvalidFlashAddress(address))?;
                    tracing::trace!(
                        "Added page ({:#010x}..{:#010x})",
                        info.base_address,
                        info.base_address + info.size as u64
                    );
                    pages.push(FlashPage::new(
                        info.base_address,
                        info.size,
                        erased_byte_value,
                    ));
                }
                let page = pages.last_mut().expect("a page was just ensured");

                let page_offset = (address - page.address) as usize;
                let length = (block.data.len() - offset).min(page_size as usize - page_offset);
                page.data[page_offset..page_offset + length]
                    .copy_from_slice(&block.data[offset..offset + length]);

                offset += length;
            }
        }

        // Collect the sectors covering the pages. A sector can be larger
        // than a page or smaller, so walk the sector grid across each page.
        let mut sectors: Vec<FlashSector> = Vec::new();
        for page in &pages {
            let mut address = page.address;
            let page_end = page.address + page.size() as u64;

            while address < page_end {
                let info = flash_algorithm
                    .sector_info(address)
                    .ok_or(FlashError::InvalidFlashAddress(address))?;

                if sectors.last().map(FlashSector::address) != Some(info.base_address) {
                    tracing::trace!(
                        "Added sector ({:#010x}..{:#010x})",
                        info.base_address,
                        info.base_address + info.size
                    );
                    sectors.push(FlashSector {
                        address: info.base_address,
                        size: info.size,
                    });
                }

                address = info.base_address + info.size;
            }
        }

        Ok(FlashLayout { sectors, pages })
    }
}

#[cfg(test)]
mod tests {
    use flashkit_target::{FlashProperties, SectorDescription};

    use super::*;

    fn demo_algorithm(page_size: u32, sector_size: u64) -> FlashAlgorithm {
        FlashAlgorithm {
            flash_properties: FlashProperties {
                address_range: 0x0800_0000..0x0801_0000,
                page_size,
                erased_byte_value: 0xff,
                program_page_timeout: 200,
                erase_sector_timeout: 200,
                sectors: vec![SectorDescription {
                    size: sector_size,
                    address: 0,
                }],
            },
            ..Default::default()
        }
    }

    #[test]
    fn add_overlapping_data() {
        let mut flash_builder = FlashBuilder::new();
        assert!(flash_builder.add_data(0, &[42]).is_ok());
        assert!(flash_builder.add_data(0, &[42]).is_err());
    }

    #[test]
    fn add_enclosed_data() {
        let mut flash_builder = FlashBuilder::new();
        assert!(flash_builder.add_data(0, &[42; 16]).is_ok());
        assert!(flash_builder.add_data(4, &[42]).is_err());
    }

    #[test]
    fn add_non_overlapping_data() {
        let mut flash_builder = FlashBuilder::new();
        assert!(flash_builder.add_data(0, &[42]).is_ok());
        assert!(flash_builder.add_data(1, &[42]).is_ok());
    }

    #[test]
    fn single_byte_fills_one_padded_page() {
        let algorithm = demo_algorithm(1024, 4096);
        let mut flash_builder = FlashBuilder::new();
        flash_builder.add_data(0x0800_0000, &[42]).unwrap();

        let layout = flash_builder.build_sectors_and_pages(&algorithm).unwrap();

        assert_eq!(layout.pages().len(), 1);
        let page = &layout.pages()[0];
        assert_eq!(page.address(), 0x0800_0000);
        assert_eq!(page.data()[0], 42);
        assert!(page.data()[1..].iter().all(|b| *b == 0xff));

        assert_eq!(layout.sectors().len(), 1);
        assert_eq!(layout.sectors()[0].address(), 0x0800_0000);
        assert_eq!(layout.sectors()[0].size(), 4096);
    }

    #[test]
    fn unaligned_block_keeps_leading_pad() {
        let algorithm = demo_algorithm(1024, 4096);
        let mut flash_builder = FlashBuilder::new();
        flash_builder.add_data(0x0800_0010, &[42; 8]).unwrap();

        let layout = flash_builder.build_sectors_and_pages(&algorithm).unwrap();

        let page = &layout.pages()[0];
        assert_eq!(page.address(), 0x0800_0000);
        assert!(page.data()[..0x10].iter().all(|b| *b == 0xff));
        assert!(page.data()[0x10..0x18].iter().all(|b| *b == 42));
        assert!(page.data()[0x18..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn block_spanning_pages_and_sectors() {
        let algorithm = demo_algorithm(1024, 4096);
        let mut flash_builder = FlashBuilder::new();
        flash_builder.add_data(0x0800_0000, &[42; 5024]).unwrap();

        let layout = flash_builder.build_sectors_and_pages(&algorithm).unwrap();

        // 5024 bytes need 5 pages of 1024 bytes and touch 2 sectors.
        assert_eq!(layout.pages().len(), 5);
        assert_eq!(layout.sectors().len(), 2);

        // The tail of the last page is padded.
        let last = layout.pages().last().unwrap();
        assert_eq!(last.address(), 0x0800_1000);
        assert!(last.data()[5024 - 4096..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn two_blocks_in_one_page_share_it() {
        let algorithm = demo_algorithm(1024, 4096);
        let mut flash_builder = FlashBuilder::new();
        flash_builder.add_data(0x0800_0000, &[1; 16]).unwrap();
        flash_builder.add_data(0x0800_0100, &[2; 16]).unwrap();

        let layout = flash_builder.build_sectors_and_pages(&algorithm).unwrap();

        assert_eq!(layout.pages().len(), 1);
        let page = &layout.pages()[0];
        assert!(page.data()[..16].iter().all(|b| *b == 1));
        assert!(page.data()[16..0x100].iter().all(|b| *b == 0xff));
        assert!(page.data()[0x100..0x110].iter().all(|b| *b == 2));
    }

    #[test]
    fn sectors_smaller_than_a_page_are_all_collected() {
        let algorithm = demo_algorithm(1024, 128);
        let mut flash_builder = FlashBuilder::new();
        flash_builder.add_data(0x0800_0000, &[42; 1024]).unwrap();

        let layout = flash_builder.build_sectors_and_pages(&algorithm).unwrap();

        assert_eq!(layout.pages().len(), 1);
        assert_eq!(layout.sectors().len(), 8);
        assert_eq!(layout.sectors()[0].address(), 0x0800_0000);
        assert_eq!(layout.sectors()[7].address(), 0x0800_0380);
    }

    #[test]
    fn data_outside_the_flash_is_rejected() {
        let algorithm = demo_algorithm(1024, 4096);
        let mut flash_builder = FlashBuilder::new();
        flash_builder.add_data(0x0900_0000, &[42]).unwrap();

        assert!(matches!(
            flash_builder.build_sectors_and_pages(&algorithm),
            Err(FlashError::InvalidFlashAddress(0x0900_0000))
        ));
    }
}
