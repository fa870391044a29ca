use std::collections::BTreeSet;
use std::ops::Range;

use flashkit_target::{MemoryRegion, NvmRegion, TargetDescriptionSource};

use super::builder::FlashBuilder;
use super::{CancelToken, FlashError, FlashProgress, Flasher};
use crate::config::Target;
use crate::core_access::CoreInterface;

/// Options for the programming of data.
#[derive(Default)]
pub struct DownloadOptions {
    /// An optional progress reporter.
    pub progress: Option<FlashProgress>,
    /// Erase the whole flash with `EraseAll` before programming, instead of
    /// erasing only the touched sectors.
    ///
    /// A full-flash replacement uses `EraseAll` automatically when the
    /// algorithm supports it; this flag forces it and fails with
    /// [`FlashError::ChipEraseNotSupported`] when the routine is missing.
    pub do_chip_erase: bool,
    /// Skip the erase phase entirely. Only sound when the touched flash is
    /// known to be erased already.
    pub skip_erase: bool,
    /// Read the programmed pages back and compare them with the staged data.
    pub verify: bool,
    /// Use both page buffers when the RAM region fits two of them.
    pub enable_double_buffering: bool,
    /// A token to abort the operation between two routine calls.
    pub cancel_token: Option<CancelToken>,
}

/// `FlashLoader` is a struct which manages the flashing of any chunks of data
/// onto any sections of flash.
///
/// Use [`add_data()`](FlashLoader::add_data) to add chunks of data.
/// Once you are done adding all your data, use
/// [`commit()`](FlashLoader::commit) to program the data.
/// The flash loader will make sure to select the appropriate flash region and
/// flash algorithm for the right data chunks.
///
/// The loader remembers which sectors it erased. Committing the same data a
/// second time, e.g. to recover from a failed run, does not erase those
/// sectors again.
pub struct FlashLoader {
    memory_map: Vec<MemoryRegion>,
    builder: FlashBuilder,
    erased_sectors: BTreeSet<u64>,

    /// Source of the flash description, used for diagnostics.
    source: TargetDescriptionSource,
}

impl FlashLoader {
    /// Create a new flash loader.
    pub fn new(memory_map: Vec<MemoryRegion>, source: TargetDescriptionSource) -> Self {
        Self {
            memory_map,
            builder: FlashBuilder::new(),
            erased_sectors: BTreeSet::new(),
            source,
        }
    }

    /// Stages a chunk of data to be programmed.
    ///
    /// The chunk can cross memory region boundaries as long as each byte of
    /// it falls into a RAM or NVM region.
    pub fn add_data(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        tracing::debug!(
            "Adding data at address {:#010x} with size {} bytes",
            address,
            data.len()
        );

        self.check_data_in_memory_map(address..address + data.len() as u64)?;
        self.builder.add_data(address, data)
    }

    /// Check that the given address range is completely covered by RAM and
    /// NVM regions of the memory map, possibly by multiple regions.
    fn check_data_in_memory_map(&self, range: Range<u64>) -> Result<(), FlashError> {
        let mut address = range.start;
        while address < range.end {
            match Self::get_region_for_address(&self.memory_map, address) {
                Some(MemoryRegion::Nvm(region)) => address = region.range.end,
                Some(MemoryRegion::Ram(region)) => address = region.range.end,
                _ => return Err(FlashError::NoSuitableNvm(address)),
            }
        }
        Ok(())
    }

    /// Returns the smallest memory region containing `address`, so an alias
    /// window inside a larger window wins.
    pub fn get_region_for_address(
        memory_map: &[MemoryRegion],
        address: u64,
    ) -> Option<&MemoryRegion> {
        memory_map
            .iter()
            .filter(|region| region.contains(address))
            .min_by_key(|region| {
                let range = region.address_range();
                range.end - range.start
            })
    }

    /// Writes all the stored data chunks to flash.
    ///
    /// `core` is the handle to the core named `core_name` of `target`; every
    /// region the staged data touches must be accessible by that core.
    ///
    /// The steps are, per NVM region with staged data: resolve the flash
    /// algorithm, stage it, erase the touched sectors which are not known to
    /// be erased already, and program the pages in ascending address order.
    /// The first failure terminates the run.
    pub fn commit<C: CoreInterface>(
        &mut self,
        core: &mut C,
        target: &Target,
        core_name: &str,
        options: DownloadOptions,
    ) -> Result<(), FlashError> {
        tracing::debug!(
            "Committing flash for core {} (description source: {:?})",
            core_name,
            self.source
        );
        for (address, data) in self.builder.blocks() {
            tracing::debug!(
                "    data: {:#010x}..{:#010x} ({} bytes)",
                address,
                address + data.len() as u64,
                data.len()
            );
        }

        let progress = options
            .progress
            .clone()
            .unwrap_or_else(FlashProgress::empty);
        let progress = match &options.cancel_token {
            Some(token) => progress.with_cancel_token(token.clone()),
            None => progress,
        };

        // Assign every staged byte to the most specific region containing it.
        let mut nvm_plan: Vec<(NvmRegion, FlashBuilder)> = Vec::new();
        let mut ram_plan: Vec<(u64, Vec<u8>)> = Vec::new();

        for (block_address, block_data) in self.builder.blocks() {
            let mut offset = 0usize;
            while offset < block_data.len() {
                let address = block_address + offset as u64;
                let region = target.memory_region_for(address, core_name)?;

                let region_end = region.address_range().end;
                let length =
                    (block_data.len() - offset).min((region_end - address) as usize);
                let segment = &block_data[offset..offset + length];

                match region {
                    MemoryRegion::Nvm(region) => {
                        let index = match nvm_plan.iter().position(|(known, _)| known == region) {
                            Some(index) => index,
                            None => {
                                nvm_plan.push((region.clone(), FlashBuilder::new()));
                                nvm_plan.len() - 1
                            }
                        };
                        nvm_plan[index].1.add_data(address, segment)?;
                    }
                    MemoryRegion::Ram(_) => ram_plan.push((address, segment.to_vec())),
                    MemoryRegion::Generic(_) => {
                        return Err(FlashError::NoSuitableNvm(address));
                    }
                }

                offset += length;
            }
        }

        // Commit NVM first, because NVM programming overwrites RAM.
        for (region, builder) in &nvm_plan {
            self.commit_nvm(core, target, core_name, region, builder, &options, &progress)?;
        }

        // Commit RAM last.
        for (address, data) in &ram_plan {
            tracing::info!("RAM write at {:#010x} ({} bytes)", address, data.len());
            core.write_8(*address, data).map_err(FlashError::Core)?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_nvm<C: CoreInterface>(
        &mut self,
        core: &mut C,
        target: &Target,
        core_name: &str,
        region: &NvmRegion,
        builder: &FlashBuilder,
        options: &DownloadOptions,
        progress: &FlashProgress,
    ) -> Result<(), FlashError> {
        tracing::debug!(
            "Using builder for region ({:#010x}..{:#010x})",
            region.range.start,
            region.range.end
        );

        // The requested range is the span of the staged data in this region.
        let requested = builder
            .blocks()
            .fold(None::<Range<u64>>, |acc, (address, data)| {
                let end = address + data.len() as u64;
                Some(match acc {
                    Some(range) => range.start.min(address)..range.end.max(end),
                    None => address..end,
                })
            })
            .expect("the builder contains data for this region");

        let raw_algorithm = target.resolve_algorithm(&requested)?;
        tracing::debug!("     -- using algorithm: {}", raw_algorithm.name);

        let mut flasher = Flasher::new(core, target, core_name, raw_algorithm, progress.clone())?;

        let flash_layout = builder.build_sectors_and_pages(flasher.flash_algorithm())?;
        progress.initialized(flash_layout.clone());

        if !options.skip_erase {
            // A single EraseAll is preferred when the whole flash is being
            // replaced anyway, or when the caller forces it.
            let full_replacement = flash_layout.sectors().len()
                == flasher.flash_algorithm().iter_sectors().count();

            if options.do_chip_erase && !flasher.is_chip_erase_supported() {
                return Err(FlashError::ChipEraseNotSupported);
            }

            if (options.do_chip_erase || full_replacement) && flasher.is_chip_erase_supported() {
                flasher.run_erase_all()?;
                self.erased_sectors.extend(
                    flasher
                        .flash_algorithm()
                        .iter_sectors()
                        .map(|sector| sector.base_address),
                );
            } else {
                flasher.sector_erase(&flash_layout, &mut self.erased_sectors)?;
            }
        }

        flasher.program(&flash_layout, options.enable_double_buffering)?;

        if options.verify {
            flasher.verify(&flash_layout)?;
        }

        Ok(())
    }
}
