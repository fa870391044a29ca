use flashkit_target::{MemoryRange, MemoryRegion};

use super::{FlashError, FlashProgress, Flasher};
use crate::config::Target;
use crate::core_access::CoreInterface;

/// Erases all non-volatile memory of the target which is accessible by the
/// given core.
///
/// Alias regions are skipped; erasing the window they alias already erases
/// the underlying flash. `EraseAll` is used where the algorithm provides it,
/// with the sector-by-sector fallback otherwise.
pub fn erase_all<C: CoreInterface>(
    core: &mut C,
    target: &Target,
    core_name: &str,
    progress: FlashProgress,
) -> Result<(), FlashError> {
    tracing::debug!("Erasing all...");

    for region in target
        .memory_map
        .iter()
        .filter_map(MemoryRegion::as_nvm_region)
    {
        if region.is_alias {
            tracing::debug!("Skipping alias memory region {:#010x?}", region.range);
            continue;
        }
        if !region.accessible_by(core_name) {
            continue;
        }
        tracing::debug!(
            "    region: {:#010x?} ({} bytes)",
            region.range,
            region.range.end - region.range.start
        );

        let algorithm = target.resolve_algorithm(&region.range)?;
        tracing::debug!("     -- using algorithm: {}", algorithm.name);

        let mut flasher = Flasher::new(core, target, core_name, algorithm, progress.clone())?;

        if flasher.is_chip_erase_supported() {
            tracing::debug!("     -- chip erase supported, doing it.");
            flasher.run_erase_all()?;
        } else {
            tracing::debug!("     -- chip erase not supported, erasing sector by sector.");

            let sectors = flasher
                .flash_algorithm()
                .iter_sectors()
                .filter(|info| region.range.contains_range(&info.address_range()))
                .collect::<Vec<_>>();

            flasher.run_erase(|active| {
                for info in sectors {
                    tracing::debug!(
                        "    sector: {:#010x}-{:#010x} ({} bytes)",
                        info.base_address,
                        info.base_address + info.size,
                        info.size
                    );

                    active
                        .erase_sector(info.base_address)
                        .map_err(|error| FlashError::EraseFailed {
                            sector_address: info.base_address,
                            source: Box::new(error),
                        })?;
                }
                Ok(())
            })?;
        }
    }

    Ok(())
}
