//! Flash programming operations.
//!
//! This module provides a means to do flash unlocking, erasing and
//! programming on a target, by driving a flash algorithm which is staged
//! into target RAM and called through the debug port.
//!
//! ## Examples
//!
//! ### Programming a few bytes
//!
//! Stage the data with a [`FlashLoader`] and commit it. The loader selects
//! the right memory region and flash algorithm for every chunk:
//!
//! ```no_run
//! use flashkit::config::Registry;
//! use flashkit::core_access::mock::MockCore;
//! use flashkit::flashing::{DownloadOptions, FlashLoader};
//!
//! let registry = Registry::from_builtin_families();
//! let target = registry.get_target("STM32F405RG")?;
//!
//! // A real application would attach a probe driver core handle here.
//! let mut core = MockCore::new();
//!
//! let mut loader = FlashLoader::new(target.memory_map.clone(), target.source.clone());
//! loader.add_data(0x0800_0000, &[0x1, 0x2, 0x3])?;
//! loader.commit(&mut core, &target, "main", DownloadOptions::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod builder;
mod erase;
mod error;
mod flash_algorithm;
mod flasher;
mod loader;
mod progress;

pub use builder::{FlashLayout, FlashPage, FlashSector};
pub use erase::erase_all;
pub use error::FlashError;
pub use flash_algorithm::FlashAlgorithm;
pub use flasher::{Flasher, FlasherState};
pub use loader::{DownloadOptions, FlashLoader};
pub use progress::{CancelToken, FlashProgress, ProgressEvent};
