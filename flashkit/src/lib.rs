//! # flashkit
//!
//! A library for programming the non-volatile memory of microcontrollers
//! through a hardware debug probe, by staging CMSIS-style flash algorithms
//! into target RAM and driving their entry points over the debug port.
//!
//! The crate is built out of three layers:
//!
//! - [`config`]: the target registry. Target description files declare the
//!   cores, memory map and flash algorithms of a chip family; the registry
//!   validates them once at load time and resolves chip names to targets.
//! - [`core_access`]: the seam towards the probe driver. The flash routines
//!   drive any [`CoreInterface`](core_access::CoreInterface) implementation;
//!   the probe transport itself is not part of this crate.
//! - [`flashing`]: the execution core. A [`Flasher`](flashing::Flasher)
//!   stages an algorithm and calls its routines with the register/poll
//!   protocol, and the [`FlashLoader`](flashing::FlashLoader) partitions a
//!   write request into sectors and pages and sequences erase, program and
//!   verify across them.
#![warn(missing_docs)]

pub mod config;
pub mod core_access;
pub mod flashing;
