use std::time::Duration;

use thiserror::Error;

use crate::core_access::{CoreError, CoreStatus};

/// Describes any error that happened during the or in preparation for the
/// flashing procedure.
#[derive(Debug, Error)]
pub enum FlashError {
    /// No memory region of the target contains the address, or the region
    /// containing it is not reachable from the requested core.
    #[error("address {address:#010x} is not mapped for core {core}")]
    AddressNotMapped {
        /// The unmapped address.
        address: u64,
        /// The core the lookup was performed for.
        core: String,
    },

    /// None of the target's flash algorithms covers the requested range.
    #[error(
        "no flash algorithm of the target covers the range {start:#010x}..{end:#010x}"
    )]
    NoAlgorithmForRange {
        /// Start of the requested range.
        start: u64,
        /// End of the requested range.
        end: u64,
    },

    /// More than one flash algorithm covers the requested range and none of
    /// them is marked as the default.
    #[error(
        "multiple flash algorithms cover the range {start:#010x}..{end:#010x} and none is marked as default"
    )]
    AmbiguousAlgorithm {
        /// Start of the requested range.
        start: u64,
        /// End of the requested range.
        end: u64,
    },

    /// No NVM region contains the data staged for programming.
    #[error("no flash memory contains the requested address {0:#010x}")]
    NoSuitableNvm(u64),

    /// No RAM region accessible by the core can host the flash algorithm.
    #[error("no RAM region accessible by core {core} is defined for the target")]
    NoRamDefined {
        /// The core the algorithm was supposed to run on.
        core: String,
    },

    /// The RAM region is too small for the algorithm, its stack and one page
    /// buffer.
    #[error(
        "the RAM region holds {available} bytes, but staging the flash algorithm requires {required}"
    )]
    InsufficientRam {
        /// Bytes needed to stage the algorithm.
        required: u64,
        /// Bytes available in the RAM region.
        available: u64,
    },

    /// The algorithm's load address lies outside the chosen RAM region.
    #[error("the flash algorithm load address {address:#010x} does not lie in the RAM region")]
    InvalidLoadAddress {
        /// The offending load address.
        address: u64,
    },

    /// The flash algorithm specified a page size which cannot be staged.
    #[error("the page size {size:#x} is not a non-zero multiple of 4")]
    InvalidPageSize {
        /// The offending page size.
        size: u32,
    },

    /// The target-side routine reported a failure.
    ///
    /// The error code is the raw value of the result register and is not
    /// interpreted further; its meaning is specific to the algorithm.
    #[error("the '{name}' routine returned error code {error_code:#x}")]
    RoutineCallFailed {
        /// The name of the routine.
        name: &'static str,
        /// The raw non-zero result register value.
        error_code: u32,
    },

    /// The target-side routine did not complete within its timeout budget.
    ///
    /// This is fatal for the current run. The caller may retry the whole
    /// program operation from a clean erased state, but must never retry the
    /// single stuck call.
    #[error("the '{name}' routine did not complete within {timeout:?}")]
    FlashTimeout {
        /// The name of the routine.
        name: &'static str,
        /// The per-call timeout budget that elapsed.
        timeout: Duration,
    },

    /// The core entered an unexpected state while running a routine.
    #[error("the core entered the unexpected state {status:?} while running a flash routine")]
    UnexpectedCoreStatus {
        /// The observed status.
        status: CoreStatus,
    },

    /// Calling the `Init` routine failed.
    #[error("initializing the flash algorithm failed")]
    Init(#[source] Box<FlashError>),

    /// Calling the `UnInit` routine failed.
    #[error("uninitializing the flash algorithm failed")]
    Uninit(#[source] Box<FlashError>),

    /// Erasing a sector failed. Carries the address the run stopped at.
    #[error("erasing the sector at address {sector_address:#010x} failed")]
    EraseFailed {
        /// The address of the sector being erased.
        sector_address: u64,
        /// The underlying failure.
        #[source]
        source: Box<FlashError>,
    },

    /// Programming a page failed. Carries the address the run stopped at.
    #[error("programming the page at address {page_address:#010x} failed")]
    PageWrite {
        /// The address of the page being programmed.
        page_address: u64,
        /// The underlying failure.
        #[source]
        source: Box<FlashError>,
    },

    /// The algorithm does not expose an `EraseAll` entry point.
    #[error("a full chip erase is not supported by the flash algorithm")]
    ChipEraseNotSupported,

    /// Erasing the whole chip failed.
    #[error("erasing the whole chip failed")]
    ChipEraseFailed {
        /// The underlying failure.
        #[source]
        source: Box<FlashError>,
    },

    /// The target does not have a core with the requested name.
    #[error("the target has no core named {0}")]
    NoSuchCore(String),

    /// The contents of the flash did not match the staged data during
    /// verification.
    #[error("verification of the page at address {page_address:#010x} failed")]
    VerifyFailed {
        /// The address of the mismatching page.
        page_address: u64,
    },

    /// The RAM contents did not match the algorithm after staging it.
    #[error("the RAM contents did not match the expected contents after staging the flash algorithm")]
    FlashAlgorithmNotLoaded,

    /// Two chunks of staged data overlap each other.
    #[error("the data to stage overlaps existing data at address {0:#010x}")]
    DataOverlap(u64),

    /// The address is not covered by the flash algorithm's properties.
    #[error("{0:#010x} is not a valid address of the flash managed by the algorithm")]
    InvalidFlashAddress(u64),

    /// The operation was cancelled between two routine calls.
    #[error("the flash operation was cancelled")]
    Cancelled,

    /// A register value did not fit the width of the target register.
    #[error("the value {0:#x} is too large for a core register")]
    RegisterValueNotSupported(u64),

    /// Something during the interaction with the core went wrong.
    #[error("interaction with the core failed")]
    Core(#[source] CoreError),
}
