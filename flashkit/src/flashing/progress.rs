use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{FlashError, FlashLayout};

/// A token to request cancellation of a running flash operation.
///
/// Cancellation is only observed between two routine calls. An in-flight
/// `ProgramPage` or `EraseSector` call is never interrupted, since stopping a
/// flash write mid-operation can corrupt the sector.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a new token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The running operation stops before its next
    /// routine call.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A structure to manage the flashing procedure progress reporting.
///
/// This struct stores a handler closure which is called every time an event
/// happens during the flashing process. Such an event can be the start or
/// finish of the erase or program procedure, or a progress report.
///
/// # Example
///
/// ```
/// use flashkit::flashing::FlashProgress;
///
/// // Print events
/// let progress = FlashProgress::new(|event| println!("Event: {:#?}", event));
/// ```
#[derive(Clone)]
pub struct FlashProgress {
    handler: Arc<dyn Fn(ProgressEvent)>,
    cancel: Option<CancelToken>,
}

impl FlashProgress {
    /// Create a new `FlashProgress` structure with a given `handler` to be
    /// called on events.
    pub fn new(handler: impl Fn(ProgressEvent) + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            cancel: None,
        }
    }

    /// A progress reporter which does nothing.
    pub fn empty() -> Self {
        Self::new(|_| {})
    }

    /// Attaches a cancellation token which is checked between routine calls.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Fails with [`FlashError::Cancelled`] if cancellation was requested.
    pub(super) fn check_cancelled(&self) -> Result<(), FlashError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(FlashError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Emit a flashing progress event.
    fn emit(&self, event: ProgressEvent) {
        (self.handler)(event);
    }

    /// Signal that the flash layout has been built.
    pub(super) fn initialized(&self, flash_layout: FlashLayout) {
        self.emit(ProgressEvent::Initialized { flash_layout });
    }

    /// Signal that the erasing procedure started.
    pub(super) fn started_erasing(&self) {
        self.emit(ProgressEvent::StartedErasing);
    }

    /// Signal that the programming procedure started.
    pub(super) fn started_programming(&self) {
        self.emit(ProgressEvent::StartedProgramming);
    }

    /// Signal that a sector was erased.
    pub(super) fn sector_erased(&self, size: u64, time: Duration) {
        self.emit(ProgressEvent::SectorErased { size, time });
    }

    /// Signal that a page was programmed.
    pub(super) fn page_programmed(&self, size: u32, time: Duration) {
        self.emit(ProgressEvent::PageProgrammed { size, time });
    }

    /// Signal that the erasing procedure failed.
    pub(super) fn failed_erasing(&self) {
        self.emit(ProgressEvent::FailedErasing);
    }

    /// Signal that the erasing procedure completed successfully.
    pub(super) fn finished_erasing(&self) {
        self.emit(ProgressEvent::FinishedErasing);
    }

    /// Signal that the programming procedure failed.
    pub(super) fn failed_programming(&self) {
        self.emit(ProgressEvent::FailedProgramming);
    }

    /// Signal that the programming procedure completed successfully.
    pub(super) fn finished_programming(&self) {
        self.emit(ProgressEvent::FinishedProgramming);
    }
}

/// Possible events during the flashing process.
///
/// If flashing works without problems, the events arrive in the following
/// order:
///
/// * `Initialized`
/// * `StartedErasing`
/// * `SectorErased` for every erased sector
/// * `FinishedErasing`
/// * `StartedProgramming`
/// * `PageProgrammed` for every page
/// * `FinishedProgramming`
///
/// If an error occurs in any stage, one of the `Failed*` events is emitted,
/// and no further events follow.
#[derive(Debug)]
pub enum ProgressEvent {
    /// The flash layout has been built and the flashing procedure was
    /// initialized.
    Initialized {
        /// The layout of the flash contents as it will be used by the flash
        /// procedure.
        flash_layout: FlashLayout,
    },
    /// Erasing of flash has started.
    StartedErasing,
    /// A sector has been erased successfully.
    SectorErased {
        /// The size of the sector in bytes.
        size: u64,
        /// The time it took to erase this sector.
        time: Duration,
    },
    /// Erasing of the flash has failed.
    FailedErasing,
    /// Erasing of the flash has finished successfully.
    FinishedErasing,
    /// Programming of the flash has started.
    StartedProgramming,
    /// A flash page has been programmed successfully.
    PageProgrammed {
        /// The size of this page in bytes.
        size: u32,
        /// The time it took to program this page.
        time: Duration,
    },
    /// Programming of the flash failed.
    FailedProgramming,
    /// Programming of the flash has finished successfully.
    FinishedProgramming,
}
