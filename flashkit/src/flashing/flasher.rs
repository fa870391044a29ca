use std::collections::BTreeSet;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use flashkit_target::{InstructionSet, RamRegion, RawFlashAlgorithm};

use super::{FlashAlgorithm, FlashError, FlashLayout, FlashProgress};
use crate::config::Target;
use crate::core_access::{CoreInterface, CoreRegister, CoreStatus};

/// The operation a flash algorithm is initialized for.
///
/// The operation code is passed to the `Init` routine, which may set the
/// flash controller up differently for erasing, programming and verifying.
pub(super) trait Operation {
    fn operation() -> u32;
    fn operation_name() -> &'static str {
        match Self::operation() {
            1 => "Erase",
            2 => "Program",
            3 => "Verify",
            _ => "Unknown Operation",
        }
    }
}

pub(super) struct Erase;

impl Operation for Erase {
    fn operation() -> u32 {
        1
    }
}

pub(super) struct Program;

impl Operation for Program {
    fn operation() -> u32 {
        2
    }
}

pub(super) struct Verify;

impl Operation for Verify {
    fn operation() -> u32 {
        3
    }
}

/// The lifecycle state of a [`Flasher`].
///
/// The state is diagnostic; it is reported through [`Flasher::state`] and in
/// log output, and follows the cycle
/// `Unloaded → Staged → Initialized → Uninitialized → Unloaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlasherState {
    /// No algorithm code is active in target RAM.
    Unloaded,
    /// The algorithm is staged in target RAM and verified.
    Staged,
    /// The `Init` routine has run for an operation.
    Initialized,
    /// The `UnInit` routine has run; the target is in a safe state.
    Uninitialized,
}

/// Timeout budget for the `Init` and `UnInit` routines.
const INIT_TIMEOUT: Duration = Duration::from_secs(2);
/// Timeout budget for a full chip erase, which is not covered by the
/// per-sector budget of the flash properties.
const ERASE_ALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A structure to control the flash of an attached microchip.
///
/// Once constructed it can be used to program data to the flash. The flasher
/// borrows the core exclusively; nothing else can touch the core's register
/// and memory state for the duration of a program/erase run.
pub struct Flasher<'c, C: CoreInterface> {
    core: &'c mut C,
    flash_algorithm: FlashAlgorithm,
    progress: FlashProgress,
    state: FlasherState,
}

impl<'c, C: CoreInterface> Flasher<'c, C> {
    /// Assembles the raw algorithm for the given core of the target and
    /// stages it into target RAM.
    pub fn new(
        core: &'c mut C,
        target: &Target,
        core_name: &str,
        raw_flash_algorithm: &RawFlashAlgorithm,
        progress: FlashProgress,
    ) -> Result<Self, FlashError> {
        let ram = Self::ram_for_core(target, core_name)?;

        tracing::info!("Chosen RAM to run the algo: {:x?}", ram);

        let architecture = target
            .core(core_name)
            .map(|core| core.core_type.architecture())
            .ok_or_else(|| FlashError::NoSuchCore(core_name.to_string()))?;

        let flash_algorithm =
            FlashAlgorithm::assemble_from_raw(raw_flash_algorithm, ram, architecture)?;

        let mut this = Self {
            core,
            flash_algorithm,
            progress,
            state: FlasherState::Unloaded,
        };

        this.stage()?;

        Ok(this)
    }

    fn ram_for_core<'t>(target: &'t Target, core_name: &str) -> Result<&'t RamRegion, FlashError> {
        target
            .memory_map
            .iter()
            .filter_map(|region| region.as_ram_region())
            .find(|ram| ram.accessible_by(core_name))
            .ok_or_else(|| FlashError::NoRamDefined {
                core: core_name.to_string(),
            })
    }

    /// The assembled algorithm this flasher operates with.
    pub fn flash_algorithm(&self) -> &FlashAlgorithm {
        &self.flash_algorithm
    }

    /// The current lifecycle state.
    pub fn state(&self) -> FlasherState {
        self.state
    }

    /// Whether the RAM region fits two page buffers.
    pub fn double_buffering_supported(&self) -> bool {
        self.flash_algorithm.page_buffers.len() > 1
    }

    /// Whether the algorithm exposes the `EraseAll` entry point.
    pub fn is_chip_erase_supported(&self) -> bool {
        self.flash_algorithm.pc_erase_all.is_some()
    }

    /// Writes the algorithm code into target RAM and verifies it by reading
    /// it back.
    pub fn stage(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Staging the flash algorithm.");
        let algo = &self.flash_algorithm;

        self.core
            .halt(Duration::from_millis(100))
            .map_err(FlashError::Core)?;
        self.core
            .reset_and_halt(Duration::from_millis(500))
            .map_err(FlashError::Core)?;

        let span =
            tracing::debug_span!("Loading algorithm into RAM", address = algo.load_address)
                .entered();

        self.core
            .write_32(algo.load_address, algo.instructions.as_slice())
            .map_err(FlashError::Core)?;

        drop(span);

        let mut readback = vec![0; algo.instructions.len()];
        self.core
            .read_32(algo.load_address, &mut readback)
            .map_err(FlashError::Core)?;

        if readback != algo.instructions {
            tracing::error!("Failed to verify flash algorithm. RAM contents do not match.");
            return Err(FlashError::FlashAlgorithmNotLoaded);
        }

        tracing::debug!("RAM contents match the flash algorithm blob.");
        self.state = FlasherState::Staged;

        Ok(())
    }

    fn init<O: Operation>(
        &mut self,
        clock: Option<u32>,
    ) -> Result<ActiveFlasher<'_, 'c, C, O>, FlashError> {
        tracing::debug!("Preparing flasher for operation {}", O::operation_name());

        let mut active = ActiveFlasher::<C, O> {
            flasher: self,
            _operation: PhantomData,
        };

        active.init(clock)?;
        active.flasher.state = FlasherState::Initialized;

        Ok(active)
    }

    /// Initializes the algorithm for the operation `O`, runs `f` and always
    /// uninitializes again, even when `f` failed.
    ///
    /// A failure of `UnInit` after a failed operation is logged and does not
    /// mask the original error.
    fn run_op<O: Operation, T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, 'c, C, O>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        let mut active = self.init::<O>(None)?;
        let result = f(&mut active);
        let uninit_result = active.uninit();

        self.state = FlasherState::Unloaded;

        match (result, uninit_result) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(uninit_error)) => Err(uninit_error),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(uninit_error)) => {
                tracing::warn!(
                    "UnInit failed after a failed {} operation: {}",
                    O::operation_name(),
                    uninit_error
                );
                Err(error)
            }
        }
    }

    pub(super) fn run_erase<T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, 'c, C, Erase>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.run_op(f)
    }

    pub(super) fn run_program<T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, 'c, C, Program>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.run_op(f)
    }

    pub(super) fn run_verify<T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, 'c, C, Verify>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.run_op(f)
    }

    /// Erases the entire flash managed by the algorithm.
    pub(super) fn run_erase_all(&mut self) -> Result<(), FlashError> {
        self.progress.started_erasing();

        let result = self.run_erase(|active| active.erase_all());

        if result.is_ok() {
            self.progress.finished_erasing();
        } else {
            self.progress.failed_erasing();
        }

        result
    }

    /// Erases all sectors of the given layout which have not been erased
    /// during this session yet.
    ///
    /// Every erased sector is recorded in `erased_sectors`, so a later run
    /// over the same sectors does not erase them again.
    pub(super) fn sector_erase(
        &mut self,
        flash_layout: &FlashLayout,
        erased_sectors: &mut BTreeSet<u64>,
    ) -> Result<(), FlashError> {
        self.progress.started_erasing();

        let progress = self.progress.clone();
        let result = self.run_erase(|active| {
            for sector in flash_layout.sectors() {
                progress.check_cancelled()?;

                if erased_sectors.contains(&sector.address()) {
                    tracing::debug!(
                        "Skipping erase of sector at {:#010x}, already erased this session",
                        sector.address()
                    );
                    continue;
                }

                let t = Instant::now();
                active
                    .erase_sector(sector.address())
                    .map_err(|error| FlashError::EraseFailed {
                        sector_address: sector.address(),
                        source: Box::new(error),
                    })?;
                erased_sectors.insert(sector.address());
                progress.sector_erased(sector.size(), t.elapsed());
            }
            Ok(())
        });

        if result.is_ok() {
            self.progress.finished_erasing();
        } else {
            self.progress.failed_erasing();
        }

        result
    }

    /// Programs the pages of the given layout, in ascending address order.
    pub(super) fn program(
        &mut self,
        flash_layout: &FlashLayout,
        enable_double_buffering: bool,
    ) -> Result<(), FlashError> {
        tracing::debug!("Starting program procedure.");

        if self.double_buffering_supported() && enable_double_buffering {
            self.program_double_buffer(flash_layout)
        } else {
            self.program_simple(flash_layout)
        }
    }

    /// Programs the pages one at a time, waiting for each page to finish
    /// before downloading the next one.
    fn program_simple(&mut self, flash_layout: &FlashLayout) -> Result<(), FlashError> {
        self.progress.started_programming();

        let progress = self.progress.clone();
        let result = self.run_program(|active| {
            for page in flash_layout.pages() {
                progress.check_cancelled()?;

                let t = Instant::now();
                active.program_page(page.address(), page.data())?;
                progress.page_programmed(page.size(), t.elapsed());
            }
            Ok(())
        });

        if result.is_ok() {
            self.progress.finished_programming();
        } else {
            self.progress.failed_programming();
        }

        result
    }

    /// Programs the pages using two page buffers: while the algorithm copies
    /// one buffer into flash, the data for the next page is already being
    /// downloaded into the other one.
    fn program_double_buffer(&mut self, flash_layout: &FlashLayout) -> Result<(), FlashError> {
        self.progress.started_programming();

        let progress = self.progress.clone();
        let result = self.run_program(|active| {
            let mut current_buf = 0;
            let mut last_page_address = 0;
            let timeout =
                Duration::from_millis(active.timeout_budget(Routine::ProgramPage) as u64);

            for page in flash_layout.pages() {
                progress.check_cancelled()?;

                let t = Instant::now();

                // Download the page data while the previous copy may still
                // be running.
                active.load_page_buffer(page.data(), current_buf)?;

                // Then wait for the active RAM to flash copy to finish and
                // check that it finished properly.
                let result = active
                    .wait_for_completion("program_page", timeout)
                    .map_err(|error| FlashError::PageWrite {
                        page_address: last_page_address,
                        source: Box::new(error),
                    })?;
                if result != 0 {
                    return Err(FlashError::PageWrite {
                        page_address: last_page_address,
                        source: Box::new(FlashError::RoutineCallFailed {
                            name: "program_page",
                            error_code: result,
                        }),
                    });
                }

                active.start_program_page_with_buffer(page.address(), current_buf)?;
                last_page_address = page.address();

                progress.page_programmed(page.size(), t.elapsed());
                current_buf = 1 - current_buf;
            }

            // Wait for the last copy to finish.
            let result = active
                .wait_for_completion("program_page", timeout)
                .map_err(|error| FlashError::PageWrite {
                    page_address: last_page_address,
                    source: Box::new(error),
                })?;
            if result != 0 {
                return Err(FlashError::PageWrite {
                    page_address: last_page_address,
                    source: Box::new(FlashError::RoutineCallFailed {
                        name: "program_page",
                        error_code: result,
                    }),
                });
            }

            Ok(())
        });

        if result.is_ok() {
            self.progress.finished_programming();
        } else {
            self.progress.failed_programming();
        }

        result
    }

    /// Reads the programmed pages back and compares them with the intended
    /// contents.
    pub(super) fn verify(&mut self, flash_layout: &FlashLayout) -> Result<(), FlashError> {
        let progress = self.progress.clone();
        self.run_verify(|active| {
            for page in flash_layout.pages() {
                progress.check_cancelled()?;

                let mut readback = vec![0; page.data().len()];
                active
                    .flasher
                    .core
                    .read_8(page.address(), &mut readback)
                    .map_err(FlashError::Core)?;

                if readback != page.data() {
                    return Err(FlashError::VerifyFailed {
                        page_address: page.address(),
                    });
                }
            }
            Ok(())
        })
    }
}

/// The argument registers of one routine call.
struct Registers {
    pc: u32,
    r0: Option<u32>,
    r1: Option<u32>,
    r2: Option<u32>,
    r3: Option<u32>,
}

impl Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}({:?}, {:?}, {:?}, {:?})",
            self.pc, self.r0, self.r1, self.r2, self.r3
        )
    }
}

fn into_reg(val: u64) -> Result<u32, FlashError> {
    val.try_into()
        .map_err(|_| FlashError::RegisterValueNotSupported(val))
}

/// The routines a timeout budget exists for.
enum Routine {
    EraseSector,
    ProgramPage,
}

/// A flasher whose algorithm has been initialized for the operation `O`.
pub(super) struct ActiveFlasher<'a, 'c, C: CoreInterface, O: Operation> {
    flasher: &'a mut Flasher<'c, C>,
    _operation: PhantomData<O>,
}

impl<C: CoreInterface, O: Operation> ActiveFlasher<'_, '_, C, O> {
    fn timeout_budget(&self, routine: Routine) -> u32 {
        let properties = &self.flasher.flash_algorithm.flash_properties;
        match routine {
            Routine::EraseSector => properties.erase_sector_timeout,
            Routine::ProgramPage => properties.program_page_timeout,
        }
    }

    fn init(&mut self, clock: Option<u32>) -> Result<(), FlashError> {
        let algo = &self.flasher.flash_algorithm;
        let address = algo.flash_properties.address_range.start;

        // Execute the init routine if one is present.
        if let Some(pc_init) = algo.pc_init {
            let result = self
                .call_function_and_wait(
                    &Registers {
                        pc: into_reg(pc_init)?,
                        r0: Some(into_reg(address)?),
                        r1: clock.or(Some(0)),
                        r2: Some(O::operation()),
                        r3: None,
                    },
                    true,
                    "init",
                    INIT_TIMEOUT,
                )
                .map_err(|error| FlashError::Init(Box::new(error)))?;

            if result != 0 {
                return Err(FlashError::Init(Box::new(FlashError::RoutineCallFailed {
                    name: "init",
                    error_code: result,
                })));
            }
        }

        Ok(())
    }

    /// Runs the `UnInit` routine to leave the target in a safe state.
    ///
    /// This is attempted on every teardown, also after a failed operation.
    fn uninit(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Running uninit routine.");
        let algo = &self.flasher.flash_algorithm;

        if let Some(pc_uninit) = algo.pc_uninit {
            let result = self
                .call_function_and_wait(
                    &Registers {
                        pc: into_reg(pc_uninit)?,
                        r0: Some(O::operation()),
                        r1: None,
                        r2: None,
                        r3: None,
                    },
                    false,
                    "uninit",
                    INIT_TIMEOUT,
                )
                .map_err(|error| FlashError::Uninit(Box::new(error)))?;

            if result != 0 {
                return Err(FlashError::Uninit(Box::new(
                    FlashError::RoutineCallFailed {
                        name: "uninit",
                        error_code: result,
                    },
                )));
            }
        }

        self.flasher.state = FlasherState::Uninitialized;

        Ok(())
    }

    fn call_function_and_wait(
        &mut self,
        registers: &Registers,
        init: bool,
        name: &'static str,
        timeout: Duration,
    ) -> Result<u32, FlashError> {
        self.call_function(registers, init)?;
        self.wait_for_completion(name, timeout)
    }

    fn call_function(&mut self, registers: &Registers, init: bool) -> Result<(), FlashError> {
        tracing::debug!("Calling routine {:?}, init={}", registers, init);

        let algo = &self.flasher.flash_algorithm;
        let core = &mut *self.flasher.core;

        // The return address points at the breakpoint stub the algorithm
        // code was staged behind. For Thumb cores the lowest bit has to be
        // set to stay in Thumb mode.
        let return_address = if core.instruction_set() == InstructionSet::Thumb2 {
            into_reg(algo.load_address + 1)?
        } else {
            into_reg(algo.load_address)?
        };

        let registers = [
            (CoreRegister::Pc, Some(registers.pc)),
            (CoreRegister::R0, registers.r0),
            (CoreRegister::R1, registers.r1),
            (CoreRegister::R2, registers.r2),
            (CoreRegister::R3, registers.r3),
            (
                CoreRegister::Sb,
                init.then_some(into_reg(algo.static_base)?),
            ),
            (
                CoreRegister::Sp,
                init.then_some(into_reg(algo.begin_stack)?),
            ),
            (CoreRegister::Lr, Some(return_address)),
        ];

        for (register, value) in registers {
            if let Some(value) = value {
                core.write_core_reg(register, value)
                    .map_err(FlashError::Core)?;
            }
        }

        // Resume target operation.
        core.run().map_err(FlashError::Core)
    }

    /// Polls the core until the routine returned onto its breakpoint, and
    /// reads the result register.
    ///
    /// The timeout is re-armed for every call; exceeding it surfaces as
    /// [`FlashError::FlashTimeout`] and is fatal for the running operation.
    fn wait_for_completion(
        &mut self,
        name: &'static str,
        timeout: Duration,
    ) -> Result<u32, FlashError> {
        tracing::debug!("Waiting for routine call completion.");
        let core = &mut *self.flasher.core;

        let start = Instant::now();
        loop {
            match core.status().map_err(FlashError::Core)? {
                CoreStatus::Halted => break,
                CoreStatus::LockedUp => {
                    return Err(FlashError::UnexpectedCoreStatus {
                        status: CoreStatus::LockedUp,
                    });
                }
                CoreStatus::Running => {}
            }

            if start.elapsed() >= timeout {
                return Err(FlashError::FlashTimeout { name, timeout });
            }

            std::thread::sleep(Duration::from_millis(1));
        }

        core.read_core_reg(CoreRegister::R0)
            .map_err(FlashError::Core)
    }
}

impl<C: CoreInterface> ActiveFlasher<'_, '_, C, Erase> {
    pub(super) fn erase_all(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Erasing entire chip.");
        let algo = &self.flasher.flash_algorithm;

        let Some(pc_erase_all) = algo.pc_erase_all else {
            return Err(FlashError::ChipEraseNotSupported);
        };

        let result = self
            .call_function_and_wait(
                &Registers {
                    pc: into_reg(pc_erase_all)?,
                    r0: None,
                    r1: None,
                    r2: None,
                    r3: None,
                },
                false,
                "erase_all",
                ERASE_ALL_TIMEOUT,
            )
            .map_err(|error| FlashError::ChipEraseFailed {
                source: Box::new(error),
            })?;

        if result != 0 {
            Err(FlashError::ChipEraseFailed {
                source: Box::new(FlashError::RoutineCallFailed {
                    name: "erase_all",
                    error_code: result,
                }),
            })
        } else {
            Ok(())
        }
    }

    pub(super) fn erase_sector(&mut self, address: u64) -> Result<(), FlashError> {
        tracing::info!("Erasing sector at address {:#010x}", address);
        let t1 = Instant::now();

        let timeout = Duration::from_millis(self.timeout_budget(Routine::EraseSector) as u64);
        let result = self.call_function_and_wait(
            &Registers {
                pc: into_reg(self.flasher.flash_algorithm.pc_erase_sector)?,
                r0: Some(into_reg(address)?),
                r1: None,
                r2: None,
                r3: None,
            },
            false,
            "erase_sector",
            timeout,
        )?;

        tracing::info!(
            "Done erasing sector. Result is {}. This took {:?}",
            result,
            t1.elapsed()
        );

        if result != 0 {
            Err(FlashError::RoutineCallFailed {
                name: "erase_sector",
                error_code: result,
            })
        } else {
            Ok(())
        }
    }
}

impl<C: CoreInterface> ActiveFlasher<'_, '_, C, Program> {
    pub(super) fn program_page(&mut self, address: u64, bytes: &[u8]) -> Result<(), FlashError> {
        let t1 = Instant::now();

        tracing::info!(
            "Programming page at address {:#010x} with size {}",
            address,
            bytes.len()
        );

        let begin_data = self.flasher.flash_algorithm.begin_data();

        // Transfer the page to its RAM buffer.
        self.flasher
            .core
            .write_8(begin_data, bytes)
            .map_err(FlashError::Core)?;

        let timeout = Duration::from_millis(self.timeout_budget(Routine::ProgramPage) as u64);
        let result = self
            .call_function_and_wait(
                &Registers {
                    pc: into_reg(self.flasher.flash_algorithm.pc_program_page)?,
                    r0: Some(into_reg(address)?),
                    r1: Some(bytes.len() as u32),
                    r2: Some(into_reg(begin_data)?),
                    r3: None,
                },
                false,
                "program_page",
                timeout,
            )
            .map_err(|error| FlashError::PageWrite {
                page_address: address,
                source: Box::new(error),
            })?;

        tracing::info!("Programming took: {:?}", t1.elapsed());

        if result != 0 {
            Err(FlashError::PageWrite {
                page_address: address,
                source: Box::new(FlashError::RoutineCallFailed {
                    name: "program_page",
                    error_code: result,
                }),
            })
        } else {
            Ok(())
        }
    }

    /// Downloads page data into one of the two page buffers without waiting
    /// for a running flash copy to finish.
    pub(super) fn load_page_buffer(
        &mut self,
        bytes: &[u8],
        buffer_number: usize,
    ) -> Result<(), FlashError> {
        let algo = &self.flasher.flash_algorithm;

        // The buffer number must be valid, otherwise there is a bug somewhere
        // in the flashing code.
        assert!(
            buffer_number < algo.page_buffers.len(),
            "Trying to use non-existing buffer ({}/{}) for flashing. This is a bug, please report it.",
            buffer_number,
            algo.page_buffers.len()
        );

        let buffer_address = algo.page_buffers[buffer_number];
        self.flasher
            .core
            .write_8(buffer_address, bytes)
            .map_err(FlashError::Core)
    }

    /// Starts the flash copy of one page buffer without waiting for it.
    pub(super) fn start_program_page_with_buffer(
        &mut self,
        address: u64,
        buffer_number: usize,
    ) -> Result<(), FlashError> {
        let algo = &self.flasher.flash_algorithm;

        assert!(
            buffer_number < algo.page_buffers.len(),
            "Trying to use non-existing buffer ({}/{}) for flashing. This is a bug, please report it.",
            buffer_number,
            algo.page_buffers.len()
        );

        self.call_function(
            &Registers {
                pc: into_reg(self.flasher.flash_algorithm.pc_program_page)?,
                r0: Some(into_reg(address)?),
                r1: Some(self.flasher.flash_algorithm.flash_properties.page_size),
                r2: Some(into_reg(self.flasher.flash_algorithm.page_buffers[buffer_number])?),
                r3: None,
            },
            false,
        )
        .map_err(|error| FlashError::PageWrite {
            page_address: address,
            source: Box::new(error),
        })
    }
}
