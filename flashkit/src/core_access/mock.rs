//! A mocked core which can be used for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::time::Duration;

use flashkit_target::InstructionSet;

use super::{CoreError, CoreInterface, CoreRegister, CoreStatus};
use crate::flashing::FlashAlgorithm;

/// One recorded routine invocation on the mocked core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutineCall {
    /// The program counter the core was resumed at.
    pub pc: u32,
    /// First argument register at the time of the call.
    pub r0: u32,
    /// Second argument register at the time of the call.
    pub r1: u32,
    /// Third argument register at the time of the call.
    pub r2: u32,
}

/// A core which simulates flash routine execution against an in-memory
/// target.
///
/// The mock keeps a sparse byte map as target memory. When an assembled
/// [`FlashAlgorithm`] is installed and the core is resumed on one of its
/// entry points, the corresponding effect is applied: `EraseSector` and
/// `EraseAll` fill flash with the erased byte value, and `ProgramPage`
/// AND-combines the page buffer into flash, like NOR flash which can only
/// clear bits. A page programmed without a prior erase therefore produces
/// visibly wrong contents.
pub struct MockCore {
    memory: BTreeMap<u64, u8>,
    registers: BTreeMap<CoreRegister, u32>,
    status: CoreStatus,
    algorithm: Option<FlashAlgorithm>,
    calls: Vec<RoutineCall>,
    hung_routines: BTreeSet<u64>,
    routine_results: BTreeMap<u64, u32>,
    instruction_set: InstructionSet,
}

impl MockCore {
    /// Creates a halted core with empty memory.
    pub fn new() -> Self {
        Self {
            memory: BTreeMap::new(),
            registers: BTreeMap::new(),
            status: CoreStatus::Halted,
            algorithm: None,
            calls: Vec::new(),
            hung_routines: BTreeSet::new(),
            routine_results: BTreeMap::new(),
            instruction_set: InstructionSet::Thumb2,
        }
    }

    /// Makes the core simulate the entry points of the given assembled
    /// algorithm when it is resumed on one of them.
    pub fn install_algorithm(&mut self, algorithm: &FlashAlgorithm) {
        self.algorithm = Some(algorithm.clone());
    }

    /// Makes the routine at `pc` never halt, so callers run into their
    /// timeout.
    pub fn hang_routine(&mut self, pc: u64) {
        self.hung_routines.insert(pc);
    }

    /// Makes the routine at `pc` return the given result code instead of 0.
    pub fn set_routine_result(&mut self, pc: u64, code: u32) {
        self.routine_results.insert(pc, code);
    }

    /// All routine invocations recorded so far, oldest first.
    pub fn calls(&self) -> &[RoutineCall] {
        &self.calls
    }

    /// The number of recorded invocations of the routine at `pc`.
    pub fn calls_to(&self, pc: u64) -> usize {
        self.calls.iter().filter(|call| call.pc as u64 == pc).count()
    }

    /// Returns a copy of the memory contents in `range`.
    ///
    /// Bytes which were never written read as zero.
    pub fn memory_contents(&self, range: Range<u64>) -> Vec<u8> {
        range
            .map(|address| *self.memory.get(&address).unwrap_or(&0))
            .collect()
    }

    fn register(&self, register: CoreRegister) -> u32 {
        *self.registers.get(&register).unwrap_or(&0)
    }

    fn fill(&mut self, range: Range<u64>, value: u8) {
        for address in range {
            self.memory.insert(address, value);
        }
    }

    /// Applies the effect of the routine the core was resumed on.
    fn simulate_routine(&mut self, pc: u64, call: RoutineCall) {
        let Some(algorithm) = self.algorithm.clone() else {
            return;
        };
        let erased = algorithm.flash_properties.erased_byte_value;

        if pc == algorithm.pc_erase_sector {
            if let Some(sector) = algorithm.sector_info(call.r0 as u64) {
                self.fill(sector.address_range(), erased);
            }
        } else if Some(pc) == algorithm.pc_erase_all {
            self.fill(algorithm.flash_properties.address_range.clone(), erased);
        } else if pc == algorithm.pc_program_page {
            // NOR semantics: programming can only clear bits.
            for offset in 0..call.r1 as u64 {
                let source = *self.memory.get(&(call.r2 as u64 + offset)).unwrap_or(&0);
                let destination = call.r0 as u64 + offset;
                let old = *self.memory.get(&destination).unwrap_or(&0);
                self.memory.insert(destination, old & source);
            }
        }
    }
}

impl Default for MockCore {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreInterface for MockCore {
    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), CoreError> {
        for (offset, byte) in data.iter_mut().enumerate() {
            *byte = *self.memory.get(&(address + offset as u64)).unwrap_or(&0);
        }
        Ok(())
    }

    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), CoreError> {
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(address + offset as u64, *byte);
        }
        Ok(())
    }

    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), CoreError> {
        for (index, word) in data.iter_mut().enumerate() {
            let mut bytes = [0; 4];
            self.read_8(address + index as u64 * 4, &mut bytes)?;
            *word = u32::from_le_bytes(bytes);
        }
        Ok(())
    }

    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), CoreError> {
        for (index, word) in data.iter().enumerate() {
            self.write_8(address + index as u64 * 4, &word.to_le_bytes())?;
        }
        Ok(())
    }

    fn read_core_reg(&mut self, register: CoreRegister) -> Result<u32, CoreError> {
        Ok(self.register(register))
    }

    fn write_core_reg(&mut self, register: CoreRegister, value: u32) -> Result<(), CoreError> {
        self.registers.insert(register, value);
        Ok(())
    }

    fn halt(&mut self, _timeout: Duration) -> Result<(), CoreError> {
        self.status = CoreStatus::Halted;
        Ok(())
    }

    fn reset_and_halt(&mut self, _timeout: Duration) -> Result<(), CoreError> {
        self.status = CoreStatus::Halted;
        Ok(())
    }

    fn run(&mut self) -> Result<(), CoreError> {
        let call = RoutineCall {
            pc: self.register(CoreRegister::Pc),
            r0: self.register(CoreRegister::R0),
            r1: self.register(CoreRegister::R1),
            r2: self.register(CoreRegister::R2),
        };
        self.calls.push(call);

        let pc = call.pc as u64;
        if self.hung_routines.contains(&pc) {
            self.status = CoreStatus::Running;
            return Ok(());
        }

        let result = self.routine_results.get(&pc).copied().unwrap_or(0);
        if result == 0 {
            self.simulate_routine(pc, call);
        }

        self.registers.insert(CoreRegister::R0, result);
        self.status = CoreStatus::Halted;
        Ok(())
    }

    fn status(&mut self) -> Result<CoreStatus, CoreError> {
        Ok(self.status)
    }

    fn instruction_set(&self) -> InstructionSet {
        self.instruction_set
    }
}
