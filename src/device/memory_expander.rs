//! Type-3 Memory Expander.
//!
//! Serves host CXL.mem reads and writes straight from its backing store.
//! There is no bias tracking: the host always owns the memory.

use super::{DeviceCore, DeviceKind, DeviceModel};
use crate::common::DeviceError;

pub struct MemoryExpander {
    core: DeviceCore,
}

impl MemoryExpander {
    pub fn new(core: DeviceCore) -> Self {
        log::info!(
            "[dev {}] memory expander, {} KiB at {}",
            core.name(),
            core.memory().capacity() / 1024,
            core.bdf()
        );
        Self { core }
    }
}

impl DeviceModel for MemoryExpander {
    fn kind(&self) -> DeviceKind {
        DeviceKind::MemoryExpander
    }

    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn handle_mem_read(&mut self, dpa: u64, length: usize) -> Result<Vec<u8>, DeviceError> {
        self.core.memory().read(dpa, length)
    }

    fn handle_mem_write(&mut self, dpa: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.core.memory_mut().write(dpa, data)
    }
}
