//! In-memory target.
//!
//! A sparse set of memory regions plus a symbol table. Used for RAM dumps
//! taken from a halted board and as the fake target in tests.

use super::TargetCapability;
use crate::error::{DrtmError, DrtmResult};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
struct Region {
    data: Vec<u8>,
    writable: bool,
}

/// Target backed by host memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    regions: BTreeMap<u64, Region>,
    symbols: HashMap<String, u64>,
    live_registers: Option<BTreeMap<u16, Vec<u8>>>,
    output: Vec<String>,
    allocation_budget: Option<usize>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a writable region at `base`. Overlapping an existing region is not checked.
    pub fn map(&mut self, base: u64, data: Vec<u8>) {
        self.regions.insert(base, Region { data, writable: true });
    }

    /// Map a region that rejects writes (flash).
    pub fn map_read_only(&mut self, base: u64, data: Vec<u8>) {
        self.regions.insert(base, Region { data, writable: false });
    }

    pub fn add_symbol(&mut self, name: impl Into<String>, address: u64) {
        self.symbols.insert(name.into(), address);
    }

    /// Enable the live-register path, as a probe attached to a halted core would.
    pub fn enable_live_registers(&mut self) {
        self.live_registers.get_or_insert_with(BTreeMap::new);
    }

    /// Set a live CPU register. Enables the live-register path.
    pub fn set_live_register(&mut self, index: u16, value: Vec<u8>) {
        self.live_registers.get_or_insert_with(BTreeMap::new).insert(index, value);
    }

    pub fn live_register(&self, index: u16) -> Option<&[u8]> {
        self.live_registers.as_ref()?.get(&index).map(Vec::as_slice)
    }

    /// Limit the total host memory handed out through `allocate`.
    pub fn set_allocation_budget(&mut self, bytes: usize) {
        self.allocation_budget = Some(bytes);
    }

    /// Lines emitted through the capability's `log`.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Raw bytes of the region mapped at `base`.
    pub fn region(&self, base: u64) -> Option<&[u8]> {
        self.regions.get(&base).map(|r| r.data.as_slice())
    }

    fn region_at(&self, address: u64) -> Option<(u64, &Region)> {
        let (&base, region) = self.regions.range(..=address).next_back()?;
        let end = base + region.data.len() as u64;
        (address < end).then_some((base, region))
    }
}

impl TargetCapability for MemoryImage {
    fn read(&mut self, address: u64, buf: &mut [u8]) -> DrtmResult<usize> {
        let (base, region) =
            self.region_at(address).ok_or(DrtmError::TargetUnreachable { address })?;
        let start = usize::try_from(address - base)
            .map_err(|_| DrtmError::TargetUnreachable { address })?;
        let count = buf.len().min(region.data.len() - start);
        buf[..count].copy_from_slice(&region.data[start..start + count]);
        Ok(count)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> DrtmResult<()> {
        let (base, _) = self.region_at(address).ok_or(DrtmError::TargetWriteFailed { address })?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or(DrtmError::TargetWriteFailed { address })?;
        let start = usize::try_from(address - base)
            .map_err(|_| DrtmError::TargetWriteFailed { address })?;
        if !region.writable || start + data.len() > region.data.len() {
            return Err(DrtmError::TargetWriteFailed { address });
        }
        region.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn resolve_symbol(&mut self, name: &str) -> DrtmResult<u64> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| DrtmError::SymbolNotFound(name.to_string()))
    }

    fn allocate(&mut self, size: usize) -> DrtmResult<Vec<u8>> {
        let remaining = match self.allocation_budget {
            Some(budget) => Some(budget.checked_sub(size).ok_or_else(|| {
                DrtmError::OutOfMemory(format!("{size} bytes over host budget"))
            })?),
            None => None,
        };
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|e| DrtmError::OutOfMemory(format!("{size} bytes: {e}")))?;
        buf.resize(size, 0);
        if remaining.is_some() {
            self.allocation_budget = remaining;
        }
        Ok(buf)
    }

    fn log(&mut self, text: &str) {
        log::info!("{}", text.trim_end());
        self.output.push(text.to_string());
    }

    fn read_register(&mut self, index: u16) -> DrtmResult<Option<Vec<u8>>> {
        match &self.live_registers {
            None => Ok(None),
            Some(regs) => regs
                .get(&index)
                .cloned()
                .map(Some)
                .ok_or(DrtmError::RegisterUnavailable(index)),
        }
    }

    fn write_register(&mut self, index: u16, data: &[u8]) -> DrtmResult<bool> {
        match self.live_registers.as_mut() {
            None => Ok(false),
            Some(regs) => {
                regs.insert(index, data.to_vec());
                Ok(true)
            }
        }
    }
}
