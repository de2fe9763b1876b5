//! Hardware target over probe-rs.
//!
//! Handles probe selection, attach and the halted core's memory and
//! registers. Symbols come from the firmware ELF since a probe knows nothing
//! about the image running on the chip.

use super::TargetCapability;
use crate::error::{DrtmError, DrtmResult};
use crate::registers::Architecture;
use crate::symbols::SymbolManager;
use anyhow::{Context, Result};
use probe_rs::probe::list::Lister;
use probe_rs::{CoreType, MemoryInterface, Permissions, Session};
use std::time::Duration;

/// Highest register index served live: r0-r12, sp, lr, pc, xpsr.
const LIVE_REGISTER_MAX: u16 = 16;

pub struct ProbeTarget {
    session: Session,
    core_index: usize,
    symbols: SymbolManager,
}

impl ProbeTarget {
    /// Open probe `probe_index`, attach to `chip` and halt core 0.
    pub fn attach(chip: &str, probe_index: usize, symbols: SymbolManager) -> Result<Self> {
        let lister = Lister::new();
        let probes = lister.list_all();
        let probe_info = probes.get(probe_index).context("Probe index out of range")?;
        let probe = probe_info.open().context("Failed to open probe")?;
        let mut session = probe
            .attach(chip, Permissions::default())
            .with_context(|| format!("Failed to attach to target {chip}"))?;

        {
            let mut core = session.core(0).context("Failed to attach core")?;
            core.halt(Duration::from_millis(100)).context("Failed to halt core")?;
        }
        log::info!("Attached to {chip} via probe {probe_index}, core halted");

        Ok(Self { session, core_index: 0, symbols })
    }

    /// Architecture of the attached core, if thread awareness supports it.
    pub fn architecture(&mut self) -> Result<Option<Architecture>> {
        let core = self.session.core(self.core_index).context("Failed to attach core")?;
        Ok(match core.core_type() {
            CoreType::Armv6m => Some(Architecture::CortexM0),
            CoreType::Armv7m => Some(Architecture::CortexM3),
            CoreType::Armv7em => Some(Architecture::CortexM4),
            _ => None,
        })
    }

    pub fn symbols(&self) -> &SymbolManager {
        &self.symbols
    }

    fn read_bytewise(&mut self, address: u64, buf: &mut [u8]) -> DrtmResult<usize> {
        let mut core = self
            .session
            .core(self.core_index)
            .map_err(|_| DrtmError::TargetUnreachable { address })?;
        let mut count = 0;
        for (i, byte) in buf.iter_mut().enumerate() {
            let mut one = [0u8; 1];
            if core.read_8(address + i as u64, &mut one).is_err() {
                break;
            }
            *byte = one[0];
            count += 1;
        }
        if count == 0 {
            return Err(DrtmError::TargetUnreachable { address });
        }
        Ok(count)
    }
}

impl TargetCapability for ProbeTarget {
    fn read(&mut self, address: u64, buf: &mut [u8]) -> DrtmResult<usize> {
        let result = {
            let mut core = self
                .session
                .core(self.core_index)
                .map_err(|_| DrtmError::TargetUnreachable { address })?;
            core.read_8(address, buf)
        };
        match result {
            Ok(()) => Ok(buf.len()),
            // The block may straddle the end of RAM; salvage what is readable.
            Err(e) if buf.len() > 1 => {
                log::debug!("Block read at 0x{address:08X} failed ({e}), retrying bytewise");
                self.read_bytewise(address, buf)
            }
            Err(e) => {
                log::debug!("Read at 0x{address:08X} failed: {e}");
                Err(DrtmError::TargetUnreachable { address })
            }
        }
    }

    fn write(&mut self, address: u64, data: &[u8]) -> DrtmResult<()> {
        let mut core = self
            .session
            .core(self.core_index)
            .map_err(|_| DrtmError::TargetWriteFailed { address })?;
        core.write_8(address, data).map_err(|e| {
            log::debug!("Write at 0x{address:08X} failed: {e}");
            DrtmError::TargetWriteFailed { address }
        })
    }

    fn resolve_symbol(&mut self, name: &str) -> DrtmResult<u64> {
        self.symbols
            .lookup_symbol(name)
            .ok_or_else(|| DrtmError::SymbolNotFound(name.to_string()))
    }

    fn log(&mut self, text: &str) {
        log::info!("{}", text.trim_end());
    }

    fn read_register(&mut self, index: u16) -> DrtmResult<Option<Vec<u8>>> {
        if index > LIVE_REGISTER_MAX {
            return Ok(None);
        }
        let mut core = self
            .session
            .core(self.core_index)
            .map_err(|_| DrtmError::RegisterUnavailable(index))?;
        let value: u64 = core.read_core_reg(index).map_err(|e| {
            log::debug!("Core register {index} unreadable: {e}");
            DrtmError::RegisterUnavailable(index)
        })?;
        let value = u32::try_from(value).map_err(|_| DrtmError::RegisterUnavailable(index))?;
        Ok(Some(value.to_le_bytes().to_vec()))
    }

    fn write_register(&mut self, index: u16, data: &[u8]) -> DrtmResult<bool> {
        if index > LIVE_REGISTER_MAX {
            return Ok(false);
        }
        let value = u32::try_from(crate::registers::bytes_value(data))
            .map_err(|_| DrtmError::MalformedRegisterValue(hex::encode(data)))?;
        let mut core = self
            .session
            .core(self.core_index)
            .map_err(|_| DrtmError::RegisterUnavailable(index))?;
        core.write_core_reg(index, value).map_err(|e| {
            log::warn!("Failed to write core register {index}: {e}");
            DrtmError::RegisterUnavailable(index)
        })?;
        Ok(true)
    }
}
