//! Register-file description and the canonical register text format.
//!
//! Register values travel as the raw target-endian bytes encoded in lower-case
//! hex, two digits per byte, which is what GDB expects in `g`/`p` replies.

use crate::error::{DrtmError, DrtmResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cores the engine accepts. Anything else leaves the plug-in disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    CortexM0,
    CortexM1,
    CortexM3,
    CortexM4,
    CortexM7,
}

impl Architecture {
    pub const ALL: [Self; 5] =
        [Self::CortexM0, Self::CortexM1, Self::CortexM3, Self::CortexM4, Self::CortexM7];

    /// Map a J-Link core identifier onto the allow-list.
    #[must_use]
    pub fn from_core_id(core: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|arch| arch.core_id() == core)
    }

    /// J-Link core identifier.
    #[must_use]
    pub const fn core_id(self) -> u32 {
        match self {
            Self::CortexM0 => 0x0600_00FF,
            Self::CortexM1 => 0x0100_00FF,
            Self::CortexM3 => 0x0300_00FF,
            Self::CortexM4 => 0x0E00_00FF,
            Self::CortexM7 => 0x0E01_00FF,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CortexM0 => "cortex-m0",
            Self::CortexM1 => "cortex-m1",
            Self::CortexM3 => "cortex-m3",
            Self::CortexM4 => "cortex-m4",
            Self::CortexM7 => "cortex-m7",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|arch| arch.name() == wanted)
            .ok_or_else(|| {
                format!("unsupported core '{s}' (expected one of cortex-m0/m1/m3/m4/m7)")
            })
    }
}

/// Where a register's value lives for a thread that is not executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "offset", rename_all = "snake_case")]
pub enum RegisterSource {
    /// Saved on the thread stack, relative to the saved stack pointer.
    Frame(u32),
    /// Stored inside the backing structure.
    Block(u32),
    /// Not stored: saved stack pointer plus the given adjustment.
    StackPointer(u32),
    /// Only available from the CPU while the thread runs.
    Live,
}

impl RegisterSource {
    pub(crate) const fn code(self) -> u8 {
        match self {
            Self::Frame(_) => 0,
            Self::Block(_) => 1,
            Self::StackPointer(_) => 2,
            Self::Live => 3,
        }
    }

    pub(crate) const fn offset(self) -> u32 {
        match self {
            Self::Frame(o) | Self::Block(o) | Self::StackPointer(o) => o,
            Self::Live => 0,
        }
    }

    pub(crate) fn from_code(code: u8, offset: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Frame(offset)),
            1 => Some(Self::Block(offset)),
            2 => Some(Self::StackPointer(offset)),
            3 => Some(Self::Live),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDesc {
    /// Position in the architecture's register numbering.
    pub index: u16,
    /// Width in bytes.
    pub width: u8,
    pub source: RegisterSource,
}

impl RegisterDesc {
    #[must_use]
    pub const fn new(index: u16, width: u8, source: RegisterSource) -> Self {
        Self { index, width, source }
    }

    /// Length of the register's text form.
    #[must_use]
    pub const fn text_len(&self) -> usize {
        self.width as usize * 2
    }
}

/// Encode raw register bytes as text.
#[must_use]
pub fn encode_value(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Text used in a register-file dump for a register that could not be read.
#[must_use]
pub fn unavailable(desc: &RegisterDesc) -> String {
    "x".repeat(desc.text_len())
}

/// Parse register text into exactly `desc.width` bytes.
pub fn decode_value(desc: &RegisterDesc, text: &str) -> DrtmResult<Vec<u8>> {
    let text = text.trim();
    if text.len() != desc.text_len() {
        return Err(DrtmError::MalformedRegisterValue(format!(
            "register {} needs {} hex digits, got {}",
            desc.index,
            desc.text_len(),
            text.len()
        )));
    }
    hex::decode(text).map_err(|e| DrtmError::MalformedRegisterValue(format!("{text}: {e}")))
}

/// Encode an integer in target byte order, truncated to `width` bytes.
#[must_use]
pub fn value_bytes(value: u64, width: u8) -> Vec<u8> {
    value.to_le_bytes().into_iter().take(width as usize).collect()
}

/// Decode target-order bytes (at most eight) into an integer.
#[must_use]
pub fn bytes_value(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let n = bytes.len().min(8);
    raw[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(raw)
}
