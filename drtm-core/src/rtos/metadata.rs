//! DRTM layout metadata.
//!
//! DRTM-aware kernels export a small descriptor (`os_rtos_drtm_data`) that
//! tells the debugger where the thread list lives and how a thread control
//! block is laid out. Reading the layout from the target instead of
//! hardcoding it is what allows one engine to follow kernel versions and
//! build configurations.
//!
//! Descriptor encoding (little-endian):
//!
//! ```text
//! 0x00  magic "DRTM"          0x14  u16 struct size
//! 0x04  u8 major, minor,      0x16  u16 next-link offset
//!       patch, flags          0x18  u16 state offset
//! 0x08  u32 &scheduler_started 0x1A u16 stack-pointer offset
//! 0x0C  u32 &thread_list_head 0x1C  u16 name offset
//! 0x10  u32 &current_thread   0x1E  u16 id offset       (0xFFFF = absent)
//!                             0x20  u16 priority offset (0xFFFF = absent)
//!                             0x22  u8 state width, u8 register count
//!                             0x24  u16 inline name capacity (0 = pointer)
//! 0x28  register entries: u16 index, u8 width, u8 source, u32 offset
//! ```

use crate::error::{DrtmError, DrtmResult};
use crate::registers::{RegisterDesc, RegisterSource};
use crate::target::{TargetCapability, TargetExt};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

pub const DRTM_MAGIC: [u8; 4] = *b"DRTM";
pub const LAYOUT_VERSION_MAJOR: u8 = 1;
pub const HEADER_LEN: usize = 0x28;
pub const REGISTER_ENTRY_LEN: usize = 8;
pub const MAX_REGISTERS: usize = 64;

/// The next-link points at the next entry's link field rather than its base.
pub const FLAG_INTRUSIVE_LINK: u8 = 0x01;

const ABSENT: u16 = 0xFFFF;
const POINTER_WIDTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayoutVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for LayoutVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How the thread name is stored in the backing structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NameField {
    /// A character array of `capacity` bytes.
    Inline { offset: u16, capacity: u16 },
    /// A pointer to a NUL-terminated string.
    Pointer { offset: u16 },
}

/// Typed view of the descriptor. Read-only once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutMetadata {
    pub version: LayoutVersion,
    pub intrusive_link: bool,
    /// Byte that is non-zero once the scheduler runs.
    pub scheduler_started_address: Option<u64>,
    /// Variable holding the first list entry.
    pub thread_list_head_address: u64,
    /// Variable holding the running thread's backing address.
    pub current_thread_address: u64,
    pub struct_size: u16,
    pub next_offset: u16,
    pub state_offset: u16,
    pub state_width: u8,
    pub stack_pointer_offset: u16,
    pub name: NameField,
    pub id_offset: Option<u16>,
    pub priority_offset: Option<u16>,
    /// Sorted by register index.
    pub registers: Vec<RegisterDesc>,
}

impl LayoutMetadata {
    /// Read, decode and validate the descriptor stored at `address`.
    pub fn load<T>(target: &mut T, address: u64, max_struct_size: usize) -> DrtmResult<Self>
    where
        T: TargetCapability + ?Sized,
    {
        let mut bytes = vec![0u8; HEADER_LEN];
        target.read_exact(address, &mut bytes)?;
        let count = bytes[0x23] as usize;
        if count > MAX_REGISTERS {
            return Err(invalid(format!("{count} registers (at most {MAX_REGISTERS})")));
        }
        bytes.resize(HEADER_LEN + count * REGISTER_ENTRY_LEN, 0);
        target.read_exact(address + HEADER_LEN as u64, &mut bytes[HEADER_LEN..])?;

        let layout = Self::decode(&bytes)?;
        layout.validate(max_struct_size)?;
        log::info!(
            "Loaded DRTM layout v{} from 0x{address:08X}: struct {} bytes, {} registers",
            layout.version,
            layout.struct_size,
            layout.registers.len()
        );
        Ok(layout)
    }

    /// Decode the descriptor bytes. Does not check plausibility, see [`Self::validate`].
    pub fn decode(bytes: &[u8]) -> DrtmResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid(format!("descriptor truncated to {} bytes", bytes.len())));
        }
        if bytes[0..4] != DRTM_MAGIC {
            return Err(invalid(format!("bad magic {:02X?}", &bytes[0..4])));
        }

        let u16_at = |o: usize| u16::from_le_bytes([bytes[o], bytes[o + 1]]);
        let u32_at =
            |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        let optional = |o: usize| Some(u16_at(o)).filter(|&v| v != ABSENT);

        let count = bytes[0x23] as usize;
        let needed = HEADER_LEN + count * REGISTER_ENTRY_LEN;
        if bytes.len() < needed {
            return Err(invalid(format!("descriptor needs {needed} bytes, got {}", bytes.len())));
        }

        let mut registers = Vec::with_capacity(count);
        for entry in bytes[HEADER_LEN..needed].chunks_exact(REGISTER_ENTRY_LEN) {
            let index = u16::from_le_bytes([entry[0], entry[1]]);
            let offset = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
            let source = RegisterSource::from_code(entry[3], offset).ok_or_else(|| {
                invalid(format!("register {index} has unknown source {}", entry[3]))
            })?;
            registers.push(RegisterDesc::new(index, entry[2], source));
        }
        registers.sort_by_key(|r| r.index);

        let name_offset = u16_at(0x1C);
        let capacity = u16_at(0x24);
        let name = if capacity == 0 {
            NameField::Pointer { offset: name_offset }
        } else {
            NameField::Inline { offset: name_offset, capacity }
        };

        Ok(Self {
            version: LayoutVersion { major: bytes[4], minor: bytes[5], patch: bytes[6] },
            intrusive_link: bytes[7] & FLAG_INTRUSIVE_LINK != 0,
            scheduler_started_address: Some(u64::from(u32_at(0x08))).filter(|&a| a != 0),
            thread_list_head_address: u64::from(u32_at(0x0C)),
            current_thread_address: u64::from(u32_at(0x10)),
            struct_size: u16_at(0x14),
            next_offset: u16_at(0x16),
            state_offset: u16_at(0x18),
            stack_pointer_offset: u16_at(0x1A),
            id_offset: optional(0x1E),
            priority_offset: optional(0x20),
            state_width: bytes[0x22],
            name,
            registers,
        })
    }

    /// Reject layouts the engine cannot trust.
    pub fn validate(&self, max_struct_size: usize) -> DrtmResult<()> {
        if self.version.major != LAYOUT_VERSION_MAJOR {
            return Err(invalid(format!("unsupported descriptor version {}", self.version)));
        }
        if self.thread_list_head_address == 0 {
            return Err(invalid("thread list head address is zero".into()));
        }
        if self.current_thread_address == 0 {
            return Err(invalid("current thread address is zero".into()));
        }
        let size = self.struct_size as usize;
        if size == 0 || size > max_struct_size {
            return Err(invalid(format!("struct size {size} outside 1..={max_struct_size}")));
        }

        self.check_field("next link", self.next_offset, POINTER_WIDTH)?;
        self.check_field("stack pointer", self.stack_pointer_offset, POINTER_WIDTH)?;
        if !matches!(self.state_width, 1 | 2 | 4) {
            return Err(invalid(format!("state width {}", self.state_width)));
        }
        self.check_field("state", self.state_offset, self.state_width as usize)?;
        match self.name {
            NameField::Inline { offset, capacity } => {
                self.check_field("name", offset, capacity as usize)?;
            }
            NameField::Pointer { offset } => self.check_field("name", offset, POINTER_WIDTH)?,
        }
        if let Some(offset) = self.id_offset {
            self.check_field("id", offset, 4)?;
        }
        if let Some(offset) = self.priority_offset {
            self.check_field("priority", offset, 4)?;
        }

        if self.registers.is_empty() || self.registers.len() > MAX_REGISTERS {
            return Err(invalid(format!("{} registers described", self.registers.len())));
        }
        let mut seen = HashSet::new();
        for reg in &self.registers {
            if !seen.insert(reg.index) {
                return Err(invalid(format!("register {} described twice", reg.index)));
            }
            if !matches!(reg.width, 1 | 2 | 4 | 8 | 16) {
                return Err(invalid(format!("register {} width {}", reg.index, reg.width)));
            }
            let end = reg.source.offset() as usize + reg.width as usize;
            match reg.source {
                RegisterSource::Block(_) if end > size => {
                    return Err(invalid(format!("register {} outside the struct", reg.index)));
                }
                RegisterSource::Frame(_) if end > max_struct_size => {
                    return Err(invalid(format!("register {} frame offset too large", reg.index)));
                }
                RegisterSource::StackPointer(_) if reg.width > 8 => {
                    return Err(invalid(format!("stack pointer register {} too wide", reg.index)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_field(&self, what: &str, offset: u16, width: usize) -> DrtmResult<()> {
        if width == 0 || offset as usize + width > self.struct_size as usize {
            return Err(invalid(format!(
                "{what} field at offset {offset} (+{width}) outside {}-byte struct",
                self.struct_size
            )));
        }
        Ok(())
    }

    /// Encode the descriptor as it is laid out in target memory.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.registers.len() * REGISTER_ENTRY_LEN);
        out.extend_from_slice(&DRTM_MAGIC);
        out.extend_from_slice(&[
            self.version.major,
            self.version.minor,
            self.version.patch,
            if self.intrusive_link { FLAG_INTRUSIVE_LINK } else { 0 },
        ]);
        for address in [
            self.scheduler_started_address.unwrap_or(0),
            self.thread_list_head_address,
            self.current_thread_address,
        ] {
            out.extend_from_slice(&(address as u32).to_le_bytes());
        }
        let (name_offset, capacity) = match self.name {
            NameField::Inline { offset, capacity } => (offset, capacity),
            NameField::Pointer { offset } => (offset, 0),
        };
        for half in [
            self.struct_size,
            self.next_offset,
            self.state_offset,
            self.stack_pointer_offset,
            name_offset,
            self.id_offset.unwrap_or(ABSENT),
            self.priority_offset.unwrap_or(ABSENT),
        ] {
            out.extend_from_slice(&half.to_le_bytes());
        }
        out.push(self.state_width);
        out.push(self.registers.len() as u8);
        out.extend_from_slice(&capacity.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        for reg in &self.registers {
            out.extend_from_slice(&reg.index.to_le_bytes());
            out.push(reg.width);
            out.push(reg.source.code());
            out.extend_from_slice(&reg.source.offset().to_le_bytes());
        }
        out
    }

    pub fn register(&self, index: u16) -> Option<&RegisterDesc> {
        self.registers
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|pos| &self.registers[pos])
    }

    /// Length of a full register-file dump in text form.
    #[must_use]
    pub fn register_file_text_len(&self) -> usize {
        self.registers.iter().map(RegisterDesc::text_len).sum()
    }

    /// Turn a next-link value into the backing address it designates.
    pub fn entry_address(&self, link: u64) -> DrtmResult<Option<u64>> {
        if link == 0 {
            return Ok(None);
        }
        if !self.intrusive_link {
            return Ok(Some(link));
        }
        link.checked_sub(u64::from(self.next_offset)).map(Some).ok_or_else(|| {
            DrtmError::CorruptedThreadList(format!("link 0x{link:08X} below the link offset"))
        })
    }

    /// Decode the state code stored in a backing structure.
    pub(crate) fn state_code(&self, block: &[u8]) -> u32 {
        let start = self.state_offset as usize;
        let mut raw = [0u8; 4];
        let width = self.state_width as usize;
        raw[..width].copy_from_slice(&block[start..start + width]);
        u32::from_le_bytes(raw)
    }
}

/// Read a little-endian `u32` field out of a backing structure copy.
pub(crate) fn block_u32(block: &[u8], offset: u16) -> u32 {
    let o = offset as usize;
    u32::from_le_bytes([block[o], block[o + 1], block[o + 2], block[o + 3]])
}

fn invalid(reason: String) -> DrtmError {
    DrtmError::LayoutMetadataInvalid(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoKernel;
    use crate::target::MemoryImage;

    fn layout() -> LayoutMetadata {
        DemoKernel::new().layout().clone()
    }

    #[test]
    fn test_descriptor_survives_encoding() {
        let layout = layout();
        let decoded = LayoutMetadata::decode(&layout.to_bytes()).unwrap();
        assert_eq!(decoded, layout);
        decoded.validate(1024).unwrap();
    }

    #[test]
    fn test_load_from_target() {
        let layout = layout();
        let mut image = MemoryImage::new();
        image.map(0x2000_0000, layout.to_bytes());
        let loaded = LayoutMetadata::load(&mut image, 0x2000_0000, 1024).unwrap();
        assert_eq!(loaded.registers.len(), 17);
        assert_eq!(loaded.register(15).map(|r| r.width), Some(4));
        assert!(loaded.register(99).is_none());
        assert_eq!(loaded.register_file_text_len(), 17 * 8);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = layout().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(LayoutMetadata::decode(&bytes), Err(DrtmError::LayoutMetadataInvalid(_))));
    }

    #[test]
    fn test_truncated_descriptor() {
        let bytes = layout().to_bytes();
        assert!(LayoutMetadata::decode(&bytes[..HEADER_LEN - 1]).is_err());
        assert!(LayoutMetadata::decode(&bytes[..HEADER_LEN + 4]).is_err());
    }

    fn rejected(mutate: impl Fn(&mut LayoutMetadata)) -> bool {
        let mut bad = layout();
        mutate(&mut bad);
        matches!(bad.validate(1024), Err(DrtmError::LayoutMetadataInvalid(_)))
    }

    #[test]
    fn test_implausible_layouts_rejected() {
        assert!(rejected(|l| l.struct_size = 0));
        assert!(rejected(|l| l.struct_size = 4096));
        assert!(rejected(|l| l.thread_list_head_address = 0));
        assert!(rejected(|l| l.current_thread_address = 0));
        assert!(rejected(|l| l.next_offset = l.struct_size - 2));
        assert!(rejected(|l| l.state_width = 3));
        assert!(rejected(|l| l.version.major = 2));
        assert!(rejected(|l| l.registers.clear()));
        assert!(rejected(|l| l.registers[0].width = 3));
        assert!(rejected(|l| l.registers[0].source = RegisterSource::Block(0x3FE)));
        assert!(rejected(|l| {
            let first = l.registers[0];
            l.registers.push(first);
        }));
        assert!(!rejected(|_| {}));
    }

    #[test]
    fn test_unknown_register_source() {
        let mut bytes = layout().to_bytes();
        bytes[HEADER_LEN + 3] = 7;
        assert!(matches!(LayoutMetadata::decode(&bytes), Err(DrtmError::LayoutMetadataInvalid(_))));
    }

    #[test]
    fn test_intrusive_entry_address() {
        let mut layout = layout();
        assert_eq!(layout.entry_address(0).unwrap(), None);
        assert_eq!(layout.entry_address(0x2000_1000).unwrap(), Some(0x2000_1000));

        layout.intrusive_link = true;
        let link = 0x2000_1000 + u64::from(layout.next_offset);
        assert_eq!(layout.entry_address(link).unwrap(), Some(0x2000_1000));
        if layout.next_offset > 0 {
            assert!(layout.entry_address(u64::from(layout.next_offset) - 1).is_err());
        }
    }
}
