use super::metadata::{block_u32, LayoutMetadata, NameField};
use crate::error::{DrtmError, DrtmResult};
use crate::registers::{bytes_value, value_bytes, RegisterDesc, RegisterSource};
use crate::target::{TargetCapability, TargetExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Engine-assigned thread identifier. Zero is reserved for "no thread".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ThreadId(u32);

impl ThreadId {
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Suspended,
    Unknown(u32),
}

impl ThreadState {
    /// Map a descriptor state code.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Suspended,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Ready => 1,
            Self::Running => 2,
            Self::Blocked => 3,
            Self::Suspended => 4,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Running => f.write_str("running"),
            Self::Blocked => f.write_str("blocked"),
            Self::Suspended => f.write_str("suspended"),
            Self::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// Fields decoded from one backing structure during a list walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ThreadRecord {
    pub address: u64,
    pub state: ThreadState,
    pub stack_pointer: u64,
    pub name: Option<String>,
    pub rtos_id: Option<u32>,
    pub priority: Option<u32>,
}

impl ThreadRecord {
    /// Decode a backing structure copy. Never fails: a name that cannot be
    /// read is dropped and an unknown state code is kept as `Unknown`.
    pub fn decode<T>(
        target: &mut T,
        layout: &LayoutMetadata,
        address: u64,
        block: &[u8],
        name_buf: &mut [u8],
    ) -> Self
    where
        T: TargetCapability + ?Sized,
    {
        let state = ThreadState::from_code(layout.state_code(block));
        if let ThreadState::Unknown(code) = state {
            log::warn!("Thread 0x{address:08X} has unknown state code {code}");
        }

        let name = match layout.name {
            NameField::Inline { offset, capacity } => {
                let start = offset as usize;
                let len = (capacity as usize).min(name_buf.len());
                c_text(&block[start..start + len])
            }
            NameField::Pointer { offset } => {
                let pointer = u64::from(block_u32(block, offset));
                read_name(target, pointer, name_buf)
            }
        };

        Self {
            address,
            state,
            stack_pointer: u64::from(block_u32(block, layout.stack_pointer_offset)),
            name,
            rtos_id: layout.id_offset.map(|o| block_u32(block, o)),
            priority: layout.priority_offset.map(|o| block_u32(block, o)),
        }
    }

    pub fn fingerprint(&self) -> (Option<&str>, Option<u32>) {
        (self.name.as_deref(), self.rtos_id)
    }
}

fn read_name<T>(target: &mut T, pointer: u64, buf: &mut [u8]) -> Option<String>
where
    T: TargetCapability + ?Sized,
{
    if pointer == 0 {
        return None;
    }
    match target.read(pointer, buf) {
        Ok(count) => c_text(&buf[..count]),
        Err(e) => {
            log::warn!("Thread name at 0x{pointer:08X} unreadable: {e}");
            None
        }
    }
}

/// Text up to the first NUL, or the whole slice when the target did not terminate it.
fn c_text(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let text = String::from_utf8_lossy(&bytes[..end]).into_owned();
    (!text.is_empty()).then_some(text)
}

/// Cut `text` to at most `max` bytes without splitting a character.
pub(crate) fn truncate_text(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

/// One RTOS thread as seen in a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    id: ThreadId,
    address: u64,
    state: ThreadState,
    /// Written through together with `saved` when the stack pointer register is set.
    stack_pointer: u64,
    name: Option<String>,
    rtos_id: Option<u32>,
    priority: Option<u32>,
    /// Saved register values already fetched from the target.
    #[serde(skip)]
    saved: BTreeMap<u16, Vec<u8>>,
}

impl Thread {
    pub(crate) fn from_record(id: ThreadId, record: ThreadRecord) -> Self {
        Self {
            id,
            address: record.address,
            state: record.state,
            stack_pointer: record.stack_pointer,
            name: record.name,
            rtos_id: record.rtos_id,
            priority: record.priority,
            saved: BTreeMap::new(),
        }
    }

    pub const fn id(&self) -> ThreadId {
        self.id
    }

    /// Address of the backing structure in target memory.
    pub const fn address(&self) -> u64 {
        self.address
    }

    pub const fn state(&self) -> ThreadState {
        self.state
    }

    pub const fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Identifier stored by the kernel itself, if the layout has one.
    pub const fn rtos_id(&self) -> Option<u32> {
        self.rtos_id
    }

    pub const fn priority(&self) -> Option<u32> {
        self.priority
    }

    pub(crate) fn fingerprint(&self) -> (Option<&str>, Option<u32>) {
        (self.name.as_deref(), self.rtos_id)
    }

    /// One-line summary shown by the debugger next to the thread.
    pub fn describe(&self) -> String {
        let mut text = format!(
            "{} [{}] @0x{:08X} sp=0x{:08X}",
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.state,
            self.address,
            self.stack_pointer
        );
        if let Some(priority) = self.priority {
            text.push_str(&format!(" prio={priority}"));
        }
        if let Some(id) = self.rtos_id {
            text.push_str(&format!(" id={id}"));
        }
        text
    }

    /// Read one register, from the CPU when the thread runs and the host
    /// exposes live registers, otherwise from the saved context.
    ///
    /// Without live access the saved copy of a running thread may be stale.
    pub(crate) fn read_register<T>(
        &mut self,
        target: &mut T,
        desc: &RegisterDesc,
        running: bool,
    ) -> DrtmResult<Vec<u8>>
    where
        T: TargetCapability + ?Sized,
    {
        if running {
            match target.read_register(desc.index) {
                Ok(Some(bytes)) => return Ok(bytes),
                Ok(None) => {}
                Err(e) => log::debug!("Live read of register {} failed: {e}", desc.index),
            }
        }
        if let Some(bytes) = self.saved.get(&desc.index) {
            return Ok(bytes.clone());
        }

        let width = desc.width as usize;
        let bytes = match desc.source {
            RegisterSource::Frame(offset) => {
                let mut bytes = vec![0u8; width];
                target.read_exact(self.stack_pointer + u64::from(offset), &mut bytes)?;
                bytes
            }
            RegisterSource::Block(offset) => {
                let mut bytes = vec![0u8; width];
                target.read_exact(self.address + u64::from(offset), &mut bytes)?;
                bytes
            }
            RegisterSource::StackPointer(adjust) => {
                value_bytes(self.stack_pointer + u64::from(adjust), desc.width)
            }
            RegisterSource::Live => return Err(DrtmError::RegisterUnavailable(desc.index)),
        };
        self.saved.insert(desc.index, bytes.clone());
        Ok(bytes)
    }

    /// Write one register, the inverse of [`Self::read_register`].
    ///
    /// A failed live write reports the thread's backing address, since a CPU
    /// register has none of its own.
    pub(crate) fn write_register<T>(
        &mut self,
        target: &mut T,
        layout: &LayoutMetadata,
        desc: &RegisterDesc,
        bytes: Vec<u8>,
        running: bool,
    ) -> DrtmResult<()>
    where
        T: TargetCapability + ?Sized,
    {
        if running {
            let written = target.write_register(desc.index, &bytes).map_err(|e| {
                log::warn!("Live write of register {} failed: {e}", desc.index);
                DrtmError::TargetWriteFailed { address: self.address }
            })?;
            if written {
                return Ok(());
            }
        }

        match desc.source {
            RegisterSource::Frame(offset) => {
                let address = self.stack_pointer + u64::from(offset);
                write_saved(target, address, &bytes)?;
            }
            RegisterSource::Block(offset) => {
                let address = self.address + u64::from(offset);
                write_saved(target, address, &bytes)?;
            }
            RegisterSource::StackPointer(adjust) => {
                let stack_pointer = bytes_value(&bytes)
                    .checked_sub(u64::from(adjust))
                    .and_then(|sp| u32::try_from(sp).ok())
                    .ok_or_else(|| {
                        DrtmError::MalformedRegisterValue(format!(
                            "stack pointer {} below the saved frame",
                            hex::encode(&bytes)
                        ))
                    })?;
                let address = self.address + u64::from(layout.stack_pointer_offset);
                write_saved(target, address, &stack_pointer.to_le_bytes())?;
                // Frame-relative registers moved with the stack pointer.
                self.stack_pointer = u64::from(stack_pointer);
                self.saved.clear();
                return Ok(());
            }
            RegisterSource::Live => return Err(DrtmError::RegisterUnavailable(desc.index)),
        }
        self.saved.insert(desc.index, bytes);
        Ok(())
    }
}

fn write_saved<T>(target: &mut T, address: u64, bytes: &[u8]) -> DrtmResult<()>
where
    T: TargetCapability + ?Sized,
{
    target.write(address, bytes).map_err(|e| {
        log::warn!("Saved context write at 0x{address:08X} failed: {e}");
        DrtmError::TargetWriteFailed { address }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{self, DemoKernel};
    use crate::registers::encode_value;
    use crate::target::MemoryImage;

    fn fixture() -> (MemoryImage, LayoutMetadata, Thread) {
        let mut kernel = DemoKernel::new();
        let worker = kernel.spawn("worker", ThreadState::Blocked, 3);
        let image = kernel.build().unwrap();
        let layout = kernel.layout().clone();

        let address = DemoKernel::thread_address(worker);
        let mut block = vec![0u8; layout.struct_size as usize];
        let mut probe = image.clone();
        probe.read_exact(address, &mut block).unwrap();
        let mut name_buf = [0u8; 64];
        let record = ThreadRecord::decode(&mut probe, &layout, address, &block, &mut name_buf);
        (image, layout, Thread::from_record(ThreadId(1), record))
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(ThreadState::from_code(1), ThreadState::Ready);
        assert_eq!(ThreadState::from_code(4), ThreadState::Suspended);
        assert_eq!(ThreadState::from_code(42), ThreadState::Unknown(42));
        assert_eq!(ThreadState::Unknown(42).to_string(), "unknown(42)");
        assert_eq!(ThreadState::Blocked.code(), 3);
    }

    #[test]
    fn test_thread_id_zero_is_reserved() {
        assert_eq!(ThreadId::new(0), None);
        assert_eq!(ThreadId::new(5).map(ThreadId::get), Some(5));
    }

    #[test]
    fn test_c_text_bounds() {
        assert_eq!(c_text(b"idle\0junk"), Some("idle".to_string()));
        assert_eq!(c_text(b"no-terminator"), Some("no-terminator".to_string()));
        assert_eq!(c_text(b"\0\0\0"), None);
    }

    #[test]
    fn test_truncate_text_keeps_char_boundary() {
        let mut text = "µOS++".to_string();
        truncate_text(&mut text, 1);
        assert_eq!(text, "");
        let mut text = "µOS++".to_string();
        truncate_text(&mut text, 3);
        assert_eq!(text, "µO");
    }

    #[test]
    fn test_decode_record() {
        let (_, _, thread) = fixture();
        assert_eq!(thread.name(), Some("worker"));
        assert_eq!(thread.state(), ThreadState::Blocked);
        assert_eq!(thread.priority(), Some(3));
        assert_eq!(thread.rtos_id(), Some(1));
        assert_eq!(thread.stack_pointer(), DemoKernel::stack_pointer(0));
    }

    #[test]
    fn test_describe() {
        let (_, _, thread) = fixture();
        let text = thread.describe();
        assert!(text.starts_with("worker [blocked] @0x"));
        assert!(text.contains("prio=3"));
    }

    #[test]
    fn test_saved_register_read_and_cache() {
        let (mut image, layout, mut thread) = fixture();
        let pc = *layout.register(15).unwrap();
        let bytes = thread.read_register(&mut image, &pc, false).unwrap();
        assert_eq!(bytes_value(&bytes), u64::from(DemoKernel::saved_register(0, 15)));

        // Served from the cache even if target memory changes behind our back.
        image.write_u32(thread.stack_pointer() + 0x38, 0).unwrap();
        assert_eq!(thread.read_register(&mut image, &pc, false).unwrap(), bytes);
    }

    #[test]
    fn test_stack_pointer_register_is_synthesized() {
        let (mut image, layout, mut thread) = fixture();
        let sp = *layout.register(13).unwrap();
        let bytes = thread.read_register(&mut image, &sp, false).unwrap();
        assert_eq!(bytes_value(&bytes), thread.stack_pointer() + u64::from(demo::FRAME_SIZE));
    }

    #[test]
    fn test_write_stack_pointer_moves_frame() {
        let (mut image, layout, mut thread) = fixture();
        let sp = *layout.register(13).unwrap();
        let new_top = thread.stack_pointer() - 0x40;
        let value = value_bytes(new_top + u64::from(demo::FRAME_SIZE), 4);
        thread.write_register(&mut image, &layout, &sp, value, false).unwrap();

        assert_eq!(thread.stack_pointer(), new_top);
        let field = thread.address() + u64::from(layout.stack_pointer_offset);
        let stored = image.read_u32(field).unwrap();
        assert_eq!(u64::from(stored), new_top);
    }

    #[test]
    fn test_live_register_preferred_when_running() {
        let (mut image, layout, mut thread) = fixture();
        let pc = *layout.register(15).unwrap();
        image.set_live_register(15, vec![0x11, 0x22, 0x33, 0x44]);
        let bytes = thread.read_register(&mut image, &pc, true).unwrap();
        assert_eq!(encode_value(&bytes), "11223344");

        // Not running: the saved frame wins.
        let bytes = thread.read_register(&mut image, &pc, false).unwrap();
        assert_eq!(bytes_value(&bytes), u64::from(DemoKernel::saved_register(0, 15)));
    }

    #[test]
    fn test_live_only_register_unavailable_when_saved() {
        let (mut image, layout, mut thread) = fixture();
        let desc = RegisterDesc::new(20, 4, RegisterSource::Live);
        assert_eq!(
            thread.read_register(&mut image, &desc, false),
            Err(DrtmError::RegisterUnavailable(20))
        );
        assert_eq!(
            thread.write_register(&mut image, &layout, &desc, vec![0; 4], false),
            Err(DrtmError::RegisterUnavailable(20))
        );
    }
}
