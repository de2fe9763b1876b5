//! Simulated DRTM-aware kernel.
//!
//! Lays out a descriptor, a thread list and saved Cortex-M exception frames
//! in target memory the way a small RTOS would. Backs the `--demo` target of
//! the CLI, the benchmarks and most tests.
//!
//! Memory map (all in one RAM region at [`RAM_BASE`]):
//!
//! ```text
//! +0x0000  DRTM descriptor
//! +0x0200  scheduler started (u8), list head (u32), current thread (u32)
//! +0x0400  name pool, 0x40 bytes per thread (pointer-name layouts only)
//! +0x2000  thread control blocks, 0x80 apart
//! +0x8000  thread stacks, 0x400 each, saved frame at the top
//! ```

use crate::config::DEFAULT_LAYOUT_SYMBOL;
use crate::error::{DrtmError, DrtmResult};
use crate::registers::{RegisterDesc, RegisterSource};
use crate::rtos::metadata::{LayoutVersion, NameField};
use crate::rtos::{LayoutMetadata, ThreadState};
use crate::target::{MemoryImage, TargetCapability, TargetExt};

pub const RAM_BASE: u64 = 0x2000_0000;
pub const RAM_SIZE: usize = 0x2_0000;

pub const DESCRIPTOR_ADDRESS: u64 = RAM_BASE;
pub const SCHEDULER_STARTED_ADDRESS: u64 = RAM_BASE + 0x200;
pub const THREAD_LIST_HEAD_ADDRESS: u64 = RAM_BASE + 0x204;
pub const CURRENT_THREAD_ADDRESS: u64 = RAM_BASE + 0x208;

const NAME_POOL: u64 = RAM_BASE + 0x400;
const NAME_SLOT: u64 = 0x40;
const TCB_BASE: u64 = RAM_BASE + 0x2000;
const TCB_STRIDE: u64 = 0x80;
const STACK_BASE: u64 = RAM_BASE + 0x8000;
const STACK_SIZE: u64 = 0x400;

pub const MAX_THREADS: usize = 64;

// Thread control block.
pub const TCB_SIZE: u16 = 0x40;
pub const TCB_STACK_POINTER: u16 = 0x00;
pub const TCB_NEXT: u16 = 0x04;
pub const TCB_STATE: u16 = 0x08;
pub const TCB_ID: u16 = 0x0C;
pub const TCB_PRIORITY: u16 = 0x10;
pub const TCB_NAME: u16 = 0x14;
pub const TCB_NAME_CAPACITY: u16 = 16;

/// Bytes of saved context below the thread's stack pointer at switch-out.
pub const FRAME_SIZE: u32 = 0x40;

/// Offset of a core register in the saved frame: r4-r11 pushed by the
/// context switch, then the hardware exception frame.
#[must_use]
pub const fn frame_offset(index: u16) -> Option<u32> {
    match index {
        0..=3 => Some(0x20 + index as u32 * 4),
        4..=11 => Some((index as u32 - 4) * 4),
        12 => Some(0x30),
        14 => Some(0x34),
        15 => Some(0x38),
        16 => Some(0x3C),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DemoThread {
    name: String,
    state: ThreadState,
    priority: u32,
}

/// Builder for a simulated kernel. Threads are addressed by handle, which is
/// also their control block slot.
#[derive(Debug, Clone)]
pub struct DemoKernel {
    layout: LayoutMetadata,
    slots: Vec<Option<DemoThread>>,
    current: Option<usize>,
    scheduler_started: bool,
}

impl Default for DemoKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoKernel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            layout: cortex_m_layout(),
            slots: Vec::new(),
            current: None,
            scheduler_started: true,
        }
    }

    /// A handful of threads in every state, `main` running.
    #[must_use]
    pub fn sample() -> Self {
        let mut kernel = Self::new();
        kernel.spawn("idle", ThreadState::Ready, 0);
        let main = kernel.spawn("main", ThreadState::Ready, 5);
        kernel.spawn("net_rx", ThreadState::Blocked, 4);
        kernel.spawn("logger", ThreadState::Suspended, 1);
        kernel.spawn("sensor_fusion_worker", ThreadState::Blocked, 3);
        kernel.set_current(main);
        kernel
    }

    /// Link entries through their next field instead of their base address.
    #[must_use]
    pub fn intrusive(mut self) -> Self {
        self.layout.intrusive_link = true;
        self
    }

    /// Store names in a separate pool and keep a pointer in the control block.
    #[must_use]
    pub fn pointer_names(mut self) -> Self {
        self.layout.name = NameField::Pointer { offset: TCB_NAME };
        self
    }

    pub fn layout(&self) -> &LayoutMetadata {
        &self.layout
    }

    pub fn layout_mut(&mut self) -> &mut LayoutMetadata {
        &mut self.layout
    }

    /// Add a thread at the end of the list and return its handle.
    pub fn spawn(&mut self, name: &str, state: ThreadState, priority: u32) -> usize {
        self.slots.push(Some(DemoThread { name: name.to_string(), state, priority }));
        self.slots.len() - 1
    }

    /// Put a different thread into an existing control block.
    pub fn replace(&mut self, handle: usize, name: &str, state: ThreadState, priority: u32) {
        if let Some(slot) = self.slots.get_mut(handle) {
            *slot = Some(DemoThread { name: name.to_string(), state, priority });
        }
    }

    /// Unlink a thread. Its control block stays allocated but unused.
    pub fn kill(&mut self, handle: usize) {
        if let Some(slot) = self.slots.get_mut(handle) {
            *slot = None;
        }
        if self.current == Some(handle) {
            self.current = None;
        }
    }

    pub fn set_current(&mut self, handle: usize) {
        self.current = Some(handle);
    }

    pub fn set_scheduler_started(&mut self, started: bool) {
        self.scheduler_started = started;
    }

    #[must_use]
    pub const fn thread_address(handle: usize) -> u64 {
        TCB_BASE + handle as u64 * TCB_STRIDE
    }

    /// Saved stack pointer of a freshly installed thread.
    #[must_use]
    pub const fn stack_pointer(handle: usize) -> u64 {
        STACK_BASE + (handle as u64 + 1) * STACK_SIZE - FRAME_SIZE as u64
    }

    /// Value the saved frame holds for `index`, recognisable in dumps.
    #[must_use]
    pub const fn saved_register(handle: usize, index: u16) -> u32 {
        0xC0DE_0000 | ((handle as u32 & 0xFF) << 8) | index as u32
    }

    /// Map RAM, install the kernel and export the descriptor symbol.
    pub fn build(&self) -> DrtmResult<MemoryImage> {
        let mut image = MemoryImage::new();
        image.map(RAM_BASE, vec![0; RAM_SIZE]);
        image.add_symbol(DEFAULT_LAYOUT_SYMBOL, DESCRIPTOR_ADDRESS);
        self.install(&mut image)?;
        Ok(image)
    }

    /// Write the kernel state into an already mapped target.
    pub fn install<T>(&self, target: &mut T) -> DrtmResult<()>
    where
        T: TargetCapability + ?Sized,
    {
        if self.slots.len() > MAX_THREADS {
            return Err(DrtmError::OutOfMemory(format!(
                "demo kernel holds at most {MAX_THREADS} threads"
            )));
        }
        target.write(DESCRIPTOR_ADDRESS, &self.layout.to_bytes())?;
        target.write(SCHEDULER_STARTED_ADDRESS, &[u8::from(self.scheduler_started)])?;

        let live: Vec<usize> = (0..self.slots.len()).filter(|&h| self.slots[h].is_some()).collect();
        for (position, &handle) in live.iter().enumerate() {
            let next = live.get(position + 1).map_or(0, |&h| self.link_to(h));
            self.install_thread(target, handle, next)?;
        }

        let head = live.first().map_or(0, |&h| self.link_to(h));
        target.write_u32(THREAD_LIST_HEAD_ADDRESS, head)?;
        let current = self
            .current
            .filter(|&h| self.slots.get(h).is_some_and(Option::is_some))
            .map_or(0, |h| Self::thread_address(h) as u32);
        target.write_u32(CURRENT_THREAD_ADDRESS, current)?;
        Ok(())
    }

    fn link_to(&self, handle: usize) -> u32 {
        let address = Self::thread_address(handle) as u32;
        if self.layout.intrusive_link {
            address + u32::from(self.layout.next_offset)
        } else {
            address
        }
    }

    fn install_thread<T>(&self, target: &mut T, handle: usize, next: u32) -> DrtmResult<()>
    where
        T: TargetCapability + ?Sized,
    {
        let Some(thread) = self.slots.get(handle).and_then(Option::as_ref) else {
            return Ok(());
        };
        let base = Self::thread_address(handle);
        let stack_pointer = Self::stack_pointer(handle);
        let field = |offset: u16| base + u64::from(offset);

        target.write(base, &[0; TCB_SIZE as usize])?;
        target.write_u32(field(TCB_STACK_POINTER), stack_pointer as u32)?;
        target.write_u32(field(TCB_NEXT), next)?;
        target.write(field(TCB_STATE), &[thread.state.code() as u8])?;
        target.write_u32(field(TCB_ID), handle as u32 + 1)?;
        target.write_u32(field(TCB_PRIORITY), thread.priority)?;

        match self.layout.name {
            NameField::Inline { offset, capacity } => {
                let len = thread.name.len().min(capacity as usize);
                target.write(field(offset), &thread.name.as_bytes()[..len])?;
            }
            NameField::Pointer { offset } => {
                let pool = NAME_POOL + handle as u64 * NAME_SLOT;
                let len = thread.name.len().min(NAME_SLOT as usize - 1);
                let mut text = thread.name.as_bytes()[..len].to_vec();
                text.push(0);
                target.write(pool, &text)?;
                target.write_u32(field(offset), pool as u32)?;
            }
        }

        for index in 0..=16u16 {
            if let Some(offset) = frame_offset(index) {
                target.write_u32(
                    stack_pointer + u64::from(offset),
                    Self::saved_register(handle, index),
                )?;
            }
        }
        Ok(())
    }
}

fn cortex_m_layout() -> LayoutMetadata {
    let registers = (0..=16u16)
        .map(|index| {
            let source = frame_offset(index)
                .map_or(RegisterSource::StackPointer(FRAME_SIZE), RegisterSource::Frame);
            RegisterDesc::new(index, 4, source)
        })
        .collect();

    LayoutMetadata {
        version: LayoutVersion { major: 1, minor: 0, patch: 0 },
        intrusive_link: false,
        scheduler_started_address: Some(SCHEDULER_STARTED_ADDRESS),
        thread_list_head_address: THREAD_LIST_HEAD_ADDRESS,
        current_thread_address: CURRENT_THREAD_ADDRESS,
        struct_size: TCB_SIZE,
        next_offset: TCB_NEXT,
        state_offset: TCB_STATE,
        state_width: 1,
        stack_pointer_offset: TCB_STACK_POINTER,
        name: NameField::Inline { offset: TCB_NAME, capacity: TCB_NAME_CAPACITY },
        id_offset: Some(TCB_ID),
        priority_offset: Some(TCB_PRIORITY),
        registers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_offsets_cover_saved_registers() {
        let mut offsets: Vec<u32> = (0..=16).filter_map(frame_offset).collect();
        offsets.sort_unstable();
        let expected: Vec<u32> = (0..16).map(|i| i * 4).collect();
        assert_eq!(offsets, expected);
        assert_eq!(frame_offset(13), None);
    }

    #[test]
    fn test_layout_is_valid() {
        DemoKernel::new().layout().validate(1024).unwrap();
        DemoKernel::new().pointer_names().intrusive().layout().validate(1024).unwrap();
    }

    #[test]
    fn test_build_links_threads() {
        let mut kernel = DemoKernel::new();
        kernel.spawn("a", ThreadState::Ready, 1);
        kernel.spawn("b", ThreadState::Ready, 2);
        kernel.spawn("c", ThreadState::Ready, 3);
        kernel.kill(1);
        let mut image = kernel.build().unwrap();

        let a = DemoKernel::thread_address(0);
        let c = DemoKernel::thread_address(2);
        assert_eq!(image.read_pointer(THREAD_LIST_HEAD_ADDRESS).unwrap(), a);
        assert_eq!(image.read_pointer(a + u64::from(TCB_NEXT)).unwrap(), c);
        assert_eq!(image.read_pointer(c + u64::from(TCB_NEXT)).unwrap(), 0);
        assert_eq!(image.read_u8(SCHEDULER_STARTED_ADDRESS).unwrap(), 1);
    }

    #[test]
    fn test_saved_frame_contents() {
        let mut kernel = DemoKernel::new();
        kernel.spawn("a", ThreadState::Ready, 1);
        let mut image = kernel.build().unwrap();
        let sp = DemoKernel::stack_pointer(0);
        assert_eq!(image.read_u32(sp + 0x38).unwrap(), DemoKernel::saved_register(0, 15));
        assert_eq!(image.read_u32(sp).unwrap(), DemoKernel::saved_register(0, 4));
    }

    #[test]
    fn test_thread_limit() {
        let mut kernel = DemoKernel::new();
        for i in 0..=MAX_THREADS {
            kernel.spawn(&format!("t{i}"), ThreadState::Ready, 0);
        }
        assert!(matches!(kernel.build(), Err(DrtmError::OutOfMemory(_))));
    }
}
