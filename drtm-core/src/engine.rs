//! Thread-awareness engine.
//!
//! [`Engine`] is the handle a debugger front end drives: refresh the thread
//! list when the target halts, then answer thread and register queries
//! against the latest snapshot.

use crate::config::EngineConfig;
use crate::error::{DrtmError, DrtmResult};
use crate::registers::{decode_value, encode_value, unavailable, Architecture};
use crate::rtos::snapshot::Walker;
use crate::rtos::thread::truncate_text;
use crate::rtos::{IdAllocator, LayoutMetadata, Snapshot, Thread, ThreadId};
use crate::target::TargetCapability;

pub struct Engine {
    target: Box<dyn TargetCapability + Send>,
    architecture: Architecture,
    config: EngineConfig,
    /// Loaded on first success, never replaced afterwards.
    layout: Option<LayoutMetadata>,
    snapshot: Snapshot,
    ids: IdAllocator,
    scratch: Vec<u8>,
    failed: bool,
}

impl Engine {
    /// Bind the engine to a halted target.
    ///
    /// Fails with [`DrtmError::Unsupported`] for cores outside the Cortex-M
    /// allow-list and with [`DrtmError::InvalidConfig`] for out-of-range
    /// bounds. A missing or invalid layout descriptor is not an error
    /// here; loading is retried on every refresh until it succeeds.
    pub fn initialize(
        mut target: Box<dyn TargetCapability + Send>,
        core_id: u32,
        config: EngineConfig,
    ) -> DrtmResult<Self> {
        let Some(architecture) = Architecture::from_core_id(core_id) else {
            target.log(&format!(
                "DRTM: core 0x{core_id:08X} is not supported, thread awareness disabled\n"
            ));
            return Err(DrtmError::Unsupported(core_id));
        };
        target.log(&format!(
            "DRTM thread awareness v{} ({architecture})\n",
            env!("CARGO_PKG_VERSION")
        ));

        config.validate()?;
        let scratch = target.allocate(config.scratch_len()?)?;
        let mut engine = Self {
            target,
            architecture,
            config,
            layout: None,
            snapshot: Snapshot::empty(),
            ids: IdAllocator::new(),
            scratch,
            failed: false,
        };
        if let Err(e) = engine.load_layout() {
            log::info!("Layout not available yet: {e}");
        }
        Ok(engine)
    }

    fn load_layout(&mut self) -> DrtmResult<()> {
        if self.layout.is_some() {
            return Ok(());
        }
        let address = self.target.resolve_symbol(&self.config.layout_symbol)?;
        let layout = LayoutMetadata::load(&mut *self.target, address, self.config.max_struct_size)?;
        self.layout = Some(layout);
        Ok(())
    }

    fn ensure_live(&self) -> DrtmResult<()> {
        if self.failed {
            Err(DrtmError::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Re-read the thread list. On failure the previous snapshot stays
    /// published.
    pub fn refresh(&mut self) -> DrtmResult<()> {
        self.ensure_live()?;
        let result = self.try_refresh();
        if let Err(e) = &result {
            if e.is_fatal() {
                self.failed = true;
                self.target.log(&format!("DRTM: {e}, thread awareness disabled\n"));
            }
        }
        result
    }

    fn try_refresh(&mut self) -> DrtmResult<()> {
        self.load_layout()?;
        let layout = self.layout.as_ref().ok_or(DrtmError::NotInitialized)?;

        let mut ids = self.ids;
        let walker = Walker {
            target: &mut *self.target,
            layout,
            config: &self.config,
            scratch: &mut self.scratch,
        };
        let snapshot = walker.build(&self.snapshot, &mut ids)?;

        log::info!(
            "Refreshed thread list: {} threads, generation {}",
            snapshot.threads().len(),
            snapshot.generation()
        );
        self.snapshot = snapshot;
        self.ids = ids;
        Ok(())
    }

    /// Number of threads in the latest snapshot.
    pub fn thread_count(&self) -> usize {
        if self.failed {
            0
        } else {
            self.snapshot.threads().len()
        }
    }

    pub fn thread_id_at(&self, index: usize) -> Option<ThreadId> {
        if self.failed {
            return None;
        }
        self.snapshot.threads().get(index).map(Thread::id)
    }

    pub fn current_thread_id(&self) -> Option<ThreadId> {
        if self.failed {
            return None;
        }
        self.snapshot.current()
    }

    fn thread(&self, id: ThreadId) -> DrtmResult<&Thread> {
        self.ensure_live()?;
        self.snapshot
            .threads()
            .by_id(id)
            .ok_or(DrtmError::InvalidThreadId(id.get()))
    }

    /// Human-readable summary, at most `description_len - 1` bytes.
    pub fn describe(&self, id: ThreadId) -> DrtmResult<String> {
        let mut text = self.thread(id)?.describe();
        truncate_text(&mut text, self.config.description_len.saturating_sub(1));
        Ok(text)
    }

    /// Write the description NUL-terminated into `buf`, truncating to fit.
    /// Returns the text length.
    pub fn describe_into(&self, id: ThreadId, buf: &mut [u8]) -> DrtmResult<usize> {
        let mut text = self.describe(id)?;
        if buf.is_empty() {
            return Ok(0);
        }
        truncate_text(&mut text, buf.len() - 1);
        let len = text.len();
        buf[..len].copy_from_slice(text.as_bytes());
        buf[len] = 0;
        Ok(len)
    }

    /// One register of a thread as hex text.
    pub fn get_register(&mut self, id: ThreadId, index: u16) -> DrtmResult<String> {
        self.thread(id)?;
        let layout = self.layout.as_ref().ok_or(DrtmError::NotInitialized)?;
        let desc = *layout.register(index).ok_or(DrtmError::InvalidRegisterIndex(index))?;
        let running = self.snapshot.current() == Some(id);
        let thread = self
            .snapshot
            .threads_mut()
            .by_id_mut(id)
            .ok_or(DrtmError::InvalidThreadId(id.get()))?;
        let bytes = thread.read_register(&mut *self.target, &desc, running)?;
        Ok(encode_value(&bytes))
    }

    /// Every register in index order. Registers that cannot be read are
    /// filled with `x`.
    pub fn get_register_file(&mut self, id: ThreadId) -> DrtmResult<String> {
        self.thread(id)?;
        let layout = self.layout.as_ref().ok_or(DrtmError::NotInitialized)?;
        let running = self.snapshot.current() == Some(id);
        let thread = self
            .snapshot
            .threads_mut()
            .by_id_mut(id)
            .ok_or(DrtmError::InvalidThreadId(id.get()))?;

        let mut text = String::with_capacity(layout.register_file_text_len());
        for desc in &layout.registers {
            match thread.read_register(&mut *self.target, desc, running) {
                Ok(bytes) => text.push_str(&encode_value(&bytes)),
                Err(e) => {
                    log::debug!("Register {} of thread {id} unavailable: {e}", desc.index);
                    text.push_str(&unavailable(desc));
                }
            }
        }
        Ok(text)
    }

    pub fn set_register(&mut self, id: ThreadId, index: u16, text: &str) -> DrtmResult<()> {
        self.thread(id)?;
        let layout = self.layout.as_ref().ok_or(DrtmError::NotInitialized)?;
        let desc = *layout.register(index).ok_or(DrtmError::InvalidRegisterIndex(index))?;
        let bytes = decode_value(&desc, text)?;
        let running = self.snapshot.current() == Some(id);
        let thread = self
            .snapshot
            .threads_mut()
            .by_id_mut(id)
            .ok_or(DrtmError::InvalidThreadId(id.get()))?;
        thread.write_register(&mut *self.target, layout, &desc, bytes, running)
    }

    /// Write a full register file. Slots holding `x` filler are skipped.
    /// The blob is parsed completely before anything is written.
    pub fn set_register_file(&mut self, id: ThreadId, text: &str) -> DrtmResult<()> {
        self.thread(id)?;
        let layout = self.layout.as_ref().ok_or(DrtmError::NotInitialized)?;
        let text = text.trim();
        let expected = layout.register_file_text_len();
        if !text.is_ascii() || text.len() != expected {
            return Err(DrtmError::MalformedRegisterValue(format!(
                "register file needs {expected} hex digits, got {}",
                text.len()
            )));
        }

        let mut writes = Vec::with_capacity(layout.registers.len());
        let mut pos = 0;
        for desc in &layout.registers {
            let slot = &text[pos..pos + desc.text_len()];
            pos += desc.text_len();
            if slot.bytes().all(|b| b.eq_ignore_ascii_case(&b'x')) {
                continue;
            }
            writes.push((*desc, decode_value(desc, slot)?));
        }

        let running = self.snapshot.current() == Some(id);
        let thread = self
            .snapshot
            .threads_mut()
            .by_id_mut(id)
            .ok_or(DrtmError::InvalidThreadId(id.get()))?;
        for (desc, bytes) in writes {
            thread.write_register(&mut *self.target, layout, &desc, bytes, running)?;
        }
        Ok(())
    }

    pub const fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Layout descriptor, once it has been loaded.
    pub const fn layout(&self) -> Option<&LayoutMetadata> {
        self.layout.as_ref()
    }

    pub const fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a fatal error has disabled the engine.
    pub const fn is_failed(&self) -> bool {
        self.failed
    }

    /// The capability the engine was initialized with.
    pub fn target_mut(&mut self) -> &mut (dyn TargetCapability + Send) {
        &mut *self.target
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("architecture", &self.architecture)
            .field("layout_loaded", &self.layout.is_some())
            .field("generation", &self.snapshot.generation())
            .field("threads", &self.snapshot.threads().len())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}
