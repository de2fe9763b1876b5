//! RTOS plug-in boundary.
//!
//! Mirrors the shape of a SEGGER J-Link RTOS plug-in: plain integers and
//! caller-owned buffers in, booleans and sentinels out. Every engine error is
//! logged and converted here; nothing propagates into the host.

use crate::config::{EngineConfig, DEFAULT_LAYOUT_SYMBOL};
use crate::engine::Engine;
use crate::error::{DrtmError, DrtmResult};
use crate::rtos::ThreadId;
use crate::target::TargetCapability;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Plug-in API version reported to the host.
pub const PLUGIN_API_VERSION: u32 = 100;

/// Largest thread description handed to the host, including the NUL.
pub const DISPLAY_LEN: usize = 256;
/// Largest register-file text handed to the host, including the NUL.
pub const REGISTER_LIST_LEN: usize = 512;

static SYMBOLS: [&str; 1] = [DEFAULT_LAYOUT_SYMBOL];

static GLOBAL: Mutex<Plugin> = Mutex::new(Plugin::new());

enum Slot {
    Uninitialized,
    Active(Engine),
    /// Rejected core or fatal error. Never leaves this state.
    Inert,
}

pub struct Plugin {
    slot: Slot,
    config: Option<EngineConfig>,
}

impl Default for Plugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin {
    /// A plug-in instance of its own. Hosts use [`Plugin::global`].
    #[must_use]
    pub const fn new() -> Self {
        Self { slot: Slot::Uninitialized, config: None }
    }

    /// The process-wide plug-in instance.
    pub fn global() -> MutexGuard<'static, Self> {
        GLOBAL.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Use `config` for the next [`Self::init`] instead of the defaults.
    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = Some(config);
    }

    pub fn init(&mut self, target: Box<dyn TargetCapability + Send>, core_id: u32) -> bool {
        if matches!(self.slot, Slot::Inert) {
            log::warn!("DRTM plug-in is inert, ignoring init");
            return false;
        }
        let config = self.config.clone().unwrap_or_default();
        match Engine::initialize(target, core_id, config) {
            Ok(engine) => {
                self.slot = Slot::Active(engine);
                true
            }
            Err(e) => {
                log::warn!("DRTM init failed: {e}");
                if e.is_fatal() {
                    self.slot = Slot::Inert;
                }
                false
            }
        }
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        PLUGIN_API_VERSION
    }

    /// Symbols the host must be able to resolve.
    #[must_use]
    pub fn symbols(&self) -> &'static [&'static str] {
        &SYMBOLS
    }

    pub fn is_active(&self) -> bool {
        matches!(self.slot, Slot::Active(_))
    }

    pub fn is_inert(&self) -> bool {
        matches!(self.slot, Slot::Inert)
    }

    pub fn engine(&self) -> Option<&Engine> {
        match &self.slot {
            Slot::Active(engine) => Some(engine),
            _ => None,
        }
    }

    fn engine_mut(&mut self) -> DrtmResult<&mut Engine> {
        match &mut self.slot {
            Slot::Active(engine) => Ok(engine),
            _ => Err(DrtmError::NotInitialized),
        }
    }

    pub fn update_threads(&mut self) -> bool {
        let result = self.engine_mut().and_then(Engine::refresh);
        if let Err(e) = &result {
            if e.is_fatal() {
                self.slot = Slot::Inert;
            }
        }
        report("update threads", result).is_some()
    }

    pub fn thread_count(&self) -> u32 {
        self.engine()
            .map_or(0, |engine| u32::try_from(engine.thread_count()).unwrap_or(u32::MAX))
    }

    /// Id of the thread at list position `index`, 0 if there is none.
    pub fn thread_id(&self, index: u32) -> u32 {
        self.engine()
            .and_then(|engine| engine.thread_id_at(index as usize))
            .map_or(0, ThreadId::get)
    }

    /// Id of the running thread, 0 if none.
    pub fn current_thread_id(&self) -> u32 {
        self.engine()
            .and_then(Engine::current_thread_id)
            .map_or(0, ThreadId::get)
    }

    /// Write the thread description into `buf`. Returns the number of bytes
    /// written without the NUL, or -1.
    pub fn thread_display(&self, thread_id: u32, buf: &mut [u8]) -> i32 {
        let len = buf.len().min(DISPLAY_LEN);
        let result = self
            .engine()
            .ok_or(DrtmError::NotInitialized)
            .and_then(|engine| engine.describe_into(thread(thread_id)?, &mut buf[..len]));
        report("thread display", result).map_or(-1, |n| i32::try_from(n).unwrap_or(-1))
    }

    /// Hex text of one register, NUL-terminated. Returns 0 or -1.
    pub fn thread_reg(&mut self, thread_id: u32, index: u32, buf: &mut [u8]) -> i32 {
        let result = self.engine_mut().and_then(|engine| {
            let index =
                u16::try_from(index).map_err(|_| DrtmError::InvalidRegisterIndex(u16::MAX))?;
            engine.get_register(thread(thread_id)?, index)
        });
        report("thread register", result.and_then(|text| copy_text(&text, buf))).map_or(-1, |()| 0)
    }

    /// Hex text of the whole register file, NUL-terminated. Returns 0 or -1.
    pub fn thread_reg_list(&mut self, thread_id: u32, buf: &mut [u8]) -> i32 {
        let len = buf.len().min(REGISTER_LIST_LEN);
        let result = self
            .engine_mut()
            .and_then(|engine| engine.get_register_file(thread(thread_id)?));
        report("thread register list", result.and_then(|text| copy_text(&text, &mut buf[..len])))
            .map_or(-1, |()| 0)
    }

    pub fn set_thread_reg(&mut self, thread_id: u32, index: u32, value: &str) -> bool {
        let result = self.engine_mut().and_then(|engine| {
            let index =
                u16::try_from(index).map_err(|_| DrtmError::InvalidRegisterIndex(u16::MAX))?;
            engine.set_register(thread(thread_id)?, index, value)
        });
        report("set thread register", result).is_some()
    }

    pub fn set_thread_reg_list(&mut self, thread_id: u32, value: &str) -> bool {
        let result = self
            .engine_mut()
            .and_then(|engine| engine.set_register_file(thread(thread_id)?, value));
        report("set thread register list", result).is_some()
    }
}

fn thread(raw: u32) -> DrtmResult<ThreadId> {
    ThreadId::new(raw).ok_or(DrtmError::InvalidThreadId(raw))
}

/// Copy `text` and a NUL into `buf`; fails instead of truncating.
fn copy_text(text: &str, buf: &mut [u8]) -> DrtmResult<()> {
    if text.len() >= buf.len() {
        return Err(DrtmError::BufferTooSmall { needed: text.len() + 1, available: buf.len() });
    }
    buf[..text.len()].copy_from_slice(text.as_bytes());
    buf[text.len()] = 0;
    Ok(())
}

fn report<T>(what: &str, result: DrtmResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("DRTM {what} failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoKernel;
    use crate::target::MemoryImage;

    const CORTEX_M4: u32 = 0x0E00_00FF;

    fn active() -> Plugin {
        let mut plugin = Plugin::new();
        let image = DemoKernel::sample().build().unwrap();
        assert!(plugin.init(Box::new(image), CORTEX_M4));
        assert!(plugin.update_threads());
        plugin
    }

    #[test]
    fn test_version_and_symbols() {
        let plugin = Plugin::new();
        assert_eq!(plugin.version(), 100);
        assert_eq!(plugin.symbols(), &["os_rtos_drtm_data"]);
    }

    #[test]
    fn test_uninitialized_returns_sentinels() {
        let mut plugin = Plugin::new();
        assert_eq!(plugin.thread_count(), 0);
        assert_eq!(plugin.thread_id(0), 0);
        assert_eq!(plugin.current_thread_id(), 0);
        assert!(!plugin.update_threads());
        let mut buf = [0u8; 64];
        assert_eq!(plugin.thread_display(1, &mut buf), -1);
        assert_eq!(plugin.thread_reg(1, 0, &mut buf), -1);
        assert!(!plugin.set_thread_reg(1, 0, "00000000"));
    }

    #[test]
    fn test_rejected_core_is_permanent() {
        let mut plugin = Plugin::new();
        let image = DemoKernel::sample().build().unwrap();
        assert!(!plugin.init(Box::new(image), 0x0C00_00FF));
        assert!(plugin.is_inert());

        let image = DemoKernel::sample().build().unwrap();
        assert!(!plugin.init(Box::new(image), CORTEX_M4));
        assert_eq!(plugin.thread_count(), 0);
    }

    #[test]
    fn test_thread_queries() {
        let plugin = active();
        assert_eq!(plugin.thread_count(), 5);
        assert_eq!(plugin.thread_id(5), 0);
        let current = plugin.current_thread_id();
        assert_eq!(current, plugin.thread_id(1));

        let mut buf = [0u8; DISPLAY_LEN];
        let n = plugin.thread_display(current, &mut buf);
        assert!(n > 0);
        let text = std::str::from_utf8(&buf[..n as usize]).unwrap();
        assert!(text.starts_with("main [running]"));
        assert_eq!(buf[n as usize], 0);

        assert_eq!(plugin.thread_display(0, &mut buf), -1);
        assert_eq!(plugin.thread_display(77, &mut buf), -1);
    }

    #[test]
    fn test_register_round_trip() {
        let mut plugin = active();
        let id = plugin.thread_id(2);
        assert!(plugin.set_thread_reg(id, 12, "78563412"));

        let mut buf = [0u8; 16];
        assert_eq!(plugin.thread_reg(id, 12, &mut buf), 0);
        assert_eq!(&buf[..9], b"78563412\0");

        assert!(!plugin.set_thread_reg(id, 12, "not-hex!"));
        assert_eq!(plugin.thread_reg(id, 99, &mut buf), -1);
        assert_eq!(plugin.thread_reg(id, 70_000, &mut buf), -1);
    }

    #[test]
    fn test_register_list_must_fit() {
        let mut plugin = active();
        let id = plugin.thread_id(0);

        let mut buf = [0u8; REGISTER_LIST_LEN];
        assert_eq!(plugin.thread_reg_list(id, &mut buf), 0);
        let end = buf.iter().position(|&b| b == 0).unwrap();
        assert_eq!(end, 17 * 8);

        let blob = std::str::from_utf8(&buf[..end]).unwrap().to_string();
        assert!(plugin.set_thread_reg_list(id, &blob));

        let mut small = [0u8; 64];
        assert_eq!(plugin.thread_reg_list(id, &mut small), -1);
    }

    #[test]
    fn test_global_slot() {
        let plugin = Plugin::global();
        assert_eq!(plugin.version(), PLUGIN_API_VERSION);
    }

    #[test]
    fn test_configured_init() {
        let mut plugin = Plugin::new();
        plugin.set_config(EngineConfig { max_threads: 2, ..EngineConfig::default() });
        let image = DemoKernel::sample().build().unwrap();
        assert!(plugin.init(Box::new(image), CORTEX_M4));
        // Five threads exceed the cap.
        assert!(!plugin.update_threads());
        assert!(plugin.is_active());
        assert_eq!(plugin.thread_count(), 0);
    }

    #[test]
    fn test_live_target_boundary() {
        let mut plugin = Plugin::new();
        let mut image: MemoryImage = DemoKernel::sample().build().unwrap();
        image.enable_live_registers();
        assert!(plugin.init(Box::new(image), CORTEX_M4));
        assert!(plugin.update_threads());

        // Live access is on but r0 was never captured: the saved frame answers.
        let current = plugin.current_thread_id();
        let mut buf = [0u8; 16];
        assert_eq!(plugin.thread_reg(current, 0, &mut buf), 0);
    }
}
