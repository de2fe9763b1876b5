//! Error types for the thread-awareness engine.
//!
//! Every failure the engine can report is a variant of [`DrtmError`]. The
//! plug-in boundary converts them into booleans and sentinels, so nothing in
//! here ever crosses into the host debugger as a panic.

use thiserror::Error;

/// Main error type for engine operations.
///
/// ## Error Categories
///
/// 1. **Target errors**: `TargetUnreachable`, `TargetWriteFailed`, `SymbolNotFound`
/// 2. **Metadata errors**: `LayoutMetadataInvalid`, `CorruptedThreadList`
/// 3. **Request errors**: `InvalidThreadId`, `InvalidRegisterIndex`,
///    `MalformedRegisterValue`, `RegisterUnavailable`
/// 4. **Caller errors**: `BufferTooSmall`, `InvalidConfig`, `NotInitialized`
/// 5. **Fatal errors**: `OutOfMemory`, `Unsupported`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrtmError {
    /// The probe could not access target memory.
    ///
    /// Happens when the target is running, the probe is disconnected or the
    /// address is not mapped. `address` is the first byte that could not be read.
    #[error("Target memory unreachable at 0x{address:08X}")]
    TargetUnreachable { address: u64 },

    /// A symbol required by the engine is not known to the host.
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// The DRTM descriptor in the target image is missing or implausible.
    ///
    /// The engine refuses to produce thread data rather than guess a layout.
    #[error("Layout metadata invalid: {0}")]
    LayoutMetadataInvalid(String),

    /// The thread list loops back on itself or is longer than the configured cap.
    #[error("Corrupted thread list: {0}")]
    CorruptedThreadList(String),

    /// The thread id is not part of the latest snapshot.
    #[error("Invalid thread id {0}")]
    InvalidThreadId(u32),

    /// The register index is not described by the layout metadata.
    #[error("Invalid register index {0}")]
    InvalidRegisterIndex(u16),

    /// Register text could not be parsed as a value of the register's width.
    #[error("Malformed register value: {0}")]
    MalformedRegisterValue(String),

    /// The register exists but has no readable or writable source for this thread.
    #[error("Register {0} unavailable")]
    RegisterUnavailable(u16),

    /// Writing target memory or a live register failed.
    #[error("Target write failed at 0x{address:08X}")]
    TargetWriteFailed { address: u64 },

    /// Host memory could not be obtained. Fatal for the session.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The core identifier is outside the supported allow-list. Fatal for the session.
    #[error("Unsupported core 0x{0:08X}")]
    Unsupported(u32),

    /// A caller-supplied buffer cannot hold the result.
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// An engine configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The engine was never initialized or has hit a fatal error.
    #[error("Engine not initialized")]
    NotInitialized,
}

impl DrtmError {
    /// Whether the error leaves the engine unable to continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::OutOfMemory(_) | Self::Unsupported(_))
    }
}

/// Convenience type alias for `Result<T, DrtmError>`
///
/// ```rust
/// use drtm_core::error::DrtmResult;
/// fn foo() -> DrtmResult<()> {
///     Ok(())
/// }
/// ```
pub type DrtmResult<T> = std::result::Result<T, DrtmError>;
