//! RTOS thread awareness driven by the DRTM layout descriptor.

pub mod metadata;
pub mod snapshot;
pub mod table;
pub mod thread;

pub use metadata::{LayoutMetadata, LayoutVersion, NameField};
pub use snapshot::Snapshot;
pub use table::{IdAllocator, ThreadTable};
pub use thread::{Thread, ThreadId, ThreadState};
