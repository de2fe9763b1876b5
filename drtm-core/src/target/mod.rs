//! Target capability module.
//!
//! Everything the engine knows about the halted target comes through
//! [`TargetCapability`]: raw memory access, symbol resolution, host memory and
//! text output. The engine never talks to a probe directly, which is what lets
//! it run unchanged against [`MemoryImage`] in tests and on RAM dumps.

pub mod image;
#[cfg(feature = "hardware")]
pub mod probe;

pub use image::MemoryImage;
#[cfg(feature = "hardware")]
pub use probe::ProbeTarget;

use crate::error::{DrtmError, DrtmResult};

/// Capability supplied by the host debugger.
pub trait TargetCapability {
    /// Read up to `buf.len()` bytes starting at `address`.
    ///
    /// Returns how many bytes were actually read. A short count is the only
    /// way a partial read may be reported; bytes past it are unspecified.
    fn read(&mut self, address: u64, buf: &mut [u8]) -> DrtmResult<usize>;

    /// Write `data` at `address`.
    fn write(&mut self, address: u64, data: &[u8]) -> DrtmResult<()>;

    /// Resolve a symbol of the target image to its address.
    fn resolve_symbol(&mut self, name: &str) -> DrtmResult<u64>;

    /// Obtain a zeroed host buffer of `size` bytes.
    ///
    /// The default uses the global allocator; hosts with their own memory pool
    /// override this.
    fn allocate(&mut self, size: usize) -> DrtmResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|e| DrtmError::OutOfMemory(format!("{size} bytes: {e}")))?;
        buf.resize(size, 0);
        Ok(buf)
    }

    /// Emit host-visible text (banners, diagnostics).
    fn log(&mut self, text: &str);

    /// Read a live CPU register. `Ok(None)` means live access is not supported.
    fn read_register(&mut self, _index: u16) -> DrtmResult<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Write a live CPU register. `Ok(false)` means live access is not supported.
    fn write_register(&mut self, _index: u16, _data: &[u8]) -> DrtmResult<bool> {
        Ok(false)
    }
}

/// Typed helpers layered over the raw capability.
///
/// All multi-byte target values are little-endian (Cortex-M).
pub trait TargetExt: TargetCapability {
    /// Fill `buf` completely or fail at the first byte that could not be read.
    fn read_exact(&mut self, address: u64, buf: &mut [u8]) -> DrtmResult<()> {
        let got = self.read(address, buf)?;
        if got < buf.len() {
            return Err(DrtmError::TargetUnreachable { address: address + got as u64 });
        }
        Ok(())
    }

    fn read_u8(&mut self, address: u64) -> DrtmResult<u8> {
        let mut b = [0u8; 1];
        self.read_exact(address, &mut b)?;
        Ok(b[0])
    }

    fn read_u32(&mut self, address: u64) -> DrtmResult<u32> {
        let mut b = [0u8; 4];
        self.read_exact(address, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Read a target pointer (32-bit on every supported core).
    fn read_pointer(&mut self, address: u64) -> DrtmResult<u64> {
        self.read_u32(address).map(u64::from)
    }

    fn write_u32(&mut self, address: u64, value: u32) -> DrtmResult<()> {
        self.write(address, &value.to_le_bytes())
    }
}

impl<T: TargetCapability + ?Sized> TargetExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_exact_reports_first_missing_byte() {
        let mut image = MemoryImage::new();
        image.map(0x1000, vec![0xAA; 6]);

        let mut buf = [0u8; 8];
        let err = image.read_exact(0x1000, &mut buf).unwrap_err();
        assert_eq!(err, DrtmError::TargetUnreachable { address: 0x1006 });
    }

    #[test]
    fn test_typed_reads_are_little_endian() {
        let mut image = MemoryImage::new();
        image.map(0x2000, vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(image.read_u32(0x2000).unwrap(), 0x1234_5678);
        assert_eq!(image.read_pointer(0x2000).unwrap(), 0x1234_5678);
        assert_eq!(image.read_u8(0x2003).unwrap(), 0x12);
    }

    #[test]
    fn test_default_allocate_is_zeroed() {
        struct Bare;
        impl TargetCapability for Bare {
            fn read(&mut self, address: u64, _buf: &mut [u8]) -> DrtmResult<usize> {
                Err(DrtmError::TargetUnreachable { address })
            }
            fn write(&mut self, address: u64, _data: &[u8]) -> DrtmResult<()> {
                Err(DrtmError::TargetWriteFailed { address })
            }
            fn resolve_symbol(&mut self, name: &str) -> DrtmResult<u64> {
                Err(DrtmError::SymbolNotFound(name.to_string()))
            }
            fn log(&mut self, _text: &str) {}
        }

        let mut bare = Bare;
        let buf = bare.allocate(32).unwrap();
        assert_eq!(buf.len(), 32);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(bare.read_register(0).unwrap(), None);
        assert!(!bare.write_register(0, &[0; 4]).unwrap());
    }
}
