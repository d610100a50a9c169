//! Reading and writing the memory of a live process.
//!
//! Two strategies are provided. `MappedAccessor` maps the process's writable
//! region once and indexes into it; `DirectAccessor` holds nothing open and
//! issues one `process_vm_readv`/`process_vm_writev` per call. Neither
//! synchronizes with the target process, so a read of several fields may see
//! a mix of old and new values if the target is writing at the same time.

pub mod direct;
pub mod mapped;

pub use direct::DirectAccessor;
pub use mapped::MappedAccessor;

use crate::Result;

/// Common interface over the access strategies, addressed by live address.
pub trait MemoryAccess {
    fn read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>>;
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()>;
}

/// Lifecycle of an accessor that holds OS resources.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessorState {
    Closed,
    /// File open and region mapped.
    Mapped,
}
