//! Access through a shared mapping of `/proc/<pid>/mem`.

use super::{AccessorState, MemoryAccess};
use crate::procmaps::ProcessImageLocation;
use crate::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// A window onto a process's writable region.
///
/// The mapping is shared, so writes land in the target immediately and the
/// target's own writes show up in later reads. There is nothing to flush.
///
/// Dropping the accessor closes it.
#[derive(Debug)]
pub struct MappedAccessor {
    location: ProcessImageLocation,
    file: Option<File>,
    map: Option<MmapMut>,
}

impl MappedAccessor {
    /// Creates a closed accessor for `location`.
    pub fn new(location: &ProcessImageLocation) -> Self {
        Self {
            location: *location,
            file: None,
            map: None,
        }
    }

    /// Opens and maps the writable region of the process at `location`.
    pub fn open(location: &ProcessImageLocation) -> Result<Self> {
        let mut accessor = Self::new(location);
        accessor.map_file(format!("/proc/{}/mem", location.process_id))?;
        Ok(accessor)
    }

    /// Maps the writable region out of `path`, a file whose offsets are
    /// addresses in the target. Anything already open is closed first.
    ///
    /// On failure the accessor is left closed.
    pub fn map_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.close();

        let path = path.as_ref();
        let size = self.location.writable_len();
        if size == 0 {
            return Err(Error::ImageNotFound {
                pid: self.location.process_id,
                binary: path.display().to_string(),
            });
        }
        let len = usize::try_from(size).map_err(|_| Error::OutOfRange {
            addr: self.location.writable_region_start,
            len: usize::MAX,
            start: self.location.writable_region_start,
            end: self.location.writable_region_end,
        })?;

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // Safety: the mapping is of another process's memory (or a file that
        // stands in for it); its contents can change under us at any time, so
        // it is only ever accessed by copying bytes in and out.
        let map = unsafe {
            MmapOptions::new()
                .offset(self.location.writable_region_start)
                .len(len)
                .map_mut(&file)
        };
        let map = match map {
            Ok(m) => m,
            Err(e) => {
                drop(file);
                return Err(e.into());
            }
        };

        self.file = Some(file);
        self.map = Some(map);
        tracing::info!(
            pid = self.location.process_id,
            path = %path.display(),
            len,
            "mapped writable region"
        );
        Ok(())
    }

    pub fn state(&self) -> AccessorState {
        if self.map.is_some() {
            AccessorState::Mapped
        } else {
            AccessorState::Closed
        }
    }

    /// Converts a live address range to a range of indices into the map.
    fn window(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let map = self.map.as_ref().ok_or(Error::NotOpen)?;
        let out_of_range = || Error::OutOfRange {
            addr,
            len,
            start: self.location.writable_region_start,
            end: self.location.writable_region_end,
        };
        let index = addr
            .checked_sub(self.location.writable_region_start)
            .and_then(|i| usize::try_from(i).ok())
            .ok_or_else(out_of_range)?;
        let end = index.checked_add(len).ok_or_else(out_of_range)?;
        if end > map.len() {
            return Err(out_of_range());
        }
        Ok(index..end)
    }

    /// Copies `len` bytes starting at live address `addr`.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let range = self.window(addr, len)?;
        let map = self.map.as_ref().ok_or(Error::NotOpen)?;
        Ok(map[range].to_vec())
    }

    /// Copies `data` into the target starting at live address `addr`.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let range = self.window(addr, data.len())?;
        let map = self.map.as_mut().ok_or(Error::NotOpen)?;
        map[range].copy_from_slice(data);
        Ok(())
    }

    /// Reads a native-endian `i32`.
    pub fn read_i32(&self, addr: u64) -> Result<i32> {
        let range = self.window(addr, 4)?;
        let map = self.map.as_ref().ok_or(Error::NotOpen)?;
        let mut b = [0; 4];
        b.copy_from_slice(&map[range]);
        Ok(i32::from_ne_bytes(b))
    }

    /// Unmaps and closes whatever is open. Safe to call any number of times.
    pub fn close(&mut self) {
        let was = self.state();
        // Unmap before closing the file it came from.
        drop(self.map.take());
        drop(self.file.take());
        if was != AccessorState::Closed {
            tracing::debug!(pid = self.location.process_id, "closed mapping");
        }
    }
}

impl Drop for MappedAccessor {
    fn drop(&mut self) {
        self.close();
    }
}

impl MemoryAccess for MappedAccessor {
    fn read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.read_bytes(addr, len)
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.write_bytes(addr, data)
    }
}
