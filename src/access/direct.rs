//! Access through `process_vm_readv` and `process_vm_writev`.

use super::MemoryAccess;
use crate::procmaps::ProcessImageLocation;
use crate::{Error, Result};
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;
use std::io::{IoSlice, IoSliceMut};

/// Stateless accessor: every call is one system call, nothing is held open in
/// between.
///
/// Failures of the call itself (the process is gone, permission denied, range
/// not mapped in the target) come back as `Error::Io`. A call that moves some
/// but not all of the bytes is `Error::ShortTransfer`; retrying the rest is up
/// to the caller.
#[derive(Copy, Clone, Debug)]
pub struct DirectAccessor {
    pid: Pid,
}

impl DirectAccessor {
    pub fn new(location: &ProcessImageLocation) -> Result<Self> {
        Self::for_pid(location.process_id)
    }

    /// Fails with `ProcessNotFound` if `pid` is outside the kernel's pid range.
    pub fn for_pid(pid: u32) -> Result<Self> {
        let raw = nix::libc::pid_t::try_from(pid)
            .map_err(|_| Error::ProcessNotFound(pid.to_string()))?;
        Ok(Self {
            pid: Pid::from_raw(raw),
        })
    }

    fn remote(addr: u64, len: usize) -> Result<[RemoteIoVec; 1]> {
        let base = usize::try_from(addr).map_err(|_| Error::OutOfRange {
            addr,
            len,
            start: 0,
            end: usize::MAX as u64,
        })?;
        Ok([RemoteIoVec { base, len }])
    }

    /// Fills `buf` from live address `addr`.
    pub fn read_into(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let requested = buf.len();
        let remote = Self::remote(addr, requested)?;
        let transferred =
            process_vm_readv(self.pid, &mut [IoSliceMut::new(buf)], &remote)?;
        if transferred != requested {
            return Err(Error::ShortTransfer {
                addr,
                requested,
                transferred,
            });
        }
        Ok(())
    }

    /// Reads `len` bytes at live address `addr`.
    pub fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }

    /// Writes `data` at live address `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let requested = data.len();
        let remote = Self::remote(addr, requested)?;
        let transferred =
            process_vm_writev(self.pid, &[IoSlice::new(data)], &remote)?;
        if transferred != requested {
            return Err(Error::ShortTransfer {
                addr,
                requested,
                transferred,
            });
        }
        Ok(())
    }
}

impl MemoryAccess for DirectAccessor {
    fn read(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        DirectAccessor::read(self, addr, len)
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        DirectAccessor::write(self, addr, data)
    }
}
