// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

//! Named shared memory segments.
//!
//! Both rendezvous records in the pipeline live in one of these: the
//! collector handshake block (opened by name from an unrelated process) and
//! the bug-report record (created by the parent, mapped by the spawned
//! helper).

use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

fn page_aligned_size(size: usize) -> usize {
    let page_size = page_size::get();
    // round up to nearest page
    ((size - 1) & !(page_size - 1)) + page_size
}

/// A named segment plus the knowledge of whether this process created it.
/// The creating side unlinks the name on drop.
pub struct NamedShm {
    fd: OwnedFd,
    name: String,
    size: usize,
    owner: bool,
}

impl NamedShm {
    /// Creates and sizes a fresh segment. Fails if the name already exists,
    /// so a stale segment from a crashed run must be unlinked first.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        let size = page_aligned_size(size);
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        ftruncate(&fd, size as libc::off_t)?;
        Ok(Self {
            fd,
            name: name.to_owned(),
            size,
            owner: true,
        })
    }

    /// Opens a segment some other process created, adopting its size.
    pub fn open(name: &str) -> io::Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())?;
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fd is open and the stat buffer is valid for the call.
        let rc = unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fstat succeeded, the buffer is initialized.
        let size = unsafe { stat.assume_init() }.st_size as usize;
        Ok(Self {
            fd,
            name: name.to_owned(),
            size,
            owner: false,
        })
    }

    /// Removes the name from the system, for cleaning up after a previous
    /// run. Existing mappings stay valid.
    pub fn unlink(name: &str) -> io::Result<()> {
        match shm_unlink(name) {
            Ok(()) | Err(nix::Error::ENOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Maps the whole segment read/write. The mapping keeps the segment
    /// alive independently of this handle.
    pub fn map(&self) -> io::Result<MappedRegion> {
        // SAFETY: fd is open, size is the page-aligned segment size.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MappedRegion {
            ptr: ptr.cast::<u8>(),
            len: self.size,
        })
    }
}

impl Drop for NamedShm {
    fn drop(&mut self) {
        if self.owner {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

impl std::fmt::Debug for NamedShm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedShm")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.owner)
            .finish()
    }
}

/// A live read/write mapping, unmapped on drop.
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is plain shared memory; all cross-process coordination
// on its contents happens through the protocols layered on top.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe a valid mapping for the region's lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe a valid mapping for the region's lifetime.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}
