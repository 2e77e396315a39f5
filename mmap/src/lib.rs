//! Local files accessed through a shared memory mapping, exposed as the
//! `mmap:` scheme.
//!
//! The whole file is mapped when the stream is opened. Reads and writes copy
//! to and from the mapping; writes never grow the file, so writing past its
//! end yields a short count.

use {
    fs_err::File,
    hfile::{Backend, HFile, Mode, Registry, SchemeHandler, strip_scheme},
    nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap},
    std::{
        ffi::c_void,
        io::{self, ErrorKind, SeekFrom},
        num::NonZeroUsize,
        ptr::NonNull,
        slice,
        sync::Arc,
    },
    tracing::{debug, warn},
};

pub const SCHEME: &str = "mmap";

pub const PRIORITY: u32 = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct MmapHandler;

impl SchemeHandler for MmapHandler {
    #[inline]
    fn open(&self, _registry: &Registry, url: &str, mode: &Mode) -> io::Result<HFile> {
        let path = strip_scheme(url, SCHEME);
        let backend = MmapBackend::open(path, mode)?;
        debug!(path, ?mode, len = backend.len, "mapped file");
        Ok(HFile::new(Box::new(backend), mode.clone()))
    }

    #[inline]
    fn is_remote(&self, _registry: &Registry, _url: &str) -> bool {
        false
    }

    #[inline]
    fn provider(&self) -> &str {
        SCHEME
    }

    #[inline]
    fn priority(&self) -> u32 {
        PRIORITY
    }
}

#[inline]
pub fn plugin_init(registry: &mut Registry) -> io::Result<&'static str> {
    registry.add_scheme_handler(SCHEME, Arc::new(MmapHandler));
    Ok(SCHEME)
}

struct MmapBackend {
    // `None` for an empty file, which cannot be mapped, and after unmapping.
    region: Option<NonNull<c_void>>,
    len: usize,
    pos: usize,
    writable: bool,
    file: File,
}

// SAFETY: the mapping is owned exclusively by this backend and only accessed
// through `&mut self`.
unsafe impl Send for MmapBackend {}

impl MmapBackend {
    fn open(path: &str, mode: &Mode) -> io::Result<Self> {
        let writable = mode.access().can_write();
        // A shared writable mapping needs a descriptor that is also readable.
        let file = mode
            .open_options()
            .read(true)
            .append(false)
            .write(writable)
            .open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("cannot map {path:?}: not a regular file"),
            ));
        }
        let len = usize::try_from(metadata.len())
            .map_err(|err| io::Error::new(ErrorKind::FileTooLarge, err))?;

        let region = match NonZeroUsize::new(len) {
            Some(length) => {
                let prot = if writable {
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
                } else {
                    ProtFlags::PROT_READ
                };
                // SAFETY: a fresh mapping at an address chosen by the kernel
                // does not alias any existing Rust object.
                let ptr = unsafe {
                    mmap(None, length, prot, MapFlags::MAP_SHARED, file.file(), 0)
                }
                .map_err(|errno| {
                    let err = io::Error::from(errno);
                    io::Error::new(err.kind(), format!("failed to map {path:?}: {err}"))
                })?;
                Some(ptr)
            }
            None => None,
        };
        Ok(Self {
            region,
            len,
            pos: 0,
            writable,
            file,
        })
    }

    fn bytes(&self) -> &[u8] {
        match self.region {
            // SAFETY: `ptr` points to a live readable mapping of `len` bytes.
            Some(ptr) => unsafe { slice::from_raw_parts(ptr.cast::<u8>().as_ptr(), self.len) },
            None => &[],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self.region {
            // SAFETY: `ptr` points to a live mapping of `len` bytes, writable
            // because callers check `self.writable`, and `&mut self` makes the
            // slice unique.
            Some(ptr) => unsafe { slice::from_raw_parts_mut(ptr.cast::<u8>().as_ptr(), self.len) },
            None => &mut [],
        }
    }

    fn unmap(&mut self) -> io::Result<()> {
        if let Some(ptr) = self.region.take() {
            // SAFETY: `ptr` and `len` describe a mapping created in `open`,
            // and no slice into it outlives this call.
            unsafe { munmap(ptr, self.len) }?;
        }
        Ok(())
    }
}

impl Backend for MmapBackend {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos;
        let available = self.bytes().get(pos..).unwrap_or_default();
        let n = buf.len().min(available.len());
        if let (Some(dst), Some(src)) = (buf.get_mut(..n), available.get(..n)) {
            dst.copy_from_slice(src);
        }
        self.pos = pos.saturating_add(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(
                ErrorKind::PermissionDenied,
                "mapping is read-only",
            ));
        }
        let pos = self.pos;
        let available = self.bytes_mut().get_mut(pos..).unwrap_or_default();
        let n = buf.len().min(available.len());
        if let (Some(dst), Some(src)) = (available.get_mut(..n), buf.get(..n)) {
            dst.copy_from_slice(src);
        }
        self.pos = pos.saturating_add(n);
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let to_i128 = |value: usize| i128::try_from(value).unwrap_or(i128::MAX);
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => to_i128(self.pos).saturating_add(i128::from(delta)),
            SeekFrom::End(delta) => to_i128(self.len).saturating_add(i128::from(delta)),
        };
        if target < 0 || target > to_i128(self.len) {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("seek to {target} outside of mapping of {} bytes", self.len),
            ));
        }
        let invalid = |err| io::Error::new(ErrorKind::InvalidInput, err);
        self.pos = usize::try_from(target).map_err(invalid)?;
        u64::try_from(self.pos).map_err(invalid)
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        let unmapped = self.unmap();
        if let Err(err) = &unmapped {
            warn!(?err, "failed to unmap file");
        }
        let synced = if self.writable {
            self.file.sync_all()
        } else {
            Ok(())
        };
        unmapped.and(synced)
    }
}

impl Drop for MmapBackend {
    fn drop(&mut self) {
        if let Err(err) = self.unmap() {
            warn!(?err, "failed to unmap file");
        }
    }
}
