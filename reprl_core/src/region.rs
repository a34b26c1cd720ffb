//! The memory behind the coverage bitmap: a POSIX shared-memory segment named
//! by the supervisor, or a private heap buffer when no segment was provided.

use crate::coverage::CoverageError;
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

/// Size of the whole region, header included.
pub const SHM_SIZE: usize = 0x100000;
const HEADER_LEN: usize = 4;

enum Backing {
    Shared { base: NonNull<AtomicU8>, key: String },
    Heap(Box<[AtomicU8]>),
}

/// A `SHM_SIZE` byte region laid out as a native-endian `u32` edge count
/// followed by the edge bitmap.
pub struct CoverageRegion {
    backing: Backing,
}

// Every access to the mapping goes through `AtomicU8`.
unsafe impl Send for CoverageRegion {}
unsafe impl Sync for CoverageRegion {}

impl CoverageRegion {
    /// Maps the segment named `key`, or allocates a private buffer if `key` is `None`.
    pub fn open(key: Option<&str>) -> Result<Self, CoverageError> {
        match key {
            Some(key) => Self::map_shared(key),
            None => Ok(Self::heap()),
        }
    }

    pub fn heap() -> Self {
        let bytes: Box<[AtomicU8]> = (0..SHM_SIZE).map(|_| AtomicU8::new(0)).collect();
        Self {
            backing: Backing::Heap(bytes),
        }
    }

    pub fn map_shared(key: &str) -> Result<Self, CoverageError> {
        let c_key = CString::new(key).map_err(|_| CoverageError::InvalidKey(key.to_string()))?;

        // SAFETY: `c_key` is a valid NUL-terminated string for the duration of the call.
        let fd = unsafe {
            libc::shm_open(
                c_key.as_ptr(),
                libc::O_RDWR,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(CoverageError::ShmOpen {
                key: key.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        // SAFETY: `fd` is an open descriptor; the result is checked against MAP_FAILED.
        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                SHM_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let mmap_error = io::Error::last_os_error();
        // SAFETY: the mapping, if any, keeps its own reference to the object.
        unsafe { libc::close(fd) };

        if mapping == libc::MAP_FAILED {
            return Err(CoverageError::Mmap {
                key: key.to_string(),
                source: mmap_error,
            });
        }
        let base = NonNull::new(mapping.cast::<AtomicU8>()).ok_or_else(|| CoverageError::Mmap {
            key: key.to_string(),
            source: io::Error::other("mmap returned a null mapping"),
        })?;

        Ok(Self {
            backing: Backing::Shared {
                base,
                key: key.to_string(),
            },
        })
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared { .. })
    }

    pub fn key(&self) -> Option<&str> {
        match &self.backing {
            Backing::Shared { key, .. } => Some(key),
            Backing::Heap(_) => None,
        }
    }

    fn bytes(&self) -> &[AtomicU8] {
        match &self.backing {
            // SAFETY: the mapping is SHM_SIZE bytes long and lives as long as `self`.
            Backing::Shared { base, .. } => unsafe {
                std::slice::from_raw_parts(base.as_ptr(), SHM_SIZE)
            },
            Backing::Heap(bytes) => bytes,
        }
    }

    pub fn edges(&self) -> &[AtomicU8] {
        &self.bytes()[HEADER_LEN..]
    }

    pub fn num_edges(&self) -> u32 {
        let mut header = [0u8; HEADER_LEN];
        for (dst, src) in header.iter_mut().zip(self.bytes()) {
            *dst = src.load(Ordering::Relaxed);
        }
        u32::from_ne_bytes(header)
    }

    pub fn set_num_edges(&self, count: u32) {
        for (dst, src) in self.bytes().iter().zip(count.to_ne_bytes()) {
            dst.store(src, Ordering::Relaxed);
        }
    }

    /// Sets the bit for `index`. Indices past the bitmap are ignored.
    #[inline]
    pub fn set_edge(&self, index: u32) {
        let index = index as usize;
        if let Some(byte) = self.edges().get(index / 8) {
            byte.fetch_or(1 << (index % 8), Ordering::Relaxed);
        }
    }

    pub fn is_edge_set(&self, index: u32) -> bool {
        let index = index as usize;
        self.edges()
            .get(index / 8)
            .is_some_and(|byte| byte.load(Ordering::Relaxed) & (1 << (index % 8)) != 0)
    }

    pub fn count_set_edges(&self) -> usize {
        self.edges()
            .iter()
            .map(|byte| byte.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Zeroes the bitmap, leaving the header alone.
    pub fn clear_edges(&self) {
        for byte in self.edges() {
            byte.store(0, Ordering::Relaxed);
        }
    }
}

impl Drop for CoverageRegion {
    fn drop(&mut self) {
        if let Backing::Shared { base, .. } = self.backing {
            // SAFETY: `base` came from a successful SHM_SIZE mmap and is not used afterwards.
            unsafe { libc::munmap(base.as_ptr().cast(), SHM_SIZE) };
        }
    }
}

impl std::fmt::Debug for CoverageRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageRegion")
            .field("key", &self.key())
            .field("num_edges", &self.num_edges())
            .finish()
    }
}
