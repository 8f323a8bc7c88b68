//! Exclusive ownership of a kernel input device
//!
//! A [`GrabHandle`] owns the open evdev descriptor and the `EVIOCGRAB`
//! state. While the grab is held the kernel delivers the device's events to
//! this descriptor only.

use crate::error::{RelayError, Result};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{open, Mode, OFlags};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(any(
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc64"
))]
mod ioc {
    pub const WRITE: u32 = 4;
    pub const DIR_SHIFT: u32 = 29;
}

#[cfg(not(any(
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "sparc64"
)))]
mod ioc {
    pub const WRITE: u32 = 1;
    pub const DIR_SHIFT: u32 = 30;
}

/// `_IOW(type, nr, size)` from `<asm-generic/ioctl.h>`
const fn ioc_write(ty: u8, nr: u8, size: usize) -> u32 {
    (ioc::WRITE << ioc::DIR_SHIFT) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

/// `EVIOCGRAB` = `_IOW('E', 0x90, int)`
const EVIOCGRAB: u32 = ioc_write(b'E', 0x90, std::mem::size_of::<libc::c_int>());

fn set_grab(fd: BorrowedFd<'_>, grab: bool) -> io::Result<()> {
    // SAFETY: EVIOCGRAB takes its argument by value and `fd` is a live descriptor.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), EVIOCGRAB as _, libc::c_int::from(grab)) };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// A readable event source whose exclusivity can be given back.
///
/// [`crate::ShutdownCoordinator`] is generic over this.
pub trait ExclusiveSource: AsFd {
    /// Give up exclusivity. Must be idempotent.
    fn release(&mut self);

    /// Whether exclusivity is currently held
    fn is_grabbed(&self) -> bool;
}

/// Handle to an open input device and its exclusive grab
pub struct GrabHandle {
    fd: OwnedFd,
    path: PathBuf,
    grab_active: bool,
}

impl GrabHandle {
    /// Open the device read-only. No grab is attempted.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fd = open(path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty()).map_err(|e| {
            RelayError::Open {
                path: path.to_path_buf(),
                source: e.into(),
            }
        })?;

        Ok(Self {
            fd,
            path: path.to_path_buf(),
            grab_active: false,
        })
    }

    /// Request exclusive delivery of the device's events.
    ///
    /// Fails if another process already holds the grab, if the caller lacks
    /// privilege, or if the descriptor is not an evdev node.
    pub fn acquire(&mut self) -> Result<()> {
        if self.grab_active {
            return Ok(());
        }

        set_grab(self.fd.as_fd(), true).map_err(|source| RelayError::Grab {
            path: self.path.clone(),
            source,
        })?;
        self.grab_active = true;

        tracing::info!(
            device = %self.path.display(),
            fd = self.fd.as_raw_fd(),
            "grabbed input device"
        );
        Ok(())
    }

    /// Relinquish the grab. Safe to call any number of times.
    pub fn release(&mut self) {
        if !self.grab_active {
            return;
        }
        self.grab_active = false;

        // The kernel also drops the grab when the descriptor closes, so a
        // failure here is reported but not fatal.
        match set_grab(self.fd.as_fd(), false) {
            Ok(()) => tracing::info!(device = %self.path.display(), "released input device"),
            Err(e) => tracing::warn!(
                device = %self.path.display(),
                error = %e,
                "failed to release grab, relying on close"
            ),
        }
    }

    /// Whether the exclusive grab is currently held
    #[inline]
    pub fn is_grabbed(&self) -> bool {
        self.grab_active
    }

    /// Path the device was opened from
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for GrabHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl ExclusiveSource for GrabHandle {
    fn release(&mut self) {
        GrabHandle::release(self)
    }

    fn is_grabbed(&self) -> bool {
        self.grab_active
    }
}

impl Drop for GrabHandle {
    fn drop(&mut self) {
        // Release before the descriptor is closed
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evioc_grab_opcode() {
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm"))]
        assert_eq!(EVIOCGRAB, 0x4004_4590);
    }

    #[test]
    fn test_open_missing_device() {
        let err = GrabHandle::open("/nonexistent/evrelay/event0").err().unwrap();
        assert!(matches!(err, RelayError::Open { .. }));
    }

    #[test]
    fn test_acquire_rejects_non_evdev() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut handle = GrabHandle::open(file.path()).unwrap();

        let err = handle.acquire().err().unwrap();
        assert!(matches!(err, RelayError::Grab { .. }));
        assert!(!handle.is_grabbed());

        // Releasing something never grabbed is a no-op
        handle.release();
        handle.release();
        assert!(!handle.is_grabbed());
    }

    /// Needs a real evdev node the caller may grab, e.g.
    /// `EVRELAY_TEST_DEVICE=/dev/input/event3 cargo test -- --ignored`
    #[test]
    #[ignore]
    fn test_grab_is_exclusive_until_released() {
        let Ok(path) = std::env::var("EVRELAY_TEST_DEVICE") else {
            return;
        };

        let mut first = GrabHandle::open(&path).unwrap();
        first.acquire().unwrap();
        assert!(first.is_grabbed());

        let mut second = GrabHandle::open(&path).unwrap();
        assert!(matches!(second.acquire(), Err(RelayError::Grab { .. })));

        first.release();
        assert!(!first.is_grabbed());
        second.acquire().unwrap();
        assert!(second.is_grabbed());

        drop(second);
        let mut third = GrabHandle::open(&path).unwrap();
        third.acquire().unwrap();
    }
}
