//! Secure memory handling for private key buffers.
//!
//! Every private key half lives in a [`SecretBuffer`]: a heap allocation with
//! a stable address that is pinned in physical memory where the platform
//! allows it and overwritten with zeros exactly once, when the buffer drops.
//!
//! Platform differences stay behind the [`MemoryGuard`] capability. The
//! backend is chosen once at build time by [`platform_guard`]; nothing else
//! in the crate looks at the target OS.

use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Capability to pin, unpin and wipe a memory region.
pub trait MemoryGuard: Send + Sync + fmt::Debug {
    /// Ask the OS to keep `buf` resident (no swap). Best effort.
    fn lock(&self, buf: &[u8]) -> io::Result<()>;

    /// Release a previous [`MemoryGuard::lock`].
    fn unlock(&self, buf: &[u8]) -> io::Result<()>;

    /// Overwrite `buf` with zeros. Must not be elided by the optimizer.
    fn zero(&self, buf: &mut [u8]) {
        buf.zeroize();
    }

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// `mlock(2)` / `munlock(2)` backend.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MlockGuard;

#[cfg(unix)]
impl MemoryGuard for MlockGuard {
    fn lock(&self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        // SAFETY: the pointer and length describe a live borrowed slice.
        let rc = unsafe { libc::mlock(buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn unlock(&self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        // SAFETY: the pointer and length describe a live borrowed slice.
        let rc = unsafe { libc::munlock(buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn name(&self) -> &'static str {
        "mlock"
    }
}

/// Backend that never pins memory. Zeroing still happens.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGuard;

impl MemoryGuard for NoopGuard {
    fn lock(&self, _buf: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn unlock(&self, _buf: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// The memory guard for the platform this crate was built for.
pub fn platform_guard() -> Arc<dyn MemoryGuard> {
    #[cfg(unix)]
    {
        Arc::new(MlockGuard)
    }
    #[cfg(not(unix))]
    {
        Arc::new(NoopGuard)
    }
}

/// Fixed-size private key buffer with pin-on-create and zero-on-drop.
///
/// The bytes are written in place by the constructor's fill function, so no
/// intermediate copy of the secret is left on the stack by construction.
pub struct SecretBuffer<const N: usize> {
    bytes: Box<[u8; N]>,
    guard: Arc<dyn MemoryGuard>,
    locked: bool,
}

impl<const N: usize> SecretBuffer<N> {
    /// Allocate a zeroed buffer, fill it with `fill` and pin it.
    ///
    /// If `fill` fails the partially written buffer is wiped before the
    /// error is returned.
    pub fn try_new<E>(
        guard: Arc<dyn MemoryGuard>,
        fill: impl FnOnce(&mut [u8; N]) -> Result<(), E>,
    ) -> Result<Self, E> {
        let mut bytes = Box::new([0u8; N]);
        if let Err(e) = fill(&mut *bytes) {
            guard.zero(bytes.as_mut_slice());
            return Err(e);
        }

        let locked = match guard.lock(bytes.as_slice()) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    backend = guard.name(),
                    error = %e,
                    "Failed to pin key memory; continuing without swap protection"
                );
                false
            }
        };

        Ok(Self {
            bytes,
            guard,
            locked,
        })
    }

    /// Borrow the secret bytes.
    pub(crate) fn expose(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Whether the OS accepted the pin request.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl<const N: usize> Drop for SecretBuffer<N> {
    fn drop(&mut self) {
        // Wipe while still pinned, then release the pin.
        self.guard.zero(self.bytes.as_mut_slice());
        if self.locked {
            if let Err(e) = self.guard.unlock(self.bytes.as_slice()) {
                debug!(backend = self.guard.name(), error = %e, "munlock failed");
            }
        }
    }
}

impl<const N: usize> fmt::Debug for SecretBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBuffer")
            .field("len", &N)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}
