//! # Process-Shared Robust Mutex
//!
//! The lock-file header embeds two pthread mutexes shared by every
//! process attached to the environment: one guarding reader-slot claims,
//! one serializing writers. Both are initialized `PTHREAD_PROCESS_SHARED`
//! and `PTHREAD_MUTEX_ROBUST`, so when a holder dies the next acquirer
//! gets `EOWNERDEAD` instead of deadlocking.
//!
//! Owner-death is surfaced as a first-class state, not an error: `lock`
//! returns [`LockState::OwnerDied`] and the caller must repair whatever
//! the dead holder was protecting, then call `mark_consistent` before
//! unlocking. Unlocking without marking makes the mutex permanently
//! unusable, which is the pthread-mandated fail-safe.

use std::cell::UnsafeCell;
use std::io;

use eyre::{bail, Result, WrapErr};

/// Outcome of a successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Acquired,
    /// The previous holder died while holding the lock. The protected
    /// state may be mid-update; the caller owns the repair.
    OwnerDied,
}

/// A pthread mutex living in shared, memory-mapped memory.
#[repr(C)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread process-shared mutexes are designed for exactly this:
// concurrent lock/unlock from multiple threads and processes through a
// shared mapping. All access goes through the pthread calls below.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

fn check(rc: libc::c_int, what: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc)).wrap_err_with(|| what.to_string())
    }
}

impl SharedMutex {
    /// Initialize the mutex bytes in place.
    ///
    /// # Safety
    /// `this` must point at writable shared memory of at least
    /// `size_of::<SharedMutex>()` bytes, and the caller must hold the
    /// exclusive lock-file lock so no other process is using the region.
    pub unsafe fn init(this: *mut SharedMutex) -> Result<()> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        check(libc::pthread_mutexattr_init(&mut attr), "mutexattr_init failed")?;
        let rc = (|| {
            check(
                libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
                "mutexattr_setpshared failed",
            )?;
            check(
                libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST),
                "mutexattr_setrobust failed",
            )?;
            check(
                libc::pthread_mutex_init((*this).inner.get(), &attr),
                "mutex_init failed",
            )
        })();
        libc::pthread_mutexattr_destroy(&mut attr);
        rc
    }

    /// Block until the mutex is held. Reports a dead previous owner
    /// instead of failing; any other error is unrecoverable corruption of
    /// the lock region.
    pub fn lock(&self) -> Result<LockState> {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        match rc {
            0 => Ok(LockState::Acquired),
            libc::EOWNERDEAD => Ok(LockState::OwnerDied),
            libc::ENOTRECOVERABLE => bail!("shared mutex is unrecoverable; reopen the environment"),
            other => Err(io::Error::from_raw_os_error(other)).wrap_err("mutex lock failed"),
        }
    }

    /// Declare the protected state repaired after an `OwnerDied`
    /// acquisition.
    pub fn mark_consistent(&self) -> Result<()> {
        check(
            unsafe { libc::pthread_mutex_consistent(self.inner.get()) },
            "mutex_consistent failed",
        )
    }

    pub fn unlock(&self) {
        // Failure here means we did not hold the lock, which is a logic
        // error on our side; nothing useful to report to the caller.
        unsafe {
            libc::pthread_mutex_unlock(self.inner.get());
        }
    }
}
