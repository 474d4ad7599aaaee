// SPDX-License-Identifier: MPL-2.0

//! OS-specific or OS-dependent APIs.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

pub use hashbrown::{HashMap, HashSet};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

use crate::prelude::*;

pub type MutexGuard<'a, T> = std::sync::MutexGuard<'a, T>;

/// A mutex whose `lock` does not force the caller to deal with poisoning.
///
/// A thread that panicked while holding the lock leaves the protected data
/// in whatever state it was in; subsequent callers just keep going.
pub struct Mutex<T: ?Sized>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
    pub const fn new(t: T) -> Self {
        Self(std::sync::Mutex::new(t))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.0
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A condition variable paired with [`Mutex`].
pub struct Condvar(std::sync::Condvar);

impl Condvar {
    pub const fn new() -> Self {
        Self(std::sync::Condvar::new())
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.0
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn notify_one(&self) {
        self.0.notify_one();
    }

    pub fn notify_all(&self) {
        self.0.notify_all();
    }
}

/// Fills `dest` with cryptographically secure random bytes.
pub fn fill_random(dest: &mut [u8]) {
    OsRng.fill_bytes(dest);
}

/// Returns a cryptographically secure random `u32`.
pub fn random_u32() -> u32 {
    OsRng.next_u32()
}

/// A heap allocation for secret bytes.
///
/// The allocation is locked into RAM so it does not get swapped to disk,
/// and is zeroed before being freed. Locking is best effort: if `mlock`
/// is unavailable or the lock quota is exhausted, the bytes stay usable
/// and a warning is logged once per allocation.
pub struct LockedBytes {
    bytes: Box<[u8]>,
    locked: bool,
}

static MLOCK_WARNED: AtomicBool = AtomicBool::new(false);

impl LockedBytes {
    pub fn new_zeroed(len: usize) -> Self {
        let bytes = vec![0u8; len].into_boxed_slice();
        let locked = lock_memory(&bytes);
        Self { bytes, locked }
    }

    pub fn from_slice(src: &[u8]) -> Self {
        let mut new_self = Self::new_zeroed(src.len());
        new_self.bytes.copy_from_slice(src);
        new_self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for LockedBytes {
    fn drop(&mut self) {
        self.bytes.zeroize();
        if self.locked {
            unsafe {
                libc::munlock(self.bytes.as_ptr() as *const libc::c_void, self.bytes.len());
            }
        }
    }
}

impl fmt::Debug for LockedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        f.debug_struct("LockedBytes")
            .field("len", &self.bytes.len())
            .field("locked", &self.locked)
            .finish()
    }
}

fn lock_memory(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let ret = unsafe { libc::mlock(bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    if ret != 0 && !MLOCK_WARNED.swap(true, Ordering::Relaxed) {
        warn!("failed to lock secret memory into RAM; it may be swapped to disk");
    }
    ret == 0
}

#[cfg(test)]
mod tests {
    use super::LockedBytes;

    #[test]
    fn locked_bytes_holds_data() {
        let mut bytes = LockedBytes::new_zeroed(32);
        assert_eq!(bytes.as_slice(), &[0u8; 32]);
        bytes.as_mut_slice()[0] = 0xAB;
        assert_eq!(bytes.as_slice()[0], 0xAB);
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn from_slice_copies() {
        let bytes = LockedBytes::from_slice(&[1, 2, 3]);
        assert_eq!(bytes.as_slice(), &[1, 2, 3]);
    }
}
