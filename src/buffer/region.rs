//! Raw shared region and its single-byte lock.
//!
//! The region is a boxed slice of `AtomicU8`, so every holder can read and
//! write without `unsafe`. Data bytes use relaxed ordering; the lock byte's
//! acquire/release pair is what publishes a completed write to the next
//! holder.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::layout::LOCK_OFFSET;
use crate::error::BufferError;

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;

/// Longest single park before re-checking the lock byte.
const PARK_SLICE: Duration = Duration::from_millis(10);

pub(crate) struct Region {
    bytes: Box<[AtomicU8]>,
    park: Mutex<()>,
    wake: Condvar,
    destroyed: AtomicBool,
}

impl Region {
    pub(crate) fn zeroed(len: usize) -> Self {
        let bytes = (0..len).map(|_| AtomicU8::new(0)).collect::<Vec<_>>();
        Self {
            bytes: bytes.into_boxed_slice(),
            park: Mutex::new(()),
            wake: Condvar::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), BufferError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(BufferError::Corrupted(format!(
                "access {offset}..{} outside region of {} bytes",
                offset.saturating_add(len),
                self.bytes.len()
            ))),
        }
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> Result<(), BufferError> {
        self.check_bounds(offset, data.len())?;
        for (cell, byte) in self.bytes[offset..offset + data.len()].iter().zip(data) {
            cell.store(*byte, Ordering::Relaxed);
        }
        Ok(())
    }

    pub(crate) fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, BufferError> {
        self.check_bounds(offset, len)?;
        Ok(self.bytes[offset..offset + len]
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect())
    }

    pub(crate) fn read_byte(&self, offset: usize) -> Result<u8, BufferError> {
        self.check_bounds(offset, 1)?;
        Ok(self.bytes[offset].load(Ordering::Relaxed))
    }

    pub(crate) fn write_byte(&self, offset: usize, value: u8) -> Result<(), BufferError> {
        self.check_bounds(offset, 1)?;
        self.bytes[offset].store(value, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn fill(&self, offset: usize, len: usize, value: u8) -> Result<(), BufferError> {
        self.check_bounds(offset, len)?;
        for cell in &self.bytes[offset..offset + len] {
            cell.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    fn lock_cell(&self) -> &AtomicU8 {
        &self.bytes[LOCK_OFFSET]
    }

    /// Whether the lock byte is currently held by anyone.
    pub(crate) fn is_locked(&self) -> bool {
        self.lock_cell().load(Ordering::Acquire) == LOCKED
    }

    /// Acquire the lock byte, parking between attempts, for at most `timeout`.
    pub(crate) fn lock(&self, timeout: Duration) -> Result<RegionGuard<'_>, BufferError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .lock_cell()
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(RegionGuard { region: self });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BufferError::LockTimeout(timeout));
            }

            // Re-check under the park mutex so a release between the failed
            // CAS and the wait cannot be missed.
            let mut parked = self.park.lock();
            if self.lock_cell().load(Ordering::Acquire) == LOCKED {
                let slice = (deadline - now).min(PARK_SLICE);
                self.wake.wait_for(&mut parked, slice);
            }
        }
    }

    fn unlock(&self) {
        self.lock_cell().store(UNLOCKED, Ordering::Release);
        let _parked = self.park.lock();
        self.wake.notify_all();
    }
}

/// Holds the region lock until dropped.
pub(crate) struct RegionGuard<'a> {
    region: &'a Region,
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.region.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn read_write_roundtrip() {
        let region = Region::zeroed(64);
        region.write(40, &[1, 2, 3]).unwrap();
        assert_eq!(region.read(40, 3).unwrap(), vec![1, 2, 3]);
        assert!(region.write(62, &[1, 2, 3]).is_err());
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let region = Region::zeroed(64);
        let guard = region.lock(Duration::from_millis(50)).unwrap();
        assert!(region.is_locked());
        assert!(matches!(
            region.lock(Duration::from_millis(20)),
            Err(BufferError::LockTimeout(_))
        ));
        drop(guard);
        assert!(!region.is_locked());
        assert!(region.lock(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn waiter_wakes_after_release() {
        let region = Arc::new(Region::zeroed(64));
        let guard = region.lock(Duration::from_millis(50)).unwrap();

        let contender = Arc::clone(&region);
        let handle = std::thread::spawn(move || {
            let _g = contender.lock(Duration::from_secs(2)).unwrap();
            contender.read_byte(40).unwrap()
        });

        region.write_byte(40, 9).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        drop(guard);

        assert_eq!(handle.join().unwrap(), 9);
    }
}
