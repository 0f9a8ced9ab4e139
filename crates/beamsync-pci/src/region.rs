//! Mapped register apertures.
//!
//! A [`MappedRegion`] is what a [`crate::BusDevice`] hands back for a mapped
//! BAR: a window of device registers addressed by byte offset. Values are
//! 32-bit little-endian words regardless of host endianness. Accesses take
//! `&self` because MMIO is not host memory; implementations that need
//! interior state use their own synchronization.

use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};
use std::sync::Mutex;

/// A mapped window of device registers.
///
/// Callers are expected to stay in bounds (`offset + 4 <= len`); the driver's
/// register access layer enforces that before calling in. Implementations may
/// treat out-of-bounds access as a programming error.
pub trait MappedRegion: Send + Sync {
    /// Length of the mapped window in bytes.
    fn len(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the little-endian 32-bit word at `offset`.
    fn read_u32(&self, offset: u32) -> u32;

    /// Writes the little-endian 32-bit word at `offset`.
    ///
    /// The write must retire before any subsequent register access returns
    /// (post-write I/O barrier).
    fn write_u32(&self, offset: u32, value: u32);
}

/// Plain RAM-backed region, used as a simulated register block in tests.
#[derive(Debug)]
pub struct RamRegion {
    bytes: Mutex<Vec<u8>>,
}

impl RamRegion {
    pub fn new(len: u32) -> Self {
        Self {
            bytes: Mutex::new(vec![0; len as usize]),
        }
    }
}

impl MappedRegion for RamRegion {
    fn len(&self) -> u32 {
        self.bytes.lock().unwrap().len() as u32
    }

    fn read_u32(&self, offset: u32) -> u32 {
        let bytes = self.bytes.lock().unwrap();
        let at = offset as usize;
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[at..at + 4]);
        u32::from_le_bytes(word)
    }

    fn write_u32(&self, offset: u32, value: u32) {
        let mut bytes = self.bytes.lock().unwrap();
        let at = offset as usize;
        bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Region over a raw pointer into memory-mapped I/O space.
///
/// This is the production binding: byte-wise volatile access (so no alignment
/// assumptions leak into the bus transaction) with a sequentially-consistent
/// fence after every write, matching the register layer's ordering contract.
/// The raw address never escapes this type.
pub struct VolatileRegion {
    base: NonNull<u8>,
    len: u32,
}

// The region is a window onto device registers, not host memory; the device
// serializes individual bus transactions.
unsafe impl Send for VolatileRegion {}
unsafe impl Sync for VolatileRegion {}

impl VolatileRegion {
    /// Wraps a mapped MMIO window.
    ///
    /// # Safety
    ///
    /// `base` must point to a live mapping of at least `len` bytes that
    /// remains valid for the lifetime of the region, and nothing else may
    /// unmap it while the region exists.
    pub unsafe fn from_raw(base: NonNull<u8>, len: u32) -> Self {
        Self { base, len }
    }
}

impl MappedRegion for VolatileRegion {
    fn len(&self) -> u32 {
        self.len
    }

    fn read_u32(&self, offset: u32) -> u32 {
        debug_assert!(offset.checked_add(4).is_some_and(|end| end <= self.len));
        let mut word = [0u8; 4];
        for (i, byte) in word.iter_mut().enumerate() {
            // SAFETY: in bounds per the from_raw contract and the assert above.
            *byte = unsafe { self.base.as_ptr().add(offset as usize + i).read_volatile() };
        }
        u32::from_le_bytes(word)
    }

    fn write_u32(&self, offset: u32, value: u32) {
        debug_assert!(offset.checked_add(4).is_some_and(|end| end <= self.len));
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            // SAFETY: in bounds per the from_raw contract and the assert above.
            unsafe {
                self.base.as_ptr().add(offset as usize + i).write_volatile(byte);
            }
        }
        // CPU <-> device ordering: the store retires before any later access.
        fence(Ordering::SeqCst);
    }
}
