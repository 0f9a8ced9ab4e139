//! Register access layer.
//!
//! All GPU register traffic goes through [`RegisterBlock`]. The block is
//! either attached (wrapping the mapped aperture) or inert; an inert block
//! behaves like a zero-length mapping. The raw mapping never leaves this
//! module's wrapper.

use beamsync_pci::MappedRegion;

/// Bounds-checked 32-bit little-endian access to the mapped register
/// aperture.
///
/// Out-of-range accesses are silently neutralized: reads return 0, writes do
/// nothing. No error value, no log line, no panic: this layer is shared
/// with the fast-path interrupt handler, where error reporting and logging
/// are unsafe, and an out-of-range bus access would corrupt unrelated
/// state or fault. The same contract covers the unattached state, which is
/// why a failed attach leaves every dependent operation inert rather than
/// erroring on each call.
pub struct RegisterBlock {
    region: Option<Box<dyn MappedRegion>>,
}

impl RegisterBlock {
    pub fn unattached() -> Self {
        Self { region: None }
    }

    pub fn new(region: Box<dyn MappedRegion>) -> Self {
        Self {
            region: Some(region),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.region.is_some()
    }

    /// Mapped length in bytes; 0 when unattached.
    pub fn len(&self) -> u32 {
        self.region.as_ref().map_or(0, |region| region.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn in_bounds(&self, offset: u32) -> bool {
        let len = self.len();
        len >= 4 && offset <= len - 4
    }

    /// Reads the 32-bit register at byte offset `offset`.
    ///
    /// Returns 0 when unattached or out of range.
    pub fn read32(&self, offset: u32) -> u32 {
        match &self.region {
            Some(region) if self.in_bounds(offset) => region.read_u32(offset),
            _ => 0,
        }
    }

    /// Writes the 32-bit register at byte offset `offset`.
    ///
    /// Ignored when unattached or out of range. The underlying region issues
    /// an I/O barrier after the store, so the write retires before any
    /// subsequent register access.
    pub fn write32(&self, offset: u32, value: u32) {
        if let Some(region) = &self.region {
            if self.in_bounds(offset) {
                region.write_u32(offset, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamsync_pci::region::RamRegion;

    fn block(len: u32) -> RegisterBlock {
        RegisterBlock::new(Box::new(RamRegion::new(len)))
    }

    #[test]
    fn in_range_writes_round_trip() {
        let regs = block(0x100);
        for offset in [0u32, 4, 0x80, 0xFC] {
            regs.write32(offset, offset ^ 0xA5A5_5A5A);
            assert_eq!(regs.read32(offset), offset ^ 0xA5A5_5A5A);
        }
    }

    #[test]
    fn last_word_is_accessible() {
        let regs = block(0x100);
        regs.write32(0xFC, 7);
        assert_eq!(regs.read32(0xFC), 7);
    }

    #[test]
    fn out_of_range_reads_zero_and_writes_are_ignored() {
        let regs = block(0x100);
        regs.write32(0x80, 0x1234);

        assert_eq!(regs.read32(0xFD), 0);
        assert_eq!(regs.read32(0x100), 0);
        assert_eq!(regs.read32(u32::MAX), 0);

        regs.write32(0xFD, 0xFFFF_FFFF);
        regs.write32(0x100, 0xFFFF_FFFF);
        regs.write32(u32::MAX, 0xFFFF_FFFF);
        // Nothing observable changed.
        assert_eq!(regs.read32(0x80), 0x1234);
        assert_eq!(regs.read32(0xFC), 0);
    }

    #[test]
    fn unattached_block_is_inert() {
        let regs = RegisterBlock::unattached();
        assert!(!regs.is_attached());
        assert_eq!(regs.len(), 0);
        assert_eq!(regs.read32(0), 0);
        regs.write32(0, 0xDEAD_BEEF);
        assert_eq!(regs.read32(0), 0);
    }

    #[test]
    fn tiny_mapping_rejects_everything() {
        let regs = block(3);
        assert_eq!(regs.read32(0), 0);
        regs.write32(0, 1);
        assert_eq!(regs.read32(0), 0);
    }
}
