use std::sync::Arc;

use crate::region::MappedRegion;

/// A physical memory range exposed by a bus device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: u64,
    pub len: u64,
}

impl MemoryRange {
    pub const fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    pub fn end_exclusive(&self) -> u64 {
        self.base.saturating_add(self.len)
    }
}

/// PCI base-address-register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarSlot {
    Bar0,
    Bar1,
    Bar2,
    Bar3,
    Bar4,
    Bar5,
}

impl BarSlot {
    pub const fn index(self) -> u8 {
        match self {
            Self::Bar0 => 0,
            Self::Bar1 => 1,
            Self::Bar2 => 2,
            Self::Bar3 => 3,
            Self::Bar4 => 4,
            Self::Bar5 => 5,
        }
    }

    /// Config-space byte offset of this BAR (0x10 + 4 * index).
    pub const fn config_offset(self) -> u16 {
        0x10 + 4 * self.index() as u16
    }
}

/// How the fast-path interrupt handler was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathCall {
    /// A real hardware interrupt on the registered line. The handler runs in
    /// primary interrupt context: no blocking, no allocation, no logging.
    Interrupt,
    /// Diagnostic counter-flush convention. Only ever issued from regular
    /// (non-interrupt) context, so the handler may log on this branch.
    CounterFlush,
}

/// Fast-path handler verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathOutcome {
    /// Fully handled; the deferred role must not be scheduled.
    DoNotEscalate,
    /// Schedule the deferred (full-service) role.
    Escalate,
}

/// The two callback roles of an interrupt hookup.
///
/// `fast_path` stands in for the primary interrupt vector; `deferred` for the
/// cooperative work-scheduling context that runs with full services when the
/// fast path escalates.
pub trait InterruptHandler: Send + Sync {
    fn fast_path(&self, call: FastPathCall) -> FastPathOutcome;

    fn deferred(&self) {}
}

/// Interrupt line control failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IrqLineError {
    #[error("interrupt line {0} is not present on this device")]
    NoSuchLine(u32),
    #[error("interrupt line {line}: {op} refused")]
    Refused { line: u32, op: &'static str },
}

/// Opaque bus device handed to the driver by the host environment.
///
/// Shaped after the IOKit/PCI provider contract: configuration-space access,
/// memory-range enumeration, BAR resolution and mapping, and interrupt line
/// control with handler registration.
pub trait BusDevice {
    /// Reads a 16-bit configuration-space register.
    fn read_config_u16(&self, offset: u16) -> u16;

    /// Enables memory decode / bus mastering on the device.
    fn enable_memory(&mut self);

    /// All memory ranges the device exposes, in slot order.
    fn memory_ranges(&self) -> Vec<MemoryRange>;

    /// Resolves the range declared by a specific BAR slot, if any.
    fn bar_range(&self, slot: BarSlot) -> Option<MemoryRange>;

    /// Maps the range declared by `slot` into driver-addressable space.
    ///
    /// Returns `None` when the slot is empty or the mapping fails. Dropping
    /// the returned region releases the mapping.
    fn map_bar(&mut self, slot: BarSlot) -> Option<Box<dyn MappedRegion>>;

    fn disable_interrupt(&mut self, line: u32) -> Result<(), IrqLineError>;

    fn enable_interrupt(&mut self, line: u32) -> Result<(), IrqLineError>;

    /// Registers `handler` for both callback roles on `line`.
    ///
    /// Fails if another handler still owns the line.
    fn register_interrupt(
        &mut self,
        line: u32,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<(), IrqLineError>;

    /// Detaches whatever handler currently owns `line`.
    fn unregister_interrupt(&mut self, line: u32) -> Result<(), IrqLineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_slot_config_offsets() {
        assert_eq!(BarSlot::Bar0.config_offset(), 0x10);
        assert_eq!(BarSlot::Bar2.config_offset(), 0x18);
        assert_eq!(BarSlot::Bar5.config_offset(), 0x24);
    }

    #[test]
    fn memory_range_end() {
        let range = MemoryRange::new(0x9000_0000, 0x10000);
        assert_eq!(range.end_exclusive(), 0x9001_0000);
    }
}
