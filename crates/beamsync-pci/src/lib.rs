//! Host-environment surface consumed by the beamsync driver.
//!
//! The driver never talks to hardware directly; it is handed an opaque
//! [`BusDevice`] at attach time and receives a [`MappedRegion`] for the
//! register aperture. Production bindings implement these traits over a real
//! PCI stack; the test suite uses [`sim::SimGpuDevice`], a deterministic
//! dual-head GPU model driven by a [`clock::VirtualClock`].

mod bus;
pub mod clock;
pub mod region;
pub mod sim;

pub use bus::{
    BarSlot, BusDevice, FastPathCall, FastPathOutcome, InterruptHandler, IrqLineError, MemoryRange,
};
pub use region::MappedRegion;
