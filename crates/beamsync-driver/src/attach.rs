//! Device attachment: vendor classification, register-aperture probing and
//! mapping.
//!
//! On the Radeon family the control-register aperture is identified twice,
//! once by its size class among the device's memory ranges and once by the
//! BAR the device declares, and the two must agree exactly before anything is
//! mapped. A disagreement means the hardware/driver report is inconsistent
//! and attaching would be unsafe, so the driver stays inert instead.

use beamsync_pci::{BarSlot, BusDevice, MappedRegion, MemoryRange};
use beamsync_regs as gpuregs;
use tracing::{debug, info, warn};

/// GPU vendor family, classified from the config-space vendor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuFamily {
    /// NVIDIA GeForce: registers live in BAR0, no size-class probing.
    GeForce,
    /// AMD/ATI Radeon: registers live in BAR2, validated by the size filter.
    Radeon,
    /// Unrecognized vendor presenting as this device class; treated by the
    /// Radeon probing rule.
    #[default]
    Unknown,
}

impl GpuFamily {
    pub fn classify(vendor_id: u16) -> Self {
        match vendor_id {
            gpuregs::PCI_VENDOR_ID_NVIDIA => Self::GeForce,
            gpuregs::PCI_VENDOR_ID_ATI | gpuregs::PCI_VENDOR_ID_AMD => Self::Radeon,
            _ => Self::Unknown,
        }
    }

    /// The BAR slot holding the control-register aperture for this family.
    pub fn register_bar(self) -> BarSlot {
        match self {
            Self::GeForce => BarSlot::Bar0,
            Self::Radeon | Self::Unknown => BarSlot::Bar2,
        }
    }

    /// Whether the size-class candidate filter and BAR cross-check apply.
    fn probes_candidates(self) -> bool {
        !matches!(self, Self::GeForce)
    }
}

/// Attachment failure. All variants are non-fatal: the driver stays loaded
/// with an inert register block.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("found {candidates} candidate register ranges, expected exactly one")]
    AmbiguousMapping { candidates: usize },
    #[error("size-filtered candidate disagrees with the BAR-resolved range")]
    CrossCheckMismatch,
    #[error("could not map the register aperture into driver address space")]
    MappingFailed,
}

/// Size class of a control-register aperture: strictly larger than the 4 KiB
/// legacy/config blocks, no larger than 64 KiB. Framebuffer and command-FIFO
/// ranges are far bigger.
fn is_register_block_candidate(range: &MemoryRange) -> bool {
    range.len > 0x1000 && range.len <= 0x1_0000
}

/// Probes `dev` and maps its register aperture.
///
/// Returns the classified family alongside the mapping and the validated
/// physical range. Every failure leaves the device untouched apart from
/// memory decode having been enabled.
pub(crate) fn probe_and_map(
    dev: &mut dyn BusDevice,
) -> Result<(GpuFamily, Box<dyn MappedRegion>, MemoryRange), AttachError> {
    let vendor_id = dev.read_config_u16(gpuregs::PCI_CONFIG_VENDOR_ID);
    let family = GpuFamily::classify(vendor_id);
    let bar = family.register_bar();
    match family {
        GpuFamily::GeForce => info!(vendor_id, "vendor id matches NVIDIA, assuming GeForce"),
        GpuFamily::Radeon => info!(vendor_id, "vendor id matches AMD/ATI, assuming Radeon"),
        GpuFamily::Unknown => {
            info!(vendor_id, "unrecognized vendor id, using the Radeon probing rule")
        }
    }

    dev.enable_memory();

    let declared = dev.bar_range(bar);
    let range = if family.probes_candidates() {
        let mut candidates = Vec::new();
        for (index, range) in dev.memory_ranges().into_iter().enumerate() {
            debug!(index, base = format_args!("{:#x}", range.base), len = range.len, "memory range");
            if is_register_block_candidate(&range) {
                debug!(index, "range is a register block candidate");
                candidates.push(range);
            }
        }

        if candidates.len() != 1 {
            warn!(
                candidates = candidates.len(),
                "register block probe is ambiguous, refusing to attach"
            );
            return Err(AttachError::AmbiguousMapping {
                candidates: candidates.len(),
            });
        }

        // The single size-filtered candidate must be exactly the range the
        // device's BAR declares, or some report is lying.
        let candidate = candidates[0];
        match declared {
            Some(declared) if declared == candidate => candidate,
            _ => {
                warn!(
                    candidate_base = format_args!("{:#x}", candidate.base),
                    "candidate does not match the BAR-declared range, refusing to attach"
                );
                return Err(AttachError::CrossCheckMismatch);
            }
        }
    } else {
        // GeForce: trust BAR0 outright; the full range is the register window.
        declared.ok_or(AttachError::MappingFailed)?
    };

    let region = dev.map_bar(bar).ok_or_else(|| {
        warn!("could not map the register aperture, refusing to attach");
        AttachError::MappingFailed
    })?;

    info!(
        base = format_args!("{:#x}", range.base),
        len = range.len,
        "register aperture mapped"
    );
    Ok((family, region, range))
}
