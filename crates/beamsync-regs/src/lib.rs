#![forbid(unsafe_code)]

//! Register offsets, status bits and PCI identifiers for the GPU families
//! modeled by the beamsync driver.
//!
//! Only two display-engine generations are described: the Radeon R500/AVIVO
//! display block (the primary target) and the GeForce G80 display command
//! FIFO (used by the dither-mode path). Offsets are byte offsets into the
//! control-register aperture; all registers are 32-bit little-endian.

use bitflags::bitflags;

/// PCI vendor id read from config-space offset 0.
pub const PCI_VENDOR_ID_NVIDIA: u16 = 0x10DE;
pub const PCI_VENDOR_ID_ATI: u16 = 0x1002;
pub const PCI_VENDOR_ID_AMD: u16 = 0x1022;

/// Config-space offset of the vendor id register.
pub const PCI_CONFIG_VENDOR_ID: u16 = 0x00;

// Radeon R500 interrupt block.

/// General interrupt control register.
pub const R500_GEN_INT_CNTL: u32 = 0x0040;
/// General interrupt status register (write-1-to-clear).
pub const R500_GEN_INT_STATUS: u32 = 0x0044;
/// Per-display-pipe interrupt status sub-register.
pub const R500_DISP_INTERRUPT_STATUS: u32 = 0x7EDC;
/// Pipe 0 VBLANK status-clear register.
pub const R500_D1MODE_VBLANK_STATUS: u32 = 0x6534;
/// Pipe 1 VBLANK status-clear register.
pub const R500_D2MODE_VBLANK_STATUS: u32 = 0x6D34;
/// Acknowledge value written to the `DxMODE_VBLANK_STATUS` registers.
pub const R500_VBLANK_ACK: u32 = 1 << 4;

bitflags! {
    /// Bits of [`R500_GEN_INT_STATUS`] the driver cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GenIntStatus: u32 {
        /// At least one display-class interrupt is pending.
        const DISPLAY = 1 << 0;
    }
}

bitflags! {
    /// Bits of [`R500_DISP_INTERRUPT_STATUS`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DispIntStatus: u32 {
        const D1_VBLANK = 1 << 4;
        const D2_VBLANK = 1 << 5;
    }
}

// Radeon AVIVO CRTC block (per-head scan-out timing/state).

/// Raw vertical beam position, head 0 / head 1.
pub const D1CRTC_STATUS_POSITION: u32 = 0x60A0;
pub const D2CRTC_STATUS_POSITION: u32 = 0x68A0;
/// Vertical total scanline count, head 0 / head 1.
pub const D1CRTC_V_TOTAL: u32 = 0x6020;
pub const D2CRTC_V_TOTAL: u32 = 0x6820;
/// Vertical blank start (low 16 bits) and end (high 16 bits), head 0 / head 1.
pub const D1CRTC_V_BLANK_START_END: u32 = 0x6024;
pub const D2CRTC_V_BLANK_START_END: u32 = 0x6824;
/// Scan-converter master enable bitmask: bit 0 gates head 0, bit 1 head 1.
pub const DC_CRTC_MASTER_ENABLE: u32 = 0x60F8;

/// Width mask of the vertical beam position fields.
pub const BEAM_POSITION_MASK: u32 = 0x1FFF;

/// Number of display heads modeled per device.
pub const HEAD_COUNT: usize = 2;

/// Beam position register for `head` (0 or 1).
pub const fn crtc_status_position(head: usize) -> u32 {
    if head == 0 {
        D1CRTC_STATUS_POSITION
    } else {
        D2CRTC_STATUS_POSITION
    }
}

/// Vertical-total register for `head`.
pub const fn crtc_v_total(head: usize) -> u32 {
    if head == 0 {
        D1CRTC_V_TOTAL
    } else {
        D2CRTC_V_TOTAL
    }
}

/// Vertical-blank start/end register for `head`.
pub const fn crtc_v_blank_start_end(head: usize) -> u32 {
    if head == 0 {
        D1CRTC_V_BLANK_START_END
    } else {
        D2CRTC_V_BLANK_START_END
    }
}

/// VBLANK status-clear register for `head`.
pub const fn mode_vblank_status(head: usize) -> u32 {
    if head == 0 {
        R500_D1MODE_VBLANK_STATUS
    } else {
        R500_D2MODE_VBLANK_STATUS
    }
}

// GeForce G80 display command FIFO (dither-mode path).

/// Display FIFO command address/trigger register; bit 31 is the busy flag.
pub const G80_DISP_COMMAND: u32 = 0x0061_0300;
/// Display FIFO command data register.
pub const G80_DISP_COMMAND_DATA: u32 = 0x0061_0304;
/// Supervisor interrupt status; bits 4..=6 select the pending phase.
pub const G80_DISP_SUPERVISOR: u32 = 0x0061_0024;
/// Supervisor acknowledge register.
pub const G80_DISP_SUPERVISOR_ACK: u32 = 0x0061_0030;
/// Per-head CRTC state, stride 0x800 (probe side).
pub const G80_CRTC_STATE: u32 = 0x0061_4200;
/// Flag bits or'ed into every FIFO command address write.
pub const G80_DISP_COMMAND_KICK: u32 = 0x8001_0001;
/// Busy bit polled for FIFO command completion.
pub const G80_DISP_COMMAND_BUSY: u32 = 0x8000_0000;
/// Per-head dither control method, stride 0x400.
pub const G80_HEAD_DITHER_CONTROL: u32 = 0x0000_08A0;
/// FIFO update/commit method.
pub const G80_UPDATE: u32 = 0x0000_0080;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_head_register_selection() {
        assert_eq!(crtc_status_position(0), D1CRTC_STATUS_POSITION);
        assert_eq!(crtc_status_position(1), D2CRTC_STATUS_POSITION);
        assert_eq!(mode_vblank_status(1), R500_D2MODE_VBLANK_STATUS);
        assert_eq!(crtc_v_total(1), D2CRTC_V_TOTAL);
        assert_eq!(crtc_v_blank_start_end(0), D1CRTC_V_BLANK_START_END);
    }

    #[test]
    fn status_bits_are_distinct() {
        assert_eq!(
            (DispIntStatus::D1_VBLANK & DispIntStatus::D2_VBLANK),
            DispIntStatus::empty()
        );
        assert!(GenIntStatus::from_bits_retain(0x1).contains(GenIntStatus::DISPLAY));
    }
}
