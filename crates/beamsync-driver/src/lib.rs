//! Low-level dual-head GPU timing driver.
//!
//! The driver attaches to a display adapter over the [`beamsync_pci`] bus
//! abstractions, maps its control-register aperture, and exposes a small
//! command surface on top: beam-position queries, cross-head scan-out
//! resynchronization, VBLANK interrupt counting, raw register access and a
//! GeForce dither-mode control path.
//!
//! Every fallible setup step degrades rather than aborts: a driver whose
//! attach or interrupt takeover failed stays loaded with an inert register
//! block, and every operation on it is a harmless no-op.

use std::fmt::Write as _;
use std::sync::Arc;

use beamsync_pci::clock::{HostClock, StdHostClock};
use beamsync_pci::{BusDevice, MemoryRange};
use beamsync_regs as gpuregs;
use tracing::{debug, info, warn};

mod attach;
mod beam;
mod dispatch;
mod irq;
mod mmio;

pub use attach::{AttachError, GpuFamily};
pub use beam::{ResyncError, SYNC_MIDLINE};
pub use dispatch::{opcode, CommandBlock, DispatchError, COMMAND_ARG_SLOTS, COMMAND_COUNT};
pub use irq::{IrqCounters, IrqInstallError, LIVE_GUARD};
pub use mmio::RegisterBlock;

/// Walk limit for [`GpuDriver::dump_state`]: the low interrupt/control block.
const DUMP_STATE_END: u32 = 0x200;

/// Poll bound for display FIFO command completion.
const MAX_DISP_COMMAND_POLLS: u32 = 100_000;

/// Driver instance bound to one GPU.
///
/// Construction never fails; [`GpuDriver::attach`] performs the fallible
/// probing. Dropping the driver detaches it, tearing down the interrupt
/// hookup first.
pub struct GpuDriver {
    device: Box<dyn BusDevice>,
    pub(crate) clock: Arc<dyn HostClock>,
    family: GpuFamily,
    aperture: Option<MemoryRange>,
    pub(crate) regs: Arc<RegisterBlock>,
    irq: Option<irq::IrqHook>,
}

impl GpuDriver {
    /// Wraps `device` without touching it. Call [`Self::attach`] next.
    pub fn new(device: Box<dyn BusDevice>, clock: impl HostClock + 'static) -> Self {
        Self {
            device,
            clock: Arc::new(clock),
            family: GpuFamily::Unknown,
            aperture: None,
            regs: Arc::new(RegisterBlock::unattached()),
            irq: None,
        }
    }

    /// Wraps `device` on the real host clock.
    pub fn with_std_clock(device: Box<dyn BusDevice>) -> Self {
        Self::new(device, StdHostClock::new())
    }

    /// Classifies the device and maps its register aperture.
    ///
    /// Always starts from the inert state: a re-attach tears down any armed
    /// interrupt hookup first, so nothing keeps servicing the line through a
    /// mapping about to be replaced. On failure the driver stays inert; the
    /// error says why.
    pub fn attach(&mut self) -> Result<(), AttachError> {
        self.detach();
        let (family, region, range) = attach::probe_and_map(self.device.as_mut())?;
        self.family = family;
        self.aperture = Some(range);
        self.regs = Arc::new(RegisterBlock::new(region));
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.regs.is_attached()
    }

    pub fn family(&self) -> GpuFamily {
        self.family
    }

    /// Physical range of the mapped register aperture.
    pub fn aperture(&self) -> Option<MemoryRange> {
        self.aperture
    }

    /// Returns the driver to the inert state. Idempotent; tears down the
    /// interrupt hookup before unmapping anything it references.
    pub fn detach(&mut self) {
        if let Some(hook) = self.irq.take() {
            irq::teardown(hook, self.device.as_mut());
        }
        if self.regs.is_attached() {
            info!("detaching from the register aperture");
        }
        self.regs = Arc::new(RegisterBlock::unattached());
        self.aperture = None;
        self.family = GpuFamily::Unknown;
    }

    /// Takes over the GPU interrupt line and starts counting VBLANKs.
    ///
    /// Already-armed is success. Requires an attached register block: the
    /// fast path must be able to service the hardware it is counting for.
    pub fn install_interrupt_handler(&mut self) -> Result<(), IrqInstallError> {
        if !self.regs.is_attached() {
            return Err(IrqInstallError::NotAttached);
        }
        if self.irq.is_some() {
            debug!("interrupt handler already armed");
            return Ok(());
        }
        let hook = irq::install(
            self.device.as_mut(),
            Arc::clone(&self.regs),
            irq::GPU_IRQ_LINE,
        )?;
        self.irq = Some(hook);
        Ok(())
    }

    /// Interrupt counter snapshot; `None` until the handler is armed.
    pub fn interrupt_counters(&self) -> Option<IrqCounters> {
        self.irq.as_ref().map(irq::IrqHook::counters)
    }

    /// Raw 32-bit register read at byte offset `offset`.
    pub fn read_register(&self, offset: u32) -> u32 {
        self.regs.read32(offset)
    }

    /// Raw 32-bit register write at byte offset `offset`.
    pub fn write_register(&self, offset: u32, value: u32) {
        self.regs.write32(offset, value);
    }

    /// Logs a diagnostic walk of the low register block.
    pub fn dump_state(&self) {
        info!(
            family = ?self.family,
            mapped = self.regs.len(),
            "register state dump"
        );
        let mut line = String::new();
        for offset in (0..=DUMP_STATE_END).step_by(4) {
            let _ = write!(line, " {offset:#06x}={:08x}", self.regs.read32(offset));
            if (offset / 4) % 5 == 4 {
                debug!("regs:{line}");
                line.clear();
            }
        }
        if !line.is_empty() {
            debug!("regs:{line}");
        }
    }

    /// Enables or disables spatial dithering on `head`.
    ///
    /// GeForce-only: the dither control lives behind the G80 display command
    /// FIFO, which the other families do not expose.
    pub fn set_dither_mode(&self, head: usize, enable: bool) {
        if self.family != GpuFamily::GeForce {
            warn!(family = ?self.family, "dither control is only implemented for GeForce");
            return;
        }
        info!(head, enable, "setting dither mode");
        let value = if enable { 0x11 } else { 0 };
        self.disp_command(
            gpuregs::G80_HEAD_DITHER_CONTROL + 0x400 * head as u32,
            value,
        );
        // The new mode does not take effect until a commit is pushed through
        // the FIFO.
        self.disp_command(gpuregs::G80_UPDATE, 0);
    }

    /// Pushes one method through the display command FIFO and waits for it
    /// to drain, acknowledging supervisor interrupts raised along the way.
    fn disp_command(&self, method: u32, data: u32) {
        self.regs.write32(gpuregs::G80_DISP_COMMAND_DATA, data);
        self.regs
            .write32(gpuregs::G80_DISP_COMMAND, method | gpuregs::G80_DISP_COMMAND_KICK);

        let mut polls = 0u32;
        while self.regs.read32(gpuregs::G80_DISP_COMMAND) & gpuregs::G80_DISP_COMMAND_BUSY != 0 {
            let pending = (self.regs.read32(gpuregs::G80_DISP_SUPERVISOR) >> 4) & 0x7;
            if pending != 0 {
                let phase = pending.trailing_zeros() + 1;
                if phase == 2 {
                    // Phase 2 is where mode-set commands would need the pixel
                    // clock reprogrammed; detect the request and flag it.
                    for head in 0..gpuregs::HEAD_COUNT {
                        let state = self
                            .regs
                            .read32(gpuregs::G80_CRTC_STATE + 0x800 * head as u32);
                        if state & 0xC0 == 0x80 {
                            warn!(head, "head requests a pixel clock reprogram, not implemented");
                        }
                    }
                }
                self.regs.write32(gpuregs::G80_DISP_SUPERVISOR, 8 << phase);
                self.regs
                    .write32(gpuregs::G80_DISP_SUPERVISOR_ACK, 0x8000_0000);
            }

            polls += 1;
            if polls >= MAX_DISP_COMMAND_POLLS {
                warn!(
                    method = format_args!("{method:#x}"),
                    "display command did not complete, giving up"
                );
                break;
            }
            std::hint::spin_loop();
        }
    }
}

impl Drop for GpuDriver {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamsync_pci::sim::{SimFaults, SimGpuConfig, SimGpuDevice};
    use beamsync_regs as gpuregs;
    use pretty_assertions::assert_eq;

    fn driver_over(dev: &SimGpuDevice) -> GpuDriver {
        GpuDriver::new(Box::new(dev.clone()), dev.clock())
    }

    #[test]
    fn attach_populates_family_and_aperture() {
        let dev = SimGpuDevice::default();
        let mut driver = driver_over(&dev);
        assert!(!driver.is_attached());

        driver.attach().expect("attach");
        assert!(driver.is_attached());
        assert_eq!(driver.family(), GpuFamily::Radeon);
        assert_eq!(
            driver.aperture(),
            Some(MemoryRange::new(0x9000_0000, 0x1_0000))
        );
    }

    #[test]
    fn failed_attach_leaves_the_driver_inert() {
        let dev = SimGpuDevice::default();
        dev.set_faults(SimFaults {
            fail_map: true,
            ..SimFaults::default()
        });
        let mut driver = driver_over(&dev);
        assert_eq!(driver.attach(), Err(AttachError::MappingFailed));
        assert!(!driver.is_attached());
        assert_eq!(driver.family(), GpuFamily::Unknown);
        assert_eq!(driver.aperture(), None);
        // Inert operations are no-ops, not panics.
        assert_eq!(driver.read_register(gpuregs::D1CRTC_V_TOTAL), 0);
        driver.write_register(0, 1);
        driver.dump_state();
    }

    #[test]
    fn failed_reattach_disarms_the_interrupt_hookup() {
        let dev = SimGpuDevice::default();
        let mut driver = driver_over(&dev);
        driver.attach().expect("attach");
        driver.install_interrupt_handler().expect("install");
        assert!(dev.has_custom_handler());

        dev.set_faults(SimFaults {
            fail_map: true,
            ..SimFaults::default()
        });
        assert_eq!(driver.attach(), Err(AttachError::MappingFailed));
        assert!(!driver.is_attached());
        // The old hookup came down before probing; nothing services the
        // line through the stale mapping.
        assert!(dev.line_unowned());
        assert_eq!(driver.interrupt_counters(), None);
    }

    #[test]
    fn successful_reattach_starts_without_an_armed_hookup() {
        let dev = SimGpuDevice::default();
        let mut driver = driver_over(&dev);
        driver.attach().expect("attach");
        driver.install_interrupt_handler().expect("install");

        driver.attach().expect("reattach");
        assert!(driver.is_attached());
        assert!(dev.line_unowned());
        assert_eq!(driver.interrupt_counters(), None);
    }

    #[test]
    fn interrupt_install_requires_attachment() {
        let dev = SimGpuDevice::default();
        let mut driver = driver_over(&dev);
        assert_eq!(
            driver.install_interrupt_handler(),
            Err(IrqInstallError::NotAttached)
        );
        assert_eq!(driver.interrupt_counters(), None);
    }

    #[test]
    fn interrupt_install_is_idempotent() {
        let dev = SimGpuDevice::default();
        let mut driver = driver_over(&dev);
        driver.attach().expect("attach");
        driver.install_interrupt_handler().expect("install");
        let raw_before = driver.interrupt_counters().expect("counters").raw_calls;
        // Second call is a no-op, not a second takeover.
        driver.install_interrupt_handler().expect("reinstall");
        assert_eq!(
            driver.interrupt_counters().expect("counters").raw_calls,
            raw_before
        );
    }

    #[test]
    fn detach_is_idempotent_and_releases_the_line() {
        let dev = SimGpuDevice::default();
        let mut driver = driver_over(&dev);
        driver.attach().expect("attach");
        driver.install_interrupt_handler().expect("install");
        assert!(dev.has_custom_handler());

        driver.detach();
        assert!(!driver.is_attached());
        assert!(dev.line_unowned());
        assert_eq!(driver.interrupt_counters(), None);

        driver.detach();
        assert!(!driver.is_attached());
    }

    #[test]
    fn drop_tears_down_the_interrupt_hookup() {
        let dev = SimGpuDevice::default();
        {
            let mut driver = driver_over(&dev);
            driver.attach().expect("attach");
            driver.install_interrupt_handler().expect("install");
            assert!(dev.has_custom_handler());
        }
        assert!(dev.line_unowned());
    }

    #[test]
    fn dither_mode_is_refused_off_geforce() {
        let dev = SimGpuDevice::default();
        let mut driver = driver_over(&dev);
        driver.attach().expect("attach");
        let before = dev.register_traffic();
        driver.set_dither_mode(0, true);
        assert_eq!(dev.register_traffic(), before);
    }

    #[test]
    fn dither_commands_flow_through_the_display_fifo() {
        let dev = SimGpuDevice::new(SimGpuConfig::geforce());
        let mut driver = driver_over(&dev);
        driver.attach().expect("attach");
        assert_eq!(driver.family(), GpuFamily::GeForce);

        driver.set_dither_mode(1, true);
        // The FIFO consumed the commit method last; the busy bit never
        // reads back as set on the model.
        assert_eq!(
            driver.read_register(gpuregs::G80_DISP_COMMAND),
            (gpuregs::G80_UPDATE | gpuregs::G80_DISP_COMMAND_KICK)
                & !gpuregs::G80_DISP_COMMAND_BUSY
        );
        assert_eq!(driver.read_register(gpuregs::G80_DISP_COMMAND_DATA), 0);
    }
}
