//! Simulated dual-head GPU used by the test suite.
//!
//! [`SimGpuDevice`] implements [`BusDevice`] over a deterministic device
//! model: a per-head raster position derived from a shared [`VirtualClock`],
//! write-1-to-clear interrupt status registers, scan-converter stop/restart
//! via the master-enable register, and an interrupt line with a
//! pre-registered stock handler (so driver install has something to take
//! over). Unmodeled register offsets fall through to a plain backing store
//! so read/write round-trips behave.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use beamsync_regs as gpuregs;

use crate::clock::{HostClock, VirtualClock};
use crate::region::MappedRegion;
use crate::{
    BarSlot, BusDevice, FastPathCall, FastPathOutcome, InterruptHandler, IrqLineError, MemoryRange,
};

/// The one interrupt line the simulated GPU exposes.
pub const SIM_IRQ_LINE: u32 = 1;

/// Simulated device geometry and identity.
#[derive(Debug, Clone)]
pub struct SimGpuConfig {
    pub vendor_id: u16,
    /// BAR slot that declares the register aperture.
    pub bar_slot: BarSlot,
    /// The register aperture itself.
    pub aperture: MemoryRange,
    /// Additional memory ranges (framebuffer, legacy block, ...).
    pub extra_ranges: Vec<MemoryRange>,
    /// When set, `bar_range` misreports this instead of the aperture,
    /// for exercising the attach cross-check.
    pub bar_report_override: Option<MemoryRange>,
    /// Total scanlines per refresh.
    pub v_total: u32,
    pub v_blank_start: u32,
    pub v_blank_end: u32,
    /// Raster speed: nanoseconds per scanline.
    pub ns_per_line: u64,
    /// Initial scanline offset per head (models heads running out of phase).
    pub head_phase: [u32; gpuregs::HEAD_COUNT],
    /// Initial scan-converter master enable bitmask.
    pub master_enable: u32,
    /// Virtual time consumed by each beam-position register read, so
    /// polling loops make progress against the virtual clock.
    pub position_read_tick_ns: u64,
}

impl Default for SimGpuConfig {
    /// A Radeon-shaped device: 64 KiB register aperture on BAR2, flanked by
    /// a much larger framebuffer range and a small legacy range so the
    /// candidate size filter has something to reject.
    fn default() -> Self {
        let ns_per_line = 18_518; // ~60 Hz at 900 total lines
        Self {
            vendor_id: gpuregs::PCI_VENDOR_ID_ATI,
            bar_slot: BarSlot::Bar2,
            aperture: MemoryRange::new(0x9000_0000, 0x1_0000),
            extra_ranges: vec![
                MemoryRange::new(0x8000_0000, 0x1000_0000),
                MemoryRange::new(0xA000_0000, 0x100),
            ],
            bar_report_override: None,
            v_total: 900,
            v_blank_start: 860,
            v_blank_end: 40,
            ns_per_line,
            head_phase: [0; gpuregs::HEAD_COUNT],
            master_enable: 0b11,
            position_read_tick_ns: ns_per_line / 4,
        }
    }
}

impl SimGpuConfig {
    /// A GeForce-shaped device: one huge BAR0 holding the whole register
    /// window (no size-class probing on this family).
    pub fn geforce() -> Self {
        Self {
            vendor_id: gpuregs::PCI_VENDOR_ID_NVIDIA,
            bar_slot: BarSlot::Bar0,
            aperture: MemoryRange::new(0x1000_0000, 0x100_0000),
            extra_ranges: vec![MemoryRange::new(0x8000_0000, 0x1000_0000)],
            ..Self::default()
        }
    }
}

/// Failure injection for the bus-device entry points.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimFaults {
    pub fail_disable: bool,
    pub fail_unregister: bool,
    pub fail_register: bool,
    pub fail_enable: bool,
    pub fail_map: bool,
}

/// Register traffic counters, for asserting that an operation touched (or
/// did not touch) the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterTraffic {
    pub reads: u64,
    pub writes: u64,
}

#[derive(Clone)]
enum HandlerSlot {
    /// The stock handler installed by the platform's own display driver.
    Stock,
    Custom(Arc<dyn InterruptHandler>),
    Empty,
}

#[derive(Debug, Clone, Copy)]
struct HeadState {
    running: bool,
    /// Virtual instant the head (re)started scanning out, line 0.
    epoch_ns: u64,
    /// Line offset applied on top of the epoch.
    phase_lines: u64,
    /// Raw line latched when the scan converter was stopped.
    frozen_line: u32,
}

struct SimGpuState {
    cfg: SimGpuConfig,
    clock: VirtualClock,
    faults: SimFaults,
    memory_enabled: bool,
    line_enabled: bool,
    handler: HandlerSlot,
    heads: [HeadState; gpuregs::HEAD_COUNT],
    master_enable: u32,
    gen_int_status: u32,
    disp_int_status: u32,
    backing: BTreeMap<u32, u32>,
    traffic: RegisterTraffic,
    pending_deferred: Vec<Arc<dyn InterruptHandler>>,
}

impl SimGpuState {
    fn raw_position(&self, head: usize) -> u32 {
        let state = &self.heads[head];
        if !state.running {
            return state.frozen_line;
        }
        let elapsed = self.clock.now_ns().saturating_sub(state.epoch_ns);
        let lines = elapsed / self.cfg.ns_per_line + state.phase_lines;
        (lines % u64::from(self.cfg.v_total)) as u32
    }

    fn head_for_position_reg(offset: u32) -> usize {
        usize::from(offset == gpuregs::D2CRTC_STATUS_POSITION)
    }

    fn reg_read(&mut self, offset: u32) -> u32 {
        self.traffic.reads += 1;
        match offset {
            gpuregs::D1CRTC_STATUS_POSITION | gpuregs::D2CRTC_STATUS_POSITION => {
                let raw = self.raw_position(Self::head_for_position_reg(offset));
                // The raster keeps moving while software polls it.
                self.clock.advance_ns(self.cfg.position_read_tick_ns);
                raw & gpuregs::BEAM_POSITION_MASK
            }
            gpuregs::D1CRTC_V_TOTAL | gpuregs::D2CRTC_V_TOTAL => self.cfg.v_total,
            gpuregs::D1CRTC_V_BLANK_START_END | gpuregs::D2CRTC_V_BLANK_START_END => {
                (self.cfg.v_blank_end << 16) | self.cfg.v_blank_start
            }
            gpuregs::DC_CRTC_MASTER_ENABLE => self.master_enable,
            gpuregs::R500_GEN_INT_STATUS => self.gen_int_status,
            gpuregs::R500_DISP_INTERRUPT_STATUS => self.disp_int_status,
            gpuregs::G80_DISP_SUPERVISOR => 0,
            _ => self.backing.get(&offset).copied().unwrap_or(0),
        }
    }

    fn reg_write(&mut self, offset: u32, value: u32) {
        self.traffic.writes += 1;
        match offset {
            // Write-1-to-clear.
            gpuregs::R500_GEN_INT_STATUS => self.gen_int_status &= !value,
            gpuregs::R500_D1MODE_VBLANK_STATUS => self.ack_vblank(0, value),
            gpuregs::R500_D2MODE_VBLANK_STATUS => self.ack_vblank(1, value),
            gpuregs::DC_CRTC_MASTER_ENABLE => self.set_master_enable(value),
            gpuregs::G80_DISP_COMMAND => {
                // The display FIFO consumes commands immediately: the busy
                // bit never reads back as set.
                self.backing
                    .insert(offset, value & !gpuregs::G80_DISP_COMMAND_BUSY);
            }
            _ => {
                self.backing.insert(offset, value);
            }
        }
    }

    fn ack_vblank(&mut self, head: usize, value: u32) {
        if value & gpuregs::R500_VBLANK_ACK != 0 {
            let bit = if head == 0 {
                gpuregs::DispIntStatus::D1_VBLANK
            } else {
                gpuregs::DispIntStatus::D2_VBLANK
            };
            self.disp_int_status &= !bit.bits();
        }
    }

    fn set_master_enable(&mut self, value: u32) {
        for head in 0..gpuregs::HEAD_COUNT {
            let bit = 1u32 << head;
            let was = self.master_enable & bit != 0;
            let now = value & bit != 0;
            if was && !now {
                // Scan converter stops where the beam is right now.
                self.heads[head].frozen_line = self.raw_position(head);
                self.heads[head].running = false;
            } else if !was && now {
                // Restart begins a fresh refresh cycle at line 0.
                self.heads[head] = HeadState {
                    running: true,
                    epoch_ns: self.clock.now_ns(),
                    phase_lines: 0,
                    frozen_line: 0,
                };
            }
        }
        self.master_enable = value;
    }
}

struct SimRegion {
    state: Arc<Mutex<SimGpuState>>,
    len: u32,
}

impl MappedRegion for SimRegion {
    fn len(&self) -> u32 {
        self.len
    }

    fn read_u32(&self, offset: u32) -> u32 {
        self.state.lock().unwrap().reg_read(offset)
    }

    fn write_u32(&self, offset: u32, value: u32) {
        self.state.lock().unwrap().reg_write(offset, value);
    }
}

/// The simulated GPU bus device.
///
/// Clones share the same device state, so a test can keep a handle for
/// raising interrupts and inspecting traffic after handing the device to
/// the driver.
#[derive(Clone)]
pub struct SimGpuDevice {
    state: Arc<Mutex<SimGpuState>>,
}

impl SimGpuDevice {
    pub fn new(cfg: SimGpuConfig) -> Self {
        let clock = VirtualClock::new();
        let heads = core::array::from_fn(|head| HeadState {
            running: cfg.master_enable & (1 << head) != 0,
            epoch_ns: 0,
            phase_lines: u64::from(cfg.head_phase[head]),
            frozen_line: cfg.head_phase[head],
        });
        let master_enable = cfg.master_enable;
        Self {
            state: Arc::new(Mutex::new(SimGpuState {
                cfg,
                clock,
                faults: SimFaults::default(),
                memory_enabled: false,
                line_enabled: true,
                handler: HandlerSlot::Stock,
                heads,
                master_enable,
                gen_int_status: 0,
                disp_int_status: 0,
                backing: BTreeMap::new(),
                traffic: RegisterTraffic::default(),
                pending_deferred: Vec::new(),
            })),
        }
    }

    /// Handle onto the device's virtual timeline.
    pub fn clock(&self) -> VirtualClock {
        self.state.lock().unwrap().clock.clone()
    }

    pub fn set_faults(&self, faults: SimFaults) {
        self.state.lock().unwrap().faults = faults;
    }

    pub fn register_traffic(&self) -> RegisterTraffic {
        self.state.lock().unwrap().traffic
    }

    pub fn memory_enabled(&self) -> bool {
        self.state.lock().unwrap().memory_enabled
    }

    pub fn line_enabled(&self) -> bool {
        self.state.lock().unwrap().line_enabled
    }

    pub fn has_custom_handler(&self) -> bool {
        matches!(self.state.lock().unwrap().handler, HandlerSlot::Custom(_))
    }

    pub fn line_unowned(&self) -> bool {
        matches!(self.state.lock().unwrap().handler, HandlerSlot::Empty)
    }

    /// Latches a VBLANK interrupt for `head` and delivers it to the
    /// registered fast-path handler.
    ///
    /// Returns `true` if a custom handler actually ran. An `Escalate`
    /// verdict queues the deferred role for [`Self::run_deferred`].
    pub fn raise_vblank(&self, head: usize) -> bool {
        let handler = {
            let mut state = self.state.lock().unwrap();
            let bit = if head == 0 {
                gpuregs::DispIntStatus::D1_VBLANK
            } else {
                gpuregs::DispIntStatus::D2_VBLANK
            };
            state.disp_int_status |= bit.bits();
            state.gen_int_status |= gpuregs::GenIntStatus::DISPLAY.bits();
            if !state.line_enabled {
                return false;
            }
            match &state.handler {
                HandlerSlot::Custom(handler) => handler.clone(),
                _ => return false,
            }
            // Lock dropped before the handler runs: it will read the
            // device's registers through its mapped region.
        };
        if handler.fast_path(FastPathCall::Interrupt) == FastPathOutcome::Escalate {
            self.state.lock().unwrap().pending_deferred.push(handler);
        }
        true
    }

    /// Runs the cooperative-context role for every escalated interrupt.
    pub fn run_deferred(&self) -> usize {
        let pending: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.pending_deferred.drain(..).collect()
        };
        for handler in &pending {
            handler.deferred();
        }
        pending.len()
    }

    fn check_line(line: u32) -> Result<(), IrqLineError> {
        if line == SIM_IRQ_LINE {
            Ok(())
        } else {
            Err(IrqLineError::NoSuchLine(line))
        }
    }
}

impl Default for SimGpuDevice {
    fn default() -> Self {
        Self::new(SimGpuConfig::default())
    }
}

impl BusDevice for SimGpuDevice {
    fn read_config_u16(&self, offset: u16) -> u16 {
        let state = self.state.lock().unwrap();
        match offset {
            gpuregs::PCI_CONFIG_VENDOR_ID => state.cfg.vendor_id,
            _ => 0,
        }
    }

    fn enable_memory(&mut self) {
        self.state.lock().unwrap().memory_enabled = true;
    }

    fn memory_ranges(&self) -> Vec<MemoryRange> {
        let state = self.state.lock().unwrap();
        let mut ranges = vec![state.cfg.aperture];
        ranges.extend(state.cfg.extra_ranges.iter().copied());
        ranges
    }

    fn bar_range(&self, slot: BarSlot) -> Option<MemoryRange> {
        let state = self.state.lock().unwrap();
        if slot != state.cfg.bar_slot {
            return None;
        }
        Some(state.cfg.bar_report_override.unwrap_or(state.cfg.aperture))
    }

    fn map_bar(&mut self, slot: BarSlot) -> Option<Box<dyn MappedRegion>> {
        let state = self.state.lock().unwrap();
        if state.faults.fail_map || slot != state.cfg.bar_slot {
            return None;
        }
        Some(Box::new(SimRegion {
            state: Arc::clone(&self.state),
            len: state.cfg.aperture.len as u32,
        }))
    }

    fn disable_interrupt(&mut self, line: u32) -> Result<(), IrqLineError> {
        let mut state = self.state.lock().unwrap();
        Self::check_line(line)?;
        if state.faults.fail_disable {
            return Err(IrqLineError::Refused { line, op: "disable" });
        }
        state.line_enabled = false;
        Ok(())
    }

    fn enable_interrupt(&mut self, line: u32) -> Result<(), IrqLineError> {
        let mut state = self.state.lock().unwrap();
        Self::check_line(line)?;
        if state.faults.fail_enable {
            return Err(IrqLineError::Refused { line, op: "enable" });
        }
        state.line_enabled = true;
        Ok(())
    }

    fn register_interrupt(
        &mut self,
        line: u32,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<(), IrqLineError> {
        let mut state = self.state.lock().unwrap();
        Self::check_line(line)?;
        if state.faults.fail_register {
            return Err(IrqLineError::Refused { line, op: "register" });
        }
        if !matches!(state.handler, HandlerSlot::Empty) {
            return Err(IrqLineError::Refused { line, op: "register" });
        }
        state.handler = HandlerSlot::Custom(handler);
        Ok(())
    }

    fn unregister_interrupt(&mut self, line: u32) -> Result<(), IrqLineError> {
        let mut state = self.state.lock().unwrap();
        Self::check_line(line)?;
        if state.faults.fail_unregister {
            return Err(IrqLineError::Refused { line, op: "unregister" });
        }
        state.handler = HandlerSlot::Empty;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mapped(dev: &mut SimGpuDevice) -> Box<dyn MappedRegion> {
        let slot = dev.state.lock().unwrap().cfg.bar_slot;
        dev.map_bar(slot).expect("aperture maps")
    }

    #[test]
    fn position_advances_with_the_virtual_clock() {
        let mut dev = SimGpuDevice::default();
        let clock = dev.clock();
        let bar = mapped(&mut dev);

        let first = bar.read_u32(gpuregs::D1CRTC_STATUS_POSITION);
        clock.advance_ns(10 * 18_518);
        let later = bar.read_u32(gpuregs::D1CRTC_STATUS_POSITION);
        // 10 lines of virtual time plus the read tick from the first poll.
        assert!(later >= first + 10, "{later} vs {first}");
    }

    #[test]
    fn master_enable_freezes_and_rezeroes_heads() {
        let mut dev = SimGpuDevice::default();
        let clock = dev.clock();
        let bar = mapped(&mut dev);

        clock.advance_ns(123 * 18_518);
        bar.write_u32(gpuregs::DC_CRTC_MASTER_ENABLE, 0b10);
        let frozen = bar.read_u32(gpuregs::D1CRTC_STATUS_POSITION);
        clock.advance_ns(1_000_000_000);
        assert_eq!(bar.read_u32(gpuregs::D1CRTC_STATUS_POSITION), frozen);

        bar.write_u32(gpuregs::DC_CRTC_MASTER_ENABLE, 0b11);
        assert_eq!(bar.read_u32(gpuregs::D1CRTC_STATUS_POSITION), 0);
    }

    #[test]
    fn general_status_is_write_one_to_clear() {
        let mut dev = SimGpuDevice::default();
        let bar = mapped(&mut dev);

        dev.raise_vblank(0);
        let status = bar.read_u32(gpuregs::R500_GEN_INT_STATUS);
        assert_ne!(status & gpuregs::GenIntStatus::DISPLAY.bits(), 0);

        bar.write_u32(gpuregs::R500_GEN_INT_STATUS, status);
        assert_eq!(bar.read_u32(gpuregs::R500_GEN_INT_STATUS), 0);
    }

    #[test]
    fn vblank_ack_clears_the_per_pipe_bit() {
        let mut dev = SimGpuDevice::default();
        let bar = mapped(&mut dev);

        dev.raise_vblank(1);
        assert_ne!(
            bar.read_u32(gpuregs::R500_DISP_INTERRUPT_STATUS)
                & gpuregs::DispIntStatus::D2_VBLANK.bits(),
            0
        );

        bar.write_u32(gpuregs::R500_D2MODE_VBLANK_STATUS, gpuregs::R500_VBLANK_ACK);
        assert_eq!(bar.read_u32(gpuregs::R500_DISP_INTERRUPT_STATUS), 0);
    }

    #[test]
    fn raise_without_custom_handler_latches_but_does_not_deliver() {
        let dev = SimGpuDevice::default();
        assert!(!dev.raise_vblank(0));
        // Status stays latched for whoever installs later.
        let mut dev = dev;
        let bar = mapped(&mut dev);
        assert_ne!(bar.read_u32(gpuregs::R500_DISP_INTERRUPT_STATUS), 0);
    }

    #[test]
    fn backing_store_round_trips_unmodeled_offsets() {
        let mut dev = SimGpuDevice::default();
        let bar = mapped(&mut dev);

        bar.write_u32(0x0100, 0xCAFE_F00D);
        assert_eq!(bar.read_u32(0x0100), 0xCAFE_F00D);
        assert_eq!(bar.read_u32(0x0104), 0);
    }
}
