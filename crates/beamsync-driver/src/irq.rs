//! VBLANK interrupt subsystem.
//!
//! The driver takes over the GPU's interrupt line from whatever handler the
//! platform installed, wires in its own fast-path/deferred pair, and counts
//! VBLANK events per display head. The fast path runs in primary interrupt
//! context: it touches only atomics and the register access layer, never
//! logs, never allocates, never blocks.
//!
//! Teardown ordering is load-bearing: the liveness guard is cleared first
//! (degrading any in-flight fast-path invocation to a no-op), then the line
//! is disabled, then the handler is released. Violating that order risks a
//! use-after-teardown read from interrupt context.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use beamsync_pci::{BusDevice, FastPathCall, FastPathOutcome, InterruptHandler, IrqLineError};
use beamsync_regs as gpuregs;
use tracing::{debug, info, warn};

use crate::mmio::RegisterBlock;

/// Interrupt line carrying the GPU's display interrupts.
pub(crate) const GPU_IRQ_LINE: u32 = 1;

/// Liveness sentinel: nonzero and not a common fill pattern, so a stale or
/// scribbled-over guard word cannot masquerade as "alive".
pub const LIVE_GUARD: u32 = 0x5642_4C21;

/// Counters shared between the fast-path handler and the dispatch context.
///
/// All fields are monotonically increasing with wrap-around; the dispatch
/// side only ever reads them.
#[derive(Debug, Default)]
pub(crate) struct IrqShared {
    /// Safe-publication guard: [`LIVE_GUARD`] while the hookup is armed,
    /// 0 otherwise. Checked with `Acquire` on every real invocation.
    guard: AtomicU32,
    /// Every fast-path invocation on the line, armed or not.
    raw_calls: AtomicU32,
    /// Invocations that passed the guard and serviced the hardware.
    handled: AtomicU32,
    /// VBLANK events per display head.
    vblank: [AtomicU32; gpuregs::HEAD_COUNT],
    /// General interrupt status seen by the most recent serviced invocation.
    last_status: AtomicU32,
}

/// Read-only snapshot of the interrupt counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqCounters {
    pub raw_calls: u32,
    pub handled: u32,
    pub vblank: [u32; gpuregs::HEAD_COUNT],
}

impl IrqShared {
    fn snapshot(&self) -> IrqCounters {
        IrqCounters {
            raw_calls: self.raw_calls.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            vblank: [
                self.vblank[0].load(Ordering::Relaxed),
                self.vblank[1].load(Ordering::Relaxed),
            ],
        }
    }
}

/// The driver's interrupt handler pair.
pub(crate) struct VblankIsr {
    shared: Arc<IrqShared>,
    regs: Arc<RegisterBlock>,
}

impl InterruptHandler for VblankIsr {
    fn fast_path(&self, call: FastPathCall) -> FastPathOutcome {
        if call == FastPathCall::CounterFlush {
            // Diagnostic readout convention: only ever invoked from regular
            // context (install/teardown), so logging is allowed here and
            // nowhere else in this function.
            let counters = self.shared.snapshot();
            info!(
                raw_calls = counters.raw_calls,
                handled = counters.handled,
                vblank_head0 = counters.vblank[0],
                vblank_head1 = counters.vblank[1],
                last_status = format_args!(
                    "{:#x}",
                    self.shared.last_status.load(Ordering::Relaxed)
                ),
                "interrupt counter flush"
            );
            info!(
                irq_control = format_args!("{:#x}", self.regs.read32(gpuregs::R500_GEN_INT_CNTL)),
                irq_status = format_args!("{:#x}", self.regs.read32(gpuregs::R500_GEN_INT_STATUS)),
                "hardware interrupt state"
            );
            return FastPathOutcome::DoNotEscalate;
        }

        // Real invocation, primary interrupt context from here on.
        self.shared.raw_calls.fetch_add(1, Ordering::Relaxed);

        // Mid-teardown (or not yet armed): skip all register access.
        if self.shared.guard.load(Ordering::Acquire) != LIVE_GUARD {
            return FastPathOutcome::DoNotEscalate;
        }

        let status = self.regs.read32(gpuregs::R500_GEN_INT_STATUS);
        self.shared.last_status.store(status, Ordering::Relaxed);

        if gpuregs::GenIntStatus::from_bits_retain(status).contains(gpuregs::GenIntStatus::DISPLAY)
        {
            let display = gpuregs::DispIntStatus::from_bits_retain(
                self.regs.read32(gpuregs::R500_DISP_INTERRUPT_STATUS),
            );
            if display.contains(gpuregs::DispIntStatus::D1_VBLANK) {
                self.regs
                    .write32(gpuregs::R500_D1MODE_VBLANK_STATUS, gpuregs::R500_VBLANK_ACK);
                self.shared.vblank[0].fetch_add(1, Ordering::Relaxed);
            }
            if display.contains(gpuregs::DispIntStatus::D2_VBLANK) {
                self.regs
                    .write32(gpuregs::R500_D2MODE_VBLANK_STATUS, gpuregs::R500_VBLANK_ACK);
                self.shared.vblank[1].fetch_add(1, Ordering::Relaxed);
            }
        }

        // Write-1-to-clear acknowledge of everything we saw.
        if status != 0 {
            self.regs.write32(gpuregs::R500_GEN_INT_STATUS, status);
        }

        self.shared.handled.fetch_add(1, Ordering::Relaxed);

        // The deferred role is reserved for future use; never escalate.
        FastPathOutcome::DoNotEscalate
    }

    fn deferred(&self) {
        // Cooperative context with full services. Nothing to do yet.
    }
}

/// Live interrupt hookup owned by the driver.
pub(crate) struct IrqHook {
    line: u32,
    shared: Arc<IrqShared>,
    handler: Arc<VblankIsr>,
}

impl IrqHook {
    pub(crate) fn counters(&self) -> IrqCounters {
        self.shared.snapshot()
    }
}

/// Interrupt installation failure. The driver keeps running without the
/// custom interrupt path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IrqInstallError {
    #[error("no register aperture attached")]
    NotAttached,
    #[error("failed to disable the prior handler on line {line}: {source}")]
    DisableFailed { line: u32, source: IrqLineError },
    #[error("failed to detach the prior handler on line {line}: {source}")]
    UnregisterFailed { line: u32, source: IrqLineError },
    #[error("failed to register the replacement handler on line {line}: {source}")]
    RegisterFailed { line: u32, source: IrqLineError },
    #[error("failed to re-enable line {line}: {source}")]
    EnableFailed { line: u32, source: IrqLineError },
}

fn dump_irq_registers(regs: &RegisterBlock, stage: &str) {
    debug!(
        stage,
        irq_control = format_args!("{:#x}", regs.read32(gpuregs::R500_GEN_INT_CNTL)),
        irq_status = format_args!("{:#x}", regs.read32(gpuregs::R500_GEN_INT_STATUS)),
        "interrupt register state"
    );
}

/// Takes over `line` and arms the VBLANK handler.
///
/// Installation is all-or-nothing from the hardware's perspective: if the
/// prior handler cannot be detached, it is re-enabled and the install
/// aborts.
pub(crate) fn install(
    dev: &mut dyn BusDevice,
    regs: Arc<RegisterBlock>,
    line: u32,
) -> Result<IrqHook, IrqInstallError> {
    dump_irq_registers(&regs, "before takeover");

    dev.disable_interrupt(line)
        .map_err(|source| IrqInstallError::DisableFailed { line, source })?;
    dump_irq_registers(&regs, "after disable");

    if let Err(source) = dev.unregister_interrupt(line) {
        // Leave the line the way we found it.
        if let Err(restore) = dev.enable_interrupt(line) {
            warn!(line, error = %restore, "could not re-enable the prior handler");
        }
        return Err(IrqInstallError::UnregisterFailed { line, source });
    }
    debug!(line, "prior interrupt handler detached");

    let shared = Arc::new(IrqShared::default());
    let handler = Arc::new(VblankIsr {
        shared: Arc::clone(&shared),
        regs,
    });

    if let Err(source) = dev.register_interrupt(line, handler.clone()) {
        return Err(IrqInstallError::RegisterFailed { line, source });
    }

    dev.enable_interrupt(line)
        .map_err(|source| IrqInstallError::EnableFailed { line, source })?;

    // Publish the guard only once the hookup is fully constructed; anything
    // delivered before this point is counted but not serviced.
    shared.guard.store(LIVE_GUARD, Ordering::Release);

    dump_irq_registers(&handler.regs, "armed");

    // Acknowledge whatever was already pending on the line.
    handler.fast_path(FastPathCall::Interrupt);

    info!(line, "VBLANK interrupt handler installed");
    Ok(IrqHook {
        line,
        shared,
        handler,
    })
}

/// Disarms and releases the hookup.
pub(crate) fn teardown(hook: IrqHook, dev: &mut dyn BusDevice) {
    // Guard first: any in-flight fast-path invocation now degrades to the
    // skip branch before we start taking the hardware apart.
    hook.shared.guard.store(0, Ordering::Release);

    if let Err(error) = dev.disable_interrupt(hook.line) {
        warn!(line = hook.line, %error, "could not disable interrupt line");
    }
    if let Err(error) = dev.unregister_interrupt(hook.line) {
        warn!(line = hook.line, %error, "could not unregister interrupt handler");
    }

    let counters = hook.shared.snapshot();
    info!(
        raw_calls = counters.raw_calls,
        vblank_head0 = counters.vblank[0],
        vblank_head1 = counters.vblank[1],
        "final interrupt counts"
    );

    // Flush the remaining state through the diagnostic convention, exactly
    // as the readout path would see it.
    hook.handler.fast_path(FastPathCall::CounterFlush);
}
