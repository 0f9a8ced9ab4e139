//! Beam position queries and cross-head scan-out resynchronization.
//!
//! A beam position is the current vertical scanline of a display head,
//! corrected for the vertical-blank interval so it counts 0..total from the
//! start of active video. Downstream timing consumers rely on it being a
//! monotonically-increasing-then-wrapping counter over `[0, total)` sampled
//! at a known instant.

use beamsync_regs as gpuregs;
use tracing::{debug, info, warn};

use crate::mmio::RegisterBlock;
use crate::GpuDriver;

/// Reference scanline for the resync stop points. Safely inside active video
/// at any conceivable resolution: even at 640x480 it sits mid-frame, far
/// from both the start and the end of a refresh.
pub const SYNC_MIDLINE: u32 = 240;

/// Settle time after stopping one head's scan converter.
const STOP_SETTLE_MS: u64 = 50;
/// Settle time after the whole stop pass.
const PRE_RESTART_SETTLE_MS: u64 = 20;
/// Hardware settle time before the synchronized restart.
const RESTART_DELAY_MS: u64 = 1_000;

/// Wall-clock budget for each beam-position wait.
const BEAM_WAIT_BUDGET_NS: u64 = 250_000_000;
/// Poll-count bound for the same waits, for clocks that only advance with
/// device activity.
const MAX_BEAM_POLLS: u32 = 1_000_000;

/// Resynchronization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResyncError {
    /// A beam-position wait exceeded its budget; the hardware is likely
    /// stuck. Whatever heads were already stopped stay stopped; there is
    /// no rollback on this path.
    #[error("beam position wait on head {head} timed out")]
    BeamWaitTimeout { head: usize },
}

/// Current scanline of `head`, corrected for the vertical-blank interval.
///
/// Pure function of register state; never negative. On an unattached block
/// every read returns 0 and so does this.
pub(crate) fn beam_position(regs: &RegisterBlock, head: usize) -> u32 {
    debug_assert!(head < gpuregs::HEAD_COUNT);

    let raw = regs.read32(gpuregs::crtc_status_position(head)) & gpuregs::BEAM_POSITION_MASK;
    let blank_end =
        (regs.read32(gpuregs::crtc_v_blank_start_end(head)) >> 16) & gpuregs::BEAM_POSITION_MASK;

    // Positions inside the blanking interval read below the blank-end
    // offset; wrap them to the tail of the previous refresh.
    let mut position = i64::from(raw) - i64::from(blank_end);
    if position < 0 {
        position += i64::from(regs.read32(gpuregs::crtc_v_total(head)));
    }
    // Floor at zero: a still-negative value means the hardware reported
    // inconsistent timing, and callers handle a zero better than a panic.
    position.max(0) as u32
}

impl GpuDriver {
    /// Current corrected scanline of display head `head` (0 or 1).
    pub fn beam_position(&self, head: usize) -> u32 {
        beam_position(&self.regs, head)
    }

    /// Stops every active head at the start of a refresh cycle and restarts
    /// them simultaneously, phase-locking their scan-out.
    ///
    /// Returns the residual beam offset between head 1 and head 0 after the
    /// restart; near zero means the heads are aligned. A restart that fails
    /// to restore the enable mask is logged but not escalated; the caller
    /// inspects the returned offset.
    pub fn resynchronize_all_heads(&mut self) -> Result<i32, ResyncError> {
        info!("resynchronizing display heads via a scan-converter stop/start cycle");
        self.sample_head_offsets("pretest");

        let old_enable = self.regs.read32(gpuregs::DC_CRTC_MASTER_ENABLE);
        info!(
            mask = format_args!("{old_enable:#b}"),
            "current scan-converter master enable state"
        );

        // Stop each active head individually, each at the very start of a
        // new refresh cycle.
        for head in 0..gpuregs::HEAD_COUNT {
            if old_enable & (1 << head) == 0 {
                debug!(head, "head already offline");
                continue;
            }

            // Let the beam get well past the midline, then catch the wrap
            // back below it: that is the start of the next refresh.
            self.wait_for_beam(head, |position| position > SYNC_MIDLINE)?;
            self.wait_for_beam(head, |position| position <= SYNC_MIDLINE)?;

            let mask = self.regs.read32(gpuregs::DC_CRTC_MASTER_ENABLE);
            self.regs
                .write32(gpuregs::DC_CRTC_MASTER_ENABLE, mask & !(1 << head));
            debug!(
                head,
                mask = format_args!("{:#b}", self.regs.read32(gpuregs::DC_CRTC_MASTER_ENABLE)),
                "head stopped at refresh start"
            );
            self.clock.sleep_ms(STOP_SETTLE_MS);
        }

        self.clock.sleep_ms(PRE_RESTART_SETTLE_MS);

        let stopped_mask = self.regs.read32(gpuregs::DC_CRTC_MASTER_ENABLE);
        let positions = (self.beam_position(0), self.beam_position(1));
        if stopped_mask == 0 {
            info!(
                head0 = positions.0,
                head1 = positions.1,
                "scan converters down; synchronized restart in 1 second"
            );
        } else {
            warn!(
                mask = format_args!("{stopped_mask:#b}"),
                "scan-converter shutdown incomplete; restarting anyway"
            );
        }

        self.clock.sleep_ms(RESTART_DELAY_MS);

        // One write restarts every previously-active head in the same
        // register transaction.
        self.regs.write32(gpuregs::DC_CRTC_MASTER_ENABLE, old_enable);

        let head0 = self.beam_position(0);
        let head1 = self.beam_position(1);
        let restored = self.regs.read32(gpuregs::DC_CRTC_MASTER_ENABLE);
        if restored == old_enable {
            info!(
                mask = format_args!("{restored:#b}"),
                head0, head1, "scan converters restarted in sync"
            );
        } else {
            warn!(
                expected = format_args!("{old_enable:#b}"),
                actual = format_args!("{restored:#b}"),
                "scan-converter restart did not restore the enable mask"
            );
        }

        let offset = head1 as i32 - head0 as i32;
        info!(offset, "residual beam offset after display sync");
        self.sample_head_offsets("posttest");
        Ok(offset)
    }

    /// Spins until `done(beam_position(head))`, bounded by both wall-clock
    /// budget and poll count so dead hardware cannot hang the caller.
    fn wait_for_beam(
        &self,
        head: usize,
        done: impl Fn(u32) -> bool,
    ) -> Result<(), ResyncError> {
        let deadline = self.clock.now_ns().saturating_add(BEAM_WAIT_BUDGET_NS);
        let mut polls = 0u32;
        loop {
            if done(self.beam_position(head)) {
                return Ok(());
            }
            polls += 1;
            if polls >= MAX_BEAM_POLLS || self.clock.now_ns() >= deadline {
                warn!(head, polls, "beam position wait timed out");
                return Err(ResyncError::BeamWaitTimeout { head });
            }
            std::hint::spin_loop();
        }
    }

    fn sample_head_offsets(&self, stage: &str) {
        for sample in 0..4 {
            let head0 = self.beam_position(0);
            let head1 = self.beam_position(1);
            debug!(
                stage,
                sample,
                head0,
                head1,
                offset = head1 as i32 - head0 as i32,
                "beam position sample"
            );
        }
    }
}
