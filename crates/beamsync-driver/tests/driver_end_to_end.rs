//! Full driver lifecycle against the simulated GPU: attach, interrupt
//! takeover, VBLANK counting, cross-head resynchronization, command
//! dispatch, detach.

use beamsync_driver::{opcode, CommandBlock, DispatchError, GpuDriver, GpuFamily};
use beamsync_pci::sim::{SimGpuConfig, SimGpuDevice};
use beamsync_regs as gpuregs;
use pretty_assertions::assert_eq;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Shortest distance between two scanlines on a circular raster of `total`
/// lines.
fn circular_offset(delta: i32, total: i32) -> i32 {
    let wrapped = delta.rem_euclid(total);
    wrapped.min(total - wrapped)
}

#[test]
fn lifecycle_attach_interrupts_resync_dispatch_detach() {
    init_tracing();
    // Head 1 scans out 450 lines ahead of head 0, half a 900-line frame.
    let cfg = SimGpuConfig {
        head_phase: [0, 450],
        ..SimGpuConfig::default()
    };
    let total = cfg.v_total as i32;
    let dev = SimGpuDevice::new(cfg);
    let mut driver = GpuDriver::new(Box::new(dev.clone()), dev.clock());

    driver.attach().expect("attach");
    assert_eq!(driver.family(), GpuFamily::Radeon);
    assert!(driver.is_attached());

    // Interrupt takeover and per-head VBLANK counting.
    driver.install_interrupt_handler().expect("irq install");
    assert!(dev.has_custom_handler());
    dev.raise_vblank(0);
    dev.raise_vblank(0);
    dev.raise_vblank(0);
    dev.raise_vblank(1);
    dev.raise_vblank(1);
    let counters = driver.interrupt_counters().expect("counters");
    assert_eq!(counters.vblank, [3, 2]);
    // One post-install acknowledge plus the five raises.
    assert_eq!(counters.raw_calls, 6);
    // Everything delivered was serviced and acknowledged.
    assert_eq!(driver.read_register(gpuregs::R500_GEN_INT_STATUS), 0);

    // The heads start half a frame apart.
    let before = driver.beam_position(1) as i32 - driver.beam_position(0) as i32;
    let before = circular_offset(before, total);
    assert!((445..=455).contains(&before), "pre-sync offset {before}");

    // Resynchronize through the dispatch surface.
    let reply = driver
        .dispatch(&CommandBlock::new(opcode::SYNC_ALL_HEADS, [0, 0]))
        .expect("sync");
    assert_eq!(reply.opcode, opcode::SYNC_ALL_HEADS);
    let residual = circular_offset(reply.args[0] as i32, total);
    assert!(residual <= 2, "residual offset {residual}");

    // The improvement holds up on a fresh measurement and the enable mask
    // came back intact.
    let after = driver.beam_position(1) as i32 - driver.beam_position(0) as i32;
    assert!(circular_offset(after, total) <= 2, "post-sync offset {after}");
    assert_eq!(driver.read_register(gpuregs::DC_CRTC_MASTER_ENABLE), 0b11);

    // Malformed requests produce no register traffic.
    let traffic = dev.register_traffic();
    assert_eq!(
        driver.dispatch(&CommandBlock::new(u32::MAX, [0, 0])),
        Err(DispatchError::InvalidArgument)
    );
    assert_eq!(
        driver.dispatch(&CommandBlock::new(opcode::GET_BEAM_POSITION, [5, 0])),
        Err(DispatchError::InvalidArgument)
    );
    assert_eq!(dev.register_traffic(), traffic);

    // Detach releases the line and leaves an inert driver behind.
    driver.detach();
    assert!(dev.line_unowned());
    assert!(!driver.is_attached());
    assert_eq!(driver.read_register(gpuregs::DC_CRTC_MASTER_ENABLE), 0);
    driver.write_register(gpuregs::DC_CRTC_MASTER_ENABLE, 0);
    assert_eq!(driver.interrupt_counters(), None);

    // Second detach is a no-op.
    driver.detach();
}

#[test]
fn resync_skips_heads_that_are_already_offline() {
    init_tracing();
    // Head 1 disabled: only head 0 participates and the enable mask is
    // restored to the single-head value.
    let cfg = SimGpuConfig {
        master_enable: 0b01,
        ..SimGpuConfig::default()
    };
    let dev = SimGpuDevice::new(cfg);
    let mut driver = GpuDriver::new(Box::new(dev.clone()), dev.clock());
    driver.attach().expect("attach");

    driver.resynchronize_all_heads().expect("sync");
    assert_eq!(driver.read_register(gpuregs::DC_CRTC_MASTER_ENABLE), 0b01);
}
