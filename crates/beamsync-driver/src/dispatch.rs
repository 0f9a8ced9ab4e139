//! Command dispatch: the driver's external request surface.
//!
//! Callers hand in a [`CommandBlock`]; the block is parsed into a typed
//! [`DriverCommand`] before anything touches hardware, so a malformed
//! request is rejected with zero register traffic. Replies reuse the block
//! shape with the opcode echoed back.

use tracing::warn;

use beamsync_regs as gpuregs;

use crate::beam::ResyncError;
use crate::GpuDriver;

/// Command opcodes accepted by [`GpuDriver::dispatch`].
pub mod opcode {
    /// Resynchronize scan-out across all display heads.
    pub const SYNC_ALL_HEADS: u32 = 0;
    /// Log a walk of the low register block.
    pub const DUMP_STATE: u32 = 1;
    /// Read the corrected beam position of one head.
    pub const GET_BEAM_POSITION: u32 = 2;
    /// Reserved state-snapshot readout.
    pub const GET_STATE_SNAPSHOT: u32 = 3;
    /// Raw 32-bit register read.
    pub const READ_REGISTER: u32 = 4;
    /// Raw 32-bit register write.
    pub const WRITE_REGISTER: u32 = 5;
    /// Enable or disable spatial dithering on one head.
    pub const SET_DITHER_MODE: u32 = 6;
}

/// Number of defined opcodes; valid opcodes are `0..COMMAND_COUNT`.
pub const COMMAND_COUNT: u32 = 7;
/// Argument slots carried by every command block.
pub const COMMAND_ARG_SLOTS: usize = 2;

/// Fixed-shape request/reply block.
///
/// The same layout serves both directions: requests carry an opcode and up
/// to two arguments, replies echo the opcode and carry up to two results in
/// the same slots.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandBlock {
    pub opcode: u32,
    pub args: [u32; COMMAND_ARG_SLOTS],
}

impl CommandBlock {
    pub fn new(opcode: u32, args: [u32; COMMAND_ARG_SLOTS]) -> Self {
        Self { opcode, args }
    }
}

/// Dispatch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Unknown opcode or argument outside its domain. No hardware was
    /// touched.
    #[error("invalid command opcode or argument")]
    InvalidArgument,
    /// A head resynchronization timed out waiting for the beam.
    #[error("display sync failed: {0}")]
    SyncTimeout(#[from] ResyncError),
}

/// A validated command, parsed from a [`CommandBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverCommand {
    SyncAllHeads,
    DumpState,
    GetBeamPosition { head: usize },
    GetStateSnapshot,
    ReadRegister { offset: u32 },
    WriteRegister { offset: u32, value: u32 },
    SetDitherMode { head: usize, enable: bool },
}

impl DriverCommand {
    /// Parses and validates a raw block. Head arguments must name an
    /// existing display head.
    fn parse(block: &CommandBlock) -> Result<Self, DispatchError> {
        let head_arg = |slot: usize| -> Result<usize, DispatchError> {
            let head = block.args[slot] as usize;
            if head < gpuregs::HEAD_COUNT {
                Ok(head)
            } else {
                Err(DispatchError::InvalidArgument)
            }
        };

        match block.opcode {
            opcode::SYNC_ALL_HEADS => Ok(Self::SyncAllHeads),
            opcode::DUMP_STATE => Ok(Self::DumpState),
            opcode::GET_BEAM_POSITION => Ok(Self::GetBeamPosition { head: head_arg(0)? }),
            opcode::GET_STATE_SNAPSHOT => Ok(Self::GetStateSnapshot),
            opcode::READ_REGISTER => Ok(Self::ReadRegister {
                offset: block.args[0],
            }),
            opcode::WRITE_REGISTER => Ok(Self::WriteRegister {
                offset: block.args[0],
                value: block.args[1],
            }),
            opcode::SET_DITHER_MODE => Ok(Self::SetDitherMode {
                head: head_arg(0)?,
                enable: block.args[1] != 0,
            }),
            _ => Err(DispatchError::InvalidArgument),
        }
    }
}

impl GpuDriver {
    /// Executes one command block and returns the reply block.
    ///
    /// Validation happens before execution: a rejected request produces no
    /// register traffic at all. The reply echoes the request opcode; result
    /// slots not written by the command are zero.
    pub fn dispatch(&mut self, request: &CommandBlock) -> Result<CommandBlock, DispatchError> {
        let command = DriverCommand::parse(request).map_err(|error| {
            warn!(
                opcode = request.opcode,
                arg0 = request.args[0],
                arg1 = request.args[1],
                "rejecting malformed command"
            );
            error
        })?;

        let mut reply = CommandBlock::new(request.opcode, [0; COMMAND_ARG_SLOTS]);
        match command {
            DriverCommand::SyncAllHeads => {
                reply.args[0] = self.resynchronize_all_heads()? as u32;
            }
            DriverCommand::DumpState => self.dump_state(),
            DriverCommand::GetBeamPosition { head } => {
                reply.args[0] = self.beam_position(head);
            }
            DriverCommand::GetStateSnapshot => {
                // Readout slot reserved while the snapshot format is decided;
                // the reply stays all-zero.
            }
            DriverCommand::ReadRegister { offset } => {
                reply.args[0] = self.read_register(offset);
            }
            DriverCommand::WriteRegister { offset, value } => {
                self.write_register(offset, value);
            }
            DriverCommand::SetDitherMode { head, enable } => {
                self.set_dither_mode(head, enable);
            }
        }
        Ok(reply)
    }
}
