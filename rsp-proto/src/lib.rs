//! Wire format for the GDB Remote Serial Protocol.
//!
//! Packets travel as `$<payload>#<checksum>` frames over any reliable or
//! unreliable byte stream (TCP, Unix socket, serial line). This crate holds
//! the pure parts of the protocol: framing, checksums, and the mapping from
//! commands to the replies they produce. It performs no I/O.

pub mod codec;
mod packet;

pub use codec::{FrameError, checksum, decode, decode_with, encode, frame, unframe};
pub use packet::{
    Command, Continue, Detach, HaltReason, ReadMemory, ReadRegister, ReadRegisters, Register,
    Response, Step, StopReply, WriteMemory, WriteRegister,
};
