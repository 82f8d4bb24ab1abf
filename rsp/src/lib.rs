//! Client for the GDB Remote Serial Protocol.
//!
//! `rsp` drives a debug stub (gdbserver, QEMU, OpenOCD, an emulator) over any
//! byte stream. The stack has three layers:
//!
//! - [`rsp_proto`] frames and checksums packets and decodes replies in the
//!   context of the command that produced them.
//! - [`Session`] retransmits frames until the stub acknowledges them and
//!   reassembles incoming frames from partial reads.
//! - [`Presentation`] runs command/reply exchanges with bounded retry,
//!   sends interrupts, and lets a [`Canceller`] abort a pending reply wait.
//!
//! # Example
//!
//! ```no_run
//! use rsp::{Client, Config};
//!
//! # async fn run() -> rsp::Result<()> {
//! let mut client = Client::new("localhost:1234".parse()?, Config::default());
//! client.connect().await?;
//!
//! let bytes = client.read_memory(0x0200_0000, 16).await?;
//! println!("{bytes:02x?}");
//!
//! client.disconnect().await
//! # }
//! ```

mod cancel;
mod client;
mod config;
mod error;
mod presentation;
mod session;
mod transport;

pub use cancel::Canceller;
pub use client::{Client, Connection};
pub use config::Config;
pub use error::{Error, Result};
pub use presentation::{Exchange, Phase, Presentation};
pub use rsp_proto::{
    Command, Continue, Detach, HaltReason, ReadMemory, ReadRegister, ReadRegisters, Register,
    Step, StopReply, WriteMemory, WriteRegister,
};
pub use session::Session;
pub use transport::{Endpoint, Transport, connect};
