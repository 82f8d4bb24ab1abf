//! Connection front end for a debug stub.
//!
//! A [`Client`] remembers its endpoint and owns at most one live
//! [`Presentation`]. Connecting twice or disconnecting twice is harmless;
//! dropping the client closes the transport.

use rsp_proto::{
    Continue, Detach, HaltReason, ReadMemory, ReadRegister, ReadRegisters, Register, Step,
    StopReply, WriteMemory, WriteRegister,
};
use tracing::{debug, info};

use crate::presentation::Presentation;
use crate::transport::{self, Endpoint, Transport};
use crate::{Canceller, Config, Error, Result};

/// Presentation layer over a boxed transport.
pub type Connection = Presentation<Box<dyn Transport>>;

/// A debugger-side connection to a stub.
#[derive(Debug)]
pub struct Client {
    /// Where the stub listens.
    endpoint: Endpoint,
    /// Limits applied to every new connection.
    config: Config,
    /// The live connection, if any.
    connection: Option<Connection>,
}

impl Client {
    /// Creates a disconnected client for `endpoint`.
    pub const fn new(endpoint: Endpoint, config: Config) -> Self {
        Self {
            endpoint,
            config,
            connection: None,
        }
    }

    /// The endpoint this client connects to.
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns `true` while a connection is open.
    pub const fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Opens the connection. Does nothing if already connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            debug!(endpoint = %self.endpoint, "already connected");
            return Ok(());
        }
        let stream = transport::connect(&self.endpoint).await?;
        info!(endpoint = %self.endpoint, "connected");
        self.connection = Some(Presentation::new(stream, &self.config));
        Ok(())
    }

    /// Closes the connection. Does nothing if not connected.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        info!(endpoint = %self.endpoint, "disconnecting");
        connection.close().await
    }

    /// The live presentation layer.
    pub fn presentation(&mut self) -> Result<&mut Connection> {
        self.connection.as_mut().ok_or(Error::NotConnected)
    }

    /// A handle for cancelling the pending reply wait of this connection.
    pub fn canceller(&self) -> Result<Canceller> {
        self.connection
            .as_ref()
            .map(Presentation::canceller)
            .ok_or(Error::NotConnected)
    }

    /// Reads `length` bytes of target memory at `addr`.
    pub async fn read_memory(&mut self, addr: u64, length: u64) -> Result<Vec<u8>> {
        self.presentation()?
            .exchange(ReadMemory::new(addr, length))
            .await
    }

    /// Writes `data` to target memory at `addr`.
    pub async fn write_memory(&mut self, addr: u64, data: Vec<u8>) -> Result<()> {
        self.presentation()?
            .exchange(WriteMemory::new(addr, data))
            .await
    }

    /// Reads the general register block.
    pub async fn read_registers(&mut self) -> Result<Vec<u8>> {
        self.presentation()?.exchange(ReadRegisters).await
    }

    /// Reads register `number`.
    pub async fn read_register(&mut self, number: u32) -> Result<Register> {
        self.presentation()?
            .exchange(ReadRegister::new(number))
            .await
    }

    /// Writes `value` into register `number`.
    pub async fn write_register(&mut self, number: u32, value: Vec<u8>) -> Result<()> {
        self.presentation()?
            .exchange(WriteRegister::new(number, value))
            .await
    }

    /// Resumes the target and waits until it stops.
    pub async fn resume(&mut self, addr: Option<u64>) -> Result<StopReply> {
        let command = addr.map_or_else(Continue::default, Continue::at);
        self.presentation()?.exchange(command).await
    }

    /// Executes one instruction.
    pub async fn step(&mut self, addr: Option<u64>) -> Result<StopReply> {
        let command = addr.map_or_else(Step::default, Step::at);
        self.presentation()?.exchange(command).await
    }

    /// Asks why the target is halted.
    pub async fn halt_reason(&mut self) -> Result<StopReply> {
        self.presentation()?.exchange(HaltReason).await
    }

    /// Interrupts a running target.
    pub async fn interrupt(&mut self) -> Result<StopReply> {
        self.presentation()?.send_interrupt().await
    }

    /// Detaches from the target and closes the connection.
    pub async fn detach(&mut self) -> Result<()> {
        self.presentation()?.exchange(Detach).await?;
        self.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_require_a_connection() {
        let mut client = Client::new(Endpoint::tcp("127.0.0.1", 1), Config::default());
        assert!(!client.is_connected());
        assert!(matches!(
            client.read_memory(0, 4).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(client.canceller(), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_harmless() {
        let mut client = Client::new(Endpoint::tcp("127.0.0.1", 1), Config::default());
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
    }
}
