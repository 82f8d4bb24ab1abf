//! Error types for rsp operations.

use std::io;

/// Alias for `Result<T, rsp::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the protocol stack.
///
/// Malformed frames never appear here: they are answered with a
/// not-acknowledge and retried until the attempt budget runs out, which is
/// reported as [`Error::ProtocolViolation`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport could not be opened.
    #[error("cannot connect to {endpoint}")]
    Connect {
        /// Endpoint as given by the caller.
        endpoint: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// An endpoint string could not be parsed.
    #[error("invalid endpoint `{0}`: expected HOST:PORT or unix:PATH")]
    InvalidEndpoint(String),

    /// The byte stream failed. Fatal to the connection.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The stub closed the byte stream.
    #[error("connection closed by the stub")]
    Closed,

    /// The retry budget of an exchange ran out. The connection stays usable.
    #[error("{operation} failed after {attempts} attempts")]
    ProtocolViolation {
        /// The phase of the exchange that gave up (`send` or `receive`).
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A pending read was cancelled on request.
    #[error("read cancelled")]
    Cancelled,

    /// The stub answered with an `Exx` error reply.
    #[error("stub reported error E{code:02x}")]
    Target {
        /// Error code reported by the stub.
        code: u8,
    },

    /// The stub answered with an empty packet.
    #[error("stub does not support `{opcode}` packets")]
    Unsupported {
        /// Opcode of the rejected command.
        opcode: &'static str,
    },

    /// The client has no live connection.
    #[error("not connected")]
    NotConnected,
}

impl Error {
    /// Returns `true` for the expected outcome of a cancelled read.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
