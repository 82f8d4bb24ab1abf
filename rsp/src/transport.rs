//! Byte-stream transports a stub can be reached over.

use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::{Error, Result};

/// Any bidirectional byte stream usable by a [`Session`](crate::Session).
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}

/// Where the stub listens.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Endpoint {
    /// `host:port`, e.g. a QEMU or OpenOCD gdbserver.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// `unix:/path/to/socket`.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    /// A TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        #[cfg(unix)]
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::InvalidEndpoint(s.to_owned()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidEndpoint(s.to_owned()))?;
        let port = port
            .parse()
            .map_err(|_| Error::InvalidEndpoint(s.to_owned()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::InvalidEndpoint(s.to_owned()));
        }
        Ok(Self::tcp(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Opens a byte stream to `endpoint`.
pub async fn connect(endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
    let failed = |source| Error::Connect {
        endpoint: endpoint.to_string(),
        source,
    };

    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(failed)?;
            stream.set_nodelay(true).map_err(failed)?;
            debug!(%endpoint, "tcp transport open");
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await.map_err(failed)?;
            debug!(%endpoint, "unix transport open");
            Ok(Box::new(stream))
        }
    }
}
