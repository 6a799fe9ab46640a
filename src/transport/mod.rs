//! Transport abstraction
//!
//! The session engine depends only on this contract; implementations
//! cover plain TCP, KISS + AX.25 connected mode, and AGWPE.

pub mod agwpe;
pub mod kiss_ax25;
pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::Result;

pub use self::agwpe::{AgwpeConfig, AgwpeTransport};
pub use self::kiss_ax25::{KissAx25Transport, KissConfig};
pub use self::tcp::TcpTransport;

/// Uniform byte-stream contract between the session engine and the wire.
///
/// `read` returning an empty buffer means the peer ended the stream.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the underlying connection or link
    async fn open(&mut self) -> Result<()>;

    /// Writes the whole buffer
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Reads up to `max` bytes, blocking until something arrives
    async fn read(&mut self, max: usize) -> Result<Bytes>;

    /// Tears the connection down
    async fn close(&mut self) -> Result<()>;
}
