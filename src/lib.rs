//! fbblink: client-side F6FBB / Winlink B2F forwarding engine
//!
//! Implements the FBB store-and-forward session protocol with the B2F
//! binary extensions over a pluggable transport stack: plain TCP,
//! KISS/XKISS framing with an AX.25 v2.0 connected-mode link, or an
//! AGWPE SoundCard-TNC engine.
//!
//! A session queues [`core::Message`]s, negotiates capabilities through
//! the SID exchange, batches proposals, streams accepted bodies (LZHUF
//! or gzip compressed in binary mode) and optionally inverts roles to
//! take the peer's traffic:
//!
//! ```no_run
//! use fbblink::core::{Callsign, Message, MessageType};
//! use fbblink::session::{Session, SessionConfig};
//! use fbblink::transport::TcpTransport;
//!
//! # async fn run() -> fbblink::Result<()> {
//! let my_call = Callsign::parse("KE4AHR")?;
//! let mut config = SessionConfig::new(my_call);
//! config.enable_reverse = true;
//!
//! let transport = TcpTransport::new("bbs.example.org", 6300);
//! let mut session = Session::new(Box::new(transport), config);
//! session.queue_message(Message::new(
//!     MessageType::Private,
//!     "KE4AHR",
//!     "W1AW",
//!     "TEST001",
//!     "Hello",
//!     b"73 de KE4AHR".to_vec(),
//! )?);
//!
//! let report = session.connect().await?;
//! println!("sent {} bytes", report.bytes_sent);
//! # Ok(())
//! # }
//! ```

pub mod agwpe;
pub mod ax25;
pub mod b2f;
pub mod core;
pub mod kiss;
pub mod lzhuf;
pub mod session;
pub mod transport;

// Re-export commonly used items
pub use crate::core::{Error, Result};
pub use crate::session::{Session, SessionConfig};
pub use crate::transport::Transport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
