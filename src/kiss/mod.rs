//! KISS / XKISS TNC framing
//!
//! Byte-oriented FEND/FESC framing between the host and a TNC, with the
//! XKISS extensions: optional 8-bit checksum trailer, multi-drop address
//! nibble, and master polling of slave TNCs.

pub mod codec;
pub mod poll;

pub use self::codec::{KissCodec, KissCommand, KissFrame, TncParams};
pub use self::poll::PollScheduler;

/// Frame delimiter
pub const FEND: u8 = 0xC0;
/// Escape byte
pub const FESC: u8 = 0xDB;
/// Escaped FEND
pub const TFEND: u8 = 0xDC;
/// Escaped FESC
pub const TFESC: u8 = 0xDD;

/// Default master-poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
