//! AX.25 v2.0 link layer
//!
//! Address and frame codecs plus the connected-mode data-link state
//! machine (SABM/UA/DISC, I/S frame handling, modulo-8 windowed
//! retransmission with T1).

pub mod address;
pub mod frame;
pub mod link;

pub use self::address::{Ax25Address, fcs, fcs_check};
pub use self::frame::{Ax25Frame, FrameType};
pub use self::link::{DataLink, LinkAction, LinkConfig, LinkState};

/// No layer 3 protocol
pub const PID_NO_L3: u8 = 0xF0;

/// Default T1 retransmission timeout in seconds
pub const DEFAULT_T1_SECS: u64 = 10;

/// Default retry bound (N2)
pub const DEFAULT_MAX_RETRIES: u8 = 10;

/// Default window size (k), at most 7 for modulo-8 operation
pub const DEFAULT_WINDOW: u8 = 4;

/// Largest information field we place in one I-frame
pub const MAX_INFO_LEN: usize = 256;
