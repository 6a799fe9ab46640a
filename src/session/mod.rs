//! FBB forwarding session engine
//!
//! SID negotiation, proposal batching, FS verdict handling, body
//! streaming with resume, authentication, traffic limiting and reverse
//! forwarding, over any [`crate::transport::Transport`].

pub mod engine;
pub mod proposal;
pub mod sid;

pub use self::engine::{Session, SessionConfig};
pub use self::proposal::{Proposal, ProposalKind, Verdict};
pub use self::sid::{Sid, SidFeatures};
