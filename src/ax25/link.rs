use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::core::{Callsign, Error, Result};
use super::address::Ax25Address;
use super::frame::{Ax25Frame, FrameType};
use super::{DEFAULT_MAX_RETRIES, DEFAULT_T1_SECS, DEFAULT_WINDOW, MAX_INFO_LEN};

/// Data-link configuration for one AX.25 connection
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Local station
    pub my_call: Callsign,
    /// Remote station
    pub remote_call: Callsign,
    /// Digipeater path, outbound order
    pub path: Vec<Callsign>,
    /// Window size k (1-7, modulo-8)
    pub window: u8,
    /// T1 retransmission timeout
    pub t1: Duration,
    /// Retry bound N2
    pub max_retries: u8,
}

impl LinkConfig {
    /// Creates a configuration with protocol defaults
    pub fn new(my_call: Callsign, remote_call: Callsign) -> Self {
        LinkConfig {
            my_call,
            remote_call,
            path: Vec::new(),
            window: DEFAULT_WINDOW,
            t1: Duration::from_secs(DEFAULT_T1_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.window == 0 || self.window > 7 {
            return Err(Error::config(format!("window must be 1-7, got {}", self.window)));
        }
        if self.path.len() > 8 {
            return Err(Error::config("digipeater path longer than 8"));
        }
        Ok(())
    }
}

/// Connection state per AX.25 v2.0 §4.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    AwaitingConnect,
    Connected,
    TimerRecovery,
    AwaitingRelease,
}

/// Output of the state machine; the link driver executes these
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    /// Put this frame on the air
    Transmit(Ax25Frame),
    /// In-sequence I-frame payload for the layer above
    Deliver(Bytes),
    /// Link established
    Connected,
    /// SABM answered with DM
    ConnectRefused,
    /// Local close completed
    Closed,
    /// Remote sent DISC mid-session
    PeerClosed,
    /// Retries exhausted or link reset by peer
    Failed(String),
}

#[derive(Debug, Default)]
struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    fn start(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    fn stop(&mut self) {
        self.deadline = None;
    }

    fn running(&self) -> bool {
        self.deadline.is_some()
    }
}

/// AX.25 v2.0 connected-mode data-link state machine.
///
/// Sans-io: frames go in through [`DataLink::on_frame`], timer expiry
/// through [`DataLink::on_t1_expiry`], and every input returns the actions
/// the driver must carry out. Modulo-8 operation only.
#[derive(Debug)]
pub struct DataLink {
    config: LinkConfig,
    state: LinkState,
    /// Send state variable V(S)
    vs: u8,
    /// Receive state variable V(R)
    vr: u8,
    /// Acknowledge state variable V(A)
    va: u8,
    retry: u8,
    t1: Timer,
    /// Sent-but-unacknowledged I payloads with their N(S)
    unacked: VecDeque<(u8, Bytes)>,
    /// Segmented payloads not yet put in the window
    pending: VecDeque<Bytes>,
    peer_busy: bool,
    rej_sent: bool,
}

impl DataLink {
    /// Creates a data link in the Disconnected state
    pub fn new(config: LinkConfig) -> Result<Self> {
        config.validate()?;
        Ok(DataLink {
            config,
            state: LinkState::Disconnected,
            vs: 0,
            vr: 0,
            va: 0,
            retry: 0,
            t1: Timer::default(),
            unacked: VecDeque::new(),
            pending: VecDeque::new(),
            peer_busy: false,
            rej_sent: false,
        })
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Instant at which [`DataLink::on_t1_expiry`] must be called, if T1 runs
    pub fn t1_deadline(&self) -> Option<Instant> {
        self.t1.deadline
    }

    /// Number of I-frames the window can still take
    pub fn window_available(&self) -> u8 {
        self.config.window - (self.vs.wrapping_sub(self.va) & 0x07)
    }

    fn make_frame(&self, frame_type: FrameType, command: bool, info: Bytes) -> Ax25Frame {
        let digis = self.config.path.iter()
            .map(|c| Ax25Address::new(c.clone()))
            .collect();
        Ax25Frame::new(
            Ax25Address::new(self.config.remote_call.clone()),
            Ax25Address::new(self.config.my_call.clone()),
            digis,
            frame_type,
            command,
            info,
        )
    }

    fn reset_vars(&mut self) {
        self.vs = 0;
        self.vr = 0;
        self.va = 0;
        self.retry = 0;
        self.unacked.clear();
        self.peer_busy = false;
        self.rej_sent = false;
    }

    /// Initiates the connection with SABM P=1
    pub fn connect(&mut self) -> Vec<LinkAction> {
        debug!(remote = %self.config.remote_call, "sending SABM");
        self.reset_vars();
        self.state = LinkState::AwaitingConnect;
        self.t1.start(self.config.t1);
        vec![LinkAction::Transmit(
            self.make_frame(FrameType::Sabm { poll: true }, true, Bytes::new()),
        )]
    }

    /// Initiates release with DISC P=1
    pub fn close(&mut self) -> Vec<LinkAction> {
        match self.state {
            LinkState::Disconnected => vec![LinkAction::Closed],
            LinkState::AwaitingRelease => Vec::new(),
            _ => {
                debug!(remote = %self.config.remote_call, "sending DISC");
                self.state = LinkState::AwaitingRelease;
                self.retry = 0;
                self.t1.start(self.config.t1);
                vec![LinkAction::Transmit(
                    self.make_frame(FrameType::Disc { poll: true }, true, Bytes::new()),
                )]
            }
        }
    }

    /// Queues user data for transmission, segmented to the I-field limit
    pub fn send(&mut self, data: &[u8]) -> Vec<LinkAction> {
        for chunk in data.chunks(MAX_INFO_LEN) {
            self.pending.push_back(Bytes::copy_from_slice(chunk));
        }
        let mut out = Vec::new();
        self.pump(&mut out);
        out
    }

    /// Emits I-frames while the window has room and the peer is not busy
    fn pump(&mut self, out: &mut Vec<LinkAction>) {
        if self.state != LinkState::Connected || self.peer_busy {
            return;
        }
        while self.window_available() > 0 {
            let Some(payload) = self.pending.pop_front() else { break };
            let frame = self.make_frame(
                FrameType::I { ns: self.vs, nr: self.vr, poll: false },
                true,
                payload.clone(),
            );
            self.unacked.push_back((self.vs, payload));
            self.vs = (self.vs + 1) & 0x07;
            if !self.t1.running() {
                self.t1.start(self.config.t1);
            }
            out.push(LinkAction::Transmit(frame));
        }
    }

    /// Applies an N(R) acknowledgement; returns false when N(R) is invalid
    fn apply_ack(&mut self, nr: u8) -> bool {
        let outstanding = self.vs.wrapping_sub(self.va) & 0x07;
        let acked = nr.wrapping_sub(self.va) & 0x07;
        if acked > outstanding {
            warn!(nr, va = self.va, vs = self.vs, "ignoring N(R) outside window");
            return false;
        }
        for _ in 0..acked {
            self.unacked.pop_front();
        }
        self.va = nr;
        if self.va == self.vs {
            self.t1.stop();
            self.retry = 0;
        } else {
            self.t1.start(self.config.t1);
        }
        true
    }

    /// Re-emits every unacknowledged I-frame starting at N(S) = `from`
    fn retransmit_from(&mut self, from: u8, out: &mut Vec<LinkAction>) {
        let mut started = false;
        let frames: Vec<Ax25Frame> = self.unacked.iter()
            .filter(|(ns, _)| {
                started |= *ns == from;
                started
            })
            .map(|(ns, payload)| {
                self.make_frame(
                    FrameType::I { ns: *ns, nr: self.vr, poll: false },
                    true,
                    payload.clone(),
                )
            })
            .collect();
        if !frames.is_empty() {
            self.t1.start(self.config.t1);
        }
        out.extend(frames.into_iter().map(LinkAction::Transmit));
    }

    /// Feeds one received frame through the state machine
    pub fn on_frame(&mut self, frame: &Ax25Frame) -> Vec<LinkAction> {
        // Only traffic addressed to us from our peer
        if frame.dest.call != self.config.my_call
            || frame.source.call != self.config.remote_call
        {
            return Vec::new();
        }
        let mut out = Vec::new();
        match self.state {
            LinkState::Disconnected => {
                // Anything but an enquiry is answered with DM
                if matches!(frame.frame_type, FrameType::Sabm { .. } | FrameType::Disc { .. }) {
                    out.push(LinkAction::Transmit(
                        self.make_frame(FrameType::Dm { fin: true }, false, Bytes::new()),
                    ));
                }
            }
            LinkState::AwaitingConnect => match frame.frame_type {
                FrameType::Ua { .. } => {
                    debug!(remote = %self.config.remote_call, "UA received, link up");
                    self.t1.stop();
                    self.reset_vars();
                    self.state = LinkState::Connected;
                    out.push(LinkAction::Connected);
                    self.pump(&mut out);
                }
                FrameType::Dm { .. } => {
                    warn!(remote = %self.config.remote_call, "SABM refused with DM");
                    self.t1.stop();
                    self.state = LinkState::Disconnected;
                    out.push(LinkAction::ConnectRefused);
                }
                _ => {}
            },
            LinkState::Connected | LinkState::TimerRecovery => {
                self.on_frame_connected(frame, &mut out);
            }
            LinkState::AwaitingRelease => match frame.frame_type {
                FrameType::Ua { .. } | FrameType::Dm { .. } => {
                    self.t1.stop();
                    self.state = LinkState::Disconnected;
                    out.push(LinkAction::Closed);
                }
                _ => {}
            },
        }
        out
    }

    fn on_frame_connected(&mut self, frame: &Ax25Frame, out: &mut Vec<LinkAction>) {
        let in_recovery = self.state == LinkState::TimerRecovery;
        match frame.frame_type {
            FrameType::I { ns, nr, poll } => {
                self.apply_ack(nr);
                if ns == self.vr {
                    self.vr = (self.vr + 1) & 0x07;
                    self.rej_sent = false;
                    out.push(LinkAction::Deliver(frame.info.clone()));
                    out.push(LinkAction::Transmit(self.make_frame(
                        FrameType::Rr { nr: self.vr, poll },
                        false,
                        Bytes::new(),
                    )));
                } else if !self.rej_sent {
                    warn!(ns, vr = self.vr, "out-of-sequence I-frame, sending REJ");
                    self.rej_sent = true;
                    out.push(LinkAction::Transmit(self.make_frame(
                        FrameType::Rej { nr: self.vr, poll },
                        false,
                        Bytes::new(),
                    )));
                }
                self.pump(out);
            }
            FrameType::Rr { nr, poll } => {
                self.peer_busy = false;
                if in_recovery && !frame.is_command() && poll {
                    // F=1 answers our enquiry: fall back to Connected and
                    // retransmit whatever is still outstanding
                    self.apply_ack(nr);
                    self.state = LinkState::Connected;
                    self.retry = 0;
                    self.retransmit_from(self.va, out);
                } else {
                    self.apply_ack(nr);
                    if frame.is_command() && poll {
                        out.push(LinkAction::Transmit(self.make_frame(
                            FrameType::Rr { nr: self.vr, poll: true },
                            false,
                            Bytes::new(),
                        )));
                    }
                }
                self.pump(out);
            }
            FrameType::Rnr { nr, poll } => {
                debug!("peer busy (RNR)");
                self.peer_busy = true;
                if in_recovery && !frame.is_command() && poll {
                    self.apply_ack(nr);
                    self.state = LinkState::Connected;
                    self.retry = 0;
                } else {
                    self.apply_ack(nr);
                    if frame.is_command() && poll {
                        out.push(LinkAction::Transmit(self.make_frame(
                            FrameType::Rr { nr: self.vr, poll: true },
                            false,
                            Bytes::new(),
                        )));
                    }
                }
                // T1 keeps running on whatever is outstanding
                if !self.unacked.is_empty() && !self.t1.running() {
                    self.t1.start(self.config.t1);
                }
            }
            FrameType::Rej { nr, poll } => {
                warn!(nr, "REJ received, retransmitting");
                self.peer_busy = false;
                if self.apply_ack(nr) {
                    self.retransmit_from(nr, out);
                }
                if frame.is_command() && poll {
                    out.push(LinkAction::Transmit(self.make_frame(
                        FrameType::Rr { nr: self.vr, poll: true },
                        false,
                        Bytes::new(),
                    )));
                }
                if in_recovery {
                    self.state = LinkState::Connected;
                    self.retry = 0;
                }
                self.pump(out);
            }
            FrameType::Sabm { .. } => {
                // Peer re-establishing; accept and reset
                debug!("SABM while connected, resetting link");
                self.reset_vars();
                self.state = LinkState::Connected;
                out.push(LinkAction::Transmit(
                    self.make_frame(FrameType::Ua { fin: true }, false, Bytes::new()),
                ));
            }
            FrameType::Disc { .. } => {
                debug!("DISC received mid-session");
                self.t1.stop();
                self.state = LinkState::Disconnected;
                out.push(LinkAction::Transmit(
                    self.make_frame(FrameType::Ua { fin: true }, false, Bytes::new()),
                ));
                out.push(LinkAction::PeerClosed);
            }
            FrameType::Dm { .. } => {
                warn!("DM received while connected, link reset by peer");
                self.t1.stop();
                self.state = LinkState::Disconnected;
                out.push(LinkAction::Failed("link reset by peer (DM)".into()));
            }
            _ => {}
        }
    }

    /// Drives retry behaviour when T1 fires
    pub fn on_t1_expiry(&mut self) -> Vec<LinkAction> {
        let mut out = Vec::new();
        match self.state {
            LinkState::AwaitingConnect => {
                if self.retry < self.config.max_retries {
                    self.retry += 1;
                    debug!(retry = self.retry, "T1 expiry, resending SABM");
                    self.t1.start(self.config.t1);
                    out.push(LinkAction::Transmit(
                        self.make_frame(FrameType::Sabm { poll: true }, true, Bytes::new()),
                    ));
                } else {
                    warn!("connection attempt failed, retries exhausted");
                    self.t1.stop();
                    self.state = LinkState::Disconnected;
                    out.push(LinkAction::Failed("SABM retries exhausted".into()));
                }
            }
            LinkState::Connected => {
                debug!("T1 expiry, entering timer recovery");
                self.state = LinkState::TimerRecovery;
                self.retry = 0;
                self.t1.start(self.config.t1);
                out.push(LinkAction::Transmit(
                    self.make_frame(FrameType::Rr { nr: self.vr, poll: true }, true, Bytes::new()),
                ));
            }
            LinkState::TimerRecovery => {
                if self.retry < self.config.max_retries {
                    self.retry += 1;
                    debug!(retry = self.retry, "T1 expiry in recovery, re-polling");
                    self.t1.start(self.config.t1);
                    out.push(LinkAction::Transmit(
                        self.make_frame(FrameType::Rr { nr: self.vr, poll: true }, true, Bytes::new()),
                    ));
                } else {
                    warn!("link failure, retries exhausted in recovery");
                    self.t1.stop();
                    self.state = LinkState::Disconnected;
                    out.push(LinkAction::Transmit(
                        self.make_frame(FrameType::Dm { fin: false }, false, Bytes::new()),
                    ));
                    out.push(LinkAction::Failed("T1 retries exhausted".into()));
                }
            }
            LinkState::AwaitingRelease => {
                if self.retry < self.config.max_retries {
                    self.retry += 1;
                    self.t1.start(self.config.t1);
                    out.push(LinkAction::Transmit(
                        self.make_frame(FrameType::Disc { poll: true }, true, Bytes::new()),
                    ));
                } else {
                    self.t1.stop();
                    self.state = LinkState::Disconnected;
                    out.push(LinkAction::Closed);
                }
            }
            LinkState::Disconnected => {}
        }
        out
    }
}
