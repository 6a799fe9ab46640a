use std::time::Duration;

use bytes::{Buf, BytesMut};
use md5::{Digest, Md5};
use tracing::{debug, info, warn};

use crate::b2f::{self, BlockDecoder};
use crate::core::{
    Callsign, DeliveryStatus, Error, MemoryResumeStore, Message, MessageOutcome, Result,
    ResumeStore, SessionReport, DEFAULT_MAX_PAYLOAD, DEFAULT_READ_TIMEOUT_SECS, MAX_PROPOSALS,
};
use crate::lzhuf;
use crate::transport::Transport;
use super::proposal::{self, Proposal, ProposalKind, Verdict};
use super::sid::{Sid, SidFeatures};

/// End-of-body marker for ASCII transfers (SUB, CTRL-Z)
const ASCII_EOT: u8 = 0x1A;

/// Session parameters, passed in by the caller; the engine reads no
/// environment of its own
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local station
    pub my_call: Callsign,
    /// Implementation name placed in the SID
    pub sid_name: String,
    /// Implementation version placed in the SID
    pub sid_version: String,
    /// Use compressed transfers when the peer is capable
    pub use_binary: bool,
    /// Use gzip instead of LZHUF when both sides advertise it
    pub use_gzip: bool,
    /// Advertise the proposal batch checksum (`M`)
    pub offer_checksum: bool,
    /// Advertise extended forwarding with resume offsets (`X`)
    pub offer_xfwd: bool,
    /// Invite the peer to forward to us after our queue drains (`FF`)
    pub enable_reverse: bool,
    /// Ask the peer to forward first (`FR`)
    pub initiate_reverse: bool,
    /// Shared secret for the `;PQ`/`;PR` challenge
    pub secret: Option<String>,
    /// Session byte budget honoured when the peer asserts `H`
    pub traffic_limit: Option<u64>,
    /// Additional accounts announced with `;FW:`
    pub fw_accounts: Vec<Callsign>,
    /// Ceiling on a received message's declared payload
    pub max_payload: u64,
    /// Transport read timeout
    pub read_timeout: Duration,
}

impl SessionConfig {
    /// Configuration with protocol defaults for a local station
    pub fn new(my_call: Callsign) -> Self {
        SessionConfig {
            my_call,
            sid_name: "FBL".into(),
            sid_version: crate::VERSION.into(),
            use_binary: true,
            use_gzip: false,
            offer_checksum: true,
            offer_xfwd: true,
            enable_reverse: false,
            initiate_reverse: false,
            secret: None,
            traffic_limit: None,
            fw_accounts: Vec::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
        }
    }
}

/// One queued outbound message with its running status
#[derive(Debug)]
struct Outbound {
    msg: Message,
    status: Option<DeliveryStatus>,
}

/// Body transfer prepared while proposing, consumed when accepted
struct PendingTransfer {
    queue_index: usize,
    kind: ProposalKind,
    /// Full transfer block (compressed for FB/FC, raw body for FA)
    block: Vec<u8>,
    /// Offset already proposed to the peer
    offset: u64,
    size: u64,
}

/// A forwarding session over one transport.
///
/// The engine is strictly sequential: it alternates reads and writes on
/// the transport and runs until `FQ` or an error closes the session.
pub struct Session {
    transport: Box<dyn Transport>,
    config: SessionConfig,
    resume: Box<dyn ResumeStore>,
    queue: Vec<Outbound>,
    received: Vec<Message>,
    peer_sid: Option<Sid>,
    rx: BytesMut,
    bytes_sent: u64,
    bytes_received: u64,
    limit_latched: bool,
    offered: bool,
    closed: bool,
}

impl Session {
    /// Creates a session over a transport with an in-memory resume store
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        Session::with_resume_store(transport, config, Box::new(MemoryResumeStore::new()))
    }

    /// Creates a session with caller-persisted resume state
    pub fn with_resume_store(
        transport: Box<dyn Transport>,
        config: SessionConfig,
        resume: Box<dyn ResumeStore>,
    ) -> Self {
        Session {
            transport,
            config,
            resume,
            queue: Vec::new(),
            received: Vec::new(),
            peer_sid: None,
            rx: BytesMut::new(),
            bytes_sent: 0,
            bytes_received: 0,
            limit_latched: false,
            offered: false,
            closed: false,
        }
    }

    /// Queues a message for forwarding
    pub fn queue_message(&mut self, msg: Message) {
        self.queue.push(Outbound { msg, status: None });
    }

    /// Messages received so far, also available after a failed session
    pub fn get_received_messages(&self) -> &[Message] {
        &self.received
    }

    /// Peer capabilities once the SID exchange has happened
    pub fn peer_sid(&self) -> Option<&Sid> {
        self.peer_sid.as_ref()
    }

    /// Builds the session report from current state
    pub fn report(&self) -> SessionReport {
        SessionReport {
            outcomes: self
                .queue
                .iter()
                .map(|o| MessageOutcome {
                    mid: o.msg.mid.clone(),
                    status: o.status.unwrap_or(DeliveryStatus::Unsent),
                })
                .collect(),
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            limit_hit: self.limit_latched,
        }
    }

    /// Runs the whole forwarding session.
    ///
    /// Returns normally on clean session end, including a partial session
    /// under the peer's traffic limit; the report carries per-message
    /// outcomes. On error the transport is closed and outstanding
    /// messages keep their unsent status.
    pub async fn connect(&mut self) -> Result<SessionReport> {
        let result = self.run().await;
        let _ = self.transport.close().await;
        match result {
            Ok(()) => {
                info!(
                    sent = self.bytes_sent,
                    received = self.bytes_received,
                    "session closed"
                );
                Ok(self.report())
            }
            Err(e) => {
                warn!(error = %e, "session aborted");
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> Result<()> {
        self.transport.open().await?;
        info!(my_call = %self.config.my_call, "session starting");

        // Peer speaks first: skip banner lines until the bracketed SID
        let peer_sid = loop {
            let line = self.read_line().await?;
            if Sid::is_sid_line(&line) {
                break Sid::parse(&line)?;
            }
            debug!(banner = %line, "pre-SID banner line");
        };
        info!(peer = %peer_sid.name, version = %peer_sid.version, "peer SID received");
        self.peer_sid = Some(peer_sid);

        let our_sid = self.our_sid();
        self.write_line(&our_sid.to_string()).await?;
        if !self.config.fw_accounts.is_empty() {
            let calls: Vec<String> =
                self.config.fw_accounts.iter().map(|c| c.to_string()).collect();
            self.write_line(&format!(";FW: {}", calls.join(" "))).await?;
        }

        let quit = self.await_prompt().await?;
        if quit {
            self.closed = true;
            return Ok(());
        }

        if self.config.initiate_reverse {
            self.write_line("FR").await?;
            self.acceptor_phase().await?;
        } else {
            self.offerer_phase().await?;
            self.finish_after_offer().await?;
        }
        Ok(())
    }

    fn our_sid(&self) -> Sid {
        Sid::build(
            &self.config.sid_name,
            &self.config.sid_version,
            SidFeatures {
                fbb_basic: true,
                binary: true,
                b1: true,
                gzip: self.config.use_gzip,
                traffic_limit: self.config.traffic_limit.is_some(),
                proposal_checksum: self.config.offer_checksum,
                xfwd: self.config.offer_xfwd,
                terminator: true,
            },
        )
    }

    fn peer_features(&self) -> SidFeatures {
        self.peer_sid.as_ref().map(|s| s.features).unwrap_or_default()
    }

    /// Consumes greeting lines after our SID: answers `;PQ` challenges and
    /// returns once the peer's prompt (a line ending in `>`) arrives.
    /// Returns true when the peer quit instead of prompting.
    async fn await_prompt(&mut self) -> Result<bool> {
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                continue;
            }
            if let Some(nonce) = line.strip_prefix(";PQ") {
                self.answer_challenge(nonce.trim()).await?;
            } else if line == "FQ" {
                debug!("peer quit before prompt");
                return Ok(true);
            } else if line.ends_with('>') {
                return Ok(false);
            } else {
                debug!(banner = %line, "greeting line");
            }
        }
    }

    async fn answer_challenge(&mut self, nonce: &str) -> Result<()> {
        let Some(secret) = self.config.secret.clone() else {
            return Err(Error::auth("peer sent ;PQ challenge but no secret is configured"));
        };
        let mut hasher = Md5::new();
        hasher.update(nonce.as_bytes());
        hasher.update(secret.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        info!("answering auth challenge");
        self.write_line(&format!(";PR {}", hex)).await
    }

    /// Chooses the wire form for one message against the peer's abilities
    fn pick_kind(&self, msg: &Message) -> ProposalKind {
        let peer = self.peer_features();
        if self.config.use_binary && peer.binary {
            if peer.b1 {
                ProposalKind::B2f
            } else {
                ProposalKind::Binary
            }
        } else {
            if !msg.files.is_empty() {
                warn!(mid = %msg.mid, "attachments dropped: peer is ASCII-only");
            }
            ProposalKind::Ascii
        }
    }

    fn compress_block(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.config.use_gzip && self.peer_features().gzip {
            lzhuf::gzip_compress(data)
        } else {
            Ok(lzhuf::compress(data))
        }
    }

    fn decompress_block(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.config.use_gzip && self.peer_features().gzip {
            lzhuf::gzip_decompress(data)
        } else {
            lzhuf::decompress(data)
        }
    }

    /// Offers batches of up to five proposals until the queue drains or
    /// the traffic limit latches
    async fn offerer_phase(&mut self) -> Result<()> {
        self.offered = true;
        loop {
            if self.limit_latched {
                self.defer_remaining();
                return Ok(());
            }
            if let (Some(limit), true) =
                (self.config.traffic_limit, self.peer_features().traffic_limit)
            {
                if self.bytes_sent >= limit {
                    warn!(limit, "traffic budget exhausted, no further batches");
                    self.limit_latched = true;
                    self.defer_remaining();
                    return Ok(());
                }
            }

            let batch = self.build_batch()?;
            if batch.is_empty() {
                return Ok(());
            }

            let lines: Vec<String> =
                batch.iter().map(|(p, _)| p.to_line()).collect();
            for line in &lines {
                self.write_line(line).await?;
            }
            self.write_line(&proposal::batch_end_line(&lines)).await?;

            let fs_line = loop {
                let line = self.read_line().await?;
                if line.is_empty() || line.starts_with(';') {
                    continue;
                }
                if line.starts_with("FS") {
                    break line;
                }
                return Err(Error::protocol(format!("expected FS reply, got {:?}", line)));
            };
            let verdicts = proposal::parse_fs_line(&fs_line, batch.len())?;

            self.apply_verdicts(batch, verdicts).await?;
        }
    }

    /// Builds one proposal batch, resolving resume offsets and preparing
    /// transfer blocks
    fn build_batch(&mut self) -> Result<Vec<(Proposal, PendingTransfer)>> {
        let mut batch = Vec::new();
        let peer_xfwd = self.peer_features().xfwd;
        for i in 0..self.queue.len() {
            if batch.len() == MAX_PROPOSALS {
                break;
            }
            if self.queue[i].status.is_some() {
                continue;
            }
            let msg = self.queue[i].msg.clone();
            let kind = self.pick_kind(&msg);
            let (block, encoded_len) = match kind {
                ProposalKind::Ascii => (msg.body.clone(), msg.body.len() as u64),
                _ => {
                    let encoded = b2f::encode_message(&msg);
                    let len = encoded.len() as u64;
                    (self.compress_block(&encoded)?, len)
                }
            };
            let size = block.len() as u64;

            let offset = if peer_xfwd && kind != ProposalKind::Ascii {
                self.resume.get(&msg.mid).filter(|&off| off > 0)
            } else {
                None
            };
            if let Some(off) = offset {
                if off >= size {
                    // Peer already holds the whole block
                    debug!(mid = %msg.mid, "resume offset covers message, nothing to send");
                    self.queue[i].status = Some(DeliveryStatus::Sent);
                    self.resume.remove(&msg.mid);
                    continue;
                }
            }

            let mut proposal = Proposal::for_message(&msg, kind, size, offset);
            if kind == ProposalKind::B2f {
                proposal.uncompressed_size = Some(encoded_len);
            }
            batch.push((
                proposal,
                PendingTransfer {
                    queue_index: i,
                    kind,
                    block,
                    offset: offset.unwrap_or(0),
                    size,
                },
            ));
        }
        Ok(batch)
    }

    /// Applies FS verdicts positionally, then streams accepted bodies in
    /// verdict order
    async fn apply_verdicts(
        &mut self,
        batch: Vec<(Proposal, PendingTransfer)>,
        verdicts: Vec<Verdict>,
    ) -> Result<()> {
        let limit = self.config.traffic_limit;
        let peer_h = self.peer_features().traffic_limit;

        let mut to_stream: Vec<PendingTransfer> = Vec::new();
        let mut planned: u64 = 0;
        for ((_, mut transfer), verdict) in batch.into_iter().zip(verdicts) {
            let idx = transfer.queue_index;
            match verdict {
                Verdict::Accept => {
                    planned += transfer.size - transfer.offset;
                    to_stream.push(transfer);
                }
                Verdict::Offset(off) => {
                    if off >= transfer.size {
                        debug!(off, size = transfer.size, "peer holds full block");
                        let mid = self.queue[idx].msg.mid.clone();
                        self.queue[idx].status = Some(DeliveryStatus::Sent);
                        self.resume.remove(&mid);
                    } else {
                        transfer.offset = off;
                        planned += transfer.size - off;
                        to_stream.push(transfer);
                    }
                }
                Verdict::Reject => {
                    let over_budget = peer_h
                        && limit.is_some_and(|l| {
                            self.bytes_sent + planned + (transfer.size - transfer.offset) > l
                        });
                    if over_budget {
                        debug!(mid = %self.queue[idx].msg.mid, "deferred by peer traffic limit");
                        self.queue[idx].status = Some(DeliveryStatus::LimitDeferred);
                        self.limit_latched = true;
                    } else {
                        self.queue[idx].status = Some(DeliveryStatus::Rejected);
                    }
                }
                Verdict::BadFormat | Verdict::Error => {
                    self.queue[idx].status = Some(DeliveryStatus::Rejected);
                }
                Verdict::AlreadyHave => {
                    let mid = self.queue[idx].msg.mid.clone();
                    self.queue[idx].status = Some(DeliveryStatus::AlreadyHave);
                    self.resume.remove(&mid);
                }
                Verdict::NoResources => {
                    self.queue[idx].status = Some(DeliveryStatus::Deferred);
                }
                Verdict::Limit => {
                    self.queue[idx].status = Some(DeliveryStatus::LimitDeferred);
                    self.limit_latched = true;
                }
            }
        }

        // Bodies flow in the same order as their verdicts
        for transfer in to_stream {
            self.stream_body(&transfer).await?;
            let mid = self.queue[transfer.queue_index].msg.mid.clone();
            self.queue[transfer.queue_index].status = Some(DeliveryStatus::Sent);
            self.resume.remove(&mid);
        }
        Ok(())
    }

    async fn stream_body(&mut self, transfer: &PendingTransfer) -> Result<()> {
        let mid = self.queue[transfer.queue_index].msg.mid.clone();
        debug!(mid = %mid, size = transfer.size, offset = transfer.offset, "streaming body");
        match transfer.kind {
            ProposalKind::Ascii => {
                let mut body = transfer.block.clone();
                body.push(ASCII_EOT);
                self.write_bytes(&body).await?;
                self.bytes_sent += transfer.block.len() as u64;
            }
            _ => {
                let framed = b2f::frame_block(&transfer.block, transfer.offset);
                self.write_bytes(&framed).await?;
                self.bytes_sent += transfer.size - transfer.offset;
            }
        }
        Ok(())
    }

    fn defer_remaining(&mut self) {
        for entry in &mut self.queue {
            if entry.status.is_none() {
                entry.status = Some(DeliveryStatus::LimitDeferred);
            }
        }
    }

    /// After our queue is done: quit, or invert roles with `FF`
    async fn finish_after_offer(&mut self) -> Result<()> {
        if self.limit_latched || !self.config.enable_reverse {
            return self.send_quit().await;
        }
        self.write_line("FF").await?;
        Box::pin(self.acceptor_phase()).await
    }

    async fn send_quit(&mut self) -> Result<()> {
        self.write_line("FQ").await?;
        self.closed = true;
        Ok(())
    }

    /// Acceptor role: read proposal batches, answer verdicts, take bodies.
    /// Ends on `FQ`, or hands the turn back on `FF`.
    async fn acceptor_phase(&mut self) -> Result<()> {
        // Raw line text is kept for checksum verification
        let mut batch: Vec<std::result::Result<Proposal, String>> = Vec::new();
        let mut raw_lines: Vec<String> = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                continue;
            }
            // Anything shaped like `F<letter> ...` (except FS) is a proposal;
            // unknown kinds stay in the batch and draw an `=` verdict
            let proposal_shaped = line.len() > 3
                && line.as_bytes()[0] == b'F'
                && line.as_bytes()[1].is_ascii_uppercase()
                && line.as_bytes()[2] == b' '
                && !line.starts_with("FS");
            if proposal_shaped {
                if batch.len() == MAX_PROPOSALS {
                    return Err(Error::protocol("more than five proposals in a batch"));
                }
                raw_lines.push(line.clone());
                match Proposal::parse(&line) {
                    Ok(p) => batch.push(Ok(p)),
                    Err(e) => {
                        warn!(error = %e, line = %line, "unparseable proposal");
                        batch.push(Err(line));
                    }
                }
            } else if let Some(arg) = line.strip_prefix("F>") {
                if batch.is_empty() {
                    return Err(Error::protocol("batch terminator without proposals"));
                }
                let proposals = std::mem::take(&mut batch);
                let lines = std::mem::take(&mut raw_lines);
                self.take_batch(proposals, lines, arg.trim()).await?;
            } else if line == "FF" {
                if !self.offered && self.queue.iter().any(|o| o.status.is_none()) {
                    self.offerer_phase().await?;
                }
                return self.send_quit().await;
            } else if line == "FQ" {
                debug!("peer quit");
                self.closed = true;
                return Ok(());
            } else if line == "FR" {
                self.offerer_phase().await?;
                return self.finish_after_offer().await;
            } else if line.starts_with(';') {
                debug!(comment = %line, "comment line ignored");
            } else if line.starts_with("FS") {
                return Err(Error::protocol("FS reply without outstanding batch"));
            } else if line.starts_with('F') && line.len() <= 3 {
                return Err(Error::protocol(format!("unexpected command {:?}", line)));
            } else {
                debug!(text = %line, "free text ignored");
            }
        }
    }

    /// Verdicts for one incoming batch, then its bodies
    async fn take_batch(
        &mut self,
        batch: Vec<std::result::Result<Proposal, String>>,
        raw_lines: Vec<String>,
        checksum_arg: &str,
    ) -> Result<()> {
        if self.config.offer_checksum && !checksum_arg.is_empty() {
            let declared = u8::from_str_radix(checksum_arg, 16)
                .map_err(|_| Error::protocol(format!("bad batch checksum {:?}", checksum_arg)))?;
            let actual = proposal::batch_checksum(&raw_lines);
            if declared != actual {
                warn!(declared, actual, "batch checksum mismatch, rejecting batch");
                let verdicts = vec![Verdict::BadFormat; batch.len()];
                return self.write_line(&proposal::format_fs_line(&verdicts)).await;
            }
        }

        let mut verdicts = Vec::with_capacity(batch.len());
        for entry in &batch {
            let verdict = match entry {
                Err(_) => Verdict::BadFormat,
                Ok(p) => self.judge_proposal(p),
            };
            verdicts.push(verdict);
        }
        self.write_line(&proposal::format_fs_line(&verdicts)).await?;

        for (entry, verdict) in batch.into_iter().zip(verdicts) {
            let offset = match verdict {
                Verdict::Accept => 0,
                Verdict::Offset(off) => off,
                _ => continue,
            };
            // Unparseable entries drew an `=` verdict above
            let Ok(proposal) = entry else { continue };
            self.receive_body(&proposal, offset).await?;
        }
        Ok(())
    }

    /// Local acceptance policy for one proposal
    fn judge_proposal(&mut self, p: &Proposal) -> Verdict {
        if self.received.iter().any(|m| m.mid == p.mid) {
            return Verdict::AlreadyHave;
        }
        if let Some(limit) = self.config.traffic_limit {
            if self.bytes_received + p.size > limit {
                self.limit_latched = true;
                return Verdict::Limit;
            }
        }
        if let Some(off) = self.resume.get(&p.mid) {
            if off >= p.size {
                return Verdict::AlreadyHave;
            }
            if off > 0 && p.kind != ProposalKind::Ascii {
                return Verdict::Offset(off);
            }
        }
        Verdict::Accept
    }

    /// Reads one accepted body off the wire
    async fn receive_body(&mut self, p: &Proposal, offset: u64) -> Result<()> {
        debug!(mid = %p.mid, size = p.size, offset, "receiving body");
        match p.kind {
            ProposalKind::Ascii => {
                let body = self.read_until_sub().await?;
                self.bytes_received += body.len() as u64;
                let msg = self.ascii_message(p, body)?;
                self.received.push(msg);
            }
            _ => {
                let mut decoder = BlockDecoder::new();
                while !decoder.is_done() {
                    if self.rx.is_empty() {
                        self.fill().await?;
                    }
                    match decoder.feed(&self.rx) {
                        Ok(consumed) => self.rx.advance(consumed),
                        Err(e) => {
                            // Reject and wait for the peer to re-propose
                            warn!(mid = %p.mid, error = %e, "binary block damaged");
                            return self.write_line("FS =").await;
                        }
                    }
                }
                let block = decoder.into_data();
                self.bytes_received += block.len() as u64;
                if offset > 0 {
                    // The head of the block is missing; record progress and
                    // leave reassembly to the caller's resume store
                    self.resume.put(&p.mid, offset + block.len() as u64);
                    warn!(mid = %p.mid, offset, "partial block stored in resume state");
                    return Ok(());
                }
                let expected = p.size;
                if (block.len() as u64) < expected {
                    return Err(Error::protocol(format!(
                        "body shorter than declared: {} < {}", block.len(), expected,
                    )));
                }
                let decoded = self.decompress_block(&block)?;
                if let Some(uncompressed) = p.uncompressed_size {
                    if decoded.len() as u64 != uncompressed {
                        return Err(Error::protocol(format!(
                            "decompressed size {} does not match declared {}",
                            decoded.len(),
                            uncompressed,
                        )));
                    }
                }
                let msg = b2f::parse_message(&decoded, self.config.max_payload)?;
                self.resume.remove(&p.mid);
                self.received.push(msg);
            }
        }
        Ok(())
    }

    /// Wraps a plain ASCII body in a message built from the proposal fields
    fn ascii_message(&self, p: &Proposal, body: Vec<u8>) -> Result<Message> {
        if (body.len() as u64) < p.size {
            return Err(Error::protocol(format!(
                "body shorter than declared: {} < {}", body.len(), p.size,
            )));
        }
        Ok(Message {
            mid: p.mid.clone(),
            date: chrono::Utc::now().naive_utc(),
            msg_type: p.msg_type,
            from: p.from.clone().unwrap_or_default(),
            to: p.to.clone().into_iter().collect(),
            cc: Vec::new(),
            subject: String::new(),
            mbo: None,
            routing: p.routing.clone(),
            body,
            files: Vec::new(),
        })
    }

    // Transport plumbing -------------------------------------------------

    async fn fill(&mut self) -> Result<()> {
        let chunk = tokio::time::timeout(self.config.read_timeout, self.transport.read(4096))
            .await
            .map_err(|_| Error::transport("session read timed out"))??;
        if chunk.is_empty() {
            return Err(Error::transport("peer closed the connection"));
        }
        self.rx.extend_from_slice(&chunk);
        Ok(())
    }

    /// Reads one CR/LF/CRLF-terminated line, stripped of its terminator
    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.rx.iter().position(|&b| b == b'\r' || b == b'\n') {
                let line = self.rx.split_to(pos);
                let term = self.rx[0];
                self.rx.advance(1);
                if term == b'\r' && self.rx.first() == Some(&b'\n') {
                    self.rx.advance(1);
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                debug!(line = %text, "<<");
                return Ok(text);
            }
            self.fill().await?;
        }
    }

    /// Reads bytes up to and including the CTRL-Z terminator; the
    /// terminator is not part of the returned body
    async fn read_until_sub(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.rx.iter().position(|&b| b == ASCII_EOT) {
                let body = self.rx.split_to(pos).to_vec();
                self.rx.advance(1);
                // A CRLF often trails the terminator
                while matches!(self.rx.first(), Some(&b'\r') | Some(&b'\n')) {
                    self.rx.advance(1);
                }
                return Ok(body);
            }
            self.fill().await?;
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!(line = %line, ">>");
        let mut out = line.as_bytes().to_vec();
        out.extend_from_slice(b"\r\n");
        self.write_bytes(&out).await
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::protocol("write after session close"));
        }
        self.transport.write(data).await
    }
}
