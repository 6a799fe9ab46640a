use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Serialize, Deserialize};

use super::error::{Error, Result};

/// An amateur-radio callsign with SSID (e.g. `KE4AHR-1`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Callsign {
    /// Base callsign, 1-6 uppercase alphanumeric characters
    pub base: String,
    /// Secondary Station Identifier, 0-15
    pub ssid: u8,
}

impl Callsign {
    /// Creates a validated callsign
    pub fn new(base: impl Into<String>, ssid: u8) -> Result<Self> {
        let base = base.into().to_uppercase();
        if base.is_empty() || base.len() > 6 {
            return Err(Error::config(format!("invalid callsign length: {:?}", base)));
        }
        if !base.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::config(format!("invalid callsign characters: {:?}", base)));
        }
        if ssid > 15 {
            return Err(Error::config(format!("SSID out of range: {}", ssid)));
        }
        Ok(Callsign { base, ssid })
    }

    /// Parses `BASE` or `BASE-SSID` notation
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('-') {
            Some((base, ssid)) => {
                let ssid = ssid.parse::<u8>()
                    .map_err(|_| Error::config(format!("invalid SSID in {:?}", s)))?;
                Callsign::new(base, ssid)
            }
            None => Callsign::new(s, 0),
        }
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid > 0 {
            write!(f, "{}-{}", self.base, self.ssid)
        } else {
            write!(f, "{}", self.base)
        }
    }
}

/// FBB message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Private mail
    Private,
    /// Bulletin
    Bulletin,
    /// NTS traffic
    Traffic,
}

impl MessageType {
    /// Single-character wire form (`P`, `B`, `T`)
    pub fn as_char(&self) -> char {
        match self {
            MessageType::Private => 'P',
            MessageType::Bulletin => 'B',
            MessageType::Traffic => 'T',
        }
    }

    /// Parses the single-character wire form
    pub fn from_char(c: char) -> Result<Self> {
        match c.to_ascii_uppercase() {
            'P' => Ok(MessageType::Private),
            'B' => Ok(MessageType::Bulletin),
            'T' => Ok(MessageType::Traffic),
            other => Err(Error::protocol(format!("unknown message type {:?}", other))),
        }
    }
}

/// A named file attached to a B2F message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name as carried in the `File:` header
    pub name: String,
    /// Raw file contents
    pub data: Vec<u8>,
}

/// A store-and-forward message in B2F form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message ID, unique per sender, at most 12 characters
    pub mid: String,
    /// Origination timestamp
    pub date: NaiveDateTime,
    /// Message type
    pub msg_type: MessageType,
    /// Originating callsign
    pub from: String,
    /// Destination addresses (at least one)
    pub to: Vec<String>,
    /// Carbon-copy addresses
    pub cc: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Message box (home BBS) of the originator
    pub mbo: Option<String>,
    /// Routing hint used in proposals (`@` field)
    pub routing: Option<String>,
    /// Body bytes
    pub body: Vec<u8>,
    /// Attachments in declared order
    pub files: Vec<Attachment>,
}

impl Message {
    /// Creates a message with the fields every proposal needs filled in
    pub fn new(
        msg_type: MessageType,
        from: impl Into<String>,
        to: impl Into<String>,
        mid: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let mid = mid.into();
        if mid.is_empty() || mid.len() > 12 {
            return Err(Error::config(format!("MID must be 1-12 characters: {:?}", mid)));
        }
        Ok(Message {
            mid,
            date: chrono::Utc::now().naive_utc(),
            msg_type,
            from: from.into(),
            to: vec![to.into()],
            cc: Vec::new(),
            subject: subject.into(),
            mbo: None,
            routing: None,
            body: body.into(),
            files: Vec::new(),
        })
    }

    /// Total declared payload size: body plus all attachments
    pub fn total_size(&self) -> u64 {
        self.body.len() as u64
            + self.files.iter().map(|f| f.data.len() as u64).sum::<u64>()
    }

    /// Generates a MID of the form `XXXXX_CALL`, truncated to 12 characters
    pub fn generate_mid(call: &Callsign) -> String {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let tag: String = (0..5)
            .map(|_| {
                let n = rng.gen_range(0..36);
                char::from_digit(n, 36).unwrap().to_ascii_uppercase()
            })
            .collect();
        let mut mid = format!("{}_{}", tag, call.base);
        mid.truncate(12);
        mid
    }
}

/// Final status of one outbound message after a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Body transmitted and implicitly acknowledged
    Sent,
    /// Peer rejected the proposal (`-`, `=`, `E`)
    Rejected,
    /// Peer already holds this MID (`L`)
    AlreadyHave,
    /// Peer deferred for resources (`R`)
    Deferred,
    /// Not offered or not accepted because of the session traffic limit
    LimitDeferred,
    /// Session failed before this message was resolved
    Unsent,
}

/// Per-message outcome in the session report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageOutcome {
    /// Message ID
    pub mid: String,
    /// Final delivery status
    pub status: DeliveryStatus,
}

/// Summary of a completed (or aborted) forwarding session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionReport {
    /// Outcome per outbound message, in queue order
    pub outcomes: Vec<MessageOutcome>,
    /// Body/block bytes written during the session
    pub bytes_sent: u64,
    /// Body/block bytes received during the session
    pub bytes_received: u64,
    /// True when the peer's traffic limit cut the session short
    pub limit_hit: bool,
}

/// Caller-supplied persistence for resume offsets.
///
/// The engine consults the store when proposing (to append `@offset`) and
/// records partial progress when a transfer is interrupted; the surrounding
/// application decides how the map survives between sessions.
pub trait ResumeStore: Send {
    /// Returns the resume offset recorded for a MID, if any
    fn get(&self, mid: &str) -> Option<u64>;
    /// Records the number of octets the peer already holds for a MID
    fn put(&mut self, mid: &str, offset: u64);
    /// Drops the record for a fully transferred MID
    fn remove(&mut self, mid: &str);
}

/// In-memory resume store, sufficient for single-process use
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    offsets: HashMap<String, u64>,
}

impl MemoryResumeStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumeStore for MemoryResumeStore {
    fn get(&self, mid: &str) -> Option<u64> {
        self.offsets.get(mid).copied()
    }

    fn put(&mut self, mid: &str, offset: u64) {
        self.offsets.insert(mid.to_string(), offset);
    }

    fn remove(&mut self, mid: &str) {
        self.offsets.remove(mid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callsign_parse() {
        let c = Callsign::parse("ke4ahr-1").unwrap();
        assert_eq!(c.base, "KE4AHR");
        assert_eq!(c.ssid, 1);
        assert_eq!(c.to_string(), "KE4AHR-1");

        let plain = Callsign::parse("W1AW").unwrap();
        assert_eq!(plain.ssid, 0);
        assert_eq!(plain.to_string(), "W1AW");
    }

    #[test]
    fn test_callsign_validation() {
        assert!(Callsign::parse("TOOLONGCALL").is_err());
        assert!(Callsign::parse("W1AW-16").is_err());
        assert!(Callsign::parse("W1 AW").is_err());
        assert!(Callsign::parse("").is_err());
    }

    #[test]
    fn test_message_type_chars() {
        assert_eq!(MessageType::Private.as_char(), 'P');
        assert_eq!(MessageType::from_char('b').unwrap(), MessageType::Bulletin);
        assert!(MessageType::from_char('X').is_err());
    }

    #[test]
    fn test_message_size() {
        let mut msg = Message::new(
            MessageType::Private, "W1AW", "KE4AHR", "TEST001", "Test", b"Hello".to_vec(),
        ).unwrap();
        assert_eq!(msg.total_size(), 5);
        msg.files.push(Attachment { name: "a.bin".into(), data: vec![0u8; 10] });
        assert_eq!(msg.total_size(), 15);
    }

    #[test]
    fn test_mid_length_enforced() {
        let err = Message::new(
            MessageType::Private, "W1AW", "KE4AHR", "THIRTEENCHARS", "Test", vec![],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_generate_mid() {
        let call = Callsign::parse("KE4AHR").unwrap();
        let mid = Message::generate_mid(&call);
        assert!(mid.len() <= 12);
        assert!(mid.contains('_'));
    }

    #[test]
    fn test_memory_resume_store() {
        let mut store = MemoryResumeStore::new();
        assert_eq!(store.get("RES42"), None);
        store.put("RES42", 500);
        assert_eq!(store.get("RES42"), Some(500));
        store.remove("RES42");
        assert_eq!(store.get("RES42"), None);
    }
}
