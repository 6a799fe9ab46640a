use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::core::Error;
use super::{FEND, FESC, TFEND, TFESC};

/// KISS command nibble (low four bits of the first frame byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KissCommand {
    /// Data frame carrying an AX.25 frame
    Data,
    /// TX delay parameter (10 ms units)
    TxDelay,
    /// CSMA persistence parameter
    Persistence,
    /// Slot time parameter (10 ms units)
    SlotTime,
    /// TX tail parameter (10 ms units)
    TxTail,
    /// Full-duplex flag
    FullDuplex,
    /// Hardware-specific parameter
    SetHardware,
    /// XKISS master poll
    Poll,
    /// Exit KISS mode
    Return,
    /// Unrecognised command nibble, passed through
    Other(u8),
}

impl KissCommand {
    /// Wire nibble for this command
    pub fn nibble(&self) -> u8 {
        match self {
            KissCommand::Data => 0x00,
            KissCommand::TxDelay => 0x01,
            KissCommand::Persistence => 0x02,
            KissCommand::SlotTime => 0x03,
            KissCommand::TxTail => 0x04,
            KissCommand::FullDuplex => 0x05,
            KissCommand::SetHardware => 0x06,
            KissCommand::Poll => 0x0E,
            KissCommand::Return => 0x0F,
            KissCommand::Other(n) => n & 0x0F,
        }
    }

    /// Decodes a command nibble
    pub fn from_nibble(n: u8) -> Self {
        match n & 0x0F {
            0x00 => KissCommand::Data,
            0x01 => KissCommand::TxDelay,
            0x02 => KissCommand::Persistence,
            0x03 => KissCommand::SlotTime,
            0x04 => KissCommand::TxTail,
            0x05 => KissCommand::FullDuplex,
            0x06 => KissCommand::SetHardware,
            0x0E => KissCommand::Poll,
            0x0F => KissCommand::Return,
            other => KissCommand::Other(other),
        }
    }
}

/// A single KISS frame: TNC address nibble, command, payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissFrame {
    /// Multi-drop TNC address (0-15), high nibble of the command byte
    pub port: u8,
    /// Command nibble
    pub command: KissCommand,
    /// Frame payload (empty for polls and parameter-less commands)
    pub payload: Bytes,
}

impl KissFrame {
    /// Builds a data frame for a TNC address
    pub fn data(port: u8, payload: impl Into<Bytes>) -> Self {
        KissFrame { port, command: KissCommand::Data, payload: payload.into() }
    }

    /// Builds the one-byte XKISS poll frame for a slave address
    pub fn poll(addr: u8) -> Self {
        KissFrame { port: addr, command: KissCommand::Poll, payload: Bytes::new() }
    }

    /// Builds a one-byte parameter frame
    pub fn param(port: u8, command: KissCommand, value: u8) -> Self {
        KissFrame { port, command, payload: Bytes::copy_from_slice(&[value]) }
    }

    fn command_byte(&self) -> u8 {
        ((self.port & 0x0F) << 4) | self.command.nibble()
    }
}

/// TNC parameters emitted at configuration time.
///
/// Frames 0x01..0x06 are sent in command order; `ignore` suppresses
/// emission entirely for TNCs that are already configured.
#[derive(Debug, Clone)]
pub struct TncParams {
    /// TX delay in 10 ms units
    pub tx_delay: u8,
    /// CSMA persistence (0-255)
    pub persistence: u8,
    /// Slot time in 10 ms units
    pub slot_time: u8,
    /// TX tail in 10 ms units
    pub tx_tail: u8,
    /// Full duplex (0 = half)
    pub full_duplex: u8,
    /// Hardware-specific byte, if the TNC wants one
    pub hardware: Option<u8>,
    /// Skip parameter emission entirely
    pub ignore: bool,
}

impl Default for TncParams {
    fn default() -> Self {
        TncParams {
            tx_delay: 50,
            persistence: 63,
            slot_time: 10,
            tx_tail: 5,
            full_duplex: 0,
            hardware: None,
            ignore: false,
        }
    }
}

impl TncParams {
    /// Parameter frames for one TNC address, in emission order
    pub fn frames(&self, port: u8) -> Vec<KissFrame> {
        if self.ignore {
            return Vec::new();
        }
        let mut out = vec![
            KissFrame::param(port, KissCommand::TxDelay, self.tx_delay),
            KissFrame::param(port, KissCommand::Persistence, self.persistence),
            KissFrame::param(port, KissCommand::SlotTime, self.slot_time),
            KissFrame::param(port, KissCommand::TxTail, self.tx_tail),
            KissFrame::param(port, KissCommand::FullDuplex, self.full_duplex),
        ];
        if let Some(hw) = self.hardware {
            out.push(KissFrame::param(port, KissCommand::SetHardware, hw));
        }
        out
    }
}

/// Escapes FEND/FESC in a single pass
pub fn escape(data: &[u8], out: &mut BytesMut) {
    for &b in data {
        match b {
            FEND => {
                out.put_u8(FESC);
                out.put_u8(TFEND);
            }
            FESC => {
                out.put_u8(FESC);
                out.put_u8(TFESC);
            }
            _ => out.put_u8(b),
        }
    }
}

/// Reverses the two-substitution escape rule
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut esc = false;
    for &b in data {
        if esc {
            match b {
                TFEND => out.push(FEND),
                TFESC => out.push(FESC),
                // Spec violation by the sender; pass the byte through
                _ => out.push(b),
            }
            esc = false;
        } else if b == FESC {
            esc = true;
        } else {
            out.push(b);
        }
    }
    out
}

/// KISS frame codec over a raw byte stream.
///
/// With `use_checksum` the trailing pre-FEND byte is the 8-bit sum of the
/// command byte and payload; frames failing validation are silently
/// discarded (the XKISS convention), surfacing only as a `warn!` event.
#[derive(Debug, Clone, Default)]
pub struct KissCodec {
    /// XKISS checksum mode
    pub use_checksum: bool,
}

impl KissCodec {
    /// Creates a codec, optionally in checksum mode
    pub fn new(use_checksum: bool) -> Self {
        KissCodec { use_checksum }
    }

    fn parse(&self, raw: &[u8]) -> Option<KissFrame> {
        let mut frame = unescape(raw);
        if frame.is_empty() {
            return None;
        }
        if self.use_checksum {
            if frame.len() < 2 {
                warn!(len = frame.len(), "KISS frame too short for checksum, discarding");
                return None;
            }
            let declared = frame[frame.len() - 1];
            let actual = frame[..frame.len() - 1]
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b));
            if declared != actual {
                warn!(declared, actual, "KISS checksum mismatch, discarding frame");
                return None;
            }
            frame.truncate(frame.len() - 1);
        }
        let cmd = frame[0];
        Some(KissFrame {
            port: (cmd >> 4) & 0x0F,
            command: KissCommand::from_nibble(cmd),
            payload: Bytes::from(frame.split_off(1)),
        })
    }
}

impl Decoder for KissCodec {
    type Item = KissFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Drop noise before the opening FEND
            let Some(start) = src.iter().position(|&b| b == FEND) else {
                src.clear();
                return Ok(None);
            };
            let _ = src.split_to(start + 1);

            // Frame body runs to the closing FEND
            let Some(end) = src.iter().position(|&b| b == FEND) else {
                // Re-insert the opening FEND so a partial frame survives the next read
                let mut rest = BytesMut::with_capacity(src.len() + 1);
                rest.put_u8(FEND);
                rest.extend_from_slice(src);
                *src = rest;
                return Ok(None);
            };
            let body = src.split_to(end);
            // The closing FEND stays in the buffer; it doubles as the next
            // frame's opener, which also swallows back-to-back FENDs.

            if body.is_empty() {
                continue;
            }
            if let Some(frame) = self.parse(&body) {
                return Ok(Some(frame));
            }
        }
    }
}

impl Encoder<KissFrame> for KissCodec {
    type Error = Error;

    fn encode(&mut self, item: KissFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut raw = BytesMut::with_capacity(item.payload.len() + 2);
        raw.put_u8(item.command_byte());
        raw.extend_from_slice(&item.payload);
        if self.use_checksum {
            let sum = raw.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            raw.put_u8(sum);
        }

        dst.put_u8(FEND);
        escape(&raw, dst);
        dst.put_u8(FEND);
        Ok(())
    }
}
