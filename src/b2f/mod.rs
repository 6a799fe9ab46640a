//! B2F message codec
//!
//! Header assembly and validation for Winlink B2F messages, plus the
//! binary block framing (checksummed chunks) used by FB/FC proposals.

use chrono::NaiveDateTime;
use tracing::warn;

use crate::core::{Attachment, Error, Message, MessageType, Result};

/// Chunk start marker
pub const STX: u8 = 0x02;
/// End-of-block marker
pub const ETX: u8 = 0x03;
/// Largest data chunk
pub const MAX_CHUNK: usize = 250;

/// Wire format of the `Date:` header
pub const DATE_FORMAT: &str = "%Y/%m/%d %H:%M";

/// Assembles the canonical CRLF header block, body and attachments.
///
/// Header order is fixed: Mid, Date, Type, From, To, Cc, Subject, Mbo,
/// Body, File; an empty line separates headers from the body, and the
/// encoded message ends with one trailing CRLF.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + msg.total_size() as usize);
    let mut push_line = |out: &mut Vec<u8>, line: String| {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    };

    push_line(&mut out, format!("Mid: {}", msg.mid));
    push_line(&mut out, format!("Date: {}", msg.date.format(DATE_FORMAT)));
    push_line(&mut out, format!("Type: {}", msg.msg_type.as_char()));
    push_line(&mut out, format!("From: {}", msg.from));
    for to in &msg.to {
        push_line(&mut out, format!("To: {}", to));
    }
    for cc in &msg.cc {
        push_line(&mut out, format!("Cc: {}", cc));
    }
    push_line(&mut out, format!("Subject: {}", msg.subject));
    if let Some(mbo) = &msg.mbo {
        push_line(&mut out, format!("Mbo: {}", mbo));
    }
    push_line(&mut out, format!("Body: {}", msg.body.len()));
    for file in &msg.files {
        push_line(&mut out, format!("File: {} {}", file.name, file.data.len()));
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&msg.body);
    for file in &msg.files {
        out.extend_from_slice(&file.data);
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn parse_len(value: &str, what: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::protocol(format!("{} length not a non-negative integer: {:?}", what, value)))
}

/// Parses and validates an encoded B2F message.
///
/// Rejected: missing Mid/Date/Type/From/Subject/Body, a duplicate Mid
/// header, malformed lengths, and a declared payload above `max_payload`.
pub fn parse_message(data: &[u8], max_payload: u64) -> Result<Message> {
    let header_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Error::protocol("B2F headers not terminated by empty line"))?;
    let header_text = std::str::from_utf8(&data[..header_end])
        .map_err(|_| Error::protocol("B2F headers not valid ASCII"))?;

    let mut mid: Option<String> = None;
    let mut date: Option<NaiveDateTime> = None;
    let mut msg_type: Option<MessageType> = None;
    let mut from: Option<String> = None;
    let mut to: Vec<String> = Vec::new();
    let mut cc: Vec<String> = Vec::new();
    let mut subject: Option<String> = None;
    let mut mbo: Option<String> = None;
    let mut body_len: Option<u64> = None;
    let mut file_decls: Vec<(String, u64)> = Vec::new();

    for line in header_text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::protocol(format!("malformed header line: {:?}", line)));
        };
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "mid" => {
                if mid.is_some() {
                    return Err(Error::protocol("duplicate Mid header"));
                }
                if value.is_empty() || value.len() > 12 {
                    return Err(Error::protocol(format!("MID must be 1-12 characters: {:?}", value)));
                }
                mid = Some(value.to_string());
            }
            "date" => {
                let parsed = NaiveDateTime::parse_from_str(value, DATE_FORMAT)
                    .map_err(|_| Error::protocol(format!("invalid Date header: {:?}", value)))?;
                date = Some(parsed);
            }
            "type" => {
                let mut chars = value.chars();
                let (Some(c), None) = (chars.next(), chars.next()) else {
                    return Err(Error::protocol(format!("invalid Type header: {:?}", value)));
                };
                msg_type = Some(MessageType::from_char(c)?);
            }
            "from" => from = Some(value.to_string()),
            "to" => to.push(value.to_string()),
            "cc" => cc.push(value.to_string()),
            "subject" => subject = Some(value.to_string()),
            "mbo" => mbo = Some(value.to_string()),
            "body" => body_len = Some(parse_len(value, "Body")?),
            "file" => {
                let Some((name, len)) = value.rsplit_once(' ') else {
                    return Err(Error::protocol(format!("invalid File header: {:?}", value)));
                };
                file_decls.push((name.to_string(), parse_len(len, "File")?));
            }
            other => {
                warn!(header = other, "ignoring unknown B2F header");
            }
        }
    }

    let mid = mid.ok_or_else(|| Error::protocol("missing Mid header"))?;
    let date = date.ok_or_else(|| Error::protocol("missing Date header"))?;
    let msg_type = msg_type.ok_or_else(|| Error::protocol("missing Type header"))?;
    let from = from.ok_or_else(|| Error::protocol("missing From header"))?;
    let subject = subject.ok_or_else(|| Error::protocol("missing Subject header"))?;
    let body_len = body_len.ok_or_else(|| Error::protocol("missing Body header"))?;

    let declared: u64 = body_len + file_decls.iter().map(|(_, l)| l).sum::<u64>();
    if declared > max_payload {
        return Err(Error::protocol(format!(
            "declared payload {} exceeds ceiling {}", declared, max_payload,
        )));
    }

    let mut rest = &data[header_end + 4..];
    if (rest.len() as u64) < declared {
        return Err(Error::protocol(format!(
            "payload shorter than declared: {} < {}", rest.len(), declared,
        )));
    }
    let body = rest[..body_len as usize].to_vec();
    rest = &rest[body_len as usize..];
    let mut files = Vec::with_capacity(file_decls.len());
    for (name, len) in file_decls {
        files.push(Attachment { name, data: rest[..len as usize].to_vec() });
        rest = &rest[len as usize..];
    }

    Ok(Message {
        mid,
        date,
        msg_type,
        from,
        to,
        cc,
        subject,
        mbo,
        routing: None,
        body,
        files,
    })
}

/// Two's complement of the 8-bit sum, as carried after each chunk
pub fn chunk_checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    0u8.wrapping_sub(sum)
}

/// Splits `block[offset..]` into checksummed chunks ready for the wire:
/// `STX <len> <data> <cksum>` repeated, then `ETX 0x00`.
pub fn frame_block(block: &[u8], offset: u64) -> Vec<u8> {
    let start = (offset as usize).min(block.len());
    let rest = &block[start..];
    let mut out = Vec::with_capacity(rest.len() + rest.len() / MAX_CHUNK * 3 + 8);
    for chunk in rest.chunks(MAX_CHUNK) {
        out.push(STX);
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
        out.push(chunk_checksum(chunk));
    }
    out.push(ETX);
    out.push(0x00);
    out
}

/// Incremental decoder for a chunked binary block
#[derive(Debug)]
pub struct BlockDecoder {
    data: Vec<u8>,
    /// Index in `data` where the chunk in flight begins
    chunk_start: usize,
    state: DecodeState,
}

#[derive(Debug, PartialEq)]
enum DecodeState {
    Marker,
    Len,
    Data { want: usize, got: usize },
    Checksum,
    TrailerLen,
    Done,
}

impl BlockDecoder {
    /// Creates a decoder awaiting the first chunk marker
    pub fn new() -> Self {
        BlockDecoder { data: Vec::new(), chunk_start: 0, state: DecodeState::Marker }
    }

    /// True once the ETX trailer has been consumed
    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Bytes of block recovered so far
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the recovered block
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Feeds wire bytes; returns how many were consumed (all of them,
    /// unless the block completed mid-buffer)
    pub fn feed(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut consumed = 0;
        for &b in bytes {
            if self.state == DecodeState::Done {
                break;
            }
            consumed += 1;
            match self.state {
                DecodeState::Marker => match b {
                    STX => self.state = DecodeState::Len,
                    ETX => self.state = DecodeState::TrailerLen,
                    other => {
                        return Err(Error::protocol(format!(
                            "expected STX or ETX, got {:#04x}", other,
                        )));
                    }
                },
                DecodeState::Len => {
                    if b == 0 {
                        return Err(Error::protocol("zero-length data chunk"));
                    }
                    self.chunk_start = self.data.len();
                    self.state = DecodeState::Data { want: b as usize, got: 0 };
                }
                DecodeState::Data { want, ref mut got } => {
                    self.data.push(b);
                    *got += 1;
                    if *got == want {
                        self.state = DecodeState::Checksum;
                    }
                }
                DecodeState::Checksum => {
                    let expect = chunk_checksum(&self.data[self.chunk_start..]);
                    if b != expect {
                        warn!(declared = b, expect, "binary chunk checksum mismatch");
                        return Err(Error::protocol("binary chunk checksum mismatch"));
                    }
                    self.state = DecodeState::Marker;
                }
                DecodeState::TrailerLen => {
                    self.state = DecodeState::Done;
                }
                DecodeState::Done => unreachable!(),
            }
        }
        Ok(consumed)
    }
}

impl Default for BlockDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DEFAULT_MAX_PAYLOAD;

    fn sample_message() -> Message {
        let mut msg = Message::new(
            MessageType::Private,
            "W1AW",
            "KE4AHR@N4XYZ",
            "TEST001",
            "Test message",
            b"Hello\r\n73".to_vec(),
        )
        .unwrap();
        msg.date = NaiveDateTime::parse_from_str("2026/01/15 12:30", DATE_FORMAT).unwrap();
        msg.mbo = Some("W1AW".into());
        msg
    }

    #[test]
    fn test_encode_header_order() {
        let encoded = encode_message(&sample_message());
        let text = String::from_utf8_lossy(&encoded);
        let mid_at = text.find("Mid: TEST001").unwrap();
        let date_at = text.find("Date: 2026/01/15 12:30").unwrap();
        let type_at = text.find("Type: P").unwrap();
        let body_at = text.find("Body: 9").unwrap();
        assert!(mid_at < date_at && date_at < type_at && type_at < body_at);
        assert!(text.ends_with("Hello\r\n73\r\n"));
    }

    #[test]
    fn test_roundtrip_plain() {
        let msg = sample_message();
        let decoded = parse_message(&encode_message(&msg), DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(decoded.mid, msg.mid);
        assert_eq!(decoded.date, msg.date);
        assert_eq!(decoded.msg_type, msg.msg_type);
        assert_eq!(decoded.to, msg.to);
        assert_eq!(decoded.body, msg.body);
        // Re-encoding is byte-identical
        assert_eq!(encode_message(&decoded), encode_message(&msg));
    }

    #[test]
    fn test_roundtrip_with_attachments() {
        let mut msg = sample_message();
        msg.cc = vec!["N0CALL".into()];
        msg.files = vec![
            Attachment { name: "map.bin".into(), data: (0..=255u8).cycle().take(200_000).collect() },
            Attachment { name: "note.txt".into(), data: b"73".to_vec() },
        ];
        let encoded = encode_message(&msg);
        let decoded = parse_message(&encoded, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(decoded.files.len(), 2);
        assert_eq!(decoded.files[0].name, "map.bin");
        assert_eq!(decoded.files[0].data.len(), 200_000);
        assert_eq!(decoded.files[1].data, b"73");
        assert_eq!(encode_message(&decoded), encoded);
    }

    #[test]
    fn test_missing_required_header() {
        let msg = sample_message();
        let encoded = encode_message(&msg);
        let text = String::from_utf8(encoded).unwrap();
        let without_subject = text.replace("Subject: Test message\r\n", "");
        let err = parse_message(without_subject.as_bytes(), DEFAULT_MAX_PAYLOAD);
        assert!(err.is_err());
    }

    #[test]
    fn test_duplicate_mid_rejected() {
        let text = "Mid: A\r\nMid: B\r\nDate: 2026/01/15 12:30\r\nType: P\r\nFrom: X\r\nSubject: s\r\nBody: 0\r\n\r\n\r\n";
        assert!(parse_message(text.as_bytes(), DEFAULT_MAX_PAYLOAD).is_err());
    }

    #[test]
    fn test_bad_length_rejected() {
        let text = "Mid: A\r\nDate: 2026/01/15 12:30\r\nType: P\r\nFrom: X\r\nSubject: s\r\nBody: -3\r\n\r\n\r\n";
        assert!(parse_message(text.as_bytes(), DEFAULT_MAX_PAYLOAD).is_err());
    }

    #[test]
    fn test_payload_ceiling() {
        let msg = sample_message();
        let encoded = encode_message(&msg);
        assert!(parse_message(&encoded, 4).is_err());
    }

    #[test]
    fn test_case_insensitive_headers() {
        let text = "MID: A\r\nDATE: 2026/01/15 12:30\r\ntype: P\r\nfrom: X\r\nSUBJECT: s\r\nbody: 2\r\n\r\nhi\r\n";
        let msg = parse_message(text.as_bytes(), DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(msg.mid, "A");
        assert_eq!(msg.body, b"hi");
    }

    #[test]
    fn test_short_payload_rejected() {
        let text = "Mid: A\r\nDate: 2026/01/15 12:30\r\nType: P\r\nFrom: X\r\nSubject: s\r\nBody: 10\r\n\r\nhi";
        assert!(parse_message(text.as_bytes(), DEFAULT_MAX_PAYLOAD).is_err());
    }

    #[test]
    fn test_chunk_checksum() {
        // Two's complement: checksum makes the total sum zero
        let data = [0x01u8, 0x02, 0x03];
        let ck = chunk_checksum(&data);
        let total = data.iter().fold(ck, |acc, &b| acc.wrapping_add(b));
        assert_eq!(total, 0);
    }

    #[test]
    fn test_frame_block_roundtrip() {
        let block: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let framed = frame_block(&block, 0);
        // 1000 bytes = 4 chunks (250 each) plus the trailer
        assert_eq!(framed.len(), 1000 + 4 * 3 + 2);

        let mut decoder = BlockDecoder::new();
        let consumed = decoder.feed(&framed).unwrap();
        assert_eq!(consumed, framed.len());
        assert!(decoder.is_done());
        assert_eq!(decoder.into_data(), block);
    }

    #[test]
    fn test_frame_block_from_offset() {
        let block: Vec<u8> = (0..100u8).collect();
        let framed = frame_block(&block, 60);
        let mut decoder = BlockDecoder::new();
        decoder.feed(&framed).unwrap();
        assert!(decoder.is_done());
        assert_eq!(decoder.data(), &block[60..]);
    }

    #[test]
    fn test_empty_block_is_bare_trailer() {
        let framed = frame_block(b"", 0);
        assert_eq!(framed, vec![ETX, 0x00]);
    }

    #[test]
    fn test_decoder_detects_corruption() {
        let mut framed = frame_block(b"some data here", 0);
        // Flip a payload byte; the chunk checksum no longer matches
        framed[3] ^= 0xFF;
        let mut decoder = BlockDecoder::new();
        assert!(decoder.feed(&framed).is_err());
    }

    #[test]
    fn test_decoder_incremental_feed() {
        let block = b"incremental delivery of a block".to_vec();
        let framed = frame_block(&block, 0);
        let mut decoder = BlockDecoder::new();
        for piece in framed.chunks(7) {
            decoder.feed(piece).unwrap();
        }
        assert!(decoder.is_done());
        assert_eq!(decoder.into_data(), block);
    }

    #[test]
    fn test_decoder_stops_after_trailer() {
        let framed = frame_block(b"abc", 0);
        let mut extra = framed.clone();
        extra.extend_from_slice(b"FF\r\n");
        let mut decoder = BlockDecoder::new();
        let consumed = decoder.feed(&extra).unwrap();
        assert_eq!(consumed, framed.len());
        assert!(decoder.is_done());
    }
}
