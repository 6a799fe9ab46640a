//! AGWPE SoundCard-TNC framing
//!
//! The AGWPE engine speaks a TCP protocol of 36-byte headers followed by a
//! payload. The engine itself runs the AX.25 connected-mode logic, so this
//! layer only marshals frames and performs the application registration
//! handshake; the session sees a framed byte-stream.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Callsign, Error};

/// Header length on the wire
pub const HEADER_LEN: usize = 36;

/// DataKind bytes used by the engine
pub mod kind {
    /// Application login
    pub const LOGIN: u8 = b'X';
    /// Version query/reply
    pub const VERSION: u8 = b'R';
    /// Port information
    pub const PORT_INFO: u8 = b'G';
    /// Open a connected AX.25 link
    pub const CONNECT: u8 = b'C';
    /// Connected data
    pub const DATA: u8 = b'D';
    /// Close the link
    pub const DISCONNECT: u8 = b'd';
    /// Enable monitoring
    pub const MONITOR: u8 = b'm';
}

/// One AGWPE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgwpeFrame {
    /// Radio port index
    pub port: u8,
    /// DataKind byte
    pub kind: u8,
    /// Originating callsign (10 bytes NUL-padded on the wire)
    pub call_from: String,
    /// Destination callsign
    pub call_to: String,
    /// Payload
    pub payload: Bytes,
}

impl AgwpeFrame {
    /// Frame with empty calls and payload
    pub fn bare(port: u8, kind: u8) -> Self {
        AgwpeFrame {
            port,
            kind,
            call_from: String::new(),
            call_to: String::new(),
            payload: Bytes::new(),
        }
    }

    /// Application login frame for a callsign
    pub fn login(port: u8, call: &Callsign) -> Self {
        AgwpeFrame {
            port,
            kind: kind::LOGIN,
            call_from: call.to_string(),
            call_to: String::new(),
            payload: Bytes::new(),
        }
    }

    /// Connect request to a remote station
    pub fn connect(port: u8, from: &Callsign, to: &Callsign) -> Self {
        AgwpeFrame {
            port,
            kind: kind::CONNECT,
            call_from: from.to_string(),
            call_to: to.to_string(),
            payload: Bytes::new(),
        }
    }

    /// Connected-data frame
    pub fn data(port: u8, from: &Callsign, to: &Callsign, payload: impl Into<Bytes>) -> Self {
        AgwpeFrame {
            port,
            kind: kind::DATA,
            call_from: from.to_string(),
            call_to: to.to_string(),
            payload: payload.into(),
        }
    }
}

fn put_call(dst: &mut BytesMut, call: &str) {
    let mut field = [0u8; 10];
    for (i, b) in call.bytes().take(10).enumerate() {
        field[i] = b;
    }
    dst.put_slice(&field);
}

fn get_call(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

/// Codec for the 36-byte AGWPE header plus payload
#[derive(Debug, Clone, Default)]
pub struct AgwpeCodec;

impl Decoder for AgwpeCodec {
    type Item = AgwpeFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let data_len = u32::from_le_bytes([src[28], src[29], src[30], src[31]]) as usize;
        if src.len() < HEADER_LEN + data_len {
            src.reserve(HEADER_LEN + data_len - src.len());
            return Ok(None);
        }
        let header = src.split_to(HEADER_LEN);
        let payload = src.split_to(data_len).freeze();
        Ok(Some(AgwpeFrame {
            port: header[0],
            kind: header[4],
            call_from: get_call(&header[8..18]),
            call_to: get_call(&header[18..28]),
            payload,
        }))
    }
}

impl Encoder<AgwpeFrame> for AgwpeCodec {
    type Error = Error;

    fn encode(&mut self, item: AgwpeFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u32_le(item.port as u32);
        dst.put_u8(item.kind);
        dst.put_bytes(0, 3);
        put_call(dst, &item.call_from);
        put_call(dst, &item.call_to);
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_bytes(0, 4);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut codec = AgwpeCodec;
        let mut wire = BytesMut::new();
        let call = Callsign::parse("KE4AHR").unwrap();
        codec.encode(AgwpeFrame::login(0, &call), &mut wire).unwrap();

        assert_eq!(wire.len(), HEADER_LEN);
        assert_eq!(wire[0], 0);
        assert_eq!(wire[4], b'X');
        assert_eq!(&wire[8..14], b"KE4AHR");
        assert_eq!(wire[14], 0);
        assert_eq!(&wire[28..32], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_roundtrip_with_payload() {
        let mut codec = AgwpeCodec;
        let from = Callsign::parse("W1AW").unwrap();
        let to = Callsign::parse("KE4AHR-1").unwrap();
        let frame = AgwpeFrame::data(2, &from, &to, Bytes::from_static(b"FQ\r\n"));

        let mut wire = BytesMut::new();
        codec.encode(frame.clone(), &mut wire).unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 4);
        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = AgwpeCodec;
        let mut wire = BytesMut::new();
        codec.encode(AgwpeFrame::bare(0, kind::VERSION), &mut wire).unwrap();
        let mut partial = BytesMut::from(&wire[..20]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&wire[20..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.kind, kind::VERSION);
    }

    #[test]
    fn test_partial_payload_waits() {
        let mut codec = AgwpeCodec;
        let from = Callsign::parse("W1AW").unwrap();
        let to = Callsign::parse("KE4AHR").unwrap();
        let mut wire = BytesMut::new();
        codec
            .encode(AgwpeFrame::data(0, &from, &to, Bytes::from_static(b"abcdef")), &mut wire)
            .unwrap();
        let mut partial = BytesMut::from(&wire[..HEADER_LEN + 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&wire[HEADER_LEN + 2..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&decoded.payload[..], b"abcdef");
    }

    #[test]
    fn test_ssid_carried_in_call_field() {
        let mut codec = AgwpeCodec;
        let from = Callsign::parse("KE4AHR-15").unwrap();
        let to = Callsign::parse("W1AW-7").unwrap();
        let mut wire = BytesMut::new();
        codec.encode(AgwpeFrame::connect(1, &from, &to), &mut wire).unwrap();
        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.call_from, "KE4AHR-15");
        assert_eq!(decoded.call_to, "W1AW-7");
        assert_eq!(decoded.port, 1);
    }
}
