use std::fmt;

use crate::core::{Callsign, Error, Result};

/// An address slot in an AX.25 frame header.
///
/// Wire form is six callsign bytes each shifted left one bit, then an SSID
/// byte: extension bit 0 (1 = last address), SSID in bits 1-4, reserved
/// bits 5-6 set, and bit 7 carrying the command/response bit (destination
/// and source) or the has-been-repeated flag (digipeaters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ax25Address {
    /// Station callsign and SSID
    pub call: Callsign,
    /// Bit 7 of the SSID octet: C bit, or H bit on a digipeater slot
    pub top_bit: bool,
}

impl Ax25Address {
    /// Wraps a callsign with the top bit clear
    pub fn new(call: Callsign) -> Self {
        Ax25Address { call, top_bit: false }
    }

    /// Encodes into the 7-byte wire form
    pub fn encode(&self, last: bool) -> [u8; 7] {
        let mut out = [b' ' << 1; 7];
        for (i, b) in self.call.base.bytes().take(6).enumerate() {
            out[i] = b << 1;
        }
        let mut ssid = ((self.call.ssid & 0x0F) << 1) | 0x60;
        if self.top_bit {
            ssid |= 0x80;
        }
        if last {
            ssid |= 0x01;
        }
        out[6] = ssid;
        out
    }

    /// Decodes 7 wire bytes; returns the address and whether it was the
    /// last in the chain
    pub fn decode(bytes: &[u8]) -> Result<(Self, bool)> {
        if bytes.len() < 7 {
            return Err(Error::protocol("short AX.25 address field"));
        }
        let mut base = String::with_capacity(6);
        let mut in_padding = false;
        for &b in &bytes[..6] {
            let c = (b >> 1) as char;
            if c == ' ' {
                in_padding = true;
            } else if in_padding {
                return Err(Error::protocol("embedded space in AX.25 callsign"));
            } else if c.is_ascii_alphanumeric() {
                base.push(c);
            } else {
                return Err(Error::protocol(format!("invalid AX.25 callsign byte {:#04x}", b)));
            }
        }
        let ssid_byte = bytes[6];
        let call = Callsign::new(base, (ssid_byte >> 1) & 0x0F)?;
        Ok((
            Ax25Address { call, top_bit: ssid_byte & 0x80 != 0 },
            ssid_byte & 0x01 != 0,
        ))
    }
}

impl fmt::Display for Ax25Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.call)
    }
}

/// Frame check sequence: CRC-16 CCITT, bit-reflected polynomial 0x8408,
/// initial value 0xFFFF, complemented at the end. Transmitted little-endian.
pub fn fcs(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        crc ^= b as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Canonical residue left by running the CRC over a frame including its FCS
const FCS_RESIDUE: u16 = 0xF0B8;

/// Validates a frame that carries its FCS in the trailing two bytes
pub fn fcs_check(frame_with_fcs: &[u8]) -> bool {
    if frame_with_fcs.len() < 2 {
        return false;
    }
    let mut crc: u16 = 0xFFFF;
    for &b in frame_with_fcs {
        crc ^= b as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc == FCS_RESIDUE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip() {
        let addr = Ax25Address::new(Callsign::parse("KE4AHR-1").unwrap());
        let bytes = addr.encode(true);
        let (decoded, last) = Ax25Address::decode(&bytes).unwrap();
        assert_eq!(decoded.call.base, "KE4AHR");
        assert_eq!(decoded.call.ssid, 1);
        assert!(last);
        assert!(!decoded.top_bit);
    }

    #[test]
    fn test_short_call_padding() {
        let addr = Ax25Address::new(Callsign::parse("W1AW").unwrap());
        let bytes = addr.encode(false);
        // Characters shifted left one bit, space padding after the base
        assert_eq!(bytes[0], b'W' << 1);
        assert_eq!(bytes[4], b' ' << 1);
        assert_eq!(bytes[5], b' ' << 1);
        assert_eq!(bytes[6] & 0x01, 0);
        let (decoded, last) = Ax25Address::decode(&bytes).unwrap();
        assert_eq!(decoded.call.base, "W1AW");
        assert!(!last);
    }

    #[test]
    fn test_reserved_bits_set() {
        let addr = Ax25Address::new(Callsign::parse("W1AW-15").unwrap());
        let bytes = addr.encode(true);
        assert_eq!(bytes[6] & 0x60, 0x60);
        assert_eq!((bytes[6] >> 1) & 0x0F, 15);
    }

    #[test]
    fn test_repeated_flag() {
        let mut addr = Ax25Address::new(Callsign::parse("WIDE1-1").unwrap());
        addr.top_bit = true;
        let bytes = addr.encode(false);
        assert_eq!(bytes[6] & 0x80, 0x80);
        let (decoded, _) = Ax25Address::decode(&bytes).unwrap();
        assert!(decoded.top_bit);
    }

    #[test]
    fn test_embedded_space_rejected() {
        // "W 1AW " would decode to a space inside the base
        let mut bytes = Ax25Address::new(Callsign::parse("W1AW").unwrap()).encode(true);
        bytes[1] = b' ' << 1;
        assert!(Ax25Address::decode(&bytes).is_err());
    }

    #[test]
    fn test_fcs_known_value() {
        // CRC-16/X-25 check value for "123456789"
        assert_eq!(fcs(b"123456789"), 0x906E);
    }

    #[test]
    fn test_fcs_residue() {
        let data = b"The quick brown fox";
        let crc = fcs(data);
        let mut framed = data.to_vec();
        framed.extend_from_slice(&crc.to_le_bytes());
        assert!(fcs_check(&framed));

        framed[3] ^= 0x01;
        assert!(!fcs_check(&framed));
    }
}
