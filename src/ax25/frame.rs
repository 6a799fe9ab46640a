use bytes::Bytes;

use crate::core::{Error, Result};
use super::address::{Ax25Address, fcs, fcs_check};
use super::PID_NO_L3;

/// Decoded AX.25 control octet (modulo-8 forms only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Information frame
    I { ns: u8, nr: u8, poll: bool },
    /// Receive Ready
    Rr { nr: u8, poll: bool },
    /// Receive Not Ready
    Rnr { nr: u8, poll: bool },
    /// Reject
    Rej { nr: u8, poll: bool },
    /// Set Asynchronous Balanced Mode
    Sabm { poll: bool },
    /// Unnumbered Acknowledge
    Ua { fin: bool },
    /// Disconnect
    Disc { poll: bool },
    /// Disconnected Mode
    Dm { fin: bool },
    /// Unnumbered Information
    Ui { poll: bool },
    /// Frame Reject
    Frmr { fin: bool },
    /// Anything else, carried opaquely
    Unknown(u8),
}

impl FrameType {
    /// Encodes the control octet
    pub fn control(&self) -> u8 {
        let pf = |b: bool| (b as u8) << 4;
        match *self {
            FrameType::I { ns, nr, poll } => (nr << 5) | pf(poll) | (ns << 1),
            FrameType::Rr { nr, poll } => 0x01 | (nr << 5) | pf(poll),
            FrameType::Rnr { nr, poll } => 0x05 | (nr << 5) | pf(poll),
            FrameType::Rej { nr, poll } => 0x09 | (nr << 5) | pf(poll),
            FrameType::Sabm { poll } => 0x2F | pf(poll),
            FrameType::Ua { fin } => 0x63 | pf(fin),
            FrameType::Disc { poll } => 0x43 | pf(poll),
            FrameType::Dm { fin } => 0x0F | pf(fin),
            FrameType::Ui { poll } => 0x03 | pf(poll),
            FrameType::Frmr { fin } => 0x87 | pf(fin),
            FrameType::Unknown(c) => c,
        }
    }

    /// Decodes a control octet
    pub fn from_control(control: u8) -> Self {
        let pf = control & 0x10 != 0;
        if control & 0x01 == 0 {
            FrameType::I {
                ns: (control >> 1) & 0x07,
                nr: (control >> 5) & 0x07,
                poll: pf,
            }
        } else if control & 0x03 == 0x01 {
            let nr = (control >> 5) & 0x07;
            match control & 0x0F {
                0x01 => FrameType::Rr { nr, poll: pf },
                0x05 => FrameType::Rnr { nr, poll: pf },
                0x09 => FrameType::Rej { nr, poll: pf },
                _ => FrameType::Unknown(control),
            }
        } else {
            match control & 0xEF {
                0x2F => FrameType::Sabm { poll: pf },
                0x63 => FrameType::Ua { fin: pf },
                0x43 => FrameType::Disc { poll: pf },
                0x0F => FrameType::Dm { fin: pf },
                0x03 => FrameType::Ui { poll: pf },
                0x87 => FrameType::Frmr { fin: pf },
                _ => FrameType::Unknown(control),
            }
        }
    }

    fn has_pid(&self) -> bool {
        matches!(self, FrameType::I { .. } | FrameType::Ui { .. })
    }
}

/// A full AX.25 frame as carried inside KISS data frames.
///
/// The FCS is appended on encode and verified (then stripped) on decode;
/// frames failing the check are discarded at this layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Ax25Frame {
    /// Destination address
    pub dest: Ax25Address,
    /// Source address
    pub source: Ax25Address,
    /// Digipeater path in transit order (0-8 entries)
    pub digis: Vec<Ax25Address>,
    /// Control field
    pub frame_type: FrameType,
    /// PID octet, present on I and UI frames
    pub pid: Option<u8>,
    /// Information field
    pub info: Bytes,
}

impl Ax25Frame {
    /// Builds a frame with the command/response bits set for a command
    /// (destination C bit) or a response (source C bit)
    pub fn new(
        mut dest: Ax25Address,
        mut source: Ax25Address,
        digis: Vec<Ax25Address>,
        frame_type: FrameType,
        command: bool,
        info: Bytes,
    ) -> Self {
        dest.top_bit = command;
        source.top_bit = !command;
        let pid = frame_type.has_pid().then_some(PID_NO_L3);
        Ax25Frame { dest, source, digis, frame_type, pid, info }
    }

    /// True when the frame was sent as a command
    pub fn is_command(&self) -> bool {
        self.dest.top_bit && !self.source.top_bit
    }

    /// Encodes addresses, control, PID, info and trailing FCS
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.digis.len() * 7 + self.info.len() + 2);
        out.extend_from_slice(&self.dest.encode(false));
        out.extend_from_slice(&self.source.encode(self.digis.is_empty()));
        for (i, digi) in self.digis.iter().enumerate() {
            out.extend_from_slice(&digi.encode(i + 1 == self.digis.len()));
        }
        out.push(self.frame_type.control());
        if let Some(pid) = self.pid {
            out.push(pid);
        }
        out.extend_from_slice(&self.info);
        let crc = fcs(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decodes a frame, verifying and stripping the FCS
    pub fn decode(data: &[u8]) -> Result<Self> {
        // dest(7) + src(7) + control(1) + fcs(2)
        if data.len() < 17 {
            return Err(Error::protocol("AX.25 frame too short"));
        }
        if !fcs_check(data) {
            return Err(Error::protocol("AX.25 FCS mismatch"));
        }
        let data = &data[..data.len() - 2];

        let (dest, dest_last) = Ax25Address::decode(&data[0..7])?;
        if dest_last {
            return Err(Error::protocol("destination marked as last address"));
        }
        let (source, mut last) = Ax25Address::decode(&data[7..14])?;
        let mut pos = 14;
        let mut digis = Vec::new();
        while !last {
            if digis.len() == 8 {
                return Err(Error::protocol("digipeater path longer than 8"));
            }
            if pos + 7 > data.len() {
                return Err(Error::protocol("truncated digipeater path"));
            }
            let (digi, l) = Ax25Address::decode(&data[pos..pos + 7])?;
            digis.push(digi);
            last = l;
            pos += 7;
        }

        if pos >= data.len() {
            return Err(Error::protocol("missing control field"));
        }
        let frame_type = FrameType::from_control(data[pos]);
        pos += 1;

        let pid = if frame_type.has_pid() {
            if pos >= data.len() {
                return Err(Error::protocol("missing PID field"));
            }
            let p = data[pos];
            pos += 1;
            Some(p)
        } else {
            None
        };

        Ok(Ax25Frame {
            dest,
            source,
            digis,
            frame_type,
            pid,
            info: Bytes::copy_from_slice(&data[pos..]),
        })
    }
}
