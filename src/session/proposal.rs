use crate::core::{Error, Message, MessageType, Result};

/// Proposal kind: ASCII, binary, or B2F
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalKind {
    /// `FA`: uncompressed ASCII body
    Ascii,
    /// `FB`: compressed binary block
    Binary,
    /// `FC`: B2F block
    B2f,
}

impl ProposalKind {
    fn tag(&self) -> &'static str {
        match self {
            ProposalKind::Ascii => "FA",
            ProposalKind::Binary => "FB",
            ProposalKind::B2f => "FC",
        }
    }
}

/// One proposal line of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Wire form used for the body transfer
    pub kind: ProposalKind,
    /// Message type letter
    pub msg_type: MessageType,
    /// Transfer size in octets (the block for FB/FC, the body for FA)
    pub size: u64,
    /// Uncompressed size, FC only
    pub uncompressed_size: Option<u64>,
    /// Originating callsign (FA/FB)
    pub from: Option<String>,
    /// Destination (FA/FB)
    pub to: Option<String>,
    /// `@` routing hint (FA/FB)
    pub routing: Option<String>,
    /// Message ID
    pub mid: String,
    /// Resume offset appended to the size field
    pub offset: Option<u64>,
}

impl Proposal {
    /// Builds a proposal for a queued message
    pub fn for_message(msg: &Message, kind: ProposalKind, size: u64, offset: Option<u64>) -> Self {
        Proposal {
            kind,
            msg_type: msg.msg_type,
            size,
            uncompressed_size: match kind {
                ProposalKind::B2f => Some(msg.total_size()),
                _ => None,
            },
            from: Some(msg.from.clone()),
            to: msg.to.first().cloned(),
            routing: msg.routing.clone(),
            mid: msg.mid.clone(),
            offset,
        }
    }

    fn size_field(&self) -> String {
        match self.offset {
            Some(off) => format!("{}@{}", self.size, off),
            None => self.size.to_string(),
        }
    }

    /// Formats the wire line (without terminator)
    pub fn to_line(&self) -> String {
        match self.kind {
            ProposalKind::B2f => format!(
                "FC {} {} {} {}",
                self.msg_type.as_char(),
                self.mid,
                self.uncompressed_size.unwrap_or(self.size),
                self.size_field(),
            ),
            _ => {
                let mut line = format!(
                    "{} {} {} {} {}",
                    self.kind.tag(),
                    self.msg_type.as_char(),
                    self.size_field(),
                    self.from.as_deref().unwrap_or("?"),
                    self.to.as_deref().unwrap_or("?"),
                );
                if let Some(routing) = &self.routing {
                    line.push_str(" @");
                    line.push_str(routing);
                }
                line.push(' ');
                line.push_str(&self.mid);
                line
            }
        }
    }

    /// Parses one proposal line
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let tag = fields.next().unwrap_or("");
        let kind = match tag {
            "FA" => ProposalKind::Ascii,
            "FB" => ProposalKind::Binary,
            "FC" => ProposalKind::B2f,
            other => return Err(Error::protocol(format!("unknown proposal kind {:?}", other))),
        };
        let msg_type = {
            let t = fields
                .next()
                .ok_or_else(|| Error::protocol("proposal missing type field"))?;
            let mut chars = t.chars();
            let (Some(c), None) = (chars.next(), chars.next()) else {
                return Err(Error::protocol(format!("bad proposal type field {:?}", t)));
            };
            MessageType::from_char(c)?
        };

        let parse_size = |s: &str| -> Result<(u64, Option<u64>)> {
            let (size, offset) = match s.split_once('@') {
                Some((size, off)) => {
                    let off = off
                        .parse::<u64>()
                        .map_err(|_| Error::protocol(format!("bad offset in {:?}", s)))?;
                    (size, Some(off))
                }
                None => (s, None),
            };
            let size = size
                .parse::<u64>()
                .map_err(|_| Error::protocol(format!("bad size in {:?}", s)))?;
            Ok((size, offset))
        };

        match kind {
            ProposalKind::B2f => {
                let mid = fields
                    .next()
                    .ok_or_else(|| Error::protocol("FC proposal missing MID"))?;
                let usize_field = fields
                    .next()
                    .ok_or_else(|| Error::protocol("FC proposal missing size"))?;
                let csize_field = fields
                    .next()
                    .ok_or_else(|| Error::protocol("FC proposal missing compressed size"))?;
                let (uncompressed, _) = parse_size(usize_field)?;
                let (size, offset) = parse_size(csize_field)?;
                Ok(Proposal {
                    kind,
                    msg_type,
                    size,
                    uncompressed_size: Some(uncompressed),
                    from: None,
                    to: None,
                    routing: None,
                    mid: mid.to_string(),
                    offset,
                })
            }
            _ => {
                let size_field = fields
                    .next()
                    .ok_or_else(|| Error::protocol("proposal missing size field"))?;
                let (size, offset) = parse_size(size_field)?;
                let from = fields
                    .next()
                    .ok_or_else(|| Error::protocol("proposal missing from field"))?;
                let to = fields
                    .next()
                    .ok_or_else(|| Error::protocol("proposal missing to field"))?;
                let mut routing = None;
                let mut mid = None;
                for field in fields {
                    if let Some(r) = field.strip_prefix('@') {
                        routing = Some(r.to_string());
                    } else {
                        mid = Some(field.to_string());
                    }
                }
                let mid = mid.ok_or_else(|| Error::protocol("proposal missing MID"))?;
                Ok(Proposal {
                    kind,
                    msg_type,
                    size,
                    uncompressed_size: None,
                    from: Some(from.to_string()),
                    to: Some(to.to_string()),
                    routing,
                    mid,
                    offset,
                })
            }
        }
    }
}

/// Sum of the batch text bytes, CRLF included, reduced to eight bits
pub fn batch_checksum(lines: &[String]) -> u8 {
    lines
        .iter()
        .flat_map(|l| l.bytes().chain(*b"\r\n"))
        .fold(0u8, |acc, b| acc.wrapping_add(b))
}

/// Formats the batch terminator, `F> XX`
pub fn batch_end_line(lines: &[String]) -> String {
    format!("F> {:02X}", batch_checksum(lines))
}

/// Per-proposal verdict in an `FS` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// `+`: send the body
    Accept,
    /// `-`: rejected
    Reject,
    /// `=`: rejected, checksum or format problem
    BadFormat,
    /// `L`: peer already has the message
    AlreadyHave,
    /// `R`: deferred for resources
    NoResources,
    /// `H`: traffic-limited, stop offering after this batch
    Limit,
    /// `E`: error
    Error,
    /// `!n`: accepted, resume from octet n
    Offset(u64),
}

impl Verdict {
    fn push_to(self, out: &mut String) {
        match self {
            Verdict::Accept => out.push('+'),
            Verdict::Reject => out.push('-'),
            Verdict::BadFormat => out.push('='),
            Verdict::AlreadyHave => out.push('L'),
            Verdict::NoResources => out.push('R'),
            Verdict::Limit => out.push('H'),
            Verdict::Error => out.push('E'),
            Verdict::Offset(n) => {
                out.push('!');
                out.push_str(&n.to_string());
            }
        }
    }
}

/// Formats an `FS` reply line
pub fn format_fs_line(verdicts: &[Verdict]) -> String {
    let mut out = String::from("FS ");
    for v in verdicts {
        v.push_to(&mut out);
    }
    out
}

/// Parses an `FS` reply; the verdict count must match the batch length.
///
/// `!offset` is positional like every other verdict: it occupies one slot
/// and consumes its trailing digits.
pub fn parse_fs_line(line: &str, expected: usize) -> Result<Vec<Verdict>> {
    let rest = line
        .trim()
        .strip_prefix("FS")
        .ok_or_else(|| Error::protocol(format!("not an FS line: {:?}", line)))?
        .trim_start();
    let mut verdicts = Vec::with_capacity(expected);
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        let verdict = match c {
            '+' => Verdict::Accept,
            '-' => Verdict::Reject,
            '=' => Verdict::BadFormat,
            'L' | 'l' => Verdict::AlreadyHave,
            'R' | 'r' => Verdict::NoResources,
            'H' | 'h' => Verdict::Limit,
            'E' | 'e' => Verdict::Error,
            '!' => {
                let mut digits = String::new();
                while let Some(d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(*d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let off = digits
                    .parse::<u64>()
                    .map_err(|_| Error::protocol("verdict !offset without digits"))?;
                Verdict::Offset(off)
            }
            ' ' => continue,
            other => {
                return Err(Error::protocol(format!("unknown verdict character {:?}", other)));
            }
        };
        verdicts.push(verdict);
    }
    if verdicts.len() != expected {
        return Err(Error::protocol(format!(
            "verdict count {} does not match batch length {}",
            verdicts.len(),
            expected,
        )));
    }
    Ok(verdicts)
}
