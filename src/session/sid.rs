use std::fmt;

use crate::core::{Error, Result};

/// Capability flags carried in the SID feature field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SidFeatures {
    /// `F`: FBB basic protocol
    pub fbb_basic: bool,
    /// `B`: binary (compressed) forwarding
    pub binary: bool,
    /// `B1`: B1 protocol revision
    pub b1: bool,
    /// `G`: gzip compression accepted for binary blocks
    pub gzip: bool,
    /// `H`: traffic limiting
    pub traffic_limit: bool,
    /// `M`: proposal batch checksum
    pub proposal_checksum: bool,
    /// `X`: extended forwarding (`!offset` resume verdicts)
    pub xfwd: bool,
    /// `$` terminator present
    pub terminator: bool,
}

/// Session identification line, `[name-version-features$]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sid {
    /// Implementation name
    pub name: String,
    /// Implementation version
    pub version: String,
    /// Capability flags
    pub features: SidFeatures,
}

impl Sid {
    /// True when a line looks like a bracketed SID
    pub fn is_sid_line(line: &str) -> bool {
        let line = line.trim();
        line.starts_with('[') && line.ends_with(']') && line.len() > 2
    }

    /// Parses a bracketed SID line.
    ///
    /// A missing `$` terminator is tolerated as long as every capability
    /// letter is known; unknown letters under a `$` are ignored.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let inner = line
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| Error::protocol(format!("not a SID line: {:?}", line)))?;

        let (name, rest) = inner
            .split_once('-')
            .ok_or_else(|| Error::protocol(format!("SID missing version field: {:?}", line)))?;
        let (version, flags) = rest
            .rsplit_once('-')
            .ok_or_else(|| Error::protocol(format!("SID missing feature field: {:?}", line)))?;

        let mut features = SidFeatures::default();
        let mut unknown = Vec::new();
        let mut chars = flags.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                'F' => features.fbb_basic = true,
                'B' => {
                    features.binary = true;
                    if chars.peek() == Some(&'1') {
                        chars.next();
                        features.b1 = true;
                    }
                }
                'G' => features.gzip = true,
                'H' => features.traffic_limit = true,
                'M' => features.proposal_checksum = true,
                'X' => features.xfwd = true,
                '$' => features.terminator = true,
                other => unknown.push(other),
            }
        }
        if !features.terminator && !unknown.is_empty() {
            return Err(Error::protocol(format!(
                "SID lacks $ terminator and carries unknown capabilities {:?}", unknown,
            )));
        }
        Ok(Sid {
            name: name.to_string(),
            version: version.to_string(),
            features,
        })
    }

    /// Builds our own SID from name, version and the features we offer
    pub fn build(name: &str, version: &str, features: SidFeatures) -> Self {
        Sid {
            name: name.to_string(),
            version: version.to_string(),
            features,
        }
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fl = &self.features;
        let mut flags = String::new();
        if fl.fbb_basic {
            flags.push('F');
        }
        if fl.binary {
            flags.push('B');
            if fl.b1 {
                flags.push('1');
            }
        }
        if fl.gzip {
            flags.push('G');
        }
        if fl.traffic_limit {
            flags.push('H');
        }
        if fl.proposal_checksum {
            flags.push('M');
        }
        if fl.xfwd {
            flags.push('X');
        }
        flags.push('$');
        write!(f, "[{}-{}-{}]", self.name, self.version, flags)
    }
}
