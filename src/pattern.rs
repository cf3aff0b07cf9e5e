use crate::error::{Error, PatternFile, Result};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::convert::TryFrom;
use std::fmt;
use std::fs;
use std::path::Path;

/// Length of every table record matched by a [`Pattern`].
pub const RECORD_LEN: usize = 32;

/// The flag byte follows the matched window directly.
pub const DEFAULT_FLAG_OFFSET: usize = RECORD_LEN;

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Descriptor {
    Exact(u8),
    OneOf(Vec<u8>),
}

impl Descriptor {
    pub fn accepts(&self, byte: u8) -> bool {
        match self {
            Descriptor::Exact(value) => *value == byte,
            Descriptor::OneOf(set) => set.contains(&byte),
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Exact(value) => write!(f, "{:02X}", value),
            Descriptor::OneOf(set) => {
                let alternatives: Vec<String> = set.iter().map(|b| format!("{:02X}", b)).collect();
                write!(f, "[{}]", alternatives.join("|"))
            }
        }
    }
}

/// On-disk form of a pattern, as read from a JSON pattern file.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct PatternConfig {
    pub name: String,
    pub descriptors: Vec<Descriptor>,
    #[serde(default = "default_flag_offset")]
    pub flag_offset: usize,
}

fn default_flag_offset() -> usize {
    DEFAULT_FLAG_OFFSET
}

/// A validated masked pattern: exactly [`RECORD_LEN`] descriptors, none of
/// them an empty alternation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Pattern {
    name: String,
    descriptors: Vec<Descriptor>,
    flag_offset: usize,
}

impl Pattern {
    pub fn new<S: Into<String>>(
        name: S,
        descriptors: Vec<Descriptor>,
        flag_offset: usize,
    ) -> Result<Self> {
        if descriptors.len() != RECORD_LEN {
            return Err(Error::config(format!(
                "pattern has {} descriptors, expected {}",
                descriptors.len(),
                RECORD_LEN
            )));
        }
        if let Some(position) = descriptors.iter().position(|d| match d {
            Descriptor::OneOf(set) => set.is_empty(),
            Descriptor::Exact(_) => false,
        }) {
            return Err(Error::config(format!(
                "empty alternation at position {}",
                position
            )));
        }
        Ok(Self {
            name: name.into(),
            descriptors,
            flag_offset,
        })
    }

    /// Guest OS table entry shared by Workstation 12 and later:
    /// `10 00 00 00 [10|20] 00 00 00 [01|02]` followed by zeros.
    pub fn gos() -> Self {
        let mut descriptors = vec![Descriptor::Exact(0x00); RECORD_LEN];
        descriptors[0] = Descriptor::Exact(0x10);
        descriptors[4] = Descriptor::OneOf(vec![0x10, 0x20]);
        descriptors[8] = Descriptor::OneOf(vec![0x01, 0x02]);
        Self {
            name: "GOS".to_string(),
            descriptors,
            flag_offset: DEFAULT_FLAG_OFFSET,
        }
    }

    /// Parses whitespace separated hex tokens, `[AA|BB]` for alternations.
    pub fn parse<S: Into<String>>(name: S, signature: &str) -> Result<Self> {
        let mut descriptors = Vec::new();
        for token in signature.split_whitespace() {
            let descriptor = if token.starts_with('[') && token.ends_with(']') {
                let set = token[1..token.len() - 1]
                    .split('|')
                    .map(parse_hex)
                    .collect::<Result<Vec<u8>>>()?;
                Descriptor::OneOf(set)
            } else {
                Descriptor::Exact(parse_hex(token)?)
            };
            descriptors.push(descriptor);
        }
        Self::new(name, descriptors, DEFAULT_FLAG_OFFSET)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| Error::from_open(path, e))?;
        let config: PatternConfig = serde_json::from_str(&content).context(PatternFile { path })?;
        Self::try_from(config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Distance from a match start to its flag byte.
    pub fn flag_offset(&self) -> usize {
        self.flag_offset
    }

    /// Tests a window of exactly `len()` bytes, stopping at the first
    /// position that fails.
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() == self.descriptors.len()
            && self
                .descriptors
                .iter()
                .zip(window)
                .all(|(descriptor, &byte)| descriptor.accepts(byte))
    }
}

impl TryFrom<PatternConfig> for Pattern {
    type Error = Error;

    fn try_from(config: PatternConfig) -> Result<Self> {
        Pattern::new(config.name, config.descriptors, config.flag_offset)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<String> = self.descriptors.iter().map(|d| d.to_string()).collect();
        write!(f, "{}: {}", self.name, tokens.join(" "))
    }
}

fn parse_hex(token: &str) -> Result<u8> {
    if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::config(format!(
            "invalid signature token '{}': expected two hex digits",
            token
        )));
    }
    u8::from_str_radix(token, 16)
        .map_err(|e| Error::config(format!("invalid signature token '{}': {}", token, e)))
}
