use crate::error::{Error, LogBincode, LogJson, Result};
use crate::scan::Match;
use crate::source::ByteSource;
use hex_buffer_serde::{Hex as _, HexForm};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::fs;
use std::path::Path;

pub fn set_bit(value: u8, bit: BitIndex) -> u8 {
    value | (1 << bit.0)
}

pub fn clear_bit(value: u8, bit: BitIndex) -> u8 {
    value & !(1 << bit.0)
}

pub fn test_bit(value: u8, bit: BitIndex) -> bool {
    value & (1 << bit.0) != 0
}

/// A bit position inside the flag byte, always in `0..=7`.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub struct BitIndex(u8);

impl BitIndex {
    pub fn new(index: u8) -> Result<Self> {
        if index > 7 {
            return Err(Error::config(format!(
                "bit index {} is outside 0..=7",
                index
            )));
        }
        Ok(BitIndex(index))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub enum BitOp {
    Set,
    Clear,
}

impl BitOp {
    pub fn apply(self, value: u8, bit: BitIndex) -> u8 {
        match self {
            BitOp::Set => set_bit(value, bit),
            BitOp::Clear => clear_bit(value, bit),
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub struct PatchResult {
    /// Start of the matched record.
    pub offset: usize,
    /// Absolute position of the flag byte.
    pub flag_at: usize,
    pub before: u8,
    pub after: u8,
}

impl PatchResult {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Rewrites one bit of the flag byte owned by each match.
#[derive(Clone, Copy, Debug)]
pub struct RecordPatcher {
    pub flag_offset: usize,
    pub bit: BitIndex,
    pub op: BitOp,
}

impl RecordPatcher {
    pub fn new(flag_offset: usize, bit: BitIndex, op: BitOp) -> Self {
        Self {
            flag_offset,
            bit,
            op,
        }
    }

    /// Applies the bit operation. The byte is only written when it changes,
    /// so running twice over the same image is a no-op the second time.
    pub fn patch(&self, source: &mut ByteSource, m: Match) -> Result<PatchResult> {
        let flag_at = self.flag_at(source, m)?;
        let before = source.read_byte(flag_at)?;
        let after = self.op.apply(before, self.bit);
        if after != before {
            source.write_byte(flag_at, after)?;
        }
        Ok(PatchResult {
            offset: m.start_offset,
            flag_at,
            before,
            after,
        })
    }

    /// Reads the flag byte without touching it.
    pub fn inspect(&self, source: &ByteSource, m: Match) -> Result<PatchResult> {
        let flag_at = self.flag_at(source, m)?;
        let flag = source.read_byte(flag_at)?;
        Ok(PatchResult {
            offset: m.start_offset,
            flag_at,
            before: flag,
            after: flag,
        })
    }

    fn flag_at(&self, source: &ByteSource, m: Match) -> Result<usize> {
        let length = source.length();
        match m.start_offset.checked_add(self.flag_offset) {
            Some(flag_at) if flag_at < length => Ok(flag_at),
            _ => Err(Error::OutOfRange {
                offset: m.start_offset.saturating_add(self.flag_offset),
                length,
            }),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct PatchEntry {
    pub result: PatchResult,
    /// Matched record bytes as they were before patching.
    #[serde(with = "HexForm")]
    pub window: Vec<u8>,
}

/// Durable record of one session, written only on request.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct PatchLog {
    pub target: String,
    pub pattern: String,
    pub bit: u8,
    pub op: Option<BitOp>,
    pub entries: Vec<PatchEntry>,
}

impl PatchLog {
    /// Writes the log as JSON to `path` and as bincode next to it (`.rbp`).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let coded = serde_json::to_string_pretty(self).context(LogJson { path })?;
        fs::write(path, coded).map_err(|e| Error::from_open(path, e))?;

        let binary_path = path.with_extension("rbp");
        let coded = bincode::serialize(self).context(LogBincode { path: &binary_path })?;
        fs::write(&binary_path, coded).map_err(|e| Error::from_open(&binary_path, e))?;
        Ok(())
    }
}
