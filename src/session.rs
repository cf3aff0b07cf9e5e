//! One open-scan-patch-close pass over a single image.
//!
//! Matches are collected from the image as it was when opened, then patched
//! one flag byte at a time. Each write is a single byte, and a failure on one
//! record does not stop the others, so a partially patched table is a
//! possible outcome; [`Outcome::failures`] says which records were missed.

use crate::error::{Error, Result};
use crate::patch::{BitIndex, BitOp, PatchEntry, PatchLog, PatchResult, RecordPatcher};
use crate::pattern::Pattern;
use crate::scan::{scan_bytes, Match};
use crate::source::{Backend, ByteSource, Mode};
use log::{debug, info, warn};
use std::path::Path;

/// Whatever keeps the target binary busy (services, running processes).
pub trait ServiceControl {
    /// Brings everything that may hold the target open to a stop.
    fn stop(&mut self) -> Result<()>;
    /// Returns services to the state `stop` found them in.
    fn restore(&mut self) -> Result<()>;
}

/// Used when nothing needs stopping.
pub struct NoServices;

impl ServiceControl for NoServices {
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operation {
    Scan,
    Patch,
    Unpatch,
}

impl Operation {
    pub fn bit_op(self) -> Option<BitOp> {
        match self {
            Operation::Scan => None,
            Operation::Patch => Some(BitOp::Set),
            Operation::Unpatch => Some(BitOp::Clear),
        }
    }

    pub fn mode(self) -> Mode {
        match self.bit_op() {
            Some(_) => Mode::ReadWrite,
            None => Mode::ReadOnly,
        }
    }
}

#[derive(Debug)]
pub struct RecordFailure {
    pub offset: usize,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub matches: usize,
    pub entries: Vec<PatchEntry>,
    pub failures: Vec<RecordFailure>,
    /// Set when services could not be put back after the image was written.
    pub restore_error: Option<Error>,
}

impl Outcome {
    pub fn results(&self) -> impl Iterator<Item = &PatchResult> + '_ {
        self.entries.iter().map(|entry| &entry.result)
    }

    pub fn changed(&self) -> usize {
        self.results().filter(|r| r.changed()).count()
    }

    pub fn unchanged(&self) -> usize {
        self.results().filter(|r| !r.changed()).count()
    }
}

pub struct Session {
    pattern: Pattern,
    bit: BitIndex,
    backend: Backend,
    operation: Operation,
}

impl Session {
    pub fn new(pattern: Pattern, bit: BitIndex, backend: Backend, operation: Operation) -> Self {
        Self {
            pattern,
            bit,
            backend,
            operation,
        }
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Runs the session against the file at `path`. Services are only
    /// stopped for sessions that write, and are restored even when the
    /// session itself fails. A failed restore after a completed session is
    /// carried in [`Outcome::restore_error`] so the writes stay visible.
    pub fn run<P: AsRef<Path>>(&self, path: P, services: &mut dyn ServiceControl) -> Result<Outcome> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::NotFound {
                path: path.to_path_buf(),
            });
        }
        if self.operation.mode() == Mode::ReadOnly {
            return self.run_path(path);
        }

        services.stop()?;
        let outcome = self.run_path(path);
        match (outcome, services.restore()) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(mut outcome), Err(e)) => {
                warn!("{}", e);
                outcome.restore_error = Some(e);
                Ok(outcome)
            }
            (Err(e), restored) => {
                if let Err(restore_error) = restored {
                    warn!("{}", restore_error);
                }
                Err(e)
            }
        }
    }

    fn run_path(&self, path: &Path) -> Result<Outcome> {
        let mut source = ByteSource::open(path, self.operation.mode(), self.backend)?;
        let outcome = self.run_on(&mut source);
        source.close()?;
        info!(
            "{}: {} matches, {} changed, {} failed",
            path.display(),
            outcome.matches,
            outcome.changed(),
            outcome.failures.len()
        );
        Ok(outcome)
    }

    /// Scans and patches an already open source. Per-record errors are
    /// collected, never raised.
    pub fn run_on(&self, source: &mut ByteSource) -> Outcome {
        let len = self.pattern.len();
        let haystack = source.as_slice();
        let found: Vec<(Match, Vec<u8>)> = scan_bytes(haystack, &self.pattern)
            .map(|m| (m, haystack[m.start_offset..m.start_offset + len].to_vec()))
            .collect();

        let patcher = RecordPatcher::new(
            self.pattern.flag_offset(),
            self.bit,
            self.operation.bit_op().unwrap_or(BitOp::Set),
        );
        let mut outcome = Outcome {
            matches: found.len(),
            ..Outcome::default()
        };

        for (m, window) in found {
            let result = match self.operation.bit_op() {
                Some(_) => patcher.patch(source, m),
                None => patcher.inspect(source, m),
            };
            match result {
                Ok(result) => {
                    debug!(
                        "{} entry @ 0x{:08x}: flag 0x{:02x} -> 0x{:02x}",
                        self.pattern.name(),
                        result.offset,
                        result.before,
                        result.after
                    );
                    outcome.entries.push(PatchEntry { result, window });
                }
                Err(error) => {
                    warn!("{} entry @ 0x{:08x}: {}", self.pattern.name(), m.start_offset, error);
                    outcome.failures.push(RecordFailure {
                        offset: m.start_offset,
                        error,
                    });
                }
            }
        }
        outcome
    }

    pub fn log(&self, target: &Path, outcome: &Outcome) -> PatchLog {
        PatchLog {
            target: target.display().to_string(),
            pattern: self.pattern.to_string(),
            bit: self.bit.get(),
            op: self.operation.bit_op(),
            entries: outcome.entries.clone(),
        }
    }
}
