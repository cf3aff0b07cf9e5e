mod backup;
mod diff;
mod error;
mod patch;
mod pattern;
mod scan;
mod session;
mod source;

use crate::error::{Error, Result};
use crate::patch::{test_bit, BitIndex, PatchResult};
use crate::pattern::Pattern;
use crate::session::{NoServices, Operation, Outcome, Session};
use crate::source::{Backend, ByteSource, Mode as OpenMode};
use clap::arg_enum;
use log::{debug, error};
use std::path::PathBuf;
use std::process;
use structopt::StructOpt;

arg_enum! {
    #[derive(Debug)]
    enum Mode {
        Patch,
        Unpatch,
        Scan,
        Diff
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "gospatch", about = "Enables guest OS table entries in a binary image")]
struct Options {
    #[structopt(
        short,
        long,
        possible_values = &Mode::variants(),
        case_insensitive = true,
        default_value = "Patch"
    )]
    mode: Mode,
    #[structopt(
        long,
        possible_values = &Backend::variants(),
        case_insensitive = true,
        default_value = "Mmap"
    )]
    backend: Backend,
    /// Bit of the flag byte to set or clear
    #[structopt(short, long, default_value = "0")]
    bit: u8,
    /// JSON pattern file replacing the built-in GOS entry
    #[structopt(short, long, parse(from_os_str), conflicts_with = "signature")]
    pattern: Option<PathBuf>,
    /// Pattern as 32 hex tokens, `[AA|BB]` for alternatives
    #[structopt(short, long)]
    signature: Option<String>,
    /// Copy the target into this directory before writing
    #[structopt(long, parse(from_os_str))]
    backup: Option<PathBuf>,
    /// Write the patch log as JSON here (and bincode beside it)
    #[structopt(long, parse(from_os_str))]
    log: Option<PathBuf>,
    /// Equal bytes folded into one diff section
    #[structopt(short, long, default_value = "1")]
    gap: usize,
    #[structopt(short, long)]
    verbose: bool,
    #[structopt(index = 1, required = true, name = "FILE", parse(from_os_str))]
    input: PathBuf,
    /// Patched copy to compare against in diff mode
    #[structopt(index = 2, name = "PATCHED", parse(from_os_str))]
    patched: Option<PathBuf>,
}

fn main() {
    let opt = Options::from_args();
    let filter = if opt.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
    debug!("{:?}", opt);

    println!("gospatch");
    println!("--------");

    let code = match run(&opt) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            1
        }
    };
    process::exit(code);
}

fn run(opt: &Options) -> Result<i32> {
    let pattern = match (&opt.pattern, &opt.signature) {
        (Some(path), _) => Pattern::load(path)?,
        (None, Some(signature)) => Pattern::parse("custom", signature)?,
        (None, None) => Pattern::gos(),
    };
    let bit = BitIndex::new(opt.bit)?;

    let operation = match opt.mode {
        Mode::Patch => Operation::Patch,
        Mode::Unpatch => Operation::Unpatch,
        Mode::Scan => Operation::Scan,
        Mode::Diff => return run_diff(opt, &pattern),
    };

    if let (Some(dir), Some(_)) = (&opt.backup, operation.bit_op()) {
        let copy = backup::backup(&opt.input, dir)?;
        println!("Backup: {}", copy.display());
    }

    let session = Session::new(pattern, bit, opt.backend, operation);
    println!("{} Table Patching: {}", session.pattern().name(), opt.input.display());
    let outcome = session.run(&opt.input, &mut NoServices)?;
    report(&session, operation, bit, &outcome);

    if let Some(path) = &opt.log {
        session.log(&opt.input, &outcome).save(path)?;
        println!("Patch log: {}", path.display());
    }

    if let Some(e) = &outcome.restore_error {
        eprintln!("Services not restored: {}", e);
    }
    Ok(if outcome.failures.is_empty() && outcome.restore_error.is_none() {
        0
    } else {
        2
    })
}

fn report(session: &Session, operation: Operation, bit: BitIndex, outcome: &Outcome) {
    let name = session.pattern().name();
    for result in outcome.results() {
        match operation {
            Operation::Scan => println!(
                "{} Entry @: 0x{:08x} flag 0x{:02x} (bit {} {})",
                name,
                result.offset,
                result.before,
                bit.get(),
                if test_bit(result.before, bit) { "set" } else { "clear" }
            ),
            _ => println!("{} Patched flag @: 0x{:08x}{}", name, result.offset, suffix(result)),
        }
    }
    for failure in &outcome.failures {
        println!("{} Entry @: 0x{:08x} not patched: {}", name, failure.offset, failure.error);
    }
    println!(
        "{} Table Patched: {} entries, {} changed, {} unchanged, {} failed",
        name,
        outcome.matches,
        outcome.changed(),
        outcome.unchanged(),
        outcome.failures.len()
    );
}

fn suffix(result: &PatchResult) -> String {
    if result.changed() {
        format!(" (0x{:02x} -> 0x{:02x})", result.before, result.after)
    } else {
        " (already done)".to_string()
    }
}

fn run_diff(opt: &Options, pattern: &Pattern) -> Result<i32> {
    let patched = opt
        .patched
        .as_ref()
        .ok_or_else(|| Error::config("diff mode needs the patched file as a second argument"))?;

    let input = ByteSource::open(&opt.input, OpenMode::ReadOnly, opt.backend)?;
    let output = ByteSource::open(patched, OpenMode::ReadOnly, opt.backend)?;
    let sections = diff::diff(input.as_slice(), output.as_slice(), opt.gap)?;

    for section in &sections {
        println!(
            "Section {}: 0x{:08x}..=0x{:08x} {:02X?} -> {:02X?}",
            section.id, section.start, section.end, section.search, section.data
        );
    }
    println!("Sections found: {}", sections.len());

    let unexpected = diff::unexpected_changes(&input, &sections, pattern);
    for offset in &unexpected {
        println!("Unexpected change @: 0x{:08x}", offset);
    }
    input.close()?;
    output.close()?;

    Ok(if unexpected.is_empty() { 0 } else { 2 })
}
