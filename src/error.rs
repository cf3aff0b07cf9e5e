use snafu::Snafu;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Cannot find file {}", path.display()))]
    NotFound { path: PathBuf },

    #[snafu(display("Access denied to {}: {}", path.display(), source))]
    Access { path: PathBuf, source: io::Error },

    #[snafu(display("Write at 0x{:08x} refused: image is open read-only", offset))]
    ReadOnly { offset: usize },

    #[snafu(display("Offset 0x{:08x} is outside the image (length 0x{:08x})", offset, length))]
    OutOfRange { offset: usize, length: usize },

    #[snafu(display("Invalid configuration: {}", reason))]
    Configuration { reason: String },

    #[snafu(display("I/O error on {}: {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot read pattern file {}: {}", path.display(), source))]
    PatternFile {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Cannot encode patch log {}: {}", path.display(), source))]
    LogJson {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Cannot encode patch log {}: {}", path.display(), source))]
    LogBincode { path: PathBuf, source: bincode::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn config<S: Into<String>>(reason: S) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }

    /// Classifies an error raised while opening `path`.
    pub(crate) fn from_open(path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        match source.kind() {
            io::ErrorKind::NotFound => Error::NotFound { path },
            io::ErrorKind::PermissionDenied => Error::Access { path, source },
            _ => Error::Io { path, source },
        }
    }
}
