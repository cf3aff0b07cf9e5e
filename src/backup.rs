use crate::error::{Error, Io, Result};
use log::debug;
use snafu::ResultExt;
use std::fs::{self, FileTimes, OpenOptions};
use std::path::{Path, PathBuf};

/// Copies `target` into `dir`, keeping its access and modification times so
/// the copy can stand in for the original if the patch has to be undone by
/// hand. Returns the path of the copy.
pub fn backup<P: AsRef<Path>, Q: AsRef<Path>>(target: P, dir: Q) -> Result<PathBuf> {
    let target = target.as_ref();
    let dir = dir.as_ref();

    let name = target
        .file_name()
        .ok_or_else(|| Error::config(format!("{} has no file name", target.display())))?;
    let metadata = fs::metadata(target).map_err(|e| Error::from_open(target, e))?;

    fs::create_dir_all(dir).context(Io { path: dir })?;
    let copy = dir.join(name);
    fs::copy(target, &copy).context(Io { path: &copy })?;

    let times = FileTimes::new()
        .set_accessed(metadata.accessed().context(Io { path: target })?)
        .set_modified(metadata.modified().context(Io { path: target })?);
    OpenOptions::new()
        .write(true)
        .open(&copy)
        .and_then(|file| file.set_times(times))
        .context(Io { path: &copy })?;

    debug!("Backed up {} to {}", target.display(), copy.display());
    Ok(copy)
}
