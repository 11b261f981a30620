//! Filesystem operations tailored to `forge`.
//!
//! Inside this module, we refer to `std::fs` by its fully qualified path to
//! make it maximally clear what we are using. Everything here is synchronous:
//! the engine's workers are OS threads and block on their own I/O.

use std::{
    io::Write as _,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tap::TapFallible;
use tracing::trace;

/// Create the directory and all its parents, if they don't already exist.
pub fn create_dir_all(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Open a file for reading.
pub fn open_file(path: impl AsRef<Path>) -> Result<std::fs::File> {
    let path = path.as_ref();
    std::fs::File::open(path).with_context(|| format!("open file: {path:?}"))
}

/// Buffer the file content from disk.
pub fn read_buffered(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path)
        .with_context(|| format!("read file: {path:?}"))
        .tap_ok(|buf| trace!(?path, bytes = buf.len(), "read file"))
}

/// Buffer the file content from disk, or `None` if the file does not exist.
pub fn read_buffered_opt(path: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match std::fs::read(path) {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk and parse it as UTF8.
pub fn read_buffered_utf8(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    std::fs::read_to_string(path)
        .with_context(|| format!("read file: {path:?}"))
        .tap_ok(|buf| trace!(?path, bytes = buf.len(), "read file as string"))
}

/// Write the provided file content to disk.
pub fn write(path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Result<()> {
    let (path, content) = (path.as_ref(), content.as_ref());
    std::fs::write(path, content)
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Append the provided content to the file, creating it if needed.
///
/// The write goes through a single `write_all` call so that concurrent
/// appenders interleave at record granularity, not byte granularity.
pub fn append(path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Result<()> {
    let (path, content) = (path.as_ref(), content.as_ref());
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open file for append: {path:?}"))?;
    file.write_all(content)
        .with_context(|| format!("append to file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "append to file"))
}

/// Remove the file, succeeding if it does not exist.
pub fn remove_file_if_exists(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => {
            trace!(?path, "remove file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove file: {path:?}")),
    }
}

/// Rename `src` to `dst`.
pub fn rename(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    std::fs::rename(src, dst)
        .with_context(|| format!("rename {src:?} to {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename"))
}

/// Stat the path, or `None` if it does not exist.
pub fn metadata_opt(path: impl AsRef<Path>) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("stat: {path:?}")),
    }
}

/// Read directory entries, or an empty iterator if the directory is missing.
pub fn read_dir_opt(path: impl AsRef<Path>) -> Result<Vec<std::fs::DirEntry>> {
    let path = path.as_ref();
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read directory: {path:?}")),
    };
    entries
        .map(|entry| entry.with_context(|| format!("read directory entry in {path:?}")))
        .collect()
}

/// Copy the file from `src` to `dst`, preserving mtime.
///
/// The mtime matters: compilers compare source and output times to decide
/// whether work is stale, so restored outputs must carry the recorded times.
pub fn copy_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());

    let mut src_file = std::fs::File::open(src).context("open source file")?;
    let src_meta = src_file.metadata().context("get source metadata")?;
    let src_mtime = src_meta
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

    if let Some(parent) = dst.parent() {
        create_dir_all(parent)?;
    }
    let mut dst_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(dst)
        .context("open destination file")?;
    let bytes = std::io::copy(&mut src_file, &mut dst_file).context("copy file contents")?;

    // Using the `filetime` crate here instead of the stdlib because it's
    // cross platform.
    let mtime = filetime::FileTime::from_system_time(src_mtime);
    filetime::set_file_handle_times(&dst_file, None, Some(mtime))
        .context("set destination file times")?;
    dst_file.sync_all().context("sync destination file")?;

    trace!(?src, ?dst, ?bytes, "copy file");
    Ok(())
}

/// Express `path` relative to `root`.
///
/// Both paths must be absolute; the result is the canonical form mixed into
/// fingerprints, so the same file always produces the same relative path
/// regardless of how the caller spelled it.
pub fn relative_to(path: impl AsRef<Path>, root: impl AsRef<Path>) -> Result<PathBuf> {
    let (path, root) = (path.as_ref(), root.as_ref());
    if !path.is_absolute() || !root.is_absolute() {
        bail!("relative_to requires absolute paths: {path:?} relative to {root:?}");
    }
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .with_context(|| format!("make {path:?} relative to {root:?}"))
}
