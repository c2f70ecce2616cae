//! Snapshot archive writer (§6): bundles every tracebuffer file under a
//! root, plus caller-supplied extra files, into a TAR stream, optionally
//! gzip-compressed.
//!
//! The destination is written through a caller-provided callback so callers
//! can plug in rate limiting, a pipe, or a test double; a short write from
//! that callback signals interruption, in which case the partially-written
//! output file is deleted rather than left as a corrupt snapshot.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Builder;

use crate::error::{Error, Result};

/// Wraps an arbitrary write callback, turning "wrote fewer bytes than
/// asked" into an explicit interruption error the caller above can detect
/// and use to trigger cleanup (§6: "may signal interruption by returning a
/// shorter-than-requested count").
pub struct InterruptibleWriter<F: FnMut(&[u8]) -> io::Result<usize>> {
    write_fn: F,
}

impl<F: FnMut(&[u8]) -> io::Result<usize>> InterruptibleWriter<F> {
    pub fn new(write_fn: F) -> Self {
        InterruptibleWriter { write_fn }
    }
}

impl<F: FnMut(&[u8]) -> io::Result<usize>> Write for InterruptibleWriter<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = (self.write_fn)(buf)?;
        if n < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "snapshot write callback returned a short write",
            ));
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes a snapshot archive to `dest_path`: every `*.clltk_trace`/
/// `*.clltk_ktrace` file directly under `tracing_root`, plus `extra_files`
/// (archived under their file name), as a TAR stream. `compress` selects
/// gzip (magic `0x1f 0x8b`) vs a plain `ustar` stream.
pub fn write(
    dest_path: &Path,
    tracing_root: &Path,
    extra_files: &[PathBuf],
    compress: bool,
) -> Result<()> {
    let mut dest_file = File::create(dest_path).map_err(|e| Error::Io { inner: e })?;
    write_with_callback(
        move |buf| dest_file.write(buf),
        dest_path,
        tracing_root,
        extra_files,
        compress,
    )
}

/// As [`write`], but routes every archive byte through `write_fn` instead of
/// writing the destination file directly. A short write from `write_fn`
/// (fewer bytes accepted than given) is treated as an interruption: the
/// archive is abandoned and `dest_path` is deleted.
pub fn write_with_callback(
    write_fn: impl FnMut(&[u8]) -> io::Result<usize>,
    dest_path: &Path,
    tracing_root: &Path,
    extra_files: &[PathBuf],
    compress: bool,
) -> Result<()> {
    match write_inner(write_fn, tracing_root, extra_files, compress) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(dest_path);
            Err(e)
        }
    }
}

fn write_inner(
    write_fn: impl FnMut(&[u8]) -> io::Result<usize>,
    tracing_root: &Path,
    extra_files: &[PathBuf],
    compress: bool,
) -> Result<()> {
    let dest = InterruptibleWriter::new(write_fn);

    if compress {
        let encoder = GzEncoder::new(dest, Compression::default());
        write_entries(Builder::new(encoder), tracing_root, extra_files)?
            .into_inner()
            .map_err(|e| Error::Io { inner: e })?
            .finish()
            .map_err(|e| Error::Io { inner: e })?;
    } else {
        write_entries(Builder::new(dest), tracing_root, extra_files)?
            .into_inner()
            .map_err(|e| Error::Io { inner: e })?;
    }
    Ok(())
}

fn write_entries<W: Write>(
    mut builder: Builder<W>,
    tracing_root: &Path,
    extra_files: &[PathBuf],
) -> Result<Builder<W>> {
    for entry in std::fs::read_dir(tracing_root).map_err(|e| Error::Io { inner: e })? {
        let entry = entry.map_err(|e| Error::Io { inner: e })?;
        let path = entry.path();
        let is_trace = path
            .extension()
            .map(|e| e == "clltk_trace" || e == "clltk_ktrace")
            .unwrap_or(false);
        if !is_trace {
            continue;
        }
        let name = path.file_name().unwrap();
        builder
            .append_path_with_name(&path, name)
            .map_err(|e| Error::Io { inner: e })?;
    }

    for extra in extra_files {
        let name = extra.file_name().ok_or_else(|| Error::BadHeader {
            inner: format!("extra snapshot file has no file name: {}", extra.display()),
        })?;
        builder
            .append_path_with_name(extra, name)
            .map_err(|e| Error::Io { inner: e })?;
    }

    builder.finish().map_err(|e| Error::Io { inner: e })?;
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn uncompressed_snapshot_has_ustar_magic_at_257() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.clltk_trace"), b"hello").unwrap();
        let dest = dir.path().join("out.tar");

        write(&dest, dir.path(), &[], false).unwrap();

        let mut bytes = Vec::new();
        File::open(&dest).unwrap().read_to_end(&mut bytes).unwrap();
        assert!(bytes.len() > 257 + 5);
        assert_eq!(&bytes[257..262], b"ustar");
    }

    #[test]
    fn compressed_snapshot_starts_with_gzip_magic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.clltk_trace"), b"hello").unwrap();
        let dest = dir.path().join("out.tar.gz");

        write(&dest, dir.path(), &[], true).unwrap();

        let mut bytes = vec![0u8; 2];
        File::open(&dest).unwrap().read_exact(&mut bytes).unwrap();
        assert_eq!(bytes, [0x1f, 0x8b]);
    }

    #[test]
    fn non_trace_files_are_not_included() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.clltk_trace"), b"hello").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"irrelevant").unwrap();
        let dest = dir.path().join("out.tar");

        write(&dest, dir.path(), &[], false).unwrap();

        let mut archive = tar::Archive::new(File::open(&dest).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.clltk_trace"]);
    }
}
