// Copyright (c) The lattice Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synchronous filesystem primitives shared by the local host and the
//! helper program. Callers on the loop wrap these in `spawn_blocking`.

use crate::host::{FileKind, ListEntry};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::{
    ffi::CString,
    fs,
    io::{self, Write},
    os::unix::fs::MetadataExt,
    path::Path,
};
use walkdir::WalkDir;

/// Recursively lists `root`, yielding entries relative to it with no
/// leading separator. The root itself is not emitted.
pub(crate) fn recursive_list(root: &Path) -> io::Result<Vec<ListEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let metadata = entry.metadata().map_err(io::Error::other)?;
        let kind = if metadata.is_dir() {
            FileKind::Dir
        } else {
            FileKind::File
        };
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .into_owned();
        entries.push(ListEntry {
            kind,
            path: relative,
            atime: metadata.atime(),
            mtime: metadata.mtime(),
            ctime: metadata.ctime(),
        });
    }
    Ok(entries)
}

/// Removes a file or tree; missing paths are fine.
pub(crate) fn recursive_remove(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Compiles a semicolon-joined list of name globs.
pub(crate) fn compile_ignore_globs(ignore: &str) -> io::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in ignore.split(';').filter(|p| !p.is_empty()) {
        builder.add(Glob::new(pattern).map_err(io::Error::other)?);
    }
    builder.build().map_err(io::Error::other)
}

/// Copies a file, or recursively copies a tree, to `dest`. Entries whose
/// *name* matches one of the ignore globs are omitted.
pub(crate) fn recursive_copy(src: &Path, dest: &Path, ignore: Option<&str>) -> io::Result<()> {
    let metadata = fs::metadata(src).map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("no such file or directory: {}", src.display()),
        )
    })?;
    let globs = match ignore {
        Some(ignore) => Some(compile_ignore_globs(ignore)?),
        None => None,
    };
    if metadata.is_dir() {
        copy_tree(src, dest, globs.as_ref())
    } else {
        fs::copy(src, dest).map(|_| ())
    }
}

fn copy_tree(src: &Path, dest: &Path, globs: Option<&GlobSet>) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(globs) = globs {
            if globs.is_match(Path::new(&name)) {
                continue;
            }
        }
        let target = dest.join(&name);
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target, globs)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Appends data to a file, creating it if necessary.
pub(crate) fn append_to_file(path: &Path, data: &str) -> io::Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data.as_bytes())
}

/// Creates a directory and any missing parents.
pub(crate) fn make_dirs(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Sets a file's access and modification times, in seconds since epoch.
pub(crate) fn set_file_times(path: &Path, atime: i64, mtime: i64) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::other("path contains a NUL byte"))?;
    let times = libc::utimbuf {
        actime: atime,
        modtime: mtime,
    };
    let rc = unsafe { libc::utime(c_path.as_ptr(), &times) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
