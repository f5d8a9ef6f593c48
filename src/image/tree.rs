//! Filesystem tree container decoding and materialization.
//!
//! Decoded disk images carry their directory tree as a cpio "newc"
//! stream: a header per entry (octet-aligned ASCII hex fields), the
//! entry name, then the payload. Materialization writes each entry under
//! the output root, preserving relative paths, permissions, and symlink
//! targets. Entry names are validated before any filesystem operation;
//! nothing a hostile image declares can land outside the output root.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::util::trim_null;
use crate::CancelToken;

const MAGIC_NEWC: &[u8; 6] = b"070701";
const MAGIC_CRC: &[u8; 6] = b"070702";
const HEADER_SIZE: usize = 110;
const TRAILER_NAME: &str = "TRAILER!!!";

/// Copy granularity for payload streaming.
const COPY_CHUNK: usize = 64 * 1024;
/// Longest accepted entry name, terminator included.
const MAX_NAME_SIZE: u64 = 4096;
/// Longest accepted symlink target.
const MAX_SYMLINK_TARGET: u64 = 4096;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

// =============================================================================
// Tree Statistics
// =============================================================================

/// Counters for one materialized tree.
#[derive(Debug, Default, Clone)]
pub struct TreeStats {
    /// Regular files written
    pub files: u64,
    /// Directories created
    pub directories: u64,
    /// Symlinks created
    pub symlinks: u64,
    /// Payload bytes written
    pub bytes: u64,
}

impl TreeStats {
    /// Accumulates another tree's counters into this one.
    pub(crate) fn absorb(&mut self, other: &TreeStats) {
        self.files += other.files;
        self.directories += other.directories;
        self.symlinks += other.symlinks;
        self.bytes += other.bytes;
    }
}

/// Returns true if `head` starts a tree container stream.
pub(crate) fn has_tree_magic(head: &[u8]) -> bool {
    head.len() >= 6 && (&head[..6] == MAGIC_NEWC || &head[..6] == MAGIC_CRC)
}

// =============================================================================
// Materialization
// =============================================================================

/// Streams a tree container out of `reader` and materializes it under
/// `output_root`.
///
/// `entry_name` is the archive entry being decoded, used for error
/// context only. The reader is left positioned just past the trailer;
/// trailing padding is the caller's to consume.
pub fn materialize<R: Read>(
    reader: &mut R,
    entry_name: &str,
    output_root: &Path,
    cancel: &CancelToken,
) -> Result<TreeStats> {
    let mut stats = TreeStats::default();
    let mut chunk = vec![0u8; COPY_CHUNK];
    // Directory modes are applied after the walk: a read-only directory
    // must not reject the files the stream places inside it.
    let mut deferred_dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let header = read_header(reader, entry_name)?;
        let Some(entry) = header else {
            break; // trailer reached
        };

        let Some(rel_path) = sanitize_entry_path(&entry.name)? else {
            // "." and friends name the root itself
            skip_payload(reader, entry_name, entry.filesize)?;
            continue;
        };
        let target = output_root.join(&rel_path);

        match entry.mode & S_IFMT {
            S_IFDIR => {
                fs::create_dir_all(&target).map_err(|e| Error::write_failed(&target, e))?;
                if entry.mode & 0o7777 != 0 {
                    deferred_dir_modes.push((target, entry.mode & 0o7777));
                }
                skip_payload(reader, entry_name, entry.filesize)?;
                stats.directories += 1;
            }
            S_IFLNK => {
                if entry.filesize > MAX_SYMLINK_TARGET {
                    return Err(Error::decode(
                        entry_name,
                        format!("symlink target of {} bytes in '{}'", entry.filesize, entry.name),
                    ));
                }
                let mut raw = vec![0u8; entry.filesize as usize];
                reader
                    .read_exact(&mut raw)
                    .map_err(|e| Error::decode(entry_name, format!("short symlink target: {e}")))?;
                skip_padding(reader, entry_name, entry.filesize)?;
                let link_target = String::from_utf8(raw).map_err(|_| {
                    Error::decode(entry_name, format!("non-UTF-8 symlink target in '{}'", entry.name))
                })?;
                write_symlink(&link_target, &target)?;
                stats.symlinks += 1;
            }
            S_IFREG => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::write_failed(parent, e))?;
                }
                let written = write_file(
                    reader,
                    entry_name,
                    &target,
                    entry.filesize,
                    entry.mode & 0o7777,
                    cancel,
                    &mut chunk,
                )?;
                skip_padding(reader, entry_name, entry.filesize)?;
                stats.files += 1;
                stats.bytes += written;
            }
            other => {
                warn!(
                    "skipping '{}' with unsupported entry type {:o}",
                    entry.name, other
                );
                skip_payload(reader, entry_name, entry.filesize)?;
            }
        }
    }

    apply_deferred_dir_modes(deferred_dir_modes);

    debug!(
        "materialized {} files, {} dirs, {} symlinks under {}",
        stats.files,
        stats.directories,
        stats.symlinks,
        output_root.display()
    );
    Ok(stats)
}

// =============================================================================
// Header Parsing
// =============================================================================

struct RawEntry {
    name: String,
    mode: u32,
    filesize: u64,
}

/// Reads one entry header; `None` means the trailer was reached.
fn read_header<R: Read>(reader: &mut R, entry_name: &str) -> Result<Option<RawEntry>> {
    let mut header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .map_err(|e| Error::decode(entry_name, format!("short tree entry header: {e}")))?;

    if &header[..6] != MAGIC_NEWC && &header[..6] != MAGIC_CRC {
        return Err(Error::decode(
            entry_name,
            format!("bad tree container magic {:02x?}", &header[..6]),
        ));
    }

    let mode = hex_field(&header, entry_name, 14)? as u32;
    let filesize = hex_field(&header, entry_name, 54)?;
    let namesize = hex_field(&header, entry_name, 94)?;
    if namesize == 0 || namesize > MAX_NAME_SIZE {
        return Err(Error::decode(
            entry_name,
            format!("implausible entry name size {namesize}"),
        ));
    }

    let mut name_buf = vec![0u8; namesize as usize];
    reader
        .read_exact(&mut name_buf)
        .map_err(|e| Error::decode(entry_name, format!("short entry name: {e}")))?;
    let name = String::from_utf8(trim_null(&name_buf).to_vec())
        .map_err(|_| Error::decode(entry_name, "non-UTF-8 entry name"))?;

    // Header plus name pads to a 4-byte boundary.
    let consumed = (HEADER_SIZE as u64) + namesize;
    skip_exact(reader, entry_name, consumed.next_multiple_of(4) - consumed)?;

    if name == TRAILER_NAME {
        return Ok(None);
    }

    Ok(Some(RawEntry {
        name,
        mode,
        filesize,
    }))
}

/// Parses one 8-digit ASCII hex field at `offset`.
fn hex_field(header: &[u8], entry_name: &str, offset: usize) -> Result<u64> {
    let raw = &header[offset..offset + 8];
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::decode(entry_name, "non-ASCII header field"))?;
    u64::from_str_radix(text, 16)
        .map_err(|_| Error::decode(entry_name, format!("bad hex header field '{text}'")))
}

// =============================================================================
// Path Sanitization
// =============================================================================

/// Normalizes an entry name to a relative path inside the output root.
///
/// Returns `None` for names addressing the root itself. Absolute names
/// and any `..` component are rejected outright.
fn sanitize_entry_path(name: &str) -> Result<Option<PathBuf>> {
    if name.starts_with('/') {
        return Err(Error::PathTraversal {
            name: name.to_string(),
        });
    }

    let mut rel = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal {
                    name: name.to_string(),
                })
            }
        }
    }

    if rel.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(rel))
    }
}

// =============================================================================
// Entry Writers
// =============================================================================

#[allow(clippy::too_many_arguments)]
fn write_file<R: Read>(
    reader: &mut R,
    entry_name: &str,
    target: &Path,
    len: u64,
    mode: u32,
    cancel: &CancelToken,
    chunk: &mut [u8],
) -> Result<u64> {
    // Remove first: a read-only survivor from an earlier run must not
    // block an overwrite.
    match fs::remove_file(target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::write_failed(target, e)),
    }

    let mut file = File::create(target).map_err(|e| Error::write_failed(target, e))?;
    let mut remaining = len;
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let want = remaining.min(chunk.len() as u64) as usize;
        reader
            .read_exact(&mut chunk[..want])
            .map_err(|e| Error::decode(entry_name, format!("short file payload: {e}")))?;
        file.write_all(&chunk[..want])
            .map_err(|e| Error::write_failed(target, e))?;
        remaining -= want as u64;
    }

    set_mode(target, mode);
    Ok(len)
}

fn write_symlink(link_target: &str, target: &Path) -> Result<()> {
    match fs::remove_file(target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::write_failed(target, e)),
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(link_target, target)
            .map_err(|e| Error::write_failed(target, e))?;
    }
    #[cfg(not(unix))]
    {
        warn!(
            "symlinks unsupported on this platform, skipping {} -> {}",
            target.display(),
            link_target
        );
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!("failed to set mode {:o} on {}: {e}", mode, path.display());
        }
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

fn apply_deferred_dir_modes(mut modes: Vec<(PathBuf, u32)>) {
    // Deepest first, so restricting a parent cannot block a child.
    modes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, mode) in modes {
        set_mode(&path, mode);
    }
}

// =============================================================================
// Stream Skipping
// =============================================================================

fn skip_exact<R: Read>(reader: &mut R, entry_name: &str, mut n: u64) -> Result<()> {
    let mut buf = [0u8; 512];
    while n > 0 {
        let want = n.min(buf.len() as u64) as usize;
        reader
            .read_exact(&mut buf[..want])
            .map_err(|e| Error::decode(entry_name, format!("truncated tree stream: {e}")))?;
        n -= want as u64;
    }
    Ok(())
}

fn skip_padding<R: Read>(reader: &mut R, entry_name: &str, filesize: u64) -> Result<()> {
    skip_exact(reader, entry_name, filesize.next_multiple_of(4) - filesize)
}

fn skip_payload<R: Read>(reader: &mut R, entry_name: &str, filesize: u64) -> Result<()> {
    skip_exact(reader, entry_name, filesize)?;
    skip_padding(reader, entry_name, filesize)
}

#[cfg(test)]
pub(crate) fn encode_tree(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (name, mode, data)) in entries.iter().enumerate() {
        push_entry(&mut out, i as u64 + 1, name, *mode, data);
    }
    push_entry(&mut out, 0, TRAILER_NAME, 0, &[]);
    out
}

#[cfg(test)]
fn push_entry(out: &mut Vec<u8>, ino: u64, name: &str, mode: u32, data: &[u8]) {
    use std::fmt::Write as _;

    let mut header = String::with_capacity(HEADER_SIZE);
    header.push_str("070701");
    let fields = [
        ino,               // c_ino
        mode as u64,       // c_mode
        0,                 // c_uid
        0,                 // c_gid
        1,                 // c_nlink
        0,                 // c_mtime
        data.len() as u64, // c_filesize
        0,                 // c_devmajor
        0,                 // c_devminor
        0,                 // c_rdevmajor
        0,                 // c_rdevminor
        name.len() as u64 + 1,
        0, // c_check
    ];
    for field in fields {
        let _ = write!(header, "{field:08x}");
    }
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out.extend_from_slice(data);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}
