//! Shared library cache discovery and splitting.
//!
//! Modern firmware ships the system library cache split across several
//! files: a main cache (`dyld_shared_cache_<arch>`) plus numbered
//! segment files (`.01`, `.02`, ...) and an optional `.symbols` file.
//! After extraction the cache can be split back into per-image trees,
//! but that reconstruction lives in an external tool. It is modeled
//! here as an injected [`SharedCacheSplitter`] capability: when none is
//! configured the segments stay as extracted, which is degraded output,
//! not a failure.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;

use memmap2::Mmap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Magic prefix shared by all cache files.
pub const CACHE_MAGIC_PREFIX: &[u8; 4] = b"dyld";

/// Directories (relative to the extracted root) that may hold caches.
pub const SHARED_CACHE_DIRS: &[&str] = &[
    "System/Library/Caches/com.apple.dyld",
    "private/preboot/Cryptexes/OS/System/Library/Caches/com.apple.dyld",
];

const CACHE_FILE_PREFIX: &str = "dyld_shared_cache_";

// =============================================================================
// Discovered Caches
// =============================================================================

/// One shared cache found in an extracted tree.
#[derive(Debug, Clone)]
pub struct SharedCache {
    /// Path to the main cache file
    pub path: PathBuf,
    /// Architecture suffix, e.g. "arm64e"
    pub arch: String,
    /// Segment files (`.01`, `.02`, ..., `.symbols`), sorted
    pub segments: Vec<PathBuf>,
}

impl SharedCache {
    /// Returns true when the cache is spread over segment files.
    pub fn is_multi_segment(&self) -> bool {
        !self.segments.is_empty()
    }
}

/// Scans the known cache directories under `root`.
///
/// Files carrying the cache name pattern but not the cache magic are
/// skipped with a warning rather than treated as caches.
pub fn discover_caches(root: &Path) -> Result<Vec<SharedCache>> {
    let mut caches = Vec::new();

    for dir in SHARED_CACHE_DIRS {
        let dir = root.join(dir);
        if !dir.is_dir() {
            continue;
        }

        for entry in fs::read_dir(&dir).map_err(|e| Error::FileOpen {
            path: dir.clone(),
            source: e,
        })? {
            let entry = entry.map_err(|e| Error::FileOpen {
                path: dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };

            // Main caches only; segment files have a dotted suffix.
            let Some(arch) = name.strip_prefix(CACHE_FILE_PREFIX) else {
                continue;
            };
            if arch.contains('.') || arch.is_empty() {
                continue;
            }

            if !has_cache_magic(&path) {
                warn!("'{}' lacks the cache magic, skipping", path.display());
                continue;
            }

            let arch = arch.to_string();
            let segments = collect_segments(&dir, name)?;
            debug!(
                "found shared cache {} with {} segment file(s)",
                path.display(),
                segments.len()
            );
            caches.push(SharedCache {
                path,
                arch,
                segments,
            });
        }
    }

    caches.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(caches)
}

fn collect_segments(dir: &Path, main_name: &str) -> Result<Vec<PathBuf>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::FileOpen {
        path: dir.to_path_buf(),
        source: e,
    })? {
        let entry = entry.map_err(|e| Error::FileOpen {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        match name.strip_prefix(main_name) {
            Some(suffix) if suffix.starts_with('.') && suffix.len() > 1 => segments.push(path),
            _ => {}
        }
    }
    segments.sort();
    Ok(segments)
}

/// Checks the cache magic without reading the file into memory.
fn has_cache_magic(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    // Safety: the mapping is read-only and dropped before returning.
    let Ok(map) = (unsafe { Mmap::map(&file) }) else {
        return false;
    };
    map.len() >= CACHE_MAGIC_PREFIX.len() && &map[..CACHE_MAGIC_PREFIX.len()] == CACHE_MAGIC_PREFIX
}

// =============================================================================
// Splitter Capability
// =============================================================================

/// Reconstitutes per-image trees from a shared cache.
///
/// Injected by the caller; the pipeline never requires an implementation
/// to exist.
pub trait SharedCacheSplitter {
    /// Splits `cache` (with its sibling segment files) into per-image
    /// output under `output_root`.
    fn split(&self, cache: &Path, output_root: &Path) -> Result<()>;
}

/// Splitter backed by an external tool invocation
/// (`<program> dyld split <cache> -o <output>`).
#[derive(Debug, Clone)]
pub struct SplitterTool {
    program: PathBuf,
}

impl SplitterTool {
    /// Creates a splitter invoking the given program.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl SharedCacheSplitter for SplitterTool {
    fn split(&self, cache: &Path, output_root: &Path) -> Result<()> {
        info!("splitting shared cache: {}", cache.display());
        let status = Command::new(&self.program)
            .arg("dyld")
            .arg("split")
            .arg(cache)
            .arg("-o")
            .arg(output_root)
            .status()
            .map_err(|e| {
                Error::Io(std::io::Error::other(format!(
                    "failed to run splitter '{}': {e}",
                    self.program.display()
                )))
            })?;
        if !status.success() {
            return Err(Error::Io(std::io::Error::other(format!(
                "splitter '{}' exited with {status}",
                self.program.display()
            ))));
        }
        Ok(())
    }
}
