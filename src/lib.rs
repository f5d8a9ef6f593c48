//! ipswx - IPSW firmware archive inspection and filesystem extraction.
//!
//! This library opens IPSW firmware bundles, resolves the build identity
//! for a requested device/board pair, and streams the referenced root
//! filesystem image into a plain directory tree usable by downstream
//! tooling (debuggers, symbol servers, research tools). No OS-level
//! mounting is involved; images are transcoded in bounded-memory chunks.
//!
//! # Features
//!
//! - Random-access container metadata without payload decompression
//! - Typed manifest and restore descriptor parsing
//! - Case-insensitive device/board identity selection (never guesses)
//! - Raw, block-compressed, and encrypted image containers
//! - Stored-payload digest verification
//! - Device support directory assembly for symbolication tooling
//! - Optional shared-cache splitting through an injected capability
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use ipswx::{extract_filesystem, ExtractOptions, Ipsw};
//!
//! fn main() -> ipswx::Result<()> {
//!     let mut ipsw = Ipsw::open("iPhone15,2_16.0_20A362_Restore.ipsw")?;
//!     println!("{}", ipsw.summary());
//!
//!     let options = ExtractOptions::default();
//!     let report = extract_filesystem(&mut ipsw, Path::new("rootfs"), &options)?;
//!     println!("wrote {} files", report.stats.files);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod archive;
pub mod dsc;
pub mod error;
pub mod image;
pub mod manifest;
pub mod report;
pub mod support;
pub mod util;

// Re-export main types
pub use archive::{EntryInfo, IpswArchive};
pub use error::{Error, Result};
pub use image::{
    extract_image, locate_root_filesystem, ExtractedImage, FilesystemImageRef, ImageFormat,
    TreeStats, Verification,
};
pub use manifest::{resolve, BuildIdentity, BuildManifest, RestoreInfo};
pub use report::{summarize, IdentitySummary, IpswSummary};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{info, warn};

use dsc::SharedCacheSplitter;
use image::{locate_component_image, APP_CRYPTEX_COMPONENT, SYSTEM_CRYPTEX_COMPONENT};
use manifest::RESTORE_ENTRY;

/// Cryptex images land under this subtree of the output root.
const CRYPTEX_SUBDIR: &str = "private/preboot/Cryptexes";

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation handle.
///
/// Checked between chunk boundaries; cancelling mid-extraction leaves
/// partial output in place and surfaces [`Error::Cancelled`], never a
/// silent success.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// IPSW Context
// =============================================================================

/// An opened IPSW: the archive plus its parsed metadata.
#[derive(Debug)]
pub struct Ipsw {
    /// The underlying container
    pub archive: IpswArchive,
    /// Parsed build manifest
    pub manifest: BuildManifest,
    /// Parsed restore descriptor
    pub restore: RestoreInfo,
}

impl Ipsw {
    /// Opens an IPSW and parses its manifest and restore descriptor.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut archive = IpswArchive::open(path)?;
        let manifest_name = archive.find_build_manifest()?.name.clone();
        let manifest = BuildManifest::parse(&archive.read_file(&manifest_name)?)?;
        let restore = RestoreInfo::parse(&archive.read_file(RESTORE_ENTRY)?)?;
        Ok(Self {
            archive,
            manifest,
            restore,
        })
    }

    /// Builds the metadata summary without extracting anything.
    pub fn summary(&self) -> IpswSummary {
        summarize(&self.manifest, &self.restore)
    }
}

// =============================================================================
// Extraction Pipeline
// =============================================================================

/// Options for filesystem extraction.
pub struct ExtractOptions {
    /// Device class selector (case-insensitive exact match)
    pub device_class: Option<String>,
    /// Board config selector (case-insensitive exact match)
    pub board_config: Option<String>,
    /// Verify declared stored-payload digests
    pub verify: bool,
    /// Cancellation handle shared with the caller
    pub cancel: CancelToken,
    /// Shared-cache splitter capability; segments stay unmerged without one
    pub splitter: Option<Box<dyn SharedCacheSplitter + Send + Sync>>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            device_class: None,
            board_config: None,
            verify: true,
            cancel: CancelToken::new(),
            splitter: None,
        }
    }
}

/// Outcome of one filesystem extraction.
#[derive(Debug, Clone)]
pub struct ExtractReport {
    /// The output root the tree was materialized under
    pub root: PathBuf,
    /// Aggregated counters across all extracted images
    pub stats: TreeStats,
    /// [`Verification::Verified`] only if every extracted image was
    /// digest-checked successfully
    pub verification: Verification,
    /// Shared caches left unmerged (no splitter, or splitting failed)
    pub unsplit_caches: Vec<PathBuf>,
}

/// Extracts the selected identity's filesystem into `output_root`.
///
/// Runs the full pipeline: identity resolution, root filesystem
/// extraction, cryptex extraction (in parallel, each worker on its own
/// reopened archive view), and the shared-cache pass. On failure the
/// partially written tree is left in place for the caller to inspect or
/// discard.
pub fn extract_filesystem(
    ipsw: &mut Ipsw,
    output_root: &Path,
    options: &ExtractOptions,
) -> Result<ExtractReport> {
    let identity = manifest::resolve(
        &ipsw.manifest,
        options.device_class.as_deref(),
        options.board_config.as_deref(),
    )?;
    info!(
        "extracting {} / {} into {}",
        identity.device_class,
        identity.board_config,
        output_root.display()
    );

    let os_image = image::locate_root_filesystem(identity)?;
    let os = image::extract_image(
        &mut ipsw.archive,
        &os_image,
        output_root,
        options.verify,
        &options.cancel,
    )?;

    let mut stats = os.stats.clone();
    let mut all_verified = os.verification == Verification::Verified;

    // Cryptex images are independent entries writing to disjoint
    // subtrees, so they extract on parallel workers.
    let cryptexes: Vec<(&str, &str)> = [
        (SYSTEM_CRYPTEX_COMPONENT, "OS"),
        (APP_CRYPTEX_COMPONENT, "App"),
    ]
    .into_iter()
    .filter(|(component, _)| identity.has_component(component))
    .collect();

    let archive = &ipsw.archive;
    let extracted: Result<Vec<ExtractedImage>> = cryptexes
        .par_iter()
        .map(|&(component, subdir)| {
            let cryptex_image = locate_component_image(identity, component)?;
            let mut worker_archive = archive.reopen()?;
            let target = output_root.join(CRYPTEX_SUBDIR).join(subdir);
            image::extract_image(
                &mut worker_archive,
                &cryptex_image,
                &target,
                options.verify,
                &options.cancel,
            )
        })
        .collect();
    for cryptex in extracted? {
        stats.absorb(&cryptex.stats);
        all_verified &= cryptex.verification == Verification::Verified;
    }

    let unsplit_caches = split_shared_caches(output_root, options)?;

    Ok(ExtractReport {
        root: output_root.to_path_buf(),
        stats,
        verification: if all_verified {
            Verification::Verified
        } else {
            Verification::Unverified
        },
        unsplit_caches,
    })
}

/// Runs the shared-cache pass; returns the caches left unmerged.
fn split_shared_caches(output_root: &Path, options: &ExtractOptions) -> Result<Vec<PathBuf>> {
    let mut unsplit = Vec::new();
    for cache in dsc::discover_caches(output_root)? {
        match &options.splitter {
            Some(splitter) => {
                if let Err(e) = splitter.split(&cache.path, output_root) {
                    warn!(
                        "splitting {} failed: {e}; segments left unmerged",
                        cache.path.display()
                    );
                    unsplit.push(cache.path);
                }
            }
            None => {
                info!(
                    "no shared cache splitter configured; leaving {} unmerged ({} segment file(s))",
                    cache.path.display(),
                    cache.segments.len()
                );
                unsplit.push(cache.path);
            }
        }
    }
    Ok(unsplit)
}

// =============================================================================
// Device Support
// =============================================================================

/// Extracts the selected identity and assembles the device support
/// directory under `output_root`.
///
/// Returns the path of the created directory, named
/// `<product-type> <product-version> (<build-version>)`.
pub fn create_device_support(
    ipsw: &mut Ipsw,
    output_root: &Path,
    options: &ExtractOptions,
) -> Result<PathBuf> {
    let name = support::support_dir_name(&ipsw.restore)?;
    let symbols = output_root.join(&name).join(support::SYMBOLS_DIR);

    let report = extract_filesystem(ipsw, &symbols, options)?;

    if options.splitter.is_some() {
        cleanup_split_cryptex_caches(&symbols, &report);
    }

    let source = ipsw
        .archive
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    support::build_device_support(
        &symbols,
        &ipsw.restore,
        &source,
        report.verification,
        output_root,
    )
}

/// Removes raw cryptex cache files once they were split into per-image
/// trees; skipped entirely while any cache in that directory is still
/// unmerged.
fn cleanup_split_cryptex_caches(root: &Path, report: &ExtractReport) {
    let dir = root.join(dsc::SHARED_CACHE_DIRS[1]);
    if report
        .unsplit_caches
        .iter()
        .any(|cache| cache.starts_with(&dir))
    {
        return;
    }
    let Ok(entries) = fs::read_dir(&dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("failed to remove split cache file {}: {e}", path.display());
            }
        }
    }
}
