//! Device support directory assembly.
//!
//! Debuggers and symbol servers look up extracted firmware trees in a
//! conventional layout keyed by product type, OS version, and build:
//! `<type> <version> (<build>)/Symbols/...` plus a small provenance
//! record. Assembly is idempotent; rebuilding over an existing directory
//! yields identical contents, so interrupted runs can simply be rerun.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use tracing::info;

use crate::error::{Error, Result};
use crate::image::Verification;
use crate::manifest::RestoreInfo;

/// Subdirectory holding the extracted filesystem tree.
pub const SYMBOLS_DIR: &str = "Symbols";
/// Provenance metadata file.
pub const METADATA_FILE: &str = "Info.plist";
/// Marker signalling the directory is complete.
pub const FINALIZED_MARKER: &str = ".finalized";

/// Returns the directory name for a restore descriptor:
/// `<product-type> <product-version> (<build-version>)`.
pub fn support_dir_name(restore: &RestoreInfo) -> Result<String> {
    let product_type = restore
        .supported_product_types
        .first()
        .ok_or_else(|| Error::manifest("restore descriptor lists no supported product types"))?;
    Ok(format!(
        "{} {} ({})",
        product_type, restore.product_version, restore.product_build_version
    ))
}

/// Assembles the device support directory under `output_root`.
///
/// `tree_root` is the extracted filesystem tree; when it is not already
/// the target `Symbols/` directory its contents are copied there.
/// Re-running with identical inputs produces byte-identical output.
pub fn build_device_support(
    tree_root: &Path,
    restore: &RestoreInfo,
    source_archive: &str,
    verification: Verification,
    output_root: &Path,
) -> Result<PathBuf> {
    let target = output_root.join(support_dir_name(restore)?);
    let symbols = target.join(SYMBOLS_DIR);
    fs::create_dir_all(&symbols).map_err(|e| Error::write_failed(&symbols, e))?;

    if tree_root != symbols {
        copy_tree(tree_root, &symbols)?;
    }

    write_metadata(&target, restore, source_archive, verification)?;
    write_plist(&target.join(FINALIZED_MARKER), &Dictionary::new())?;

    info!("device support directory ready: {}", target.display());
    Ok(target)
}

fn write_metadata(
    target: &Path,
    restore: &RestoreInfo,
    source_archive: &str,
    verification: Verification,
) -> Result<()> {
    let mut dict = Dictionary::new();
    if let Some(product_type) = restore.supported_product_types.first() {
        dict.insert("ProductType".into(), Value::String(product_type.clone()));
    }
    dict.insert(
        "ProductVersion".into(),
        Value::String(restore.product_version.clone()),
    );
    dict.insert(
        "ProductBuildVersion".into(),
        Value::String(restore.product_build_version.clone()),
    );
    dict.insert(
        "SourceArchive".into(),
        Value::String(source_archive.to_string()),
    );
    dict.insert(
        "Verified".into(),
        Value::Boolean(verification == Verification::Verified),
    );
    write_plist(&target.join(METADATA_FILE), &dict)
}

fn write_plist(path: &Path, dict: &Dictionary) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::write_failed(path, e))?;
    Value::Dictionary(dict.clone())
        .to_writer_xml(file)
        .map_err(|e| Error::write_failed(path, io::Error::other(e.to_string())))
}

/// Recursively copies `src` into `dst`, preserving symlinks and
/// overwriting existing files.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| Error::write_failed(dst, e))?;

    for entry in fs::read_dir(src).map_err(|e| Error::FileOpen {
        path: src.to_path_buf(),
        source: e,
    })? {
        let entry = entry.map_err(|e| Error::FileOpen {
            path: src.to_path_buf(),
            source: e,
        })?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| Error::FileOpen {
            path: from.clone(),
            source: e,
        })?;

        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(&from).map_err(|e| Error::FileOpen {
                path: from.clone(),
                source: e,
            })?;
            match fs::remove_file(&to) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::write_failed(&to, e)),
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link_target, &to)
                .map_err(|e| Error::write_failed(&to, e))?;
            #[cfg(not(unix))]
            let _ = link_target;
        } else {
            fs::copy(&from, &to).map_err(|e| Error::write_failed(&to, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    fn restore_info() -> RestoreInfo {
        RestoreInfo {
            product_version: "16.0".into(),
            product_build_version: "20A362".into(),
            supported_product_types: vec!["iPhone15,2".into()],
        }
    }

    /// Snapshot of a directory: relative path to file bytes.
    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Vec<u8>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    let rel = path.strip_prefix(root).unwrap().to_path_buf();
                    out.insert(rel, fs::read(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    fn seed_tree(root: &Path) {
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::write(root.join("usr/lib/libc.dylib"), b"libc").unwrap();
        fs::write(root.join("release.txt"), b"20A362").unwrap();
    }

    #[test]
    fn test_dir_name() {
        assert_eq!(
            support_dir_name(&restore_info()).unwrap(),
            "iPhone15,2 16.0 (20A362)"
        );
    }

    #[test]
    fn test_dir_name_requires_product_type() {
        let mut restore = restore_info();
        restore.supported_product_types.clear();
        assert!(matches!(
            support_dir_name(&restore),
            Err(Error::MalformedManifest { .. })
        ));
    }

    #[test]
    fn test_build_copies_tree_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        seed_tree(&tree);

        let target = build_device_support(
            &tree,
            &restore_info(),
            "iPhone15,2_16.0_20A362_Restore.ipsw",
            Verification::Verified,
            dir.path(),
        )
        .unwrap();

        assert_eq!(target, dir.path().join("iPhone15,2 16.0 (20A362)"));
        assert_eq!(
            fs::read(target.join("Symbols/usr/lib/libc.dylib")).unwrap(),
            b"libc"
        );
        assert!(target.join(FINALIZED_MARKER).exists());

        let metadata = Value::from_file(target.join(METADATA_FILE))
            .unwrap()
            .into_dictionary()
            .unwrap();
        assert_eq!(
            metadata.get("ProductBuildVersion").unwrap().as_string(),
            Some("20A362")
        );
        assert_eq!(
            metadata.get("SourceArchive").unwrap().as_string(),
            Some("iPhone15,2_16.0_20A362_Restore.ipsw")
        );
        assert_eq!(metadata.get("Verified").unwrap().as_boolean(), Some(true));
    }

    #[test]
    fn test_build_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        seed_tree(&tree);

        let target = build_device_support(
            &tree,
            &restore_info(),
            "a.ipsw",
            Verification::Unverified,
            dir.path(),
        )
        .unwrap();
        let first = snapshot(&target);

        let target2 = build_device_support(
            &tree,
            &restore_info(),
            "a.ipsw",
            Verification::Unverified,
            dir.path(),
        )
        .unwrap();
        assert_eq!(target, target2);
        assert_eq!(first, snapshot(&target2));
    }

    #[test]
    fn test_tree_already_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("iPhone15,2 16.0 (20A362)");
        let symbols = target.join(SYMBOLS_DIR);
        seed_tree(&symbols);

        let built = build_device_support(
            &symbols,
            &restore_info(),
            "a.ipsw",
            Verification::Verified,
            dir.path(),
        )
        .unwrap();
        assert_eq!(built, target);
        assert_eq!(fs::read(symbols.join("release.txt")).unwrap(), b"20A362");
    }
}
