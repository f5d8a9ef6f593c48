//! Random-access reader over the IPSW container.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{Error, Result};

/// Entry names containing one of these markers belong to development
/// (non-release) firmware variants.
const DEVELOPMENT_MARKERS: &[&str] = &["devel", "kasan", "research"];

// =============================================================================
// Entry Metadata
// =============================================================================

/// Metadata for one archive entry, available without decompressing it.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    /// Path-like entry name, as stored in the archive
    pub name: String,
    /// Compressed size in bytes
    pub compressed_size: u64,
    /// Uncompressed size in bytes
    pub size: u64,
    /// Unix mode bits, when the archive recorded them
    pub unix_mode: Option<u32>,
    /// True for explicit directory entries
    pub is_dir: bool,
}

// =============================================================================
// Archive Reader
// =============================================================================

/// An open IPSW container.
///
/// Holds the underlying file handle for its own lifetime; dropping the
/// reader releases it. Entry metadata is indexed eagerly at open time so
/// lookups never touch payload data. Payload access is streaming: an
/// entry reader yields bytes in bounded chunks and can be restarted by
/// reopening the entry (or the whole archive, for use on another thread).
#[derive(Debug)]
pub struct IpswArchive {
    path: PathBuf,
    zip: ZipArchive<File>,
    entries: Vec<EntryInfo>,
    index: HashMap<String, usize>,
}

impl IpswArchive {
    /// Opens an IPSW archive and indexes its entry metadata.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        let mut zip = ZipArchive::new(file).map_err(|e| Error::CorruptArchive {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut entries = Vec::with_capacity(zip.len());
        let mut index = HashMap::with_capacity(zip.len());

        for i in 0..zip.len() {
            // Raw access: central-directory metadata only, no payload decode.
            let entry = zip.by_index_raw(i).map_err(|e| Error::CorruptArchive {
                path: path.clone(),
                reason: format!("entry {i}: {e}"),
            })?;

            let info = EntryInfo {
                name: entry.name().to_string(),
                compressed_size: entry.compressed_size(),
                size: entry.size(),
                unix_mode: entry.unix_mode(),
                is_dir: entry.is_dir(),
            };
            index.insert(info.name.clone(), i);
            entries.push(info);
        }

        Ok(Self {
            path,
            zip,
            entries,
            index,
        })
    }

    /// Reopens the same archive from its path.
    ///
    /// Entry payload readers borrow the archive mutably, so parallel
    /// workers each reopen their own view. The on-disk file is never
    /// written to, so concurrent readers are safe.
    pub fn reopen(&self) -> Result<Self> {
        Self::open(&self.path)
    }

    /// Returns the path this archive was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns metadata for all entries, in archive order.
    pub fn entries(&self) -> &[EntryInfo] {
        &self.entries
    }

    /// Looks up metadata for a single entry by name.
    pub fn entry(&self, name: &str) -> Result<&EntryInfo> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| Error::EntryNotFound {
                name: name.to_string(),
            })
    }

    /// Opens a streaming reader over one entry's payload.
    ///
    /// The returned reader decompresses lazily; callers pull bytes in
    /// chunks and must not assume the payload fits in memory.
    pub fn open_entry(&mut self, name: &str) -> Result<impl Read + '_> {
        let path = self.path.clone();
        self.zip.by_name(name).map_err(move |e| match e {
            ZipError::FileNotFound => Error::EntryNotFound {
                name: name.to_string(),
            },
            other => Error::CorruptArchive {
                path,
                reason: format!("{name}: {other}"),
            },
        })
    }

    /// Reads a whole entry into memory.
    ///
    /// Intended for the small metadata members (manifests, descriptors);
    /// disk images go through [`IpswArchive::open_entry`] instead.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let size = self.entry(name)?.size as usize;
        let mut reader = self.open_entry(name)?;
        let mut buf = Vec::with_capacity(size);
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Finds the build manifest entry: the first root-level
    /// `BuildManifest*.plist` member.
    pub fn find_build_manifest(&self) -> Result<&EntryInfo> {
        self.entries
            .iter()
            .find(|e| {
                !e.name.contains('/')
                    && e.name.starts_with("BuildManifest")
                    && e.name.ends_with(".plist")
            })
            .ok_or_else(|| Error::CorruptArchive {
                path: self.path.clone(),
                reason: "no BuildManifest*.plist entry".to_string(),
            })
    }

    /// Lists entries belonging to development firmware variants.
    pub fn development_entries(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| {
                let lower = e.name.to_ascii_lowercase();
                DEVELOPMENT_MARKERS.iter().any(|m| lower.contains(m))
            })
            .map(|e| e.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn fixture_archive(dir: &Path) -> PathBuf {
        let path = dir.join("fixture.ipsw");
        let file = File::create(&path).unwrap();
        let mut zip = ZipWriter::new(file);
        let opts = SimpleFileOptions::default();

        zip.start_file("BuildManifest.plist", opts).unwrap();
        zip.write_all(b"manifest-bytes").unwrap();
        zip.start_file("Restore.plist", opts).unwrap();
        zip.write_all(b"restore-bytes").unwrap();
        zip.start_file("Firmware/042-11111/os.dmg", opts).unwrap();
        zip.write_all(&vec![0xAB; 4096]).unwrap();
        zip.start_file("kernelcache.research.iphone11", opts)
            .unwrap();
        zip.write_all(b"kc").unwrap();
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_open_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let archive = IpswArchive::open(fixture_archive(dir.path())).unwrap();

        assert_eq!(archive.entries().len(), 4);
        let dmg = archive.entry("Firmware/042-11111/os.dmg").unwrap();
        assert_eq!(dmg.size, 4096);
        assert!(!dmg.is_dir);
    }

    #[test]
    fn test_entry_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let archive = IpswArchive::open(fixture_archive(dir.path())).unwrap();
        assert!(matches!(
            archive.entry("nope.plist"),
            Err(Error::EntryNotFound { .. })
        ));
    }

    #[test]
    fn test_streaming_read_matches() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = IpswArchive::open(fixture_archive(dir.path())).unwrap();

        let mut reader = archive.open_entry("Firmware/042-11111/os.dmg").unwrap();
        let mut total = 0usize;
        let mut chunk = [0u8; 512];
        loop {
            let n = reader.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            assert!(chunk[..n].iter().all(|&b| b == 0xAB));
            total += n;
        }
        assert_eq!(total, 4096);
    }

    #[test]
    fn test_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = IpswArchive::open(fixture_archive(dir.path())).unwrap();
        assert_eq!(archive.read_file("Restore.plist").unwrap(), b"restore-bytes");
    }

    #[test]
    fn test_not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.ipsw");
        std::fs::write(&path, b"not a zip at all").unwrap();
        assert!(matches!(
            IpswArchive::open(&path),
            Err(Error::CorruptArchive { .. })
        ));
    }

    #[test]
    fn test_find_build_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let archive = IpswArchive::open(fixture_archive(dir.path())).unwrap();
        assert_eq!(
            archive.find_build_manifest().unwrap().name,
            "BuildManifest.plist"
        );
    }

    #[test]
    fn test_development_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = IpswArchive::open(fixture_archive(dir.path())).unwrap();
        assert_eq!(
            archive.development_entries(),
            vec!["kernelcache.research.iphone11".to_string()]
        );
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = IpswArchive::open(fixture_archive(dir.path())).unwrap();
        let mut other = archive.reopen().unwrap();
        assert_eq!(
            archive.read_file("Restore.plist").unwrap(),
            other.read_file("Restore.plist").unwrap()
        );
    }
}
