//! Streaming disk image extraction.
//!
//! The extractor pulls an archive entry through a SHA-256 hashing reader
//! and the format-specific transcoders into the tree materializer, in
//! bounded chunks end to end. The hash covers the stored payload, so a
//! declared digest catches any corruption of the packaged image even
//! when the decoder happens to survive it.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::archive::IpswArchive;
use crate::error::{Error, Result};
use crate::image::{tree, BlockImageReader, FilesystemImageRef, ImageFormat, TreeStats};
use crate::manifest::EncryptionKeys;
use crate::util::to_hex;
use crate::CancelToken;

/// Magic identifying an encrypted image container.
pub const ENCRYPTED_MAGIC: [u8; 4] = *b"AEA1";

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

// =============================================================================
// Extraction Result
// =============================================================================

/// Digest verdict for one extracted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The stored payload matched its declared digest
    Verified,
    /// No digest was declared, or verification was disabled
    Unverified,
}

/// Outcome of extracting one image into the output tree.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    /// Counters for the materialized tree
    pub stats: TreeStats,
    /// Whether the stored payload was digest-checked
    pub verification: Verification,
}

// =============================================================================
// Extractor
// =============================================================================

/// Extracts one filesystem image entry into `output_root`.
///
/// On failure the partially written tree is left in place; large
/// extractions are expensive to restart, so cleanup is the caller's
/// decision. With `verify` unset, declared digests are ignored and the
/// result is always [`Verification::Unverified`].
pub fn extract_image(
    archive: &mut IpswArchive,
    image: &FilesystemImageRef,
    output_root: &Path,
    verify: bool,
    cancel: &CancelToken,
) -> Result<ExtractedImage> {
    let entry = image.entry_path.as_str();
    fs::create_dir_all(output_root).map_err(|e| Error::write_failed(output_root, e))?;

    debug!(
        "extracting '{entry}' ({:?}) into {}",
        image.format,
        output_root.display()
    );

    let reader = archive.open_entry(entry)?;
    let mut hashing = HashingReader::new(reader);
    let result = decode_into_tree(&mut hashing, image, output_root, cancel);

    let expected = match &image.digest {
        Some(digest) if verify => {
            if digest.len() != 32 {
                warn!(
                    "'{entry}': unsupported digest length {}, leaving unverified",
                    digest.len()
                );
                None
            } else {
                Some(digest.as_slice())
            }
        }
        _ => None,
    };

    let Some(expected) = expected else {
        return result.map(|stats| ExtractedImage {
            stats,
            verification: Verification::Unverified,
        });
    };

    match result {
        Ok(stats) => {
            // Drain past the trailer so the hash covers the whole payload.
            let actual = hashing
                .finalize()
                .map_err(|e| Error::decode(entry, format!("draining payload: {e}")))?;
            if actual[..] != expected[..] {
                return Err(Error::ChecksumMismatch {
                    entry: entry.to_string(),
                    expected: to_hex(expected),
                    actual: to_hex(&actual),
                });
            }
            Ok(ExtractedImage {
                stats,
                verification: Verification::Verified,
            })
        }
        Err(e) if e.is_decode_class() => {
            // A failing digest explains the decode error better than the
            // decoder's own message does.
            match hashing.finalize() {
                Ok(actual) if actual[..] != expected[..] => Err(Error::ChecksumMismatch {
                    entry: entry.to_string(),
                    expected: to_hex(expected),
                    actual: to_hex(&actual),
                }),
                _ => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

fn decode_into_tree<R: Read>(
    reader: &mut R,
    image: &FilesystemImageRef,
    output_root: &Path,
    cancel: &CancelToken,
) -> Result<TreeStats> {
    let entry = image.entry_path.as_str();
    match image.format {
        ImageFormat::Raw => tree::materialize(reader, entry, output_root, cancel),
        ImageFormat::BlockCompressed => {
            let mut inflated = BlockImageReader::new(reader, entry)?;
            tree::materialize(&mut inflated, entry, output_root, cancel)
        }
        ImageFormat::EncryptedContainer => {
            let keys = image
                .encryption
                .as_ref()
                .ok_or_else(|| Error::unsupported(entry, "encrypted container without keys"))?;

            let mut magic = [0u8; 4];
            reader
                .read_exact(&mut magic)
                .map_err(|e| Error::decode(entry, format!("short encrypted container: {e}")))?;
            if magic != ENCRYPTED_MAGIC {
                return Err(Error::unsupported(
                    entry,
                    format!("expected encrypted container magic, found {magic:02x?}"),
                ));
            }

            let mut decrypted = DecryptReader::new(reader, keys);

            // The container wraps either packaging; sniff the inner magic.
            let mut head = [0u8; 6];
            decrypted
                .read_exact(&mut head)
                .map_err(|e| Error::decode(entry, format!("short encrypted payload: {e}")))?;
            let mut chained = io::Cursor::new(head).chain(decrypted);

            if head[..4] == crate::image::BLOCK_IMAGE_MAGIC {
                let mut inflated = BlockImageReader::new(chained, entry)?;
                tree::materialize(&mut inflated, entry, output_root, cancel)
            } else if tree::has_tree_magic(&head) {
                tree::materialize(&mut chained, entry, output_root, cancel)
            } else {
                Err(Error::unsupported(
                    entry,
                    format!("unrecognized inner container magic {head:02x?} (wrong key?)"),
                ))
            }
        }
    }
}

// =============================================================================
// Hashing Reader
// =============================================================================

/// Pass-through reader hashing every byte it yields.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Drains the remaining payload and returns the digest of everything
    /// that passed through.
    fn finalize(mut self) -> io::Result<[u8; 32]> {
        let mut buf = [0u8; 8192];
        loop {
            let n = self.inner.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buf[..n]);
        }
        Ok(self.hasher.finalize().into())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

// =============================================================================
// Decrypting Reader
// =============================================================================

/// Pass-through reader applying the AES-256-CTR keystream.
struct DecryptReader<R> {
    inner: R,
    cipher: Aes256Ctr,
}

impl<R: Read> DecryptReader<R> {
    fn new(inner: R, keys: &EncryptionKeys) -> Self {
        Self {
            inner,
            cipher: Aes256Ctr::new(&keys.key.into(), &keys.iv.into()),
        }
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}
