//! Block-compressed filesystem image container.
//!
//! The container is a fixed header, a table of per-block compressed
//! lengths, and that many concatenated zlib streams. Each block inflates
//! to exactly `block_size` bytes except the last, which carries the
//! remainder. Decoding is streaming: one compressed block and one
//! inflated block are resident at a time, regardless of image size.

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Magic identifying a block-compressed image.
pub const BLOCK_IMAGE_MAGIC: [u8; 4] = *b"BLKZ";
/// The only container version this decoder understands.
pub const BLOCK_IMAGE_VERSION: u32 = 1;
/// Largest accepted uncompressed block size.
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Header
// =============================================================================

/// On-disk header of a block-compressed image.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BlockImageHeader {
    /// Magic identifier, "BLKZ"
    pub magic: [u8; 4],
    /// Container version
    pub version: u32,
    /// Uncompressed size of every block but the last
    pub block_size: u32,
    /// Number of compressed blocks that follow the length table
    pub block_count: u32,
    /// Total uncompressed image size
    pub uncompressed_size: u64,
}

impl BlockImageHeader {
    /// Size of the header on disk.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

// =============================================================================
// Streaming Decoder
// =============================================================================

/// Streaming reader yielding the inflated image bytes.
pub struct BlockImageReader<R: Read> {
    inner: R,
    lengths: Vec<u32>,
    block_size: usize,
    uncompressed_size: u64,
    next_block: usize,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: Read> BlockImageReader<R> {
    /// Parses the header and length table, leaving `inner` positioned at
    /// the first compressed block.
    pub fn new(mut inner: R, entry: &str) -> Result<Self> {
        let mut raw = [0u8; BlockImageHeader::SIZE];
        inner
            .read_exact(&mut raw)
            .map_err(|e| Error::decode(entry, format!("short block image header: {e}")))?;
        let header = BlockImageHeader::read_from_bytes(&raw)
            .map_err(|_| Error::decode(entry, "unreadable block image header"))?;

        if header.magic != BLOCK_IMAGE_MAGIC {
            return Err(Error::unsupported(
                entry,
                format!("bad block image magic {:02x?}", header.magic),
            ));
        }
        if header.version != BLOCK_IMAGE_VERSION {
            return Err(Error::unsupported(
                entry,
                format!("unsupported block image version {}", header.version),
            ));
        }
        if header.block_size == 0 || header.block_size > MAX_BLOCK_SIZE {
            return Err(Error::decode(
                entry,
                format!("implausible block size {}", header.block_size),
            ));
        }
        let expected_blocks = header.uncompressed_size.div_ceil(header.block_size as u64);
        if header.block_count as u64 != expected_blocks {
            return Err(Error::decode(
                entry,
                format!(
                    "block count {} does not cover {} bytes at block size {}",
                    header.block_count, header.uncompressed_size, header.block_size
                ),
            ));
        }

        let mut lengths = Vec::with_capacity(header.block_count as usize);
        for i in 0..header.block_count {
            let len = inner
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::decode(entry, format!("short block table: {e}")))?;
            // zlib never expands a block anywhere near 2x
            if len as u64 > header.block_size as u64 * 2 + 64 {
                return Err(Error::decode(
                    entry,
                    format!("implausible compressed length {len} for block {i}"),
                ));
            }
            lengths.push(len);
        }

        Ok(Self {
            inner,
            lengths,
            block_size: header.block_size as usize,
            uncompressed_size: header.uncompressed_size,
            next_block: 0,
            buf: Vec::new(),
            pos: 0,
        })
    }

    /// Total uncompressed size the header declares.
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    fn fill_block(&mut self) -> io::Result<()> {
        let idx = self.next_block;
        let consumed = idx as u64 * self.block_size as u64;
        let expected = (self.uncompressed_size - consumed).min(self.block_size as u64);

        let mut compressed = vec![0u8; self.lengths[idx] as usize];
        self.inner.read_exact(&mut compressed)?;

        self.buf.clear();
        let decoder = ZlibDecoder::new(&compressed[..]);
        // Bounded: a forged stream cannot inflate past the block size.
        decoder
            .take(self.block_size as u64 + 1)
            .read_to_end(&mut self.buf)?;
        if self.buf.len() as u64 != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "block {idx} inflated to {} bytes, expected {expected}",
                    self.buf.len()
                ),
            ));
        }

        self.next_block += 1;
        self.pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for BlockImageReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos == self.buf.len() {
            if self.next_block == self.lengths.len() {
                return Ok(0);
            }
            self.fill_block()?;
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) fn encode_block_image(data: &[u8], block_size: u32) -> Vec<u8> {
    use std::io::Write;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let blocks: Vec<&[u8]> = if data.is_empty() {
        Vec::new()
    } else {
        data.chunks(block_size as usize).collect()
    };

    let header = BlockImageHeader {
        magic: BLOCK_IMAGE_MAGIC,
        version: BLOCK_IMAGE_VERSION,
        block_size,
        block_count: blocks.len() as u32,
        uncompressed_size: data.len() as u64,
    };

    let compressed: Vec<Vec<u8>> = blocks
        .iter()
        .map(|block| {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(block).unwrap();
            encoder.finish().unwrap()
        })
        .collect();

    let mut out = header.as_bytes().to_vec();
    for block in &compressed {
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
    }
    for block in compressed {
        out.extend(block);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(encoded: &[u8]) -> Result<Vec<u8>> {
        let mut reader = BlockImageReader::new(encoded, "test.img")?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).map_err(Error::Io)?;
        Ok(out)
    }

    #[test]
    fn test_round_trip() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        // Block-aligned and ragged-tail sizes, plus a single short block.
        for block_size in [4096u32, 1000, 100_000, 200_000] {
            let encoded = encode_block_image(&data, block_size);
            assert_eq!(decode_all(&encoded).unwrap(), data);
        }
    }

    #[test]
    fn test_empty_image() {
        let encoded = encode_block_image(&[], 4096);
        assert_eq!(decode_all(&encoded).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_bad_magic() {
        let mut encoded = encode_block_image(b"hello", 4096);
        encoded[0] = b'X';
        assert!(matches!(
            BlockImageReader::new(&encoded[..], "test.img"),
            Err(Error::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut encoded = encode_block_image(b"hello", 4096);
        encoded[4] = 9;
        assert!(matches!(
            BlockImageReader::new(&encoded[..], "test.img"),
            Err(Error::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let encoded = encode_block_image(b"some image payload", 4096);
        let truncated = &encoded[..encoded.len() - 4];
        let err = decode_all(truncated).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_block_count_mismatch() {
        let mut encoded = encode_block_image(&vec![7u8; 10_000], 4096);
        // Claim one block fewer than the declared size needs.
        encoded[12..16].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            BlockImageReader::new(&encoded[..], "test.img"),
            Err(Error::DecodeFailure { .. })
        ));
    }

    #[test]
    fn test_corrupt_block_payload() {
        let mut encoded = encode_block_image(&vec![42u8; 20_000], 4096);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(decode_all(&encoded).is_err());
    }
}
