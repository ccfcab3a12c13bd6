//! Block-diff codec for stored data files.
//!
//! A stored data file is a sequence of page records. Each record is an
//! 8-byte [`PageHeader`] (`block: u32 LE`, `compressed_size: i32 LE`)
//! followed by `compressed_size` payload bytes:
//!
//! | `compressed_size`   | payload                                  |
//! |---------------------|------------------------------------------|
//! | `== BLCKSZ`         | raw page                                 |
//! | `0 < n < BLCKSZ`    | page compressed with the file's algorithm |
//! | `PAGE_IS_TRUNCATED` | none; the file ends before `block`       |
//!
//! Uncompressed files are therefore fixed-stride ([`PAGE_STRIDE`] bytes per
//! block), which lets a newer increment be merged into them in place.

pub mod copy;
pub mod encode;
pub mod restore;

pub use copy::{copy_control_file, copy_file, file_crc, file_size, CONTROL_FILE_NAME};
pub use encode::{backup_data_file, EncodeOptions, StoredFile};
pub use restore::{restore_data_file, RestoreOptions};

use crate::catalog::backup::{CompressAlg, Lsn};
use crate::utils::{MergeError, Result};
use std::io::{self, Read};

/// Page size of a data file
pub const BLCKSZ: usize = 8192;

/// Size of an encoded page header
pub const PAGE_HEADER_SIZE: usize = 8;

/// Size of one uncompressed page record
pub const PAGE_STRIDE: u64 = (PAGE_HEADER_SIZE + BLCKSZ) as u64;

/// Header marker: the source file was truncated at this block
pub const PAGE_IS_TRUNCATED: i32 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub block: u32,
    pub compressed_size: i32,
}

impl PageHeader {
    pub fn to_bytes(self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        buf[..4].copy_from_slice(&self.block.to_le_bytes());
        buf[4..].copy_from_slice(&self.compressed_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; PAGE_HEADER_SIZE]) -> Self {
        Self {
            block: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            compressed_size: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Read the next header; `Ok(None)` at a clean end of file.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        let mut filled = 0;
        while filled < PAGE_HEADER_SIZE {
            match reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(MergeError::Codec(format!(
                        "odd size page header: {filled} bytes"
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(Self::from_bytes(&buf)))
    }
}

/// LSN stamped in the first eight bytes of a page (high word first).
pub fn page_lsn(page: &[u8]) -> Lsn {
    if page.len() < 8 {
        return Lsn(0);
    }
    let hi = u32::from_le_bytes([page[0], page[1], page[2], page[3]]) as u64;
    let lo = u32::from_le_bytes([page[4], page[5], page[6], page[7]]) as u64;
    Lsn((hi << 32) | lo)
}

/// Compress one page. `None` when compression would not make it smaller.
pub(crate) fn compress_page(page: &[u8], alg: CompressAlg, level: i32) -> Result<Option<Vec<u8>>> {
    match alg {
        CompressAlg::None => Ok(None),
        CompressAlg::Zstd => {
            let compressed = zstd::bulk::compress(page, level)
                .map_err(|e| MergeError::Codec(format!("zstd compress: {e}")))?;
            Ok((compressed.len() < BLCKSZ).then_some(compressed))
        }
    }
}

/// Decompress one page; the result must be exactly [`BLCKSZ`] bytes.
pub(crate) fn decompress_page(payload: &[u8], alg: CompressAlg) -> Result<Vec<u8>> {
    let page = match alg {
        CompressAlg::None => {
            return Err(MergeError::Codec(format!(
                "page of {} bytes is compressed but no algorithm is recorded",
                payload.len()
            )))
        }
        CompressAlg::Zstd => zstd::bulk::decompress(payload, BLCKSZ)
            .map_err(|e| MergeError::Codec(format!("zstd decompress: {e}")))?,
    };
    if page.len() != BLCKSZ {
        return Err(MergeError::Codec(format!(
            "page decompressed to {} bytes, expected {}",
            page.len(),
            BLCKSZ
        )));
    }
    Ok(page)
}
