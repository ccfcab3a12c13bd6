//! Encoding materialized data files into their stored representation.

use super::{compress_page, page_lsn, PageHeader, BLCKSZ};
use crate::catalog::backup::{BackupMode, CompressAlg, Lsn};
use crate::utils::Result;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

/// How a materialized file is stored
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub compress_alg: CompressAlg,
    pub compress_level: i32,
    /// FULL stores every page; incremental modes only pages changed since `start_lsn`
    pub mode: BackupMode,
    pub start_lsn: Lsn,
}

/// Result of storing one data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredFile {
    /// Bytes written to the stored file
    pub write_size: u64,
    /// CRC-32 of the stored file
    pub crc: u32,
    /// Blocks in the materialized file
    pub n_blocks: u32,
}

/// Encode `source` page by page into `target`, replacing it.
///
/// A trailing partial block is zero-padded to a full page.
pub fn backup_data_file(source: &Path, target: &Path, options: &EncodeOptions) -> Result<StoredFile> {
    let mut reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(target)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut page = vec![0u8; BLCKSZ];
    let mut block = 0u32;
    let mut write_size = 0u64;
    let mut skipped = 0u32;

    loop {
        let read = read_page(&mut reader, &mut page)?;
        if read == 0 {
            break;
        }
        page[read..].fill(0);

        if options.mode.is_incremental() && page_lsn(&page) < options.start_lsn {
            skipped += 1;
            block += 1;
            continue;
        }

        let compressed = compress_page(&page, options.compress_alg, options.compress_level)?;
        let payload: &[u8] = compressed.as_deref().unwrap_or(&page);
        let header = PageHeader {
            block,
            compressed_size: payload.len() as i32,
        };

        let header_bytes = header.to_bytes();
        writer.write_all(&header_bytes)?;
        writer.write_all(payload)?;
        hasher.update(&header_bytes);
        hasher.update(payload);
        write_size += (header_bytes.len() + payload.len()) as u64;
        block += 1;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;

    debug!(
        "Stored \"{}\": {} block(s), {} unchanged, {} bytes",
        target.display(),
        block,
        skipped,
        write_size
    );

    Ok(StoredFile {
        write_size,
        crc: hasher.finalize(),
        n_blocks: block,
    })
}

/// Fill `page` as far as the input allows; returns the bytes read.
fn read_page<R: Read>(reader: &mut R, page: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < page.len() {
        match reader.read(&mut page[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
