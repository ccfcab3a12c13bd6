//! Decoding stored data files into materialized (or stored) files.

use super::{decompress_page, PageHeader, BLCKSZ, PAGE_IS_TRUNCATED, PAGE_STRIDE};
use crate::catalog::backup::{CompressAlg, ProgramVersion};
use crate::utils::{MergeError, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// How a stored data file is decoded into its target
#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Algorithm the source pages were compressed with
    pub compress_alg: CompressAlg,
    /// Shrink the target to this many blocks when it is longer (DELTA semantics)
    pub truncate_blocks: Option<u32>,
    /// Write page headers too: the target is an uncompressed stored file
    pub write_header: bool,
    /// Version of the program that produced the source
    pub version: ProgramVersion,
}

/// Decode `source` page by page into `target`.
///
/// The target is opened without truncation so that pages already present
/// (from an older backup) survive unless overwritten. `source == None` means
/// no bytes were stored for this file; only truncation applies.
pub fn restore_data_file(target: &Path, source: Option<&Path>, options: &RestoreOptions) -> Result<()> {
    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(target)?;

    let stride = if options.write_header {
        PAGE_STRIDE
    } else {
        BLCKSZ as u64
    };

    if let Some(source) = source {
        let mut reader = BufReader::new(File::open(source)?);
        let mut payload = vec![0u8; BLCKSZ];
        let mut blocks = 0u32;

        while let Some(header) = PageHeader::read_from(&mut reader)? {
            if header.compressed_size == PAGE_IS_TRUNCATED {
                let len = header.block as u64 * stride;
                if out.metadata()?.len() > len {
                    out.set_len(len)?;
                }
                debug!(
                    "Truncated \"{}\" at block {} while restoring",
                    target.display(),
                    header.block
                );
                continue;
            }

            let size = usize::try_from(header.compressed_size)
                .ok()
                .filter(|&s| s > 0 && s <= BLCKSZ)
                .ok_or_else(|| {
                    MergeError::Codec(format!(
                        "invalid page size {} of block {} in \"{}\"",
                        header.compressed_size,
                        header.block,
                        source.display()
                    ))
                })?;

            reader.read_exact(&mut payload[..size]).map_err(|e| {
                MergeError::Codec(format!(
                    "cannot read block {} of \"{}\": {}",
                    header.block,
                    source.display(),
                    e
                ))
            })?;

            let page = decode_page(&payload[..size], options)?;

            out.seek(SeekFrom::Start(header.block as u64 * stride))?;
            if options.write_header {
                let stored = PageHeader {
                    block: header.block,
                    compressed_size: BLCKSZ as i32,
                };
                out.write_all(&stored.to_bytes())?;
            }
            out.write_all(&page)?;
            blocks += 1;
        }

        debug!(
            "Restored {} block(s) from \"{}\" into \"{}\"",
            blocks,
            source.display(),
            target.display()
        );
    }

    if let Some(n_blocks) = options.truncate_blocks {
        let len = n_blocks as u64 * stride;
        if out.metadata()?.len() > len {
            out.set_len(len)?;
            debug!("Truncated \"{}\" to {} block(s)", target.display(), n_blocks);
        }
    }

    out.flush()?;
    Ok(())
}

fn decode_page<'a>(payload: &'a [u8], options: &RestoreOptions) -> Result<std::borrow::Cow<'a, [u8]>> {
    use std::borrow::Cow;

    if payload.len() < BLCKSZ {
        return decompress_page(payload, options.compress_alg).map(Cow::Owned);
    }

    // Older versions could store a compressed page that happened to be
    // exactly BLCKSZ long; it is only told apart by trying to decompress.
    if options.compress_alg.is_compressed() && options.version.may_store_raw_sized_compressed_pages() {
        if let Ok(page) = decompress_page(payload, options.compress_alg) {
            return Ok(Cow::Owned(page));
        }
    }

    Ok(Cow::Borrowed(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::backup::{BackupMode, Lsn};
    use crate::codec::{backup_data_file, EncodeOptions};
    use std::fs;
    use tempfile::TempDir;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; BLCKSZ]
    }

    fn materialize(dir: &Path, name: &str, pages: &[Vec<u8>]) -> std::io::Result<std::path::PathBuf> {
        let path = dir.join(name);
        fs::write(&path, pages.concat())?;
        Ok(path)
    }

    fn options(alg: CompressAlg) -> RestoreOptions {
        RestoreOptions {
            compress_alg: alg,
            truncate_blocks: None,
            write_header: false,
            version: ProgramVersion::parse("2.1.0"),
        }
    }

    fn full(alg: CompressAlg) -> EncodeOptions {
        EncodeOptions {
            compress_alg: alg,
            compress_level: 1,
            mode: BackupMode::Full,
            start_lsn: Lsn(0),
        }
    }

    #[test]
    fn test_restore_compressed_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = materialize(temp_dir.path(), "src", &[page(1), page(2), page(3)])?;
        let stored = temp_dir.path().join("stored");
        backup_data_file(&src, &stored, &full(CompressAlg::Zstd))?;

        let out = temp_dir.path().join("out");
        restore_data_file(&out, Some(&stored), &options(CompressAlg::Zstd))?;

        assert_eq!(fs::read(&out)?, fs::read(&src)?);
        Ok(())
    }

    #[test]
    fn test_overlay_keeps_untouched_pages() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let base = materialize(temp_dir.path(), "base", &[page(1), page(2), page(3)])?;

        // Increment carries only block 1
        let stored = temp_dir.path().join("stored");
        let mut buf = PageHeader { block: 1, compressed_size: BLCKSZ as i32 }.to_bytes().to_vec();
        buf.extend_from_slice(&page(9));
        fs::write(&stored, buf)?;

        restore_data_file(&base, Some(&stored), &options(CompressAlg::None))?;
        assert_eq!(fs::read(&base)?, [page(1), page(9), page(3)].concat());
        Ok(())
    }

    #[test]
    fn test_delta_truncation() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let base = materialize(temp_dir.path(), "base", &[page(1), page(2), page(3)])?;

        let opts = RestoreOptions {
            truncate_blocks: Some(1),
            ..options(CompressAlg::None)
        };
        restore_data_file(&base, None, &opts)?;
        assert_eq!(fs::read(&base)?, page(1));

        // Never grows the target
        let opts = RestoreOptions {
            truncate_blocks: Some(5),
            ..options(CompressAlg::None)
        };
        restore_data_file(&base, None, &opts)?;
        assert_eq!(fs::metadata(&base)?.len(), BLCKSZ as u64);
        Ok(())
    }

    #[test]
    fn test_in_place_merge_with_headers() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = materialize(temp_dir.path(), "src", &[page(1), page(2)])?;
        let stored_full = temp_dir.path().join("full");
        backup_data_file(&src, &stored_full, &full(CompressAlg::None))?;

        let changed = materialize(temp_dir.path(), "changed", &[page(1), page(7)])?;
        let stored_incr = temp_dir.path().join("incr");
        backup_data_file(&changed, &stored_incr, &full(CompressAlg::Zstd))?;

        let opts = RestoreOptions {
            write_header: true,
            ..options(CompressAlg::Zstd)
        };
        restore_data_file(&stored_full, Some(&stored_incr), &opts)?;

        // Still a valid uncompressed stored file
        let out = temp_dir.path().join("out");
        restore_data_file(&out, Some(&stored_full), &options(CompressAlg::None))?;
        assert_eq!(fs::read(&out)?, fs::read(&changed)?);
        assert_eq!(fs::metadata(&stored_full)?.len(), 2 * PAGE_STRIDE);
        Ok(())
    }

    #[test]
    fn test_truncation_marker() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let base = materialize(temp_dir.path(), "base", &[page(1), page(2), page(3)])?;
        let stored = temp_dir.path().join("stored");
        fs::write(
            &stored,
            PageHeader { block: 2, compressed_size: PAGE_IS_TRUNCATED }.to_bytes(),
        )?;

        restore_data_file(&base, Some(&stored), &options(CompressAlg::None))?;
        assert_eq!(fs::metadata(&base)?.len(), 2 * BLCKSZ as u64);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_page_size() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stored = temp_dir.path().join("stored");
        fs::write(&stored, PageHeader { block: 0, compressed_size: 9000 }.to_bytes())?;

        let err = restore_data_file(&temp_dir.path().join("out"), Some(&stored), &options(CompressAlg::None));
        assert!(matches!(err, Err(MergeError::Codec(_))));
        Ok(())
    }

    #[test]
    fn test_old_version_raw_sized_compressed_page() -> Result<()> {
        let temp_dir = TempDir::new()?;
        // A payload of exactly BLCKSZ bytes that is really a zstd frame,
        // padded with a skippable frame
        let original = page(5);
        let mut frame = zstd::bulk::compress(&original, 1).map_err(MergeError::Io)?;
        let padding = (BLCKSZ - frame.len() - 8) as u32;
        frame.extend_from_slice(&0x184D_2A50u32.to_le_bytes());
        frame.extend_from_slice(&padding.to_le_bytes());
        frame.resize(BLCKSZ, 0);

        let stored = temp_dir.path().join("stored");
        let mut buf = PageHeader { block: 0, compressed_size: BLCKSZ as i32 }.to_bytes().to_vec();
        buf.extend_from_slice(&frame);
        fs::write(&stored, buf)?;

        let old = RestoreOptions {
            version: ProgramVersion::parse("2.0.21"),
            ..options(CompressAlg::Zstd)
        };
        let out = temp_dir.path().join("old");
        restore_data_file(&out, Some(&stored), &old)?;
        assert_eq!(fs::read(&out)?, original);

        let out = temp_dir.path().join("new");
        restore_data_file(&out, Some(&stored), &options(CompressAlg::Zstd))?;
        assert_eq!(fs::read(&out)?, frame);
        Ok(())
    }
}
