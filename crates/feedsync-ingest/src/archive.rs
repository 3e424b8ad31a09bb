//! Archive decoding
//!
//! Turns downloaded archive bytes into one text record per file entry.

use std::io::{Cursor, Read};
use tracing::{debug, warn};

use crate::error::{ArchiveError, RecordDecodeError};

/// Converts a downloaded payload into records.
///
/// Decoding is CPU-bound and runs on the blocking pool.
pub trait ArchiveDecoder: Send + Sync {
    fn decode(&self, key: &str, data: &[u8]) -> Result<Vec<String>, ArchiveError>;
}

/// Zip archives holding one UTF-8 document per entry
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipDecoder;

impl ZipDecoder {
    fn read_entry(
        archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
        index: usize,
    ) -> Result<Option<String>, RecordDecodeError> {
        let mut file = archive.by_index(index).map_err(|e| RecordDecodeError {
            entry: format!("#{}", index),
            reason: e.to_string(),
        })?;

        if file.is_dir() {
            return Ok(None);
        }

        // The declared size comes from the archive itself and is not trusted
        let name = file.name().to_string();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| RecordDecodeError {
                entry: name.clone(),
                reason: e.to_string(),
            })?;

        if contents.contains(&0) {
            return Err(RecordDecodeError {
                entry: name,
                reason: "record contains a NUL byte".to_string(),
            });
        }

        String::from_utf8(contents)
            .map(Some)
            .map_err(|e| RecordDecodeError {
                entry: name,
                reason: e.to_string(),
            })
    }
}

impl ArchiveDecoder for ZipDecoder {
    fn decode(&self, key: &str, data: &[u8]) -> Result<Vec<String>, ArchiveError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
        let mut records = Vec::with_capacity(archive.len());

        for index in 0..archive.len() {
            match Self::read_entry(&mut archive, index) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(archive = %key, error = %e, "Skipping archive entry"),
            }
        }

        debug!(archive = %key, records = records.len(), "Decoded archive");
        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.add_directory("nested/", options).unwrap();
        for (name, body) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_decode_keeps_entry_order_and_skips_directories() {
        let data = build_zip(&[
            ("first.xml", b"<doc>1</doc>"),
            ("nested/second.xml", b"<doc>2</doc>"),
        ]);

        let records = ZipDecoder.decode("a.zip", &data).unwrap();
        assert_eq!(records, vec!["<doc>1</doc>", "<doc>2</doc>"]);
    }

    #[test]
    fn test_decode_skips_non_utf8_entries() {
        let data = build_zip(&[
            ("good.xml", b"<doc/>"),
            ("bad.bin", &[0xff, 0xfe, 0x00]),
            ("also-good.xml", b"<doc>ok</doc>"),
        ]);

        let records = ZipDecoder.decode("a.zip", &data).unwrap();
        assert_eq!(records, vec!["<doc/>", "<doc>ok</doc>"]);
    }

    #[test]
    fn test_decode_skips_entries_with_nul_bytes() {
        let data = build_zip(&[("nul.xml", b"<doc>a\0b</doc>"), ("ok.xml", b"<doc/>")]);

        let records = ZipDecoder.decode("a.zip", &data).unwrap();
        assert_eq!(records, vec!["<doc/>"]);
    }

    /// Rewrites every recorded uncompressed size of the only entry in `data`.
    fn forge_uncompressed_size(data: &mut [u8], size: u64) {
        let u16_at = |d: &[u8], at: usize| u16::from_le_bytes([d[at], d[at + 1]]) as usize;

        let mut at = 0;
        while at + 4 <= data.len() {
            let (size_field, extra_len, extra_start) = match &data[at..at + 4] {
                // local file header
                [0x50, 0x4b, 0x03, 0x04] => {
                    (at + 22, u16_at(data, at + 28), at + 30 + u16_at(data, at + 26))
                },
                // central directory header
                [0x50, 0x4b, 0x01, 0x02] => {
                    (at + 24, u16_at(data, at + 30), at + 46 + u16_at(data, at + 28))
                },
                _ => {
                    at += 1;
                    continue;
                },
            };

            let mut zip64 = false;
            let mut field = extra_start;
            while field + 4 <= extra_start + extra_len {
                let id = u16_at(data, field);
                let len = u16_at(data, field + 2);
                if id == 0x0001 && len >= 8 {
                    data[field + 4..field + 12].copy_from_slice(&size.to_le_bytes());
                    zip64 = true;
                }
                field += 4 + len;
            }
            if !zip64 {
                data[size_field..size_field + 4].copy_from_slice(&u32::MAX.to_le_bytes());
            }
            at = extra_start + extra_len;
        }
    }

    #[test]
    fn test_decode_ignores_declared_entry_size() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .large_file(true);
        writer.start_file("big.xml", options).unwrap();
        writer.write_all(b"<doc/>").unwrap();
        let mut data = writer.finish().unwrap().into_inner();

        forge_uncompressed_size(&mut data, 1 << 62);

        // Either the entry still reads or it is skipped; the process survives
        if let Ok(records) = ZipDecoder.decode("a.zip", &data) {
            assert!(records.is_empty() || records == vec!["<doc/>"]);
        }
    }

    #[test]
    fn test_empty_archive_has_no_records() {
        let data = build_zip(&[]);
        assert!(ZipDecoder.decode("a.zip", &data).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_non_archive() {
        let result = ZipDecoder.decode("a.zip", b"definitely not a zip");
        assert!(matches!(result, Err(ArchiveError::Invalid(_))));
    }
}
