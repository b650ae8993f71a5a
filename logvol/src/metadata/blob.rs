use std::ops::Range;

use bytes::{Buf, BufMut, BytesMut};
use logvol_error::{LogVolResult, logvol_bail};

use crate::{METADATA_ENTRY_SIZE, METADATA_HEADER_SIZE, METADATA_MAGIC, METADATA_VERSION};

/// Header of a metadata blob.
///
/// A blob holds a 16 byte header (`magic, version u16, flags u16, nsec u32, reserved u32`), a
/// table of `nsec` u64 section end offsets and then the records themselves. Section ends are
/// relative to the start of the records and strictly increasing; section `i` spans
/// `ends[i - 1]..ends[i]`. Each rank that contributed entries owns one section, in rank order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLayout {
    section_ends: Vec<u64>,
}

impl BlobLayout {
    /// Layout for one section per non-zero contribution, in order.
    pub fn from_section_sizes(sizes: &[u64]) -> Self {
        let mut end = 0;
        let section_ends = sizes
            .iter()
            .filter(|&&s| s > 0)
            .map(|&s| {
                end += s;
                end
            })
            .collect();
        Self { section_ends }
    }

    pub fn nsec(&self) -> usize {
        self.section_ends.len()
    }

    /// Bytes before the first record.
    pub fn header_len(&self) -> u64 {
        (METADATA_HEADER_SIZE + 8 * self.nsec()) as u64
    }

    pub fn records_len(&self) -> u64 {
        self.section_ends.last().copied().unwrap_or(0)
    }

    pub fn blob_len(&self) -> u64 {
        self.header_len() + self.records_len()
    }

    /// Byte range of section `idx`, relative to the start of the records.
    pub fn section(&self, idx: usize) -> Range<u64> {
        let begin = if idx == 0 {
            0
        } else {
            self.section_ends[idx - 1]
        };
        begin..self.section_ends[idx]
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.header_len() as usize);
        buf.put_slice(&METADATA_MAGIC);
        buf.put_u16_le(METADATA_VERSION);
        buf.put_u16_le(0);
        buf.put_u32_le(self.nsec() as u32);
        buf.put_u32_le(0);
        for &end in &self.section_ends {
            buf.put_u64_le(end);
        }
        buf
    }

    /// Number of sections announced by the fixed part of a header.
    pub fn parse_nsec(mut fixed: &[u8]) -> LogVolResult<usize> {
        if fixed.len() < METADATA_HEADER_SIZE {
            logvol_bail!(IndexCorrupt: "metadata blob of {} bytes has no header", fixed.len());
        }
        if fixed[..4] != METADATA_MAGIC {
            logvol_bail!(IndexCorrupt: "bad metadata magic {:?}", &fixed[..4]);
        }
        fixed.advance(4);
        let version = fixed.get_u16_le();
        if version != METADATA_VERSION {
            logvol_bail!(IndexCorrupt: "unsupported metadata version {}", version);
        }
        let _flags = fixed.get_u16_le();
        Ok(fixed.get_u32_le() as usize)
    }

    /// Parse and validate the header at the front of `bytes`, for a blob of `blob_len` bytes.
    pub fn parse(bytes: &[u8], blob_len: u64) -> LogVolResult<Self> {
        let nsec = Self::parse_nsec(bytes)?;
        let header_len = METADATA_HEADER_SIZE + 8 * nsec;
        if bytes.len() < header_len || blob_len < header_len as u64 {
            logvol_bail!(
                IndexCorrupt: "metadata blob of {} bytes cannot hold {} sections",
                blob_len,
                nsec
            );
        }
        let mut table = &bytes[METADATA_HEADER_SIZE..header_len];
        let mut section_ends = Vec::with_capacity(nsec);
        let mut prev = 0u64;
        for idx in 0..nsec {
            let end = table.get_u64_le();
            if end <= prev || end % METADATA_ENTRY_SIZE as u64 != 0 {
                logvol_bail!(
                    IndexCorrupt: "section {} ends at {} after {}, not a record boundary past the previous section",
                    idx,
                    end,
                    prev
                );
            }
            section_ends.push(end);
            prev = end;
        }
        let layout = Self { section_ends };
        if layout.blob_len() != blob_len {
            logvol_bail!(
                IndexCorrupt: "metadata blob of {} bytes, header describes {}",
                blob_len,
                layout.blob_len()
            );
        }
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const E: u64 = METADATA_ENTRY_SIZE as u64;

    #[test]
    fn empty_contributions_get_no_section() {
        let layout = BlobLayout::from_section_sizes(&[E, 0, 3 * E, 0]);
        assert_eq!(layout.nsec(), 2);
        assert_eq!(layout.section(1), E..4 * E);
        assert_eq!(layout.header_len(), 32);
        let encoded = layout.encode();
        assert_eq!(&encoded[..4], b"LVMD");
        assert_eq!(BlobLayout::parse(&encoded, layout.blob_len()).unwrap(), layout);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = BlobLayout::from_section_sizes(&[E]).encode();
        encoded[0] = b'X';
        let err = BlobLayout::parse(&encoded, 16 + 8 + E).unwrap_err();
        assert_eq!(err.status(), -7);
    }

    #[test]
    fn rejects_length_mismatch() {
        let layout = BlobLayout::from_section_sizes(&[E]);
        assert!(BlobLayout::parse(&layout.encode(), layout.blob_len() + 1).is_err());
    }

    #[test]
    fn rejects_non_increasing_sections() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"LVMD");
        buf.put_u16_le(METADATA_VERSION);
        buf.put_u16_le(0);
        buf.put_u32_le(2);
        buf.put_u32_le(0);
        buf.put_u64_le(2 * E);
        buf.put_u64_le(2 * E);
        assert!(BlobLayout::parse(&buf, 32 + 2 * E).is_err());
    }
}
