use bytes::{Buf, BufMut};
use logvol_error::{LogVolResult, logvol_bail};

use crate::selection::Block;
use crate::{DatasetId, MAX_DIMS, METADATA_ENTRY_SIZE};

/// Where the payload of one staged write ended up.
///
/// Serialized as a fixed-stride little-endian record: `dataset u32, ndim u32,
/// start[MAX_DIMS] u64, count[MAX_DIMS] u64, segment u32, reserved u32, offset u64, size u64`.
/// Unused coordinate slots are zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub dataset: DatasetId,
    pub block: Block,
    /// Sequence number of the log segment holding the payload.
    pub segment: u32,
    /// Absolute container offset of the payload.
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u64,
}

impl MetadataEntry {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let ndim = self.block.ndim();
        buf.put_u32_le(self.dataset);
        buf.put_u32_le(ndim as u32);
        for coords in [&self.block.start, &self.block.count] {
            for &c in coords.iter() {
                buf.put_u64_le(c);
            }
            buf.put_bytes(0, 8 * (MAX_DIMS - ndim));
        }
        buf.put_u32_le(self.segment);
        buf.put_u32_le(0);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.size);
    }

    pub fn decode(mut bytes: &[u8]) -> LogVolResult<Self> {
        if bytes.len() != METADATA_ENTRY_SIZE {
            logvol_bail!(
                IndexCorrupt: "metadata record of {} bytes, expected {}",
                bytes.len(),
                METADATA_ENTRY_SIZE
            );
        }
        let dataset = bytes.get_u32_le();
        let ndim = bytes.get_u32_le() as usize;
        if ndim == 0 || ndim > MAX_DIMS {
            logvol_bail!(IndexCorrupt: "metadata record of rank {}", ndim);
        }
        let read_coords = |bytes: &mut &[u8]| {
            let coords: Vec<u64> = (0..MAX_DIMS).map(|_| bytes.get_u64_le()).collect();
            coords[..ndim].to_vec()
        };
        let start = read_coords(&mut bytes);
        let count = read_coords(&mut bytes);
        let segment = bytes.get_u32_le();
        let _reserved = bytes.get_u32_le();
        let offset = bytes.get_u64_le();
        let size = bytes.get_u64_le();
        Ok(Self {
            dataset,
            block: Block::new(start, count),
            segment,
            offset,
            size,
        })
    }
}

/// Decode a packed run of records.
pub fn decode_records(bytes: &[u8]) -> LogVolResult<Vec<MetadataEntry>> {
    if bytes.len() % METADATA_ENTRY_SIZE != 0 {
        logvol_bail!(
            IndexCorrupt: "metadata of {} bytes is not a multiple of the {} byte record stride",
            bytes.len(),
            METADATA_ENTRY_SIZE
        );
    }
    bytes
        .chunks_exact(METADATA_ENTRY_SIZE)
        .map(MetadataEntry::decode)
        .collect()
}
