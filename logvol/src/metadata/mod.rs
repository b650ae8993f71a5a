//! The persistent index of where every staged write ended up.
//!
//! Each metadata flush serializes the entries of the preceding data flushes into one metadata
//! blob named `__logvol/meta.<seq>`. Refreshing the index reads every blob back, in sequence
//! order, so that entries of a dataset are kept in the order they were written.

mod blob;
mod entry;

use std::time::Instant;

use bytes::BytesMut;
use logvol_error::{LogVolError, LogVolResult, logvol_bail, logvol_err};
use logvol_io::{ByteRange, all_agree, read_at_all, write_extents_all};
use rustc_hash::FxHashMap;

pub use blob::*;
pub use entry::*;

use crate::file::FileState;
use crate::staging::try_zeroed;
use crate::{DatasetId, METADATA_ENTRY_SIZE, METADATA_HEADER_SIZE, metadata_blob_name};

/// In-memory entries per dataset, in flush order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetadataIndex {
    entries: FxHashMap<DatasetId, Vec<MetadataEntry>>,
    len: usize,
}

impl MetadataIndex {
    /// Entries of `dataset`, oldest first.
    pub fn entries(&self, dataset: DatasetId) -> &[MetadataEntry] {
        self.entries.get(&dataset).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Datasets with at least one entry, in id order.
    pub fn datasets(&self) -> Vec<DatasetId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }

    pub fn push(&mut self, entry: MetadataEntry) {
        self.entries.entry(entry.dataset).or_default().push(entry);
        self.len += 1;
    }

    /// Order every dataset's entries by log segment, keeping section order within a segment.
    ///
    /// One metadata blob may hold the entries of several data flushes, laid out rank by rank.
    /// Segment ids are global, so sorting by them restores the order the writes were flushed in.
    pub fn sort_by_segment(&mut self) {
        for entries in self.entries.values_mut() {
            entries.sort_by_key(|entry| entry.segment);
        }
    }
}

impl Extend<MetadataEntry> for MetadataIndex {
    fn extend<T: IntoIterator<Item = MetadataEntry>>(&mut self, iter: T) {
        for entry in iter {
            self.push(entry);
        }
    }
}

/// Position of a partial index load: a metadata blob and a section within it.
///
/// `section` never exceeds the number of sections of `blob`. Loading resumes at the start of
/// `section`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexCursor {
    pub blob: u64,
    pub section: u32,
}

/// The result of one bounded index load.
#[derive(Debug, Default, Clone)]
pub struct PartialIndex {
    /// Entries of the loaded sections, in write order.
    pub entries: Vec<MetadataEntry>,
    /// Record bytes consumed by this load.
    pub bytes: u64,
    /// Where to resume, or `None` once every blob has been consumed.
    pub next: Option<IndexCursor>,
}

impl FileState {
    /// Persist the entries of every data flush since the last metadata flush.
    ///
    /// Collective. Does nothing unless some rank holds unflushed entries.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub(crate) fn flush_metadata(&mut self) -> LogVolResult<()> {
        let dirty = self.comm.all_reduce_max_u64(u64::from(self.metadata_dirty));
        if dirty == 0 {
            return Ok(());
        }
        let start = Instant::now();

        let mut records = BytesMut::with_capacity(self.unflushed.len() * METADATA_ENTRY_SIZE);
        for entry in &self.unflushed {
            entry.encode(&mut records);
        }
        let sizes = self.comm.all_gather_u64(records.len() as u64);
        let prefix: u64 = sizes[..self.rank].iter().sum();
        let layout = BlobLayout::from_section_sizes(&sizes);

        let seq = self.nmdset;
        let name = metadata_blob_name(seq);
        let created = self.create_blob(&name, layout.blob_len());
        self.nmdset += 1;
        let nentries = std::mem::take(&mut self.unflushed).len();
        self.metadata_dirty = false;
        self.index_valid = false;

        let base = match created {
            Ok(base) => base,
            Err(LogVolError::MetadataAllocationFailed(msg, _)) => {
                log::warn!(
                    "rank {} discarding {} metadata entries of generation {}: {}",
                    self.rank,
                    nentries,
                    seq,
                    msg
                );
                return Ok(());
            }
            Err(err) => {
                log::warn!(
                    "rank {} dropping {} metadata entries of generation {}: {}",
                    self.rank,
                    nentries,
                    seq,
                    err
                );
                return Err(err);
            }
        };

        let header = layout.encode();
        let mut extents: Vec<(u64, &[u8])> = Vec::with_capacity(2);
        if self.rank == self.options.creator_rank() {
            extents.push((base, &header[..]));
        }
        extents.push((base + layout.header_len() + prefix, &records[..]));
        write_extents_all(self.comm.as_ref(), self.storage.as_ref(), &extents)?;
        if self.options.metadata_barrier() {
            self.comm.barrier();
        }

        self.metrics.counter("logvol.metadata.blobs").inc();
        self.metrics
            .counter("logvol.metadata.entries")
            .add(nentries as i64);
        self.metrics
            .timer("logvol.metadata.flush")
            .update(start.elapsed());
        log::debug!(
            "rank {} wrote {} metadata entries into {} ({} sections)",
            self.rank,
            nentries,
            name,
            layout.nsec()
        );
        Ok(())
    }

    /// Rebuild the in-memory index from every persisted metadata blob.
    ///
    /// Collective. Unflushed entries are persisted first.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub(crate) fn refresh_index(&mut self) -> LogVolResult<()> {
        self.flush_metadata()?;
        let start = Instant::now();
        self.index.clear();
        match self.options.index_budget() {
            Some(budget) => {
                let mut cursor = Some(IndexCursor::default());
                loop {
                    let partial = match cursor {
                        Some(at) => self.load_partial(at, budget),
                        None => Ok(PartialIndex::default()),
                    };
                    let partial = all_agree(self.comm.as_ref(), "index load", partial)?;
                    self.index.extend(partial.entries);
                    cursor = partial.next;
                    // Ranks keep loading together until every one of them is exhausted.
                    if self.comm.all_reduce_max_u64(u64::from(cursor.is_some())) == 0 {
                        break;
                    }
                }
            }
            None => self.load_all()?,
        }
        self.index.sort_by_segment();
        self.index_valid = true;
        self.metrics
            .timer("logvol.index.refresh")
            .update(start.elapsed());
        log::debug!(
            "rank {} refreshed index with {} entries from {} blobs",
            self.rank,
            self.index.len(),
            self.nmdset
        );
        Ok(())
    }

    /// Read every blob with one collective read.
    fn load_all(&mut self) -> LogVolResult<()> {
        let blobs = all_agree(self.comm.as_ref(), "index refresh", self.blob_extents())?;
        let ranges: Vec<ByteRange> = blobs.iter().map(|&(_, range)| range).collect();
        let total: u64 = ranges.iter().map(ByteRange::len).sum();
        let buffer = try_zeroed(total as usize);
        let mut buffer = all_agree(self.comm.as_ref(), "index refresh", buffer)?;
        read_at_all(self.comm.as_ref(), self.storage.as_ref(), &ranges, &mut buffer)?;

        let mut pos = 0usize;
        for (seq, range) in blobs {
            let blob = &buffer[pos..pos + range.len() as usize];
            pos += blob.len();
            let layout = BlobLayout::parse(blob, range.len())
                .map_err(|e| e.with_context(format!("parsing {}", metadata_blob_name(seq))))?;
            let records = &blob[layout.header_len() as usize..];
            for entry in decode_records(records)? {
                self.validate_entry(&entry)?;
                self.index.push(entry);
            }
        }
        Ok(())
    }

    /// Absolute extents of every allocated metadata blob, by sequence number.
    fn blob_extents(&self) -> LogVolResult<Vec<(u64, ByteRange)>> {
        let mut extents = Vec::with_capacity(self.nmdset as usize);
        for seq in 0..self.nmdset {
            if let Some(range) = self.blob_extent(seq)? {
                extents.push((seq, range));
            }
        }
        Ok(extents)
    }

    /// `None` for a blob whose generation was discarded for lack of a file offset.
    fn blob_extent(&self, seq: u64) -> LogVolResult<Option<ByteRange>> {
        let name = metadata_blob_name(seq);
        let info = self
            .storage
            .dataset(&name)?
            .ok_or_else(|| logvol_err!(IndexCorrupt: "metadata blob {} is missing", name))?;
        Ok(info.offset.map(|offset| ByteRange::with_len(offset, info.len)))
    }

    /// Load whole sections from `cursor` onwards while their records fit in `budget` bytes.
    ///
    /// At least one section is loaded per call, whatever the budget. Local: reads storage
    /// directly without involving other ranks.
    pub(crate) fn load_partial(
        &self,
        mut cursor: IndexCursor,
        budget: u64,
    ) -> LogVolResult<PartialIndex> {
        let mut entries = Vec::new();
        let mut consumed = 0u64;
        let mut loaded_any = false;
        let mut current: Option<(u64, u64, BlobLayout)> = None;

        while cursor.blob < self.nmdset {
            if current
                .as_ref()
                .is_none_or(|(blob, ..)| *blob != cursor.blob)
            {
                match self.read_layout(cursor.blob)? {
                    Some((base, layout)) => {
                        current = Some((cursor.blob, base + layout.header_len(), layout));
                    }
                    None => {
                        cursor = IndexCursor {
                            blob: cursor.blob + 1,
                            section: 0,
                        };
                        continue;
                    }
                }
            }
            let Some((_, records_at, layout)) = current.as_ref() else {
                break;
            };

            let nsec = layout.nsec();
            let section = cursor.section as usize;
            if section > nsec {
                logvol_bail!(
                    "index cursor at section {} of blob {} with {} sections",
                    section,
                    cursor.blob,
                    nsec
                );
            }
            if section == nsec {
                cursor = IndexCursor {
                    blob: cursor.blob + 1,
                    section: 0,
                };
                continue;
            }

            let range = layout.section(section);
            let len = range.end - range.start;
            if loaded_any && consumed + len > budget {
                break;
            }
            let mut records = try_zeroed(len as usize)?;
            self.storage.read_at(*records_at + range.start, &mut records)?;
            for entry in decode_records(&records)? {
                self.validate_entry(&entry)?;
                entries.push(entry);
            }
            consumed += len;
            loaded_any = true;
            cursor.section += 1;
        }

        let next = (cursor.blob < self.nmdset).then_some(cursor);
        Ok(PartialIndex {
            entries,
            bytes: consumed,
            next,
        })
    }

    /// Read and validate the header of blob `seq`, with the blob's base offset.
    fn read_layout(&self, seq: u64) -> LogVolResult<Option<(u64, BlobLayout)>> {
        let Some(extent) = self.blob_extent(seq)? else {
            return Ok(None);
        };
        if extent.len() < METADATA_HEADER_SIZE as u64 {
            logvol_bail!(
                IndexCorrupt: "metadata blob {} of {} bytes has no header",
                metadata_blob_name(seq),
                extent.len()
            );
        }
        let mut fixed = [0u8; METADATA_HEADER_SIZE];
        self.storage.read_at(extent.begin, &mut fixed)?;
        let nsec = BlobLayout::parse_nsec(&fixed)?;
        let header_len = (METADATA_HEADER_SIZE + 8 * nsec) as u64;
        if header_len > extent.len() {
            logvol_bail!(
                IndexCorrupt: "metadata blob {} of {} bytes cannot hold {} sections",
                metadata_blob_name(seq),
                extent.len(),
                nsec
            );
        }
        let mut header = try_zeroed(header_len as usize)?;
        self.storage.read_at(extent.begin, &mut header)?;
        let layout = BlobLayout::parse(&header, extent.len())?;
        Ok(Some((extent.begin, layout)))
    }

    fn validate_entry(&self, entry: &MetadataEntry) -> LogVolResult<()> {
        let Some(desc) = self.datasets.get(entry.dataset as usize) else {
            logvol_bail!(IndexCorrupt: "metadata entry for unknown dataset {}", entry.dataset);
        };
        let fits = entry.block.ndim() == desc.dims.len()
            && (0..desc.dims.len()).all(|d| {
                entry.block.start[d]
                    .checked_add(entry.block.count[d])
                    .is_some_and(|end| end <= desc.dims[d])
            });
        if !fits {
            logvol_bail!(
                IndexCorrupt: "metadata entry {:?}+{:?} outside dataset {} of extent {:?}",
                entry.block.start,
                entry.block.count,
                entry.dataset,
                desc.dims
            );
        }
        let expected = entry.block.volume() * desc.ptype.byte_width() as u64;
        if entry.size != expected {
            logvol_bail!(
                IndexCorrupt: "metadata entry of {} bytes for a {} element {} box",
                entry.size,
                entry.block.volume(),
                desc.ptype
            );
        }
        Ok(())
    }
}
