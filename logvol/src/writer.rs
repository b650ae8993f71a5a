use std::time::Instant;

use logvol_error::{LogVolError, LogVolResult, logvol_err};
use logvol_io::{all_agree, write_at_all};

use crate::file::FileState;
use crate::metadata::MetadataEntry;
use crate::log_segment_name;

impl FileState {
    /// Create a blob of `len` bytes from the creator rank and agree on its container offset.
    ///
    /// Collective. If the container defers allocation, an allocation flush is forced once before
    /// giving up with `MetadataAllocationFailed` on every rank.
    pub(crate) fn create_blob(&self, name: &str, len: u64) -> LogVolResult<u64> {
        let comm = self.comm.as_ref();
        let is_creator = self.rank == self.options.creator_rank();
        let created = if is_creator {
            self.storage.create_dataset(name, len)
        } else {
            Ok(())
        };
        all_agree(comm, "blob creation", created)?;

        let query = || -> LogVolResult<Option<u64>> {
            Ok(self.storage.dataset(name)?.and_then(|info| info.offset))
        };
        let mut offset = all_agree(comm, "offset query", query())?;
        if comm.all_reduce_max_u64(u64::from(offset.is_none())) != 0 {
            log::debug!("offset of {} undefined, forcing an allocation flush", name);
            let flushed = if is_creator {
                self.storage.flush_allocation()
            } else {
                Ok(())
            };
            all_agree(comm, "allocation flush", flushed)?;
            offset = all_agree(comm, "offset query", query())?;
        }
        // Every rank must take the same branch, whatever it saw locally.
        let undefined = comm.all_reduce_max_u64(u64::from(offset.is_none())) != 0;
        match offset {
            Some(offset) if !undefined => Ok(offset),
            _ => Err(logvol_err!(
                MetadataAllocationFailed: "{} has no file offset after an allocation flush",
                name
            )),
        }
    }

    /// Append the staged writes of every rank to one new log segment.
    ///
    /// Collective. Each rank's payloads are packed in queue order at its exclusive prefix sum
    /// within the segment. The resulting entries wait in `unflushed` for the next metadata flush.
    /// When no rank has anything staged, no segment is created.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(rank = self.rank)))]
    pub(crate) fn flush_data(&mut self) -> LogVolResult<()> {
        let local: u64 = self
            .pending_writes
            .iter()
            .map(|w| w.payload.len() as u64)
            .sum();
        let total = self.comm.all_reduce_sum_u64(local);
        if total == 0 {
            self.release_pending();
            return Ok(());
        }
        let start = Instant::now();
        let prefix = self.comm.exscan_sum_u64(local);

        let seq = self.nldset;
        let segment = u32::try_from(seq)
            .map_err(|_| logvol_err!("log segment sequence {} exhausted", seq))?;
        let name = log_segment_name(seq);
        let created = self.create_blob(&name, total);
        self.nldset += 1;
        let base = match created {
            Ok(base) => base,
            Err(LogVolError::MetadataAllocationFailed(msg, _)) => {
                log::warn!(
                    "rank {} discarding {} staged writes ({} bytes) of generation {}: {}",
                    self.rank,
                    self.pending_writes.len(),
                    local,
                    seq,
                    msg
                );
                self.release_pending();
                return Ok(());
            }
            Err(err) => {
                self.release_pending();
                return Err(err);
            }
        };

        let written = {
            let bufs: Vec<&[u8]> = self
                .pending_writes
                .iter()
                .map(|w| self.pool.bytes(&w.payload))
                .collect();
            write_at_all(
                self.comm.as_ref(),
                self.storage.as_ref(),
                base + prefix,
                &bufs,
            )
        };
        if let Err(err) = written {
            // The content of this generation is undefined, so none of it gets indexed.
            self.release_pending();
            return Err(err);
        }

        let mut offset = base + prefix;
        let nrequests = self.pending_writes.len();
        for request in std::mem::take(&mut self.pending_writes) {
            let size = request.payload.len() as u64;
            self.unflushed.push(MetadataEntry {
                dataset: request.dataset,
                block: request.block,
                segment,
                offset,
                size,
            });
            offset += size;
            self.pool.release(request.payload);
        }
        self.metadata_dirty = true;

        self.metrics.counter("logvol.flush.segments").inc();
        self.metrics
            .counter("logvol.flush.bytes")
            .add(local as i64);
        self.metrics.timer("logvol.flush.data").update(start.elapsed());
        log::debug!(
            "rank {} flushed {} writes ({} of {} bytes) into {} at {}",
            self.rank,
            nrequests,
            local,
            total,
            name,
            base + prefix
        );
        Ok(())
    }

    fn release_pending(&mut self) {
        for request in std::mem::take(&mut self.pending_writes) {
            self.pool.release(request.payload);
        }
    }
}
