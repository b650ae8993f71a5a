use std::sync::Arc;

use logvol_error::{LogVolResult, logvol_bail, logvol_err};
use logvol_io::{Communicator, Storage, all_agree};
use logvol_metrics::{LogVolMetrics, Metric};
use rustc_hash::FxHashMap;

use crate::metadata::{IndexCursor, MetadataEntry, MetadataIndex, PartialIndex};
use crate::registry::RegistryGuard;
use crate::request::{DeferredRead, ReadRequest, ReadTicket, WriteRequest};
use crate::selection::{Block, Selection};
use crate::staging::{StagingPool, try_zeroed};
use crate::{
    ConfigFlags, DATASET_ATTR_PREFIX, DatasetId, FileRegistry, LogVolOptions, MAX_DIMS,
    NAME_ATTR_PREFIX, PType, SUMMARY_ATTR, TransferMode, convert,
};

/// Number of groups the engine keeps in a container: the log group.
const NGROUP: i64 = 1;

/// Shape and element type of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDesc {
    pub id: DatasetId,
    pub ptype: PType,
    pub dims: Vec<u64>,
}

impl DatasetDesc {
    pub fn num_elements(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Size in bytes of a dense dataset of `dims`, if it fits in an `i64`.
    ///
    /// Every extent, element count and byte size derived from a dataset then fits in `u64`
    /// arithmetic and in the `i64` attributes it is persisted as.
    fn dense_len(dims: &[u64], ptype: PType) -> Option<u64> {
        dims.iter()
            .try_fold(ptype.byte_width() as u64, |acc, &d| acc.checked_mul(d))
            .filter(|&len| i64::try_from(len).is_ok())
    }

    fn to_attr(&self) -> Vec<i64> {
        let mut attr = vec![i64::from(u8::from(self.ptype)), self.dims.len() as i64];
        attr.extend(self.dims.iter().map(|&d| d as i64));
        attr
    }

    fn from_attr(id: DatasetId, attr: &[i64]) -> LogVolResult<Self> {
        let [ptype, ndim, dims @ ..] = attr else {
            logvol_bail!(IndexCorrupt: "dataset {} record of {} values", id, attr.len());
        };
        if *ndim < 1 || *ndim as usize > MAX_DIMS || dims.len() != *ndim as usize {
            logvol_bail!(IndexCorrupt: "dataset {} record of rank {}", id, ndim);
        }
        let dims = dims
            .iter()
            .map(|&d| u64::try_from(d))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| logvol_err!(IndexCorrupt: "dataset {} has a negative extent", id))?;
        let ptype = PType::from_attr(*ptype)?;
        if Self::dense_len(&dims, ptype).is_none() {
            logvol_bail!(IndexCorrupt: "dataset {} of extent {:?} is too large", id, dims);
        }
        Ok(Self { id, ptype, dims })
    }
}

/// The counters persisted in the summary attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Summary {
    ndset: u64,
    nldset: u64,
    nmdset: u64,
    flags: ConfigFlags,
}

impl Summary {
    fn to_attr(self) -> [i64; 5] {
        [
            self.ndset as i64,
            self.nldset as i64,
            self.nmdset as i64,
            i64::from(self.flags.bits()),
            NGROUP,
        ]
    }

    fn from_attr(attr: &[i64]) -> LogVolResult<Self> {
        let &[ndset, nldset, nmdset, flags, _ngroup] = attr else {
            logvol_bail!(IndexCorrupt: "summary record of {} values, expected 5", attr.len());
        };
        let count = |v: i64| {
            u64::try_from(v).map_err(|_| logvol_err!(IndexCorrupt: "negative count {} in summary", v))
        };
        let flags = u32::try_from(flags)
            .map_err(|_| logvol_err!(IndexCorrupt: "invalid config flags {}", flags))?;
        Ok(Self {
            ndset: count(ndset)?,
            nldset: count(nldset)?,
            nmdset: count(nmdset)?,
            flags: ConfigFlags::from_bits_retain(flags),
        })
    }
}

/// Process-local state of an open log file.
pub(crate) struct FileState {
    pub comm: Arc<dyn Communicator>,
    pub storage: Arc<dyn Storage>,
    pub options: LogVolOptions,
    pub rank: usize,
    pub metrics: LogVolMetrics,
    /// Staging arena, accounting `bused` against the `bsize` quota.
    pub pool: StagingPool,
    pub pending_writes: Vec<WriteRequest>,
    pub pending_reads: Vec<DeferredRead>,
    /// Entries of flushed writes whose metadata is not yet persisted.
    pub unflushed: Vec<MetadataEntry>,
    pub datasets: Vec<DatasetDesc>,
    /// Log segments created so far.
    pub nldset: u64,
    /// Metadata blobs created so far.
    pub nmdset: u64,
    pub index: MetadataIndex,
    pub index_valid: bool,
    pub metadata_dirty: bool,
}

impl FileState {
    fn new(
        comm: Arc<dyn Communicator>,
        storage: Arc<dyn Storage>,
        options: LogVolOptions,
        summary: Summary,
        datasets: Vec<DatasetDesc>,
    ) -> Self {
        let rank = comm.rank();
        let metrics = options
            .metrics()
            .cloned()
            .unwrap_or_else(|| LogVolMetrics::for_rank(rank));
        let pool = StagingPool::new(options.buffer_size());
        Self {
            comm,
            storage,
            options,
            rank,
            metrics,
            pool,
            pending_writes: Vec::new(),
            pending_reads: Vec::new(),
            unflushed: Vec::new(),
            datasets,
            nldset: summary.nldset,
            nmdset: summary.nmdset,
            index: MetadataIndex::default(),
            index_valid: false,
            metadata_dirty: false,
        }
    }

    pub(crate) fn desc(&self, dataset: DatasetId) -> LogVolResult<&DatasetDesc> {
        self.datasets
            .get(dataset as usize)
            .ok_or_else(|| logvol_err!(NotFound: "no dataset with id {}", dataset))
    }

    fn is_creator(&self) -> bool {
        self.rank == self.options.creator_rank()
    }

    fn summary(&self) -> Summary {
        Summary {
            ndset: self.datasets.len() as u64,
            nldset: self.nldset,
            nmdset: self.nmdset,
            flags: self.options.config_flags(),
        }
    }

    /// Write the summary from the creator rank. Collective.
    fn persist_summary(&self, sync: bool) -> LogVolResult<()> {
        let local = if self.is_creator() {
            self.storage
                .put_attr(SUMMARY_ATTR, &self.summary().to_attr())
                .and_then(|()| if sync { self.storage.sync() } else { Ok(()) })
        } else {
            Ok(())
        };
        all_agree(self.comm.as_ref(), "summary update", local)
    }

    fn log_metrics(&self) {
        for (id, metric) in self.metrics.metrics().iter() {
            let count = match metric {
                Metric::Counter(counter) => counter.count(),
                Metric::Histogram(histogram) => {
                    i64::try_from(histogram.count()).unwrap_or(i64::MAX)
                }
                Metric::Timer(timer) => timer.count(),
                _ => continue,
            };
            log::debug!("rank {} metric {} {:?} = {}", self.rank, id.name(), id.tags(), count);
        }
    }
}

/// A log-structured file open on every rank of a communicator.
///
/// Writes are staged and appended to shared log segments at flush time. Reads are assembled
/// from whatever log segments hold the requested elements. Every method that may touch storage
/// is collective and must be called by all ranks in the same order; the local ones say so.
pub struct LogFile {
    state: FileState,
    names: FxHashMap<String, DatasetId>,
    completed_reads: FxHashMap<ReadTicket, Vec<u8>>,
    next_ticket: u64,
    stored_flags: ConfigFlags,
    closed: bool,
    _guard: RegistryGuard,
}

impl LogFile {
    /// Create a log file in an empty container. Collective.
    pub fn create(
        comm: Arc<dyn Communicator>,
        storage: Arc<dyn Storage>,
        registry: &FileRegistry,
        options: LogVolOptions,
    ) -> LogVolResult<Self> {
        let local = (|| -> LogVolResult<_> {
            check_creator(comm.as_ref(), &options)?;
            let guard = registry.register(storage.identity())?;
            if storage.get_attr(SUMMARY_ATTR)?.is_some() {
                logvol_bail!("{} already holds a log file", storage.identity());
            }
            Ok(guard)
        })();
        let guard = all_agree(comm.as_ref(), "create", local)?;

        let summary = Summary {
            ndset: 0,
            nldset: 0,
            nmdset: 0,
            flags: options.config_flags(),
        };
        let state = FileState::new(comm, storage, options, summary, Vec::new());
        state.persist_summary(false)?;
        log::debug!("rank {} created log file {}", state.rank, state.storage.identity());
        Ok(Self::new(state, summary.flags, guard))
    }

    /// Open an existing log file. Collective.
    pub fn open(
        comm: Arc<dyn Communicator>,
        storage: Arc<dyn Storage>,
        registry: &FileRegistry,
        options: LogVolOptions,
    ) -> LogVolResult<Self> {
        let local = (|| -> LogVolResult<_> {
            check_creator(comm.as_ref(), &options)?;
            let guard = registry.register(storage.identity())?;
            let attr = storage.get_attr(SUMMARY_ATTR)?.ok_or_else(|| {
                logvol_err!(NotFound: "{} holds no log file", storage.identity())
            })?;
            let summary = Summary::from_attr(&attr)?;
            let datasets = (0..summary.ndset)
                .map(|id| {
                    let id = DatasetId::try_from(id)
                        .map_err(|_| logvol_err!(IndexCorrupt: "{} datasets", summary.ndset))?;
                    let name = format!("{DATASET_ATTR_PREFIX}{id}");
                    let attr = storage
                        .get_attr(&name)?
                        .ok_or_else(|| logvol_err!(IndexCorrupt: "dataset record {} missing", name))?;
                    DatasetDesc::from_attr(id, &attr)
                })
                .collect::<LogVolResult<Vec<_>>>()?;
            Ok((guard, summary, datasets))
        })();
        let (guard, summary, datasets) = all_agree(comm.as_ref(), "open", local)?;

        let state = FileState::new(comm, storage, options, summary, datasets);
        log::debug!(
            "rank {} opened log file {} with {} datasets, {} log segments and {} metadata blobs",
            state.rank,
            state.storage.identity(),
            summary.ndset,
            summary.nldset,
            summary.nmdset
        );
        Ok(Self::new(state, summary.flags, guard))
    }

    fn new(state: FileState, stored_flags: ConfigFlags, guard: RegistryGuard) -> Self {
        Self {
            state,
            names: FxHashMap::default(),
            completed_reads: FxHashMap::default(),
            next_ticket: 0,
            stored_flags,
            closed: false,
            _guard: guard,
        }
    }

    /// Define a new dataset. Collective; every rank must pass the same arguments.
    pub fn define_dataset(
        &mut self,
        name: &str,
        dims: &[u64],
        ptype: PType,
    ) -> LogVolResult<DatasetId> {
        let local = (|| -> LogVolResult<_> {
            if name.is_empty() {
                logvol_bail!("dataset names must not be empty");
            }
            if dims.is_empty() || dims.len() > MAX_DIMS {
                logvol_bail!(
                    "datasets of rank {} are not supported (1..={})",
                    dims.len(),
                    MAX_DIMS
                );
            }
            if DatasetDesc::dense_len(dims, ptype).is_none() {
                logvol_bail!(
                    "dataset {} of extent {:?} and type {} exceeds {} bytes",
                    name,
                    dims,
                    ptype,
                    i64::MAX
                );
            }
            if self.lookup(name)?.is_some() {
                logvol_bail!("dataset {} already exists", name);
            }
            DatasetId::try_from(self.state.datasets.len())
                .map_err(|_| logvol_err!("too many datasets"))
        })();
        let id = all_agree(self.state.comm.as_ref(), "define dataset", local)?;

        let desc = DatasetDesc {
            id,
            ptype,
            dims: dims.to_vec(),
        };
        let stored = if self.state.is_creator() {
            let storage = &self.state.storage;
            storage
                .put_attr(&format!("{DATASET_ATTR_PREFIX}{id}"), &desc.to_attr())
                .and_then(|()| {
                    storage.put_attr(&format!("{NAME_ATTR_PREFIX}{name}"), &[i64::from(id)])
                })
        } else {
            Ok(())
        };
        all_agree(self.state.comm.as_ref(), "define dataset", stored)?;
        self.state.datasets.push(desc);
        self.names.insert(name.to_string(), id);
        self.state.persist_summary(false)?;
        Ok(id)
    }

    /// Look up a dataset by name. Local.
    pub fn dataset(&self, name: &str) -> LogVolResult<DatasetId> {
        self.lookup(name)?
            .ok_or_else(|| logvol_err!(NotFound: "no dataset named {}", name))
    }

    fn lookup(&self, name: &str) -> LogVolResult<Option<DatasetId>> {
        if let Some(&id) = self.names.get(name) {
            return Ok(Some(id));
        }
        let Some(attr) = self.state.storage.get_attr(&format!("{NAME_ATTR_PREFIX}{name}"))? else {
            return Ok(None);
        };
        let id = attr
            .first()
            .and_then(|&id| DatasetId::try_from(id).ok())
            .filter(|&id| (id as usize) < self.state.datasets.len())
            .ok_or_else(|| logvol_err!(IndexCorrupt: "dataset name record {:?} for {}", attr, name))?;
        Ok(Some(id))
    }

    /// Shape and element type of a dataset. Local.
    pub fn dataset_desc(&self, dataset: DatasetId) -> LogVolResult<&DatasetDesc> {
        self.state.desc(dataset)
    }

    pub fn datasets(&self) -> &[DatasetDesc] {
        &self.state.datasets
    }

    /// Stage a write with the default transfer mode of the file.
    pub fn write(
        &mut self,
        dataset: DatasetId,
        selection: &Selection,
        mem_type: PType,
        buf: &[u8],
    ) -> LogVolResult<()> {
        self.write_with(
            dataset,
            selection,
            mem_type,
            buf,
            self.state.options.transfer_mode(),
        )
    }

    /// Stage a write of `buf`, holding `mem_type` elements in selection order.
    ///
    /// The payload is copied, converted to the dataset type, so `buf` may be reused at once.
    /// Local with [`TransferMode::NonBlocking`]; collective with [`TransferMode::Blocking`],
    /// which flushes the staged writes of every rank before returning.
    pub fn write_with(
        &mut self,
        dataset: DatasetId,
        selection: &Selection,
        mem_type: PType,
        buf: &[u8],
        mode: TransferMode,
    ) -> LogVolResult<()> {
        let staged = self.stage_write(dataset, selection, mem_type, buf);
        match mode {
            TransferMode::NonBlocking => staged,
            TransferMode::Blocking => {
                // Ranks whose staging failed still take part in the flush.
                let flushed = self.state.flush_data();
                staged.and(flushed)
            }
        }
    }

    fn stage_write(
        &mut self,
        dataset: DatasetId,
        selection: &Selection,
        mem_type: PType,
        buf: &[u8],
    ) -> LogVolResult<()> {
        let desc = self.state.desc(dataset)?;
        let storage_type = desc.ptype;
        let blocks = selection.decompose(&desc.dims)?;
        let elems: u64 = blocks.iter().map(Block::volume).sum();
        check_buffer(elems, mem_type, buf.len())?;
        let pool = &mut self.state.pool;
        pool.check(elems * storage_type.byte_width() as u64)?;

        let mut staged = Vec::with_capacity(blocks.len());
        let mut pos = 0usize;
        for block in blocks {
            let n = block.volume() as usize;
            let src = &buf[pos..pos + n * mem_type.byte_width()];
            pos += src.len();
            match pool.stage_with(n * storage_type.byte_width(), |dst| {
                convert(mem_type, src, storage_type, dst)
            }) {
                Ok(payload) => staged.push(WriteRequest {
                    dataset,
                    block,
                    payload,
                }),
                Err(err) => {
                    for request in staged {
                        pool.release(request.payload);
                    }
                    return Err(err);
                }
            }
        }
        self.state.metrics.counter("logvol.write.requests").inc();
        let bytes = elems * storage_type.byte_width() as u64;
        self.state
            .metrics
            .histogram("logvol.write.bytes")
            .update(i64::try_from(bytes).unwrap_or(i64::MAX));
        self.state.pending_writes.extend(staged);
        Ok(())
    }

    /// Read the selection into `out`, holding `mem_type` elements in selection order.
    ///
    /// Collective: staged writes of every rank are flushed first, and deferred reads are served
    /// along with this one. Ranks with nothing to read pass [`Selection::None`].
    pub fn read(
        &mut self,
        dataset: DatasetId,
        selection: &Selection,
        mem_type: PType,
        out: &mut [u8],
    ) -> LogVolResult<()> {
        let request = self.read_request(dataset, selection, mem_type, out);
        let (request, invalid) = match request {
            Ok(request) => (Some(request), None),
            Err(err) => (None, Some(err)),
        };
        // A rank with an invalid request still joins the collective read.
        let served = self.serve(request);
        match invalid {
            Some(err) => Err(err),
            None => served,
        }
    }

    fn read_request<'a>(
        &self,
        dataset: DatasetId,
        selection: &Selection,
        mem_type: PType,
        out: &'a mut [u8],
    ) -> LogVolResult<ReadRequest<'a>> {
        let desc = self.state.desc(dataset)?;
        let blocks = selection.decompose(&desc.dims)?;
        let elems: u64 = blocks.iter().map(Block::volume).sum();
        check_buffer(elems, mem_type, out.len())?;
        Ok(ReadRequest {
            dataset,
            blocks,
            mem_type,
            dest: out,
        })
    }

    /// Queue a read to be served by the next flush or blocking read. Local.
    pub fn read_deferred(
        &mut self,
        dataset: DatasetId,
        selection: &Selection,
        mem_type: PType,
    ) -> LogVolResult<ReadTicket> {
        let desc = self.state.desc(dataset)?;
        let blocks = selection.decompose(&desc.dims)?;
        let elems: u64 = blocks.iter().map(Block::volume).sum();
        let dest = try_zeroed((elems as usize) * mem_type.byte_width())?;
        let ticket = ReadTicket(self.next_ticket);
        self.next_ticket += 1;
        self.state.pending_reads.push(DeferredRead {
            ticket,
            dataset,
            blocks,
            mem_type,
            dest,
        });
        Ok(ticket)
    }

    /// Take the result of a deferred read once a flush has served it. Local.
    pub fn take_read(&mut self, ticket: ReadTicket) -> LogVolResult<Vec<u8>> {
        if let Some(data) = self.completed_reads.remove(&ticket) {
            return Ok(data);
        }
        if self.state.pending_reads.iter().any(|r| r.ticket == ticket) {
            logvol_bail!("read {:?} has not been served yet, flush first", ticket);
        }
        Err(logvol_err!(NotFound: "no deferred read {:?}", ticket))
    }

    /// Serve every deferred read, plus `extra`, with one collective read.
    fn serve(&mut self, extra: Option<ReadRequest<'_>>) -> LogVolResult<()> {
        let mut deferred = std::mem::take(&mut self.state.pending_reads);
        let served = {
            let mut requests: Vec<ReadRequest<'_>> =
                deferred.iter_mut().map(DeferredRead::as_request).collect();
            requests.extend(extra);
            self.state.serve_reads(&mut requests)
        };
        match served {
            Ok(()) => {
                for read in deferred {
                    self.completed_reads.insert(read.ticket, read.dest);
                }
                Ok(())
            }
            Err(err) => {
                if !deferred.is_empty() {
                    log::warn!(
                        "rank {} dropping {} deferred reads: {}",
                        self.state.rank,
                        deferred.len(),
                        err
                    );
                }
                Err(err)
            }
        }
    }

    /// Flush staged writes of every rank into a new log segment and serve deferred reads.
    ///
    /// Collective. With `force_metadata`, the metadata of every flushed write is persisted too.
    pub fn flush(&mut self, force_metadata: bool) -> LogVolResult<()> {
        self.state.flush_data()?;
        let reads = self
            .state
            .comm
            .all_reduce_max_u64(u64::from(!self.state.pending_reads.is_empty()));
        if reads != 0 {
            self.serve(None)?;
        }
        if force_metadata {
            self.state.flush_metadata()?;
        }
        Ok(())
    }

    /// Rebuild the in-memory index from storage. Collective.
    pub fn refresh_index(&mut self) -> LogVolResult<()> {
        self.state.refresh_index()
    }

    /// Load persisted entries from `cursor` onwards, at most `budget` bytes of records at a time
    /// but always at least one section. Local; does not touch the in-memory index.
    pub fn load_index_partial(
        &self,
        cursor: IndexCursor,
        budget: u64,
    ) -> LogVolResult<PartialIndex> {
        self.state.load_partial(cursor, budget)
    }

    /// Flush everything, persist the summary and release the container. Collective.
    pub fn close(mut self) -> LogVolResult<()> {
        let flushed = self.flush(true);
        let persisted = self.state.persist_summary(true);
        self.closed = true;
        log::debug!(
            "rank {} closed log file {}",
            self.state.rank,
            self.state.storage.identity()
        );
        if log::log_enabled!(log::Level::Debug) {
            self.state.log_metrics();
        }
        flushed.and(persisted)
    }

    /// The in-memory index, as of the last refresh.
    pub fn index(&self) -> &MetadataIndex {
        &self.state.index
    }

    pub fn rank(&self) -> usize {
        self.state.rank
    }

    /// Bytes currently staged by this rank.
    pub fn buffer_used(&self) -> u64 {
        self.state.pool.used()
    }

    pub fn buffer_size(&self) -> Option<u64> {
        self.state.pool.quota()
    }

    pub fn pending_writes(&self) -> usize {
        self.state.pending_writes.len()
    }

    pub fn pending_reads(&self) -> usize {
        self.state.pending_reads.len()
    }

    pub fn metadata_dirty(&self) -> bool {
        self.state.metadata_dirty
    }

    pub fn index_valid(&self) -> bool {
        self.state.index_valid
    }

    /// Number of log segments created, including discarded generations.
    pub fn log_segments(&self) -> u64 {
        self.state.nldset
    }

    /// Number of metadata blobs created, including discarded generations.
    pub fn metadata_blobs(&self) -> u64 {
        self.state.nmdset
    }

    /// Flags persisted in the summary when the file was opened.
    pub fn stored_flags(&self) -> ConfigFlags {
        self.stored_flags
    }

    pub fn metrics(&self) -> &LogVolMetrics {
        &self.state.metrics
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        if !self.closed {
            log::warn!(
                "rank {} dropped log file {} without closing it, discarding {} staged writes and {} unflushed entries",
                self.state.rank,
                self.state.storage.identity(),
                self.state.pending_writes.len(),
                self.state.unflushed.len()
            );
        }
    }
}

fn check_creator(comm: &dyn Communicator, options: &LogVolOptions) -> LogVolResult<()> {
    if options.creator_rank() >= comm.size() {
        logvol_bail!(
            "creator rank {} outside a communicator of {} ranks",
            options.creator_rank(),
            comm.size()
        );
    }
    Ok(())
}

fn check_buffer(elems: u64, mem_type: PType, len: usize) -> LogVolResult<()> {
    let expected = elems * mem_type.byte_width() as u64;
    if len as u64 != expected {
        logvol_bail!(
            "buffer of {} bytes for {} elements of {} ({} bytes)",
            len,
            elems,
            mem_type,
            expected
        );
    }
    Ok(())
}
