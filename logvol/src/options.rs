use bitflags::bitflags;
use logvol_metrics::LogVolMetrics;

bitflags! {
    /// Configuration persisted in the file summary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConfigFlags: u32 {
        /// Writes are staged until an explicit flush.
        const DEFERRED_WRITES = 1;
        /// Metadata writes are followed by a barrier.
        const METADATA_BARRIER = 1 << 1;
        /// The index is refreshed in bounded partial loads.
        const PARTIAL_INDEX = 1 << 2;
        /// Staging is limited by a buffer quota.
        const BUFFER_QUOTA = 1 << 3;
    }
}

/// When the data of a write or read actually moves.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Writes are flushed before the call returns. The call is then collective.
    Blocking,
    /// Writes stay staged until the next flush, read, or close.
    #[default]
    NonBlocking,
}

/// Options for creating or opening a [`LogFile`](crate::LogFile).
#[derive(Clone)]
pub struct LogVolOptions {
    buffer_size: Option<u64>,
    transfer_mode: TransferMode,
    index_budget: Option<u64>,
    metadata_barrier: bool,
    creator_rank: usize,
    metrics: Option<LogVolMetrics>,
}

impl Default for LogVolOptions {
    fn default() -> Self {
        Self {
            buffer_size: None,
            transfer_mode: TransferMode::default(),
            index_budget: None,
            metadata_barrier: true,
            creator_rank: 0,
            metrics: None,
        }
    }
}

impl LogVolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the bytes staged by each rank. Unlimited by default.
    pub fn with_buffer_size(mut self, bytes: u64) -> Self {
        self.buffer_size = Some(bytes);
        self
    }

    /// Default transfer mode of writes.
    pub fn with_transfer_mode(mut self, mode: TransferMode) -> Self {
        self.transfer_mode = mode;
        self
    }

    /// Refresh the index in loads of at most `bytes` of records each (at least one section).
    pub fn with_index_budget(mut self, bytes: u64) -> Self {
        self.index_budget = Some(bytes);
        self
    }

    pub fn with_metadata_barrier(mut self, barrier: bool) -> Self {
        self.metadata_barrier = barrier;
        self
    }

    /// The rank that creates blobs and writes shared headers and attributes.
    pub fn with_creator_rank(mut self, rank: usize) -> Self {
        self.creator_rank = rank;
        self
    }

    /// Record metrics into `metrics` instead of a fresh registry per file.
    pub fn with_metrics(mut self, metrics: LogVolMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn buffer_size(&self) -> Option<u64> {
        self.buffer_size
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.transfer_mode
    }

    pub fn index_budget(&self) -> Option<u64> {
        self.index_budget
    }

    pub fn metadata_barrier(&self) -> bool {
        self.metadata_barrier
    }

    pub fn creator_rank(&self) -> usize {
        self.creator_rank
    }

    pub(crate) fn metrics(&self) -> Option<&LogVolMetrics> {
        self.metrics.as_ref()
    }

    pub fn config_flags(&self) -> ConfigFlags {
        let mut flags = ConfigFlags::empty();
        flags.set(
            ConfigFlags::DEFERRED_WRITES,
            self.transfer_mode == TransferMode::NonBlocking,
        );
        flags.set(ConfigFlags::METADATA_BARRIER, self.metadata_barrier);
        flags.set(ConfigFlags::PARTIAL_INDEX, self.index_budget.is_some());
        flags.set(ConfigFlags::BUFFER_QUOTA, self.buffer_size.is_some());
        flags
    }
}
