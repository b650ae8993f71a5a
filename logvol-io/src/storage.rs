use std::sync::Arc;

use logvol_error::LogVolResult;
use serde::{Deserialize, Serialize};

/// Placement of a dataset inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    /// Size of the dataset in bytes.
    pub len: u64,
    /// Absolute offset of the dataset in the container, if space has been allocated.
    ///
    /// Some containers defer allocation until their metadata is flushed, in which case the
    /// offset is `None` until [`Storage::flush_allocation`] has run.
    pub offset: Option<u64>,
}

/// When a container assigns file space to a newly created dataset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPolicy {
    /// Space is assigned at creation.
    #[default]
    Immediate,
    /// Space is assigned by the next [`Storage::flush_allocation`].
    OnFlush,
    /// Space is never assigned; every offset query reports `None`.
    Never,
}

/// The underlying container shared by every rank of a file.
///
/// Implementations are shared between ranks of one process (usually behind an [`Arc`]), so all
/// methods take `&self`. Raw byte operations address absolute container offsets.
pub trait Storage: Send + Sync {
    /// A stable identifier of the physical container, used to detect duplicate opens.
    fn identity(&self) -> &str;

    /// Create a dataset of `len` bytes. Fails if the name is already taken.
    fn create_dataset(&self, name: &str, len: u64) -> LogVolResult<()>;

    /// Look up a dataset by name.
    fn dataset(&self, name: &str) -> LogVolResult<Option<DatasetInfo>>;

    /// Assign space to every dataset whose allocation was deferred.
    fn flush_allocation(&self) -> LogVolResult<()>;

    /// Write the concatenation of `bufs` contiguously starting at `offset`.
    fn write_at(&self, offset: u64, bufs: &[&[u8]]) -> LogVolResult<()>;

    /// Fill `out` with the bytes starting at `offset`.
    fn read_at(&self, offset: u64, out: &mut [u8]) -> LogVolResult<()>;

    /// Read a small integer attribute attached to the container.
    fn get_attr(&self, name: &str) -> LogVolResult<Option<Vec<i64>>>;

    /// Create or replace a small integer attribute attached to the container.
    fn put_attr(&self, name: &str, value: &[i64]) -> LogVolResult<()>;

    /// Make everything written so far durable.
    fn sync(&self) -> LogVolResult<()>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn identity(&self) -> &str {
        S::identity(self)
    }

    fn create_dataset(&self, name: &str, len: u64) -> LogVolResult<()> {
        S::create_dataset(self, name, len)
    }

    fn dataset(&self, name: &str) -> LogVolResult<Option<DatasetInfo>> {
        S::dataset(self, name)
    }

    fn flush_allocation(&self) -> LogVolResult<()> {
        S::flush_allocation(self)
    }

    fn write_at(&self, offset: u64, bufs: &[&[u8]]) -> LogVolResult<()> {
        S::write_at(self, offset, bufs)
    }

    fn read_at(&self, offset: u64, out: &mut [u8]) -> LogVolResult<()> {
        S::read_at(self, offset, out)
    }

    fn get_attr(&self, name: &str) -> LogVolResult<Option<Vec<i64>>> {
        S::get_attr(self, name)
    }

    fn put_attr(&self, name: &str, value: &[i64]) -> LogVolResult<()> {
        S::put_attr(self, name, value)
    }

    fn sync(&self) -> LogVolResult<()> {
        S::sync(self)
    }
}
