use std::io;

use logvol_error::{LogVolResult, logvol_err};
use parking_lot::RwLock;

use crate::catalog::Catalog;
use crate::{AllocationPolicy, DatasetInfo, Storage};

/// A container held entirely in memory.
///
/// Ranks of one process share a `MemoryStorage` behind an [`Arc`](std::sync::Arc). Allocated
/// extents that were never written read back as zeros.
pub struct MemoryStorage {
    identity: String,
    policy: AllocationPolicy,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    catalog: Catalog,
    data: Vec<u8>,
}

impl MemoryStorage {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            policy: AllocationPolicy::default(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn with_allocation_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Number of bytes currently backing the container.
    pub fn len(&self) -> u64 {
        self.inner.read().data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the raw container bytes.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.read().data.clone()
    }

    /// Overwrite raw bytes without going through the catalog.
    pub fn poke(&self, offset: u64, bytes: &[u8]) -> LogVolResult<()> {
        self.write_at(offset, &[bytes])
    }
}

impl Inner {
    fn grow_to_catalog(&mut self) -> LogVolResult<()> {
        let end = to_usize(self.catalog.end())?;
        if self.data.len() < end {
            self.data
                .try_reserve(end - self.data.len())
                .map_err(|e| logvol_err!(OutOfMemory: "growing container to {} bytes: {}", end, e))?;
            self.data.resize(end, 0);
        }
        Ok(())
    }
}

fn to_usize(value: u64) -> LogVolResult<usize> {
    usize::try_from(value).map_err(|_| logvol_err!("offset {} too big for usize", value))
}

impl Storage for MemoryStorage {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn create_dataset(&self, name: &str, len: u64) -> LogVolResult<()> {
        let mut inner = self.inner.write();
        inner.catalog.create(name, len, self.policy)?;
        inner.grow_to_catalog()
    }

    fn dataset(&self, name: &str) -> LogVolResult<Option<DatasetInfo>> {
        Ok(self.inner.read().catalog.dataset(name))
    }

    fn flush_allocation(&self) -> LogVolResult<()> {
        let mut inner = self.inner.write();
        inner.catalog.flush_allocation(self.policy);
        inner.grow_to_catalog()
    }

    fn write_at(&self, offset: u64, bufs: &[&[u8]]) -> LogVolResult<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let start = to_usize(offset)?;
        let end = start + total;
        let mut inner = self.inner.write();
        if inner.data.len() < end {
            inner.data.resize(end, 0);
        }
        let mut pos = start;
        for buf in bufs {
            inner.data[pos..pos + buf.len()].copy_from_slice(buf);
            pos += buf.len();
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, out: &mut [u8]) -> LogVolResult<()> {
        let start = to_usize(offset)?;
        let end = start + out.len();
        let inner = self.inner.read();
        let src = inner.data.get(start..end).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read of [{}, {}) past container end {}",
                    start,
                    end,
                    inner.data.len()
                ),
            )
        })?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn get_attr(&self, name: &str) -> LogVolResult<Option<Vec<i64>>> {
        Ok(self.inner.read().catalog.attr(name))
    }

    fn put_attr(&self, name: &str, value: &[i64]) -> LogVolResult<()> {
        self.inner.write().catalog.put_attr(name, value);
        Ok(())
    }

    fn sync(&self) -> LogVolResult<()> {
        Ok(())
    }
}
