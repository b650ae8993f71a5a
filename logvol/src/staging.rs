use logvol_error::{LogVolResult, logvol_bail, logvol_err};

/// Size of a fresh arena chunk, unless a single allocation needs more.
const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// A handle to bytes staged in a [`StagingPool`].
///
/// The handle remembers its own length so releasing it reconciles the pool's usage.
#[derive(Debug)]
pub struct Staged {
    chunk: usize,
    begin: usize,
    len: usize,
}

impl Staged {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Process-local bump arena holding write payloads until they are flushed.
///
/// Usage is accounted against an optional quota. Once every staged allocation has been
/// released, the arena rewinds and its first chunk is reused.
pub struct StagingPool {
    quota: Option<u64>,
    used: u64,
    chunk_size: usize,
    chunks: Vec<Vec<u8>>,
}

impl StagingPool {
    pub fn new(quota: Option<u64>) -> Self {
        Self {
            quota,
            used: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks: Vec::new(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Bytes currently staged.
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn quota(&self) -> Option<u64> {
        self.quota
    }

    /// Fail with `OutOfBuffer` unless `len` more bytes fit in the quota.
    pub fn check(&self, len: u64) -> LogVolResult<()> {
        if let Some(quota) = self.quota {
            if self.used.saturating_add(len) > quota {
                logvol_bail!(
                    OutOfBuffer: "staging {} bytes would exceed the buffer quota ({} of {} bytes in use)",
                    len,
                    self.used,
                    quota
                );
            }
        }
        Ok(())
    }

    /// Allocate `len` bytes and let `fill` initialize them.
    ///
    /// If `fill` fails the allocation is rolled back and usage is unchanged.
    pub fn stage_with<F>(&mut self, len: usize, fill: F) -> LogVolResult<Staged>
    where
        F: FnOnce(&mut [u8]) -> LogVolResult<()>,
    {
        self.check(len as u64)?;
        let chunk = self.chunk_for(len)?;
        let data = &mut self.chunks[chunk];
        let begin = data.len();
        data.resize(begin + len, 0);
        if let Err(err) = fill(&mut data[begin..]) {
            data.truncate(begin);
            return Err(err);
        }
        self.used += len as u64;
        Ok(Staged { chunk, begin, len })
    }

    /// Allocate a copy of `src`.
    pub fn stage(&mut self, src: &[u8]) -> LogVolResult<Staged> {
        self.stage_with(src.len(), |dst| {
            dst.copy_from_slice(src);
            Ok(())
        })
    }

    pub fn bytes(&self, staged: &Staged) -> &[u8] {
        &self.chunks[staged.chunk][staged.begin..staged.begin + staged.len]
    }

    pub fn release(&mut self, staged: Staged) {
        debug_assert!(self.used >= staged.len as u64, "released more than was staged");
        self.used = self.used.saturating_sub(staged.len as u64);
        if self.used == 0 {
            self.chunks.truncate(1);
            if let Some(first) = self.chunks.first_mut() {
                first.clear();
            }
        }
    }

    /// Index of a chunk with room for `len` more bytes, allocating one if needed.
    fn chunk_for(&mut self, len: usize) -> LogVolResult<usize> {
        if let Some(last) = self.chunks.last() {
            if last.capacity() - last.len() >= len {
                return Ok(self.chunks.len() - 1);
            }
        }
        let size = len.max(self.chunk_size);
        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(size)
            .map_err(|e| logvol_err!(OutOfMemory: "allocating a {} byte staging chunk: {}", size, e))?;
        self.chunks.push(chunk);
        Ok(self.chunks.len() - 1)
    }
}

/// A zero-filled buffer, failing with `OutOfMemory` instead of aborting.
pub(crate) fn try_zeroed(len: usize) -> LogVolResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| logvol_err!(OutOfMemory: "allocating a {} byte buffer: {}", len, e))?;
    buf.resize(len, 0);
    Ok(buf)
}
