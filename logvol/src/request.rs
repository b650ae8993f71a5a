use crate::selection::Block;
use crate::staging::Staged;
use crate::{DatasetId, PType};

/// A staged write waiting for the next flush.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    pub dataset: DatasetId,
    pub block: Block,
    /// Payload in the storage element type of the dataset.
    pub payload: Staged,
}

/// A read to be served by the next read flush.
pub(crate) struct ReadRequest<'a> {
    pub dataset: DatasetId,
    /// Decomposed selection, in buffer order.
    pub blocks: Vec<Block>,
    pub mem_type: PType,
    pub dest: &'a mut [u8],
}

/// Identifies a deferred read until its result is taken with
/// [`LogFile::take_read`](crate::LogFile::take_read).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadTicket(pub(crate) u64);

/// A read whose destination is owned by the file until the caller takes it.
pub(crate) struct DeferredRead {
    pub ticket: ReadTicket,
    pub dataset: DatasetId,
    pub blocks: Vec<Block>,
    pub mem_type: PType,
    pub dest: Vec<u8>,
}

impl DeferredRead {
    pub fn as_request(&mut self) -> ReadRequest<'_> {
        ReadRequest {
            dataset: self.dataset,
            blocks: self.blocks.clone(),
            mem_type: self.mem_type,
            dest: &mut self.dest,
        }
    }
}
