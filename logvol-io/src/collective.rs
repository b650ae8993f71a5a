use logvol_error::{LogVolResult, logvol_bail};

use crate::{ByteRange, Communicator, Storage};

/// Agree on the outcome of a local operation across the group.
///
/// Every rank returns an error if any rank failed; the failing rank keeps its own error.
/// Collective: every rank must call it, whatever its local outcome.
pub fn all_agree<T>(comm: &dyn Communicator, what: &str, local: LogVolResult<T>) -> LogVolResult<T> {
    let failed = comm.all_reduce_max_u64(u64::from(local.is_err()));
    match local {
        Err(err) => {
            log::warn!("rank {} failed collective {}: {}", comm.rank(), what, err);
            Err(err)
        }
        Ok(_) if failed != 0 => {
            logvol_bail!(CollectiveIO: "collective {} failed on a peer rank", what)
        }
        Ok(value) => Ok(value),
    }
}

/// Collectively write the concatenation of `bufs` at `offset`.
///
/// Every rank must call this, even with no buffers. A rank with nothing to write still takes
/// part in the outcome agreement.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(offset = offset)))]
pub fn write_at_all(
    comm: &dyn Communicator,
    storage: &dyn Storage,
    offset: u64,
    bufs: &[&[u8]],
) -> LogVolResult<()> {
    let local = if bufs.iter().all(|b| b.is_empty()) {
        Ok(())
    } else {
        storage.write_at(offset, bufs)
    };
    all_agree(comm, "write", local)
}

/// Collectively write several contiguous extents per rank, agreeing on the outcome once.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(nextents = extents.len())))]
pub fn write_extents_all(
    comm: &dyn Communicator,
    storage: &dyn Storage,
    extents: &[(u64, &[u8])],
) -> LogVolResult<()> {
    let local = extents
        .iter()
        .filter(|(_, bytes)| !bytes.is_empty())
        .try_for_each(|&(offset, bytes)| storage.write_at(offset, &[bytes]));
    all_agree(comm, "write", local)
}

/// Collectively read each of `ranges` into the matching slice of `out`.
///
/// `out` must be exactly as long as the ranges combined, laid out in the order given.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(nranges = ranges.len())))]
pub fn read_at_all(
    comm: &dyn Communicator,
    storage: &dyn Storage,
    ranges: &[ByteRange],
    out: &mut [u8],
) -> LogVolResult<()> {
    let local = read_ranges(storage, ranges, out);
    all_agree(comm, "read", local)
}

fn read_ranges(storage: &dyn Storage, ranges: &[ByteRange], out: &mut [u8]) -> LogVolResult<()> {
    let total: u64 = ranges.iter().map(ByteRange::len).sum();
    if total != out.len() as u64 {
        logvol_bail!(
            "read buffer of {} bytes does not match {} requested bytes",
            out.len(),
            total
        );
    }
    let mut pos = 0usize;
    for range in ranges {
        let len = range.len() as usize;
        storage.read_at(range.begin, &mut out[pos..pos + len])?;
        pos += len;
    }
    Ok(())
}
