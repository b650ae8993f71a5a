use std::time::Instant;

use logvol_error::LogVolResult;
use logvol_io::{ByteRange, coalesce_ranges, read_at_all};

use crate::convert;
use crate::file::FileState;
use crate::request::ReadRequest;
use crate::selection::{Block, for_each_coord};
use crate::staging::try_zeroed;

/// One contiguous copy of a scatter/gather plan.
#[derive(Debug, Clone, Copy)]
struct Run {
    request: usize,
    src: ByteRange,
    /// Byte offset in the request's storage-typed target.
    dst: usize,
}

struct ReadPlan {
    runs: Vec<Run>,
    /// Coalesced file-side view of every run's source.
    view: Vec<ByteRange>,
}

impl ReadPlan {
    fn len(&self) -> u64 {
        self.view.iter().map(ByteRange::len).sum()
    }
}

impl FileState {
    /// Serve `requests` with a single collective read.
    ///
    /// Collective. Staged writes of every rank are flushed and indexed first, so reads observe
    /// every write issued before them. Regions that were never written read as zero.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(nrequests = requests.len())))]
    pub(crate) fn serve_reads(&mut self, requests: &mut [ReadRequest<'_>]) -> LogVolResult<()> {
        self.flush_data()?;
        self.flush_metadata()?;
        if !self.index_valid {
            self.refresh_index()?;
        }
        let start = Instant::now();

        // A rank that cannot build its plan still joins the collective read with nothing to read.
        let plan = self.plan_reads(requests);
        let view = plan.as_ref().map(|p| p.view.as_slice()).unwrap_or(&[]);
        let total = plan.as_ref().map(ReadPlan::len).unwrap_or(0);
        let mut buffer = try_zeroed(total as usize);
        let read = match buffer.as_mut() {
            Ok(buffer) => read_at_all(self.comm.as_ref(), self.storage.as_ref(), view, buffer),
            Err(_) => read_at_all(self.comm.as_ref(), self.storage.as_ref(), &[], &mut []),
        };
        let plan = plan?;
        let buffer = buffer?;
        read?;

        self.apply_plan(&plan, &buffer, requests)?;
        self.metrics
            .counter("logvol.read.requests")
            .add(requests.len() as i64);
        self.metrics.counter("logvol.read.bytes").add(total as i64);
        self.metrics.timer("logvol.read").update(start.elapsed());
        log::debug!(
            "rank {} served {} reads with {} runs over {} ranges ({} bytes)",
            self.rank,
            requests.len(),
            plan.runs.len(),
            plan.view.len(),
            total
        );
        Ok(())
    }

    fn plan_reads(&self, requests: &[ReadRequest<'_>]) -> LogVolResult<ReadPlan> {
        let mut runs = Vec::new();
        for (idx, request) in requests.iter().enumerate() {
            let desc = self.desc(request.dataset)?;
            let width = desc.ptype.byte_width() as u64;
            let entries = self.index.entries(request.dataset);
            let mut base = 0u64;
            for block in &request.blocks {
                // Stored order, so later entries overwrite earlier ones when copied.
                for entry in entries {
                    if let Some(overlap) = entry.block.intersection(block) {
                        push_runs(&overlap, &entry.block, block, width, |src, dst, len| {
                            runs.push(Run {
                                request: idx,
                                src: ByteRange::with_len(entry.offset + src, len),
                                dst: (base * width + dst) as usize,
                            });
                        });
                    }
                }
                base += block.volume();
            }
        }
        let view = coalesce_ranges(runs.iter().map(|r| r.src).collect(), 0);
        Ok(ReadPlan { runs, view })
    }

    fn apply_plan(
        &self,
        plan: &ReadPlan,
        buffer: &[u8],
        requests: &mut [ReadRequest<'_>],
    ) -> LogVolResult<()> {
        let mut starts = Vec::with_capacity(plan.view.len());
        let mut pos = 0usize;
        for range in &plan.view {
            starts.push(pos);
            pos += range.len() as usize;
        }

        // Assemble in the storage type, converting afterwards if the caller asked for another.
        let mut targets = Vec::with_capacity(requests.len());
        for request in requests.iter_mut() {
            let ptype = self.desc(request.dataset)?.ptype;
            if ptype == request.mem_type {
                request.dest.fill(0);
                targets.push(None);
            } else {
                let elems = request.dest.len() / request.mem_type.byte_width();
                targets.push(Some(try_zeroed(elems * ptype.byte_width())?));
            }
        }

        for run in &plan.runs {
            let idx = plan.view.partition_point(|r| r.begin <= run.src.begin) - 1;
            let from = starts[idx] + (run.src.begin - plan.view[idx].begin) as usize;
            let len = run.src.len() as usize;
            let target: &mut [u8] = match targets[run.request].as_mut() {
                Some(tmp) => tmp.as_mut_slice(),
                None => &mut *requests[run.request].dest,
            };
            target[run.dst..run.dst + len].copy_from_slice(&buffer[from..from + len]);
        }

        for (request, target) in requests.iter_mut().zip(targets) {
            if let Some(tmp) = target {
                let ptype = self.desc(request.dataset)?.ptype;
                convert(ptype, &tmp, request.mem_type, request.dest)?;
            }
        }
        Ok(())
    }
}

/// Emit the contiguous runs of `overlap` as `(src byte offset, dst byte offset, byte length)`,
/// where offsets are relative to the row-major layouts of `src` and `dst`.
///
/// Trailing dimensions that `overlap` spans fully in both boxes are folded into one run.
fn push_runs(
    overlap: &Block,
    src: &Block,
    dst: &Block,
    width: u64,
    mut emit: impl FnMut(u64, u64, u64),
) {
    let ndim = overlap.ndim();
    let mut inner = ndim - 1;
    let mut run = overlap.count[inner];
    while inner > 0
        && overlap.count[inner] == src.count[inner]
        && overlap.count[inner] == dst.count[inner]
    {
        inner -= 1;
        run *= overlap.count[inner];
    }
    for_each_coord(&overlap.start[..inner], &overlap.count[..inner], |prefix| {
        let mut coord = prefix.to_vec();
        coord.extend_from_slice(&overlap.start[inner..]);
        emit(
            src.offset_of(&coord) * width,
            dst.offset_of(&coord) * width,
            run * width,
        );
    });
}
