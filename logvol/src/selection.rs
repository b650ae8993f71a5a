//! Selection geometry: boxes of element coordinates and their normalization into the ordered,
//! non-overlapping request set that the engine stages and reads.
//!
//! Requests are always produced in the row-major order of the selected elements, which is the
//! order in which their bytes appear in the caller's buffer.

use std::cmp::Ordering;

use itertools::Itertools;
use logvol_error::{LogVolResult, logvol_bail};

use crate::MAX_DIMS;

/// Below this many requests [`sort_requests`] uses an insertion sort.
const INSERTION_SORT_THRESHOLD: usize = 16;

/// An N-dimensional box of element coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Block {
    pub start: Vec<u64>,
    pub count: Vec<u64>,
}

impl Block {
    pub fn new(start: Vec<u64>, count: Vec<u64>) -> Self {
        debug_assert_eq!(start.len(), count.len(), "start and count disagree on ndim");
        Self { start, count }
    }

    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    /// Number of elements in the box.
    pub fn volume(&self) -> u64 {
        self.count.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.count.iter().any(|&c| c == 0)
    }

    /// The row-major last element, which is also the lexicographic maximum of the box.
    pub fn last_coord(&self) -> Vec<u64> {
        self.start
            .iter()
            .zip(&self.count)
            .map(|(&s, &c)| s + c.saturating_sub(1))
            .collect()
    }

    /// The overlap of two boxes of the same dimensionality, if any.
    pub fn intersection(&self, other: &Block) -> Option<Block> {
        if self.ndim() != other.ndim() {
            return None;
        }
        let mut start = Vec::with_capacity(self.ndim());
        let mut count = Vec::with_capacity(self.ndim());
        for d in 0..self.ndim() {
            let lo = self.start[d].max(other.start[d]);
            let hi = (self.start[d] + self.count[d]).min(other.start[d] + other.count[d]);
            if lo >= hi {
                return None;
            }
            start.push(lo);
            count.push(hi - lo);
        }
        Some(Block { start, count })
    }

    /// Row-major element offset of `coord` within this box.
    pub(crate) fn offset_of(&self, coord: &[u64]) -> u64 {
        let mut offset = 0;
        for d in 0..self.ndim() {
            offset = offset * self.count[d] + (coord[d] - self.start[d]);
        }
        offset
    }

    fn check_bounds(&self, dims: &[u64]) -> LogVolResult<()> {
        if self.ndim() != dims.len() || self.count.len() != dims.len() {
            logvol_bail!(
                InvalidSelection: "block of rank {} does not match dataset of rank {}",
                self.ndim(),
                dims.len()
            );
        }
        for d in 0..dims.len() {
            let end = self.start[d].checked_add(self.count[d]);
            if end.is_none_or(|end| end > dims[d]) {
                logvol_bail!(
                    InvalidSelection: "block {:?}+{:?} exceeds dataset extent {:?}",
                    self.start,
                    self.count,
                    dims
                );
            }
        }
        Ok(())
    }

    /// Split into single rows along the last dimension, in row-major order.
    fn rows(&self) -> Vec<Block> {
        let last = self.ndim() - 1;
        let mut rows = Vec::new();
        for_each_coord(&self.start[..last], &self.count[..last], |prefix| {
            let mut start = prefix.to_vec();
            start.push(self.start[last]);
            let mut count = vec![1; last];
            count.push(self.count[last]);
            rows.push(Block { start, count });
        });
        rows
    }
}

/// Call `f` with every coordinate of the box `start`/`count`, in row-major order.
///
/// A zero-dimensional box holds exactly one (empty) coordinate.
pub(crate) fn for_each_coord(start: &[u64], count: &[u64], mut f: impl FnMut(&[u64])) {
    if count.iter().any(|&c| c == 0) {
        return;
    }
    let mut coord = start.to_vec();
    loop {
        f(&coord);
        let mut d = coord.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            coord[d] += 1;
            if coord[d] < start[d] + count[d] {
                break;
            }
            coord[d] = start[d];
        }
    }
}

/// Whether `a` starts strictly before `b` in lexicographic coordinate order.
pub fn hyperslab_less_than(a: &Block, b: &Block) -> bool {
    a.start < b.start
}

/// Sort blocks by start, breaking ties by count, so identical blocks become neighbours.
pub fn sort_blocks(blocks: &mut [Block]) {
    blocks.sort_by(|a, b| {
        if hyperslab_less_than(a, b) {
            Ordering::Less
        } else if hyperslab_less_than(b, a) {
            Ordering::Greater
        } else {
            a.count.cmp(&b.count)
        }
    });
}

/// Sort requests by lexicographic start. Requests with equal starts keep their relative order.
pub fn sort_requests(blocks: &mut [Block]) {
    if blocks.len() < INSERTION_SORT_THRESHOLD {
        for i in 1..blocks.len() {
            let mut j = i;
            while j > 0 && blocks[j].start < blocks[j - 1].start {
                blocks.swap(j, j - 1);
                j -= 1;
            }
        }
    } else {
        blocks.sort_by(|a, b| a.start.cmp(&b.start));
    }
}

/// Whether `b` continues or overlaps the row run `a`.
///
/// Both must agree exactly on start and count in every dimension but the last, and `a` must
/// reach at least to the start of `b` along the last dimension. General box overlap is not
/// considered.
pub fn block_intersect(a: &Block, b: &Block) -> bool {
    if a.ndim() != b.ndim() || a.ndim() == 0 {
        return false;
    }
    let last = a.ndim() - 1;
    a.start[..last] == b.start[..last]
        && a.count[..last] == b.count[..last]
        && a.start[last] + a.count[last] >= b.start[last]
}

/// Merge neighbouring requests that [`block_intersect`], in place.
///
/// Must run after [`sort_requests`].
pub fn merge_requests(blocks: &mut Vec<Block>) {
    if blocks.len() < 2 {
        return;
    }
    let mut kept = 0;
    for i in 1..blocks.len() {
        if block_intersect(&blocks[kept], &blocks[i]) {
            let last = blocks[kept].ndim() - 1;
            let end = (blocks[kept].start[last] + blocks[kept].count[last])
                .max(blocks[i].start[last] + blocks[i].count[last]);
            blocks[kept].count[last] = end - blocks[kept].start[last];
        } else {
            kept += 1;
            blocks.swap(kept, i);
        }
    }
    blocks.truncate(kept + 1);
}

/// The elements of a dataset touched by one I/O call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every element.
    All,
    /// No element.
    None,
    /// `count` blocks of shape `block` per dimension, `stride` apart, from `start`.
    Hyperslab {
        start: Vec<u64>,
        stride: Vec<u64>,
        count: Vec<u64>,
        block: Vec<u64>,
    },
    /// The union of a list of boxes.
    Blocks(Vec<Block>),
    /// Single elements, in the order the buffer holds them.
    Points(Vec<Vec<u64>>),
}

impl Selection {
    /// A selection of the single box `start`/`count`.
    pub fn block(start: impl Into<Vec<u64>>, count: impl Into<Vec<u64>>) -> Self {
        Selection::Blocks(vec![Block::new(start.into(), count.into())])
    }

    /// Normalize into non-empty, non-overlapping requests in buffer order.
    pub fn decompose(&self, dims: &[u64]) -> LogVolResult<Vec<Block>> {
        if dims.is_empty() || dims.len() > MAX_DIMS {
            logvol_bail!(
                InvalidSelection: "datasets of rank {} are not supported (1..={})",
                dims.len(),
                MAX_DIMS
            );
        }
        match self {
            Selection::None => Ok(Vec::new()),
            Selection::All => {
                let all = Block::new(vec![0; dims.len()], dims.to_vec());
                Ok(if all.is_empty() { Vec::new() } else { vec![all] })
            }
            Selection::Hyperslab {
                start,
                stride,
                count,
                block,
            } => {
                let ndim = dims.len();
                if start.len() != ndim
                    || stride.len() != ndim
                    || count.len() != ndim
                    || block.len() != ndim
                {
                    logvol_bail!(InvalidSelection: "hyperslab rank does not match dataset of rank {}", ndim);
                }
                for d in 0..ndim {
                    if count[d] > 1 && stride[d] < block[d] {
                        logvol_bail!(
                            InvalidSelection: "hyperslab stride {} is smaller than block {} in dimension {}",
                            stride[d],
                            block[d],
                            d
                        );
                    }
                }
                let blocks = count
                    .iter()
                    .map(|&c| 0..c)
                    .multi_cartesian_product()
                    .map(|index| {
                        // Saturating, so out-of-range origins fail the bounds check instead of wrapping.
                        let origin = (0..ndim)
                            .map(|d| start[d].saturating_add(index[d].saturating_mul(stride[d])))
                            .collect();
                        Block::new(origin, block.clone())
                    })
                    .collect();
                decompose_blocks(blocks, dims)
            }
            Selection::Blocks(blocks) => decompose_blocks(blocks.clone(), dims),
            Selection::Points(points) => decompose_points(points, dims),
        }
    }
}

fn decompose_blocks(mut blocks: Vec<Block>, dims: &[u64]) -> LogVolResult<Vec<Block>> {
    for block in &blocks {
        block.check_bounds(dims)?;
    }
    blocks.retain(|b| !b.is_empty());
    sort_blocks(&mut blocks);
    blocks.dedup();

    let mut requests = Vec::with_capacity(blocks.len());
    let mut group: Vec<Block> = Vec::new();
    let mut group_max: Vec<u64> = Vec::new();
    for block in blocks {
        // A block starting at or before the last element of the group interleaves with it.
        if !group.is_empty() && block.start <= group_max {
            group_max = group_max.max(block.last_coord());
            group.push(block);
        } else {
            flush_group(&mut group, &mut requests);
            group_max = block.last_coord();
            group.push(block);
        }
    }
    flush_group(&mut group, &mut requests);
    Ok(requests)
}

fn flush_group(group: &mut Vec<Block>, requests: &mut Vec<Block>) {
    match group.len() {
        0 => {}
        1 => requests.append(group),
        _ => {
            let mut rows: Vec<Block> = group.drain(..).flat_map(|b| b.rows()).collect();
            sort_requests(&mut rows);
            merge_requests(&mut rows);
            requests.extend(rows);
        }
    }
}

fn decompose_points(points: &[Vec<u64>], dims: &[u64]) -> LogVolResult<Vec<Block>> {
    let mut requests: Vec<Block> = Vec::with_capacity(points.len());
    for point in points {
        let block = Block::new(point.clone(), vec![1; point.len()]);
        block.check_bounds(dims)?;
        if let Some(prev) = requests.last_mut() {
            let last = dims.len() - 1;
            if prev.start[..last] == block.start[..last]
                && prev.start[last] + prev.count[last] == block.start[last]
            {
                prev.count[last] += 1;
                continue;
            }
        }
        requests.push(block);
    }
    Ok(requests)
}
