use std::sync::Arc;

use logvol_error::{LogVolError, LogVolUnwrap};
use logvol_io::{
    AllocationPolicy, Communicator, FileStorage, MemoryStorage, SelfComm, Storage, ThreadComm,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;

use crate::selection::for_each_coord;
use crate::*;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Create,
    Open,
}

/// Run `f` on `nprocs` ranks sharing `storage`, each holding its own open `LogFile`.
fn session<T, F>(
    nprocs: usize,
    storage: &Arc<dyn Storage>,
    mode: Mode,
    options: &LogVolOptions,
    f: F,
) -> Vec<T>
where
    T: Send,
    F: Fn(&mut LogFile) -> T + Sync,
{
    ThreadComm::run(nprocs, |comm| {
        let registry = FileRegistry::new();
        let comm: Arc<dyn Communicator> = Arc::new(comm);
        let mut file = match mode {
            Mode::Create => LogFile::create(comm, storage.clone(), &registry, options.clone()),
            Mode::Open => LogFile::open(comm, storage.clone(), &registry, options.clone()),
        }
        .logvol_unwrap();
        let out = f(&mut file);
        file.close().logvol_unwrap();
        assert!(registry.is_empty());
        out
    })
}

fn memory() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new("memory:test"))
}

fn define(file: &mut LogFile, name: &str, dims: &[u64], ptype: PType) -> DatasetId {
    file.define_dataset(name, dims, ptype).logvol_unwrap()
}

fn read_values<T: NativePType>(
    file: &mut LogFile,
    dataset: DatasetId,
    selection: &Selection,
    n: usize,
) -> Vec<T> {
    let mut out = vec![0u8; n * T::PTYPE.byte_width()];
    file.read(dataset, selection, T::PTYPE, &mut out).logvol_unwrap();
    from_le_bytes(&out)
}

fn write_values<T: NativePType>(
    file: &mut LogFile,
    dataset: DatasetId,
    selection: &Selection,
    values: &[T],
) {
    file.write(dataset, selection, T::PTYPE, &to_le_bytes(values))
        .logvol_unwrap();
}

#[test]
fn ranks_write_disjoint_rows() {
    let storage = memory();
    let results = session(4, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "grid", &[4, 10], PType::I32);
        let rank = file.rank() as u64;
        let row: Vec<i32> = (0..10).map(|i| rank as i32 * 100 + i).collect();
        write_values(file, ds, &Selection::block([rank, 0], [1, 10]), &row);
        file.flush(false).logvol_unwrap();
        read_values::<i32>(file, ds, &Selection::All, 40)
    });

    let expected: Vec<i32> = (0..4)
        .flat_map(|r| (0..10).map(move |i| r * 100 + i))
        .collect();
    for values in results {
        assert_eq!(values, expected);
    }
}

#[test]
fn later_write_wins_over_overlap() {
    let storage = memory();
    let results = session(2, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "box", &[4, 4], PType::I32);
        if file.rank() == 0 {
            write_values(file, ds, &Selection::block([0, 0], [4, 4]), &[1i32; 16]);
            write_values(file, ds, &Selection::block([1, 1], [2, 2]), &[2i32; 4]);
        }
        file.flush(false).logvol_unwrap();
        read_values::<i32>(file, ds, &Selection::All, 16)
    });

    #[rustfmt::skip]
    let expected = vec![
        1, 1, 1, 1,
        1, 2, 2, 1,
        1, 2, 2, 1,
        1, 1, 1, 1,
    ];
    for values in results {
        assert_eq!(values, expected);
    }
}

#[test]
fn empty_flush_creates_no_segment() {
    let storage = memory();
    session(3, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        define(file, "unused", &[8], PType::U8);
        file.flush(false).logvol_unwrap();
        assert_eq!(file.log_segments(), 0);
        assert!(!file.metadata_dirty());
        file.flush(true).logvol_unwrap();
        assert_eq!(file.metadata_blobs(), 0);
    });
    assert!(
        storage
            .dataset(&log_segment_name(0))
            .logvol_unwrap()
            .is_none()
    );
}

#[test]
fn flush_marks_metadata_dirty_until_persisted() {
    let storage = memory();
    session(2, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "v", &[2], PType::U16);
        if file.rank() == 1 {
            write_values(file, ds, &Selection::block([1], [1]), &[7u16]);
            assert_eq!(file.pending_writes(), 1);
            assert_eq!(file.buffer_used(), 2);
        }
        file.flush(false).logvol_unwrap();
        assert_eq!(file.log_segments(), 1);
        assert_eq!(file.pending_writes(), 0);
        assert_eq!(file.buffer_used(), 0);
        // Every rank took part in the segment, writer or not.
        assert!(file.metadata_dirty());
        file.flush(true).logvol_unwrap();
        assert!(!file.metadata_dirty());
        assert_eq!(file.metadata_blobs(), 1);
    });
}

/// Boxes and values rank `rank` writes in round `round`.
fn round_writes(seed: u64, round: u64, rank: usize, dims: &[u64]) -> Vec<(Block, Vec<i32>)> {
    let mut rng = StdRng::seed_from_u64(seed ^ (round << 16) ^ rank as u64);
    let nwrites = rng.random_range(0..4);
    (0..nwrites)
        .map(|_| {
            let mut start = Vec::with_capacity(dims.len());
            let mut count = Vec::with_capacity(dims.len());
            for &dim in dims {
                let s = rng.random_range(0..dim);
                start.push(s);
                count.push(rng.random_range(1..=dim - s));
            }
            let block = Block::new(start, count);
            let values = (0..block.volume()).map(|_| rng.random()).collect();
            (block, values)
        })
        .collect()
}

fn row_major_index(dims: &[u64], coord: &[u64]) -> usize {
    coord
        .iter()
        .zip(dims)
        .fold(0u64, |acc, (&c, &d)| acc * d + c) as usize
}

#[rstest]
#[case(1, 11)]
#[case(2, 23)]
#[case(3, 37)]
fn random_writes_match_dense_simulation(#[case] nprocs: usize, #[case] seed: u64) {
    let dims = [6u64, 9];
    let rounds = 5;
    let storage = memory();
    let results = session(nprocs, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "random", &dims, PType::I32);
        for round in 0..rounds {
            for (block, values) in round_writes(seed, round, file.rank(), &dims) {
                write_values(file, ds, &Selection::Blocks(vec![block]), &values);
            }
            file.flush(true).logvol_unwrap();
        }
        let all = read_values::<i32>(file, ds, &Selection::All, 54);
        let window = read_values::<i32>(file, ds, &Selection::block([1, 2], [4, 5]), 20);
        (all, window)
    });

    // Within a round, sections are ordered by rank, so later ranks win.
    let mut dense = vec![0i32; 54];
    for round in 0..rounds {
        for rank in 0..nprocs {
            for (block, values) in round_writes(seed, round, rank, &dims) {
                let mut values = values.into_iter();
                for_each_coord(&block.start, &block.count, |coord| {
                    if let Some(v) = values.next() {
                        dense[row_major_index(&dims, coord)] = v;
                    }
                });
            }
        }
    }
    let mut window = Vec::new();
    for_each_coord(&[1, 2], &[4, 5], |coord| {
        window.push(dense[row_major_index(&dims, coord)]);
    });
    for (all, got_window) in results {
        assert_eq!(all, dense);
        assert_eq!(got_window, window);
    }
}

#[rstest]
#[case::non_blocking(TransferMode::NonBlocking)]
#[case::blocking(TransferMode::Blocking)]
fn older_generation_loses_across_ranks(#[case] mode: TransferMode) {
    let storage = memory();
    let options = LogVolOptions::new().with_transfer_mode(mode);
    let results = session(2, &storage, Mode::Create, &options, |file| {
        let ds = define(file, "gen", &[4], PType::I32);
        let generation = |file: &mut LogFile, writer: usize, value: i32| {
            let (selection, values) = if file.rank() == writer {
                (Selection::All, vec![value; 4])
            } else {
                (Selection::Blocks(vec![]), vec![])
            };
            write_values(file, ds, &selection, &values);
            file.flush(false).logvol_unwrap();
        };
        // Rank 1 flushes first, so rank 0's later generation must win.
        generation(file, 1, 1);
        generation(file, 0, 2);
        read_values::<i32>(file, ds, &Selection::All, 4)
    });
    for values in results {
        assert_eq!(values, vec![2; 4]);
    }
}

#[derive(Clone, Copy, Debug)]
enum RoundKind {
    /// Staged writes followed by a data-only flush.
    Staged,
    /// Staged writes followed by a data and metadata flush.
    Persisted,
    /// The given number of blocking writes per rank.
    Blocking(usize),
}

fn round_kind(seed: u64, round: u64) -> RoundKind {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(31) ^ (round << 40));
    match rng.random_range(0..3) {
        0 => RoundKind::Staged,
        1 => RoundKind::Persisted,
        _ => RoundKind::Blocking(rng.random_range(1..=3)),
    }
}

/// Exactly `n` boxes and values for rank `rank` in round `round`.
fn blocking_writes(
    seed: u64,
    round: u64,
    rank: usize,
    n: usize,
    dims: &[u64],
) -> Vec<(Block, Vec<i32>)> {
    let mut writes = Vec::with_capacity(n);
    let mut sub = 0u64;
    while writes.len() < n {
        writes.extend(round_writes(seed ^ (sub << 48), round, rank, dims));
        sub += 1;
    }
    writes.truncate(n);
    writes
}

fn apply(dense: &mut [i32], dims: &[u64], block: &Block, values: Vec<i32>) {
    let mut values = values.into_iter();
    for_each_coord(&block.start, &block.count, |coord| {
        if let Some(v) = values.next() {
            dense[row_major_index(dims, coord)] = v;
        }
    });
}

#[rstest]
#[case(1, 5)]
#[case(2, 17)]
#[case(3, 29)]
#[case(4, 41)]
fn mixed_flushes_match_dense_simulation(#[case] nprocs: usize, #[case] seed: u64) {
    let dims = [5u64, 7];
    let rounds = 8;
    let storage = memory();
    let results = session(nprocs, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "mixed", &dims, PType::I32);
        for round in 0..rounds {
            match round_kind(seed, round) {
                kind @ (RoundKind::Staged | RoundKind::Persisted) => {
                    for (block, values) in round_writes(seed, round, file.rank(), &dims) {
                        write_values(file, ds, &Selection::Blocks(vec![block]), &values);
                    }
                    file.flush(matches!(kind, RoundKind::Persisted))
                        .logvol_unwrap();
                }
                RoundKind::Blocking(n) => {
                    for (block, values) in blocking_writes(seed, round, file.rank(), n, &dims) {
                        file.write_with(
                            ds,
                            &Selection::Blocks(vec![block]),
                            PType::I32,
                            &to_le_bytes(&values),
                            TransferMode::Blocking,
                        )
                        .logvol_unwrap();
                    }
                }
            }
        }
        read_values::<i32>(file, ds, &Selection::All, 35)
    });

    // Generations apply in flush order, and ranks in order within a generation.
    let mut dense = vec![0i32; 35];
    for round in 0..rounds {
        match round_kind(seed, round) {
            RoundKind::Staged | RoundKind::Persisted => {
                for rank in 0..nprocs {
                    for (block, values) in round_writes(seed, round, rank, &dims) {
                        apply(&mut dense, &dims, &block, values);
                    }
                }
            }
            RoundKind::Blocking(n) => {
                let per_rank: Vec<_> = (0..nprocs)
                    .map(|rank| blocking_writes(seed, round, rank, n, &dims))
                    .collect();
                for j in 0..n {
                    for writes in &per_rank {
                        let (block, values) = writes[j].clone();
                        apply(&mut dense, &dims, &block, values);
                    }
                }
            }
        }
    }
    for all in results {
        assert_eq!(all, dense);
    }
}

#[test]
fn oversized_datasets_are_rejected() {
    let storage = memory();
    session(1, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        for (dims, ptype) in [
            (&[u64::MAX, 4][..], PType::I32),
            (&[u64::MAX][..], PType::U8),
            (&[1 << 32, 1 << 32][..], PType::U8),
            (&[1 << 62][..], PType::F64),
        ] {
            let err = file.define_dataset("huge", dims, ptype).unwrap_err();
            assert!(matches!(err, LogVolError::InvalidArgument(..)), "{dims:?}");
        }
        assert!(file.datasets().is_empty());

        let ds = define(file, "small", &[4], PType::U8);
        let far = Selection::Hyperslab {
            start: vec![1],
            stride: vec![u64::MAX],
            count: vec![2],
            block: vec![1],
        };
        let err = file.write(ds, &far, PType::U8, &[1, 2]).unwrap_err();
        assert!(matches!(err, LogVolError::InvalidSelection(..)));
        assert_eq!(read_values::<u8>(file, ds, &Selection::All, 4), vec![0; 4]);
    });
}

#[test]
fn failed_metadata_flush_drops_generation() {
    let storage = memory();
    let results = session(2, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "lost", &[2], PType::U8);
        let rank = file.rank() as u64;
        write_values(file, ds, &Selection::block([rank], [1]), &[1u8]);
        file.flush(false).logvol_unwrap();
        if file.rank() == 0 {
            // The creator cannot make a blob that already exists.
            storage
                .create_dataset(&metadata_blob_name(0), 1)
                .logvol_unwrap();
        }
        let failed = file.flush(true).err();
        assert!(!file.metadata_dirty());
        assert_eq!(file.metadata_blobs(), 1);

        write_values(file, ds, &Selection::block([rank], [1]), &[2u8]);
        file.flush(true).logvol_unwrap();
        assert_eq!(file.metadata_blobs(), 2);
        failed
    });
    assert!(matches!(results[0], Some(LogVolError::InvalidArgument(..))));
    assert!(matches!(results[1], Some(LogVolError::CollectiveIO(..))));
    assert!(storage.dataset(&metadata_blob_name(1)).logvol_unwrap().is_some());
}

#[test]
fn unwritten_regions_read_as_zero() {
    let storage = memory();
    let results = session(1, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "sparse", &[3, 3], PType::F64);
        write_values(file, ds, &Selection::block([2, 0], [1, 2]), &[1.5f64, 2.5]);
        read_values::<f64>(file, ds, &Selection::All, 9)
    });
    assert_eq!(
        results[0],
        vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.5, 2.5, 0.0]
    );
}

#[test]
fn refresh_is_idempotent() {
    let storage = memory();
    session(2, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "r", &[2, 4], PType::U32);
        let rank = file.rank() as u64;
        write_values(file, ds, &Selection::block([rank, 0], [1, 4]), &[rank as u32; 4]);
        file.flush(true).logvol_unwrap();
        file.refresh_index().logvol_unwrap();
        let first = file.index().clone();
        file.refresh_index().logvol_unwrap();
        assert!(file.index_valid());
        assert_eq!(*file.index(), first);
        assert_eq!(first.entries(ds).len(), 2);
    });
}

#[test]
fn quota_rejects_oversized_writes() {
    let storage = memory();
    let options = LogVolOptions::new().with_buffer_size(64);
    session(1, &storage, Mode::Create, &options, |file| {
        let ds = define(file, "q", &[32], PType::I32);
        assert_eq!(file.buffer_size(), Some(64));

        let err = file
            .write(ds, &Selection::block([0], [20]), PType::I32, &[0u8; 80])
            .unwrap_err();
        assert!(matches!(err, LogVolError::OutOfBuffer(..)));
        assert_eq!(file.buffer_used(), 0);

        write_values(file, ds, &Selection::block([0], [10]), &[1i32; 10]);
        assert_eq!(file.buffer_used(), 40);
        let err = file
            .write(ds, &Selection::block([10], [10]), PType::I32, &[0u8; 40])
            .unwrap_err();
        assert_eq!(err.status(), -2);
        assert_eq!(file.buffer_used(), 40);
        assert_eq!(file.pending_writes(), 1);

        file.flush(false).logvol_unwrap();
        assert_eq!(file.buffer_used(), 0);
        write_values(file, ds, &Selection::block([10], [10]), &[2i32; 10]);
    });
}

#[rstest]
#[case::tiny_budget(1)]
#[case::two_entries(2 * METADATA_ENTRY_SIZE as u64)]
#[case::unbounded(u64::MAX)]
fn partial_loads_match_full_refresh(#[case] budget: u64) {
    let storage = memory();
    session(3, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let a = define(file, "a", &[3, 6], PType::I16);
        let b = define(file, "b", &[12], PType::U8);
        let rank = file.rank() as u64;
        for round in 0..3u64 {
            write_values(file, a, &Selection::block([rank, round * 2], [1, 2]), &[1i16; 2]);
            if rank != 1 {
                write_values(file, b, &Selection::block([rank * 4 + round], [1]), &[9u8]);
            }
            file.flush(true).logvol_unwrap();
        }
        file.refresh_index().logvol_unwrap();

        let mut partial = MetadataIndex::default();
        let mut cursor = Some(IndexCursor::default());
        let mut loads = 0;
        while let Some(at) = cursor {
            let loaded = file.load_index_partial(at, budget).logvol_unwrap();
            if budget < METADATA_ENTRY_SIZE as u64 {
                // Whatever the budget, at least one section is loaded.
                assert!(loaded.entries.len() <= 2);
            }
            partial.extend(loaded.entries);
            cursor = loaded.next;
            loads += 1;
        }
        partial.sort_by_segment();
        assert_eq!(partial, *file.index());
        assert_eq!(partial.entries(a).len(), 9);
        assert_eq!(partial.entries(b).len(), 6);
        if budget == u64::MAX {
            assert!(loads <= 4);
        }
    });
}

#[test]
fn cursor_past_last_section_is_rejected() {
    let storage = memory();
    session(1, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "c", &[4], PType::U8);
        write_values(file, ds, &Selection::All, &[1u8, 2, 3, 4]);
        file.flush(true).logvol_unwrap();

        let at_end = file
            .load_index_partial(IndexCursor { blob: 0, section: 1 }, 0)
            .logvol_unwrap();
        assert!(at_end.entries.is_empty());
        assert!(at_end.next.is_none());
        assert!(
            file.load_index_partial(IndexCursor { blob: 0, section: 2 }, 0)
                .is_err()
        );
    });
}

#[test]
fn budgeted_refresh_serves_reads() {
    let storage = memory();
    let options = LogVolOptions::new().with_index_budget(METADATA_ENTRY_SIZE as u64);
    let results = session(2, &storage, Mode::Create, &options, |file| {
        let ds = define(file, "b", &[2, 3], PType::I64);
        let rank = file.rank() as u64;
        for col in 0..3u64 {
            write_values(
                file,
                ds,
                &Selection::block([rank, col], [1, 1]),
                &[(rank * 10 + col) as i64],
            );
            file.flush(true).logvol_unwrap();
        }
        read_values::<i64>(file, ds, &Selection::All, 6)
    });
    for values in results {
        assert_eq!(values, vec![0, 1, 2, 10, 11, 12]);
    }
}

#[test]
fn reopen_sees_flushed_data() {
    let storage = memory();
    session(2, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "persist", &[2, 2], PType::U64);
        let rank = file.rank() as u64;
        write_values(file, ds, &Selection::block([rank, 0], [1, 2]), &[rank + 1; 2]);
        // Left staged: close flushes it.
    });

    let results = session(3, &storage, Mode::Open, &LogVolOptions::new(), |file| {
        assert_eq!(file.log_segments(), 1);
        assert_eq!(file.metadata_blobs(), 1);
        let ds = file.dataset("persist").logvol_unwrap();
        assert_eq!(file.dataset_desc(ds).logvol_unwrap().dims, vec![2, 2]);
        assert!(matches!(
            file.dataset("missing"),
            Err(LogVolError::NotFound(..))
        ));
        read_values::<u64>(file, ds, &Selection::All, 4)
    });
    for values in results {
        assert_eq!(values, vec![1, 1, 2, 2]);
    }
}

#[test]
fn reopen_file_storage() {
    let dir = tempfile::tempdir().logvol_unwrap();
    let path = dir.path().join("grid.lv");
    {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::create(&path).logvol_unwrap());
        session(2, &storage, Mode::Create, &LogVolOptions::new(), |file| {
            let ds = define(file, "grid", &[2, 5], PType::F32);
            let rank = file.rank() as u64;
            let row: Vec<f32> = (0..5).map(|i| rank as f32 * 10.0 + i as f32 * 0.5).collect();
            write_values(file, ds, &Selection::block([rank, 0], [1, 5]), &row);
        });
    }

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(&path).logvol_unwrap());
    let results = session(1, &storage, Mode::Open, &LogVolOptions::new(), |file| {
        let ds = file.dataset("grid").logvol_unwrap();
        read_values::<f32>(file, ds, &Selection::block([1, 1], [1, 3]), 3)
    });
    assert_eq!(results[0], vec![10.5, 11.0, 11.5]);
}

#[test]
fn duplicate_open_is_rejected() {
    let storage = memory();
    let registry = FileRegistry::new();
    let comm: Arc<dyn Communicator> = Arc::new(SelfComm);
    let file = LogFile::create(
        comm.clone(),
        storage.clone(),
        &registry,
        LogVolOptions::new(),
    )
    .logvol_unwrap();
    assert!(registry.is_open(storage.identity()));

    let err = LogFile::open(comm.clone(), storage.clone(), &registry, LogVolOptions::new())
        .err()
        .unwrap();
    assert!(matches!(err, LogVolError::AlreadyOpen(..)));
    assert_eq!(err.status(), -9);

    file.close().logvol_unwrap();
    assert!(!registry.is_open(storage.identity()));
    LogFile::open(comm, storage, &registry, LogVolOptions::new())
        .logvol_unwrap()
        .close()
        .logvol_unwrap();
}

#[test]
fn create_over_existing_file_fails() {
    let storage = memory();
    session(1, &storage, Mode::Create, &LogVolOptions::new(), |_| ());
    let err = LogFile::create(
        Arc::new(SelfComm),
        storage,
        &FileRegistry::new(),
        LogVolOptions::new(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, LogVolError::InvalidArgument(..)));
}

#[test]
fn open_without_summary_is_not_found() {
    let err = LogFile::open(
        Arc::new(SelfComm),
        memory(),
        &FileRegistry::new(),
        LogVolOptions::new(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, LogVolError::NotFound(..)));
}

#[test]
fn peer_failure_is_reported_everywhere() {
    let storage = memory();
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let registry = FileRegistry::new();
        let comm: Arc<dyn Communicator> = Arc::new(comm);
        // An out-of-range creator rank fails validation on every rank.
        let options = LogVolOptions::new().with_creator_rank(2);
        let err = LogFile::create(comm.clone(), storage.clone(), &registry, options)
            .err()
            .unwrap();
        assert!(matches!(err, LogVolError::InvalidArgument(..)));

        // A container already open through rank 1's registry only fails there.
        let _held = (rank == 1).then(|| registry.register(storage.identity()).logvol_unwrap());
        LogFile::create(comm, storage.clone(), &registry, LogVolOptions::new())
            .err()
            .unwrap()
    });
    assert!(matches!(results[0], LogVolError::CollectiveIO(..)));
    assert!(matches!(results[1], LogVolError::AlreadyOpen(..)));
}

#[rstest]
#[case(PType::U8, PType::I64)]
#[case(PType::I16, PType::F32)]
#[case(PType::F64, PType::I32)]
fn converts_between_memory_and_storage_types(#[case] storage_type: PType, #[case] mem: PType) {
    let storage = memory();
    let values: Vec<i32> = vec![0, 3, 7, 100, 42, 9];
    let results = session(1, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "typed", &[2, 3], storage_type);
        let mut src = vec![0u8; values.len() * mem.byte_width()];
        convert(PType::I32, &to_le_bytes(&values), mem, &mut src).logvol_unwrap();
        file.write(ds, &Selection::All, mem, &src).logvol_unwrap();
        assert_eq!(file.buffer_used(), 6 * storage_type.byte_width() as u64);

        let mut out = vec![0u8; values.len() * mem.byte_width()];
        file.read(ds, &Selection::All, mem, &mut out).logvol_unwrap();
        let mut back = vec![0u8; values.len() * 4];
        convert(mem, &out, PType::I32, &mut back).logvol_unwrap();
        from_le_bytes::<i32>(&back)
    });
    assert_eq!(results[0], values);
}

#[test]
fn unrepresentable_write_stages_nothing() {
    let storage = memory();
    session(1, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "small", &[2], PType::U8);
        let err = file
            .write(ds, &Selection::All, PType::I32, &to_le_bytes(&[1i32, 300]))
            .unwrap_err();
        assert!(matches!(err, LogVolError::InvalidArgument(..)));
        assert_eq!(file.buffer_used(), 0);
        assert_eq!(file.pending_writes(), 0);
    });
}

#[rstest]
#[case::on_flush(AllocationPolicy::OnFlush, vec![5, 6, 7])]
#[case::never(AllocationPolicy::Never, vec![0, 0, 0])]
fn deferred_allocation(#[case] policy: AllocationPolicy, #[case] expected: Vec<u32>) {
    let storage: Arc<dyn Storage> =
        Arc::new(MemoryStorage::new("memory:deferred").with_allocation_policy(policy));
    let results = session(2, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "d", &[3], PType::U32);
        if file.rank() == 0 {
            write_values(file, ds, &Selection::All, &[5u32, 6, 7]);
        }
        file.flush(true).logvol_unwrap();
        // The sequence number advances even when the generation is discarded.
        assert_eq!(file.log_segments(), 1);
        assert_eq!(file.buffer_used(), 0);
        read_values::<u32>(file, ds, &Selection::All, 3)
    });
    for values in results {
        assert_eq!(values, expected);
    }
}

#[test]
fn corrupt_metadata_is_detected() {
    let memory = Arc::new(MemoryStorage::new("memory:corrupt"));
    let storage: Arc<dyn Storage> = memory.clone();
    session(1, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "c", &[4], PType::U8);
        write_values(file, ds, &Selection::All, &[1u8, 2, 3, 4]);
    });

    let blob = storage
        .dataset(&metadata_blob_name(0))
        .logvol_unwrap()
        .and_then(|info| info.offset)
        .unwrap();
    memory.poke(blob, b"XXXX").logvol_unwrap();

    let results = session(2, &storage, Mode::Open, &LogVolOptions::new(), |file| {
        let ds = file.dataset("c").logvol_unwrap();
        let mut out = [0u8; 4];
        file.read(ds, &Selection::All, PType::U8, &mut out)
            .unwrap_err()
    });
    for err in results {
        assert!(matches!(err.root(), LogVolError::IndexCorrupt(..)));
        assert_eq!(err.status(), -7);
    }
}

#[test]
fn deferred_reads_complete_at_flush() {
    let storage = memory();
    session(2, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "t", &[2, 2], PType::I8);
        let rank = file.rank() as u64;
        write_values(file, ds, &Selection::block([rank, 0], [1, 2]), &[rank as i8 + 1; 2]);

        let ticket = file
            .read_deferred(ds, &Selection::block([1 - rank, 0], [1, 2]), PType::I8)
            .logvol_unwrap();
        assert_eq!(file.pending_reads(), 1);
        assert!(matches!(
            file.take_read(ticket),
            Err(LogVolError::InvalidArgument(..))
        ));

        file.flush(false).logvol_unwrap();
        assert_eq!(file.pending_reads(), 0);
        let got = from_le_bytes::<i8>(&file.take_read(ticket).logvol_unwrap());
        assert_eq!(got, vec![(1 - rank) as i8 + 1; 2]);
        assert!(matches!(
            file.take_read(ticket),
            Err(LogVolError::NotFound(..))
        ));
    });
}

#[test]
fn blocking_writes_flush_immediately() {
    let storage = memory();
    let options = LogVolOptions::new().with_transfer_mode(TransferMode::Blocking);
    session(2, &storage, Mode::Create, &options, |file| {
        let ds = define(file, "blocking", &[2], PType::U8);
        let rank = file.rank() as u64;
        write_values(file, ds, &Selection::block([rank], [1]), &[rank as u8]);
        assert_eq!(file.log_segments(), 1);
        assert_eq!(file.pending_writes(), 0);
        assert!(file.metadata_dirty());

        // Staged and flushed explicitly, regardless of the file's mode.
        file.write_with(
            ds,
            &Selection::All,
            PType::U8,
            &[9, 9],
            TransferMode::NonBlocking,
        )
        .logvol_unwrap();
        assert_eq!(file.log_segments(), 1);
        file.flush(false).logvol_unwrap();
        assert_eq!(file.log_segments(), 2);
    });
}

#[test]
fn invalid_read_still_joins_collective() {
    let storage = memory();
    let results = session(2, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "x", &[4], PType::U16);
        write_values(file, ds, &Selection::All, &[1u16, 2, 3, 4]);
        let mut out = vec![0u8; 4];
        let selection = match file.rank() {
            0 => Selection::block([8], [2]),
            _ => Selection::block([2], [2]),
        };
        file.read(ds, &selection, PType::U16, &mut out)
            .map(|()| from_le_bytes::<u16>(&out))
    });
    assert!(matches!(results[0], Err(LogVolError::InvalidSelection(..))));
    assert_eq!(results[1].as_ref().ok(), Some(&vec![3u16, 4]));
}

#[test]
fn define_dataset_validates_arguments() {
    let storage = memory();
    session(1, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        define(file, "ok", &[1], PType::U8);
        for dims in [&[][..], &[1; MAX_DIMS + 1][..]] {
            assert!(file.define_dataset("bad", dims, PType::U8).is_err());
        }
        assert!(file.define_dataset("ok", &[2], PType::U8).is_err());
        assert!(file.define_dataset("", &[2], PType::U8).is_err());
        assert_eq!(file.datasets().len(), 1);
    });
}

#[test]
fn points_write_and_read_in_listed_order() {
    let storage = memory();
    let results = session(1, &storage, Mode::Create, &LogVolOptions::new(), |file| {
        let ds = define(file, "p", &[3, 3], PType::I32);
        let points = Selection::Points(vec![vec![2, 2], vec![0, 1], vec![0, 2]]);
        write_values(file, ds, &points, &[7i32, 8, 9]);
        let dense = read_values::<i32>(file, ds, &Selection::All, 9);
        let back = read_values::<i32>(file, ds, &points, 3);
        (dense, back)
    });
    let (dense, back) = &results[0];
    assert_eq!(*dense, vec![0, 8, 9, 0, 0, 0, 0, 0, 7]);
    assert_eq!(*back, vec![7, 8, 9]);
}

#[test]
fn metrics_count_flushes() {
    let storage = memory();
    let metrics = logvol_metrics::LogVolMetrics::for_rank(0);
    let options = LogVolOptions::new().with_metrics(metrics.clone());
    session(1, &storage, Mode::Create, &options, |file| {
        let ds = define(file, "m", &[4], PType::U8);
        write_values(file, ds, &Selection::All, &[1u8; 4]);
        file.flush(true).logvol_unwrap();
    });
    assert_eq!(metrics.counter("logvol.flush.segments").count(), 1);
    assert_eq!(metrics.counter("logvol.flush.bytes").count(), 4);
    assert_eq!(metrics.counter("logvol.metadata.entries").count(), 1);
    assert_eq!(metrics.histogram("logvol.write.bytes").count(), 1);
}
