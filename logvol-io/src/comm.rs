use std::sync::Arc;
use std::thread;

use logvol_error::logvol_panic;
use parking_lot::{Condvar, Mutex};

/// A fixed group of cooperating processes.
///
/// Every method is collective: all ranks of the group must call it, in the same order, the same
/// number of times. A rank that skips a call deadlocks its peers.
pub trait Communicator: Send + Sync {
    /// The rank of the calling process, in `0..size()`.
    fn rank(&self) -> usize;

    /// The number of processes in the group.
    fn size(&self) -> usize;

    /// Block until every rank has entered the barrier.
    fn barrier(&self);

    /// Gather one value from every rank, indexed by rank, on every rank.
    fn all_gather_u64(&self, value: u64) -> Vec<u64>;

    /// The value contributed by `root`.
    fn broadcast_u64(&self, root: usize, value: u64) -> u64 {
        self.all_gather_u64(value)
            .get(root)
            .copied()
            .unwrap_or_else(|| logvol_panic!("broadcast root {} out of range", root))
    }

    /// The sum of the values contributed by all ranks.
    fn all_reduce_sum_u64(&self, value: u64) -> u64 {
        self.all_gather_u64(value).iter().sum()
    }

    /// The maximum of the values contributed by all ranks.
    fn all_reduce_max_u64(&self, value: u64) -> u64 {
        self.all_gather_u64(value)
            .into_iter()
            .max()
            .unwrap_or_default()
    }

    /// The sum of the values contributed by all ranks strictly below the caller.
    fn exscan_sum_u64(&self, value: u64) -> u64 {
        let rank = self.rank();
        self.all_gather_u64(value).iter().take(rank).sum()
    }
}

impl<C: Communicator + ?Sized> Communicator for Arc<C> {
    fn rank(&self) -> usize {
        C::rank(self)
    }

    fn size(&self) -> usize {
        C::size(self)
    }

    fn barrier(&self) {
        C::barrier(self)
    }

    fn all_gather_u64(&self, value: u64) -> Vec<u64> {
        C::all_gather_u64(self, value)
    }

    fn broadcast_u64(&self, root: usize, value: u64) -> u64 {
        C::broadcast_u64(self, root, value)
    }

    fn all_reduce_sum_u64(&self, value: u64) -> u64 {
        C::all_reduce_sum_u64(self, value)
    }

    fn all_reduce_max_u64(&self, value: u64) -> u64 {
        C::all_reduce_max_u64(self, value)
    }

    fn exscan_sum_u64(&self, value: u64) -> u64 {
        C::exscan_sum_u64(self, value)
    }
}

/// The communicator of a process that cooperates with nobody.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_gather_u64(&self, value: u64) -> Vec<u64> {
        vec![value]
    }
}

/// A communicator for a group of in-process ranks, one per thread.
///
/// A rank that panics poisons the group, so that peers blocked in a collective panic too
/// instead of waiting forever.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

struct Shared {
    size: usize,
    slots: Mutex<Vec<u64>>,
    barrier: Mutex<BarrierState>,
    cvar: Condvar,
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    poisoned: bool,
}

impl ThreadComm {
    /// Create the communicators of a group of `size` ranks, indexed by rank.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "a communicator group needs at least one rank");
        let shared = Arc::new(Shared {
            size,
            slots: Mutex::new(vec![0; size]),
            barrier: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }

    /// Run `f` on `size` ranks, one thread each, and return the results indexed by rank.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(ThreadComm) -> T + Sync,
    {
        let comms = Self::group(size);
        thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    scope.spawn(move || {
                        let _guard = PoisonOnPanic(comm.shared.clone());
                        f(comm)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(value) => value,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect()
        })
    }

    fn wait(&self) {
        let shared = &self.shared;
        let mut state = shared.barrier.lock();
        if state.poisoned {
            drop(state);
            logvol_panic!(CollectiveIO: "communicator poisoned by a panicking peer");
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == shared.size {
            state.arrived = 0;
            state.generation += 1;
            shared.cvar.notify_all();
            return;
        }
        while state.generation == generation && !state.poisoned {
            shared.cvar.wait(&mut state);
        }
        if state.generation == generation {
            drop(state);
            logvol_panic!(CollectiveIO: "communicator poisoned by a panicking peer");
        }
    }
}

struct PoisonOnPanic(Arc<Shared>);

impl Drop for PoisonOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            let mut state = self.0.barrier.lock();
            state.poisoned = true;
            self.0.cvar.notify_all();
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.wait();
    }

    fn all_gather_u64(&self, value: u64) -> Vec<u64> {
        self.shared.slots.lock()[self.rank] = value;
        self.wait();
        let gathered = self.shared.slots.lock().clone();
        // Nobody may overwrite a slot until every rank has copied the gathered values out.
        self.wait();
        gathered
    }
}
