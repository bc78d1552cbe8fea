//! Fixed-size worker pool with a slot/free-stack dispatch discipline and a
//! `wait()` quiescence barrier.
//!
//! Each slot holds a boxed `FnOnce` rather than a fixed per-task-kind POD
//! argument struct — one allocation per dispatch, but generic over task
//! shape (see DESIGN.md for the tradeoff).

use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum SlotTask {
    Run(Task),
    Stop,
}

struct Slot {
    mutex: Mutex<Option<SlotTask>>,
    cond: Condvar,
}

struct PoolState {
    slots: Vec<Slot>,
    free: Mutex<Vec<usize>>,
    free_cond: Condvar,
    pool_size: usize,
}

impl PoolState {
    fn acquire_slot(&self) -> usize {
        let mut free = self.free.lock();
        self.free_cond.wait_while(&mut free, |f| f.is_empty());
        free.pop().expect("free-slot stack was non-empty under the lock")
    }

    fn release_slot(&self, slot: usize) {
        let mut free = self.free.lock();
        free.push(slot);
        self.free_cond.notify_one();
    }

    fn wait_quiescent(&self) {
        let mut free = self.free.lock();
        self.free_cond.wait_while(&mut free, |f| f.len() < self.pool_size);
    }
}

fn run_worker(state: &PoolState, slot: usize) {
    loop {
        let task = {
            let mut guard = state.slots[slot].mutex.lock();
            state.slots[slot].cond.wait_while(&mut guard, |t| t.is_none());
            guard.take().expect("slot task present after wait_while")
        };

        match task {
            SlotTask::Run(f) => {
                f();
                state.release_slot(slot);
            }
            SlotTask::Stop => {
                state.release_slot(slot);
                return;
            }
        }
    }
}

/// A fixed pool of `W` worker threads dispatching boxed closures.
///
/// Dispatch: the caller blocks in [`dispatch`](Self::dispatch) until a
/// free slot exists, fills it, and signals the worker. [`wait`](Self::wait)
/// blocks until the free-slot stack holds every slot — a barrier, not a
/// queue drain, since dispatch only returns after a slot has already been
/// claimed.
pub struct WorkerPool {
    state: std::sync::Arc<PoolState>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let slots = (0..num_threads).map(|_| Slot { mutex: Mutex::new(None), cond: Condvar::new() }).collect();
        let state = std::sync::Arc::new(PoolState {
            slots,
            free: Mutex::new((0..num_threads).collect()),
            free_cond: Condvar::new(),
            pool_size: num_threads,
        });

        let threads = (0..num_threads)
            .map(|i| {
                let state = std::sync::Arc::clone(&state);
                std::thread::Builder::new()
                    .name(format!("multibit-worker-{i}"))
                    .spawn(move || run_worker(&state, i))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { state, threads }
    }

    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    /// Acquires a slot (blocking if the pool is saturated) and dispatches
    /// `task` to it.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        let slot = self.state.acquire_slot();
        *self.state.slots[slot].mutex.lock() = Some(SlotTask::Run(Box::new(task)));
        self.state.slots[slot].cond.notify_one();
    }

    /// Blocks until every worker is idle.
    pub fn wait(&self) {
        self.state.wait_quiescent();
    }

    fn shutdown(&mut self) {
        self.wait();
        let claimed: Vec<usize> = std::mem::take(&mut *self.state.free.lock());
        for slot in claimed {
            *self.state.slots[slot].mutex.lock() = Some(SlotTask::Stop);
            self.state.slots[slot].cond.notify_one();
        }
        self.wait();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn dispatches_and_waits_for_all_tasks() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.dispatch(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn wait_is_a_barrier_not_a_queue_drain() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let done = Arc::clone(&done);
            pool.dispatch(move || {
                std::thread::sleep(std::time::Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn single_worker_pool_still_runs_every_task() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.dispatch(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn shutdown_on_drop_joins_all_workers() {
        let pool = WorkerPool::new(3);
        pool.dispatch(|| {});
        pool.wait();
        drop(pool);
    }
}
