//! Asynchronous sort worker
//!
//! One dedicated worker thread runs depth sorts off the render thread.
//! The request slot holds at most one pending sort: a submit while the
//! worker is busy (or while another request waits) replaces the slot,
//! so superseded requests coalesce and exactly one further sort runs
//! with the newest readback. A minimum interval between sorts defers
//! the next idle-to-busy transition.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::{Error, Result};
use crate::sort::radix::{ordering_capacity, sort32_with, Sort32Buffers};

/// A depth-sort request.
pub struct SortRequest {
    /// Active splat count; must not exceed the readback length
    pub num_splats: usize,
    /// Per-splat depth encoding, zero = culled
    pub readback: Vec<u32>,
    /// Composition version the readback was taken from
    pub version: u64,
}

/// A completed sort.
pub struct SortResult {
    pub version: u64,
    /// Visible splat count
    pub active: u32,
    /// Permutation, padded to a full ordering row
    pub ordering: Vec<u32>,
}

#[derive(Default)]
struct WorkerState {
    pending: Option<SortRequest>,
    busy: bool,
    disposed: bool,
    completed: VecDeque<SortResult>,
    last_start: Option<Instant>,
    /// Sorts started, for observing coalescing
    started: u64,
}

struct Shared {
    state: Mutex<WorkerState>,
    work: Condvar,
}

/// Handle to the dedicated sort thread.
pub struct SortWorker {
    shared: Arc<Shared>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SortWorker {
    pub fn new(min_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState::default()),
            work: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("splat-sort".into())
            .spawn(move || Self::worker_loop(worker_shared, min_interval))
            .expect("failed to spawn sort worker");

        Self { shared, handle: Some(handle) }
    }

    fn worker_loop(shared: Arc<Shared>, min_interval: Duration) {
        let mut buffers = Sort32Buffers::default();
        loop {
            let request = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if state.disposed {
                        return;
                    }
                    if state.pending.is_some() {
                        let now = Instant::now();
                        let ready_at = state
                            .last_start
                            .map(|t| t + min_interval)
                            .unwrap_or(now);
                        if now >= ready_at {
                            let request = state.pending.take().unwrap();
                            state.busy = true;
                            state.started += 1;
                            state.last_start = Some(now);
                            break request;
                        }
                        let (next, _) = shared
                            .work
                            .wait_timeout(state, ready_at - now)
                            .unwrap();
                        state = next;
                    } else {
                        state = shared.work.wait(state).unwrap();
                    }
                }
            };

            let mut ordering = vec![0u32; ordering_capacity(request.num_splats)];
            let result = sort32_with(
                &mut buffers,
                request.num_splats,
                &request.readback,
                &mut ordering,
            );

            let mut state = shared.state.lock().unwrap();
            match result {
                Ok(active) => state.completed.push_back(SortResult {
                    version: request.version,
                    active,
                    ordering,
                }),
                Err(e) => log::warn!("sort failed: {e}"),
            }
            state.busy = false;
        }
    }

    /// Queue a sort. Replaces any not-yet-started request; the newest
    /// readback wins.
    pub fn submit(&self, request: SortRequest) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.disposed {
            return Err(Error::Disposed);
        }
        state.pending = Some(request);
        drop(state);
        self.shared.work.notify_one();
        Ok(())
    }

    /// Drain completed sorts (non-blocking).
    pub fn poll_completed(&self) -> Vec<SortResult> {
        let mut state = self.shared.state.lock().unwrap();
        state.completed.drain(..).collect()
    }

    /// Whether a sort is running or queued.
    pub fn is_busy(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.busy || state.pending.is_some()
    }

    /// Number of sorts the worker has started.
    pub fn sorts_started(&self) -> u64 {
        self.shared.state.lock().unwrap().started
    }

    fn dispose(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.disposed = true;
            state.pending = None;
        }
        self.shared.work.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SortWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_sort_runs_and_completes() {
        let worker = SortWorker::new(Duration::ZERO);
        worker
            .submit(SortRequest {
                num_splats: 4,
                readback: vec![3, 1, 4, 2],
                version: 1,
            })
            .unwrap();

        wait_for("completion", || !worker.is_busy());
        let results = worker.poll_completed();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].version, 1);
        assert_eq!(results[0].active, 4);
        assert_eq!(&results[0].ordering[..4], &[2, 0, 3, 1]);
    }

    #[test]
    fn test_superseded_requests_coalesce() {
        // Requests arriving while one runs collapse into a single
        // further sort using the newest readback
        let worker = SortWorker::new(Duration::from_millis(150));
        worker
            .submit(SortRequest { num_splats: 2, readback: vec![1, 2], version: 1 })
            .unwrap();
        wait_for("first sort start", || worker.sorts_started() >= 1);

        // The min interval keeps the worker from starting again yet
        worker
            .submit(SortRequest { num_splats: 2, readback: vec![3, 4], version: 2 })
            .unwrap();
        worker
            .submit(SortRequest { num_splats: 2, readback: vec![5, 6], version: 3 })
            .unwrap();

        wait_for("both sorts", || {
            worker.sorts_started() >= 2 && !worker.is_busy()
        });
        let results = worker.poll_completed();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].version, 1);
        assert_eq!(results[1].version, 3, "second and third coalesced");
        assert_eq!(worker.sorts_started(), 2);
    }

    #[test]
    fn test_submit_after_dispose_fails() {
        let mut worker = SortWorker::new(Duration::ZERO);
        worker.dispose();
        let result = worker.submit(SortRequest {
            num_splats: 0,
            readback: Vec::new(),
            version: 0,
        });
        assert!(matches!(result, Err(Error::Disposed)));
    }

    #[test]
    fn test_min_interval_defers_next_sort() {
        let worker = SortWorker::new(Duration::from_millis(100));
        worker
            .submit(SortRequest { num_splats: 1, readback: vec![1], version: 1 })
            .unwrap();
        wait_for("first", || worker.sorts_started() >= 1);
        let first_done = Instant::now();

        worker
            .submit(SortRequest { num_splats: 1, readback: vec![1], version: 2 })
            .unwrap();
        wait_for("second", || worker.sorts_started() >= 2);
        assert!(first_done.elapsed() >= Duration::from_millis(50));
    }
}
