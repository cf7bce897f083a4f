//! Bounded fetch/decode worker pool
//!
//! Demand-loads container chunks on a dedicated tokio runtime: requests
//! flow through an unbounded channel into a worker loop that keeps at
//! most `max_concurrent` fetches in flight, and completions flow back
//! through a result channel the driver drains once per frame. Fetches
//! are never cancelled; a request that loses relevance simply completes
//! into a page that goes cold again.

use std::future::Future;
use std::pin::Pin;

use ahash::AHashSet;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::cache::pool::ObjectId;
use crate::core::{Error, Result};
use crate::format::DecodedChunk;

/// Future type produced by a [`ChunkSource`].
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<DecodedChunk>> + Send>>;

/// The streaming-decode contract: fetch and decode one container chunk.
/// Implementations cover network Range requests, local files, or tests.
pub trait ChunkSource: Send + Sync + 'static {
    fn fetch(&self, object: ObjectId, chunk: u32) -> FetchFuture;
}

/// A completed fetch.
pub struct FetchedChunk {
    pub object: ObjectId,
    pub chunk: u32,
    pub payload: DecodedChunk,
}

enum FetchOutcome {
    Done(FetchedChunk),
    Failed { object: ObjectId, chunk: u32, error: Error },
}

struct FetchRequest {
    object: ObjectId,
    chunk: u32,
}

/// Bounded pool of chunk fetchers.
pub struct FetchPool {
    request_tx: mpsc::UnboundedSender<FetchRequest>,
    result_rx: mpsc::UnboundedReceiver<FetchOutcome>,
    in_flight: AHashSet<(ObjectId, u32)>,
    #[allow(dead_code)]
    runtime: Runtime,
}

impl FetchPool {
    pub fn new(source: std::sync::Arc<dyn ChunkSource>, max_concurrent: usize) -> Self {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<FetchRequest>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<FetchOutcome>();

        let runtime = Runtime::new().expect("failed to create tokio runtime");
        runtime.spawn(async move {
            Self::worker_loop(source, max_concurrent, &mut request_rx, result_tx).await;
        });

        Self {
            request_tx,
            result_rx,
            in_flight: AHashSet::new(),
            runtime,
        }
    }

    async fn worker_loop(
        source: std::sync::Arc<dyn ChunkSource>,
        max_concurrent: usize,
        request_rx: &mut mpsc::UnboundedReceiver<FetchRequest>,
        result_tx: mpsc::UnboundedSender<FetchOutcome>,
    ) {
        use tokio::task::JoinSet;

        let mut active: JoinSet<FetchOutcome> = JoinSet::new();
        let mut pending: std::collections::VecDeque<FetchRequest> = Default::default();
        let mut closed = false;

        loop {
            tokio::select! {
                request = request_rx.recv(), if !closed => {
                    match request {
                        Some(request) => pending.push_back(request),
                        None => closed = true,
                    }
                }
                Some(result) = active.join_next(), if !active.is_empty() => {
                    match result {
                        Ok(outcome) => {
                            let _ = result_tx.send(outcome);
                        }
                        Err(e) => log::error!("fetch task panicked: {e}"),
                    }
                }
                else => {
                    if closed && pending.is_empty() && active.is_empty() {
                        break;
                    }
                }
            }

            while active.len() < max_concurrent {
                let Some(request) = pending.pop_front() else { break };
                let source = source.clone();
                active.spawn(async move {
                    let FetchRequest { object, chunk } = request;
                    match source.fetch(object, chunk).await {
                        Ok(payload) => FetchOutcome::Done(FetchedChunk { object, chunk, payload }),
                        Err(error) => FetchOutcome::Failed { object, chunk, error },
                    }
                });
            }
        }
    }

    /// Dispatch a fetch. Returns `false` if this `(object, chunk)` is
    /// already in flight.
    pub fn dispatch(&mut self, object: ObjectId, chunk: u32) -> bool {
        if !self.in_flight.insert((object, chunk)) {
            return false;
        }
        self.request_tx
            .send(FetchRequest { object, chunk })
            .expect("fetch worker alive");
        true
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, object: ObjectId, chunk: u32) -> bool {
        self.in_flight.contains(&(object, chunk))
    }

    /// Drain completed fetches (non-blocking). Failures are logged as
    /// dropped chunks; the traverser re-requests them next frame.
    pub fn poll_completed(&mut self) -> Vec<FetchedChunk> {
        let mut completed = Vec::new();
        while let Ok(outcome) = self.result_rx.try_recv() {
            match outcome {
                FetchOutcome::Done(chunk) => {
                    self.in_flight.remove(&(chunk.object, chunk.chunk));
                    completed.push(chunk);
                }
                FetchOutcome::Failed { object, chunk, error } => {
                    self.in_flight.remove(&(object, chunk));
                    log::warn!(
                        "{}",
                        Error::ChunkDecodeFailed {
                            object,
                            chunk,
                            reason: error.to_string()
                        }
                    );
                }
            }
        }
        completed
    }

    /// Block until every in-flight and queued fetch has completed, then
    /// drain. Test and teardown helper; frame code polls instead.
    pub fn drain_blocking(&mut self) -> Vec<FetchedChunk> {
        let mut completed = Vec::new();
        while !self.in_flight.is_empty() {
            match self.result_rx.blocking_recv() {
                Some(FetchOutcome::Done(chunk)) => {
                    self.in_flight.remove(&(chunk.object, chunk.chunk));
                    completed.push(chunk);
                }
                Some(FetchOutcome::Failed { object, chunk, .. }) => {
                    self.in_flight.remove(&(object, chunk));
                }
                None => break,
            }
        }
        completed
    }
}
