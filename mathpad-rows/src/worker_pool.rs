//! Recognition worker pool
//!
//! Fixed number of async workers pulling tile tasks from one FIFO queue.
//!
//! - Bounded queue: a submission finding the queue at capacity is rejected
//!   immediately with `QueueFull`
//! - Per-task timeout: the recognition call is aborted and that task alone
//!   fails with `Timeout`
//! - Crash recovery: a worker whose recognition call panics is discarded and
//!   replaced; its task is retried once on a fresh worker, then reported as
//!   `WorkerCrash`
//! - Row cancellation: queued tasks of the row are dropped, in-flight tasks
//!   run to completion but their results are discarded (and never cached)
//!
//! Identical tile content is recognized once: finished results are cached
//! by content hash, and a submission whose hash is already queued or running
//! subscribes to that task instead of queueing another call.
//!
//! Each `process_row` call runs under its own token, a child of the row's
//! token. A failing run cancels only itself; `cancel_row` cancels every run
//! of the row.

use crate::cache::Cache;
use crate::error::{PipelineError, Result};
use crate::merger::{FragmentMerger, MergeOutcome};
use crate::models::{
    OrderedTileResult, RecognitionResult, Row, RowContent, RowId, Tile, TileImage,
    WorkerErrorKind, WorkerRequest, WorkerResponse,
};
use crate::services::{Recognizer, RecognizerError};
use crate::tiles::TileExtractor;
use futures::future::try_join_all;
use mathpad_common::config::PipelineConfig;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Worker pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub task_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for WorkerPoolConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            workers: config.worker_count.max(1),
            queue_capacity: config.queue_capacity,
            task_timeout: Duration::from_millis(config.tile_timeout_ms),
        }
    }
}

/// Queued recognition work for one tile content
struct Task {
    request: WorkerRequest,
    content_hash: String,
    attempt: u32,
}

/// A submitter waiting on a recognition task
struct Subscriber {
    tile_id: String,
    row_id: RowId,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<RecognitionResult>>,
}

impl Subscriber {
    fn cancelled(self) {
        let _ = self.reply.send(Err(PipelineError::Cancelled(self.row_id)));
    }

    /// Hand over a shared result, addressed to this subscriber's tile
    ///
    /// A subscriber whose run was cancelled gets `Cancelled` whatever the
    /// task produced.
    fn resolve(self, result: &Result<RecognitionResult>) {
        if self.cancel.is_cancelled() {
            self.cancelled();
            return;
        }
        let outcome = match result {
            Ok(result) => Ok(RecognitionResult {
                tile_id: self.tile_id,
                ..result.clone()
            }),
            Err(e) => Err(e.clone()),
        };
        let _ = self.reply.send(outcome);
    }
}

/// Subscribers of the one queued or running task for a content hash
struct InFlight {
    task_id: Uuid,
    subscribers: Vec<Subscriber>,
}

/// State shared between the pool handle and its workers
///
/// Lock order: `in_flight` before `queue`.
struct PoolState {
    queue: Mutex<VecDeque<Task>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    notify: Notify,
    row_tokens: Mutex<HashMap<RowId, CancellationToken>>,
    shutdown: CancellationToken,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    invocations: AtomicU64,
    next_worker_id: AtomicUsize,
}

impl PoolState {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn row_tokens(&self) -> MutexGuard<'_, HashMap<RowId, CancellationToken>> {
        self.row_tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a dequeued task still has someone waiting for it
    ///
    /// Drops the entry (answering every subscriber with `Cancelled`) when
    /// all of its runs were cancelled while it sat in the queue.
    fn claim(&self, task: &Task) -> bool {
        let mut in_flight = self.in_flight();
        let live = match in_flight.get(&task.content_hash) {
            Some(entry) if entry.task_id == task.request.task_id => entry
                .subscribers
                .iter()
                .any(|s| !s.cancel.is_cancelled()),
            _ => return false,
        };
        if !live {
            if let Some(entry) = in_flight.remove(&task.content_hash) {
                entry.subscribers.into_iter().for_each(Subscriber::cancelled);
            }
        }
        live
    }
}

/// Everything a worker needs; cloned into replacement workers
struct WorkerContext {
    state: Arc<PoolState>,
    recognizer: Arc<dyn Recognizer>,
    cache: Arc<Cache<RecognitionResult>>,
    task_timeout: Duration,
}

/// How one recognition attempt ended
enum Execution {
    Finished(WorkerResponse),
    Crashed(String),
}

/// Future resolving to one tile's recognition result
pub struct TaskHandle {
    rx: oneshot::Receiver<Result<RecognitionResult>>,
}

impl TaskHandle {
    fn ready(result: Result<RecognitionResult>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for TaskHandle {
    type Output = Result<RecognitionResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(PipelineError::Internal(
                    "recognition task dropped by worker pool".to_string(),
                ))
            })
        })
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: usize,
    pub running: usize,
    pub peak_running: usize,
    pub invocations: u64,
}

/// Bounded-concurrency recognition executor
///
/// Must be created inside a tokio runtime: workers are spawned immediately.
pub struct WorkerPool {
    state: Arc<PoolState>,
    context: Arc<WorkerContext>,
    config: WorkerPoolConfig,
    extractor: TileExtractor,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        extractor: TileExtractor,
        recognizer: Arc<dyn Recognizer>,
        cache: Arc<Cache<RecognitionResult>>,
    ) -> Self {
        let state = Arc::new(PoolState {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            in_flight: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            row_tokens: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            invocations: AtomicU64::new(0),
            next_worker_id: AtomicUsize::new(0),
        });

        let context = Arc::new(WorkerContext {
            state: Arc::clone(&state),
            recognizer,
            cache,
            task_timeout: config.task_timeout,
        });

        for _ in 0..config.workers {
            spawn_worker(Arc::clone(&context));
        }

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            timeout_ms = config.task_timeout.as_millis() as u64,
            "Recognition worker pool started"
        );

        Self {
            state,
            context,
            config,
            extractor,
        }
    }

    pub fn config(&self) -> WorkerPoolConfig {
        self.config
    }

    pub fn extractor(&self) -> &TileExtractor {
        &self.extractor
    }

    pub fn cache(&self) -> &Arc<Cache<RecognitionResult>> {
        &self.context.cache
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.state.queue().len(),
            running: self.state.running.load(Ordering::SeqCst),
            peak_running: self.state.peak_running.load(Ordering::SeqCst),
            invocations: self.state.invocations.load(Ordering::SeqCst),
        }
    }

    /// Fresh token for one run over a row's tiles
    fn run_token(&self, row_id: RowId) -> CancellationToken {
        self.state
            .row_tokens()
            .entry(row_id)
            .or_default()
            .child_token()
    }

    /// Submit one tile for recognition
    ///
    /// Cache hits resolve immediately without touching the queue. Fails
    /// synchronously with `QueueFull` when the queue is at capacity.
    pub fn submit(&self, tile: Tile, image: TileImage) -> Result<TaskHandle> {
        let cancel = self.run_token(tile.row_id);
        self.enqueue(tile, image, cancel)
    }

    fn enqueue(
        &self,
        tile: Tile,
        image: TileImage,
        cancel: CancellationToken,
    ) -> Result<TaskHandle> {
        if self.state.shutdown.is_cancelled() {
            return Err(PipelineError::Internal("worker pool is shut down".to_string()));
        }

        let tile_id = tile.id();
        let mut in_flight = self.state.in_flight();

        // Checked under the in-flight lock so a result landing in the cache
        // between the two lookups is never missed
        if let Some(hit) = self.context.cache.get(&tile.content_hash) {
            debug!(tile_id = %tile_id, "Recognition cache hit");
            return Ok(TaskHandle::ready(Ok(RecognitionResult {
                tile_id,
                duration_ms: 0,
                ..hit
            })));
        }

        let (reply, rx) = oneshot::channel();
        let subscriber = Subscriber {
            tile_id: tile_id.clone(),
            row_id: tile.row_id,
            cancel,
            reply,
        };

        if let Some(entry) = in_flight.get_mut(&tile.content_hash) {
            debug!(
                tile_id = %tile_id,
                task_id = %entry.task_id,
                "Joined in-flight recognition task"
            );
            entry.subscribers.push(subscriber);
            return Ok(TaskHandle { rx });
        }

        let request = WorkerRequest {
            task_id: Uuid::new_v4(),
            tile_id,
            image_data: image,
        };
        {
            let mut queue = self.state.queue();
            if queue.len() >= self.config.queue_capacity {
                warn!(
                    tile_id = %request.tile_id,
                    queued = queue.len(),
                    "Recognition queue full"
                );
                return Err(PipelineError::QueueFull(queue.len()));
            }
            debug!(
                task_id = %request.task_id,
                tile_id = %request.tile_id,
                "Queued recognition task"
            );
            in_flight.insert(
                tile.content_hash.clone(),
                InFlight {
                    task_id: request.task_id,
                    subscribers: vec![subscriber],
                },
            );
            queue.push_back(Task {
                request,
                content_hash: tile.content_hash,
                attempt: 1,
            });
        }
        drop(in_flight);
        self.state.notify.notify_one();

        Ok(TaskHandle { rx })
    }

    /// Cancel all recognition work for a row
    ///
    /// The row's submitters resolve with `Cancelled` right away. Queued tasks
    /// left with no subscriber are dropped; running ones finish but their
    /// results are discarded. Other rows are unaffected. Returns the number
    /// of queued tasks removed.
    pub fn cancel_row(&self, row_id: RowId) -> usize {
        if let Some(token) = self.state.row_tokens().remove(&row_id) {
            token.cancel();
        }

        let mut dropped = Vec::new();
        let mut detached = HashSet::new();
        let removed = {
            let mut in_flight = self.state.in_flight();
            in_flight.retain(|_, entry| {
                let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.subscribers)
                    .into_iter()
                    .partition(|s| s.row_id == row_id);
                dropped.extend(gone);
                entry.subscribers = kept;
                if entry.subscribers.is_empty() {
                    detached.insert(entry.task_id);
                    false
                } else {
                    true
                }
            });

            let mut queue = self.state.queue();
            let before = queue.len();
            queue.retain(|t| !detached.contains(&t.request.task_id));
            before - queue.len()
        };

        dropped.into_iter().for_each(Subscriber::cancelled);
        if removed > 0 {
            debug!(row_id = %row_id, removed, "Cancelled queued recognition tasks");
        }
        removed
    }

    /// Recognize a whole row: extract tiles, submit all, wait for all, merge
    ///
    /// All-or-nothing: the first unrecoverable tile failure fails the row and
    /// cancels the rest of this run. Newer runs of the same row keep going.
    pub async fn process_row(
        &self,
        row: &Row,
        content: &RowContent,
        merger: &FragmentMerger,
    ) -> Result<MergeOutcome> {
        let tiles = self.extractor.extract_tiles(row, content)?;
        if tiles.is_empty() {
            return Ok(MergeOutcome::empty());
        }

        let run = self.run_token(row.id);
        let mut pending = Vec::with_capacity(tiles.len());
        for (tile, image) in tiles {
            match self.enqueue(tile.clone(), image, run.clone()) {
                Ok(handle) => pending.push(async move {
                    handle.await.map(|result| OrderedTileResult { tile, result })
                }),
                Err(e) => {
                    run.cancel();
                    return Err(e);
                }
            }
        }

        let results = match try_join_all(pending).await {
            Ok(results) => results,
            Err(e) => {
                run.cancel();
                return Err(e);
            }
        };

        Ok(merger.merge(&results))
    }

    /// Stop all workers; pending submitters resolve with an error
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
        let mut in_flight = self.state.in_flight();
        in_flight.clear();
        self.state.queue().clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn a worker with a fresh id
fn spawn_worker(context: Arc<WorkerContext>) {
    let worker_id = context.state.next_worker_id.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(worker_loop(worker_id, context));
}

async fn next_task(state: &PoolState) -> Option<Task> {
    loop {
        let task = state.queue().pop_front();
        if task.is_some() {
            return task;
        }
        tokio::select! {
            _ = state.notify.notified() => {}
            _ = state.shutdown.cancelled() => return None,
        }
    }
}

async fn worker_loop(worker_id: usize, context: Arc<WorkerContext>) {
    debug!(worker_id, "Recognition worker started");
    let state = &context.state;

    while let Some(task) = next_task(state).await {
        if !state.claim(&task) {
            debug!(task_id = %task.request.task_id, "Skipping cancelled recognition task");
            continue;
        }

        let running = state.running.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_running.fetch_max(running, Ordering::SeqCst);
        let started = Instant::now();
        let execution = execute(&context, &task.request).await;
        state.running.fetch_sub(1, Ordering::SeqCst);

        match execution {
            Execution::Finished(response) => {
                let result = translate(&context, response, started.elapsed());
                deliver(&context, &task, result);
            }
            Execution::Crashed(message) if task.attempt == 1 => {
                warn!(
                    worker_id,
                    tile_id = %task.request.tile_id,
                    error = %message,
                    "Recognition worker crashed, retrying task on a fresh worker"
                );
                state.queue().push_front(Task {
                    attempt: task.attempt + 1,
                    ..task
                });
                spawn_worker(Arc::clone(&context));
                state.notify.notify_one();
                return;
            }
            Execution::Crashed(message) => {
                warn!(
                    worker_id,
                    tile_id = %task.request.tile_id,
                    error = %message,
                    "Recognition worker crashed on retry"
                );
                deliver(&context, &task, Err(PipelineError::WorkerCrash(message)));
                spawn_worker(Arc::clone(&context));
                return;
            }
        }
    }

    debug!(worker_id, "Recognition worker stopped");
}

/// Run one recognition call under the task timeout
///
/// The call runs on its own tokio task so a panic inside the recognizer is
/// contained and observed as a crash.
async fn execute(context: &WorkerContext, request: &WorkerRequest) -> Execution {
    context.state.invocations.fetch_add(1, Ordering::SeqCst);
    let recognizer = Arc::clone(&context.recognizer);
    let image = request.image_data.clone();
    let mut call = tokio::spawn(async move { recognizer.recognize(image).await });

    let failure = |error_kind, message: String| {
        Execution::Finished(WorkerResponse::Failure {
            task_id: request.task_id,
            tile_id: request.tile_id.clone(),
            error_kind,
            message,
        })
    };

    match tokio::time::timeout(context.task_timeout, &mut call).await {
        Err(_) => {
            call.abort();
            warn!(tile_id = %request.tile_id, "Recognition call timed out");
            failure(
                WorkerErrorKind::Timeout,
                format!("no result within {} ms", context.task_timeout.as_millis()),
            )
        }
        Ok(Ok(Ok(recognition))) => Execution::Finished(WorkerResponse::Success {
            task_id: request.task_id,
            tile_id: request.tile_id.clone(),
            fragment: recognition.fragment,
            confidence: recognition.confidence,
        }),
        Ok(Ok(Err(RecognizerError::Model(message)))) => {
            failure(WorkerErrorKind::ModelError, message)
        }
        Ok(Ok(Err(RecognizerError::MalformedOutput(message)))) => {
            failure(WorkerErrorKind::MalformedOutput, message)
        }
        Ok(Err(join_error)) => Execution::Crashed(panic_message(join_error)),
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return "recognition call aborted".to_string();
    }
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "recognition call panicked".to_string()
    }
}

/// Map a worker response onto the pipeline's result type
fn translate(
    context: &WorkerContext,
    response: WorkerResponse,
    elapsed: Duration,
) -> Result<RecognitionResult> {
    match response {
        WorkerResponse::Success {
            tile_id,
            fragment,
            confidence,
            ..
        } => Ok(RecognitionResult {
            tile_id,
            fragment,
            confidence,
            duration_ms: elapsed.as_millis() as u64,
        }),
        WorkerResponse::Failure {
            error_kind,
            message,
            ..
        } => Err(match error_kind {
            WorkerErrorKind::Timeout => {
                PipelineError::Timeout(context.task_timeout.as_millis() as u64)
            }
            WorkerErrorKind::Crash => PipelineError::WorkerCrash(message),
            WorkerErrorKind::ModelError | WorkerErrorKind::MalformedOutput => {
                PipelineError::RecognitionFailed(message)
            }
        }),
    }
}

/// Fan a task's outcome out to its subscribers
///
/// Successes are cached only while some subscriber still wants them. The
/// cache write happens before the entry leaves the in-flight map so a new
/// submission always finds one or the other.
fn deliver(context: &WorkerContext, task: &Task, result: Result<RecognitionResult>) {
    let subscribers = {
        let mut in_flight = context.state.in_flight();
        match in_flight.get(&task.content_hash) {
            Some(entry) if entry.task_id == task.request.task_id => {}
            _ => {
                debug!(
                    tile_id = %task.request.tile_id,
                    "Discarding result of cancelled recognition task"
                );
                return;
            }
        }

        let subscribers = in_flight
            .remove(&task.content_hash)
            .map(|entry| entry.subscribers)
            .unwrap_or_default();
        let live = subscribers.iter().any(|s| !s.cancel.is_cancelled());
        if let (true, Ok(result)) = (live, &result) {
            context.cache.put(task.content_hash.clone(), result.clone());
        }
        subscribers
    };

    for subscriber in subscribers {
        subscriber.resolve(&result);
    }
}
