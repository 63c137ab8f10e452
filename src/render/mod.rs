pub mod kernel;

use std::{
    collections::HashMap,
    net::SocketAddr,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    distributed::{
        dispatcher::{Dispatcher, DispatcherHandle},
        ResultSheet, TaskSheet,
    },
    errors::Result,
    scheduler::{
        pool::WorkerPool,
        queue::{ConcurrentPriorityQueue, Priority},
        GenerationId, ResultHandler, Scheduler, SchedulerConfig, TaskId,
    },
};

/// Sub-tasks per local worker when `subtasks_per_generation` is not set.
/// More than one per worker keeps everyone busy while strips of uneven cost
/// drain at different speeds.
const SUBTASKS_PER_WORKER: u32 = 4;

/// Linear mapping from pixel positions to points on the complex plane.
/// Travels inside every task sheet so a worker needs no other context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaneMapping {
    start_x: f64,
    start_y: f64,
    delta_x: f64,
    delta_y: f64,
}

impl PlaneMapping {
    pub fn new(start_x: f64, start_y: f64, delta_x: f64, delta_y: f64) -> Self {
        Self {
            start_x,
            start_y,
            delta_x,
            delta_y,
        }
    }

    pub fn pixel_to_complex(&self, col: u32, row: u32) -> (f64, f64) {
        (
            self.start_x + f64::from(col) * self.delta_x,
            self.start_y + f64::from(row) * self.delta_y,
        )
    }
}

/// The rectangle of the complex plane that is rendered
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

impl Default for Viewport {
    /// The classic full view of the set
    fn default() -> Self {
        Self {
            left: -2.0,
            right: 1.0,
            top: -1.5,
            bottom: 1.5,
        }
    }
}

impl Viewport {
    pub fn span_x(&self) -> f64 {
        self.right - self.left
    }

    pub fn span_y(&self) -> f64 {
        self.bottom - self.top
    }

    /// Shifts the view by the given fractions of its current spans
    pub fn pan(&mut self, dx: f64, dy: f64) {
        let shift_x = dx * self.span_x();
        let shift_y = dy * self.span_y();
        self.left += shift_x;
        self.right += shift_x;
        self.top += shift_y;
        self.bottom += shift_y;
    }

    /// Scales the view around its center; factors above one zoom in
    pub fn zoom(&mut self, factor: f64) {
        let center_x = (self.left + self.right) / 2.0;
        let center_y = (self.top + self.bottom) / 2.0;
        let half_span_x = self.span_x() / (2.0 * factor);
        let half_span_y = self.span_y() / (2.0 * factor);
        self.left = center_x - half_span_x;
        self.right = center_x + half_span_x;
        self.top = center_y - half_span_y;
        self.bottom = center_y + half_span_y;
    }

    /// Pixel grid mapping for an image of the given size
    pub fn mapping(&self, width: u32, height: u32) -> PlaneMapping {
        PlaneMapping::new(
            self.left,
            self.top,
            self.span_x() / f64::from(width.max(1)),
            self.span_y() / f64::from(height.max(1)),
        )
    }
}

/// Splits `height` rows into at most `parts` contiguous, non-overlapping
/// ranges whose union is exactly `0..height`
pub fn partition_rows(height: u32, parts: u32) -> Vec<Range<u32>> {
    if height == 0 {
        return Vec::new();
    }
    let parts = parts.clamp(1, height);
    let base = height / parts;
    let remainder = height % parts;
    let mut ranges = Vec::with_capacity(parts as usize);
    let mut start = 0;
    for i in 0..parts {
        let len = base + u32::from(i < remainder);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// Final product of one generation, handed to the completion callback. Once
/// delivered, the engine never touches the buffer again.
#[derive(Debug)]
pub struct CompletedGeneration {
    pub generation_id: GenerationId,
    pub width: u32,
    pub height: u32,
    /// Row-major iteration counts, one per pixel
    pub iterations: Vec<u16>,
    /// Sub-tasks that permanently failed; their pixels remain zero. Whether
    /// a partial image is acceptable is up to the embedding application.
    pub failed_tasks: u32,
}

struct Generation {
    width: u32,
    height: u32,
    expected: u32,
    received: u32,
    failed: u32,
    buffer: Vec<u16>,
}

impl Generation {
    fn is_accounted_for(&self) -> bool {
        self.received + self.failed == self.expected
    }

    fn into_completed(self, generation_id: GenerationId) -> CompletedGeneration {
        CompletedGeneration {
            generation_id,
            width: self.width,
            height: self.height,
            iterations: self.buffer,
            failed_tasks: self.failed,
        }
    }
}

type CompletionCallback = Arc<dyn Fn(CompletedGeneration) + Send + Sync>;

/// Tracks unfinished generations and merges sub-results into their buffers.
/// Each sub-task owns a disjoint row range, so results may arrive and be
/// merged in any order. The completion callback fires exactly once per
/// generation; results for discarded generations fall on the floor here.
struct GenerationTable {
    active: Mutex<HashMap<GenerationId, Generation>>,
    next_id: AtomicU64,
    callback: Mutex<Option<CompletionCallback>>,
}

impl GenerationTable {
    fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            callback: Mutex::new(None),
        }
    }

    fn set_callback(&self, callback: CompletionCallback) {
        *self
            .callback
            .lock()
            .expect("This is not expected to fail") = Some(callback);
    }

    fn create(&self, width: u32, height: u32, expected: u32) -> GenerationId {
        let generation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().expect("This is not expected to fail").insert(
            generation_id,
            Generation {
                width,
                height,
                expected,
                received: 0,
                failed: 0,
                buffer: vec![0; width as usize * height as usize],
            },
        );
        generation_id
    }

    fn discard(&self, generation_id: GenerationId) {
        self.active
            .lock()
            .expect("This is not expected to fail")
            .remove(&generation_id);
    }

    /// Completes generations that were decomposed into zero sub-tasks
    fn finish_if_empty(&self, generation_id: GenerationId) {
        let finished = {
            let mut active = self.active.lock().expect("This is not expected to fail");
            match active.get(&generation_id) {
                Some(generation) if generation.is_accounted_for() => {
                    active.remove(&generation_id)
                }
                _ => None,
            }
        };
        if let Some(generation) = finished {
            self.deliver(generation.into_completed(generation_id));
        }
    }

    fn deliver(&self, completed: CompletedGeneration) {
        info!(
            "Generation {} complete ({} sub-tasks failed)",
            completed.generation_id, completed.failed_tasks
        );
        let callback = self
            .callback
            .lock()
            .expect("This is not expected to fail")
            .clone();
        match callback {
            Some(callback) => callback(completed),
            None => debug!(
                "No completion callback registered, dropping generation {}",
                completed.generation_id
            ),
        }
    }
}

impl ResultHandler for GenerationTable {
    fn on_task_completed(&self, generation_id: GenerationId, result: ResultSheet) {
        let finished = {
            let mut active = self.active.lock().expect("This is not expected to fail");
            let Some(generation) = active.get_mut(&generation_id) else {
                debug!("Result for discarded generation {generation_id}, dropping it");
                return;
            };
            let offset = result.start_row() as usize * generation.width as usize;
            let iterations = result.iterations();
            match generation.buffer.get_mut(offset..offset + iterations.len()) {
                Some(rows) => {
                    rows.copy_from_slice(iterations);
                    generation.received += 1;
                }
                None => {
                    error!(
                        "Result for task {} does not fit its generation's buffer, counting it as failed",
                        result.get_id()
                    );
                    generation.failed += 1;
                }
            }
            if generation.is_accounted_for() {
                active.remove(&generation_id)
            } else {
                None
            }
        };
        if let Some(generation) = finished {
            self.deliver(generation.into_completed(generation_id));
        }
    }

    fn on_task_failed(&self, generation_id: GenerationId, task_id: TaskId, attempts: u32) {
        warn!(
            "Task {task_id} of generation {generation_id} permanently failed after {attempts} attempts"
        );
        let finished = {
            let mut active = self.active.lock().expect("This is not expected to fail");
            let Some(generation) = active.get_mut(&generation_id) else {
                return;
            };
            generation.failed += 1;
            if generation.is_accounted_for() {
                active.remove(&generation_id)
            } else {
                None
            }
        };
        if let Some(generation) = finished {
            self.deliver(generation.into_completed(generation_id));
        }
    }
}

/// Static engine configuration, supplied programmatically by the embedding
/// application
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of local compute threads. Zero is legal when all work is meant
    /// for remote workers.
    pub local_workers: usize,
    /// TCP port to accept remote workers on; `None` keeps the engine purely
    /// local. Port 0 lets the OS pick.
    pub listen_port: Option<u16>,
    /// Number of row-range sub-tasks one generation is split into; `None`
    /// derives it from the worker count
    pub subtasks_per_generation: Option<u32>,
    /// Bound on queued sheets; `None` keeps the queue unbounded
    pub queue_capacity: Option<usize>,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            listen_port: None,
            subtasks_per_generation: None,
            queue_capacity: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

struct EngineState {
    viewport: Viewport,
    width: u32,
    height: u32,
    max_iterations: u16,
    active_generation: Option<GenerationId>,
}

/// The assembled engine: one shared work queue, a scheduler with its
/// deadline monitor, a local worker pool, and optionally a dispatcher
/// serving remote workers. Constructed once at startup and passed by
/// reference to the submission layer; there is no ambient global instance.
pub struct RenderEngine {
    queue: Arc<ConcurrentPriorityQueue<TaskSheet>>,
    scheduler: Arc<Scheduler>,
    generations: Arc<GenerationTable>,
    pool: WorkerPool,
    monitor: JoinHandle<()>,
    dispatcher: Option<DispatcherHandle>,
    state: Mutex<EngineState>,
    config: EngineConfig,
}

impl RenderEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let queue = Arc::new(match config.queue_capacity {
            Some(capacity) => ConcurrentPriorityQueue::bounded(capacity),
            None => ConcurrentPriorityQueue::new(),
        });
        let generations = Arc::new(GenerationTable::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            config.scheduler.clone(),
            Arc::clone(&generations) as Arc<dyn ResultHandler>,
        ));
        let monitor = Scheduler::spawn_monitor(&scheduler)?;
        let pool = WorkerPool::spawn(
            config.local_workers,
            Arc::clone(&queue),
            Arc::clone(&scheduler),
        )?;
        let dispatcher = config
            .listen_port
            .map(|port| Dispatcher::spawn(port, Arc::clone(&queue), Arc::clone(&scheduler)))
            .transpose()?;
        if config.local_workers == 0 && dispatcher.is_none() {
            warn!("No local workers and no remote listener; submitted work will queue until one appears");
        }
        Ok(Self {
            queue,
            scheduler,
            generations,
            pool,
            monitor,
            dispatcher,
            state: Mutex::new(EngineState {
                viewport: Viewport::default(),
                width: 1024,
                height: 768,
                max_iterations: 1000,
                active_generation: None,
            }),
            config,
        })
    }

    /// Address of the remote-worker listener, when one was configured.
    /// Useful when the engine was bound to an ephemeral port.
    pub fn worker_listen_addr(&self) -> Option<SocketAddr> {
        self.dispatcher.as_ref().map(DispatcherHandle::local_addr)
    }

    /// Registers the callback that receives every finished generation
    pub fn on_generation_complete(
        &self,
        callback: impl Fn(CompletedGeneration) + Send + Sync + 'static,
    ) {
        self.generations.set_callback(Arc::new(callback));
    }

    /// Starts rendering a fresh image, superseding and cancelling whatever
    /// generation was active before. Never blocks the calling thread.
    pub fn start_generation(
        &self,
        viewport: Viewport,
        width: u32,
        height: u32,
        max_iterations: u16,
    ) -> Result<GenerationId> {
        let mut state = self.state.lock().expect("This is not expected to fail");
        state.viewport = viewport;
        state.width = width;
        state.height = height;
        state.max_iterations = max_iterations;
        self.start_locked(&mut state)
    }

    /// Drops a generation's outstanding work and discards its buffer. Lazy:
    /// sheets already on a worker simply have their results ignored.
    pub fn cancel_generation(&self, generation_id: GenerationId) {
        {
            let mut state = self.state.lock().expect("This is not expected to fail");
            if state.active_generation == Some(generation_id) {
                state.active_generation = None;
            }
        }
        self.scheduler.cancel_generation(generation_id);
        self.generations.discard(generation_id);
    }

    /// Pans the view by the given fractions of its spans and re-renders
    pub fn move_view(&self, dx: f64, dy: f64) -> Result<GenerationId> {
        let mut state = self.state.lock().expect("This is not expected to fail");
        state.viewport.pan(dx, dy);
        self.start_locked(&mut state)
    }

    /// Scales the view around its center and re-renders
    pub fn zoom(&self, factor: f64) -> Result<GenerationId> {
        let mut state = self.state.lock().expect("This is not expected to fail");
        state.viewport.zoom(factor);
        self.start_locked(&mut state)
    }

    fn start_locked(&self, state: &mut EngineState) -> Result<GenerationId> {
        if let Some(previous) = state.active_generation.take() {
            debug!("Generation {previous} is superseded");
            self.scheduler.cancel_generation(previous);
            self.generations.discard(previous);
        }
        let ranges = partition_rows(state.height, self.subtask_count());
        let generation_id = self
            .generations
            .create(state.width, state.height, ranges.len() as u32);
        let mapping = state.viewport.mapping(state.width, state.height);
        debug!(
            "Generation {generation_id}: {} rows in {} sub-tasks",
            state.height,
            ranges.len()
        );
        for rows in ranges {
            let sheet = TaskSheet::new(rows, state.width, mapping, state.max_iterations);
            if let Err(e) = self.scheduler.submit(generation_id, sheet, Priority::High) {
                // A partially submitted generation would wait forever
                self.scheduler.cancel_generation(generation_id);
                self.generations.discard(generation_id);
                return Err(e);
            }
        }
        self.generations.finish_if_empty(generation_id);
        state.active_generation = Some(generation_id);
        Ok(generation_id)
    }

    fn subtask_count(&self) -> u32 {
        self.config.subtasks_per_generation.unwrap_or_else(|| {
            let workers = u32::try_from(self.config.local_workers.max(1)).unwrap_or(u32::MAX);
            workers.saturating_mul(SUBTASKS_PER_WORKER)
        })
    }

    /// Tears the engine down: stops accepting work, wakes blocked workers,
    /// and joins every engine thread
    pub fn shutdown(self) {
        debug!("Shutting down engine");
        self.scheduler.shutdown();
        self.queue.close();
        self.pool.join();
        let _ = self.monitor.join();
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;

    use super::*;

    #[test]
    fn partition_covers_all_rows_without_overlap() {
        let ranges = partition_rows(100, 7);
        assert_eq!(ranges.len(), 7);
        let mut next_expected = 0;
        for range in &ranges {
            assert_eq!(range.start, next_expected);
            assert!(range.end > range.start);
            next_expected = range.end;
        }
        assert_eq!(next_expected, 100);
        assert_eq!(ranges.iter().map(|range| range.len()).sum::<usize>(), 100);
    }

    #[test]
    fn partition_clamps_to_row_count() {
        let ranges = partition_rows(3, 10);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn partition_of_empty_image_is_empty() {
        assert!(partition_rows(0, 4).is_empty());
    }

    #[test]
    fn viewport_mapping_matches_image_grid() {
        let viewport = Viewport::default();
        let mapping = viewport.mapping(4, 4);
        let (cx, cy) = mapping.pixel_to_complex(0, 0);
        assert_approx_eq!(cx, -2.0);
        assert_approx_eq!(cy, -1.5);
        let (cx, cy) = mapping.pixel_to_complex(4, 4);
        assert_approx_eq!(cx, 1.0);
        assert_approx_eq!(cy, 1.5);
    }

    #[test]
    fn pan_shifts_by_span_fractions() {
        let mut viewport = Viewport::default();
        viewport.pan(0.5, -0.25);
        assert_approx_eq!(viewport.left, -0.5);
        assert_approx_eq!(viewport.right, 2.5);
        assert_approx_eq!(viewport.top, -2.25);
        assert_approx_eq!(viewport.bottom, 0.75);
    }

    #[test]
    fn zoom_keeps_the_center() {
        let mut viewport = Viewport::default();
        viewport.zoom(2.0);
        assert_approx_eq!(viewport.left, -1.25);
        assert_approx_eq!(viewport.right, 0.25);
        assert_approx_eq!(viewport.top, -0.75);
        assert_approx_eq!(viewport.bottom, 0.75);
        assert_approx_eq!(viewport.span_x(), 1.5);
    }

    #[test]
    fn generation_completes_exactly_once() {
        let table = GenerationTable::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        {
            let delivered = Arc::clone(&delivered);
            table.set_callback(Arc::new(move |completed: CompletedGeneration| {
                delivered.lock().unwrap().push(completed);
            }));
        }

        let generation_id = table.create(4, 4, 2);
        table.on_task_completed(generation_id, ResultSheet::new(1, 0, vec![1; 8]));
        assert!(delivered.lock().unwrap().is_empty());
        table.on_task_completed(generation_id, ResultSheet::new(2, 2, vec![2; 8]));

        // A duplicate of an already-merged result arrives after completion
        table.on_task_completed(generation_id, ResultSheet::new(2, 2, vec![9; 8]));

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        let completed = &delivered[0];
        assert_eq!(completed.generation_id, generation_id);
        assert_eq!(completed.failed_tasks, 0);
        let mut expected = vec![1; 8];
        expected.extend_from_slice(&[2; 8]);
        assert_eq!(completed.iterations, expected);
    }

    #[test]
    fn failed_subtasks_still_account_for_completion() {
        let table = GenerationTable::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        {
            let delivered = Arc::clone(&delivered);
            table.set_callback(Arc::new(move |completed: CompletedGeneration| {
                delivered.lock().unwrap().push(completed);
            }));
        }

        let generation_id = table.create(2, 4, 2);
        table.on_task_completed(generation_id, ResultSheet::new(1, 0, vec![5; 4]));
        table.on_task_failed(generation_id, 2, 4);

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].failed_tasks, 1);
        assert_eq!(&delivered[0].iterations[..4], &[5; 4]);
        assert_eq!(&delivered[0].iterations[4..], &[0; 4]);
    }

    #[test]
    fn oversized_result_is_counted_as_failed() {
        let table = GenerationTable::new();
        let generation_id = table.create(2, 2, 1);
        table.on_task_completed(generation_id, ResultSheet::new(1, 1, vec![1; 4]));
        // 4 counts at row offset 2 overrun the 4-pixel buffer; the
        // generation completes as a failure instead of corrupting memory
        let active = table.active.lock().unwrap();
        assert!(!active.contains_key(&generation_id));
    }

    #[test]
    fn cancelled_generation_discards_results_and_never_completes() {
        let engine = RenderEngine::new(EngineConfig {
            local_workers: 0,
            subtasks_per_generation: Some(3),
            ..EngineConfig::default()
        })
        .unwrap();

        let completed = Arc::new(Mutex::new(Vec::new()));
        {
            let completed = Arc::clone(&completed);
            engine.on_generation_complete(move |generation| {
                completed.lock().unwrap().push(generation);
            });
        }

        let generation_id = engine
            .start_generation(Viewport::default(), 6, 6, 50)
            .unwrap();
        engine.cancel_generation(generation_id);

        // Deliver every outstanding sub-task's sheet and result after the
        // cancellation; all of it must fall on the floor
        while let Some(sheet) = engine.queue.try_dequeue() {
            let task_id = sheet.get_id();
            assert!(engine.scheduler.begin(sheet).is_none());
            engine
                .scheduler
                .complete(ResultSheet::new(task_id, 0, vec![0; 12]));
        }

        assert!(completed.lock().unwrap().is_empty());
        assert_eq!(engine.scheduler.outstanding_tasks(), 0);
        engine.shutdown();
    }

    #[test]
    fn new_generation_supersedes_the_previous_one() {
        let engine = RenderEngine::new(EngineConfig {
            local_workers: 0,
            subtasks_per_generation: Some(2),
            ..EngineConfig::default()
        })
        .unwrap();

        let first = engine
            .start_generation(Viewport::default(), 4, 4, 50)
            .unwrap();
        let second = engine.move_view(0.1, 0.0).unwrap();
        assert_ne!(first, second);

        // Only the fresh generation's sub-tasks remain runnable
        let mut runnable = 0;
        while let Some(sheet) = engine.queue.try_dequeue() {
            if engine.scheduler.begin(sheet).is_some() {
                runnable += 1;
            }
        }
        assert_eq!(runnable, 2);
        engine.shutdown();
    }
}
