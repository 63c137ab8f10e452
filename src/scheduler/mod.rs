pub mod pool;
pub mod queue;

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    mem,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    distributed::{ResultSheet, TaskSheet},
    errors::Result,
    scheduler::queue::{ConcurrentPriorityQueue, Priority},
};

pub type TaskId = u64;
pub type GenerationId = u64;

/// Fault-detection tunables, supplied programmatically by the embedding
/// application
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a dispatched task may stay unanswered before it is reclaimed
    /// and re-queued. Shortening it turns slow workers into spurious retries
    /// (duplicate work, harmless but costly); lengthening it delays the
    /// detection of dead ones.
    pub dispatch_timeout: Duration,
    /// Maximum number of re-dispatches before a task is declared permanently
    /// failed. A task is therefore attempted at most `retry_ceiling + 1`
    /// times.
    pub retry_ceiling: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(5),
            retry_ceiling: 3,
        }
    }
}

/// Receives the terminal outcome of every task that is neither cancelled nor
/// superseded. Handlers are registered once, at engine construction; the
/// scheduler looks them up by task id instead of carrying per-submission
/// closures around.
pub trait ResultHandler: Send + Sync {
    fn on_task_completed(&self, generation_id: GenerationId, result: ResultSheet);
    fn on_task_failed(&self, generation_id: GenerationId, task_id: TaskId, attempts: u32);
}

enum TaskState {
    /// The sheet is owned by the work queue, waiting to be pulled
    Pending,
    /// Handed to a worker. The sheet is retained here so it can be re-queued
    /// verbatim if the worker never answers.
    InFlight { sheet: TaskSheet },
}

struct TaskRecord {
    generation_id: GenerationId,
    priority: Priority,
    /// Number of dispatches so far
    attempts: u32,
    /// Bumped on every dispatch; deadline entries carrying an older epoch
    /// are stale and ignored when they fire
    epoch: u64,
    state: TaskState,
}

struct Deadline {
    due: Instant,
    task_id: TaskId,
    epoch: u64,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.task_id == other.task_id && self.epoch == other.epoch
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.task_id.cmp(&other.task_id))
            .then_with(|| self.epoch.cmp(&other.epoch))
    }
}

struct SchedulerInner {
    outstanding: HashMap<TaskId, TaskRecord>,
    deadlines: BinaryHeap<Reverse<Deadline>>,
    next_task_id: TaskId,
    shutdown: bool,
}

/// The fault-tolerance core. Owns the outstanding-task table, arms a
/// deadline per dispatch, reclaims tasks whose worker never answered, and
/// routes results to the registered handler exactly once. The pending side
/// of a task's life is owned by the work queue; a task is never owned by
/// both at the same time.
pub struct Scheduler {
    queue: Arc<ConcurrentPriorityQueue<TaskSheet>>,
    inner: Mutex<SchedulerInner>,
    timer: Condvar,
    handler: Arc<dyn ResultHandler>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        queue: Arc<ConcurrentPriorityQueue<TaskSheet>>,
        config: SchedulerConfig,
        handler: Arc<dyn ResultHandler>,
    ) -> Self {
        Self {
            queue,
            inner: Mutex::new(SchedulerInner {
                outstanding: HashMap::new(),
                deadlines: BinaryHeap::new(),
                next_task_id: 1,
                shutdown: false,
            }),
            timer: Condvar::new(),
            handler,
            config,
        }
    }

    /// Starts the deadline monitor. It sleeps until the earliest armed
    /// deadline (or a wake-up), so CPU use is proportional to the number of
    /// in-flight tasks, not to wall-clock time.
    pub fn spawn_monitor(scheduler: &Arc<Self>) -> Result<JoinHandle<()>> {
        let scheduler_loan = Arc::clone(scheduler);
        Ok(thread::Builder::new()
            .name("timeout-monitor".into())
            .spawn(move || scheduler_loan.run_monitor())?)
    }

    /// Registers a task and places its sheet on the work queue. Returns the
    /// assigned task id immediately; the submitting thread is never blocked.
    pub fn submit(
        &self,
        generation_id: GenerationId,
        mut sheet: TaskSheet,
        priority: Priority,
    ) -> Result<TaskId> {
        let mut inner = self.inner.lock().expect("This is not expected to fail");
        let task_id = inner.next_task_id;
        inner.next_task_id += 1;
        sheet.set_task_id(task_id);
        inner.outstanding.insert(
            task_id,
            TaskRecord {
                generation_id,
                priority,
                attempts: 0,
                epoch: 0,
                state: TaskState::Pending,
            },
        );
        match self.queue.enqueue(sheet, priority) {
            Ok(()) => Ok(task_id),
            Err(e) => {
                inner.outstanding.remove(&task_id);
                Err(e)
            }
        }
    }

    /// Called by a worker that has pulled `sheet` from the queue. Transitions
    /// the task to in-flight and arms its deadline. Returns `None` when the
    /// task is no longer worth executing (cancelled, superseded, or already
    /// completed by an earlier attempt); the worker must then drop the sheet.
    pub fn begin(&self, sheet: TaskSheet) -> Option<TaskSheet> {
        let task_id = sheet.get_id();
        let mut inner = self.inner.lock().expect("This is not expected to fail");
        let Some(record) = inner.outstanding.get_mut(&task_id) else {
            debug!("Task {task_id} is no longer tracked, dropping it unexecuted");
            return None;
        };
        if !matches!(record.state, TaskState::Pending) {
            debug!("Task {task_id} is already in flight, dropping the duplicate");
            return None;
        }
        record.attempts += 1;
        record.epoch += 1;
        record.state = TaskState::InFlight {
            sheet: sheet.clone(),
        };
        let epoch = record.epoch;
        inner.deadlines.push(Reverse(Deadline {
            due: Instant::now() + self.config.dispatch_timeout,
            task_id,
            epoch,
        }));
        drop(inner);
        self.timer.notify_all();
        Some(sheet)
    }

    /// Matches an incoming result against the outstanding table. The first
    /// result for a task id wins and is forwarded to the handler; anything
    /// arriving later, including duplicates, is discarded silently. A result
    /// for a task that has meanwhile been reclaimed is still accepted: sheets
    /// are pure, so any attempt's answer is the answer.
    pub fn complete(&self, result: ResultSheet) {
        let task_id = result.get_id();
        let delivery = {
            let mut inner = self.inner.lock().expect("This is not expected to fail");
            inner.outstanding.remove(&task_id)
        };
        match delivery {
            Some(record) => self.handler.on_task_completed(record.generation_id, result),
            None => debug!("Discarding late result for task {task_id}"),
        }
    }

    /// Immediately re-queues an in-flight task whose worker is known to be
    /// gone, instead of waiting for its deadline to fire
    pub fn reclaim(&self, task_id: TaskId) {
        let failure = {
            let mut inner = self.inner.lock().expect("This is not expected to fail");
            self.requeue_locked(&mut inner, task_id)
        };
        if let Some((generation_id, task_id, attempts)) = failure {
            self.handler.on_task_failed(generation_id, task_id, attempts);
        }
    }

    /// Drops all outstanding tasks of a generation. Cancellation is lazy:
    /// queued sheets are dropped when a worker pulls them, and in-flight ones
    /// run to completion on the worker with their eventual results discarded
    /// here. No callbacks fire for cancelled tasks.
    pub fn cancel_generation(&self, generation_id: GenerationId) {
        let mut inner = self.inner.lock().expect("This is not expected to fail");
        let before = inner.outstanding.len();
        inner
            .outstanding
            .retain(|_, record| record.generation_id != generation_id);
        let cancelled = before - inner.outstanding.len();
        if cancelled > 0 {
            debug!("Cancelled {cancelled} outstanding tasks of generation {generation_id}");
        }
    }

    /// Number of tasks currently tracked (pending or in flight)
    pub fn outstanding_tasks(&self) -> usize {
        self.inner
            .lock()
            .expect("This is not expected to fail")
            .outstanding
            .len()
    }

    /// Stops the deadline monitor
    pub fn shutdown(&self) {
        self.inner
            .lock()
            .expect("This is not expected to fail")
            .shutdown = true;
        self.timer.notify_all();
    }

    fn run_monitor(&self) {
        loop {
            let mut failures = Vec::new();
            {
                let mut inner = self.inner.lock().expect("This is not expected to fail");
                if inner.shutdown {
                    return;
                }
                let now = Instant::now();
                while inner
                    .deadlines
                    .peek()
                    .is_some_and(|head| head.0.due <= now)
                {
                    let deadline = inner
                        .deadlines
                        .pop()
                        .expect("This is not expected to fail")
                        .0;
                    self.expire_locked(&mut inner, deadline, &mut failures);
                }
            }

            for (generation_id, task_id, attempts) in failures {
                self.handler.on_task_failed(generation_id, task_id, attempts);
            }

            let inner = self.inner.lock().expect("This is not expected to fail");
            if inner.shutdown {
                return;
            }
            let now = Instant::now();
            match inner.deadlines.peek().map(|head| head.0.due) {
                // Next deadline is already due, expire it on the next pass
                Some(due) if due <= now => {}
                Some(due) => {
                    let _ = self
                        .timer
                        .wait_timeout(inner, due - now)
                        .expect("This is not expected to fail");
                }
                None => {
                    drop(self.timer.wait(inner).expect("This is not expected to fail"));
                }
            }
        }
    }

    /// Handles one fired deadline. Entries whose task has completed, been
    /// cancelled, or been re-dispatched since they were armed are stale and
    /// ignored.
    fn expire_locked(
        &self,
        inner: &mut SchedulerInner,
        deadline: Deadline,
        failures: &mut Vec<(GenerationId, TaskId, u32)>,
    ) {
        let Deadline { task_id, epoch, .. } = deadline;
        let is_current = inner.outstanding.get(&task_id).is_some_and(|record| {
            record.epoch == epoch && matches!(record.state, TaskState::InFlight { .. })
        });
        if !is_current {
            return;
        }
        info!("Task {task_id} timed out");
        if let Some(failure) = self.requeue_locked(inner, task_id) {
            failures.push(failure);
        }
    }

    /// Moves an in-flight task back to pending and re-enqueues its sheet, or
    /// returns the failure to report when its retry budget is exhausted
    fn requeue_locked(
        &self,
        inner: &mut SchedulerInner,
        task_id: TaskId,
    ) -> Option<(GenerationId, TaskId, u32)> {
        match inner.outstanding.get_mut(&task_id) {
            Some(record) if matches!(record.state, TaskState::InFlight { .. }) => {
                if record.attempts <= self.config.retry_ceiling {
                    let TaskState::InFlight { sheet } =
                        mem::replace(&mut record.state, TaskState::Pending)
                    else {
                        unreachable!()
                    };
                    info!(
                        "Re-queueing task {task_id} (attempt {} of {})",
                        record.attempts,
                        self.config.retry_ceiling + 1
                    );
                    if self.queue.enqueue(sheet, record.priority).is_ok() {
                        return None;
                    }
                    error!("Could not re-queue task {task_id}, the queue is at capacity");
                } else {
                    warn!("Task {task_id} exceeded the retry ceiling, giving up on it");
                }
            }
            _ => return None,
        }
        let record = inner
            .outstanding
            .remove(&task_id)
            .expect("This is not expected to fail");
        Some((record.generation_id, task_id, record.attempts))
    }
}
