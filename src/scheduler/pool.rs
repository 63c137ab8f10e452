use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, info};

use crate::{
    distributed::{ResultSheet, TaskSheet},
    errors::Result,
    render::kernel,
    scheduler::{queue::ConcurrentPriorityQueue, Scheduler},
};

/// A fixed-size set of local compute threads. Each one loops: block-dequeue
/// the highest-priority sheet, check in with the scheduler, compute, report.
/// Dequeueing only ever suspends the worker thread itself; submitters are
/// never blocked.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        num_workers: usize,
        queue: Arc<ConcurrentPriorityQueue<TaskSheet>>,
        scheduler: Arc<Scheduler>,
    ) -> Result<Self> {
        let handles = (0..num_workers)
            .map(|i| {
                let queue = Arc::clone(&queue);
                let scheduler = Arc::clone(&scheduler);
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || Self::work_loop(&queue, &scheduler))
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        info!("Started {num_workers} local workers");
        Ok(Self { handles })
    }

    fn work_loop(queue: &ConcurrentPriorityQueue<TaskSheet>, scheduler: &Scheduler) {
        while let Some(sheet) = queue.dequeue() {
            let Some(sheet) = scheduler.begin(sheet) else {
                continue;
            };
            debug!("Computing rows {:?} of task {}", sheet.rows(), sheet);
            let iterations = kernel::compute_rows(&sheet);
            scheduler.complete(ResultSheet::new(
                sheet.get_id(),
                sheet.start_row(),
                iterations,
            ));
        }
        debug!("Work queue closed, worker shutting down");
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for all workers to exit. The queue must be closed first,
    /// otherwise this blocks indefinitely.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
