use std::{sync::mpsc, thread, time::Duration};

use mandelgrid::{
    distributed::{worker::Worker, TaskSheet},
    render::{kernel, EngineConfig, RenderEngine, Viewport},
    scheduler::SchedulerConfig,
};

/// The full local path: decompose, queue, pool execution, merge, callback
#[test]
fn end_to_end_4x4_local_pool() {
    let engine = RenderEngine::new(EngineConfig {
        local_workers: 2,
        subtasks_per_generation: Some(2),
        ..EngineConfig::default()
    })
    .unwrap();

    let (sender, receiver) = mpsc::channel();
    engine.on_generation_complete(move |generation| {
        let _ = sender.send(generation);
    });

    let viewport = Viewport {
        left: -2.0,
        right: 1.0,
        top: -1.5,
        bottom: 1.5,
    };
    let generation_id = engine.start_generation(viewport, 4, 4, 50).unwrap();

    let generation = receiver.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(generation.generation_id, generation_id);
    assert_eq!(generation.width, 4);
    assert_eq!(generation.height, 4);
    assert_eq!(generation.failed_tasks, 0);
    assert_eq!(generation.iterations.len(), 16);

    // Compare against a single-sheet computation of the same image
    let reference_sheet = TaskSheet::new(0..4, 4, viewport.mapping(4, 4), 50);
    assert_eq!(generation.iterations, kernel::compute_rows(&reference_sheet));

    // The completion callback fires exactly once
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());

    engine.shutdown();
}

/// The full remote path: sheets travel over TCP to a worker process-alike,
/// results come back through the dispatcher
#[test]
fn end_to_end_remote_worker() {
    let engine = RenderEngine::new(EngineConfig {
        local_workers: 0,
        listen_port: Some(0),
        subtasks_per_generation: Some(3),
        scheduler: SchedulerConfig {
            dispatch_timeout: Duration::from_secs(30),
            retry_ceiling: 3,
        },
        ..EngineConfig::default()
    })
    .unwrap();

    let addr = engine.worker_listen_addr().unwrap();
    let worker_thread = thread::spawn(move || {
        let mut worker = Worker::new("127.0.0.1", addr.port())?;
        worker.run()
    });

    let (sender, receiver) = mpsc::channel();
    engine.on_generation_complete(move |generation| {
        let _ = sender.send(generation);
    });

    let viewport = Viewport::default();
    engine.start_generation(viewport, 32, 24, 100).unwrap();

    let generation = receiver.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(generation.failed_tasks, 0);
    assert_eq!(generation.iterations.len(), 32 * 24);

    let reference_sheet = TaskSheet::new(0..24, 32, viewport.mapping(32, 24), 100);
    assert_eq!(generation.iterations, kernel::compute_rows(&reference_sheet));

    // Dropping the dispatcher side lets the worker exit gracefully
    engine.shutdown();
    worker_thread.join().unwrap().unwrap();
}
