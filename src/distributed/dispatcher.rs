use std::{
    io::{self, ErrorKind::WouldBlock, Read, Write},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token,
};
use slab::Slab;

use crate::{
    distributed::{
        comm_buffers::{ResultRxBuffer, TaskTxBuffer},
        TaskSheet,
    },
    errors::Result,
    scheduler::{queue::ConcurrentPriorityQueue, Scheduler, TaskId},
};

enum TransportState<E> {
    // The message has been successfully transferred
    Finished,
    // This operation would block
    Stalled,
    // An error has occurred
    Error(E),
    // No runnable task is available for this worker right now
    Idle,
}

/// Connection slot for one remote worker. At most one task is in flight per
/// connection; the next sheet is pulled only after the previous result came
/// back, which bounds dispatcher-side memory per worker.
struct RemoteWorker {
    stream: TcpStream,
    send_buffer: TaskTxBuffer,
    result_buffer: ResultRxBuffer,
    in_flight: Option<TaskId>,
}

/// Serves remote workers over TCP: accepts connections, feeds each one
/// sheets pulled from the shared work queue, and routes their results back
/// into the scheduler. Runs a non-blocking poll loop on its own thread so
/// a stalled or dead connection never holds up the rest of the pool.
pub struct Dispatcher {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: Slab<RemoteWorker>,
    queue: Arc<ConcurrentPriorityQueue<TaskSheet>>,
    scheduler: Arc<Scheduler>,
    shutdown: Arc<AtomicBool>,
}

/// Control handle for a dispatcher running on its own thread
pub struct DispatcherHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl DispatcherHandle {
    /// The address workers should connect to. Useful when the dispatcher was
    /// bound to an ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.thread.join();
    }
}

impl Dispatcher {
    const LISTENER_TOKEN: Token = Token(usize::MAX);

    /// Upper bound on one poll cycle. Between cycles the dispatcher hands
    /// freshly queued work to workers that were idle when their last
    /// writable event fired.
    const POLL_TIMEOUT: Duration = Duration::from_millis(100);

    pub fn bind(
        port: u16,
        queue: Arc<ConcurrentPriorityQueue<TaskSheet>>,
        scheduler: Arc<Scheduler>,
    ) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, Self::LISTENER_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            listener,
            local_addr,
            connections: Slab::new(),
            queue,
            scheduler,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Binds and runs a dispatcher on a dedicated thread
    pub fn spawn(
        port: u16,
        queue: Arc<ConcurrentPriorityQueue<TaskSheet>>,
        scheduler: Arc<Scheduler>,
    ) -> Result<DispatcherHandle> {
        let mut dispatcher = Self::bind(port, queue, scheduler)?;
        let local_addr = dispatcher.local_addr;
        let shutdown = Arc::clone(&dispatcher.shutdown);
        let thread = thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || {
                if let Err(e) = dispatcher.run() {
                    error!("Dispatcher failed: {e}");
                }
            })?;
        Ok(DispatcherHandle {
            local_addr,
            shutdown,
            thread,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        info!(
            "Ready to distribute work to remote workers on {}",
            self.local_addr
        );
        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(Self::POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            for event in events.iter() {
                match event.token() {
                    // Workers of the world, register!
                    Self::LISTENER_TOKEN => self.accept_workers()?,
                    Token(key) => {
                        if event.is_readable() {
                            self.handle_readable(key);
                        }
                        if event.is_writable() {
                            self.try_dispatch(key);
                        }
                    }
                }
            }
            self.dispatch_to_idle_workers();
        }
        debug!("Dispatcher shutting down, dropping worker connections");
        Ok(())
    }

    fn accept_workers(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, remote_addr)) => {
                    info!("Worker connected ({remote_addr})");
                    let entry = self.connections.vacant_entry();
                    self.poll.registry().register(
                        &mut stream,
                        Token(entry.key()),
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    entry.insert(RemoteWorker {
                        stream,
                        send_buffer: TaskTxBuffer::new(),
                        result_buffer: ResultRxBuffer::new(),
                        in_flight: None,
                    });
                }
                Err(ref e) if e.kind() == WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receives results from a worker
    fn handle_readable(&mut self, key: usize) {
        match self.read_rx_buffer(key) {
            TransportState::Finished => {
                let decoded = {
                    let worker = self
                        .connections
                        .get_mut(key)
                        .expect("This is not expected to fail");
                    let decoded = worker.result_buffer.decode_and_reset();
                    if decoded.is_ok() {
                        worker.in_flight = None;
                    }
                    decoded
                };
                match decoded {
                    Ok(results) => {
                        debug!("Worker has sent results for task {results}");
                        self.scheduler.complete(results);
                        // The worker is free again, hand it the next sheet
                        self.try_dispatch(key);
                    }
                    Err(e) => {
                        warn!("Could not decode results ({e}), removing worker from the pool");
                        self.release_worker(key);
                    }
                }
            }
            TransportState::Stalled => {}
            TransportState::Error(e) => {
                debug!("Connection is no longer valid ({e}), removing worker from the pool");
                self.release_worker(key);
            }
            // The read path never reports a lack of queued work
            TransportState::Idle => unreachable!(),
        }
    }

    /// Distribution of work
    fn try_dispatch(&mut self, key: usize) {
        match self.write_tx_buffer(key) {
            TransportState::Finished | TransportState::Stalled | TransportState::Idle => {}
            TransportState::Error(e) => {
                debug!("Connection is no longer valid ({e}), removing worker from the pool");
                self.release_worker(key);
            }
        }
    }

    /// Hands queued sheets to workers that had nothing to do when their last
    /// writable event fired
    fn dispatch_to_idle_workers(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let idle = self
            .connections
            .iter()
            .filter(|(_, worker)| worker.in_flight.is_none() && worker.send_buffer.is_ready())
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in idle {
            self.try_dispatch(key);
        }
    }

    /// Removes a worker from the event loop and terminates the connection.
    /// Its in-flight task, if any, is given back to the scheduler right away
    /// instead of waiting for the deadline to fire.
    fn release_worker(&mut self, key: usize) {
        if !self.connections.contains(key) {
            return;
        }
        let mut worker = self.connections.remove(key);
        let _ = self.poll.registry().deregister(&mut worker.stream);
        if let Some(task_id) = worker.in_flight {
            self.scheduler.reclaim(task_id);
        }
    }

    fn read_rx_buffer(&mut self, key: usize) -> TransportState<io::Error> {
        let Some(worker) = self.connections.get_mut(key) else {
            // Spurious event for an already-released worker
            return TransportState::Stalled;
        };

        // After the header has been read completely, the buffer gets enlarged
        // and remaining bytes from the message body are read to the buffer in
        // subsequent iterations
        loop {
            match worker.stream.read(worker.result_buffer.buf_mut_unfilled()) {
                Ok(0) => {
                    return TransportState::Error(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "Connection aborted",
                    ));
                }
                Ok(bytes_read) => {
                    worker.result_buffer.update_bytes_read(bytes_read);
                }
                // When errors are returned, it's guaranteed that nothing was
                // read during this iteration, so we don't need to check here
                // if we're perhaps finished
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    // Retry...
                }
                Err(ref e) if e.kind() == WouldBlock => {
                    // The underlying OS socket is empty, wait for another
                    // event to occur
                    return TransportState::Stalled;
                }
                Err(e) => {
                    return TransportState::Error(e);
                }
            }

            if worker.result_buffer.is_finished_reading_header() {
                if worker.result_buffer.decode_header().is_err() {
                    return TransportState::Error(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Could not decode header",
                    ));
                }
            } else if worker.result_buffer.is_finished() {
                return TransportState::Finished;
            }
        }
    }

    fn write_tx_buffer(&mut self, key: usize) -> TransportState<io::Error> {
        let Some(worker) = self.connections.get_mut(key) else {
            return TransportState::Stalled;
        };

        if worker.send_buffer.is_ready() {
            if worker.in_flight.is_some() {
                // Fully sent; the next sheet waits until the result is in
                return TransportState::Finished;
            }
            // Cancelled or superseded sheets surface here and are dropped
            // without ever touching the wire
            let sheet = loop {
                match self.queue.try_dequeue() {
                    Some(sheet) => {
                        if let Some(sheet) = self.scheduler.begin(sheet) {
                            break sheet;
                        }
                    }
                    None => return TransportState::Idle,
                }
            };
            debug!("Dispatching task {sheet} to a remote worker");
            worker.in_flight = Some(sheet.get_id());
            worker.send_buffer.reload(&sheet);
        }

        loop {
            match worker.stream.write(worker.send_buffer.buf_unsent()) {
                Ok(0) => {
                    return TransportState::Error(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "Connection aborted",
                    ));
                }
                Ok(bytes_sent) => {
                    worker.send_buffer.update_bytes_sent(bytes_sent);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    // Retry...
                }
                Err(ref e) if e.kind() == WouldBlock => {
                    // The socket's send buffer is full, wait for another
                    // writable event
                    return TransportState::Stalled;
                }
                Err(e) => {
                    return TransportState::Error(e);
                }
            }

            if worker.send_buffer.is_ready() {
                // The contents of the buffer have been sent successfully
                return TransportState::Finished;
            }
        }
    }
}
