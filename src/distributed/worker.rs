use std::{
    io::{self, Read, Write},
    net::TcpStream,
};

use log::{debug, info};

use crate::{
    distributed::{comm_buffers::TaskRxBuffer, Message, ResultSheet, TaskSheet},
    errors::Result,
    render::kernel,
};

/// A remote worker node. Connects to a dispatcher, then loops: receive a
/// task sheet, compute its row range, send the result sheet back. Workers
/// hold no engine state; everything needed to compute a strip travels inside
/// the sheet itself.
pub struct Worker {
    network_buffer: TaskRxBuffer,
    connection: TcpStream,
}

impl Worker {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let connection = TcpStream::connect((host, port))?;
        info!("Connected to dispatcher at {host}:{port}");
        Ok(Self {
            network_buffer: TaskRxBuffer::new(),
            connection,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.read_task() {
                Ok(task) => {
                    debug!(
                        "Compute rows {}..{} of task {}",
                        task.rows().start,
                        task.rows().end,
                        task
                    );
                    let iterations = kernel::compute_rows_parallel(&task);
                    let results = ResultSheet::new(task.get_id(), task.start_row(), iterations);

                    // Return results
                    self.connection.write_all(&results.encode())?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!("The dispatcher has dropped the connection, shutting down gracefully");
                    return Ok(());
                }
                Err(e) => {
                    return Err(e.into());
                }
            }
        }
    }

    /// Reads a task sheet completely from the connection in a blocking way
    /// and decodes it eventually
    fn read_task(&mut self) -> io::Result<TaskSheet> {
        // Read and decode the frame header first
        if self
            .connection
            .read_exact(self.network_buffer.buf_mut_unfilled())
            .is_err()
        {
            // Apparently, the dispatcher has dropped the connection
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "Connection aborted",
            ));
        }

        // Enlarge the buffer to fit the entire message
        if self.network_buffer.decode_header().is_err() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Could not decode task header",
            ));
        }

        // Read (blocking) and decode the message body
        self.connection
            .read_exact(self.network_buffer.buf_mut_unfilled())?;
        self.network_buffer
            .decode_and_reset()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Could not decode task message"))
    }
}
