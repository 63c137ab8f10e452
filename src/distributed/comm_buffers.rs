use std::iter;

use crate::{
    distributed::{decode_frame_header, Message, ResultSheet, TaskSheet, WireMessage, PROTO_LEN},
    errors::{Error, Result},
};

/// Reassembles task frames on the worker side. The header is read into the
/// initial `PROTO_LEN` bytes; once decoded, the buffer is enlarged and the
/// remaining bytes of the message body are read into the tail.
#[derive(Debug)]
pub struct TaskRxBuffer {
    pub expected_size: usize,
    pub buf: Vec<u8>,
}

impl TaskRxBuffer {
    pub fn new() -> Self {
        Self {
            buf: vec![0; PROTO_LEN],
            expected_size: PROTO_LEN,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.buf.extend(iter::repeat(0).take(PROTO_LEN));
        self.expected_size = PROTO_LEN;
    }

    pub fn buf_mut_unfilled(&mut self) -> &mut [u8] {
        if self.expected_size > PROTO_LEN {
            &mut self.buf[PROTO_LEN..]
        } else {
            &mut self.buf[..PROTO_LEN]
        }
    }

    pub fn decode_and_reset(&mut self) -> Result<TaskSheet> {
        let out = WireMessage::decode_frame(&self.buf)?;
        self.reset();
        match out {
            WireMessage::Task(task_sheet) => Ok(task_sheet),
            _ => Err(Error::Protocol("Expected a task message".to_string())),
        }
    }

    pub fn decode_header(&mut self) -> Result<()> {
        let (_kind, payload_len) = decode_frame_header(&self.buf)?;
        if payload_len == 0 {
            return Err(Error::Protocol("Empty message payload".to_string()));
        }
        self.expected_size = PROTO_LEN + payload_len;
        self.buf.extend(iter::repeat(0).take(payload_len));
        Ok(())
    }
}

/// Reassembles result frames on the dispatcher side. Unlike `TaskRxBuffer`,
/// reads are non-blocking and may deliver any prefix of the message, so the
/// number of bytes read so far is tracked explicitly.
#[derive(Debug)]
pub struct ResultRxBuffer {
    pub expected_size: usize,
    pub buf: Vec<u8>,
    pub already_read: usize,
}

impl ResultRxBuffer {
    pub fn new() -> Self {
        Self {
            buf: vec![0; PROTO_LEN],
            expected_size: PROTO_LEN,
            already_read: 0,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.buf.extend(iter::repeat(0).take(PROTO_LEN));
        self.expected_size = PROTO_LEN;
        self.already_read = 0;
    }

    pub fn buf_mut_unfilled(&mut self) -> &mut [u8] {
        &mut self.buf[self.already_read..]
    }

    pub fn decode_and_reset(&mut self) -> Result<ResultSheet> {
        let out = WireMessage::decode_frame(&self.buf)?;
        self.reset();
        match out {
            WireMessage::Result(result_sheet) => Ok(result_sheet),
            _ => Err(Error::Protocol("Expected a result message".to_string())),
        }
    }

    pub fn decode_header(&mut self) -> Result<()> {
        let (_kind, payload_len) = decode_frame_header(&self.buf)?;
        if payload_len == 0 {
            return Err(Error::Protocol("Empty message payload".to_string()));
        }
        self.expected_size = PROTO_LEN + payload_len;
        self.buf.extend(iter::repeat(0).take(payload_len));
        Ok(())
    }

    pub fn is_finished_reading_header(&self) -> bool {
        self.already_read == PROTO_LEN
    }

    pub fn is_finished(&self) -> bool {
        self.expected_size > PROTO_LEN && self.already_read == self.expected_size
    }

    pub fn update_bytes_read(&mut self, bytes_read: usize) {
        self.already_read += bytes_read;
    }
}

/// Holds one encoded task frame while it is being pushed into a non-blocking
/// socket, tracking how much of it has been accepted so far
pub struct TaskTxBuffer {
    bytes_sent: usize,
    buf: Vec<u8>,
}

impl TaskTxBuffer {
    pub fn new() -> Self {
        Self {
            bytes_sent: 0,
            buf: Vec::new(),
        }
    }

    pub fn reload(&mut self, task_sheet: &TaskSheet) {
        self.bytes_sent = 0;
        self.buf = task_sheet.encode();
    }

    pub fn update_bytes_sent(&mut self, bytes_sent: usize) {
        self.bytes_sent += bytes_sent;
    }

    /// Is the buffer ready to be used?
    pub fn is_ready(&self) -> bool {
        self.bytes_sent == self.buf.len()
    }

    pub fn buf_unsent(&self) -> &[u8] {
        &self.buf[self.bytes_sent..]
    }
}
