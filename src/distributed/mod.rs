pub mod comm_buffers;
pub mod dispatcher;
pub mod worker;

use std::{
    fmt::{Display, Formatter},
    ops::Range,
};

use serde::{Deserialize, Serialize};

use crate::{
    errors::{Error, Result},
    render::PlaneMapping,
};

/// Number of bytes a frame header occupies on the wire: a one-byte message
/// kind tag followed by the little-endian `u32` payload length. A stream
/// reader can frame any message from these five bytes without knowing its
/// kind in advance.
pub const PROTO_LEN: usize = 5;

/// Upper bound on the payload length accepted from a peer. Anything larger
/// than this is treated as a corrupt stream rather than a buffer to allocate.
pub const MAX_PAYLOAD_LEN: u32 = 1 << 26;

/// Tags identifying the closed set of message kinds on the wire. New kinds
/// get a new tag and a `WireMessage` variant; the framing logic stays as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Task = 1,
    Result = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = crate::errors::Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::Task),
            2 => Ok(Self::Result),
            _ => Err(Error::Protocol(format!("Unknown message kind tag {tag}"))),
        }
    }
}

/// Serializable message that can be framed onto the wire. Payload fields are
/// encoded fixed-width little-endian via `bincode`, so both ends agree
/// bit-for-bit regardless of the machine they run on.
pub trait Message: Serialize + Sized {
    const KIND: MessageKind;

    /// Serializes the message into one complete frame, header included.
    fn encode(&self) -> Vec<u8> {
        let payload = bincode::serialize(self).expect("This is not expected to fail");
        let mut frame = Vec::with_capacity(PROTO_LEN + payload.len());
        frame.push(Self::KIND as u8);
        frame.extend_from_slice(&u32::to_le_bytes(
            payload.len().try_into().expect("This is not expected to fail"),
        ));
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Parses a frame header, returning the message kind and the payload length
pub(crate) fn decode_frame_header(buf: &[u8]) -> Result<(MessageKind, usize)> {
    let header: &[u8; PROTO_LEN] = buf
        .get(..PROTO_LEN)
        .and_then(|header| header.try_into().ok())
        .ok_or_else(|| Error::Protocol("Truncated frame header".to_string()))?;
    let kind = MessageKind::try_from(header[0])?;
    let payload_len = u32::from_le_bytes(
        header[1..]
            .try_into()
            .expect("This is not expected to fail"),
    );
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::Protocol(format!(
            "Payload length {payload_len} exceeds the {MAX_PAYLOAD_LEN} byte limit"
        )));
    }
    Ok((kind, payload_len as usize))
}

/// One decoded message of any registered kind
#[derive(Debug, PartialEq)]
pub enum WireMessage {
    Task(TaskSheet),
    Result(ResultSheet),
}

impl WireMessage {
    /// Decodes one complete frame. Decode dispatch over the closed set of
    /// kinds happens here and only here.
    pub fn decode_frame(frame: &[u8]) -> Result<Self> {
        let (kind, payload_len) = decode_frame_header(frame)?;
        let payload = frame
            .get(PROTO_LEN..)
            .filter(|payload| payload.len() == payload_len)
            .ok_or_else(|| Error::Protocol("Frame length does not match header".to_string()))?;
        match kind {
            MessageKind::Task => Ok(Self::Task(bincode::deserialize(payload)?)),
            MessageKind::Result => Ok(Self::Result(bincode::deserialize(payload)?)),
        }
    }
}

/// A self-contained, replayable description of one strip of the image: the
/// row range, the output width, the pixel-to-complex-plane mapping, and the
/// iteration cap. A task is a pure function of these fields, which is what
/// makes re-dispatching it to a different worker after a timeout safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSheet {
    task_id: u64,
    start_row: u32,
    end_row: u32,
    width: u32,
    mapping: PlaneMapping,
    max_iterations: u16,
}

impl Display for TaskSheet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.task_id)
    }
}

impl Message for TaskSheet {
    const KIND: MessageKind = MessageKind::Task;
}

impl TaskSheet {
    /// Creates a sheet for the half-open row range `rows`. The task id is
    /// assigned later by the scheduler, on submission.
    pub fn new(rows: Range<u32>, width: u32, mapping: PlaneMapping, max_iterations: u16) -> Self {
        Self {
            task_id: 0,
            start_row: rows.start,
            end_row: rows.end,
            width,
            mapping,
            max_iterations,
        }
    }

    pub fn get_id(&self) -> u64 {
        self.task_id
    }

    pub(crate) fn set_task_id(&mut self, task_id: u64) {
        self.task_id = task_id;
    }

    pub fn rows(&self) -> Range<u32> {
        self.start_row..self.end_row
    }

    pub fn start_row(&self) -> u32 {
        self.start_row
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn max_iterations(&self) -> u16 {
        self.max_iterations
    }

    /// Maps a pixel position to its point on the complex plane
    pub fn pixel_to_complex(&self, col: u32, row: u32) -> (f64, f64) {
        self.mapping.pixel_to_complex(col, row)
    }

    /// Number of iteration counts a result for this sheet must carry
    pub fn pixel_count(&self) -> usize {
        (self.end_row - self.start_row) as usize * self.width as usize
    }
}

/// Iteration counts for one computed strip, sent back to the dispatcher. A
/// result is meaningful only while its task id is still tracked as
/// outstanding; late arrivers are discarded there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSheet {
    task_id: u64,
    start_row: u32,
    iterations: Vec<u16>,
}

impl Display for ResultSheet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.task_id)
    }
}

impl Message for ResultSheet {
    const KIND: MessageKind = MessageKind::Result;
}

impl ResultSheet {
    pub fn new(task_id: u64, start_row: u32, iterations: Vec<u16>) -> Self {
        Self {
            task_id,
            start_row,
            iterations,
        }
    }

    pub fn get_id(&self) -> u64 {
        self.task_id
    }

    pub fn start_row(&self) -> u32 {
        self.start_row
    }

    pub fn iterations(&self) -> &[u16] {
        &self.iterations
    }

    pub fn into_iterations(self) -> Vec<u16> {
        self.iterations
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn example_sheet() -> TaskSheet {
        let mapping = PlaneMapping::new(-2.0, -1.5, 0.75, 0.75);
        let mut sheet = TaskSheet::new(2..4, 4, mapping, 50);
        sheet.set_task_id(7);
        sheet
    }

    #[test]
    fn task_sheet_round_trip() {
        let sheet = example_sheet();
        let frame = sheet.encode();
        match WireMessage::decode_frame(&frame) {
            Ok(WireMessage::Task(decoded)) => assert_eq!(decoded, sheet),
            other => panic!("unexpected decode outcome: {other:?}"),
        }
    }

    #[test]
    fn result_sheet_round_trip() {
        let result = ResultSheet::new(42, 17, vec![0, 1, 50, 65535]);
        let frame = result.encode();
        match WireMessage::decode_frame(&frame) {
            Ok(WireMessage::Result(decoded)) => assert_eq!(decoded, result),
            other => panic!("unexpected decode outcome: {other:?}"),
        }
    }

    #[test]
    fn round_trip_generated_sheets() {
        let mut rng = rand::rng();
        for _ in 0..100 {
            let start_row = rng.random_range(0..4096);
            let rows = start_row..start_row + rng.random_range(1..128);
            let mapping = PlaneMapping::new(
                rng.random::<f64>() * 4.0 - 2.0,
                rng.random::<f64>() * 3.0 - 1.5,
                rng.random::<f64>() * 1e-3,
                rng.random::<f64>() * 1e-3,
            );
            let mut sheet = TaskSheet::new(rows, rng.random_range(1..2048), mapping, rng.random());
            sheet.set_task_id(rng.random());

            match WireMessage::decode_frame(&sheet.encode()) {
                Ok(WireMessage::Task(decoded)) => assert_eq!(decoded, sheet),
                other => panic!("unexpected decode outcome: {other:?}"),
            }
        }
    }

    #[test]
    fn frame_header_layout() {
        let result = ResultSheet::new(1, 0, vec![3]);
        let frame = result.encode();
        assert_eq!(frame[0], MessageKind::Result as u8);
        let payload_len = u32::from_le_bytes(frame[1..PROTO_LEN].try_into().unwrap());
        assert_eq!(payload_len as usize, frame.len() - PROTO_LEN);
    }

    #[test]
    fn unknown_kind_tag_is_a_protocol_error() {
        let mut frame = example_sheet().encode();
        frame[0] = 99;
        assert!(matches!(
            WireMessage::decode_frame(&frame),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn length_mismatch_is_a_protocol_error() {
        let mut frame = example_sheet().encode();
        frame.pop();
        assert!(matches!(
            WireMessage::decode_frame(&frame),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn oversized_header_is_a_protocol_error() {
        let mut frame = example_sheet().encode();
        frame[1..PROTO_LEN].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            WireMessage::decode_frame(&frame),
            Err(Error::Protocol(_))
        ));
    }
}
