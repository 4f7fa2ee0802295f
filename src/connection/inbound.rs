use bytes::{Bytes, BytesMut};
use tracing::trace;
use crate::frame_id::FrameId;
use crate::message_type::MessageType;
use crate::wire::message_header::{HeaderParseResult, MessageHeader};

#[derive(Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// the frame was received before, or it was consumed already
    Duplicate,
    /// the frame is too far ahead of the reassembly cursor to be buffered
    BeyondWindow,
}

#[derive(Debug, PartialEq, Eq)]
pub enum NextMessage {
    Message(MessageType, Bytes),
    /// the next message is not fully received yet
    Pending,
    /// the next message is complete, but it is not allowed through the handshake gate
    HeldBack,
    Corrupt(String),
}

/// The receiving side of the reliable stream: a window of frames starting at the reassembly
///  cursor, stored in a circular buffer indexed by `frame id % window size`.
///
/// ```ascii
///  cursor/offset         available_end
///  v                     v
///  [ ####|############ ][ ... ][ missing ][ received ][ ... ]
///  <----------------------------->
///        available_bytes
/// ```
///
/// The frames from the cursor to `available_end` are all present, and `available_bytes` is the
///  number of stream bytes they contain after `offset`. Both are maintained incrementally, so
///  checking if a message is complete does not require walking the frames.
pub struct ReceiveWindow {
    frames: Vec<Option<Bytes>>,
    window_size: u32,
    cursor: FrameId,
    offset: usize,
    available_end: FrameId,
    available_bytes: usize,
    /// frame 0 is kept after it is consumed to tell its retransmission from a new stream
    first_frame: Option<Bytes>,
}

impl ReceiveWindow {
    pub fn new(window_size: u32) -> ReceiveWindow {
        ReceiveWindow {
            frames: vec![None; window_size as usize],
            window_size,
            cursor: FrameId::ZERO,
            offset: 0,
            available_end: FrameId::ZERO,
            available_bytes: 0,
            first_frame: None,
        }
    }

    /// the first frame that is not fully consumed
    pub fn cursor(&self) -> FrameId {
        self.cursor
    }

    #[cfg(test)]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[cfg(test)]
    pub fn available_bytes(&self) -> usize {
        self.available_bytes
    }

    /// true if the frame was received before, regardless of whether it is consumed already
    pub fn has_received(&self, frame_id: FrameId) -> bool {
        match frame_id.distance_from(self.cursor) {
            None => true,
            Some(d) if d < self.window_size => self.frames[frame_id.slot(self.window_size)].is_some(),
            Some(_) => false,
        }
    }

    pub fn store(&mut self, frame_id: FrameId, stream_chunk: Bytes) -> StoreOutcome {
        let distance = match frame_id.distance_from(self.cursor) {
            None => return StoreOutcome::Duplicate,
            Some(d) => d,
        };
        if distance >= self.window_size {
            return StoreOutcome::BeyondWindow;
        }

        let slot = &mut self.frames[frame_id.slot(self.window_size)];
        if slot.is_some() {
            return StoreOutcome::Duplicate;
        }
        if frame_id == FrameId::ZERO {
            self.first_frame = Some(stream_chunk.clone());
        }
        *slot = Some(stream_chunk);

        if frame_id == self.available_end {
            self.extend_available();
            self.skip_consumed_frames();
        }
        StoreOutcome::Stored
    }

    fn extend_available(&mut self) {
        while !self.available_end.is_exhausted()
            && self.available_end.distance_from(self.cursor).map_or(false, |d| d < self.window_size)
        {
            match &self.frames[self.available_end.slot(self.window_size)] {
                Some(frame) => {
                    self.available_bytes += frame.len();
                    self.available_end = self.available_end.next();
                }
                None => break,
            }
        }
    }

    /// releases fully consumed frames, advancing the cursor past them
    fn skip_consumed_frames(&mut self) {
        while self.cursor < self.available_end {
            let slot = self.cursor.slot(self.window_size);
            let frame_len = self.frames[slot].as_ref()
                .map(|f| f.len())
                .expect("this is a bug: frames before the end of the available range must be present");
            if self.offset < frame_len {
                break;
            }
            trace!("releasing frame {}", self.cursor);
            self.frames[slot] = None;
            self.offset -= frame_len;
            self.cursor = self.cursor.next();
        }
    }

    fn consume(&mut self, len: usize) {
        assert!(len <= self.available_bytes, "this is a bug: consuming more than is available");
        self.available_bytes -= len;
        self.offset += len;
        self.skip_consumed_frames();
    }

    /// the available part of the stream as a sequence of slices
    fn available_chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let num_frames = self.available_end.distance_from(self.cursor).unwrap_or(0);
        (0..num_frames)
            .filter_map(move |i| self.frames[FrameId::from_raw(self.cursor.to_raw() + i).slot(self.window_size)].as_deref())
            .enumerate()
            .map(move |(i, frame)| if i == 0 { &frame[self.offset..] } else { frame })
    }

    fn peek_header_bytes(&self) -> ([u8; MessageHeader::MAX_SERIALIZED_LEN], usize) {
        let mut result = [0u8; MessageHeader::MAX_SERIALIZED_LEN];
        let mut len = 0;
        for chunk in self.available_chunks() {
            let n = chunk.len().min(result.len() - len);
            result[len..len+n].copy_from_slice(&chunk[..n]);
            len += n;
            if len == result.len() {
                break;
            }
        }
        (result, len)
    }

    /// Extracts the next message if it is available completely.
    ///
    /// `gate` is the only message type that may be extracted, if it is set. Messages of other
    ///  types remain in the window until the gate is lifted.
    pub fn next_message(&mut self, gate: Option<MessageType>, max_message_size: u32) -> NextMessage {
        let (header_buf, header_buf_len) = self.peek_header_bytes();
        let mut parse_buf = &header_buf[..header_buf_len];

        let header = match MessageHeader::deser(&mut parse_buf) {
            HeaderParseResult::Complete(header) => header,
            HeaderParseResult::Incomplete => {
                if header_buf_len == header_buf.len() {
                    return NextMessage::Corrupt("message length is not a valid u32 varint".to_string());
                }
                return match gate {
                    Some(gate) if header_buf_len > 0 && header_buf[0] != gate.id() => NextMessage::HeldBack,
                    _ => NextMessage::Pending,
                };
            }
            HeaderParseResult::Corrupt => return NextMessage::Corrupt("message length is not a valid u32 varint".to_string()),
        };
        let header_len = header_buf_len - parse_buf.len();

        if let Some(gate) = gate {
            if header.message_type != gate {
                return NextMessage::HeldBack;
            }
        }
        if header.payload_len > max_message_size {
            return NextMessage::Corrupt(format!("message length {} exceeds the maximum of {}", header.payload_len, max_message_size));
        }

        let payload_len = header.payload_len as usize;
        if self.available_bytes < header_len + payload_len {
            return NextMessage::Pending;
        }

        self.consume(header_len);
        let payload = self.take(payload_len);
        NextMessage::Message(header.message_type, payload)
    }

    fn take(&mut self, len: usize) -> Bytes {
        if len == 0 {
            return Bytes::new();
        }

        let first_frame = self.frames[self.cursor.slot(self.window_size)].as_ref()
            .expect("this is a bug: available bytes must be in present frames");
        let payload = if first_frame.len() - self.offset >= len {
            first_frame.slice(self.offset..self.offset+len)
        }
        else {
            let mut buf = BytesMut::with_capacity(len);
            for chunk in self.available_chunks() {
                let n = chunk.len().min(len - buf.len());
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() == len {
                    break;
                }
            }
            buf.freeze()
        };

        self.consume(len);
        payload
    }

    /// releases all buffered frames
    /// true if frame 0 was received with exactly this content
    pub fn is_first_frame(&self, stream_chunk: &[u8]) -> bool {
        self.first_frame.as_deref() == Some(stream_chunk)
    }

    pub fn clear(&mut self) {
        self.frames = Vec::new();
        self.first_frame = None;
        self.window_size = 0;
        self.available_end = self.cursor;
        self.available_bytes = 0;
    }

    pub fn is_cleared(&self) -> bool {
        self.frames.is_empty()
    }
}
