use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use crate::frame_id::FrameId;
use crate::wire::ack_ranges::AckRange;
use crate::wire::frame::FrameHeader;

/// The sending side of the reliable stream: messages are appended to a buffer that is cut into
///  frames without regard for message boundaries.
pub struct OutboundStream {
    buf: BytesMut,
    capacity: usize,
    next_frame_id: FrameId,
}

impl OutboundStream {
    pub fn new(frame_payload_capacity: usize) -> OutboundStream {
        OutboundStream {
            buf: BytesMut::with_capacity(frame_payload_capacity),
            capacity: frame_payload_capacity,
            next_frame_id: FrameId::ZERO,
        }
    }

    /// Appends data to the stream, passing every frame that is filled up to `on_frame`.
    ///
    /// Fails if the connection ran out of frame ids, which is fatal for the connection.
    pub fn append(&mut self, mut data: &[u8], on_frame: &mut impl FnMut(FrameId, Bytes)) -> anyhow::Result<()> {
        while !data.is_empty() {
            let chunk_len = data.len().min(self.capacity - self.buf.len());
            self.buf.put_slice(&data[..chunk_len]);
            data = &data[chunk_len..];

            if self.buf.len() == self.capacity {
                let (frame_id, frame) = self.seal()?;
                on_frame(frame_id, frame);
            }
        }
        Ok(())
    }

    /// seals the buffered data into an under-full frame, if there is any
    pub fn flush(&mut self) -> anyhow::Result<Option<(FrameId, Bytes)>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        self.seal().map(Some)
    }

    fn seal(&mut self) -> anyhow::Result<(FrameId, Bytes)> {
        if self.next_frame_id.is_exhausted() {
            bail!("frame ids are exhausted");
        }
        let frame_id = self.next_frame_id;
        self.next_frame_id = frame_id.next();

        let frame = FrameHeader::frame(frame_id, &self.buf);
        self.buf.clear();
        Ok((frame_id, frame))
    }

    #[cfg(test)]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    #[cfg(test)]
    pub fn next_frame_id(&self) -> FrameId {
        self.next_frame_id
    }

    pub fn clear(&mut self) {
        self.buf = BytesMut::new();
    }

    #[cfg(test)]
    pub fn set_next_frame_id(&mut self, frame_id: FrameId) {
        self.next_frame_id = frame_id;
    }
}

/// A frame that was sent, but not acknowledged by the peer yet
#[derive(Debug, Clone)]
pub struct UnconfirmedFrame {
    pub frame_id: FrameId,
    /// the complete datagram, ready to be re-sent
    pub datagram: Bytes,
    /// the local heartbeat round when the frame was last sent
    pub round_sent: u32,
}

/// Unconfirmed frames, ordered by id
#[derive(Default, Debug)]
pub struct UnconfirmedFrames {
    frames: Vec<UnconfirmedFrame>,
}

impl UnconfirmedFrames {
    pub fn push(&mut self, frame_id: FrameId, datagram: Bytes, round_sent: u32) {
        self.frames.push(UnconfirmedFrame {
            frame_id,
            datagram,
            round_sent,
        });
    }

    /// Removes all frames covered by the acknowledged ranges, returning the number of removed
    ///  frames. Ranges must be sorted by start, as the wire format prescribes; unsorted ranges
    ///  from a misbehaving peer can only cause frames to be re-sent.
    pub fn acknowledge(&mut self, acked: &[AckRange]) -> usize {
        if acked.is_empty() {
            return 0;
        }
        let len_before = self.frames.len();
        self.frames.retain(|frame| !is_acked(acked, frame.frame_id));
        len_before - self.frames.len()
    }

    /// Calls `resend` for every frame that was sent at least `resend_after_rounds` rounds before
    ///  `remote_seen_round`, and marks it as sent in `current_round`.
    pub fn resend_overdue(&mut self, remote_seen_round: u32, current_round: u32, resend_after_rounds: u32, mut resend: impl FnMut(&UnconfirmedFrame)) -> usize {
        let mut num_resent = 0;
        for frame in &mut self.frames {
            // signed difference, so a peer that has not seen the frame's round yet never triggers a resend
            let age = remote_seen_round.wrapping_sub(frame.round_sent) as i32;
            if age >= resend_after_rounds as i32 {
                resend(frame);
                frame.round_sent = current_round;
                num_resent += 1;
            }
        }
        num_resent
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &UnconfirmedFrame> {
        self.frames.iter()
    }

    pub fn clear(&mut self) {
        self.frames = Vec::new();
    }
}

fn is_acked(acked: &[AckRange], frame_id: FrameId) -> bool {
    let num_starting_before = acked.partition_point(|r| r.start <= frame_id.to_raw());
    num_starting_before > 0 && acked[num_starting_before - 1].contains(frame_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn collect(stream: &mut OutboundStream, data: &[u8]) -> Vec<(FrameId, Bytes)> {
        let mut frames = Vec::new();
        stream.append(data, &mut |id, frame| frames.push((id, frame))).unwrap();
        frames
    }

    #[test]
    fn test_append_seals_full_frames() {
        let mut stream = OutboundStream::new(4);

        assert!(collect(&mut stream, &[1, 2, 3]).is_empty());
        assert_eq!(stream.buffered_len(), 3);

        let frames = collect(&mut stream, &[4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frames, vec![
            (FrameId::from_raw(0), Bytes::from_static(&[0xFF, 0,0,0,0, 1, 2, 3, 4])),
            (FrameId::from_raw(1), Bytes::from_static(&[0xFF, 0,0,0,1, 5, 6, 7, 8])),
        ]);
        assert_eq!(stream.buffered_len(), 2);

        assert_eq!(stream.flush().unwrap(), Some((FrameId::from_raw(2), Bytes::from_static(&[0xFF, 0,0,0,2, 9, 10]))));
        assert_eq!(stream.flush().unwrap(), None);
        assert_eq!(stream.next_frame_id(), FrameId::from_raw(3));
    }

    #[test]
    fn test_exhausted() {
        let mut stream = OutboundStream::new(4);
        stream.set_next_frame_id(FrameId::from_raw(u32::MAX - 1));

        let frames = collect(&mut stream, &[1, 2, 3, 4]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, FrameId::from_raw(u32::MAX - 1));

        assert!(stream.append(&[1, 2, 3, 4], &mut |_, _| {}).is_err());
        assert!(stream.flush().is_err());
    }

    fn unconfirmed(ids: &[u32]) -> UnconfirmedFrames {
        let mut result = UnconfirmedFrames::default();
        for &id in ids {
            result.push(FrameId::from_raw(id), Bytes::new(), 1);
        }
        result
    }

    #[rstest]
    #[case::none(vec![], vec![1, 2, 3])]
    #[case::all(vec![(1, 3)], vec![])]
    #[case::first(vec![(0, 2)], vec![2, 3])]
    #[case::gaps(vec![(1, 1), (3, 5)], vec![2])]
    #[case::unrelated(vec![(10, 5)], vec![1, 2, 3])]
    fn test_acknowledge(#[case] acked: Vec<(u32, u32)>, #[case] expected_remaining: Vec<u32>) {
        let acked = acked.into_iter()
            .map(|(start, len)| AckRange { start, len })
            .collect::<Vec<_>>();

        let mut frames = unconfirmed(&[1, 2, 3]);
        frames.acknowledge(&acked);
        assert_eq!(frames.iter().map(|f| f.frame_id.to_raw()).collect::<Vec<_>>(), expected_remaining);

        // applying the same acknowledgement again is harmless
        assert_eq!(frames.acknowledge(&acked), 0);
        assert_eq!(frames.iter().map(|f| f.frame_id.to_raw()).collect::<Vec<_>>(), expected_remaining);
    }

    #[rstest]
    #[case::not_yet_seen(5, 10, 9, false)]
    #[case::one_round(5, 10, 11, false)]
    #[case::two_rounds(5, 10, 12, true)]
    #[case::many_rounds(5, 10, 100, true)]
    #[case::wrapped(5, u32::MAX, 1, true)]
    fn test_resend_overdue(#[case] frame_id: u32, #[case] round_sent: u32, #[case] remote_seen_round: u32, #[case] expected_resend: bool) {
        let mut frames = UnconfirmedFrames::default();
        frames.push(FrameId::from_raw(frame_id), Bytes::from_static(&[1, 2, 3]), round_sent);

        let mut resent = Vec::new();
        let num_resent = frames.resend_overdue(remote_seen_round, 77, 2, |f| resent.push(f.datagram.clone()));

        if expected_resend {
            assert_eq!(num_resent, 1);
            assert_eq!(resent, vec![Bytes::from_static(&[1, 2, 3])]);
            assert_eq!(frames.iter().next().unwrap().round_sent, 77);
        }
        else {
            assert_eq!(num_resent, 0);
            assert!(resent.is_empty());
            assert_eq!(frames.iter().next().unwrap().round_sent, round_sent);
        }
    }
}
