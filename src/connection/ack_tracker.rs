use crate::frame_id::FrameId;
use crate::wire::ack_ranges::{encode_ranges, AckRange};

/// The number of consecutive heartbeats that acknowledge a received frame
pub const ACK_ROUNDS: usize = 3;

/// Collects the ids of received frames per heartbeat round, keeping the last [ACK_ROUNDS]
///  rounds. Every heartbeat acknowledges all of them, so a frame's acknowledgement survives the
///  loss of up to two heartbeats.
///
/// Ids are recorded every time a frame is received, including duplicates: a duplicate means
///  the sender did not get our acknowledgement, so it is sent again.
#[derive(Default, Debug)]
pub struct AckTracker {
    /// index 0 is the current round
    rounds: [Vec<u32>; ACK_ROUNDS],
}

impl AckTracker {
    pub fn record(&mut self, frame_id: FrameId) {
        self.rounds[0].push(frame_id.to_raw());
    }

    /// Returns the acknowledged ranges for a heartbeat, and starts a new round, discarding the
    ///  ids of the oldest round.
    ///
    /// NB: A connection with an extreme number of gaps can produce more ranges than fit into a
    ///  datagram. Only the first `max_ranges` are returned in that case, the rest are repaired by
    ///  retransmission.
    pub fn next_round(&mut self, max_ranges: usize) -> Vec<AckRange> {
        let mut ranges = encode_ranges(self.rounds.iter().flatten().copied());
        ranges.truncate(max_ranges);

        self.rounds.rotate_right(1);
        self.rounds[0].clear();
        ranges
    }

    pub fn clear(&mut self) {
        for round in &mut self.rounds {
            *round = Vec::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(raw: &[(u32, u32)]) -> Vec<AckRange> {
        raw.iter()
            .map(|&(start, len)| AckRange { start, len })
            .collect()
    }

    #[test]
    fn test_ids_are_acked_for_three_rounds() {
        let mut tracker = AckTracker::default();
        tracker.record(FrameId::from_raw(4));
        tracker.record(FrameId::from_raw(5));

        assert_eq!(tracker.next_round(100), ranges(&[(4, 2)]));
        tracker.record(FrameId::from_raw(9));
        assert_eq!(tracker.next_round(100), ranges(&[(4, 2), (9, 1)]));
        assert_eq!(tracker.next_round(100), ranges(&[(4, 2), (9, 1)]));
        assert_eq!(tracker.next_round(100), ranges(&[(9, 1)]));
        assert_eq!(tracker.next_round(100), vec![]);
    }

    #[test]
    fn test_duplicates_extend_ack_period() {
        let mut tracker = AckTracker::default();
        tracker.record(FrameId::from_raw(1));
        tracker.next_round(100);
        tracker.next_round(100);
        tracker.record(FrameId::from_raw(1));
        tracker.next_round(100);

        assert_eq!(tracker.next_round(100), ranges(&[(1, 1)]));
        assert_eq!(tracker.next_round(100), ranges(&[(1, 1)]));
        assert_eq!(tracker.next_round(100), vec![]);
    }

    #[test]
    fn test_max_ranges() {
        let mut tracker = AckTracker::default();
        for id in [1, 3, 5, 7] {
            tracker.record(FrameId::from_raw(id));
        }
        assert_eq!(tracker.next_round(2), ranges(&[(1, 1), (3, 1)]));
    }

    #[test]
    fn test_clear() {
        let mut tracker = AckTracker::default();
        tracker.record(FrameId::from_raw(1));
        tracker.next_round(100);
        tracker.record(FrameId::from_raw(2));
        tracker.clear();
        assert_eq!(tracker.next_round(100), vec![]);
    }
}
