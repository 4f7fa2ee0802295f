use crate::frame_id::FrameId;

/// A contiguous range of acknowledged frame ids
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckRange {
    pub start: u32,
    pub len: u32,
}

impl AckRange {
    pub fn contains(&self, frame_id: FrameId) -> bool {
        frame_id.to_raw()
            .checked_sub(self.start)
            .map(|diff| diff < self.len)
            .unwrap_or(false)
    }
}

/// Run-length encodes a set of frame ids as ranges of consecutive ids.
///
/// The input may contain duplicates and need not be sorted. The result is sorted and its ranges
///  are disjoint and non-adjacent, so its size is bounded by the number of gaps rather than the
///  number of ids.
pub fn encode_ranges(frame_ids: impl IntoIterator<Item = u32>) -> Vec<AckRange> {
    let mut ids = frame_ids.into_iter().collect::<Vec<_>>();
    ids.sort_unstable();
    ids.dedup();

    let mut result: Vec<AckRange> = Vec::new();
    for id in ids {
        match result.last_mut() {
            Some(range) if range.start as u64 + range.len as u64 == id as u64 => {
                range.len += 1;
            }
            _ => {
                result.push(AckRange { start: id, len: 1 });
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    fn decode(ranges: &[AckRange]) -> BTreeSet<u32> {
        ranges.iter()
            .flat_map(|r| r.start..r.start+r.len)
            .collect()
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![5], vec![(5,1)])]
    #[case::contiguous(vec![3,4,5,6], vec![(3,4)])]
    #[case::unsorted(vec![6,3,5,4], vec![(3,4)])]
    #[case::duplicates(vec![3,3,4,4,4], vec![(3,2)])]
    #[case::gaps(vec![1,2,4,7,8,9], vec![(1,2), (4,1), (7,3)])]
    #[case::joining(vec![1,3,2], vec![(1,3)])]
    #[case::upper_end(vec![u32::MAX-1, u32::MAX], vec![(u32::MAX-1, 2)])]
    fn test_encode_ranges(#[case] ids: Vec<u32>, #[case] expected: Vec<(u32, u32)>) {
        let expected = expected.into_iter()
            .map(|(start, len)| AckRange { start, len })
            .collect::<Vec<_>>();
        assert_eq!(encode_ranges(ids), expected);
    }

    #[test]
    fn test_encode_decode_random_sets() {
        let mut rng = StdRng::seed_from_u64(4711);
        for _ in 0..200 {
            let base = rng.random_range(0..1_000_000u32);
            let ids = (0..rng.random_range(0..300))
                .map(|_| base + rng.random_range(0..500u32))
                .collect::<Vec<_>>();

            let ranges = encode_ranges(ids.clone());
            assert_eq!(decode(&ranges), ids.into_iter().collect::<BTreeSet<_>>());

            for pair in ranges.windows(2) {
                assert!(pair[0].start + pair[0].len < pair[1].start, "ranges must be disjoint and non-adjacent");
            }
        }
    }

    #[rstest]
    #[case::below(10, 5, 9, false)]
    #[case::start(10, 5, 10, true)]
    #[case::last(10, 5, 14, true)]
    #[case::after(10, 5, 15, false)]
    #[case::empty_range(10, 0, 10, false)]
    fn test_contains(#[case] start: u32, #[case] len: u32, #[case] id: u32, #[case] expected: bool) {
        assert_eq!(AckRange { start, len }.contains(FrameId::from_raw(id)), expected);
    }
}
