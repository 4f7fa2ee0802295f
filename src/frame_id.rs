use std::fmt::{Display, Formatter};

/// The sequence number of a reliable frame. Each connection numbers its frames starting at
///  zero, and ids never wrap: `u32::MAX` is never assigned, and a connection that runs out of
///  ids must be torn down.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FrameId(u32);

impl Display for FrameId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FrameId {
    pub const ZERO: FrameId = FrameId(0);

    /// the first id that is outside the usable sequence space
    pub const EXHAUSTED: FrameId = FrameId(u32::MAX);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn is_exhausted(&self) -> bool {
        *self == Self::EXHAUSTED
    }

    /// NB: callers must check for exhaustion first
    pub fn next(&self) -> FrameId {
        FrameId(
            self.0.checked_add(1)
                .expect("this is a bug: frame ids must be checked for exhaustion before incrementing")
        )
    }

    /// the number of ids from `other` up to self, `None` if `other` is after self
    pub fn distance_from(&self, other: FrameId) -> Option<u32> {
        self.0.checked_sub(other.0)
    }

    /// position in a circular buffer of the given size
    pub fn slot(&self, buffer_size: u32) -> usize {
        (self.0 % buffer_size) as usize
    }
}
