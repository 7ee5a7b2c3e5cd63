use core::fmt;

use proptest::collection::{size_range, vec};
use proptest::prelude::*;

const FRAME_MAXIMUM_SIZE: usize = 512;
const MAXIMUM_FRAME_COUNT: usize = 24;

/// A payload pre-split into the frames a peer would hand to the relay.
///
/// Compact `Debug` so proptest failure output stays readable.
#[derive(Clone, PartialEq, Eq)]
pub struct FramedPayload(pub Vec<Vec<u8>>);

impl fmt::Debug for FramedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FramedPayload({} frames, {} bytes)", self.0.len(), self.total_len())
    }
}

impl FramedPayload {
    pub fn total_len(&self) -> usize {
        self.0.iter().map(Vec::len).sum()
    }

    pub fn concat(&self) -> Vec<u8> {
        self.0.iter().flatten().copied().collect()
    }
}

prop_compose! {
    /// Arbitrary contents split at arbitrary points, so relaying is exercised
    /// over framings a real peer could produce.
    pub fn framed_payload()(frames in vec(any_with::<Vec<u8>>(size_range(1..FRAME_MAXIMUM_SIZE).lift()), 1..MAXIMUM_FRAME_COUNT)) -> FramedPayload {
        FramedPayload(frames)
    }
}
