use crate::packet::{Direction, FlowId, SeqNum};

/// A run of contiguous, policy-resolved stream bytes ready for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamChunk<'a> {
    pub flow: FlowId,
    pub direction: Direction,
    /// Sequence number of the first byte in `bytes`.
    pub start: SeqNum,
    pub bytes: &'a [u8],
}

/// Receiver of reassembled data, typically the detection engine. Chunks of one
/// direction arrive in sequence order and never repeat a byte.
pub trait StreamInspector {
    fn inspect(&mut self, chunk: &StreamChunk<'_>);
}

impl<F> StreamInspector for F
where
    F: FnMut(&StreamChunk<'_>),
{
    fn inspect(&mut self, chunk: &StreamChunk<'_>) {
        self(chunk);
    }
}

/// Discards everything; for callers that only want state tracking and events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInspector;

impl StreamInspector for NullInspector {
    fn inspect(&mut self, _chunk: &StreamChunk<'_>) {}
}
