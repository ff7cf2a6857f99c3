//! TCP stream reassembly and session tracking.
//!
//! Segments enter through [`SessionState::process_packet`], which builds a
//! [`SegmentDescriptor`], advances the connection phase and inserts payload
//! into the sending direction's [`ReassemblyBuffer`]. Contiguous bytes leave
//! through a [`StreamInspector`]; anomalies leave through an [`EventSink`].

mod buffer;
mod event;
mod inspect;
mod policy;
mod segment;
mod session;
mod state;

pub use buffer::{BufferLimits, BufferStats, Insertion, ReassemblyBuffer};
pub use event::{
    EventKind, EventSink, MemorySink, SequenceContext, StreamEvent, TcpEventLogger, TracingSink,
};
pub use inspect::{NullInspector, StreamChunk, StreamInspector};
pub use policy::{
    ALL_POLICIES, OverlapKind, OverlapRule, OverlapShape, OverlapTag, ReassemblyPolicy, Resolution,
    Survivor, Winner, merge, resolve,
};
pub use segment::SegmentDescriptor;
pub use session::{SegmentOutcome, SessionState, StreamTracker};
pub use state::TcpPhase;
