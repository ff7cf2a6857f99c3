//! Anomaly and evasion events.
//!
//! The state machine and the reassembly engine report what they observe through
//! an [`EventSink`]. Events never change control flow; the sink is a plain
//! append target shared by every worker thread, so implementations must be
//! `Send + Sync`. Events of one flow arrive in the order that flow's packets
//! were processed.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::packet::{Direction, FlowId, SeqNum};

use super::policy::OverlapTag;

/// Every distinct observation the stream layer can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A SYN without ACK was seen; informational.
    SynReceived,
    /// A segment repeated data that was already delivered or already queued.
    Retransmission,
    /// Overlapping segments disagreed and the policy discarded one copy.
    Overlap { tag: OverlapTag },
    /// A segment fell outside the receiver's window.
    OutOfWindow,
    /// A reset whose sequence number is outside the window was ignored.
    SpuriousRst,
    /// Out-of-order data exceeded its budget and was force-flushed.
    BufferExhausted,
    /// SYN after the handshake completed, carrying a different ISN.
    UnexpectedSyn,
    /// SYN+ACK acknowledged something other than the client's ISN + 1.
    HandshakeMismatch,
    /// Data sequenced beyond the sender's own FIN.
    DataAfterFin,
    /// A segment arrived for a closed session.
    DataOnClosed,
    /// Data on a flow without a handshake while one is required.
    NoHandshake,
    /// Payload from a side whose initial sequence number is not known yet.
    DataBeforeHandshake,
    /// A flush skipped over bytes that were never received.
    SequenceGap,
}

impl EventKind {
    /// Kinds that indicate an attempt to desynchronize the inspector from the
    /// protected host.
    #[must_use]
    pub const fn is_evasion(self) -> bool {
        matches!(
            self,
            EventKind::Overlap { .. }
                | EventKind::OutOfWindow
                | EventKind::SpuriousRst
                | EventKind::UnexpectedSyn
                | EventKind::HandshakeMismatch
                | EventKind::DataAfterFin
        )
    }

    #[must_use]
    pub const fn is_informational(self) -> bool {
        matches!(self, EventKind::SynReceived)
    }
}

/// The sequence range that triggered an event, plus what the receiver expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceContext {
    pub seq: SeqNum,
    pub end: SeqNum,
    pub expected: Option<SeqNum>,
}

impl SequenceContext {
    #[must_use]
    pub const fn new(seq: SeqNum, end: SeqNum, expected: Option<SeqNum>) -> Self {
        Self { seq, end, expected }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamEvent {
    pub flow: FlowId,
    pub direction: Direction,
    #[serde(flatten)]
    pub kind: EventKind,
    pub context: SequenceContext,
    /// Set when the configuration asks for evasion events to raise alerts.
    pub alert: bool,
}

/// Destination for stream events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &StreamEvent);
}

impl<T: EventSink + ?Sized> EventSink for &T {
    fn record(&self, event: &StreamEvent) {
        (**self).record(event);
    }
}

/// Writes events to the `tracing` pipeline. Informational events go out at
/// debug level, anomalies at warn, alerts at error.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &StreamEvent) {
        let kind = &event.kind;
        let flow = &event.flow;
        let seq = event.context.seq;
        let end = event.context.end;
        if event.alert {
            error!(%flow, direction = %event.direction, ?kind, %seq, %end, "Stream evasion alert");
        } else if event.kind.is_informational() {
            debug!(%flow, direction = %event.direction, ?kind, %seq, "Stream event");
        } else {
            warn!(%flow, direction = %event.direction, ?kind, %seq, %end, "Stream anomaly");
        }
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StreamEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return the recorded events.
    #[must_use]
    pub fn take(&self) -> Vec<StreamEvent> {
        core::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.kind)
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &StreamEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*event);
    }
}

/// Binds a sink to one flow and direction so emitting code only supplies the
/// kind and sequence context.
#[derive(Clone, Copy)]
pub struct TcpEventLogger<'a> {
    sink: &'a dyn EventSink,
    flow: FlowId,
    direction: Direction,
    alert_on_evasion: bool,
}

impl<'a> TcpEventLogger<'a> {
    #[must_use]
    pub fn new(sink: &'a dyn EventSink, flow: FlowId, direction: Direction) -> Self {
        Self {
            sink,
            flow,
            direction,
            alert_on_evasion: false,
        }
    }

    #[must_use]
    pub fn with_alerts(mut self, alert_on_evasion: bool) -> Self {
        self.alert_on_evasion = alert_on_evasion;
        self
    }

    /// Same sink and flow, opposite direction.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            direction: self.direction.reverse(),
            ..*self
        }
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn log(&self, kind: EventKind, context: SequenceContext) {
        self.sink.record(&StreamEvent {
            flow: self.flow,
            direction: self.direction,
            kind,
            context,
            alert: self.alert_on_evasion && kind.is_evasion(),
        });
    }
}
