//! Per-flow TCP session tracking.
//!
//! A [`SessionState`] follows one connection through its phases, validates
//! each segment against the receiver's window, and feeds accepted payload into
//! the sender's [`ReassemblyBuffer`]. Phases are reported from the listening
//! endpoint's point of view; the client is whichever side sent the SYN (or,
//! when the handshake was missed, the first side seen).
//!
//! A session is owned by exactly one worker thread; nothing here locks.

use core::time::Duration;

use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::ha::{FlowHaState, HaClient, SessionSnapshot, TrackerSnapshot};
use crate::packet::{Direction, FlowId, SeqNum, TcpPacket};

use super::buffer::{BufferStats, ReassemblyBuffer};
use super::event::{EventKind, EventSink, TcpEventLogger};
use super::inspect::{StreamChunk, StreamInspector};
use super::segment::SegmentDescriptor;
use super::state::TcpPhase;

/// What one endpoint has told us about itself, plus the buffer holding the
/// bytes it sent.
#[derive(Debug, Clone)]
pub struct StreamTracker {
    isn: Option<SeqNum>,
    mss: Option<u16>,
    window_scale: Option<u8>,
    window: Option<u16>,
    timestamp: u32,
    fin_seq: Option<SeqNum>,
    last_ack: Option<SeqNum>,
    buffer: ReassemblyBuffer,
}

impl StreamTracker {
    fn new(config: &StreamConfig) -> Self {
        Self {
            isn: None,
            mss: None,
            window_scale: None,
            window: None,
            timestamp: 0,
            fin_seq: None,
            last_ack: None,
            buffer: ReassemblyBuffer::from_config(config),
        }
    }

    /// Record the parameters carried by this endpoint's SYN.
    fn open(&mut self, seg: &SegmentDescriptor<'_>, config: &StreamConfig) {
        self.isn = Some(seg.sequence_number);
        if config.mss {
            self.mss = seg.mss();
        }
        self.window_scale = seg.window_scale();
        self.buffer.anchor(seg.sequence_number + 1);
        self.observe(seg);
    }

    fn observe(&mut self, seg: &SegmentDescriptor<'_>) {
        self.window = Some(seg.window);
        if seg.timestamp_option != 0 {
            self.timestamp = seg.timestamp_option;
        }
        if seg.flags.is_ack() {
            self.last_ack = Some(seg.ack_number);
        }
    }

    #[must_use]
    pub fn isn(&self) -> Option<SeqNum> {
        self.isn
    }

    #[must_use]
    pub fn mss(&self) -> Option<u16> {
        self.mss
    }

    /// Window scale offered in this endpoint's SYN, already clamped.
    #[must_use]
    pub fn window_scale(&self) -> Option<u8> {
        self.window_scale
    }

    /// Last advertised window, unscaled.
    #[must_use]
    pub fn window(&self) -> Option<u16> {
        self.window
    }

    #[must_use]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Sequence number occupied by this endpoint's FIN.
    #[must_use]
    pub fn fin_seq(&self) -> Option<SeqNum> {
        self.fin_seq
    }

    #[must_use]
    pub fn last_ack(&self) -> Option<SeqNum> {
        self.last_ack
    }

    #[must_use]
    pub fn next_expected(&self) -> Option<SeqNum> {
        self.buffer.next_expected()
    }

    #[must_use]
    pub fn buffer(&self) -> &ReassemblyBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn stats(&self) -> &BufferStats {
        self.buffer.stats()
    }

    fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            isn: self.isn,
            mss: self.mss,
            window_scale: self.window_scale,
            window: self.window,
            timestamp: self.timestamp,
            fin_seq: self.fin_seq,
            last_ack: self.last_ack,
            next_expected: self.buffer.next_expected(),
        }
    }

    fn restore(&mut self, snapshot: &TrackerSnapshot) {
        self.isn = snapshot.isn;
        self.mss = snapshot.mss;
        self.window_scale = snapshot.window_scale;
        self.window = snapshot.window;
        self.timestamp = snapshot.timestamp;
        self.fin_seq = snapshot.fin_seq;
        self.last_ack = snapshot.last_ack;
        if let Some(next) = snapshot.next_expected {
            self.buffer.anchor(next);
        }
    }
}

/// Result of handing one segment to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentOutcome {
    pub direction: Direction,
    /// Phase after the segment was processed.
    pub phase: TcpPhase,
    /// False when the segment was refused and could not affect the phase.
    pub accepted: bool,
    /// Bytes handed to the inspector while processing the segment.
    pub delivered: usize,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    flow: FlowId,
    config: StreamConfig,
    phase: TcpPhase,
    client: StreamTracker,
    server: StreamTracker,
    ha: FlowHaState,
    last_activity: Duration,
}

impl SessionState {
    /// A fresh session in LISTEN. `flow` is taken as client to server until
    /// the first SYN or SYN+ACK says otherwise.
    #[must_use]
    pub fn new(flow: FlowId, config: StreamConfig) -> Self {
        Self {
            flow,
            client: StreamTracker::new(&config),
            server: StreamTracker::new(&config),
            config,
            phase: TcpPhase::Listen,
            ha: FlowHaState::new(),
            last_activity: Duration::ZERO,
        }
    }

    /// Client to server orientation of the flow.
    #[must_use]
    pub fn flow(&self) -> FlowId {
        self.flow
    }

    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    #[must_use]
    pub fn phase(&self) -> TcpPhase {
        self.phase
    }

    /// Endpoint that sends in `direction`.
    #[must_use]
    pub fn tracker(&self, direction: Direction) -> &StreamTracker {
        match direction {
            Direction::ClientToServer => &self.client,
            Direction::ServerToClient => &self.server,
        }
    }

    #[must_use]
    pub fn next_expected(&self, direction: Direction) -> Option<SeqNum> {
        self.tracker(direction).next_expected()
    }

    #[must_use]
    pub fn ha(&self) -> &FlowHaState {
        &self.ha
    }

    pub fn ha_mut(&mut self) -> &mut FlowHaState {
        &mut self.ha
    }

    #[must_use]
    pub fn last_activity(&self) -> Duration {
        self.last_activity
    }

    /// Both SYNs offered window scaling and scaling is enabled.
    #[must_use]
    pub fn window_scaling(&self) -> bool {
        self.config.window_scale
            && self.client.window_scale.is_some()
            && self.server.window_scale.is_some()
    }

    /// Effective receive window the peer of `direction`'s sender advertised.
    #[must_use]
    pub fn receive_window(&self, direction: Direction) -> Option<u32> {
        let receiver = self.tracker(direction.reverse());
        let shift = if self.window_scaling() {
            receiver.window_scale.unwrap_or(0)
        } else {
            0
        };
        receiver.window.map(|w| u32::from(w) << shift)
    }

    /// Process one captured segment of this flow.
    ///
    /// Fails with `MalformedSegment` when the header cannot be described; the
    /// session is left untouched in that case. Every protocol anomaly is
    /// reported through `sink` and never surfaces as an error.
    pub fn process_packet(
        &mut self,
        packet: &TcpPacket<'_>,
        sink: &dyn EventSink,
        inspector: &mut dyn StreamInspector,
    ) -> Result<SegmentOutcome> {
        if packet.flow != self.flow && packet.flow != self.flow.reversed() {
            return Err(Error::FatalInconsistency(
                "packet handed to a session of another flow",
            ));
        }
        let flow = self.oriented(packet);
        let direction = if packet.flow == flow {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        };

        let logger =
            TcpEventLogger::new(sink, flow, direction).with_alerts(self.config.alert_on_evasion);
        let segment = SegmentDescriptor::from_packet(packet, &logger)?;
        self.flow = flow;
        self.last_activity = segment.arrival;
        Ok(self.process_segment(direction, &segment, &logger, inspector))
    }

    /// Drive the state machine and reassembly with an already built descriptor.
    pub fn process_segment(
        &mut self,
        direction: Direction,
        seg: &SegmentDescriptor<'_>,
        logger: &TcpEventLogger<'_>,
        inspector: &mut dyn StreamInspector,
    ) -> SegmentOutcome {
        trace!(
            flow = %self.flow,
            %direction,
            phase = %self.phase,
            seq = %seg.sequence_number,
            flags = ?seg.flags,
            len = seg.payload.len(),
            "Processing segment"
        );

        let verdict = if self.phase == TcpPhase::Closed {
            let kind = if seg.flags.is_rst() {
                EventKind::SpuriousRst
            } else {
                EventKind::DataOnClosed
            };
            logger.log(kind, seg.context(self.next_expected(direction)));
            None
        } else if seg.flags.is_rst() {
            self.on_reset(direction, seg, logger, inspector)
        } else {
            self.on_segment(direction, seg, logger, inspector)
        };

        SegmentOutcome {
            direction,
            phase: self.phase,
            accepted: verdict.is_some(),
            delivered: verdict.unwrap_or(0),
        }
    }

    /// Deliver everything queued for `direction`, skipping holes.
    pub fn flush(
        &mut self,
        direction: Direction,
        sink: &dyn EventSink,
        inspector: &mut dyn StreamInspector,
    ) -> usize {
        let logger =
            TcpEventLogger::new(sink, self.flow, direction).with_alerts(self.config.alert_on_evasion);
        self.flush_direction(direction, &logger, inspector)
    }

    /// TIME_WAIT has run out; the flow manager closes the session.
    pub fn expire(&mut self) -> bool {
        if self.phase != TcpPhase::TimeWait {
            return false;
        }
        self.set_phase(TcpPhase::Closed);
        true
    }

    /// No segment seen for at least `timeout` before `now`.
    #[must_use]
    pub fn is_stale(&self, now: Duration, timeout: Duration) -> bool {
        now.saturating_sub(self.last_activity) >= timeout
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            flow: self.flow,
            policy_id: self.config.policy_id,
            phase: self.phase,
            client: self.client.snapshot(),
            server: self.server.snapshot(),
        }
    }

    /// Rebuild a session from a replicated snapshot. Queued out-of-order data
    /// is not replicated; both buffers resume empty at their delivered edge.
    pub fn restore(snapshot: &SessionSnapshot, config: StreamConfig) -> Result<Self> {
        snapshot.validate()?;
        if snapshot.policy_id != config.policy_id {
            return Err(Error::InconsistentSnapshot(
                "snapshot belongs to another policy context",
            ));
        }
        let mut session = Self::new(snapshot.flow, config);
        session.phase = snapshot.phase;
        session.client.restore(&snapshot.client);
        session.server.restore(&snapshot.server);
        session.ha = FlowHaState::standby();
        Ok(session)
    }

    /// The session's flow as seen from the client, fixed by the first SYN or
    /// SYN+ACK of a fresh session.
    fn oriented(&self, packet: &TcpPacket<'_>) -> FlowId {
        let flags = packet.header.flags();
        if self.phase != TcpPhase::Listen
            || self.client.isn.is_some()
            || self.server.isn.is_some()
            || !flags.is_syn()
        {
            return self.flow;
        }
        let from_client = !flags.is_ack();
        if from_client == (packet.flow == self.flow) {
            self.flow
        } else {
            self.flow.reversed()
        }
    }

    fn sender_mut(&mut self, direction: Direction) -> &mut StreamTracker {
        match direction {
            Direction::ClientToServer => &mut self.client,
            Direction::ServerToClient => &mut self.server,
        }
    }

    fn set_phase(&mut self, next: TcpPhase) {
        if next == self.phase {
            return;
        }
        debug!(flow = %self.flow, from = %self.phase, to = %next, "Session phase change");
        self.phase = next;
        self.ha.mark_updated(HaClient::Session);
        if next == TcpPhase::Closed {
            self.client.buffer.clear();
            self.server.buffer.clear();
        }
    }

    /// `seq` lies within the window the receiver of `direction` offers.
    fn in_window(&self, direction: Direction, seq: SeqNum) -> bool {
        let Some(expected) = self.next_expected(direction) else {
            return true;
        };
        let window = self
            .receive_window(direction)
            .unwrap_or_else(|| u32::from(u16::MAX));
        seq.in_range(expected - window, expected + window.max(1))
    }

    /// Window check ahead of any state change; a refused segment is handed to
    /// the sender's buffer for bookkeeping only.
    fn admit(
        &mut self,
        direction: Direction,
        seg: &SegmentDescriptor<'_>,
        logger: &TcpEventLogger<'_>,
    ) -> bool {
        if self.in_window(direction, seg.sequence_number) {
            return true;
        }
        debug!(
            flow = %self.flow,
            %direction,
            seq = %seg.sequence_number,
            window = ?self.receive_window(direction),
            "Segment outside receive window"
        );
        let context = seg.context(self.next_expected(direction));
        self.sender_mut(direction).buffer.reject(context, logger);
        false
    }

    fn on_reset(
        &mut self,
        direction: Direction,
        seg: &SegmentDescriptor<'_>,
        logger: &TcpEventLogger<'_>,
        inspector: &mut dyn StreamInspector,
    ) -> Option<usize> {
        let expected = self.next_expected(direction);
        let acceptable = match expected {
            Some(expected) => {
                let window = self
                    .receive_window(direction)
                    .unwrap_or_else(|| u32::from(u16::MAX));
                seg.sequence_number.in_range(expected, expected + window.max(1))
            }
            None => true,
        };
        if !acceptable {
            debug!(flow = %self.flow, seq = %seg.sequence_number, "Ignoring out-of-window reset");
            logger.log(EventKind::SpuriousRst, seg.context(expected));
            return None;
        }

        let mut delivered = self.flush_direction(direction, logger, inspector);
        delivered += self.flush_direction(direction.reverse(), &logger.reversed(), inspector);
        self.set_phase(TcpPhase::Closed);
        Some(delivered)
    }

    fn on_segment(
        &mut self,
        direction: Direction,
        seg: &SegmentDescriptor<'_>,
        logger: &TcpEventLogger<'_>,
        inspector: &mut dyn StreamInspector,
    ) -> Option<usize> {
        let handshake_ok = if seg.flags.is_syn() {
            self.on_syn(direction, seg, logger)
        } else {
            self.on_handshake_ack(direction, seg, logger)
        };
        if !handshake_ok {
            return None;
        }
        if !self.phase.is_synchronized() {
            if seg.payload.is_empty() {
                return Some(0);
            }
            // data on a SYN is sequenced right after the ISN just recorded
            if self.tracker(direction).isn.is_none() {
                logger.log(EventKind::DataBeforeHandshake, seg.context(None));
                return None;
            }
        }
        self.on_data(direction, seg, logger, inspector)
    }

    fn on_syn(
        &mut self,
        direction: Direction,
        seg: &SegmentDescriptor<'_>,
        logger: &TcpEventLogger<'_>,
    ) -> bool {
        let ack = seg.flags.is_ack();
        match (self.phase, direction, ack) {
            (TcpPhase::Listen, Direction::ClientToServer, false) => {
                let config = self.config;
                self.client.open(seg, &config);
                self.set_phase(TcpPhase::SynReceived);
                true
            }
            (TcpPhase::Listen, Direction::ServerToClient, true) => {
                // the client's SYN was not captured
                let config = self.config;
                self.server.open(seg, &config);
                self.client.isn = Some(seg.ack_number - 1);
                self.client.buffer.anchor(seg.ack_number);
                self.set_phase(TcpPhase::SynSent);
                true
            }
            (TcpPhase::SynReceived, Direction::ServerToClient, true) => {
                let expected = self.client.isn.map(|isn| isn + 1);
                if Some(seg.ack_number) != expected {
                    logger.log(EventKind::HandshakeMismatch, seg.context(expected));
                    return false;
                }
                let config = self.config;
                self.server.open(seg, &config);
                self.set_phase(TcpPhase::Established);
                true
            }
            _ => {
                let isn = self.tracker(direction).isn;
                let context = seg.context(self.next_expected(direction));
                if isn == Some(seg.sequence_number) {
                    logger.log(EventKind::Retransmission, context);
                } else {
                    logger.log(EventKind::UnexpectedSyn, context);
                }
                false
            }
        }
    }

    fn on_handshake_ack(
        &mut self,
        direction: Direction,
        seg: &SegmentDescriptor<'_>,
        logger: &TcpEventLogger<'_>,
    ) -> bool {
        match self.phase {
            TcpPhase::Listen => {
                if self.config.require_3whs {
                    logger.log(EventKind::NoHandshake, seg.context(None));
                    return false;
                }
                self.sender_mut(direction).buffer.anchor(seg.sequence_number);
                if seg.flags.is_ack() {
                    self.sender_mut(direction.reverse())
                        .buffer
                        .anchor(seg.ack_number);
                }
                debug!(flow = %self.flow, %direction, "Picking up flow mid-stream");
                self.set_phase(TcpPhase::Established);
                true
            }
            TcpPhase::SynSent if direction == Direction::ClientToServer && seg.flags.is_ack() => {
                if !self.admit(direction, seg, logger) {
                    return false;
                }
                let expected = self.server.isn.map(|isn| isn + 1);
                if Some(seg.ack_number) != expected {
                    logger.log(EventKind::HandshakeMismatch, seg.context(expected));
                    return false;
                }
                self.set_phase(TcpPhase::Established);
                true
            }
            TcpPhase::SynReceived
                if direction == Direction::ClientToServer && seg.flags.is_ack() =>
            {
                if !self.admit(direction, seg, logger) {
                    return false;
                }
                // the server's SYN+ACK was not captured
                self.server.isn = Some(seg.ack_number - 1);
                self.server.buffer.anchor(seg.ack_number);
                self.set_phase(TcpPhase::Established);
                true
            }
            _ => true,
        }
    }

    fn on_data(
        &mut self,
        direction: Direction,
        seg: &SegmentDescriptor<'_>,
        logger: &TcpEventLogger<'_>,
        inspector: &mut dyn StreamInspector,
    ) -> Option<usize> {
        let expected = self.next_expected(direction);
        let has_data = !seg.payload.is_empty();

        // bytes sequenced at or after the sender's FIN are never inspected
        let mut payload = seg.payload;
        let mut data_end = seg.data_end();
        if has_data
            && let Some(fin) = self.tracker(direction).fin_seq
            && fin.is_before(data_end)
        {
            logger.log(EventKind::DataAfterFin, seg.context(expected));
            if !seg.data_start().is_before(fin) {
                return None;
            }
            payload = &payload[..seg.data_start().distance_to(fin) as usize];
            data_end = fin;
        }

        let retransmission = has_data && expected.is_some_and(|e| data_end.is_before_or_eq(e));
        if !retransmission && self.handshake_seen() && !self.admit(direction, seg, logger) {
            return None;
        }

        self.sender_mut(direction).observe(seg);
        if seg.flags.is_ack() {
            self.on_ack(direction, seg.ack_number);
        }

        let mut delivered = 0;
        if has_data {
            let flow = self.flow;
            let mut deliver = |start: SeqNum, bytes: &[u8]| {
                inspector.inspect(&StreamChunk {
                    flow,
                    direction,
                    start,
                    bytes,
                });
            };
            delivered += self
                .sender_mut(direction)
                .buffer
                .insert(seg.data_start(), payload, logger, &mut deliver)
                .delivered();
        }
        if seg.flags.is_fin() {
            delivered += self.on_fin(direction, seg, logger, inspector);
        }
        Some(delivered)
    }

    /// Transitions driven by an acknowledgment of the peer's FIN.
    fn on_ack(&mut self, direction: Direction, ack: SeqNum) {
        let Some(fin) = self.tracker(direction.reverse()).fin_seq else {
            return;
        };
        if direction != Direction::ClientToServer || ack.is_before(fin + 1) {
            return;
        }
        match self.phase {
            TcpPhase::FinWait1 => self.set_phase(TcpPhase::FinWait2),
            TcpPhase::Closing => self.set_phase(TcpPhase::TimeWait),
            TcpPhase::LastAck => self.set_phase(TcpPhase::Closed),
            _ => {}
        }
    }

    fn on_fin(
        &mut self,
        direction: Direction,
        seg: &SegmentDescriptor<'_>,
        logger: &TcpEventLogger<'_>,
        inspector: &mut dyn StreamInspector,
    ) -> usize {
        if self.tracker(direction).fin_seq.is_some() {
            return 0;
        }
        let fin = seg.data_end();
        let sender = self.sender_mut(direction);
        sender.fin_seq = Some(fin);
        if sender.buffer.discard_from(fin) > 0 {
            let expected = sender.buffer.next_expected();
            logger.log(EventKind::DataAfterFin, seg.context(expected));
        }
        let delivered = self.flush_direction(direction, logger, inspector);

        let next = match (self.phase, direction) {
            (TcpPhase::Established, Direction::ServerToClient) => TcpPhase::FinWait1,
            (TcpPhase::Established, Direction::ClientToServer) => TcpPhase::CloseWait,
            (TcpPhase::CloseWait, Direction::ServerToClient) => TcpPhase::LastAck,
            (TcpPhase::FinWait1, Direction::ClientToServer) => TcpPhase::Closing,
            (TcpPhase::FinWait2, Direction::ClientToServer) => TcpPhase::TimeWait,
            (phase, _) => phase,
        };
        self.set_phase(next);
        delivered
    }

    fn handshake_seen(&self) -> bool {
        self.client.isn.is_some() && self.server.isn.is_some()
    }

    fn flush_direction(
        &mut self,
        direction: Direction,
        logger: &TcpEventLogger<'_>,
        inspector: &mut dyn StreamInspector,
    ) -> usize {
        let flow = self.flow;
        let mut deliver = |start: SeqNum, bytes: &[u8]| {
            inspector.inspect(&StreamChunk {
                flow,
                direction,
                start,
                bytes,
            });
        };
        let delivered = self
            .sender_mut(direction)
            .buffer
            .flush_all(logger, &mut deliver);
        if delivered > 0 {
            debug!(flow = %flow, %direction, delivered, "Flushed reassembly buffer");
        }
        delivered
    }
}
