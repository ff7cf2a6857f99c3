//! Capture replay.
//!
//! A [`PacketSource`] yields captured frames; its default `replay` loop decodes
//! each frame, finds or creates the session for its flow in a [`FlowTable`], and
//! drives the session. Closed sessions are dropped from the table.

use core::time::Duration;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::Error;
use crate::packet::{Direction, FlowId, TcpPacket};
use crate::stream::{EventSink, SegmentOutcome, SessionState, StreamInspector, TcpPhase};

/// One frame as captured: Ethernet or raw IP bytes plus the capture timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    pub timestamp: Duration,
}

/// Running totals over one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub frames: u64,
    pub non_tcp: u64,
    pub malformed: u64,
    pub segments: u64,
    pub rejected: u64,
    pub bytes_delivered: u64,
    pub flows_opened: u64,
    pub flows_closed: u64,
}

/// Sessions of every tracked flow, keyed by the direction-agnostic flow id.
#[derive(Debug)]
pub struct FlowTable {
    config: StreamConfig,
    sessions: HashMap<FlowId, SessionState>,
    stats: ReplayStats,
}

impl FlowTable {
    #[must_use]
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            stats: ReplayStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn get(&self, flow: &FlowId) -> Option<&SessionState> {
        self.sessions.get(&flow.canonical())
    }

    /// Decode one frame and hand it to its session. Returns `None` for frames
    /// that carry no usable TCP segment.
    pub fn process_frame(
        &mut self,
        frame: &[u8],
        timestamp: Duration,
        sink: &dyn EventSink,
        inspector: &mut dyn StreamInspector,
    ) -> Option<SegmentOutcome> {
        self.stats.frames += 1;
        let packet = match TcpPacket::from_frame(frame, timestamp) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                self.stats.non_tcp += 1;
                return None;
            }
            Err(e) => {
                self.stats.malformed += 1;
                debug!(error = %e, "Dropping malformed segment");
                return None;
            }
        };
        self.process_packet(&packet, sink, inspector)
    }

    pub fn process_packet(
        &mut self,
        packet: &TcpPacket<'_>,
        sink: &dyn EventSink,
        inspector: &mut dyn StreamInspector,
    ) -> Option<SegmentOutcome> {
        let key = packet.flow.canonical();
        let session = match self.sessions.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!(flow = %packet.flow, "Tracking new flow");
                self.stats.flows_opened += 1;
                entry.insert(SessionState::new(packet.flow, self.config))
            }
        };

        let outcome = match session.process_packet(packet, sink, inspector) {
            Ok(outcome) => outcome,
            Err(e @ Error::MalformedSegment(_)) => {
                self.stats.malformed += 1;
                debug!(flow = %packet.flow, error = %e, "Dropping malformed segment");
                return None;
            }
            Err(e) => {
                warn!(flow = %packet.flow, error = %e, "Session refused segment");
                return None;
            }
        };

        self.stats.segments += 1;
        self.stats.bytes_delivered += outcome.delivered as u64;
        if !outcome.accepted {
            self.stats.rejected += 1;
        }
        if outcome.phase == TcpPhase::Closed {
            self.sessions.remove(&key);
            self.stats.flows_closed += 1;
            debug!(flow = %packet.flow, "Flow closed");
        }
        Some(outcome)
    }

    /// Close every session in TIME_WAIT and drop sessions idle for `timeout`.
    pub fn expire(&mut self, now: Duration, timeout: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            session.expire();
            session.phase() != TcpPhase::Closed && !session.is_stale(now, timeout)
        });
        let removed = before - self.sessions.len();
        self.stats.flows_closed += removed as u64;
        removed
    }

    /// Deliver whatever every session still holds, ending the replay.
    pub fn flush_all(&mut self, sink: &dyn EventSink, inspector: &mut dyn StreamInspector) -> usize {
        let mut delivered = 0;
        for session in self.sessions.values_mut() {
            for direction in [Direction::ClientToServer, Direction::ServerToClient] {
                delivered += session.flush(direction, sink, inspector);
            }
        }
        self.stats.bytes_delivered += delivered as u64;
        delivered
    }
}

/// Anything that can hand out captured frames.
pub trait PacketSource {
    /// Frames in capture order. Fails if the capture cannot be opened.
    fn frames(&self) -> anyhow::Result<Box<dyn Iterator<Item = CapturedFrame>>>;

    /// Feed every frame through a fresh flow table and flush what remains.
    fn replay(
        &self,
        config: StreamConfig,
        sink: &dyn EventSink,
        inspector: &mut dyn StreamInspector,
    ) -> anyhow::Result<ReplayStats> {
        let mut table = FlowTable::new(config);
        for frame in self.frames()? {
            table.process_frame(&frame.data, frame.timestamp, sink, inspector);
        }
        table.flush_all(sink, inspector);

        let stats = *table.stats();
        info!(
            frames = stats.frames,
            segments = stats.segments,
            malformed = stats.malformed,
            flows = stats.flows_opened,
            bytes = stats.bytes_delivered,
            "Replay finished"
        );
        Ok(stats)
    }
}

/// Frames held in memory.
impl PacketSource for Vec<CapturedFrame> {
    fn frames(&self) -> anyhow::Result<Box<dyn Iterator<Item = CapturedFrame>>> {
        Ok(Box::new(self.clone().into_iter()))
    }
}

#[cfg(all(feature = "pcap", target_os = "linux"))]
pub use capture::PcapFile;

#[cfg(all(feature = "pcap", target_os = "linux"))]
mod capture {
    use core::time::Duration;
    use std::path::PathBuf;

    use anyhow::Context;
    use tracing::{info, warn};

    use super::{CapturedFrame, PacketSource};

    /// A pcap capture file read through libpcap.
    #[derive(Debug, Clone)]
    pub struct PcapFile {
        path: PathBuf,
    }

    impl PcapFile {
        #[must_use]
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    impl PacketSource for PcapFile {
        fn frames(&self) -> anyhow::Result<Box<dyn Iterator<Item = CapturedFrame>>> {
            let mut cap = pcap::Capture::from_file(&self.path)
                .with_context(|| format!("Failed to open capture {}", self.path.display()))?;
            info!(path = %self.path.display(), link = ?cap.get_datalink(), "Replaying capture");

            let iter = core::iter::from_fn(move || {
                match cap.next_packet() {
                    Ok(packet) => {
                        let ts = packet.header.ts;
                        let timestamp = Duration::new(
                            u64::try_from(ts.tv_sec).unwrap_or(0),
                            u32::try_from(ts.tv_usec).unwrap_or(0).saturating_mul(1000),
                        );
                        Some(CapturedFrame {
                            data: packet.data.to_vec(),
                            timestamp,
                        })
                    }
                    Err(pcap::Error::NoMorePackets) => None,
                    Err(e) => {
                        warn!("Error reading packet: {e}");
                        None
                    }
                }
            });

            Ok(Box::new(iter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{TcpFlags, testing::segment};
    use crate::stream::{EventKind, MemorySink, NullInspector, StreamChunk};

    /// IPv4 header in front of a TCP segment, no options.
    fn ipv4(src: [u8; 4], dst: [u8; 4], tcp: &[u8]) -> Vec<u8> {
        let total = u16::try_from(20 + tcp.len()).unwrap();
        let mut packet = vec![0x45, 0, 0, 0, 0, 0, 0x40, 0, 64, 6, 0, 0];
        packet[2..4].copy_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(&src);
        packet.extend_from_slice(&dst);
        packet.extend_from_slice(tcp);
        packet
    }

    fn frame(from_client: bool, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> CapturedFrame {
        let (src, dst, sport, dport) = if from_client {
            ([10, 0, 0, 1], [10, 0, 0, 2], 40000u16, 80u16)
        } else {
            ([10, 0, 0, 2], [10, 0, 0, 1], 80, 40000)
        };
        let mut tcp = segment(seq, ack, flags, &[], payload);
        tcp[0..2].copy_from_slice(&sport.to_be_bytes());
        tcp[2..4].copy_from_slice(&dport.to_be_bytes());
        CapturedFrame {
            data: ipv4(src, dst, &tcp),
            timestamp: Duration::from_millis(u64::from(seq)),
        }
    }

    fn conversation() -> Vec<CapturedFrame> {
        let ack = TcpFlags::ACK;
        vec![
            frame(true, 100, 0, TcpFlags::SYN, &[]),
            frame(false, 500, 101, TcpFlags::SYN | TcpFlags::ACK, &[]),
            frame(true, 101, 501, ack, &[]),
            frame(true, 105, 501, ack, b"ping"),
            frame(true, 101, 501, ack, b"GET "),
            frame(false, 501, 109, ack, b"pong"),
            frame(true, 109, 505, TcpFlags::FIN | ack, &[]),
            frame(false, 505, 110, TcpFlags::FIN | ack, &[]),
            frame(true, 110, 506, ack, &[]),
        ]
    }

    #[test]
    fn test_replay_reassembles_and_closes() {
        let sink = MemorySink::new();
        let mut chunks = Vec::new();
        let mut inspector = |chunk: &StreamChunk<'_>| {
            chunks.push((chunk.direction, chunk.bytes.to_vec()));
        };

        let stats = conversation()
            .replay(StreamConfig::default(), &sink, &mut inspector)
            .unwrap();

        assert_eq!(stats.frames, 9);
        assert_eq!(stats.segments, 9);
        assert_eq!(stats.flows_opened, 1);
        assert_eq!(stats.flows_closed, 1);
        assert_eq!(stats.bytes_delivered, 12);
        assert_eq!(
            chunks,
            vec![
                (Direction::ClientToServer, b"GET ping".to_vec()),
                (Direction::ServerToClient, b"pong".to_vec()),
            ]
        );
        assert_eq!(sink.kinds(), vec![EventKind::SynReceived]);
    }

    #[test]
    fn test_non_tcp_and_malformed_frames_are_counted() {
        let mut table = FlowTable::new(StreamConfig::default());
        let sink = MemorySink::new();

        let mut udp = ipv4([1, 1, 1, 1], [2, 2, 2, 2], &[0; 8]);
        udp[9] = 17;
        assert!(table
            .process_frame(&udp, Duration::ZERO, &sink, &mut NullInspector)
            .is_none());

        let mut bad = segment(1, 0, TcpFlags::SYN, &[2, 9, 0, 0], &[]);
        bad[0..2].copy_from_slice(&1u16.to_be_bytes());
        let bad = ipv4([1, 1, 1, 1], [2, 2, 2, 2], &bad);
        assert!(table
            .process_frame(&bad, Duration::ZERO, &sink, &mut NullInspector)
            .is_none());

        assert_eq!(table.stats().non_tcp, 1);
        assert_eq!(table.stats().malformed, 1);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_expire_drops_idle_flows() {
        let mut table = FlowTable::new(StreamConfig::default());
        let sink = MemorySink::new();
        let first = frame(true, 100, 0, TcpFlags::SYN, &[]);
        table.process_frame(&first.data, first.timestamp, &sink, &mut NullInspector);
        assert_eq!(table.len(), 1);

        assert_eq!(table.expire(Duration::from_secs(1), Duration::from_secs(60)), 0);
        assert_eq!(table.expire(Duration::from_secs(120), Duration::from_secs(60)), 1);
        assert!(table.is_empty());
    }
}
