#![allow(dead_code)]

use core::net::{IpAddr, Ipv4Addr};
use core::time::Duration;

use stream_tcp_lib::StreamConfig;
use stream_tcp_lib::packet::{Direction, FlowId, SeqNum, TcpFlags, TcpPacket};
use stream_tcp_lib::stream::{
    EventKind, MemorySink, SegmentOutcome, SessionState, StreamChunk,
};

pub const MSS_1460: [u8; 4] = [2, 4, 0x05, 0xb4];

pub fn client_flow() -> FlowId {
    FlowId::new(
        IpAddr::V4(Ipv4Addr::new(192, 168, 0, 10)),
        51000,
        IpAddr::V4(Ipv4Addr::new(192, 168, 0, 20)),
        443,
    )
}

/// Raw TCP segment with a 65535 window.
pub fn tcp(seq: u32, ack: u32, flags: TcpFlags, options: &[u8], payload: &[u8]) -> Vec<u8> {
    assert_eq!(options.len() % 4, 0);
    let header_len = 20 + options.len();
    let mut bytes = vec![0u8; header_len];
    bytes[4..8].copy_from_slice(&seq.to_be_bytes());
    bytes[8..12].copy_from_slice(&ack.to_be_bytes());
    bytes[12] = u8::try_from(header_len / 4).unwrap() << 4;
    bytes[13] = flags.bits();
    bytes[14..16].copy_from_slice(&65535u16.to_be_bytes());
    bytes[20..].copy_from_slice(options);
    bytes.extend_from_slice(payload);
    bytes
}

/// One session plus everything it emitted.
pub struct Conversation {
    pub session: SessionState,
    pub sink: MemorySink,
    pub chunks: Vec<(Direction, SeqNum, Vec<u8>)>,
    clock: u64,
}

impl Conversation {
    pub fn new(config: StreamConfig) -> Self {
        Self::from_session(SessionState::new(client_flow(), config))
    }

    pub fn from_session(session: SessionState) -> Self {
        Self {
            session,
            sink: MemorySink::new(),
            chunks: Vec::new(),
            clock: 0,
        }
    }

    pub fn send(
        &mut self,
        direction: Direction,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        options: &[u8],
        payload: &[u8],
    ) -> SegmentOutcome {
        let raw = tcp(seq, ack, flags, options, payload);
        let flow = match direction {
            Direction::ClientToServer => client_flow(),
            Direction::ServerToClient => client_flow().reversed(),
        };
        self.clock += 1;
        let packet = TcpPacket::parse(flow, &raw, Duration::from_millis(self.clock)).unwrap();
        let chunks = &mut self.chunks;
        let mut inspector = |chunk: &StreamChunk<'_>| {
            chunks.push((chunk.direction, chunk.start, chunk.bytes.to_vec()));
        };
        self.session
            .process_packet(&packet, &self.sink, &mut inspector)
            .unwrap()
    }

    pub fn client(&mut self, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> SegmentOutcome {
        self.send(Direction::ClientToServer, seq, ack, flags, &[], payload)
    }

    pub fn server(&mut self, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> SegmentOutcome {
        self.send(Direction::ServerToClient, seq, ack, flags, &[], payload)
    }

    /// SYN, SYN+ACK, ACK with the given ISNs.
    pub fn handshake(&mut self, client_isn: u32, server_isn: u32) {
        self.send(
            Direction::ClientToServer,
            client_isn,
            0,
            TcpFlags::SYN,
            &MSS_1460,
            &[],
        );
        self.server(
            server_isn,
            client_isn.wrapping_add(1),
            TcpFlags::SYN | TcpFlags::ACK,
            &[],
        );
        self.client(
            client_isn.wrapping_add(1),
            server_isn.wrapping_add(1),
            TcpFlags::ACK,
            &[],
        );
    }

    /// Force out everything queued for `direction`, holes included.
    pub fn flush(&mut self, direction: Direction) -> usize {
        let chunks = &mut self.chunks;
        let mut inspector = |chunk: &StreamChunk<'_>| {
            chunks.push((chunk.direction, chunk.start, chunk.bytes.to_vec()));
        };
        self.session.flush(direction, &self.sink, &mut inspector)
    }

    pub fn bytes(&self, direction: Direction) -> Vec<u8> {
        self.chunks
            .iter()
            .filter(|(d, _, _)| *d == direction)
            .flat_map(|(_, _, b)| b.iter().copied())
            .collect()
    }

    /// Events other than the informational SYN notice.
    pub fn anomalies(&self) -> Vec<EventKind> {
        self.sink
            .kinds()
            .into_iter()
            .filter(|k| !k.is_informational())
            .collect()
    }
}
