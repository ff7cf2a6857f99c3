mod common;

use common::{Conversation, MSS_1460};
use rstest::rstest;
use stream_tcp_lib::StreamConfig;
use stream_tcp_lib::ha::{self, HaRecord};
use stream_tcp_lib::packet::{Direction, SeqNum, TcpFlags, extract_mss, extract_window_scale};
use stream_tcp_lib::stream::{EventKind, TcpPhase};

const ACK: TcpFlags = TcpFlags::ACK;

#[rstest]
#[case(1000, 5000)]
#[case(0, u32::MAX)]
#[case(u32::MAX, 7)]
#[case(0x8000_0000, 0x7fff_ffff)]
fn test_handshake_progresses_without_anomalies(#[case] client_isn: u32, #[case] server_isn: u32) {
    let mut conv = Conversation::new(StreamConfig::default());

    let syn = conv.send(
        Direction::ClientToServer,
        client_isn,
        0,
        TcpFlags::SYN,
        &MSS_1460,
        &[],
    );
    assert_eq!(syn.phase, TcpPhase::SynReceived);

    let syn_ack = conv.server(
        server_isn,
        client_isn.wrapping_add(1),
        TcpFlags::SYN | ACK,
        &[],
    );
    assert_eq!(syn_ack.phase, TcpPhase::Established);

    let ack = conv.client(
        client_isn.wrapping_add(1),
        server_isn.wrapping_add(1),
        ACK,
        &[],
    );
    assert!(ack.accepted);
    assert_eq!(ack.phase, TcpPhase::Established);
    assert!(conv.anomalies().is_empty());
    assert_eq!(conv.sink.kinds(), vec![EventKind::SynReceived]);
}

#[test]
fn test_syn_with_mss_enters_syn_received() {
    assert_eq!(extract_mss(&MSS_1460), Some(1460));

    let mut conv = Conversation::new(StreamConfig::default());
    let out = conv.send(
        Direction::ClientToServer,
        1000,
        0,
        TcpFlags::SYN,
        &MSS_1460,
        &[],
    );

    assert_eq!(out.phase, TcpPhase::SynReceived);
    assert_eq!(conv.session.tracker(Direction::ClientToServer).mss(), Some(1460));
    assert_eq!(
        conv.session.tracker(Direction::ClientToServer).isn(),
        Some(SeqNum::new(1000))
    );
    let events = conv.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::SynReceived);
    assert_eq!(events[0].context.seq, SeqNum::new(1000));
    assert_eq!(events[0].context.end, SeqNum::new(1001));
}

#[test]
fn test_window_scale_clamped_silently() {
    let wscale_20 = [1, 3, 3, 20];
    assert_eq!(extract_window_scale(&wscale_20), Some(14));

    let mut conv = Conversation::new(StreamConfig::default());
    conv.send(Direction::ClientToServer, 10, 0, TcpFlags::SYN, &wscale_20, &[]);
    conv.send(
        Direction::ServerToClient,
        90,
        11,
        TcpFlags::SYN | ACK,
        &wscale_20,
        &[],
    );

    assert_eq!(
        conv.session.tracker(Direction::ClientToServer).window_scale(),
        Some(14)
    );
    assert_eq!(
        conv.session.receive_window(Direction::ClientToServer),
        Some(65535 << 14)
    );
    assert!(conv.anomalies().is_empty());
}

#[test]
fn test_in_order_segment_extends_run_exactly() {
    let mut conv = Conversation::new(StreamConfig::default());
    conv.handshake(1000, 5000);
    conv.client(1001, 5001, ACK, b"hello");
    let before = conv.session.next_expected(Direction::ClientToServer).unwrap();

    let out = conv.client(before.raw(), 5001, ACK, b" world");

    assert_eq!(out.delivered, 6);
    assert_eq!(
        conv.session.next_expected(Direction::ClientToServer),
        Some(before + 6)
    );
    assert_eq!(conv.chunks.last().map(|c| c.1), Some(before));
    assert_eq!(conv.bytes(Direction::ClientToServer), b"hello world");
    assert!(conv.anomalies().is_empty());
}

#[rstest]
#[case(1001, b"abcdefgh".as_slice())]
#[case(1001, b"abcd".as_slice())]
#[case(1003, b"cdef".as_slice())]
#[case(1005, b"efgh".as_slice())]
fn test_retransmission_is_idempotent(#[case] seq: u32, #[case] payload: &[u8]) {
    let mut conv = Conversation::new(StreamConfig::default());
    conv.handshake(1000, 5000);
    conv.client(1001, 5001, ACK, b"abcdefgh");
    let expected = conv.session.next_expected(Direction::ClientToServer);
    let delivered = conv.chunks.len();

    let out = conv.client(seq, 5001, ACK, payload);

    assert_eq!(out.delivered, 0);
    assert_eq!(conv.session.next_expected(Direction::ClientToServer), expected);
    assert_eq!(conv.chunks.len(), delivered);
    assert_eq!(conv.anomalies(), vec![EventKind::Retransmission]);
}

#[test]
fn test_budget_exhaustion_forces_flush() {
    let config = StreamConfig {
        max_queued_segments: 4,
        ..StreamConfig::default()
    };
    let mut conv = Conversation::new(config);
    conv.handshake(1000, 5000);

    // every fragment is separated from the next by a hole
    for seq in [1011, 1031, 1051, 1071] {
        let out = conv.client(seq, 5001, ACK, b"0123456789");
        assert!(out.accepted);
        assert_eq!(out.delivered, 0);
    }
    assert!(conv.chunks.is_empty());
    assert!(conv.anomalies().is_empty());

    let out = conv.client(1091, 5001, ACK, b"tail");

    assert_eq!(out.delivered, 10);
    assert_eq!(conv.sink.count(EventKind::BufferExhausted), 1);
    assert_eq!(conv.sink.count(EventKind::SequenceGap), 1);
    assert_eq!(conv.chunks, vec![(Direction::ClientToServer, SeqNum::new(1011), b"0123456789".to_vec())]);
    let tracker = conv.session.tracker(Direction::ClientToServer);
    assert_eq!(tracker.buffer().queued_segments(), 4);
    assert_eq!(tracker.next_expected(), Some(SeqNum::new(1021)));
    assert_eq!(tracker.stats().forced_flushes, 1);
}

#[test]
fn test_ha_restore_accepts_same_next_segments() {
    let config = StreamConfig {
        policy_id: 2,
        ..StreamConfig::default()
    };
    let mut original = Conversation::new(config);
    original.handshake(1000, 5000);
    original.client(1001, 5001, ACK, b"request");
    original.server(5001, 1008, ACK, b"response");

    let message = ha::encode_update(&mut original.session).unwrap();
    let HaRecord::Update(restored) = ha::decode(&message, config).unwrap() else {
        panic!("expected an update record");
    };
    assert_eq!(restored.phase(), original.session.phase());

    type NextSegment = (Direction, u32, u32, TcpFlags, &'static [u8]);
    let candidates: [NextSegment; 7] = [
        (Direction::ClientToServer, 1008, 5009, ACK, b"next"),
        (Direction::ClientToServer, 1001, 5009, ACK, b"request"),
        (Direction::ClientToServer, 1008 + 300_000, 5009, ACK, b"far"),
        (Direction::ServerToClient, 5009, 1008, ACK, b"more"),
        (Direction::ClientToServer, 900_000, 0, TcpFlags::RST, b""),
        (Direction::ClientToServer, 1008, 5009, TcpFlags::FIN | ACK, b""),
        (Direction::ClientToServer, 1008, 5009, TcpFlags::RST, b""),
    ];

    for segment in candidates {
        let mut a = Conversation::from_session(original.session.clone());
        let mut b = Conversation::from_session((*restored).clone());
        let (direction, seq, ack, flags, payload) = segment;

        let out_a = a.send(direction, seq, ack, flags, &[], payload);
        let out_b = b.send(direction, seq, ack, flags, &[], payload);

        assert_eq!(out_a, out_b, "segment {segment:?}");
        assert_eq!(a.sink.kinds(), b.sink.kinds(), "segment {segment:?}");
        assert_eq!(a.chunks, b.chunks, "segment {segment:?}");
    }
}

#[test]
fn test_full_conversation_closes() {
    let mut conv = Conversation::new(StreamConfig::default());
    conv.handshake(1000, 5000);
    conv.client(1001, 5001, ACK, b"ping");
    conv.server(5001, 1005, ACK, b"pong");

    assert_eq!(conv.server(5005, 1005, TcpFlags::FIN | ACK, &[]).phase, TcpPhase::FinWait1);
    assert_eq!(conv.client(1005, 5006, TcpFlags::FIN | ACK, &[]).phase, TcpPhase::TimeWait);
    assert!(conv.session.expire());
    assert_eq!(conv.session.phase(), TcpPhase::Closed);

    let late = conv.client(1006, 5006, ACK, b"x");
    assert!(!late.accepted);
    assert_eq!(conv.bytes(Direction::ClientToServer), b"ping");
    assert_eq!(conv.bytes(Direction::ServerToClient), b"pong");
    assert_eq!(conv.anomalies(), vec![EventKind::DataOnClosed]);
}
