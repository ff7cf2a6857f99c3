//! Packet parsing and TCP flow identification.
//!
//! This module turns captured frames into validated TCP header views. It
//! supports IPv4 and IPv6 packets either inside Ethernet frames or raw, and
//! provides the sequence-number and option helpers the stream layer builds on.

mod options;
mod seq;
mod tcp_header;
mod tcp_packet;
mod tcp_stream_id;

pub use options::{
    MAX_WINDOW_SCALE, TcpOption, TcpOptions, extract_mss, extract_timestamp,
    extract_window_scale, has_window_scale,
};
pub use seq::SeqNum;
pub use tcp_header::{TcpFlags, TcpHeader};
pub use tcp_packet::TcpPacket;
pub use tcp_stream_id::{Direction, FlowId};

#[cfg(test)]
pub(crate) use tcp_header::testing;
