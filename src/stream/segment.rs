//! Segment descriptors.
//!
//! A descriptor is the normalized, validated form of one captured segment. It
//! borrows the payload from the packet buffer and lives only for the duration of
//! the per-packet call.

use core::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};
use crate::packet::{
    SeqNum, TcpFlags, TcpHeader, TcpOptions, TcpPacket, extract_mss, extract_timestamp,
    extract_window_scale,
};

use super::event::{EventKind, SequenceContext, TcpEventLogger};

#[derive(Debug, Clone, Copy)]
pub struct SegmentDescriptor<'a> {
    pub source_port: u16,
    pub dest_port: u16,
    pub sequence_number: SeqNum,
    pub ack_number: SeqNum,
    /// Raw advertised window, before scaling.
    pub window: u16,
    /// Sequence number after this segment: payload plus one for SYN and one for FIN.
    pub end_sequence: SeqNum,
    pub flags: TcpFlags,
    /// Echoed timestamp value, 0 when the option is absent.
    pub timestamp_option: u32,
    pub payload: &'a [u8],
    pub options: &'a [u8],
    pub arrival: Duration,
}

impl<'a> SegmentDescriptor<'a> {
    /// Build a descriptor from a validated header and its payload.
    ///
    /// Fails with `MalformedSegment` when the option records are inconsistent
    /// with the header length. A SYN without ACK is reported as `SynReceived`.
    pub fn new(
        header: &TcpHeader<'a>,
        payload: &'a [u8],
        arrival: Duration,
        logger: &TcpEventLogger<'_>,
    ) -> Result<Self> {
        let options = header.options();
        TcpOptions::validate(options)?;

        let payload_len = u32::try_from(payload.len())
            .map_err(|_| Error::FatalInconsistency("payload longer than sequence space"))?;

        let flags = header.flags();
        let seq = header.sequence_number();
        let mut end = seq + payload_len;
        if flags.is_syn() {
            end = end + 1;
        }
        if flags.is_fin() {
            end = end + 1;
        }

        let descriptor = Self {
            source_port: header.source_port(),
            dest_port: header.dest_port(),
            sequence_number: seq,
            ack_number: header.ack_number(),
            window: header.window(),
            end_sequence: end,
            flags,
            timestamp_option: extract_timestamp(options),
            payload,
            options,
            arrival,
        };

        trace!(
            seq = %descriptor.sequence_number,
            ack = %descriptor.ack_number,
            win = descriptor.window,
            end = %descriptor.end_sequence,
            flags = ?flags,
            "Segment descriptor"
        );

        if flags.is_syn() && !flags.is_ack() {
            logger.log(
                EventKind::SynReceived,
                SequenceContext::new(seq, end, None),
            );
        }

        Ok(descriptor)
    }

    pub fn from_packet(packet: &TcpPacket<'a>, logger: &TcpEventLogger<'_>) -> Result<Self> {
        Self::new(&packet.header, packet.payload, packet.arrival, logger)
    }

    #[must_use]
    pub fn mss(&self) -> Option<u16> {
        extract_mss(self.options)
    }

    #[must_use]
    pub fn window_scale(&self) -> Option<u8> {
        extract_window_scale(self.options)
    }

    #[must_use]
    pub fn has_window_scale(&self) -> bool {
        self.window_scale().is_some()
    }

    #[must_use]
    pub fn payload_len(&self) -> u32 {
        // bounded by the check in `new`
        u32::try_from(self.payload.len()).unwrap_or(u32::MAX)
    }

    /// First sequence number carrying payload; a SYN occupies the one before it.
    #[must_use]
    pub fn data_start(&self) -> SeqNum {
        if self.flags.is_syn() {
            self.sequence_number + 1
        } else {
            self.sequence_number
        }
    }

    #[must_use]
    pub fn data_end(&self) -> SeqNum {
        self.data_start() + self.payload_len()
    }

    /// Zero payload and neither SYN nor FIN: drives state, carries no stream bytes.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.payload.is_empty() && !self.flags.is_syn() && !self.flags.is_fin()
    }

    #[must_use]
    pub fn context(&self, expected: Option<SeqNum>) -> SequenceContext {
        SequenceContext::new(self.sequence_number, self.end_sequence, expected)
    }
}
