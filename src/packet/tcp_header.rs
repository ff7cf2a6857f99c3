//! TCP header view
//!
//! `TcpHeader` borrows the captured header bytes and exposes the fixed fields.
//! Validation happens once in [`TcpHeader::parse`], so every accessor can index
//! without further bounds checks failing.

use core::fmt;

use crate::error::{MalformedReason, Result};

use super::SeqNum;

const MIN_HEADER_LEN: usize = 20;

/// Set of TCP control flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);
    pub const ECE: TcpFlags = TcpFlags(0x40);
    pub const CWR: TcpFlags = TcpFlags(0x80);

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: TcpFlags) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn is_syn(self) -> bool {
        self.contains(Self::SYN)
    }

    #[must_use]
    pub const fn is_ack(self) -> bool {
        self.contains(Self::ACK)
    }

    #[must_use]
    pub const fn is_fin(self) -> bool {
        self.contains(Self::FIN)
    }

    #[must_use]
    pub const fn is_rst(self) -> bool {
        self.contains(Self::RST)
    }
}

impl core::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        self.union(rhs)
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 8] = [
            (TcpFlags::CWR, "C"),
            (TcpFlags::ECE, "E"),
            (TcpFlags::URG, "U"),
            (TcpFlags::ACK, "A"),
            (TcpFlags::PSH, "P"),
            (TcpFlags::RST, "R"),
            (TcpFlags::SYN, "S"),
            (TcpFlags::FIN, "F"),
        ];
        let mut any = false;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                f.write_str(name)?;
                any = true;
            }
        }
        if !any {
            f.write_str(".")?;
        }
        Ok(())
    }
}

/// A validated TCP header borrowed from a captured packet.
#[derive(Clone, Copy)]
pub struct TcpHeader<'a> {
    bytes: &'a [u8],
}

impl<'a> TcpHeader<'a> {
    /// Validate `segment` (TCP header followed by payload) and split it into
    /// the header view and the payload slice.
    pub fn parse(segment: &'a [u8]) -> Result<(Self, &'a [u8])> {
        if segment.len() < MIN_HEADER_LEN {
            return Err(MalformedReason::HeaderTooShort { len: segment.len() }.into());
        }

        let offset = segment[12] >> 4;
        if offset < 5 {
            return Err(MalformedReason::DataOffsetTooSmall { offset }.into());
        }

        let header_len = usize::from(offset) * 4;
        if header_len > segment.len() {
            return Err(MalformedReason::OptionsOverrun {
                declared: header_len,
                available: segment.len(),
            }
            .into());
        }

        let (bytes, payload) = segment.split_at(header_len);
        Ok((Self { bytes }, payload))
    }

    #[must_use]
    pub fn source_port(&self) -> u16 {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]])
    }

    #[must_use]
    pub fn dest_port(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    #[must_use]
    pub fn sequence_number(&self) -> SeqNum {
        SeqNum::new(u32::from_be_bytes([
            self.bytes[4],
            self.bytes[5],
            self.bytes[6],
            self.bytes[7],
        ]))
    }

    #[must_use]
    pub fn ack_number(&self) -> SeqNum {
        SeqNum::new(u32::from_be_bytes([
            self.bytes[8],
            self.bytes[9],
            self.bytes[10],
            self.bytes[11],
        ]))
    }

    #[must_use]
    pub fn header_len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits(self.bytes[13])
    }

    #[must_use]
    pub fn window(&self) -> u16 {
        u16::from_be_bytes([self.bytes[14], self.bytes[15]])
    }

    /// Raw option bytes between the fixed header and the payload.
    #[must_use]
    pub fn options(&self) -> &'a [u8] {
        &self.bytes[MIN_HEADER_LEN..]
    }
}

impl fmt::Debug for TcpHeader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpHeader")
            .field("src_port", &self.source_port())
            .field("dst_port", &self.dest_port())
            .field("seq", &self.sequence_number())
            .field("ack", &self.ack_number())
            .field("flags", &self.flags())
            .field("window", &self.window())
            .field("options_len", &self.options().len())
            .finish()
    }
}
