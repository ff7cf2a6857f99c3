//! TCP option walking.
//!
//! The options region is a sequence of `kind, length, data` records with the
//! single-byte EOL and NOP kinds as exceptions. Lookups scan the region once and
//! stop at the first match.

use crate::error::{MalformedReason, Result};

const EOL: u8 = 0;
const NOP: u8 = 1;
const MAXSEG: u8 = 2;
const WSCALE: u8 = 3;
const TIMESTAMP: u8 = 8;

/// Largest shift a window-scale option may request (RFC 7323 section 2.3).
pub const MAX_WINDOW_SCALE: u8 = 14;

/// One option record: the kind byte and its data (without kind/length bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOption<'a> {
    pub kind: u8,
    pub data: &'a [u8],
}

/// Iterator over option records. Yields an error once, then stops, when a
/// record's length is inconsistent with the region.
#[derive(Debug, Clone)]
pub struct TcpOptions<'a> {
    rest: &'a [u8],
}

impl<'a> TcpOptions<'a> {
    #[must_use]
    pub fn new(options: &'a [u8]) -> Self {
        Self { rest: options }
    }

    /// Walk the whole region, failing on the first malformed record.
    pub fn validate(options: &'a [u8]) -> Result<()> {
        Self::new(options).try_for_each(|opt| opt.map(|_| ()))
    }
}

impl<'a> Iterator for TcpOptions<'a> {
    type Item = Result<TcpOption<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (&kind, tail) = self.rest.split_first()?;
            match kind {
                EOL => {
                    self.rest = &[];
                    return None;
                }
                NOP => self.rest = tail,
                _ => {
                    let Some(&len) = tail.first() else {
                        self.rest = &[];
                        return Some(Err(MalformedReason::BadOptionLength { kind, len: 0 }.into()));
                    };
                    let len_usize = usize::from(len);
                    if len < 2 || len_usize > self.rest.len() {
                        self.rest = &[];
                        return Some(Err(MalformedReason::BadOptionLength { kind, len }.into()));
                    }
                    let data = &self.rest[2..len_usize];
                    self.rest = &self.rest[len_usize..];
                    return Some(Ok(TcpOption { kind, data }));
                }
            }
        }
    }
}

fn find(options: &[u8], kind: u8) -> Option<&[u8]> {
    TcpOptions::new(options)
        .map_while(core::result::Result::ok)
        .find(|opt| opt.kind == kind)
        .map(|opt| opt.data)
}

/// MSS value from a MAXSEG option, if present.
#[must_use]
pub fn extract_mss(options: &[u8]) -> Option<u16> {
    match find(options, MAXSEG)? {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Shift count from a WSCALE option, clamped to [`MAX_WINDOW_SCALE`].
#[must_use]
pub fn extract_window_scale(options: &[u8]) -> Option<u8> {
    find(options, WSCALE)?
        .first()
        .map(|&shift| shift.min(MAX_WINDOW_SCALE))
}

#[must_use]
pub fn has_window_scale(options: &[u8]) -> bool {
    extract_window_scale(options).is_some()
}

/// `TSval` of a TIMESTAMP option, 0 when absent.
#[must_use]
pub fn extract_timestamp(options: &[u8]) -> u32 {
    match find(options, TIMESTAMP) {
        Some([a, b, c, d, ..]) => u32::from_be_bytes([*a, *b, *c, *d]),
        _ => 0,
    }
}
