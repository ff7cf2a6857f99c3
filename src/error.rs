use core::fmt::Debug;
use core::fmt::Display;

/// Why a captured TCP header could not be turned into a segment descriptor.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// Fewer than 20 bytes of TCP header were captured.
    HeaderTooShort { len: usize },
    /// Data offset field is below the 5-word minimum.
    DataOffsetTooSmall { offset: u8 },
    /// Data offset points past the captured bytes.
    OptionsOverrun { declared: usize, available: usize },
    /// An option's length byte is smaller than 2 or runs past the options region.
    BadOptionLength { kind: u8, len: u8 },
}

pub enum Error {
    MalformedSegment(MalformedReason),
    InconsistentSnapshot(&'static str),
    HaMessage(&'static str),
    Serialization(serde_json::Error),
    FatalInconsistency(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;

impl core::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Debug for MalformedReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MalformedReason::HeaderTooShort { len } => {
                write!(f, "header too short: {len} bytes")
            }
            MalformedReason::DataOffsetTooSmall { offset } => {
                write!(f, "data offset {offset} below minimum of 5 words")
            }
            MalformedReason::OptionsOverrun {
                declared,
                available,
            } => write!(
                f,
                "options overrun: header declares {declared} bytes, {available} captured"
            ),
            MalformedReason::BadOptionLength { kind, len } => {
                write!(f, "option {kind} has invalid length {len}")
            }
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::MalformedSegment(reason) => write!(f, "Malformed segment: {reason:?}"),
            Error::InconsistentSnapshot(s) => write!(f, "Inconsistent session snapshot: {s}"),
            Error::HaMessage(s) => write!(f, "Bad HA message: {s}"),
            Error::Serialization(e) => write!(f, "Serialization error: {e:?}"),
            Error::FatalInconsistency(s) => write!(f, "Internal invariant violated: {s}"),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e)
    }
}

impl From<MalformedReason> for Error {
    fn from(reason: MalformedReason) -> Self {
        Error::MalformedSegment(reason)
    }
}
