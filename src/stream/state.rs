use core::fmt;

use serde::{Deserialize, Serialize};

/// Connection phase as seen from the listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TcpPhase {
    Closed,
    /// First segment of the flow not yet seen.
    #[default]
    Listen,
    /// The server's SYN+ACK was seen without the client's SYN.
    SynSent,
    /// The client's SYN was seen.
    SynReceived,
    Established,
    /// The server sent FIN first.
    #[serde(rename = "FIN_WAIT_1")]
    FinWait1,
    #[serde(rename = "FIN_WAIT_2")]
    FinWait2,
    /// The client sent FIN first.
    CloseWait,
    /// Both FINs crossed before either was acknowledged.
    Closing,
    LastAck,
    TimeWait,
}

impl TcpPhase {
    /// Phases in which data may flow and the handshake is complete.
    #[must_use]
    pub const fn is_synchronized(self) -> bool {
        !matches!(
            self,
            TcpPhase::Closed | TcpPhase::Listen | TcpPhase::SynSent | TcpPhase::SynReceived
        )
    }

    /// Phases reached only after a FIN was seen.
    #[must_use]
    pub const fn is_closing(self) -> bool {
        matches!(
            self,
            TcpPhase::FinWait1
                | TcpPhase::FinWait2
                | TcpPhase::CloseWait
                | TcpPhase::Closing
                | TcpPhase::LastAck
                | TcpPhase::TimeWait
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            TcpPhase::Closed => "CLOSED",
            TcpPhase::Listen => "LISTEN",
            TcpPhase::SynSent => "SYN_SENT",
            TcpPhase::SynReceived => "SYN_RECEIVED",
            TcpPhase::Established => "ESTABLISHED",
            TcpPhase::FinWait1 => "FIN_WAIT_1",
            TcpPhase::FinWait2 => "FIN_WAIT_2",
            TcpPhase::CloseWait => "CLOSE_WAIT",
            TcpPhase::Closing => "CLOSING",
            TcpPhase::LastAck => "LAST_ACK",
            TcpPhase::TimeWait => "TIME_WAIT",
        }
    }
}

impl fmt::Display for TcpPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
