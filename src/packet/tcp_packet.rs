use core::time::Duration;

use crate::error::Result;

use super::{FlowId, TcpHeader};

/// One captured TCP segment as delivered by the packet source: the flow it was
/// seen on (oriented source to destination), the validated header, the payload
/// slice and the capture timestamp.
#[derive(Debug, Clone, Copy)]
pub struct TcpPacket<'a> {
    pub flow: FlowId,
    pub header: TcpHeader<'a>,
    pub payload: &'a [u8],
    pub arrival: Duration,
}

impl<'a> TcpPacket<'a> {
    /// Validate the TCP header of `segment` and split off the payload.
    pub fn parse(flow: FlowId, segment: &'a [u8], arrival: Duration) -> Result<Self> {
        let (header, payload) = TcpHeader::parse(segment)?;
        Ok(Self {
            flow,
            header,
            payload,
            arrival,
        })
    }

    /// Decode a captured link-layer or IP frame. `Ok(None)` for frames that are
    /// not TCP; `Err` for TCP frames whose header is malformed.
    pub fn from_frame(frame: &'a [u8], arrival: Duration) -> Result<Option<Self>> {
        let Some((flow, segment)) = FlowId::from_frame(frame) else {
            return Ok(None);
        };
        Self::parse(flow, segment, arrival).map(Some)
    }
}
