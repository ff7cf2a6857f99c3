//! High-availability replication of session state.
//!
//! The flow layer marks a session updated or deleted through [`FlowHaState`];
//! the HA transport asks for an encoded message and ships it to the standby,
//! which decodes it back into a [`SessionState`]. Content is produced by a fixed
//! table of clients, each owning one record of the message.
//!
//! Message layout, all integers big-endian:
//!
//! ```text
//! event u8 | version u8 | total_length u16 | key_type u8
//! flow key: src ip | dst ip | src port u16 | dst port u16 | protocol u8
//! per client: client u8 | length u16 | bytes
//! ```

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::packet::{FlowId, MAX_WINDOW_SCALE, SeqNum};
use crate::stream::{SessionState, TcpPhase};

pub const HA_VERSION: u8 = 1;
pub const HA_DELETE_EVENT: u8 = 1;
pub const HA_UPDATE_EVENT: u8 = 2;

const KEY_TYPE_IPV4: u8 = 4;
const KEY_TYPE_IPV6: u8 = 6;
const HEADER_LEN: usize = 5;

/// Replication status of one flow: status flags, a priority and the set of
/// clients whose content changed since the last update was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowHaState {
    flags: u8,
    pending: u16,
}

impl Default for FlowHaState {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowHaState {
    pub const CREATED: u8 = 0x01;
    pub const MODIFIED: u8 = 0x02;
    pub const DELETED: u8 = 0x04;
    pub const STANDBY: u8 = 0x08;
    pub const MAJOR: u8 = 0x10;
    pub const CRITICAL: u8 = 0x20;

    const PRIORITY_MASK: u8 = 0x30;

    /// A newly created flow: the session record is due.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flags: Self::CREATED,
            pending: HaClient::Session.bit(),
        }
    }

    /// A flow rebuilt from a replicated message on the standby.
    #[must_use]
    pub const fn standby() -> Self {
        Self {
            flags: Self::STANDBY,
            pending: 0,
        }
    }

    #[must_use]
    pub const fn flags(&self) -> u8 {
        self.flags
    }

    #[must_use]
    pub const fn check(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn clear(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    /// Replace the priority bits with `priority` (`MAJOR`, `CRITICAL` or 0).
    pub fn set_priority(&mut self, priority: u8) {
        self.flags = (self.flags & !Self::PRIORITY_MASK) | (priority & Self::PRIORITY_MASK);
    }

    #[must_use]
    pub const fn is_critical(&self) -> bool {
        self.check(Self::CRITICAL)
    }

    #[must_use]
    pub const fn is_major(&self) -> bool {
        self.check(Self::MAJOR)
    }

    /// Note that `client`'s content changed. The session record always rides
    /// along with any update.
    pub fn mark_updated(&mut self, client: HaClient) {
        self.flags |= Self::MODIFIED;
        self.pending |= client.bit() | HaClient::Session.bit();
    }

    pub fn mark_deleted(&mut self) {
        self.flags |= Self::DELETED;
    }

    #[must_use]
    pub const fn is_pending(&self, client: HaClient) -> bool {
        self.pending & client.bit() != 0
    }

    #[must_use]
    pub const fn pending(&self) -> u16 {
        self.pending
    }

    /// An update message should be sent.
    #[must_use]
    pub const fn is_update_pending(&self) -> bool {
        self.check(Self::CREATED | Self::MODIFIED) && !self.check(Self::DELETED)
    }

    /// Clear creation and modification status and return the pending set.
    pub fn take_pending(&mut self) -> u16 {
        self.flags &= !(Self::CREATED | Self::MODIFIED);
        core::mem::take(&mut self.pending)
    }
}

/// Producers of HA content, by their fixed handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HaClient {
    /// Phase and per-direction tracker state.
    Session,
    /// The flow's stream configuration.
    Policy,
}

type Produce = fn(&SessionState) -> Result<Vec<u8>>;
type Consume = fn(&mut Restore, &[u8]) -> Result<()>;

struct ClientOps {
    produce: Produce,
    consume: Consume,
}

static CLIENTS: [ClientOps; 2] = [
    ClientOps {
        produce: produce_session,
        consume: consume_session,
    },
    ClientOps {
        produce: produce_policy,
        consume: consume_policy,
    },
];

impl HaClient {
    pub const ALL: [HaClient; 2] = [HaClient::Session, HaClient::Policy];

    #[must_use]
    pub const fn handle(self) -> u8 {
        match self {
            HaClient::Session => 0,
            HaClient::Policy => 1,
        }
    }

    #[must_use]
    pub const fn bit(self) -> u16 {
        1 << self.handle()
    }

    #[must_use]
    pub fn from_handle(handle: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.handle() == handle)
    }

    fn ops(self) -> &'static ClientOps {
        &CLIENTS[usize::from(self.handle())]
    }
}

/// Tracker fields replicated for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub isn: Option<SeqNum>,
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub window: Option<u16>,
    pub timestamp: u32,
    pub fin_seq: Option<SeqNum>,
    pub last_ack: Option<SeqNum>,
    pub next_expected: Option<SeqNum>,
}

/// Everything needed to resume validating a flow on another instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub flow: FlowId,
    pub policy_id: u32,
    pub phase: TcpPhase,
    pub client: TrackerSnapshot,
    pub server: TrackerSnapshot,
}

impl SessionSnapshot {
    /// Reject snapshots whose phase and sequence fields contradict each other.
    pub fn validate(&self) -> Result<()> {
        for tracker in [&self.client, &self.server] {
            if tracker.window_scale.is_some_and(|s| s > MAX_WINDOW_SCALE) {
                return Err(Error::InconsistentSnapshot("window scale above 14"));
            }
            if let (Some(isn), Some(next)) = (tracker.isn, tracker.next_expected)
                && next.is_before(isn + 1)
            {
                return Err(Error::InconsistentSnapshot("stream position precedes ISN"));
            }
            if let Some(fin) = tracker.fin_seq {
                match tracker.next_expected {
                    None => {
                        return Err(Error::InconsistentSnapshot("FIN without stream position"));
                    }
                    Some(next) if fin.is_before(next) => {
                        return Err(Error::InconsistentSnapshot("delivered data beyond FIN"));
                    }
                    Some(_) => {}
                }
            }
        }

        let client_fin = self.client.fin_seq.is_some();
        let server_fin = self.server.fin_seq.is_some();
        let consistent = match self.phase {
            TcpPhase::Closed => true,
            TcpPhase::Listen => {
                self.client == TrackerSnapshot::default()
                    && self.server == TrackerSnapshot::default()
            }
            TcpPhase::SynReceived => {
                self.client.isn.is_some() && self.server.isn.is_none() && !client_fin && !server_fin
            }
            TcpPhase::SynSent => self.server.isn.is_some() && !client_fin && !server_fin,
            TcpPhase::Established => {
                (self.client.next_expected.is_some() || self.server.next_expected.is_some())
                    && !client_fin
                    && !server_fin
            }
            TcpPhase::FinWait1 | TcpPhase::FinWait2 => server_fin && !client_fin,
            TcpPhase::CloseWait => client_fin && !server_fin,
            TcpPhase::Closing | TcpPhase::LastAck | TcpPhase::TimeWait => client_fin && server_fin,
        };
        if consistent {
            Ok(())
        } else {
            Err(Error::InconsistentSnapshot(
                "phase contradicts handshake or FIN state",
            ))
        }
    }
}

/// A decoded HA message.
#[derive(Debug)]
pub enum HaRecord {
    Update(Box<SessionState>),
    Delete(FlowId),
}

#[derive(Default)]
struct Restore {
    session: Option<SessionSnapshot>,
    config: Option<StreamConfig>,
}

fn produce_session(session: &SessionState) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&session.snapshot())?)
}

fn consume_session(restore: &mut Restore, bytes: &[u8]) -> Result<()> {
    restore.session = Some(serde_json::from_slice(bytes)?);
    Ok(())
}

fn produce_policy(session: &SessionState) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(session.config())?)
}

fn consume_policy(restore: &mut Restore, bytes: &[u8]) -> Result<()> {
    restore.config = Some(serde_json::from_slice(bytes)?);
    Ok(())
}

/// Encode an update carrying the session record plus every pending client.
/// Clears the pending set once the message is built.
pub fn encode_update(session: &mut SessionState) -> Result<Vec<u8>> {
    let pending = session.ha().pending() | HaClient::Session.bit();
    let mut message = header(HA_UPDATE_EVENT, &session.flow());

    for client in HaClient::ALL {
        if pending & client.bit() == 0 {
            continue;
        }
        let content = (client.ops().produce)(session)?;
        let len = u16::try_from(content.len())
            .map_err(|_| Error::HaMessage("client record too long"))?;
        message.push(client.handle());
        message.extend_from_slice(&len.to_be_bytes());
        message.extend_from_slice(&content);
    }

    finish(&mut message)?;
    session.ha_mut().take_pending();
    debug!(flow = %session.flow(), len = message.len(), "Encoded HA update");
    Ok(message)
}

/// Encode a deletion notice for `flow`.
pub fn encode_delete(flow: &FlowId) -> Result<Vec<u8>> {
    let mut message = header(HA_DELETE_EVENT, flow);
    finish(&mut message)?;
    Ok(message)
}

/// Decode a message. `default_config` applies when the sender did not include
/// a policy record.
pub fn decode(bytes: &[u8], default_config: StreamConfig) -> Result<HaRecord> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::HaMessage("message shorter than its header"));
    }
    let mut reader = Reader::new(bytes);
    let event = reader.u8()?;
    let version = reader.u8()?;
    if version != HA_VERSION {
        return Err(Error::HaMessage("unsupported version"));
    }
    let total = usize::from(reader.u16()?);
    if total != bytes.len() {
        return Err(Error::HaMessage("length field disagrees with message size"));
    }
    let key_type = reader.u8()?;
    let flow = read_key(&mut reader, key_type)?;

    match event {
        HA_DELETE_EVENT => Ok(HaRecord::Delete(flow)),
        HA_UPDATE_EVENT => {
            let mut restore = Restore::default();
            while !reader.is_empty() {
                let handle = reader.u8()?;
                let len = usize::from(reader.u16()?);
                let content = reader.take(len)?;
                let Some(client) = HaClient::from_handle(handle) else {
                    warn!(handle, "Unknown HA client in message");
                    return Err(Error::HaMessage("unknown client"));
                };
                (client.ops().consume)(&mut restore, content)?;
            }

            let snapshot = restore
                .session
                .ok_or(Error::HaMessage("update without session record"))?;
            if snapshot.flow != flow {
                return Err(Error::InconsistentSnapshot("snapshot flow differs from key"));
            }
            let config = restore.config.unwrap_or(default_config);
            Ok(HaRecord::Update(Box::new(SessionState::restore(
                &snapshot, config,
            )?)))
        }
        _ => Err(Error::HaMessage("unknown event")),
    }
}

fn header(event: u8, flow: &FlowId) -> Vec<u8> {
    let key_type = match flow.src_ip {
        IpAddr::V4(_) => KEY_TYPE_IPV4,
        IpAddr::V6(_) => KEY_TYPE_IPV6,
    };
    let mut message = vec![event, HA_VERSION, 0, 0, key_type];
    for ip in [flow.src_ip, flow.dst_ip] {
        match ip {
            IpAddr::V4(ip) => message.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => message.extend_from_slice(&ip.octets()),
        }
    }
    message.extend_from_slice(&flow.src_port.to_be_bytes());
    message.extend_from_slice(&flow.dst_port.to_be_bytes());
    message.push(flow.protocol);
    message
}

fn finish(message: &mut [u8]) -> Result<()> {
    let total =
        u16::try_from(message.len()).map_err(|_| Error::HaMessage("message too long"))?;
    message[2..4].copy_from_slice(&total.to_be_bytes());
    Ok(())
}

fn read_key(reader: &mut Reader<'_>, key_type: u8) -> Result<FlowId> {
    let (src_ip, dst_ip) = match key_type {
        KEY_TYPE_IPV4 => (
            IpAddr::V4(Ipv4Addr::from(reader.array::<4>()?)),
            IpAddr::V4(Ipv4Addr::from(reader.array::<4>()?)),
        ),
        KEY_TYPE_IPV6 => (
            IpAddr::V6(Ipv6Addr::from(reader.array::<16>()?)),
            IpAddr::V6(Ipv6Addr::from(reader.array::<16>()?)),
        ),
        _ => return Err(Error::HaMessage("unknown key type")),
    };
    Ok(FlowId {
        src_ip,
        dst_ip,
        src_port: reader.u16()?,
        dst_port: reader.u16()?,
        protocol: reader.u8()?,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(Error::HaMessage("truncated message"));
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }
}
