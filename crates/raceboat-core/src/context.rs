//! Per-operation state, gathered behind one `Context` enum (§3, §9). All
//! inter-context references are `RaceHandle`s resolved through the
//! manager's lookup tables — never a direct reference to another context —
//! so contexts can live by value in one owning map.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use raceboat_plugin::{ApiStatus, ChannelId, ConnectionId, LinkId, RaceHandle};
use tokio::sync::oneshot;

use crate::envelope::PackageId;
use crate::sm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Send,
    Recv,
}

/// §4.4. Tracks a live (or coming-up) connection and everyone depending on
/// it. Closed and torn down only once `dependents` is empty.
pub struct ConnectionContext {
    pub state: sm::connection::State,
    pub dependents: HashSet<RaceHandle>,
    pub newest_dependent: Option<RaceHandle>,
    pub detached_dependent: Option<RaceHandle>,
    pub direction: ConnectionDirection,
    pub channel_id: ChannelId,
    pub channel_role: String,
    /// Peer address to load a link from (send side talking to a known
    /// address) or `None` when this side creates a fresh link (recv side,
    /// or a sender that has no address yet).
    pub target_link_address: Option<String>,
    pub link_address: Option<String>,
    pub updated_link_address: Option<String>,
    pub link_id: Option<LinkId>,
    pub connection_id: Option<ConnectionId>,
    pub link_waiters: Vec<oneshot::Sender<Result<(), ApiStatus>>>,
    pub connected_waiters: Vec<oneshot::Sender<Result<(), ApiStatus>>>,
}

impl ConnectionContext {
    pub fn new(
        direction: ConnectionDirection,
        channel_id: ChannelId,
        channel_role: String,
        target_link_address: Option<String>,
    ) -> Self {
        ConnectionContext {
            state: sm::connection::State::Initial,
            dependents: HashSet::new(),
            newest_dependent: None,
            detached_dependent: None,
            direction,
            channel_id,
            channel_role,
            target_link_address,
            link_address: None,
            updated_link_address: None,
            link_id: None,
            connection_id: None,
            link_waiters: Vec::new(),
            connected_waiters: Vec::new(),
        }
    }
}

/// §4.5. Fire-and-forget send.
pub struct SendContext {
    pub state: sm::send::State,
    pub connection_handle: RaceHandle,
    pub payload: Bytes,
    pub callback: Option<oneshot::Sender<ApiStatus>>,
}

/// §4.5. Queues payloads that arrive before `receive()` is called.
pub struct RecvContext {
    pub state: sm::recv::State,
    pub connection_handle: RaceHandle,
    pub link_address: Option<String>,
    pub data: VecDeque<Bytes>,
    pub pending_receive: Option<oneshot::Sender<Result<Bytes, ApiStatus>>>,
    pub open_callback: Option<oneshot::Sender<(ApiStatus, Option<String>)>>,
}

/// §4.5. Opens recv then send, sends a hello carrying the recv address,
/// waits for exactly one response.
pub struct SendReceiveContext {
    pub state: sm::send_receive::State,
    pub recv_connection_handle: RaceHandle,
    pub send_connection_handle: RaceHandle,
    pub package_id: PackageId,
    pub outgoing_message: Bytes,
    pub send_channel: ChannelId,
    pub callback: Option<oneshot::Sender<Result<Bytes, ApiStatus>>>,
}

/// §4.6. One outstanding `listen()`: a recv connection registered for hello
/// envelopes under the zero packageId, a queue of unaccepted `PreConduit`s,
/// and a queue of callers blocked in `accept()`.
pub struct ListenContext {
    pub state: sm::listen::State,
    pub connection_handle: RaceHandle,
    pub recv_channel: ChannelId,
    pub send_channel: ChannelId,
    pub link_address: Option<String>,
    pub pending_pre_conduits: VecDeque<RaceHandle>,
    pub pending_accepts: VecDeque<oneshot::Sender<Result<RaceHandle, ApiStatus>>>,
    pub open_callback: Option<oneshot::Sender<(ApiStatus, Option<String>)>>,
}

/// §4.6. A received hello not yet accepted.
pub struct PreConduitContext {
    pub state: sm::pre_conduit::State,
    pub listener_handle: RaceHandle,
    pub recv_connection_handle: RaceHandle,
    pub send_connection_handle: Option<RaceHandle>,
    pub package_id: PackageId,
    pub peer_link_address: String,
    pub peer_reply_channel: ChannelId,
}

/// §4.6. A live send+recv pair filtered by `package_id`.
pub struct ConduitContext {
    pub state: sm::conduit::State,
    pub send_connection_handle: RaceHandle,
    pub recv_connection_handle: RaceHandle,
    pub package_id: PackageId,
    pub inbound: VecDeque<Bytes>,
    pub pending_read: Option<oneshot::Sender<Result<Bytes, ApiStatus>>>,
    pub pending_writes: VecDeque<oneshot::Sender<ApiStatus>>,
}

/// §4.7. Opens recv then send, sends the hello, and immediately hands the
/// caller a `Conduit` handle (writes queue behind the handshake).
pub struct DialContext {
    pub state: sm::dial::State,
    pub recv_connection_handle: RaceHandle,
    pub send_connection_handle: RaceHandle,
    pub package_id: PackageId,
    pub hello_message: Bytes,
    pub reply_channel: ChannelId,
    pub conduit_handle: Option<RaceHandle>,
    pub callback: Option<oneshot::Sender<Result<RaceHandle, ApiStatus>>>,
}

/// §4.7. Reconstructs a Conduit from both addresses and a previously-agreed
/// packageId, without a hello exchange.
pub struct ResumeContext {
    pub state: sm::resume::State,
    pub send_connection_handle: RaceHandle,
    pub recv_connection_handle: RaceHandle,
    pub package_id: PackageId,
    pub conduit_handle: Option<RaceHandle>,
    pub callback: Option<oneshot::Sender<Result<RaceHandle, ApiStatus>>>,
}

/// §4.8. Addresses exchanged on the initial channel before the real
/// conduit comes up on the final channel.
#[derive(Debug, Clone)]
pub struct BootstrapAddressSet {
    pub init_send_link_address: String,
    pub init_send_channel: ChannelId,
    pub init_recv_link_address: String,
    pub init_recv_channel: ChannelId,
    pub final_send_link_address: String,
    pub final_send_channel: ChannelId,
    pub final_recv_link_address: String,
    pub final_recv_channel: ChannelId,
}

pub struct BootstrapDialContext {
    pub state: sm::bootstrap_dial::State,
    pub initial_send_connection_handle: RaceHandle,
    pub initial_recv_connection_handle: RaceHandle,
    pub final_send_connection_handle: Option<RaceHandle>,
    pub final_recv_connection_handle: Option<RaceHandle>,
    pub package_id: PackageId,
    pub addresses: BootstrapAddressSet,
    pub role: String,
    pub conduit_handle: Option<RaceHandle>,
    pub callback: Option<oneshot::Sender<Result<RaceHandle, ApiStatus>>>,
}

pub struct BootstrapListenContext {
    pub state: sm::bootstrap_listen::State,
    pub connection_handle: RaceHandle,
    pub initial_recv_channel: ChannelId,
    pub final_send_channel: ChannelId,
    pub final_recv_channel: ChannelId,
    pub role: String,
    pub link_address: Option<String>,
    pub pending_pre_conduits: VecDeque<RaceHandle>,
    pub pending_accepts: VecDeque<oneshot::Sender<Result<RaceHandle, ApiStatus>>>,
    pub open_callback: Option<oneshot::Sender<(ApiStatus, Option<String>)>>,
}

/// §4.8. Bridges one received bootstrap hello into a conduit: the reply
/// connection on the initial channel carries the hello-response (this
/// side's own final-recv address) back to the dialer once both it and
/// the new final-recv connection are up; `response_sent` guards against
/// sending it twice if connections settle out of the expected order.
pub struct BootstrapPreConduitContext {
    pub state: sm::bootstrap_pre_conduit::State,
    pub listener_handle: RaceHandle,
    pub initial_recv_connection_handle: RaceHandle,
    pub initial_send_connection_handle: Option<RaceHandle>,
    pub final_send_connection_handle: Option<RaceHandle>,
    pub final_recv_connection_handle: Option<RaceHandle>,
    pub package_id: PackageId,
    pub peer_addresses: BootstrapAddressSet,
    pub response_sent: bool,
}

pub enum Context {
    Connection(ConnectionContext),
    Send(SendContext),
    Recv(RecvContext),
    SendReceive(SendReceiveContext),
    Listen(ListenContext),
    PreConduit(PreConduitContext),
    Conduit(ConduitContext),
    Dial(DialContext),
    Resume(ResumeContext),
    BootstrapDial(BootstrapDialContext),
    BootstrapListen(BootstrapListenContext),
    BootstrapPreConduit(BootstrapPreConduitContext),
}

impl Context {
    /// Human-readable tag, used by `debug_contexts` (§10.6) and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Context::Connection(_) => "Connection",
            Context::Send(_) => "Send",
            Context::Recv(_) => "Recv",
            Context::SendReceive(_) => "SendReceive",
            Context::Listen(_) => "Listen",
            Context::PreConduit(_) => "PreConduit",
            Context::Conduit(_) => "Conduit",
            Context::Dial(_) => "Dial",
            Context::Resume(_) => "Resume",
            Context::BootstrapDial(_) => "BootstrapDial",
            Context::BootstrapListen(_) => "BootstrapListen",
            Context::BootstrapPreConduit(_) => "BootstrapPreConduit",
        }
    }

    pub fn as_connection_mut(&mut self) -> Option<&mut ConnectionContext> {
        match self {
            Context::Connection(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_conduit_mut(&mut self) -> Option<&mut ConduitContext> {
        match self {
            Context::Conduit(c) => Some(c),
            _ => None,
        }
    }
}

/// A package that arrived before any context had registered for it (§3,
/// §4.9); replayed once a matching context registers.
pub struct UnassociatedPackage {
    pub arrived_at: Instant,
    pub payload: Bytes,
}
