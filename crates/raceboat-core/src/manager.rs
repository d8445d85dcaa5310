//! §4.9: the API manager. A thin public facade (this struct) backed by an
//! internal lookup-table-owning implementation. State mutation happens in
//! short, lock-held critical sections rather than one handler thread;
//! because every section is short and plugin calls always happen outside
//! the lock, at most one logical step of any context's state machine is
//! ever "in flight" at a time, which is the contract §5 actually asks for.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use raceboat_plugin::{
    ApiStatus, ChannelId, ChannelProperties, ChannelStatus, ConnectionId, ConnectionStatus,
    EncPkg, HandleGenerator, LinkId, LinkProperties, LinkStatus, LinkType, PackageStatus,
    PluginConfig, RaceHandle, TransportPlugin, NULL_RACE_HANDLE,
};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::config::RaceConfig;
use crate::context::{
    BootstrapAddressSet, BootstrapDialContext, BootstrapListenContext, BootstrapPreConduitContext,
    Context, ConduitContext, ConnectionContext, ConnectionDirection, DialContext, ListenContext,
    PreConduitContext, RecvContext, ResumeContext, SendContext, SendReceiveContext,
    UnassociatedPackage,
};
use crate::envelope::{self, BootstrapAddresses, PackageId};
use crate::error::{CoreError, CoreResult};
use crate::options::{BootstrapOptions, ConnectionOptions, ResumeOptions};
use crate::plugin_wrapper::PluginWrapper;
use crate::sm;

struct ChannelActivation {
    status: ChannelStatus,
    properties: ChannelProperties,
    waiters: Vec<oneshot::Sender<Result<ChannelProperties, ApiStatus>>>,
}

#[derive(Default)]
struct ManagerInner {
    contexts: HashMap<RaceHandle, Context>,
    channel_activation: HashMap<ChannelId, ChannelActivation>,
    link_conn_map: HashMap<(ChannelId, String), RaceHandle>,
    connection_index: HashMap<ConnectionId, RaceHandle>,
    link_index: HashMap<LinkId, RaceHandle>,
    package_id_index: HashMap<PackageId, RaceHandle>,
    unassociated_packages: HashMap<ConnectionId, VecDeque<UnassociatedPackage>>,
    next_link_id: u64,
    next_connection_id: u64,
}

impl Default for ChannelActivation {
    fn default() -> Self {
        ChannelActivation {
            status: ChannelStatus::Undef,
            properties: ChannelProperties::default(),
            waiters: Vec::new(),
        }
    }
}

/// Owns every context, the lookup indices, and the plugins backing each
/// channel. Construct with [`ApiManager::new`], register plugins with
/// [`ApiManager::register_plugin`], then drive the public operations.
pub struct ApiManager {
    inner: Mutex<ManagerInner>,
    plugins: parking_lot::RwLock<HashMap<ChannelId, Arc<PluginWrapper>>>,
    handles: HandleGenerator,
    config: RaceConfig,
    idle_notify: tokio::sync::Notify,
}

impl ApiManager {
    pub fn new(config: RaceConfig) -> Arc<Self> {
        Arc::new(ApiManager {
            inner: Mutex::new(ManagerInner::default()),
            plugins: parking_lot::RwLock::new(HashMap::new()),
            handles: HandleGenerator::new(),
            config,
            idle_notify: tokio::sync::Notify::new(),
        })
    }

    /// Registers a plugin as the transport for one or more channels, and
    /// runs its `init` (§4.2). The caller is expected to have already built
    /// the plugin with an `Arc<dyn PluginSdk>` (a [`crate::sdk_wrapper::SdkWrapper`])
    /// bound to this same manager.
    pub async fn register_plugin(
        self: &Arc<Self>,
        channel_ids: Vec<ChannelId>,
        plugin_id: impl Into<String>,
        plugin: Arc<dyn TransportPlugin>,
    ) -> CoreResult<()> {
        let wrapper = PluginWrapper::new(plugin, self.config.clone());
        let handle = self.handles.next();
        let config = PluginConfig {
            plugin_id: plugin_id.into(),
            channel_ids: channel_ids.iter().map(|c| c.as_str().to_string()).collect(),
        };
        let resp = wrapper.init(handle, config).await;
        if resp.status != ApiStatus::Ok {
            return Err(CoreError::PluginError(handle.raw()));
        }
        let mut plugins = self.plugins.write();
        for channel in channel_ids {
            plugins.insert(channel, wrapper.clone());
        }
        Ok(())
    }

    fn plugin_for_channel(&self, channel: &ChannelId) -> CoreResult<Arc<PluginWrapper>> {
        self.plugins
            .read()
            .get(channel)
            .cloned()
            .ok_or_else(|| CoreError::ChannelNotActivated(channel.as_str().to_string()))
    }

    // ---- id generation (§3: "issued by the plugin via a generator supplied
    // by the core"; the plugin calls these back synchronously through the
    // SDK wrapper) ----

    pub fn generate_link_id(&self, channel_gid: &ChannelId) -> LinkId {
        let mut inner = self.inner.lock();
        inner.next_link_id += 1;
        LinkId::from(format!("{}/link-{}", channel_gid.as_str(), inner.next_link_id))
    }

    pub fn generate_connection_id(&self, link_id: &LinkId) -> ConnectionId {
        let mut inner = self.inner.lock();
        inner.next_connection_id += 1;
        ConnectionId::from(format!("{}/conn-{}", link_id.as_str(), inner.next_connection_id))
    }

    // ---- channel activation ----

    async fn ensure_channel_activated(&self, channel: &ChannelId, role: &str) -> CoreResult<ChannelProperties> {
        let mut rx = None;
        {
            let mut inner = self.inner.lock();
            let entry = inner.channel_activation.entry(channel.clone()).or_default();
            match entry.status {
                ChannelStatus::Available => return Ok(entry.properties.clone()),
                ChannelStatus::Failed | ChannelStatus::Unsupported | ChannelStatus::Unavailable => {
                    return Err(CoreError::ChannelUnavailable(channel.as_str().to_string(), entry.status));
                }
                ChannelStatus::Undef => {
                    entry.status = ChannelStatus::Starting;
                }
                ChannelStatus::Starting | ChannelStatus::Enabled | ChannelStatus::Disabled => {
                    let (tx, waiter) = oneshot::channel();
                    entry.waiters.push(tx);
                    rx = Some(waiter);
                }
            }
        }
        if let Some(rx) = rx {
            return rx.await.map_err(|_| CoreError::Internal("channel activation waiter dropped".into()))?
                .map_err(|status| CoreError::ChannelUnavailable(channel.as_str().to_string(), status_for(status)));
        }

        let plugin = self.plugin_for_channel(channel)?;
        let handle = self.handles.next();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.channel_activation.entry(channel.clone()).or_default().waiters.push(tx);
        }
        let resp = plugin.activate_channel(handle, channel.clone(), role.to_string()).await;
        if resp.status != ApiStatus::Ok {
            self.fail_channel_activation(channel, ApiStatus::PluginError);
            return Err(CoreError::PluginError(handle.raw()));
        }
        rx.await
            .map_err(|_| CoreError::Internal("channel activation waiter dropped".into()))?
            .map_err(|status| CoreError::ChannelUnavailable(channel.as_str().to_string(), status_for(status)))
    }

    fn fail_channel_activation(&self, channel: &ChannelId, status: ApiStatus) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.channel_activation.get_mut(channel) {
            entry.status = ChannelStatus::Failed;
            for tx in entry.waiters.drain(..) {
                let _ = tx.send(Err(status));
            }
        }
    }

    // ---- connection bring-up (§4.4) ----

    async fn attach_to_connection(
        &self,
        direction: ConnectionDirection,
        channel: ChannelId,
        role: String,
        target_address: Option<String>,
        dependent: RaceHandle,
    ) -> CoreResult<RaceHandle> {
        let dedup_key = target_address.clone().map(|addr| (channel.clone(), addr));
        let mut needs_bring_up = false;
        let mut already_connected = false;
        let mut waiter_rx = None;

        let connection_handle = {
            let mut inner = self.inner.lock();
            let existing = dedup_key
                .as_ref()
                .and_then(|k| inner.link_conn_map.get(k).copied())
                .filter(|h| inner.contexts.contains_key(h));
            let handle = match existing {
                Some(h) => h,
                None => {
                    let new_handle = self.handles.next();
                    let ctx = ConnectionContext::new(direction, channel.clone(), role.clone(), target_address.clone());
                    inner.contexts.insert(new_handle, Context::Connection(ctx));
                    if let Some(key) = &dedup_key {
                        inner.link_conn_map.insert(key.clone(), new_handle);
                    }
                    needs_bring_up = true;
                    new_handle
                }
            };
            if let Some(ctx) = inner.contexts.get_mut(&handle).and_then(Context::as_connection_mut) {
                ctx.dependents.insert(dependent);
                ctx.newest_dependent = Some(dependent);
                if ctx.state == sm::connection::State::Connected {
                    already_connected = true;
                } else {
                    let (tx, rx) = oneshot::channel();
                    ctx.connected_waiters.push(tx);
                    waiter_rx = Some(rx);
                }
            }
            handle
        };

        if needs_bring_up {
            self.bring_up_connection(connection_handle).await;
        }

        if already_connected {
            self.notify_dependent_connected(dependent, connection_handle).await;
        } else if let Some(rx) = waiter_rx {
            match rx.await {
                Ok(Ok(())) => self.notify_dependent_connected(dependent, connection_handle).await,
                Ok(Err(status)) => return Err(CoreError::ConnectionFailed(status)),
                Err(_) => return Err(CoreError::Internal("connection waiter dropped".into())),
            }
        }
        Ok(connection_handle)
    }

    async fn bring_up_connection(&self, handle: RaceHandle) {
        if let Err(status) = self.bring_up_connection_inner(handle).await {
            self.fail_connection(handle, status).await;
        }
    }

    async fn bring_up_connection_inner(&self, handle: RaceHandle) -> Result<(), ApiStatus> {
        let (channel, role, direction, target_address) = {
            let inner = self.inner.lock();
            let ctx = inner
                .contexts
                .get(&handle)
                .and_then(|c| match c {
                    Context::Connection(cc) => Some(cc),
                    _ => None,
                })
                .ok_or(ApiStatus::InternalError)?;
            (ctx.channel_id.clone(), ctx.channel_role.clone(), ctx.direction, ctx.target_link_address.clone())
        };

        self.ensure_channel_activated(&channel, &role).await.map_err(|e| e.to_api_status())?;
        self.with_connection_mut(handle, |ctx| {
            ctx.state = sm::connection::transition(ctx.state, &sm::connection::Event::ChannelActivated);
        });

        let plugin = self.plugin_for_channel(&channel).map_err(|e| e.to_api_status())?;

        let (link_tx, link_rx) = oneshot::channel();
        self.with_connection_mut(handle, |ctx| ctx.link_waiters.push(link_tx));
        let link_resp = match &target_address {
            Some(addr) => plugin.create_link_from_address(handle, channel.clone(), addr.clone()).await,
            None => plugin.create_link(handle, channel.clone()).await,
        };
        if link_resp.status != ApiStatus::Ok {
            return Err(link_resp.status);
        }
        link_rx.await.map_err(|_| ApiStatus::InternalError)??;
        self.with_connection_mut(handle, |ctx| {
            ctx.state = sm::connection::transition(ctx.state, &sm::connection::Event::LinkEstablished);
        });

        let (link_id, link_type) = {
            let inner = self.inner.lock();
            let ctx = inner
                .contexts
                .get(&handle)
                .and_then(|c| match c {
                    Context::Connection(cc) => Some(cc),
                    _ => None,
                })
                .ok_or(ApiStatus::InternalError)?;
            let link_id = ctx.link_id.clone().ok_or(ApiStatus::InternalError)?;
            let link_type = match ctx.direction {
                ConnectionDirection::Send => LinkType::Send,
                ConnectionDirection::Recv => LinkType::Recv,
            };
            (link_id, link_type)
        };

        let (conn_tx, conn_rx) = oneshot::channel();
        self.with_connection_mut(handle, |ctx| ctx.connected_waiters.push(conn_tx));
        let open_resp = plugin
            .open_connection(handle, link_type, link_id, String::new(), 0, None, None)
            .await;
        if open_resp.status != ApiStatus::Ok {
            return Err(open_resp.status);
        }
        conn_rx.await.map_err(|_| ApiStatus::InternalError)??;
        Ok(())
    }

    fn with_connection_mut<R>(&self, handle: RaceHandle, f: impl FnOnce(&mut ConnectionContext) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.contexts.get_mut(&handle).and_then(Context::as_connection_mut).map(f)
    }

    async fn fail_connection(&self, handle: RaceHandle, status: ApiStatus) {
        warn!(%handle, ?status, "connection bring-up failed");
        let (dependents, link_waiters, connected_waiters) = {
            let mut inner = self.inner.lock();
            if let Some(ctx) = inner.contexts.get_mut(&handle).and_then(Context::as_connection_mut) {
                ctx.state = sm::connection::State::Failed;
                (
                    ctx.dependents.iter().copied().collect::<Vec<_>>(),
                    std::mem::take(&mut ctx.link_waiters),
                    std::mem::take(&mut ctx.connected_waiters),
                )
            } else {
                (Vec::new(), Vec::new(), Vec::new())
            }
        };
        for tx in link_waiters {
            let _ = tx.send(Err(status));
        }
        for tx in connected_waiters {
            let _ = tx.send(Err(status));
        }
        for dependent in dependents {
            self.notify_dependent_failed(dependent, status).await;
        }
    }

    async fn notify_dependent_connected(&self, dependent: RaceHandle, connection_handle: RaceHandle) {
        let kind = {
            let inner = self.inner.lock();
            inner.contexts.get(&dependent).map(Context::kind)
        };
        match kind {
            Some("Send") => self.send_on_connected(dependent, connection_handle).await,
            Some("Recv") => self.recv_on_connected(dependent, connection_handle).await,
            Some("SendReceive") => self.send_receive_on_connected(dependent, connection_handle).await,
            Some("Listen") => self.listen_on_connected(dependent, connection_handle).await,
            Some("Dial") => self.dial_on_connected(dependent, connection_handle).await,
            Some("Resume") => self.resume_on_connected(dependent, connection_handle).await,
            Some("PreConduit") => self.pre_conduit_on_connected(dependent, connection_handle).await,
            Some("BootstrapDial") => self.bootstrap_dial_on_connected(dependent, connection_handle).await,
            Some("BootstrapListen") => self.bootstrap_listen_on_connected(dependent, connection_handle).await,
            Some("BootstrapPreConduit") => self.bootstrap_pre_conduit_on_connected(dependent, connection_handle).await,
            _ => {}
        }
        self.idle_notify.notify_waiters();
    }

    async fn notify_dependent_failed(&self, dependent: RaceHandle, status: ApiStatus) {
        let kind = {
            let inner = self.inner.lock();
            inner.contexts.get(&dependent).map(Context::kind)
        };
        match kind {
            Some("Send") => self.fail_send(dependent, status).await,
            Some("Recv") => self.fail_recv(dependent, status).await,
            Some("SendReceive") => self.fail_send_receive(dependent, status).await,
            Some("Dial") => self.fail_dial(dependent, status).await,
            Some("Resume") => self.fail_resume(dependent, status).await,
            _ => {}
        }
    }

    fn release_dependent(&self, connection_handle: RaceHandle, dependent: RaceHandle) -> bool {
        let mut should_close = false;
        {
            let mut inner = self.inner.lock();
            if let Some(ctx) = inner.contexts.get_mut(&connection_handle).and_then(Context::as_connection_mut) {
                ctx.dependents.remove(&dependent);
                should_close = ctx.dependents.is_empty();
            }
        }
        should_close
    }

    async fn tear_down_connection(&self, connection_handle: RaceHandle) {
        let (channel, connection_id, link_id) = {
            let mut inner = self.inner.lock();
            let Some(ctx) = inner.contexts.get_mut(&connection_handle).and_then(Context::as_connection_mut) else {
                return;
            };
            if !ctx.dependents.is_empty() {
                return;
            }
            ctx.state = sm::connection::transition(ctx.state, &sm::connection::Event::ConnClose);
            (ctx.channel_id.clone(), ctx.connection_id.clone(), ctx.link_id.clone())
        };
        if let Ok(plugin) = self.plugin_for_channel(&channel) {
            if let Some(connection_id) = connection_id.clone() {
                let _ = plugin.close_connection(connection_handle, connection_id.clone(), None).await;
                plugin.close_connection_queue(&connection_id);
            }
            if let Some(link_id) = link_id {
                let _ = plugin.destroy_link(connection_handle, link_id).await;
            }
        }
        let mut inner = self.inner.lock();
        inner.contexts.remove(&connection_handle);
        if let Some(id) = connection_id {
            inner.connection_index.remove(&id);
        }
        inner.link_conn_map.retain(|_, h| *h != connection_handle);
        self.idle_notify.notify_waiters();
    }

    // ---- Send (§4.5) ----

    pub async fn send(&self, opts: ConnectionOptions, payload: Bytes) -> ApiStatus {
        let (channel, role, address) = match (opts.send_channel, opts.send_role, opts.send_address) {
            (Some(c), Some(r), Some(a)) if !r.is_empty() && !a.is_empty() && !payload.is_empty() => (c, r, a),
            _ => return ApiStatus::InvalidArgument,
        };
        let handle = self.handles.next();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.contexts.insert(
                handle,
                Context::Send(SendContext {
                    state: sm::send::State::Initial,
                    connection_handle: NULL_RACE_HANDLE,
                    payload,
                    callback: Some(tx),
                }),
            );
        }
        if let Err(e) = self
            .attach_to_connection(ConnectionDirection::Send, channel, role, Some(address), handle)
            .await
        {
            self.fail_send(handle, e.to_api_status()).await;
        }
        rx.await.unwrap_or(ApiStatus::InternalError)
    }

    pub async fn send_str(&self, opts: ConnectionOptions, payload: &str) -> ApiStatus {
        self.send(opts, Bytes::copy_from_slice(payload.as_bytes())).await
    }

    async fn send_on_connected(&self, handle: RaceHandle, connection_handle: RaceHandle) {
        let (channel, connection_id, payload) = {
            let mut inner = self.inner.lock();
            let Some(Context::Send(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            ctx.connection_handle = connection_handle;
            ctx.state = sm::send::transition(ctx.state, &sm::send::Event::ConnConnected);
            let Some(conn) = inner.contexts.get(&connection_handle).and_then(|c| match c {
                Context::Connection(cc) => Some(cc),
                _ => None,
            }) else {
                return;
            };
            let Some(connection_id) = conn.connection_id.clone() else {
                return;
            };
            (conn.channel_id.clone(), connection_id, inner.contexts.get(&handle).and_then(|c| match c {
                Context::Send(s) => Some(s.payload.clone()),
                _ => None,
            }))
        };
        let Some(payload) = payload else { return };
        let Ok(plugin) = self.plugin_for_channel(&channel) else {
            self.fail_send(handle, ApiStatus::InternalError).await;
            return;
        };
        let resp = plugin
            .send_package(handle, connection_id, EncPkg::new(payload), None, 0)
            .await;
        if resp.status != ApiStatus::Ok {
            self.fail_send(handle, ApiStatus::InternalError).await;
        }
        // completion is reported on `onPackageStatusChanged`, handled below.
    }

    async fn fail_send(&self, handle: RaceHandle, status: ApiStatus) {
        let (connection_handle, callback) = {
            let mut inner = self.inner.lock();
            let Some(Context::Send(ctx)) = inner.contexts.remove(&handle).map(|c| c) else {
                return;
            };
            let Context::Send(ctx) = ctx else { unreachable!() };
            (ctx.connection_handle, ctx.callback)
        };
        if let Some(cb) = callback {
            let _ = cb.send(status);
        }
        if connection_handle != NULL_RACE_HANDLE {
            if self.release_dependent(connection_handle, handle) {
                self.tear_down_connection(connection_handle).await;
            }
        }
        self.idle_notify.notify_waiters();
    }

    async fn complete_send(&self, handle: RaceHandle, status: ApiStatus) {
        let (connection_handle, callback) = {
            let mut inner = self.inner.lock();
            let Some(Context::Send(ctx)) = inner.contexts.remove(&handle) else {
                return;
            };
            (ctx.connection_handle, ctx.callback)
        };
        if let Some(cb) = callback {
            let _ = cb.send(status);
        }
        if self.release_dependent(connection_handle, handle) {
            self.tear_down_connection(connection_handle).await;
        }
        self.idle_notify.notify_waiters();
    }

    // ---- Recv (§4.5) ----

    pub async fn receive(&self, opts: ConnectionOptions) -> (ApiStatus, Option<String>, RaceHandle) {
        let (channel, role) = match (opts.recv_channel, opts.recv_role) {
            (Some(c), Some(r)) if !r.is_empty() => (c, r),
            _ => return (ApiStatus::InvalidArgument, None, NULL_RACE_HANDLE),
        };
        let handle = self.handles.next();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.contexts.insert(
                handle,
                Context::Recv(RecvContext {
                    state: sm::recv::State::Initial,
                    connection_handle: NULL_RACE_HANDLE,
                    link_address: None,
                    data: VecDeque::new(),
                    pending_receive: None,
                    open_callback: Some(tx),
                }),
            );
        }
        if let Err(e) = self.attach_to_connection(ConnectionDirection::Recv, channel, role, None, handle).await {
            self.fail_recv(handle, e.to_api_status()).await;
        }
        match rx.await {
            Ok((status, addr)) => (status, addr, handle),
            Err(_) => (ApiStatus::InternalError, None, handle),
        }
    }

    async fn recv_on_connected(&self, handle: RaceHandle, connection_handle: RaceHandle) {
        let (link_address, open_callback) = {
            let mut inner = self.inner.lock();
            let link_address = inner
                .contexts
                .get(&connection_handle)
                .and_then(|c| match c {
                    Context::Connection(cc) => cc.link_address.clone(),
                    _ => None,
                });
            let Some(Context::Recv(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            ctx.connection_handle = connection_handle;
            ctx.link_address = link_address.clone();
            ctx.state = sm::recv::transition(ctx.state, &sm::recv::Event::ConnConnected);
            (link_address, ctx.open_callback.take())
        };
        if let Some(cb) = open_callback {
            let _ = cb.send((ApiStatus::Ok, link_address));
        }
    }

    async fn fail_recv(&self, handle: RaceHandle, status: ApiStatus) {
        let (connection_handle, open_callback, pending_receive) = {
            let mut inner = self.inner.lock();
            let Some(Context::Recv(ctx)) = inner.contexts.remove(&handle) else {
                return;
            };
            (ctx.connection_handle, ctx.open_callback, ctx.pending_receive)
        };
        if let Some(cb) = open_callback {
            let _ = cb.send((status, None));
        }
        if let Some(cb) = pending_receive {
            let _ = cb.send(Err(status));
        }
        if connection_handle != NULL_RACE_HANDLE && self.release_dependent(connection_handle, handle) {
            self.tear_down_connection(connection_handle).await;
        }
        self.idle_notify.notify_waiters();
    }

    /// Pulls the next payload for a `receive()` handle, or parks until one
    /// arrives (§4.5).
    pub async fn receive_next(&self, handle: RaceHandle) -> Result<Bytes, ApiStatus> {
        let rx = {
            let mut inner = self.inner.lock();
            let Some(Context::Recv(ctx)) = inner.contexts.get_mut(&handle) else {
                return Err(ApiStatus::InvalidArgument);
            };
            if let Some(payload) = ctx.data.pop_front() {
                return Ok(payload);
            }
            let (tx, rx) = oneshot::channel();
            ctx.pending_receive = Some(tx);
            rx
        };
        rx.await.unwrap_or(Err(ApiStatus::InternalError))
    }

    fn deliver_to_recv(inner: &mut ManagerInner, handle: RaceHandle, payload: Bytes) -> Option<oneshot::Sender<Result<Bytes, ApiStatus>>> {
        let Some(Context::Recv(ctx)) = inner.contexts.get_mut(&handle) else {
            return None;
        };
        if let Some(pending) = ctx.pending_receive.take() {
            Some(pending)
        } else {
            ctx.data.push_back(payload);
            None
        }
    }

    // ---- SendReceive (§4.5) ----

    pub async fn send_receive(&self, opts: ConnectionOptions, payload: Bytes) -> Result<Bytes, ApiStatus> {
        let (send_channel, send_role, address) = match (opts.send_channel.clone(), opts.send_role.clone(), opts.send_address.clone())
        {
            (Some(c), Some(r), Some(a)) if !r.is_empty() && !a.is_empty() && !payload.is_empty() => (c, r, a),
            _ => return Err(ApiStatus::InvalidArgument),
        };
        let recv_channel = opts.recv_channel.clone().unwrap_or_else(|| send_channel.clone());
        let recv_role = opts.recv_role.clone().unwrap_or_else(|| send_role.clone());

        let handle = self.handles.next();
        let package_id = PackageId::random();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.contexts.insert(
                handle,
                Context::SendReceive(SendReceiveContext {
                    state: sm::send_receive::State::Initial,
                    recv_connection_handle: NULL_RACE_HANDLE,
                    send_connection_handle: NULL_RACE_HANDLE,
                    package_id,
                    outgoing_message: payload,
                    send_channel: send_channel.clone(),
                    callback: Some(tx),
                }),
            );
            inner.package_id_index.insert(package_id, handle);
        }
        if let Err(e) = self
            .attach_to_connection(ConnectionDirection::Recv, recv_channel, recv_role, None, handle)
            .await
        {
            self.fail_send_receive(handle, e.to_api_status()).await;
            return rx.await.unwrap_or(Err(ApiStatus::InternalError));
        }
        // The send leg is started once the recv leg is up, from
        // `send_receive_on_connected`, carried via the stored options.
        if let Err(e) = self
            .attach_send_leg_when_recv_ready(handle, send_channel, send_role, address)
            .await
        {
            self.fail_send_receive(handle, e.to_api_status()).await;
        }
        rx.await.unwrap_or(Err(ApiStatus::InternalError))
    }

    pub async fn send_receive_str(&self, opts: ConnectionOptions, payload: &str) -> Result<String, ApiStatus> {
        let bytes = self.send_receive(opts, Bytes::copy_from_slice(payload.as_bytes())).await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ApiStatus::InternalError)
    }

    fn with_send_receive_mut<R>(&self, handle: RaceHandle, f: impl FnOnce(&mut SendReceiveContext) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        match inner.contexts.get_mut(&handle) {
            Some(Context::SendReceive(ctx)) => Some(f(ctx)),
            _ => None,
        }
    }

    async fn attach_send_leg_when_recv_ready(
        &self,
        handle: RaceHandle,
        send_channel: ChannelId,
        send_role: String,
        address: String,
    ) -> CoreResult<()> {
        // The recv leg may already have completed synchronously (loopback
        // plugin); either way `recv_connection_handle` is set by the time
        // `attach_to_connection` above returns.
        let recv_ready = self
            .with_send_receive_mut(handle, |ctx| ctx.recv_connection_handle != NULL_RACE_HANDLE)
            .unwrap_or(false);
        if !recv_ready {
            return Ok(());
        }
        self.attach_to_connection(ConnectionDirection::Send, send_channel, send_role, Some(address), handle)
            .await?;
        Ok(())
    }

    async fn send_receive_on_connected(&self, handle: RaceHandle, connection_handle: RaceHandle) {
        let outcome = {
            let mut inner = self.inner.lock();
            let Some(Context::SendReceive(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            if ctx.recv_connection_handle == NULL_RACE_HANDLE {
                ctx.recv_connection_handle = connection_handle;
                ctx.state = sm::send_receive::transition(ctx.state, &sm::send_receive::Event::RecvConnConnected);
                let link_address = inner.contexts.get(&connection_handle).and_then(|c| match c {
                    Context::Connection(cc) => cc.link_address.clone(),
                    _ => None,
                });
                Some(("recv", link_address))
            } else if ctx.send_connection_handle == NULL_RACE_HANDLE {
                ctx.send_connection_handle = connection_handle;
                ctx.state = sm::send_receive::transition(ctx.state, &sm::send_receive::Event::SendConnConnected);
                Some(("send", None))
            } else {
                None
            }
        };
        match outcome {
            Some(("send", _)) => self.send_receive_dispatch_hello(handle).await,
            _ => {}
        }
    }

    async fn send_receive_dispatch_hello(&self, handle: RaceHandle) {
        let (channel, connection_id, package_id, recv_link_address, message) = {
            let inner = self.inner.lock();
            let Some(Context::SendReceive(ctx)) = inner.contexts.get(&handle) else {
                return;
            };
            let Some(Context::Connection(send_conn)) = inner.contexts.get(&ctx.send_connection_handle) else {
                return;
            };
            let Some(connection_id) = send_conn.connection_id.clone() else {
                return;
            };
            let recv_link_address = inner
                .contexts
                .get(&ctx.recv_connection_handle)
                .and_then(|c| match c {
                    Context::Connection(cc) => cc.link_address.clone(),
                    _ => None,
                })
                .unwrap_or_default();
            (
                send_conn.channel_id.clone(),
                connection_id,
                ctx.package_id,
                recv_link_address,
                ctx.outgoing_message.clone(),
            )
        };
        let Ok(plugin) = self.plugin_for_channel(&channel) else {
            self.fail_send_receive(handle, ApiStatus::InternalError).await;
            return;
        };
        let reply_channel = {
            let inner = self.inner.lock();
            match inner.contexts.get(&handle) {
                Some(Context::SendReceive(ctx)) => ctx.send_channel.clone(),
                _ => return,
            }
        };
        let envelope_bytes = envelope::encode_hello(&recv_link_address, reply_channel.as_str(), package_id, &message, None);
        let resp = plugin
            .send_package(handle, connection_id, EncPkg::new(envelope_bytes), None, 0)
            .await;
        if resp.status != ApiStatus::Ok {
            self.fail_send_receive(handle, ApiStatus::InternalError).await;
            return;
        }
        self.with_send_receive_mut(handle, |ctx| {
            ctx.state = sm::send_receive::transition(ctx.state, &sm::send_receive::Event::HelloSent);
        });
    }

    async fn fail_send_receive(&self, handle: RaceHandle, status: ApiStatus) {
        let ctx = {
            let mut inner = self.inner.lock();
            inner.contexts.remove(&handle)
        };
        let Some(Context::SendReceive(ctx)) = ctx else { return };
        if let Some(cb) = ctx.callback {
            let _ = cb.send(Err(status));
        }
        for conn in [ctx.recv_connection_handle, ctx.send_connection_handle] {
            if conn != NULL_RACE_HANDLE && self.release_dependent(conn, handle) {
                self.tear_down_connection(conn).await;
            }
        }
        let mut inner = self.inner.lock();
        inner.package_id_index.remove(&ctx.package_id);
        drop(inner);
        self.idle_notify.notify_waiters();
    }

    async fn complete_send_receive(&self, handle: RaceHandle, response: Bytes) {
        let ctx = {
            let mut inner = self.inner.lock();
            inner.contexts.remove(&handle)
        };
        let Some(Context::SendReceive(ctx)) = ctx else { return };
        if let Some(cb) = ctx.callback {
            let _ = cb.send(Ok(response));
        }
        for conn in [ctx.recv_connection_handle, ctx.send_connection_handle] {
            if conn != NULL_RACE_HANDLE && self.release_dependent(conn, handle) {
                self.tear_down_connection(conn).await;
            }
        }
        let mut inner = self.inner.lock();
        inner.package_id_index.remove(&ctx.package_id);
        drop(inner);
        self.idle_notify.notify_waiters();
    }

    // ---- Listen / Accept / PreConduit / Conduit (§4.6) ----

    pub async fn listen(&self, opts: ConnectionOptions) -> (ApiStatus, Option<String>, RaceHandle) {
        let (recv_channel, send_channel, role) = match (opts.recv_channel.clone(), opts.send_channel.clone(), opts.recv_role.clone())
        {
            (Some(rc), sc, role) => {
                let send_channel = sc.unwrap_or_else(|| rc.clone());
                (rc, send_channel, role.unwrap_or_default())
            }
            _ => return (ApiStatus::InvalidArgument, None, NULL_RACE_HANDLE),
        };
        let handle = self.handles.next();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.contexts.insert(
                handle,
                Context::Listen(ListenContext {
                    state: sm::listen::State::Initial,
                    connection_handle: NULL_RACE_HANDLE,
                    recv_channel: recv_channel.clone(),
                    send_channel,
                    link_address: None,
                    pending_pre_conduits: VecDeque::new(),
                    pending_accepts: VecDeque::new(),
                    open_callback: Some(tx),
                }),
            );
        }
        if let Err(e) = self.attach_to_connection(ConnectionDirection::Recv, recv_channel, role, None, handle).await {
            self.fail_listen(handle, e.to_api_status()).await;
        }
        match rx.await {
            Ok((status, addr)) => (status, addr, handle),
            Err(_) => (ApiStatus::InternalError, None, handle),
        }
    }

    async fn listen_on_connected(&self, handle: RaceHandle, connection_handle: RaceHandle) {
        let (link_address, open_callback) = {
            let mut inner = self.inner.lock();
            let link_address = inner.contexts.get(&connection_handle).and_then(|c| match c {
                Context::Connection(cc) => cc.link_address.clone(),
                _ => None,
            });
            let Some(Context::Listen(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            ctx.connection_handle = connection_handle;
            ctx.link_address = link_address.clone();
            ctx.state = sm::listen::transition(ctx.state, &sm::listen::Event::ConnConnected);
            (link_address, ctx.open_callback.take())
        };
        if let Some(cb) = open_callback {
            let _ = cb.send((ApiStatus::Ok, link_address));
        }
    }

    async fn fail_listen(&self, handle: RaceHandle, status: ApiStatus) {
        let ctx = {
            let mut inner = self.inner.lock();
            inner.contexts.remove(&handle)
        };
        let Some(Context::Listen(ctx)) = ctx else { return };
        if let Some(cb) = ctx.open_callback {
            let _ = cb.send((status, None));
        }
        for cb in ctx.pending_accepts {
            let _ = cb.send(Err(status));
        }
    }

    /// Matches the next queued hello against a pending `accept()`, or parks
    /// the caller until one arrives (§4.6). `close(listener)` cancels every
    /// parked caller with `CLOSING`.
    pub async fn accept(&self, listener: RaceHandle) -> Result<RaceHandle, ApiStatus> {
        let kind = {
            let inner = self.inner.lock();
            inner.contexts.get(&listener).map(Context::kind)
        };
        match kind {
            Some("Listen") => {
                let immediate = {
                    let mut inner = self.inner.lock();
                    let Some(Context::Listen(ctx)) = inner.contexts.get_mut(&listener) else {
                        return Err(ApiStatus::InvalidArgument);
                    };
                    if let Some(pre_conduit) = ctx.pending_pre_conduits.pop_front() {
                        Some(pre_conduit)
                    } else {
                        let (tx, rx) = oneshot::channel();
                        ctx.pending_accepts.push_back(tx);
                        drop(inner);
                        return rx.await.unwrap_or(Err(ApiStatus::InternalError));
                    }
                };
                match immediate {
                    Some(pre_conduit) => self.accept_pre_conduit(pre_conduit).await,
                    None => Err(ApiStatus::InternalError),
                }
            }
            // The bootstrap family only ever queues a handle here once it
            // has already finished converting to a Conduit (§4.8), so
            // there's no `accept_pre_conduit`-equivalent step to run.
            Some("BootstrapListen") => {
                let immediate = {
                    let mut inner = self.inner.lock();
                    let Some(Context::BootstrapListen(ctx)) = inner.contexts.get_mut(&listener) else {
                        return Err(ApiStatus::InvalidArgument);
                    };
                    if let Some(conduit) = ctx.pending_pre_conduits.pop_front() {
                        Some(conduit)
                    } else {
                        let (tx, rx) = oneshot::channel();
                        ctx.pending_accepts.push_back(tx);
                        drop(inner);
                        return rx.await.unwrap_or(Err(ApiStatus::InternalError));
                    }
                };
                immediate.ok_or(ApiStatus::InternalError)
            }
            _ => Err(ApiStatus::InvalidArgument),
        }
    }

    async fn accept_pre_conduit(&self, pre_conduit_handle: RaceHandle) -> Result<RaceHandle, ApiStatus> {
        let (listener_handle, recv_connection_handle, peer_link_address, peer_reply_channel) = {
            let mut inner = self.inner.lock();
            let Some(Context::PreConduit(ctx)) = inner.contexts.get_mut(&pre_conduit_handle) else {
                return Err(ApiStatus::InvalidArgument);
            };
            ctx.state = sm::pre_conduit::transition(ctx.state, &sm::pre_conduit::Event::Accept);
            (
                ctx.listener_handle,
                ctx.recv_connection_handle,
                ctx.peer_link_address.clone(),
                ctx.peer_reply_channel.clone(),
            )
        };
        let send_channel = {
            let inner = self.inner.lock();
            match inner.contexts.get(&listener_handle) {
                Some(Context::Listen(l)) => l.send_channel.clone(),
                _ => peer_reply_channel.clone(),
            }
        };
        let role = {
            let inner = self.inner.lock();
            match inner.contexts.get(&recv_connection_handle) {
                Some(Context::Connection(cc)) => cc.channel_role.clone(),
                _ => String::new(),
            }
        };
        if let Err(e) = self
            .attach_to_connection(
                ConnectionDirection::Send,
                send_channel,
                role,
                Some(peer_link_address),
                pre_conduit_handle,
            )
            .await
        {
            self.fail_pre_conduit(pre_conduit_handle, e.to_api_status()).await;
            return Err(e.to_api_status());
        }
        let conduit_handle = {
            let inner = self.inner.lock();
            match inner.contexts.get(&pre_conduit_handle) {
                Some(Context::Conduit(_)) => Some(pre_conduit_handle),
                _ => None,
            }
        };
        conduit_handle.ok_or(ApiStatus::InternalError)
    }

    async fn pre_conduit_on_connected(&self, handle: RaceHandle, connection_handle: RaceHandle) {
        let converted = {
            let mut inner = self.inner.lock();
            let Some(Context::PreConduit(ctx)) = inner.contexts.remove(&handle) else {
                return;
            };
            let listener_handle = ctx.listener_handle;
            if let Some(Context::Listen(listener)) = inner.contexts.get_mut(&listener_handle) {
                listener.pending_pre_conduits.retain(|h| *h != handle);
            }
            // `handle` stays registered as a dependent of `recv_connection_handle`
            // across this swap — the Conduit below reuses the same handle.
            let conduit = Context::Conduit(ConduitContext {
                state: sm::conduit::State::Open,
                send_connection_handle: connection_handle,
                recv_connection_handle: ctx.recv_connection_handle,
                package_id: ctx.package_id,
                inbound: VecDeque::new(),
                pending_read: None,
                pending_writes: VecDeque::new(),
            });
            inner.contexts.insert(handle, conduit);
            inner.package_id_index.insert(ctx.package_id, handle);
            self.replay_unassociated_for(&mut inner, ctx.recv_connection_handle, handle);
            true
        };
        if converted {
            debug!(%handle, "pre-conduit converted to conduit");
        }
    }

    async fn fail_pre_conduit(&self, handle: RaceHandle, status: ApiStatus) {
        let ctx = {
            let mut inner = self.inner.lock();
            let ctx = inner.contexts.remove(&handle);
            if let Some(Context::PreConduit(ctx)) = &ctx {
                inner.package_id_index.remove(&ctx.package_id);
                if let Some(Context::Listen(listener)) = inner.contexts.get_mut(&ctx.listener_handle) {
                    listener.pending_pre_conduits.retain(|h| *h != handle);
                }
            }
            ctx
        };
        if let Some(Context::PreConduit(ctx)) = ctx {
            if self.release_dependent(ctx.recv_connection_handle, handle) {
                self.tear_down_connection(ctx.recv_connection_handle).await;
            }
        }
        let _ = status;
    }

    fn replay_unassociated_for(&self, inner: &mut ManagerInner, recv_connection_handle: RaceHandle, conduit_handle: RaceHandle) {
        let Some(connection_id) = inner.contexts.get(&recv_connection_handle).and_then(|c| match c {
            Context::Connection(cc) => cc.connection_id.clone(),
            _ => None,
        }) else {
            return;
        };
        let Some(queue) = inner.unassociated_packages.get_mut(&connection_id) else {
            return;
        };
        let mut replay = Vec::new();
        while let Some(pkg) = queue.pop_front() {
            if let Ok((package_id, payload)) = envelope::decode_conduit_package(&pkg.payload) {
                if let Some(handle) = inner.package_id_index.get(&package_id).copied() {
                    if handle == conduit_handle {
                        replay.push(payload);
                        continue;
                    }
                }
            }
        }
        if let Some(Context::Conduit(ctx)) = inner.contexts.get_mut(&conduit_handle) {
            for payload in replay {
                Self::deliver_to_conduit_static(ctx, payload);
            }
        }
    }

    fn deliver_to_conduit_static(ctx: &mut ConduitContext, payload: Bytes) {
        if let Some(pending) = ctx.pending_read.take() {
            let _ = pending.send(Ok(payload));
        } else {
            ctx.inbound.push_back(payload);
        }
    }

    /// §4.7: opens recv then send, sends the hello, and returns a Conduit
    /// handle immediately.
    pub async fn dial(&self, opts: ConnectionOptions, hello_message: Bytes) -> Result<RaceHandle, ApiStatus> {
        let (send_channel, address) = match (opts.send_channel.clone(), opts.send_address.clone()) {
            (Some(c), Some(a)) if !a.is_empty() => (c, a),
            _ => return Err(ApiStatus::InvalidArgument),
        };
        let recv_channel = opts.recv_channel.clone().unwrap_or_else(|| send_channel.clone());
        let role = opts.send_role.clone().unwrap_or_default();
        let reply_channel = opts.recv_channel.clone().unwrap_or_else(|| send_channel.clone());

        let handle = self.handles.next();
        let package_id = PackageId::random();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.contexts.insert(
                handle,
                Context::Dial(DialContext {
                    state: sm::dial::State::Initial,
                    recv_connection_handle: NULL_RACE_HANDLE,
                    send_connection_handle: NULL_RACE_HANDLE,
                    package_id,
                    hello_message,
                    reply_channel,
                    conduit_handle: None,
                    callback: Some(tx),
                }),
            );
            inner.package_id_index.insert(package_id, handle);
        }
        if let Err(e) = self.attach_to_connection(ConnectionDirection::Recv, recv_channel, role.clone(), None, handle).await {
            self.fail_dial(handle, e.to_api_status()).await;
            return rx.await.unwrap_or(Err(ApiStatus::InternalError));
        }
        if let Err(e) = self
            .attach_to_connection(ConnectionDirection::Send, send_channel, role, Some(address), handle)
            .await
        {
            self.fail_dial(handle, e.to_api_status()).await;
        }
        rx.await.unwrap_or(Err(ApiStatus::InternalError))
    }

    pub async fn dial_str(&self, opts: ConnectionOptions, message: &str) -> Result<RaceHandle, ApiStatus> {
        self.dial(opts, Bytes::copy_from_slice(message.as_bytes())).await
    }

    async fn dial_on_connected(&self, handle: RaceHandle, connection_handle: RaceHandle) {
        let phase = {
            let mut inner = self.inner.lock();
            let Some(Context::Dial(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            if ctx.recv_connection_handle == NULL_RACE_HANDLE {
                ctx.recv_connection_handle = connection_handle;
                ctx.state = sm::dial::transition(ctx.state, &sm::dial::Event::RecvConnConnected);
                "recv"
            } else {
                ctx.send_connection_handle = connection_handle;
                ctx.state = sm::dial::transition(ctx.state, &sm::dial::Event::SendConnConnected);
                "send"
            }
        };
        if phase == "send" {
            self.dial_send_hello(handle).await;
        }
    }

    async fn dial_send_hello(&self, handle: RaceHandle) {
        let (channel, connection_id, package_id, recv_link_address, reply_channel, message) = {
            let inner = self.inner.lock();
            let Some(Context::Dial(ctx)) = inner.contexts.get(&handle) else {
                return;
            };
            let Some(Context::Connection(send_conn)) = inner.contexts.get(&ctx.send_connection_handle) else {
                return;
            };
            let Some(connection_id) = send_conn.connection_id.clone() else {
                return;
            };
            let recv_link_address = inner
                .contexts
                .get(&ctx.recv_connection_handle)
                .and_then(|c| match c {
                    Context::Connection(cc) => cc.link_address.clone(),
                    _ => None,
                })
                .unwrap_or_default();
            (
                send_conn.channel_id.clone(),
                connection_id,
                ctx.package_id,
                recv_link_address,
                ctx.reply_channel.clone(),
                ctx.hello_message.clone(),
            )
        };
        let Ok(plugin) = self.plugin_for_channel(&channel) else {
            self.fail_dial(handle, ApiStatus::InternalError).await;
            return;
        };
        let envelope_bytes = envelope::encode_hello(&recv_link_address, reply_channel.as_str(), package_id, &message, None);
        let resp = plugin
            .send_package(handle, connection_id, EncPkg::new(envelope_bytes), None, 0)
            .await;
        if resp.status != ApiStatus::Ok {
            self.fail_dial(handle, ApiStatus::InternalError).await;
            return;
        }
        let recv_connection_handle = {
            let mut inner = self.inner.lock();
            let Some(Context::Dial(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            ctx.state = sm::dial::transition(ctx.state, &sm::dial::Event::HelloSent);
            ctx.conduit_handle = Some(handle);
            ctx.recv_connection_handle
        };
        let send_connection_handle = {
            let inner = self.inner.lock();
            match inner.contexts.get(&handle) {
                Some(Context::Dial(ctx)) => ctx.send_connection_handle,
                _ => return,
            }
        };
        let (callback, package_id) = {
            let mut inner = self.inner.lock();
            let Some(Context::Dial(ctx)) = inner.contexts.remove(&handle) else {
                return;
            };
            (ctx.callback, ctx.package_id)
        };
        {
            let mut inner = self.inner.lock();
            inner.contexts.insert(
                handle,
                Context::Conduit(ConduitContext {
                    state: sm::conduit::State::Open,
                    send_connection_handle,
                    recv_connection_handle,
                    package_id,
                    inbound: VecDeque::new(),
                    pending_read: None,
                    pending_writes: VecDeque::new(),
                }),
            );
        }
        if let Some(cb) = callback {
            let _ = cb.send(Ok(handle));
        }
    }

    async fn fail_dial(&self, handle: RaceHandle, status: ApiStatus) {
        let ctx = {
            let mut inner = self.inner.lock();
            let ctx = inner.contexts.remove(&handle);
            if let Some(Context::Dial(ctx)) = &ctx {
                inner.package_id_index.remove(&ctx.package_id);
            }
            ctx
        };
        let Some(Context::Dial(ctx)) = ctx else { return };
        if let Some(cb) = ctx.callback {
            let _ = cb.send(Err(status));
        }
        for conn in [ctx.recv_connection_handle, ctx.send_connection_handle] {
            if conn != NULL_RACE_HANDLE && self.release_dependent(conn, handle) {
                self.tear_down_connection(conn).await;
            }
        }
    }

    // ---- Resume (§4.7) ----

    pub async fn resume(&self, opts: ResumeOptions) -> Result<RaceHandle, ApiStatus> {
        let package_id = envelope::PackageId::parse_flexible(&opts.package_id).map_err(|_| ApiStatus::InvalidArgument)?;
        let handle = self.handles.next();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.contexts.insert(
                handle,
                Context::Resume(ResumeContext {
                    state: sm::resume::State::Initial,
                    send_connection_handle: NULL_RACE_HANDLE,
                    recv_connection_handle: NULL_RACE_HANDLE,
                    package_id,
                    conduit_handle: None,
                    callback: Some(tx),
                }),
            );
            inner.package_id_index.insert(package_id, handle);
        }
        if let Err(e) = self
            .attach_to_connection(ConnectionDirection::Send, opts.send_channel, String::new(), Some(opts.send_address), handle)
            .await
        {
            self.fail_resume(handle, e.to_api_status()).await;
            return rx.await.unwrap_or(Err(ApiStatus::InternalError));
        }
        if let Err(e) = self
            .attach_to_connection(ConnectionDirection::Recv, opts.recv_channel, String::new(), None, handle)
            .await
        {
            self.fail_resume(handle, e.to_api_status()).await;
        }
        rx.await.unwrap_or(Err(ApiStatus::InternalError))
    }

    async fn resume_on_connected(&self, handle: RaceHandle, connection_handle: RaceHandle) {
        let ready = {
            let mut inner = self.inner.lock();
            let Some(Context::Resume(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            let direction = inner.contexts.get(&connection_handle).and_then(|c| match c {
                Context::Connection(cc) => Some(cc.direction),
                _ => None,
            });
            match direction {
                Some(ConnectionDirection::Send) => {
                    ctx.send_connection_handle = connection_handle;
                    ctx.state = sm::resume::transition(ctx.state, &sm::resume::Event::SendConnConnected);
                }
                Some(ConnectionDirection::Recv) => {
                    ctx.recv_connection_handle = connection_handle;
                    ctx.state = sm::resume::transition(ctx.state, &sm::resume::Event::RecvConnConnected);
                }
                None => {}
            }
            ctx.send_connection_handle != NULL_RACE_HANDLE && ctx.recv_connection_handle != NULL_RACE_HANDLE
        };
        if ready {
            let (callback, send_connection_handle, recv_connection_handle, package_id) = {
                let mut inner = self.inner.lock();
                let Some(Context::Resume(ctx)) = inner.contexts.remove(&handle) else {
                    return;
                };
                (ctx.callback, ctx.send_connection_handle, ctx.recv_connection_handle, ctx.package_id)
            };
            {
                let mut inner = self.inner.lock();
                inner.contexts.insert(
                    handle,
                    Context::Conduit(ConduitContext {
                        state: sm::conduit::State::Open,
                        send_connection_handle,
                        recv_connection_handle,
                        package_id,
                        inbound: VecDeque::new(),
                        pending_read: None,
                        pending_writes: VecDeque::new(),
                    }),
                );
            }
            if let Some(cb) = callback {
                let _ = cb.send(Ok(handle));
            }
        }
    }

    async fn fail_resume(&self, handle: RaceHandle, status: ApiStatus) {
        let ctx = {
            let mut inner = self.inner.lock();
            inner.contexts.remove(&handle)
        };
        let Some(Context::Resume(ctx)) = ctx else { return };
        if let Some(cb) = ctx.callback {
            let _ = cb.send(Err(status));
        }
        for conn in [ctx.recv_connection_handle, ctx.send_connection_handle] {
            if conn != NULL_RACE_HANDLE && self.release_dependent(conn, handle) {
                self.tear_down_connection(conn).await;
            }
        }
        let mut inner = self.inner.lock();
        inner.package_id_index.remove(&ctx.package_id);
    }

    // ---- Conduit operations (§4.6) ----

    pub async fn conduit_write(&self, conduit: RaceHandle, payload: Bytes) -> ApiStatus {
        let (channel, connection_id, package_id) = {
            let inner = self.inner.lock();
            let Some(Context::Conduit(ctx)) = inner.contexts.get(&conduit) else {
                return ApiStatus::InvalidArgument;
            };
            let Some(Context::Connection(send_conn)) = inner.contexts.get(&ctx.send_connection_handle) else {
                return ApiStatus::InternalError;
            };
            let Some(connection_id) = send_conn.connection_id.clone() else {
                return ApiStatus::InternalError;
            };
            (send_conn.channel_id.clone(), connection_id, ctx.package_id)
        };
        let Ok(plugin) = self.plugin_for_channel(&channel) else {
            return ApiStatus::InternalError;
        };
        let framed = envelope::encode_conduit_package(package_id, &payload);
        let resp = plugin.send_package(conduit, connection_id, EncPkg::new(framed), None, 0).await;
        if resp.status != ApiStatus::Ok {
            self.with_conduit_mut(conduit, |ctx| {
                ctx.state = sm::conduit::transition(ctx.state, &sm::conduit::Event::PackageFailed);
            });
            return ApiStatus::InternalError;
        }
        // The immediate response only means the plugin queued the package;
        // completion is reported later on `onPackageStatusChanged` (§4.2,
        // §4.6), so park a waiter the same way `send_on_connected` defers to
        // `complete_send`/`fail_send`.
        let (tx, rx) = oneshot::channel();
        let registered = self.with_conduit_mut(conduit, |ctx| ctx.pending_writes.push_back(tx)).is_some();
        if !registered {
            return ApiStatus::InternalError;
        }
        rx.await.unwrap_or(ApiStatus::InternalError)
    }

    pub async fn conduit_read(&self, conduit: RaceHandle, timeout: Option<Duration>) -> Result<Bytes, ApiStatus> {
        let rx = {
            let mut inner = self.inner.lock();
            let Some(Context::Conduit(ctx)) = inner.contexts.get_mut(&conduit) else {
                return Err(ApiStatus::InvalidArgument);
            };
            if let Some(payload) = ctx.inbound.pop_front() {
                return Ok(payload);
            }
            let (tx, rx) = oneshot::channel();
            ctx.pending_read = Some(tx);
            rx
        };
        match timeout {
            Some(d) => tokio::time::timeout(d, rx)
                .await
                .map_err(|_| ApiStatus::Timeout)
                .and_then(|r| r.unwrap_or(Err(ApiStatus::InternalError))),
            None => rx.await.unwrap_or(Err(ApiStatus::InternalError)),
        }
    }

    pub async fn conduit_cancel_read(&self, conduit: RaceHandle) {
        self.with_conduit_mut(conduit, |ctx| {
            if let Some(pending) = ctx.pending_read.take() {
                let _ = pending.send(Err(ApiStatus::Cancelled));
            }
        });
    }

    fn with_conduit_mut<R>(&self, handle: RaceHandle, f: impl FnOnce(&mut ConduitContext) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        match inner.contexts.get_mut(&handle) {
            Some(Context::Conduit(ctx)) => Some(f(ctx)),
            _ => None,
        }
    }

    // ---- close / cancel (§5, §7) ----

    /// Closes any handle: a conduit, listener, recv/send context, or raw
    /// connection. Always reports `OK`; pending callbacks drain with
    /// `CLOSING` (§7).
    pub async fn close(&self, handle: RaceHandle) -> ApiStatus {
        let kind = {
            let inner = self.inner.lock();
            inner.contexts.get(&handle).map(Context::kind)
        };
        match kind {
            Some("Conduit") => {
                let ctx = {
                    let mut inner = self.inner.lock();
                    inner.contexts.remove(&handle)
                };
                if let Some(Context::Conduit(mut ctx)) = ctx {
                    if let Some(pending) = ctx.pending_read.take() {
                        let _ = pending.send(Err(ApiStatus::Closing));
                    }
                    for conn in [ctx.send_connection_handle, ctx.recv_connection_handle] {
                        if self.release_dependent(conn, handle) {
                            self.tear_down_connection(conn).await;
                        }
                    }
                    let mut inner = self.inner.lock();
                    inner.package_id_index.retain(|_, h| *h != handle);
                }
                ApiStatus::Ok
            }
            Some("Listen") => {
                let ctx = {
                    let mut inner = self.inner.lock();
                    inner.contexts.remove(&handle)
                };
                if let Some(Context::Listen(ctx)) = ctx {
                    for cb in ctx.pending_accepts {
                        let _ = cb.send(Err(ApiStatus::Closing));
                    }
                    if self.release_dependent(ctx.connection_handle, handle) {
                        self.tear_down_connection(ctx.connection_handle).await;
                    }
                }
                ApiStatus::Ok
            }
            Some("BootstrapListen") => {
                let ctx = {
                    let mut inner = self.inner.lock();
                    inner.contexts.remove(&handle)
                };
                if let Some(Context::BootstrapListen(ctx)) = ctx {
                    for cb in ctx.pending_accepts {
                        let _ = cb.send(Err(ApiStatus::Closing));
                    }
                    if ctx.connection_handle != NULL_RACE_HANDLE && self.release_dependent(ctx.connection_handle, handle) {
                        self.tear_down_connection(ctx.connection_handle).await;
                    }
                }
                ApiStatus::Ok
            }
            Some("Recv") => {
                let ctx = {
                    let mut inner = self.inner.lock();
                    inner.contexts.remove(&handle)
                };
                if let Some(Context::Recv(mut ctx)) = ctx {
                    if let Some(cb) = ctx.pending_receive.take() {
                        let _ = cb.send(Err(ApiStatus::Closing));
                    }
                    if ctx.connection_handle != NULL_RACE_HANDLE && self.release_dependent(ctx.connection_handle, handle) {
                        self.tear_down_connection(ctx.connection_handle).await;
                    }
                }
                ApiStatus::Ok
            }
            Some("Connection") => {
                self.tear_down_connection(handle).await;
                ApiStatus::Ok
            }
            _ => ApiStatus::Ok,
        }
    }

    /// §9: cancel an in-flight event (e.g. a blocking `accept`/`read`)
    /// without tearing down the owning context.
    pub async fn cancel_event(&self, handle: RaceHandle) -> ApiStatus {
        self.conduit_cancel_read(handle).await;
        ApiStatus::Ok
    }

    // ---- Bootstrap flavors (§4.8) — reuse the same connection machinery,
    // with an initial channel pair negotiating the final channel's
    // addresses before the handshake is finished there. ----

    pub async fn bootstrap_listen(&self, opts: BootstrapOptions) -> (ApiStatus, Option<String>, RaceHandle) {
        let handle = self.handles.next();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.contexts.insert(
                handle,
                Context::BootstrapListen(BootstrapListenContext {
                    state: sm::bootstrap_listen::State::Initial,
                    connection_handle: NULL_RACE_HANDLE,
                    initial_recv_channel: opts.init_recv_channel.clone(),
                    final_send_channel: opts.final_send_channel,
                    final_recv_channel: opts.final_recv_channel,
                    role: opts.role.clone(),
                    link_address: None,
                    pending_pre_conduits: VecDeque::new(),
                    pending_accepts: VecDeque::new(),
                    open_callback: Some(tx),
                }),
            );
        }
        if let Err(e) = self
            .attach_to_connection(ConnectionDirection::Recv, opts.init_recv_channel, opts.role, None, handle)
            .await
        {
            let status = e.to_api_status();
            let mut inner = self.inner.lock();
            inner.contexts.remove(&handle);
            drop(inner);
            return (status, None, handle);
        }
        match rx.await {
            Ok((status, addr)) => (status, addr, handle),
            Err(_) => (ApiStatus::InternalError, None, handle),
        }
    }

    async fn bootstrap_listen_on_connected(&self, handle: RaceHandle, connection_handle: RaceHandle) {
        let (link_address, open_callback) = {
            let mut inner = self.inner.lock();
            let link_address = inner.contexts.get(&connection_handle).and_then(|c| match c {
                Context::Connection(cc) => cc.link_address.clone(),
                _ => None,
            });
            let Some(Context::BootstrapListen(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            ctx.connection_handle = connection_handle;
            ctx.link_address = link_address.clone();
            ctx.state = sm::bootstrap_listen::transition(ctx.state, &sm::bootstrap_listen::Event::ConnConnected);
            (link_address, ctx.open_callback.take())
        };
        if let Some(cb) = open_callback {
            let _ = cb.send((ApiStatus::Ok, link_address));
        }
    }

    pub async fn bootstrap_dial(&self, opts: BootstrapOptions, init_send_address: String) -> Result<RaceHandle, ApiStatus> {
        let handle = self.handles.next();
        let package_id = PackageId::random();
        let (tx, rx) = oneshot::channel();
        let addresses = BootstrapAddressSet {
            init_send_link_address: init_send_address.clone(),
            init_send_channel: opts.init_send_channel.clone(),
            init_recv_link_address: String::new(),
            init_recv_channel: opts.init_recv_channel.clone(),
            final_send_link_address: String::new(),
            final_send_channel: opts.final_send_channel.clone(),
            final_recv_link_address: String::new(),
            final_recv_channel: opts.final_recv_channel.clone(),
        };
        {
            let mut inner = self.inner.lock();
            inner.contexts.insert(
                handle,
                Context::BootstrapDial(BootstrapDialContext {
                    state: sm::bootstrap_dial::State::Initial,
                    initial_send_connection_handle: NULL_RACE_HANDLE,
                    initial_recv_connection_handle: NULL_RACE_HANDLE,
                    final_send_connection_handle: None,
                    final_recv_connection_handle: None,
                    package_id,
                    addresses,
                    role: opts.role.clone(),
                    conduit_handle: None,
                    callback: Some(tx),
                }),
            );
            inner.package_id_index.insert(package_id, handle);
        }
        if let Err(e) = self
            .attach_to_connection(ConnectionDirection::Recv, opts.init_recv_channel, opts.role.clone(), None, handle)
            .await
        {
            self.fail_bootstrap_dial(handle, e.to_api_status()).await;
            return rx.await.unwrap_or(Err(ApiStatus::InternalError));
        }
        if let Err(e) = self
            .attach_to_connection(ConnectionDirection::Send, opts.init_send_channel, opts.role.clone(), Some(init_send_address), handle)
            .await
        {
            self.fail_bootstrap_dial(handle, e.to_api_status()).await;
            return rx.await.unwrap_or(Err(ApiStatus::InternalError));
        }
        // The final-recv connection comes up before the hello is sent, so
        // its address is already known and can ride along in the hello
        // (§4.8) instead of needing a second round trip.
        if let Err(e) = self
            .attach_to_connection(ConnectionDirection::Recv, opts.final_recv_channel, opts.role, None, handle)
            .await
        {
            self.fail_bootstrap_dial(handle, e.to_api_status()).await;
            return rx.await.unwrap_or(Err(ApiStatus::InternalError));
        }
        rx.await.unwrap_or(Err(ApiStatus::InternalError))
    }

    /// Four connections settle in a fixed order: initial recv, initial
    /// send (triggers the hello), final recv (also triggers the hello,
    /// once its own address is known), final send (triggers
    /// `bootstrap_dial_finish`, arriving later once the peer's
    /// hello-response names where to dial it).
    async fn bootstrap_dial_on_connected(&self, handle: RaceHandle, connection_handle: RaceHandle) {
        let phase = {
            let mut inner = self.inner.lock();
            let Some(Context::BootstrapDial(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            if ctx.initial_recv_connection_handle == NULL_RACE_HANDLE {
                ctx.initial_recv_connection_handle = connection_handle;
                "initial_recv"
            } else if ctx.initial_send_connection_handle == NULL_RACE_HANDLE {
                ctx.initial_send_connection_handle = connection_handle;
                ctx.state = sm::bootstrap_dial::transition(ctx.state, &sm::bootstrap_dial::Event::InitialConnConnected);
                "initial_send"
            } else if ctx.final_recv_connection_handle.is_none() {
                ctx.final_recv_connection_handle = Some(connection_handle);
                "final_recv"
            } else {
                ctx.final_send_connection_handle = Some(connection_handle);
                ctx.state = sm::bootstrap_dial::transition(ctx.state, &sm::bootstrap_dial::Event::FinalConnConnected);
                "final_send"
            }
        };
        match phase {
            "final_recv" => self.bootstrap_dial_send_hello(handle).await,
            "final_send" => self.bootstrap_dial_finish(handle).await,
            _ => {}
        }
    }

    async fn bootstrap_dial_send_hello(&self, handle: RaceHandle) {
        let (channel, connection_id, package_id, addresses, init_recv_link_address, final_recv_link_address) = {
            let inner = self.inner.lock();
            let Some(Context::BootstrapDial(ctx)) = inner.contexts.get(&handle) else {
                return;
            };
            let Some(Context::Connection(send_conn)) = inner.contexts.get(&ctx.initial_send_connection_handle) else {
                return;
            };
            let Some(connection_id) = send_conn.connection_id.clone() else {
                return;
            };
            let init_recv_link_address = inner
                .contexts
                .get(&ctx.initial_recv_connection_handle)
                .and_then(|c| match c {
                    Context::Connection(cc) => cc.link_address.clone(),
                    _ => None,
                })
                .unwrap_or_default();
            let final_recv_link_address = ctx
                .final_recv_connection_handle
                .and_then(|h| inner.contexts.get(&h))
                .and_then(|c| match c {
                    Context::Connection(cc) => cc.link_address.clone(),
                    _ => None,
                })
                .unwrap_or_default();
            (
                send_conn.channel_id.clone(),
                connection_id,
                ctx.package_id,
                ctx.addresses.clone(),
                init_recv_link_address,
                final_recv_link_address,
            )
        };
        let Ok(plugin) = self.plugin_for_channel(&channel) else {
            self.fail_bootstrap_dial(handle, ApiStatus::InternalError).await;
            return;
        };
        let boot = BootstrapAddresses {
            init_send_link_address: addresses.init_send_link_address.clone(),
            init_send_channel: addresses.init_send_channel.as_str().to_string(),
            init_recv_link_address: init_recv_link_address.clone(),
            init_recv_channel: addresses.init_recv_channel.as_str().to_string(),
            final_send_link_address: addresses.final_send_link_address.clone(),
            final_send_channel: addresses.final_send_channel.as_str().to_string(),
            final_recv_link_address: final_recv_link_address.clone(),
            final_recv_channel: addresses.final_recv_channel.as_str().to_string(),
        };
        let envelope_bytes =
            envelope::encode_hello(&init_recv_link_address, addresses.init_recv_channel.as_str(), package_id, b"", Some(&boot));
        let resp = plugin.send_package(handle, connection_id, EncPkg::new(envelope_bytes), None, 0).await;
        if resp.status != ApiStatus::Ok {
            self.fail_bootstrap_dial(handle, ApiStatus::InternalError).await;
            return;
        }
        self.with_bootstrap_dial_mut(handle, |ctx| {
            ctx.addresses.init_recv_link_address = init_recv_link_address;
            ctx.addresses.final_recv_link_address = final_recv_link_address;
            ctx.state = sm::bootstrap_dial::transition(ctx.state, &sm::bootstrap_dial::Event::HelloSent);
        });
        // The peer's hello-response (carrying its own final-recv address)
        // arrives on this same initial recv connection and is routed back
        // here via `bootstrap_dial_hello_response`.
    }

    /// Reacts to the peer's hello-response, which names the listener's own
    /// final-recv address (§4.8): opens the final-send connection to it,
    /// completing the fourth and last slot `bootstrap_dial_on_connected`
    /// is waiting on.
    async fn bootstrap_dial_hello_response(&self, handle: RaceHandle, hello: &envelope::Hello) {
        let peer_final_recv_address = hello.bootstrap.as_ref().map(|b| b.final_recv_link_address.clone()).unwrap_or_default();
        if peer_final_recv_address.is_empty() {
            warn!(%handle, "bootstrap hello-response missing final recv address");
            return;
        }
        let attach = {
            let inner = self.inner.lock();
            let Some(Context::BootstrapDial(ctx)) = inner.contexts.get(&handle) else {
                return;
            };
            if ctx.final_send_connection_handle.is_some() {
                None
            } else {
                Some((ctx.addresses.final_send_channel.clone(), ctx.role.clone()))
            }
        };
        let Some((final_send_channel, role)) = attach else {
            return;
        };
        if let Err(e) = self
            .attach_to_connection(ConnectionDirection::Send, final_send_channel, role, Some(peer_final_recv_address), handle)
            .await
        {
            self.fail_bootstrap_dial(handle, e.to_api_status()).await;
        }
    }

    fn with_bootstrap_dial_mut<R>(&self, handle: RaceHandle, f: impl FnOnce(&mut BootstrapDialContext) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        match inner.contexts.get_mut(&handle) {
            Some(Context::BootstrapDial(ctx)) => Some(f(ctx)),
            _ => None,
        }
    }

    async fn fail_bootstrap_dial(&self, handle: RaceHandle, status: ApiStatus) {
        let ctx = {
            let mut inner = self.inner.lock();
            inner.contexts.remove(&handle)
        };
        let Some(Context::BootstrapDial(ctx)) = ctx else { return };
        if let Some(cb) = ctx.callback {
            let _ = cb.send(Err(status));
        }
        for conn in [
            Some(ctx.initial_recv_connection_handle).filter(|h| *h != NULL_RACE_HANDLE),
            Some(ctx.initial_send_connection_handle).filter(|h| *h != NULL_RACE_HANDLE),
            ctx.final_recv_connection_handle,
            ctx.final_send_connection_handle,
        ]
        .into_iter()
        .flatten()
        {
            if self.release_dependent(conn, handle) {
                self.tear_down_connection(conn).await;
            }
        }
        let mut inner = self.inner.lock();
        inner.package_id_index.remove(&ctx.package_id);
    }

    /// §4.8: once the hello-response names where to reach the peer, resolve
    /// `ctx.callback` with the new Conduit handle and detach the initial
    /// channel pair — only after the final pair is fully open, so a package
    /// that arrives late on the initial link still has somewhere to land
    /// first.
    async fn bootstrap_dial_finish(&self, handle: RaceHandle) {
        let ctx = {
            let mut inner = self.inner.lock();
            if let Some(Context::BootstrapDial(ctx)) = inner.contexts.get_mut(&handle) {
                ctx.state = sm::bootstrap_dial::transition(ctx.state, &sm::bootstrap_dial::Event::AllConnectionsOpen);
            }
            inner.contexts.remove(&handle)
        };
        let Some(Context::BootstrapDial(ctx)) = ctx else { return };
        for conn in [ctx.initial_recv_connection_handle, ctx.initial_send_connection_handle] {
            if self.release_dependent(conn, handle) {
                self.tear_down_connection(conn).await;
            }
        }
        let (Some(final_send), Some(final_recv)) = (ctx.final_send_connection_handle, ctx.final_recv_connection_handle) else {
            if let Some(cb) = ctx.callback {
                let _ = cb.send(Err(ApiStatus::InternalError));
            }
            return;
        };
        {
            let mut inner = self.inner.lock();
            inner.contexts.insert(
                handle,
                Context::Conduit(ConduitContext {
                    state: sm::conduit::State::Open,
                    send_connection_handle: final_send,
                    recv_connection_handle: final_recv,
                    package_id: ctx.package_id,
                    inbound: VecDeque::new(),
                    pending_read: None,
                    pending_writes: VecDeque::new(),
                }),
            );
            inner.package_id_index.insert(ctx.package_id, handle);
        }
        if let Some(cb) = ctx.callback {
            let _ = cb.send(Ok(handle));
        }
    }

    /// §4.8: the listener side of a bootstrap hello. Opens a reply
    /// connection back to the dialer on the initial channel plus both
    /// final-channel connections, in that order — each settling dispatches
    /// back through `bootstrap_pre_conduit_on_connected`.
    async fn bootstrap_hello_received(&self, listener_handle: RaceHandle, initial_recv_connection_handle: RaceHandle, hello: envelope::Hello) {
        let Some(peer_bootstrap) = hello.bootstrap.clone() else {
            warn!(%listener_handle, "dropping bootstrap hello with no bootstrap addresses");
            return;
        };
        if peer_bootstrap.final_recv_link_address.is_empty() {
            warn!(%listener_handle, "dropping bootstrap hello with no final recv address");
            return;
        }
        let (role, final_send_channel, final_recv_channel) = {
            let inner = self.inner.lock();
            let Some(Context::BootstrapListen(listener)) = inner.contexts.get(&listener_handle) else {
                return;
            };
            (listener.role.clone(), listener.final_send_channel.clone(), listener.final_recv_channel.clone())
        };
        let bpc_handle = self.handles.next();
        {
            let mut inner = self.inner.lock();
            if let Some(cc) = inner.contexts.get_mut(&initial_recv_connection_handle).and_then(Context::as_connection_mut) {
                cc.dependents.insert(bpc_handle);
            }
            inner.contexts.insert(
                bpc_handle,
                Context::BootstrapPreConduit(BootstrapPreConduitContext {
                    state: sm::bootstrap_pre_conduit::State::Initial,
                    listener_handle,
                    initial_recv_connection_handle,
                    initial_send_connection_handle: None,
                    final_send_connection_handle: None,
                    final_recv_connection_handle: None,
                    package_id: hello.package_id,
                    peer_addresses: BootstrapAddressSet {
                        init_send_link_address: peer_bootstrap.init_send_link_address.clone(),
                        init_send_channel: ChannelId::from(peer_bootstrap.init_send_channel.clone()),
                        init_recv_link_address: peer_bootstrap.init_recv_link_address.clone(),
                        init_recv_channel: ChannelId::from(peer_bootstrap.init_recv_channel.clone()),
                        final_send_link_address: peer_bootstrap.final_send_link_address.clone(),
                        final_send_channel: ChannelId::from(peer_bootstrap.final_send_channel.clone()),
                        final_recv_link_address: peer_bootstrap.final_recv_link_address.clone(),
                        final_recv_channel: ChannelId::from(peer_bootstrap.final_recv_channel.clone()),
                    },
                    response_sent: false,
                }),
            );
            inner.package_id_index.insert(hello.package_id, bpc_handle);
        }
        if let Err(e) = self
            .attach_to_connection(
                ConnectionDirection::Send,
                ChannelId::from(hello.reply_channel.clone()),
                role.clone(),
                Some(hello.link_address.clone()),
                bpc_handle,
            )
            .await
        {
            self.fail_bootstrap_pre_conduit(bpc_handle, e.to_api_status()).await;
            return;
        }
        if let Err(e) = self.attach_to_connection(ConnectionDirection::Recv, final_recv_channel, role.clone(), None, bpc_handle).await {
            self.fail_bootstrap_pre_conduit(bpc_handle, e.to_api_status()).await;
            return;
        }
        if let Err(e) = self
            .attach_to_connection(
                ConnectionDirection::Send,
                final_send_channel,
                role,
                Some(peer_bootstrap.final_recv_link_address.clone()),
                bpc_handle,
            )
            .await
        {
            self.fail_bootstrap_pre_conduit(bpc_handle, e.to_api_status()).await;
        }
    }

    /// Three connections settle in a fixed order: the initial-channel reply
    /// (send), the final recv, the final send. The hello-response can go out
    /// as soon as the first two are up; the third is what finishes the
    /// conduit.
    async fn bootstrap_pre_conduit_on_connected(&self, handle: RaceHandle, connection_handle: RaceHandle) {
        let phase = {
            let mut inner = self.inner.lock();
            let Some(Context::BootstrapPreConduit(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            if ctx.initial_send_connection_handle.is_none() {
                ctx.initial_send_connection_handle = Some(connection_handle);
                "initial_send"
            } else if ctx.final_recv_connection_handle.is_none() {
                ctx.final_recv_connection_handle = Some(connection_handle);
                ctx.state = sm::bootstrap_pre_conduit::transition(ctx.state, &sm::bootstrap_pre_conduit::Event::FinalConnConnected);
                "final_recv"
            } else {
                ctx.final_send_connection_handle = Some(connection_handle);
                ctx.state = sm::bootstrap_pre_conduit::transition(ctx.state, &sm::bootstrap_pre_conduit::Event::FinalConnConnected);
                "final_send"
            }
        };
        match phase {
            "final_recv" => self.bootstrap_pre_conduit_maybe_send_response(handle).await,
            "final_send" => self.bootstrap_pre_conduit_finish(handle).await,
            _ => {}
        }
    }

    async fn bootstrap_pre_conduit_maybe_send_response(&self, handle: RaceHandle) {
        let ready = {
            let mut inner = self.inner.lock();
            let Some(Context::BootstrapPreConduit(ctx)) = inner.contexts.get_mut(&handle) else {
                return;
            };
            if ctx.response_sent || ctx.initial_send_connection_handle.is_none() || ctx.final_recv_connection_handle.is_none() {
                None
            } else {
                ctx.response_sent = true;
                Some((ctx.initial_send_connection_handle.unwrap(), ctx.final_recv_connection_handle.unwrap(), ctx.package_id))
            }
        };
        let Some((initial_send_handle, final_recv_handle, package_id)) = ready else {
            return;
        };
        let (channel, connection_id, final_recv_link_address) = {
            let inner = self.inner.lock();
            let Some(Context::Connection(send_conn)) = inner.contexts.get(&initial_send_handle) else {
                return;
            };
            let Some(connection_id) = send_conn.connection_id.clone() else {
                return;
            };
            let final_recv_link_address = inner
                .contexts
                .get(&final_recv_handle)
                .and_then(|c| match c {
                    Context::Connection(cc) => cc.link_address.clone(),
                    _ => None,
                })
                .unwrap_or_default();
            (send_conn.channel_id.clone(), connection_id, final_recv_link_address)
        };
        let Ok(plugin) = self.plugin_for_channel(&channel) else {
            self.fail_bootstrap_pre_conduit(handle, ApiStatus::InternalError).await;
            return;
        };
        let boot = BootstrapAddresses {
            init_send_link_address: String::new(),
            init_send_channel: String::new(),
            init_recv_link_address: String::new(),
            init_recv_channel: String::new(),
            final_send_link_address: String::new(),
            final_send_channel: String::new(),
            final_recv_link_address,
            final_recv_channel: String::new(),
        };
        let envelope_bytes = envelope::encode_hello("", "", package_id, b"", Some(&boot));
        let resp = plugin.send_package(handle, connection_id, EncPkg::new(envelope_bytes), None, 0).await;
        if resp.status != ApiStatus::Ok {
            self.fail_bootstrap_pre_conduit(handle, ApiStatus::InternalError).await;
        }
    }

    /// §4.8: converts to a Conduit and hands it to whichever `accept()`
    /// caller is waiting (or queues it) — only at this point, once the
    /// handle genuinely is a Conduit, unlike the plain `Listen` queue which
    /// queues a `PreConduit` for `accept_pre_conduit()` to finish later.
    async fn bootstrap_pre_conduit_finish(&self, handle: RaceHandle) {
        let ctx = {
            let mut inner = self.inner.lock();
            if let Some(Context::BootstrapPreConduit(ctx)) = inner.contexts.get_mut(&handle) {
                ctx.state = sm::bootstrap_pre_conduit::transition(ctx.state, &sm::bootstrap_pre_conduit::Event::AllConnectionsOpen);
            }
            inner.contexts.remove(&handle)
        };
        let Some(Context::BootstrapPreConduit(ctx)) = ctx else { return };
        for conn in [Some(ctx.initial_recv_connection_handle), ctx.initial_send_connection_handle].into_iter().flatten() {
            if self.release_dependent(conn, handle) {
                self.tear_down_connection(conn).await;
            }
        }
        let (Some(final_send), Some(final_recv)) = (ctx.final_send_connection_handle, ctx.final_recv_connection_handle) else {
            return;
        };
        let mut inner = self.inner.lock();
        inner.contexts.insert(
            handle,
            Context::Conduit(ConduitContext {
                state: sm::conduit::State::Open,
                send_connection_handle: final_send,
                recv_connection_handle: final_recv,
                package_id: ctx.package_id,
                inbound: VecDeque::new(),
                pending_read: None,
                pending_writes: VecDeque::new(),
            }),
        );
        inner.package_id_index.insert(ctx.package_id, handle);
        if let Some(Context::BootstrapListen(listener)) = inner.contexts.get_mut(&ctx.listener_handle) {
            if let Some(cb) = listener.pending_accepts.pop_front() {
                let _ = cb.send(Ok(handle));
            } else {
                listener.pending_pre_conduits.push_back(handle);
            }
        }
    }

    async fn fail_bootstrap_pre_conduit(&self, handle: RaceHandle, status: ApiStatus) {
        let ctx = {
            let mut inner = self.inner.lock();
            let ctx = inner.contexts.remove(&handle);
            if let Some(Context::BootstrapPreConduit(ctx)) = &ctx {
                inner.package_id_index.remove(&ctx.package_id);
            }
            ctx
        };
        let Some(Context::BootstrapPreConduit(ctx)) = ctx else { return };
        for conn in [
            Some(ctx.initial_recv_connection_handle),
            ctx.initial_send_connection_handle,
            ctx.final_recv_connection_handle,
            ctx.final_send_connection_handle,
        ]
        .into_iter()
        .flatten()
        {
            if self.release_dependent(conn, handle) {
                self.tear_down_connection(conn).await;
            }
        }
        let _ = status;
    }

    // ---- plugin callback ingestion (§4.9, §6) ----

    pub async fn on_channel_status_changed(
        &self,
        _handle: RaceHandle,
        channel_gid: ChannelId,
        status: ChannelStatus,
        properties: ChannelProperties,
    ) -> ApiStatus {
        let waiters = {
            let mut inner = self.inner.lock();
            let entry = inner.channel_activation.entry(channel_gid).or_default();
            entry.status = status;
            entry.properties = properties.clone();
            if status == ChannelStatus::Available {
                std::mem::take(&mut entry.waiters)
            } else if matches!(status, ChannelStatus::Failed | ChannelStatus::Unsupported | ChannelStatus::Unavailable) {
                std::mem::take(&mut entry.waiters)
            } else {
                Vec::new()
            }
        };
        for tx in waiters {
            let _ = tx.send(if status == ChannelStatus::Available {
                Ok(properties.clone())
            } else {
                Err(ApiStatus::ChannelInvalid)
            });
        }
        ApiStatus::Ok
    }

    pub async fn on_link_status_changed(
        &self,
        handle: RaceHandle,
        link_id: LinkId,
        status: LinkStatus,
        properties: LinkProperties,
    ) -> ApiStatus {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.link_index.insert(link_id.clone(), handle);
            let Some(ctx) = inner.contexts.get_mut(&handle).and_then(Context::as_connection_mut) else {
                return ApiStatus::InvalidArgument;
            };
            match status {
                LinkStatus::Created | LinkStatus::Loaded => {
                    ctx.link_id = Some(link_id);
                    ctx.link_address = properties.link_address.clone();
                    std::mem::take(&mut ctx.link_waiters).into_iter().map(|w| (w, Ok(()))).collect::<Vec<_>>()
                }
                LinkStatus::Destroyed => Vec::new(),
            }
        };
        for (tx, result) in waiters {
            let _ = tx.send(result);
        }
        ApiStatus::Ok
    }

    pub async fn on_connection_status_changed(
        &self,
        handle: RaceHandle,
        connection_id: ConnectionId,
        status: ConnectionStatus,
        _properties: LinkProperties,
    ) -> ApiStatus {
        match status {
            ConnectionStatus::Open => {
                let (channel, waiters) = {
                    let mut inner = self.inner.lock();
                    inner.connection_index.insert(connection_id.clone(), handle);
                    let Some(ctx) = inner.contexts.get_mut(&handle).and_then(Context::as_connection_mut) else {
                        return ApiStatus::InvalidArgument;
                    };
                    ctx.connection_id = Some(connection_id.clone());
                    ctx.state = sm::connection::transition(ctx.state, &sm::connection::Event::ConnectionEstablished);
                    ctx.state = sm::connection::transition(ctx.state, &sm::connection::Event::Always);
                    (ctx.channel_id.clone(), std::mem::take(&mut ctx.connected_waiters))
                };
                if let Ok(plugin) = self.plugin_for_channel(&channel) {
                    plugin.open_connection_queue(&connection_id);
                }
                for tx in waiters {
                    let _ = tx.send(Ok(()));
                }
                self.idle_notify.notify_waiters();
            }
            ConnectionStatus::Closed | ConnectionStatus::Unavailable => {
                let channel = {
                    let inner = self.inner.lock();
                    inner.contexts.get(&handle).and_then(|c| match c {
                        Context::Connection(cc) => Some(cc.channel_id.clone()),
                        _ => None,
                    })
                };
                if let Some(channel) = channel {
                    if let Ok(plugin) = self.plugin_for_channel(&channel) {
                        plugin.close_connection_queue(&connection_id);
                    }
                }
            }
            ConnectionStatus::Opening => {}
        }
        ApiStatus::Ok
    }

    pub async fn on_package_status_changed(&self, handle: RaceHandle, status: PackageStatus) -> ApiStatus {
        let kind = {
            let inner = self.inner.lock();
            inner.contexts.get(&handle).map(Context::kind)
        };
        let ok = status == PackageStatus::Sent;
        match kind {
            Some("Send") => {
                if ok {
                    self.complete_send(handle, ApiStatus::Ok).await;
                } else {
                    self.fail_send(handle, ApiStatus::InternalError).await;
                }
            }
            Some("Conduit") => {
                let waiter = self
                    .with_conduit_mut(handle, |ctx| {
                        ctx.state = sm::conduit::transition(
                            ctx.state,
                            if ok {
                                &sm::conduit::Event::PackageSent
                            } else {
                                &sm::conduit::Event::PackageFailed
                            },
                        );
                        ctx.pending_writes.pop_front()
                    })
                    .flatten();
                if let Some(tx) = waiter {
                    let _ = tx.send(if ok { ApiStatus::Ok } else { ApiStatus::InternalError });
                }
            }
            _ => {}
        }
        ApiStatus::Ok
    }

    pub async fn receive_enc_pkg(&self, pkg: EncPkg, connection_ids: Vec<ConnectionId>) -> ApiStatus {
        let bytes = pkg.into_bytes();
        for connection_id in connection_ids {
            self.route_package(&connection_id, bytes.clone()).await;
        }
        ApiStatus::Ok
    }

    async fn route_package(&self, connection_id: &ConnectionId, bytes: Bytes) {
        let (package_id, payload) = match envelope::decode_conduit_package(&bytes) {
            Ok(v) => v,
            Err(_) => {
                self.route_hello(connection_id, &bytes).await;
                return;
            }
        };

        let target = {
            let inner = self.inner.lock();
            inner.package_id_index.get(&package_id).copied()
        };
        if let Some(target) = target {
            let kind = {
                let inner = self.inner.lock();
                inner.contexts.get(&target).map(Context::kind)
            };
            match kind {
                Some("Conduit") => {
                    self.with_conduit_mut(target, |ctx| Self::deliver_to_conduit_static(ctx, payload));
                    return;
                }
                Some("SendReceive") => {
                    let message = payload.clone();
                    self.complete_send_receive(target, message).await;
                    return;
                }
                _ => {}
            }
        }

        // Not associated with any known packageId on this connection yet:
        // try it as a hello, else stash it (§4.9).
        self.route_hello(connection_id, &bytes).await;
    }

    /// A connection's dependents are whatever higher-level contexts
    /// (`Recv`, `SendReceive`, `Listen`, ...) are currently attached to it
    /// (§4.2); `route_hello` uses this to figure out who an inbound package
    /// is actually for, since `connection_index` only gets us to the
    /// connection itself.
    fn connection_dependents(inner: &ManagerInner, connection_id: &ConnectionId) -> Vec<RaceHandle> {
        let Some(conn_handle) = inner.connection_index.get(connection_id) else {
            return Vec::new();
        };
        match inner.contexts.get(conn_handle) {
            Some(Context::Connection(cc)) => cc.dependents.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    async fn route_hello(&self, connection_id: &ConnectionId, bytes: &Bytes) {
        let (recv_handle, listener_handle) = {
            let inner = self.inner.lock();
            let dependents = Self::connection_dependents(&inner, connection_id);
            let recv = dependents
                .iter()
                .copied()
                .find(|h| matches!(inner.contexts.get(h), Some(Context::Recv(_))));
            let listener = dependents.iter().copied().find(|h| {
                matches!(inner.contexts.get(h), Some(Context::Listen(_)) | Some(Context::BootstrapListen(_)))
            });
            (recv, listener)
        };

        // Plain send()/receive() never wraps its payload in a hello; it's
        // just raw bytes for whichever Recv context owns this connection.
        if let Some(recv_handle) = recv_handle {
            let pending = {
                let mut inner = self.inner.lock();
                Self::deliver_to_recv(&mut inner, recv_handle, bytes.clone())
            };
            if let Some(tx) = pending {
                let _ = tx.send(Ok(bytes.clone()));
            }
            return;
        }

        let hello = match envelope::decode_hello(bytes) {
            Ok(hello) => hello,
            Err(err) => {
                // §8, invariant 7: parsing is total, never panics; we just
                // log and drop (§7, "Handshake malformed") if this was meant
                // for a listener. Anything else just gets parked in case a
                // listener or send_receive() leg registers for it shortly.
                if listener_handle.is_some() {
                    warn!(%connection_id, error = %err, "dropping malformed hello");
                } else {
                    self.stash_unassociated(connection_id, bytes.clone());
                }
                return;
            }
        };

        // send_receive()'s recv leg: the dialer's hello carries the
        // SendReceiveContext's own package_id as its correlation id, not a
        // fresh one destined for a listener.
        let send_receive_target = {
            let inner = self.inner.lock();
            inner
                .package_id_index
                .get(&hello.package_id)
                .copied()
                .filter(|h| matches!(inner.contexts.get(h), Some(Context::SendReceive(_))))
        };
        if let Some(target) = send_receive_target {
            self.complete_send_receive(target, hello.message).await;
            return;
        }

        // bootstrap_dial()'s hello-response: carries the dialer's own
        // packageId back, naming the listener's final-recv address.
        let bootstrap_dial_target = {
            let inner = self.inner.lock();
            inner
                .package_id_index
                .get(&hello.package_id)
                .copied()
                .filter(|h| matches!(inner.contexts.get(h), Some(Context::BootstrapDial(_))))
        };
        if let Some(target) = bootstrap_dial_target {
            self.bootstrap_dial_hello_response(target, &hello).await;
            return;
        }

        let Some(listener_handle) = listener_handle else {
            self.stash_unassociated(connection_id, bytes.clone());
            return;
        };

        // A bootstrap listener's hello carries the dialer's final-channel
        // addresses and spawns a BootstrapPreConduit instead of a plain
        // PreConduit (§4.8) — handled entirely separately, since its
        // connection bring-up and accept()-queueing both differ from the
        // plain Listen path below.
        let listener_kind = {
            let inner = self.inner.lock();
            inner.contexts.get(&listener_handle).map(Context::kind)
        };
        if listener_kind == Some("BootstrapListen") {
            let recv_connection_handle = *self.inner.lock().connection_index.get(connection_id).unwrap();
            self.bootstrap_hello_received(listener_handle, recv_connection_handle, hello).await;
            return;
        }

        let expected_reply_channel = {
            let inner = self.inner.lock();
            match inner.contexts.get(&listener_handle) {
                Some(Context::Listen(l)) => Some(l.send_channel.clone()),
                _ => None,
            }
        };
        if let Some(expected) = expected_reply_channel {
            if hello.reply_channel != expected.as_str() {
                warn!(%connection_id, "dropping hello with mismatched replyChannel");
                return;
            }
        }

        let pre_conduit_handle = self.handles.next();
        {
            let mut inner = self.inner.lock();
            let recv_connection_handle = *inner.connection_index.get(connection_id).unwrap();
            if let Some(cc) = inner.contexts.get_mut(&recv_connection_handle).and_then(Context::as_connection_mut) {
                cc.dependents.insert(pre_conduit_handle);
            }
            inner.contexts.insert(
                pre_conduit_handle,
                Context::PreConduit(PreConduitContext {
                    state: sm::pre_conduit::State::Initial,
                    listener_handle,
                    recv_connection_handle,
                    send_connection_handle: None,
                    package_id: hello.package_id,
                    peer_link_address: hello.link_address.clone(),
                    peer_reply_channel: ChannelId::from(hello.reply_channel.clone()),
                }),
            );
            inner.package_id_index.insert(hello.package_id, pre_conduit_handle);
            if let Some(Context::Listen(listener)) = inner.contexts.get_mut(&listener_handle) {
                listener.pending_pre_conduits.push_back(pre_conduit_handle);
                if let Some(cb) = listener.pending_accepts.pop_front() {
                    let _ = cb.send(Ok(listener.pending_pre_conduits.pop_front().unwrap_or(pre_conduit_handle)));
                }
            }
        }
        info!(%connection_id, "hello received, pre-conduit queued");
    }

    fn stash_unassociated(&self, connection_id: &ConnectionId, payload: Bytes) {
        let mut inner = self.inner.lock();
        let queue = inner.unassociated_packages.entry(connection_id.clone()).or_default();
        if queue.len() >= self.config.unassociated_package_queue_depth {
            queue.pop_front();
        }
        queue.push_back(UnassociatedPackage {
            arrived_at: Instant::now(),
            payload,
        });
    }

    pub async fn update_link_properties(&self, link_id: LinkId, properties: LinkProperties) -> ApiStatus {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.link_index.get(&link_id).copied() {
            if let Some(ctx) = inner.contexts.get_mut(&handle).and_then(Context::as_connection_mut) {
                ctx.updated_link_address = properties.link_address;
                return ApiStatus::Ok;
            }
        }
        ApiStatus::InvalidArgument
    }

    pub async fn request_user_input(&self, plugin_id: &str, key: String, prompt: String, cache: bool) -> ApiStatus {
        debug!(plugin_id, %key, %prompt, cache, "plugin-scoped user input requested (no UI collaborator wired up)");
        ApiStatus::InternalError
    }

    pub async fn request_common_user_input(&self, plugin_id: &str, key: String) -> ApiStatus {
        debug!(plugin_id, %key, "common user input requested (no UI collaborator wired up)");
        ApiStatus::InternalError
    }

    pub async fn unblock_queue(&self, connection_id: ConnectionId) -> ApiStatus {
        let channel = {
            let inner = self.inner.lock();
            inner
                .connection_index
                .get(&connection_id)
                .and_then(|h| inner.contexts.get(h))
                .and_then(|c| match c {
                    Context::Connection(cc) => Some(cc.channel_id.clone()),
                    _ => None,
                })
        };
        if let Some(plugin) = channel.and_then(|c| self.plugin_for_channel(&c).ok()) {
            plugin.open_connection_queue(&connection_id);
        }
        ApiStatus::Ok
    }

    // ---- debug / test helpers (§10.6) ----

    /// Renders every live context for troubleshooting. Mirrors the
    /// original `dumpContexts` debug command.
    pub fn debug_contexts(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for (handle, ctx) in inner.contexts.iter() {
            out.push_str(&format!("{handle} -> {}\n", ctx.kind()));
        }
        trace!(contexts = %out, "dumped contexts");
        out
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let empty = |inner: &ManagerInner| {
            inner.contexts.values().all(|c| matches!(c, Context::Conduit(_) | Context::Listen(_)))
        };
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if empty(&self.inner.lock()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.idle_notify.notified()).await.is_err() {
                return empty(&self.inner.lock());
            }
        }
    }
}

fn status_for(status: ApiStatus) -> ChannelStatus {
    match status {
        ApiStatus::Ok => ChannelStatus::Available,
        _ => ChannelStatus::Failed,
    }
}
