//! In-process loopback [`TransportPlugin`]. Grounded on the same idea as
//! `rapace-core`'s `MemTransport`: two ends of an mpsc channel standing in
//! for a real link, with no bytes ever leaving the process.
//!
//! Unlike a point-to-point transport, raceboat links are looked up by
//! address, so this crate keeps a single process-wide directory of open
//! mailboxes rather than handing back a connected pair directly: whichever
//! side calls `createLinkFromAddress` with another link's advertised address
//! finds it there.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use raceboat_plugin::{
    ApiStatus, ChannelId, ChannelProperties, ChannelStatus, ConnectionId, ConnectionStatus,
    EncPkg, LinkDirection, LinkId, LinkProperties, LinkStatus, LinkType, PackageStatus,
    PluginConfig, PluginSdk, RaceHandle, SdkResponse, TransportPlugin,
};
use tokio::sync::mpsc;
use tracing::{trace, warn};

type Mailbox = mpsc::UnboundedSender<Bytes>;

fn directory() -> &'static Mutex<HashMap<String, Mailbox>> {
    static DIRECTORY: OnceLock<Mutex<HashMap<String, Mailbox>>> = OnceLock::new();
    DIRECTORY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Either end of a link: an address we own (and read from), or a peer
/// address we write to. A link only ever has one open connection at a time,
/// matching how the core binds one `ConnectionId` per `(LinkId, direction)`.
struct LinkState {
    address: Option<String>,
    peer_address: Option<String>,
    connection: Mutex<Option<ConnectionId>>,
}

/// A loopback transport: every link it creates is addressable by every
/// `MemPlugin` in the process, not just the one that created it.
pub struct MemPlugin {
    sdk: Arc<dyn PluginSdk>,
    instance_id: u64,
    next_address: AtomicU64,
    links: Mutex<HashMap<LinkId, Arc<LinkState>>>,
    connections: Mutex<HashMap<ConnectionId, Arc<LinkState>>>,
}

impl MemPlugin {
    pub fn new(sdk: Arc<dyn PluginSdk>) -> Arc<Self> {
        Arc::new(MemPlugin {
            sdk,
            instance_id: rand::random(),
            next_address: AtomicU64::new(1),
            links: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        })
    }

    fn fresh_address(&self) -> String {
        format!("mem://{:016x}/{}", self.instance_id, self.next_address.fetch_add(1, Ordering::Relaxed))
    }

    fn spawn_inbox(&self, state: Arc<LinkState>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        let sdk = self.sdk.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let Some(connection_id) = state.connection.lock().clone() else {
                    trace!("mem transport: dropping inbound package, no open connection on link");
                    continue;
                };
                let status = sdk.receive_enc_pkg(EncPkg::new(bytes), vec![connection_id]).await;
                if status != ApiStatus::Ok {
                    warn!(?status, "mem transport: receive_enc_pkg rejected delivery");
                }
            }
        });
    }

    async fn create_link_from_address_inner(&self, handle: RaceHandle, channel_gid: ChannelId, peer_address: String) -> SdkResponse {
        let link_id = self.sdk.generate_link_id(&channel_gid);
        let state = Arc::new(LinkState {
            address: None,
            peer_address: Some(peer_address.clone()),
            connection: Mutex::new(None),
        });
        self.links.lock().insert(link_id.clone(), state);
        self.sdk
            .on_link_status_changed(handle, link_id, LinkStatus::Created, LinkProperties { link_address: Some(peer_address) })
            .await;
        SdkResponse::ok(handle, 0.0)
    }
}

#[async_trait]
impl TransportPlugin for MemPlugin {
    async fn init(&self, handle: RaceHandle, _config: PluginConfig) -> SdkResponse {
        SdkResponse::ok(handle, 0.0)
    }

    async fn shutdown(&self, handle: RaceHandle) -> SdkResponse {
        for (_, state) in self.links.lock().drain() {
            if let Some(addr) = &state.address {
                directory().lock().remove(addr);
            }
        }
        self.connections.lock().clear();
        SdkResponse::ok(handle, 0.0)
    }

    async fn activate_channel(&self, handle: RaceHandle, channel_gid: ChannelId, _role: String) -> SdkResponse {
        let properties = ChannelProperties {
            roles: vec!["default".to_string()],
            link_direction: LinkDirection::Bidi,
            bootstrap: false,
            multi_addressable: false,
        };
        self.sdk.on_channel_status_changed(handle, channel_gid, ChannelStatus::Available, properties).await;
        SdkResponse::ok(handle, 0.0)
    }

    async fn deactivate_channel(&self, handle: RaceHandle, _channel_gid: ChannelId) -> SdkResponse {
        SdkResponse::ok(handle, 0.0)
    }

    async fn create_link(&self, handle: RaceHandle, channel_gid: ChannelId) -> SdkResponse {
        let link_id = self.sdk.generate_link_id(&channel_gid);
        let address = self.fresh_address();
        let (tx, rx) = mpsc::unbounded_channel();
        directory().lock().insert(address.clone(), tx);
        let state = Arc::new(LinkState {
            address: Some(address.clone()),
            peer_address: None,
            connection: Mutex::new(None),
        });
        self.links.lock().insert(link_id.clone(), state.clone());
        self.spawn_inbox(state, rx);
        self.sdk
            .on_link_status_changed(handle, link_id, LinkStatus::Created, LinkProperties { link_address: Some(address) })
            .await;
        SdkResponse::ok(handle, 0.0)
    }

    async fn create_link_from_address(&self, handle: RaceHandle, channel_gid: ChannelId, link_address: String) -> SdkResponse {
        self.create_link_from_address_inner(handle, channel_gid, link_address).await
    }

    async fn load_link_address(&self, handle: RaceHandle, channel_gid: ChannelId, link_address: String) -> SdkResponse {
        self.create_link_from_address_inner(handle, channel_gid, link_address).await
    }

    async fn load_link_addresses(&self, handle: RaceHandle, channel_gid: ChannelId, link_addresses: Vec<String>) -> SdkResponse {
        let Some(first) = link_addresses.into_iter().next() else {
            return SdkResponse::error(ApiStatus::InvalidArgument, handle);
        };
        self.create_link_from_address_inner(handle, channel_gid, first).await
    }

    async fn destroy_link(&self, handle: RaceHandle, link_id: LinkId) -> SdkResponse {
        if let Some(state) = self.links.lock().remove(&link_id) {
            if let Some(addr) = &state.address {
                directory().lock().remove(addr);
            }
        }
        self.sdk.on_link_status_changed(handle, link_id, LinkStatus::Destroyed, LinkProperties::default()).await;
        SdkResponse::ok(handle, 0.0)
    }

    async fn open_connection(
        &self,
        handle: RaceHandle,
        _link_type: LinkType,
        link_id: LinkId,
        _link_hints: String,
        _priority: i32,
        _send_timeout_ms: Option<u64>,
        _timeout_ms: Option<u64>,
    ) -> SdkResponse {
        let Some(state) = self.links.lock().get(&link_id).cloned() else {
            return SdkResponse::error(ApiStatus::InvalidArgument, handle);
        };
        let connection_id = self.sdk.generate_connection_id(&link_id);
        *state.connection.lock() = Some(connection_id.clone());
        self.connections.lock().insert(connection_id.clone(), state);
        self.sdk
            .on_connection_status_changed(handle, connection_id, ConnectionStatus::Open, LinkProperties::default())
            .await;
        SdkResponse::ok(handle, 0.0)
    }

    async fn close_connection(&self, handle: RaceHandle, connection_id: ConnectionId, _timeout_ms: Option<u64>) -> SdkResponse {
        if let Some(state) = self.connections.lock().remove(&connection_id) {
            *state.connection.lock() = None;
        }
        self.sdk
            .on_connection_status_changed(handle, connection_id, ConnectionStatus::Closed, LinkProperties::default())
            .await;
        SdkResponse::ok(handle, 0.0)
    }

    async fn send_package(
        &self,
        handle: RaceHandle,
        connection_id: ConnectionId,
        pkg: EncPkg,
        _timeout_ms: Option<u64>,
        _batch_id: u64,
    ) -> SdkResponse {
        let Some(state) = self.connections.lock().get(&connection_id).cloned() else {
            return SdkResponse::error(ApiStatus::InvalidArgument, handle);
        };
        let Some(peer_address) = state.peer_address.clone() else {
            return SdkResponse::error(ApiStatus::PluginError, handle);
        };
        let mailbox = directory().lock().get(&peer_address).cloned();
        match mailbox {
            Some(mailbox) if mailbox.send(pkg.into_bytes()).is_ok() => {
                self.sdk.on_package_status_changed(handle, PackageStatus::Sent).await;
                SdkResponse::ok(handle, 0.0)
            }
            _ => {
                self.sdk.on_package_status_changed(handle, PackageStatus::FailedGeneric).await;
                SdkResponse::error(ApiStatus::PluginError, handle)
            }
        }
    }

    async fn flush_channel(&self, handle: RaceHandle, _channel_gid: ChannelId, _batch_id: u64, _timeout_ms: Option<u64>) -> SdkResponse {
        SdkResponse::ok(handle, 0.0)
    }

    async fn on_user_input_received(&self, handle: RaceHandle, _answered: bool, _response: String, _timeout_ms: Option<u64>) -> SdkResponse {
        SdkResponse::ok(handle, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raceboat_core::{ApiManager, ConnectionOptions, RaceConfig, SdkWrapper};

    async fn node() -> (Arc<ApiManager>, ChannelId) {
        let manager = ApiManager::new(RaceConfig::default());
        let sdk = SdkWrapper::new(manager.clone(), "mem-test");
        let plugin = MemPlugin::new(sdk);
        let channel: ChannelId = "memDirect".into();
        manager.register_plugin(vec![channel.clone()], "mem-test", plugin).await.unwrap();
        (manager, channel)
    }

    #[tokio::test]
    async fn two_nodes_exchange_a_send_receive_round_trip() {
        let (listener_mgr, channel) = node().await;
        let (dialer_mgr, _) = node().await;

        let listen_opts = ConnectionOptions::bidi(channel.clone(), "default");
        let (status, link_address, listen_handle) = listener_mgr.listen(listen_opts).await;
        assert_eq!(status, ApiStatus::Ok);
        let link_address = link_address.expect("listener must report its link address");

        let dial_opts = ConnectionOptions::bidi(channel, "default").with_address(link_address);
        let send_receive = tokio::spawn({
            let dialer_mgr = dialer_mgr.clone();
            async move { dialer_mgr.send_receive_str(dial_opts, "ping").await }
        });

        let conduit = listener_mgr.accept(listen_handle).await.expect("accept should see the hello");
        listener_mgr.conduit_write(conduit, Bytes::from_static(b"pong")).await;

        let response = send_receive.await.unwrap().expect("send_receive should complete");
        assert_eq!(response, "pong");
    }
}
