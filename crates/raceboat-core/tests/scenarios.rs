//! End-to-end scenarios (§8) driven directly against [`ApiManager`], using a
//! minimal in-process loopback plugin. `raceboat-transport-mem` covers the
//! same ground plus the happy-path round trip from the facade crate's own
//! tests; this file exists to drive the manager's handshake edge cases
//! (malformed hello, mismatched reply channel, mid-conduit write failure)
//! that call for injecting bytes the facade has no way to construct.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use raceboat_core::{ApiManager, ConnectionOptions, RaceConfig, SdkWrapper};
use raceboat_plugin::{
    ApiStatus, ChannelId, ChannelProperties, ChannelStatus, ConnectionId, ConnectionStatus, EncPkg,
    LinkDirection, LinkId, LinkProperties, LinkStatus, LinkType, PackageStatus, PluginConfig,
    PluginSdk, RaceHandle, SdkResponse, TransportPlugin,
};
use tokio::sync::mpsc;

type Mailbox = mpsc::UnboundedSender<Bytes>;

fn directory() -> &'static Mutex<HashMap<String, Mailbox>> {
    static DIRECTORY: OnceLock<Mutex<HashMap<String, Mailbox>>> = OnceLock::new();
    DIRECTORY.get_or_init(|| Mutex::new(HashMap::new()))
}

struct LinkState {
    address: Option<String>,
    peer_address: Option<String>,
    connection: Mutex<Option<ConnectionId>>,
}

/// A bare-bones loopback transport: addresses are just counter values, and
/// `send_package` can be told to fail the next write (scenario S6).
struct LoopbackPlugin {
    sdk: Arc<dyn PluginSdk>,
    next_address: AtomicU64,
    links: Mutex<HashMap<LinkId, Arc<LinkState>>>,
    connections: Mutex<HashMap<ConnectionId, Arc<LinkState>>>,
    fail_next_send: AtomicBool,
}

impl LoopbackPlugin {
    fn new(sdk: Arc<dyn PluginSdk>) -> Arc<Self> {
        Arc::new(LoopbackPlugin {
            sdk,
            next_address: AtomicU64::new(1),
            links: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            fail_next_send: AtomicBool::new(false),
        })
    }

    fn fail_next_send_package(&self) {
        self.fail_next_send.store(true, Ordering::SeqCst);
    }

    fn spawn_inbox(&self, state: Arc<LinkState>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        let sdk = self.sdk.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let Some(connection_id) = state.connection.lock().clone() else {
                    continue;
                };
                sdk.receive_enc_pkg(EncPkg::new(bytes), vec![connection_id]).await;
            }
        });
    }
}

#[async_trait]
impl TransportPlugin for LoopbackPlugin {
    async fn init(&self, handle: RaceHandle, _config: PluginConfig) -> SdkResponse {
        SdkResponse::ok(handle, 0.0)
    }

    async fn shutdown(&self, handle: RaceHandle) -> SdkResponse {
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
        let address = format!("loopback://{}", self.next_address.fetch_add(1, Ordering::Relaxed));
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
        let link_id = self.sdk.generate_link_id(&channel_gid);
        let state = Arc::new(LinkState {
            address: None,
            peer_address: Some(link_address.clone()),
            connection: Mutex::new(None),
        });
        self.links.lock().insert(link_id.clone(), state);
        self.sdk
            .on_link_status_changed(handle, link_id, LinkStatus::Created, LinkProperties { link_address: Some(link_address) })
            .await;
        SdkResponse::ok(handle, 0.0)
    }

    async fn load_link_address(&self, handle: RaceHandle, channel_gid: ChannelId, link_address: String) -> SdkResponse {
        self.create_link_from_address(handle, channel_gid, link_address).await
    }

    async fn load_link_addresses(&self, handle: RaceHandle, channel_gid: ChannelId, link_addresses: Vec<String>) -> SdkResponse {
        let Some(first) = link_addresses.into_iter().next() else {
            return SdkResponse::error(ApiStatus::InvalidArgument, handle);
        };
        self.create_link_from_address(handle, channel_gid, first).await
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
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            self.sdk.on_package_status_changed(handle, PackageStatus::FailedGeneric).await;
            return SdkResponse::error(ApiStatus::PluginError, handle);
        }
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

/// Both ends of a scenario must agree on the channel name: it's the wire
/// value a hello's `replyChannel` is checked against (§3), not just a local
/// plugin lookup key.
async fn node(channels: &[&str]) -> (Arc<ApiManager>, Arc<LoopbackPlugin>) {
    let manager = ApiManager::new(RaceConfig::default());
    let sdk = SdkWrapper::new(manager.clone(), "loopback-test");
    let plugin = LoopbackPlugin::new(sdk);
    let channel_ids: Vec<ChannelId> = channels.iter().map(|c| ChannelId::from(*c)).collect();
    manager
        .register_plugin(channel_ids, "loopback-test", plugin.clone())
        .await
        .unwrap();
    (manager, plugin)
}

/// S1: a raw send() with no hello envelope reaches the matching receive().
#[tokio::test]
async fn s1_fire_and_forget_send_reaches_receive() {
    let (server, _server_plugin) = node(&["T"]).await;
    let (client, _client_plugin) = node(&["T"]).await;
    let channel: ChannelId = "T".into();

    let (status, address, listener) = server.receive(ConnectionOptions::recv_only(channel.clone(), "default")).await;
    assert_eq!(status, ApiStatus::Ok);
    let address = address.expect("receive() should report its address");

    let send_status = client
        .send_str(ConnectionOptions::send_only(channel, "default", address), "Hello, World!")
        .await;
    assert_eq!(send_status, ApiStatus::Ok);

    let payload = server.receive_next(listener).await.expect("payload should arrive");
    assert_eq!(&payload[..], b"Hello, World!");
}

/// S4: a malformed hello on a listener connection is dropped, not stashed,
/// and the listener's own state is untouched.
#[tokio::test]
async fn s4_malformed_hello_is_dropped() {
    let (server, _server_plugin) = node(&["T"]).await;
    let (client, _client_plugin) = node(&["T"]).await;
    let channel: ChannelId = "T".into();

    let (status, address, listener) = server.listen(ConnectionOptions::bidi(channel.clone(), "default")).await;
    assert_eq!(status, ApiStatus::Ok);
    let address = address.expect("listen() should report its address");

    let garbage_status = client
        .send_str(ConnectionOptions::send_only(channel, "default", address), "srctybu")
        .await;
    assert_eq!(garbage_status, ApiStatus::Ok, "the transport accepted the bytes even though they're not a hello");

    // No accept() ever completes for the garbage package.
    let accept = tokio::time::timeout(std::time::Duration::from_millis(200), server.accept(listener)).await;
    assert!(accept.is_err(), "accept() should not see a pre-conduit for a malformed hello");

    assert_eq!(server.close(listener).await, ApiStatus::Ok);
}

/// S5: a well-formed hello with the wrong replyChannel is dropped and no
/// pre-conduit is ever queued.
#[tokio::test]
async fn s5_mismatched_reply_channel_is_dropped() {
    let (server, _server_plugin) = node(&["T"]).await;
    // The client activates a second channel purely to give itself a
    // `recv_channel` distinct from "T" — `dial()` stamps that into the
    // hello's replyChannel (§4.7), and the listener expects "T" back.
    let (client, _client_plugin) = node(&["T", "WRONG"]).await;

    let (status, address, listener) = server.listen(ConnectionOptions::bidi("T", "default")).await;
    assert_eq!(status, ApiStatus::Ok);
    let address = address.expect("listen() should report its address");

    let dial_opts = ConnectionOptions {
        recv_channel: Some(ChannelId::from("WRONG")),
        ..ConnectionOptions::send_only("T", "default", address)
    };
    let dial = client.dial_str(dial_opts, "hello from client").await;
    assert!(dial.is_ok(), "dial() itself should succeed; the mismatch is only caught on the listener side");

    let accept = tokio::time::timeout(std::time::Duration::from_millis(200), server.accept(listener)).await;
    assert!(accept.is_err(), "accept() should not see a pre-conduit for a mismatched replyChannel");

    assert_eq!(server.close(listener).await, ApiStatus::Ok);
}

/// S3 + S6: a long-lived conduit carries several messages in order, and a
/// write failure surfaces as INTERNAL_ERROR without preventing `close()`
/// from still returning OK.
#[tokio::test]
async fn s3_and_s6_conduit_round_trip_and_write_failure() {
    let (server, _server_plugin) = node(&["T"]).await;
    let (client, client_plugin) = node(&["T"]).await;

    let (status, address, listener) = server.listen(ConnectionOptions::bidi("T", "default")).await;
    assert_eq!(status, ApiStatus::Ok);
    let address = address.expect("listen() should report its address");

    let dial_opts = ConnectionOptions::bidi("T", "default").with_address(address);
    let client_conduit = client.dial_str(dial_opts, "Hello from client").await.expect("dial should succeed");

    let server_conduit = server.accept(listener).await.expect("accept should see the hello");
    let first = server.conduit_read(server_conduit, None).await.expect("server should read the hello payload");
    assert_eq!(&first[..], b"Hello from client");

    assert_eq!(server.conduit_write(server_conduit, Bytes::from_static(b"Hello from server")).await, ApiStatus::Ok);
    let reply = client.conduit_read(client_conduit, None).await.expect("client should read the server's reply");
    assert_eq!(&reply[..], b"Hello from server");

    assert_eq!(
        client
            .conduit_write(client_conduit, Bytes::from_static(b"Hello from client message 2"))
            .await,
        ApiStatus::Ok
    );
    let second = server.conduit_read(server_conduit, None).await.expect("server should read the second message");
    assert_eq!(&second[..], b"Hello from client message 2");

    // S6: force the next write to fail and confirm it surfaces cleanly.
    client_plugin.fail_next_send_package();
    let failed_write = client.conduit_write(client_conduit, Bytes::from_static(b"this one fails")).await;
    assert_eq!(failed_write, ApiStatus::InternalError);

    assert_eq!(client.close(client_conduit).await, ApiStatus::Ok);
    assert_eq!(server.close(server_conduit).await, ApiStatus::Ok);
}
