#![doc = include_str!("../README.md")]
//!
//! Every wrapper type here is a thin pair of `(Arc<ApiManager>, RaceHandle)`;
//! the actual state machines live in `raceboat-core` (§4). `receive_respond`
//! has no direct manager-level primitive of its own — it's built on
//! `listen()`/`accept()`, since that's the only machinery that carries a
//! return address back to the core (§9).

use std::sync::Arc;

use bytes::Bytes;
pub use raceboat_core::{BootstrapOptions, ConnectionOptions, RaceConfig, ResumeOptions};
use raceboat_core::{ApiManager, SdkWrapper};
pub use raceboat_plugin::{ApiStatus, ChannelId, PluginSdk, TransportPlugin};

/// A running instance of the library: one API manager plus whatever
/// transport plugins have been registered against it (§4.9).
///
/// Cheaply cloneable — it's just an `Arc<ApiManager>` underneath, so a
/// `Race` can be shared across tasks the same way the application shares a
/// socket pool or a database connection.
#[derive(Clone)]
pub struct Race {
    manager: Arc<ApiManager>,
}

impl Race {
    /// Starts a new instance with no plugins registered yet. Call
    /// [`Race::add_plugin`] for each transport the application needs before
    /// issuing any channel operation.
    pub fn new(config: RaceConfig) -> Self {
        Race {
            manager: ApiManager::new(config),
        }
    }

    /// Registers `plugin` as the transport backing `channel_ids` and runs
    /// its `init` (§4.2). `build` receives the [`PluginSdk`] handle the
    /// plugin should hold onto to call back into this `Race` — most plugins
    /// need it before they can be constructed, hence the factory closure
    /// rather than a plain `Arc<dyn TransportPlugin>` argument.
    pub async fn add_plugin(
        &self,
        channel_ids: Vec<ChannelId>,
        plugin_id: impl Into<String> + Clone,
        build: impl FnOnce(Arc<dyn PluginSdk>) -> Arc<dyn TransportPlugin>,
    ) -> Result<(), ApiStatus> {
        let sdk: Arc<dyn PluginSdk> = SdkWrapper::new(self.manager.clone(), plugin_id.clone());
        let plugin = build(sdk);
        self.manager
            .register_plugin(channel_ids, plugin_id, plugin)
            .await
            .map_err(|e| e.to_api_status())
    }

    /// Fire-and-forget send (§4.5, scenario S1): delivers `payload` to
    /// whichever `receive()` is listening on `opts.send_address`. No reply
    /// is expected.
    pub async fn send(&self, opts: ConnectionOptions, payload: impl Into<Bytes>) -> ApiStatus {
        self.manager.send(opts, payload.into()).await
    }

    pub async fn send_str(&self, opts: ConnectionOptions, payload: &str) -> ApiStatus {
        self.manager.send_str(opts, payload).await
    }

    /// Request/reply in one call (§4.5, scenario S2): sends `payload` and
    /// waits for the single reply.
    pub async fn send_receive(&self, opts: ConnectionOptions, payload: impl Into<Bytes>) -> Result<Bytes, ApiStatus> {
        self.manager.send_receive(opts, payload.into()).await
    }

    pub async fn send_receive_str(&self, opts: ConnectionOptions, payload: &str) -> Result<String, ApiStatus> {
        self.manager.send_receive_str(opts, payload).await
    }

    /// Opens a standing receiver (§4.5). Returns the link address other
    /// parties can `send()` to, and a [`ReceiveObject`] to pull payloads
    /// from as they arrive.
    pub async fn receive(&self, opts: ConnectionOptions) -> (ApiStatus, Option<String>, ReceiveObject) {
        let (status, address, handle) = self.manager.receive(opts).await;
        (status, address, ReceiveObject::new(self.manager.clone(), handle))
    }

    /// A `receive()` whose caller also wants to answer each sender: built on
    /// top of `listen()`/`accept()`, since that's the only machinery that
    /// actually carries a return address back to the core (§9: a plain
    /// `Recv` context never gets one).
    pub async fn receive_respond(&self, opts: ConnectionOptions) -> (ApiStatus, Option<String>, ReceiveRespondObject) {
        let (status, address, accept) = self.listen(opts).await;
        (status, address, ReceiveRespondObject(accept))
    }

    /// Opens a listener and returns an [`AcceptObject`] to pull incoming
    /// conduits from (§4.6, scenario S3).
    pub async fn listen(&self, opts: ConnectionOptions) -> (ApiStatus, Option<String>, AcceptObject) {
        let (status, address, handle) = self.manager.listen(opts).await;
        (status, address, AcceptObject::new(self.manager.clone(), handle))
    }

    /// Dials a listener's address, sending `payload` as the hello message,
    /// and returns the resulting long-lived [`Conduit`] once the peer
    /// accepts (§4.7).
    pub async fn dial(&self, opts: ConnectionOptions, payload: impl Into<Bytes>) -> Result<Conduit, ApiStatus> {
        let handle = self.manager.dial(opts, payload.into()).await?;
        Ok(Conduit::new(self.manager.clone(), handle))
    }

    pub async fn dial_str(&self, opts: ConnectionOptions, payload: &str) -> Result<Conduit, ApiStatus> {
        let handle = self.manager.dial_str(opts, payload).await?;
        Ok(Conduit::new(self.manager.clone(), handle))
    }

    /// Re-attaches to a conduit that survived a process restart, keyed on
    /// the packageId the original hello negotiated (§4.7).
    pub async fn resume(&self, opts: ResumeOptions) -> Result<Conduit, ApiStatus> {
        let handle = self.manager.resume(opts).await?;
        Ok(Conduit::new(self.manager.clone(), handle))
    }

    /// Bootstrap listen (§4.8): negotiates over an initial channel pair
    /// before handing off to a long-lived conduit on the final pair.
    pub async fn bootstrap_listen(&self, opts: BootstrapOptions) -> (ApiStatus, Option<String>, AcceptObject) {
        let (status, address, handle) = self.manager.bootstrap_listen(opts).await;
        (status, address, AcceptObject::new(self.manager.clone(), handle))
    }

    pub async fn bootstrap_dial(&self, opts: BootstrapOptions, init_send_address: String) -> Result<Conduit, ApiStatus> {
        let handle = self.manager.bootstrap_dial(opts, init_send_address).await?;
        Ok(Conduit::new(self.manager.clone(), handle))
    }

    pub async fn bootstrap_dial_str(&self, opts: BootstrapOptions, init_send_address: &str) -> Result<Conduit, ApiStatus> {
        self.bootstrap_dial(opts, init_send_address.to_string()).await
    }
}

/// A standing receiver opened by [`Race::receive`] (§4.5).
pub struct ReceiveObject {
    manager: Arc<ApiManager>,
    handle: raceboat_plugin::RaceHandle,
}

impl ReceiveObject {
    fn new(manager: Arc<ApiManager>, handle: raceboat_plugin::RaceHandle) -> Self {
        ReceiveObject { manager, handle }
    }

    /// Pulls the next payload, parking until one arrives.
    pub async fn receive_next(&self) -> Result<Bytes, ApiStatus> {
        self.manager.receive_next(self.handle).await
    }

    pub async fn receive_str(&self) -> Result<String, ApiStatus> {
        let bytes = self.receive_next().await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ApiStatus::InternalError)
    }

    /// Completes a pending `receive_next()` with `CANCELLED` without
    /// tearing down the receiver itself, unlike `close()`.
    pub async fn cancel(&self) -> ApiStatus {
        self.manager.cancel_event(self.handle).await
    }

    pub async fn close(self) -> ApiStatus {
        self.manager.close(self.handle).await
    }
}

/// A `receive()` that can also answer the sender of each message, built on
/// `listen()`/`accept()` (§9).
pub struct ReceiveRespondObject(AcceptObject);

impl ReceiveRespondObject {
    /// Waits for the next incoming conduit, reads its first message, and
    /// hands back a [`RespondObject`] to answer it with.
    pub async fn receive_respond(&self) -> Result<(Bytes, RespondObject), ApiStatus> {
        let conduit = self.0.accept().await?;
        let message = conduit.read(None).await?;
        Ok((message, RespondObject(conduit)))
    }

    pub async fn receive_respond_str(&self) -> Result<(String, RespondObject), ApiStatus> {
        let (bytes, responder) = self.receive_respond().await?;
        let message = String::from_utf8(bytes.to_vec()).map_err(|_| ApiStatus::InternalError)?;
        Ok((message, responder))
    }

    pub async fn close(self) -> ApiStatus {
        self.0.close().await
    }
}

/// One sender's end of a [`ReceiveRespondObject`] exchange (§4.6, scenario
/// S2). Answers with a single reply over the same conduit the hello opened.
pub struct RespondObject(Conduit);

impl RespondObject {
    pub async fn respond(&self, payload: impl Into<Bytes>) -> ApiStatus {
        self.0.write(payload).await
    }

    pub async fn respond_str(&self, payload: &str) -> ApiStatus {
        self.0.write_str(payload).await
    }

    pub async fn close(self) -> ApiStatus {
        self.0.close().await
    }
}

/// A listener opened by [`Race::listen`] or [`Race::bootstrap_listen`]
/// (§4.6).
pub struct AcceptObject {
    manager: Arc<ApiManager>,
    handle: raceboat_plugin::RaceHandle,
}

impl AcceptObject {
    fn new(manager: Arc<ApiManager>, handle: raceboat_plugin::RaceHandle) -> Self {
        AcceptObject { manager, handle }
    }

    /// Matches the next queued hello against this call, or parks until one
    /// arrives (§4.6). `close()` cancels every parked `accept()` with
    /// `CLOSING`.
    pub async fn accept(&self) -> Result<Conduit, ApiStatus> {
        let conduit_handle = self.manager.accept(self.handle).await?;
        Ok(Conduit::new(self.manager.clone(), conduit_handle))
    }

    /// Completes a pending `accept()` with `CANCELLED` without tearing down
    /// the listener itself, unlike `close()`.
    pub async fn cancel(&self) -> ApiStatus {
        self.manager.cancel_event(self.handle).await
    }

    pub async fn close(self) -> ApiStatus {
        self.manager.close(self.handle).await
    }
}

/// A live bidirectional pair of connections with a packageId filter (§4.6):
/// the long-lived object `dial()`/`accept()`/`resume()` converge on.
pub struct Conduit {
    manager: Arc<ApiManager>,
    handle: raceboat_plugin::RaceHandle,
}

impl Conduit {
    fn new(manager: Arc<ApiManager>, handle: raceboat_plugin::RaceHandle) -> Self {
        Conduit { manager, handle }
    }

    /// Reads the next message, in the order the peer wrote it (§8,
    /// invariant 4). `timeout` of `None` parks indefinitely.
    pub async fn read(&self, timeout: Option<std::time::Duration>) -> Result<Bytes, ApiStatus> {
        self.manager.conduit_read(self.handle, timeout).await
    }

    pub async fn read_str(&self, timeout: Option<std::time::Duration>) -> Result<String, ApiStatus> {
        let bytes = self.read(timeout).await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ApiStatus::InternalError)
    }

    /// Cancels a read parked on this conduit with `CANCELLED`.
    pub async fn cancel_read(&self) {
        self.manager.conduit_cancel_read(self.handle).await
    }

    /// Writes a message. A transport failure mid-stream surfaces here as
    /// `INTERNAL_ERROR` (§7, scenario S6); `close()` still reports `OK`.
    pub async fn write(&self, payload: impl Into<Bytes>) -> ApiStatus {
        self.manager.conduit_write(self.handle, payload.into()).await
    }

    pub async fn write_str(&self, payload: &str) -> ApiStatus {
        self.write(Bytes::copy_from_slice(payload.as_bytes())).await
    }

    pub async fn close(self) -> ApiStatus {
        self.manager.close(self.handle).await
    }
}
