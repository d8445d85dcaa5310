//! §4.2: adapts a user-supplied transport plugin into an asynchronous
//! service fronted by a [`Handler`]. Every call returns as soon as it has
//! run (`SdkResponse`); the plugin reports the real outcome later through
//! [`crate::sdk_wrapper::SdkWrapper`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use raceboat_plugin::{
    ApiStatus, ChannelId, ConnectionId, EncPkg, LinkId, LinkType, PluginConfig, RaceHandle,
    SdkResponse, TransportPlugin, NULL_RACE_HANDLE,
};
use tokio::sync::oneshot;

use crate::config::RaceConfig;
use crate::handler::{Handler, JobOutcome, PostedJob};

const LIFECYCLE_QUEUE: &str = "lifecycle";

pub struct PluginWrapper {
    handler: Arc<Handler>,
    plugin: Arc<dyn TransportPlugin>,
    next_post_id: AtomicU64,
    config: RaceConfig,
}

impl PluginWrapper {
    pub fn new(plugin: Arc<dyn TransportPlugin>, config: RaceConfig) -> Arc<Self> {
        let handler = Handler::new("plugin-wrapper");
        handler.register_queue(LIFECYCLE_QUEUE, 10, config.manager_queue_capacity);
        Arc::new(PluginWrapper {
            handler,
            plugin,
            next_post_id: AtomicU64::new(1),
            config,
        })
    }

    fn next_post_id(&self) -> u64 {
        self.next_post_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connection_queue_name(connection_id: &ConnectionId) -> String {
        format!("conn:{}", connection_id.as_str())
    }

    /// Opens the per-connection back-pressure queue (§4.2): called when the
    /// manager observes `onConnectionStatusChanged(OPEN)`.
    pub fn open_connection_queue(&self, connection_id: &ConnectionId) {
        self.handler.register_queue(
            &Self::connection_queue_name(connection_id),
            0,
            self.config.connection_queue_capacity,
        );
    }

    /// Closes the per-connection queue, cancelling anything still queued.
    pub fn close_connection_queue(&self, connection_id: &ConnectionId) {
        let cancelled = self.handler.close_queue(&Self::connection_queue_name(connection_id));
        for job in cancelled {
            tokio::spawn(job(JobOutcome::Cancelled));
        }
    }

    async fn call<F, Fut>(&self, queue: &str, timeout: Option<Duration>, f: F) -> SdkResponse
    where
        F: FnOnce(Arc<dyn TransportPlugin>) -> Fut + Send + 'static,
        Fut: Future<Output = SdkResponse> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let plugin = self.plugin.clone();
        let post_id = self.next_post_id();
        let job: PostedJob = Box::new(move |outcome| {
            Box::pin(async move {
                let response = match outcome {
                    JobOutcome::Run => f(plugin).await,
                    JobOutcome::TimedOut => SdkResponse::error(ApiStatus::Timeout, NULL_RACE_HANDLE),
                    JobOutcome::Cancelled => SdkResponse::error(ApiStatus::Cancelled, NULL_RACE_HANDLE),
                };
                let _ = tx.send(response);
            })
        });
        if self.handler.post(queue, post_id, timeout, job).is_err() {
            return SdkResponse::error(ApiStatus::InternalError, NULL_RACE_HANDLE);
        }
        rx.await
            .unwrap_or_else(|_| SdkResponse::error(ApiStatus::InternalError, NULL_RACE_HANDLE))
    }

    pub async fn init(&self, handle: RaceHandle, config: PluginConfig) -> SdkResponse {
        self.call(LIFECYCLE_QUEUE, None, move |p| async move { p.init(handle, config).await })
            .await
    }

    pub async fn shutdown(&self, handle: RaceHandle) -> SdkResponse {
        self.call(LIFECYCLE_QUEUE, None, move |p| async move { p.shutdown(handle).await })
            .await
    }

    pub async fn activate_channel(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        role: String,
    ) -> SdkResponse {
        self.call(LIFECYCLE_QUEUE, None, move |p| async move {
            p.activate_channel(handle, channel_gid, role).await
        })
        .await
    }

    pub async fn deactivate_channel(&self, handle: RaceHandle, channel_gid: ChannelId) -> SdkResponse {
        self.call(LIFECYCLE_QUEUE, None, move |p| async move {
            p.deactivate_channel(handle, channel_gid).await
        })
        .await
    }

    pub async fn create_link(&self, handle: RaceHandle, channel_gid: ChannelId) -> SdkResponse {
        self.call(LIFECYCLE_QUEUE, None, move |p| async move {
            p.create_link(handle, channel_gid).await
        })
        .await
    }

    pub async fn create_link_from_address(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        link_address: String,
    ) -> SdkResponse {
        self.call(LIFECYCLE_QUEUE, None, move |p| async move {
            p.create_link_from_address(handle, channel_gid, link_address).await
        })
        .await
    }

    pub async fn load_link_address(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        link_address: String,
    ) -> SdkResponse {
        self.call(LIFECYCLE_QUEUE, None, move |p| async move {
            p.load_link_address(handle, channel_gid, link_address).await
        })
        .await
    }

    pub async fn load_link_addresses(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        link_addresses: Vec<String>,
    ) -> SdkResponse {
        self.call(LIFECYCLE_QUEUE, None, move |p| async move {
            p.load_link_addresses(handle, channel_gid, link_addresses).await
        })
        .await
    }

    pub async fn destroy_link(&self, handle: RaceHandle, link_id: LinkId) -> SdkResponse {
        self.call(LIFECYCLE_QUEUE, None, move |p| async move {
            p.destroy_link(handle, link_id).await
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn open_connection(
        &self,
        handle: RaceHandle,
        link_type: LinkType,
        link_id: LinkId,
        link_hints: String,
        priority: i32,
        send_timeout_ms: Option<u64>,
        timeout_ms: Option<u64>,
    ) -> SdkResponse {
        let timeout = timeout_ms.map(Duration::from_millis);
        self.call(LIFECYCLE_QUEUE, timeout, move |p| async move {
            p.open_connection(
                handle,
                link_type,
                link_id,
                link_hints,
                priority,
                send_timeout_ms,
                timeout_ms,
            )
            .await
        })
        .await
    }

    pub async fn close_connection(
        &self,
        handle: RaceHandle,
        connection_id: ConnectionId,
        timeout_ms: Option<u64>,
    ) -> SdkResponse {
        let queue = Self::connection_queue_name(&connection_id);
        let timeout = timeout_ms.map(Duration::from_millis);
        self.call(&queue, timeout, move |p| async move {
            p.close_connection(handle, connection_id, timeout_ms).await
        })
        .await
    }

    pub async fn send_package(
        &self,
        handle: RaceHandle,
        connection_id: ConnectionId,
        pkg: EncPkg,
        timeout_ms: Option<u64>,
        batch_id: u64,
    ) -> SdkResponse {
        let queue = Self::connection_queue_name(&connection_id);
        let timeout = timeout_ms.map(Duration::from_millis);
        self.call(&queue, timeout, move |p| async move {
            p.send_package(handle, connection_id, pkg, timeout_ms, batch_id).await
        })
        .await
    }

    pub async fn flush_channel(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        batch_id: u64,
        timeout_ms: Option<u64>,
    ) -> SdkResponse {
        let timeout = timeout_ms.map(Duration::from_millis);
        self.call(LIFECYCLE_QUEUE, timeout, move |p| async move {
            p.flush_channel(handle, channel_gid, batch_id, timeout_ms).await
        })
        .await
    }

    pub async fn on_user_input_received(
        &self,
        handle: RaceHandle,
        answered: bool,
        response: String,
        timeout_ms: Option<u64>,
    ) -> SdkResponse {
        self.call(LIFECYCLE_QUEUE, None, move |p| async move {
            p.on_user_input_received(handle, answered, response, timeout_ms).await
        })
        .await
    }

    pub async fn stop(&self) {
        self.handler.stop().await;
    }
}
