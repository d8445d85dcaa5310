//! §4.3: the plugin's view back into the core. Each method tags the call
//! with the owning plugin's id (so per-plugin isolation is preserved) and
//! forwards into the manager.

use std::sync::Arc;

use async_trait::async_trait;
use raceboat_plugin::{
    ApiStatus, ChannelId, ChannelProperties, ChannelStatus, ConnectionId, ConnectionStatus,
    EncPkg, LinkId, LinkProperties, LinkStatus, PackageStatus, PluginSdk, RaceHandle,
};

use crate::manager::ApiManager;

pub struct SdkWrapper {
    manager: Arc<ApiManager>,
    plugin_id: String,
}

impl SdkWrapper {
    pub fn new(manager: Arc<ApiManager>, plugin_id: impl Into<String>) -> Arc<Self> {
        Arc::new(SdkWrapper {
            manager,
            plugin_id: plugin_id.into(),
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }
}

#[async_trait]
impl PluginSdk for SdkWrapper {
    async fn on_channel_status_changed(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        status: ChannelStatus,
        properties: ChannelProperties,
    ) -> ApiStatus {
        self.manager
            .on_channel_status_changed(handle, channel_gid, status, properties)
            .await
    }

    async fn on_link_status_changed(
        &self,
        handle: RaceHandle,
        link_id: LinkId,
        status: LinkStatus,
        properties: LinkProperties,
    ) -> ApiStatus {
        self.manager.on_link_status_changed(handle, link_id, status, properties).await
    }

    async fn on_connection_status_changed(
        &self,
        handle: RaceHandle,
        connection_id: ConnectionId,
        status: ConnectionStatus,
        properties: LinkProperties,
    ) -> ApiStatus {
        self.manager
            .on_connection_status_changed(handle, connection_id, status, properties)
            .await
    }

    async fn on_package_status_changed(&self, handle: RaceHandle, status: PackageStatus) -> ApiStatus {
        self.manager.on_package_status_changed(handle, status).await
    }

    async fn receive_enc_pkg(&self, pkg: EncPkg, connection_ids: Vec<ConnectionId>) -> ApiStatus {
        self.manager.receive_enc_pkg(pkg, connection_ids).await
    }

    async fn update_link_properties(&self, link_id: LinkId, properties: LinkProperties) -> ApiStatus {
        self.manager.update_link_properties(link_id, properties).await
    }

    fn generate_connection_id(&self, link_id: &LinkId) -> ConnectionId {
        self.manager.generate_connection_id(link_id)
    }

    fn generate_link_id(&self, channel_gid: &ChannelId) -> LinkId {
        self.manager.generate_link_id(channel_gid)
    }

    async fn request_plugin_user_input(&self, key: String, prompt: String, cache: bool) -> ApiStatus {
        self.manager.request_user_input(&self.plugin_id, key, prompt, cache).await
    }

    async fn request_common_user_input(&self, key: String) -> ApiStatus {
        self.manager.request_common_user_input(&self.plugin_id, key).await
    }

    async fn unblock_queue(&self, connection_id: ConnectionId) -> ApiStatus {
        self.manager.unblock_queue(connection_id).await
    }
}
