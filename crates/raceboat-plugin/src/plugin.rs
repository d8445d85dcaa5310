use async_trait::async_trait;

use crate::ids::{ChannelId, ConnectionId, LinkId, RaceHandle};
use crate::pkg::EncPkg;
use crate::properties::PluginConfig;
use crate::response::SdkResponse;
use crate::status::LinkType;

/// The outbound half of the plugin contract (§6): calls the core makes into
/// a transport plugin.
///
/// Every method returns immediately with an [`SdkResponse`]; the actual
/// outcome is reported later through the matching [`crate::PluginSdk`]
/// callback tagged with the same handle. A plugin implementation is free to
/// run these on whatever scheduling it likes internally — the core only
/// requires that it eventually call back.
#[async_trait]
pub trait TransportPlugin: Send + Sync + 'static {
    async fn init(&self, handle: RaceHandle, config: PluginConfig) -> SdkResponse;

    async fn shutdown(&self, handle: RaceHandle) -> SdkResponse;

    async fn activate_channel(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        role: String,
    ) -> SdkResponse;

    async fn deactivate_channel(&self, handle: RaceHandle, channel_gid: ChannelId)
        -> SdkResponse;

    async fn create_link(&self, handle: RaceHandle, channel_gid: ChannelId) -> SdkResponse;

    async fn create_link_from_address(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        link_address: String,
    ) -> SdkResponse;

    async fn load_link_address(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        link_address: String,
    ) -> SdkResponse;

    async fn load_link_addresses(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        link_addresses: Vec<String>,
    ) -> SdkResponse;

    async fn destroy_link(&self, handle: RaceHandle, link_id: LinkId) -> SdkResponse;

    #[allow(clippy::too_many_arguments)]
    async fn open_connection(
        &self,
        handle: RaceHandle,
        link_type: LinkType,
        link_id: LinkId,
        link_hints: String,
        priority: i32,
        send_timeout_ms: Option<u64>,
        timeout_ms: Option<u64>,
    ) -> SdkResponse;

    async fn close_connection(
        &self,
        handle: RaceHandle,
        connection_id: ConnectionId,
        timeout_ms: Option<u64>,
    ) -> SdkResponse;

    async fn send_package(
        &self,
        handle: RaceHandle,
        connection_id: ConnectionId,
        pkg: EncPkg,
        timeout_ms: Option<u64>,
        batch_id: u64,
    ) -> SdkResponse;

    async fn flush_channel(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        batch_id: u64,
        timeout_ms: Option<u64>,
    ) -> SdkResponse;

    async fn on_user_input_received(
        &self,
        handle: RaceHandle,
        answered: bool,
        response: String,
        timeout_ms: Option<u64>,
    ) -> SdkResponse;
}
