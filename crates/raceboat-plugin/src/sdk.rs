use async_trait::async_trait;

use crate::ids::{ChannelId, ConnectionId, LinkId, RaceHandle};
use crate::pkg::EncPkg;
use crate::properties::{ChannelProperties, LinkProperties};
use crate::status::{ApiStatus, ChannelStatus, ConnectionStatus, LinkStatus, PackageStatus};

/// The inbound half of the plugin contract (§6): the plugin's handle back
/// into the core. `raceboat-core`'s `SdkWrapper` implements this; a plugin
/// is handed an `Arc<dyn PluginSdk>` at construction and calls it from
/// whatever thread it likes (the core's registration layer serializes
/// deliveries onto the manager's handler, §4.3).
///
/// Every method here is invoked from the plugin's own scheduling, so unlike
/// [`crate::TransportPlugin`] nothing here carries a `timeout` for the call
/// itself: the core is expected to process these quickly and never block on
/// plugin state.
#[async_trait]
pub trait PluginSdk: Send + Sync + 'static {
    async fn on_channel_status_changed(
        &self,
        handle: RaceHandle,
        channel_gid: ChannelId,
        status: ChannelStatus,
        properties: ChannelProperties,
    ) -> ApiStatus;

    async fn on_link_status_changed(
        &self,
        handle: RaceHandle,
        link_id: LinkId,
        status: LinkStatus,
        properties: LinkProperties,
    ) -> ApiStatus;

    async fn on_connection_status_changed(
        &self,
        handle: RaceHandle,
        connection_id: ConnectionId,
        status: ConnectionStatus,
        properties: LinkProperties,
    ) -> ApiStatus;

    async fn on_package_status_changed(&self, handle: RaceHandle, status: PackageStatus)
        -> ApiStatus;

    /// Delivers a raw package that arrived on one or more connections. All
    /// named connections are assumed to have received byte-identical
    /// packages (fan-in from a shared underlying link).
    async fn receive_enc_pkg(&self, pkg: EncPkg, connection_ids: Vec<ConnectionId>) -> ApiStatus;

    async fn update_link_properties(
        &self,
        link_id: LinkId,
        properties: LinkProperties,
    ) -> ApiStatus;

    /// Ask the core to mint a fresh connection id for a link the plugin
    /// controls. Unlike the other methods this returns a value rather than
    /// a status: there is nothing to fail.
    fn generate_connection_id(&self, link_id: &LinkId) -> ConnectionId;

    /// Ask the core to mint a fresh link id for a channel.
    fn generate_link_id(&self, channel_gid: &ChannelId) -> LinkId;

    async fn request_plugin_user_input(
        &self,
        key: String,
        prompt: String,
        cache: bool,
    ) -> ApiStatus;

    async fn request_common_user_input(&self, key: String) -> ApiStatus;

    /// Lift back-pressure on the per-connection send queue the plugin
    /// wrapper opened for `connection_id` (§4.2).
    async fn unblock_queue(&self, connection_id: ConnectionId) -> ApiStatus;
}
