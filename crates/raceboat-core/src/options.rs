use raceboat_plugin::ChannelId;

/// One shared options bag used by every connecting operation (§6): callers
/// fill in only the fields their operation needs.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub send_channel: Option<ChannelId>,
    pub recv_channel: Option<ChannelId>,
    pub send_role: Option<String>,
    pub recv_role: Option<String>,
    pub send_address: Option<String>,
    pub recv_address: Option<String>,
    pub alt_channel: Option<ChannelId>,
    pub timeout_ms: Option<u64>,
    pub multi_channel: bool,
}

impl ConnectionOptions {
    pub fn send_only(channel: impl Into<ChannelId>, role: impl Into<String>, address: impl Into<String>) -> Self {
        ConnectionOptions {
            send_channel: Some(channel.into()),
            send_role: Some(role.into()),
            send_address: Some(address.into()),
            ..Default::default()
        }
    }

    pub fn recv_only(channel: impl Into<ChannelId>, role: impl Into<String>) -> Self {
        ConnectionOptions {
            recv_channel: Some(channel.into()),
            recv_role: Some(role.into()),
            ..Default::default()
        }
    }

    pub fn bidi(channel: impl Into<ChannelId>, role: impl Into<String>) -> Self {
        let channel = channel.into();
        let role = role.into();
        ConnectionOptions {
            send_channel: Some(channel.clone()),
            recv_channel: Some(channel),
            send_role: Some(role.clone()),
            recv_role: Some(role),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.send_address = Some(address.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Addresses and packageId needed to resume a long-lived conduit across a
/// process restart (§4.7).
#[derive(Debug, Clone)]
pub struct ResumeOptions {
    pub send_channel: ChannelId,
    pub recv_channel: ChannelId,
    pub send_address: String,
    pub package_id: Vec<u8>,
    pub timeout_ms: Option<u64>,
}

/// §4.8: the extra channel pair a bootstrap operation negotiates over
/// before handing off to the long-lived conduit.
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub init_send_channel: ChannelId,
    pub init_recv_channel: ChannelId,
    pub final_send_channel: ChannelId,
    pub final_recv_channel: ChannelId,
    pub role: String,
    pub timeout_ms: Option<u64>,
}
