use crate::status::LinkDirection;

/// Per-channel properties reported on activation (§3).
#[derive(Debug, Clone)]
pub struct ChannelProperties {
    pub roles: Vec<String>,
    pub link_direction: LinkDirection,
    pub bootstrap: bool,
    pub multi_addressable: bool,
}

impl Default for ChannelProperties {
    fn default() -> Self {
        ChannelProperties {
            roles: vec!["default".to_string()],
            link_direction: LinkDirection::Bidi,
            bootstrap: false,
            multi_addressable: false,
        }
    }
}

/// Per-link properties, most importantly the channel-specific opaque
/// `linkAddress` the plugin advertises (§3).
#[derive(Debug, Clone, Default)]
pub struct LinkProperties {
    pub link_address: Option<String>,
}

/// Configuration handed to a plugin's `init`. Deliberately minimal: manifest
/// parsing and filesystem access are external collaborators out of scope
/// for the core (§1).
#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    pub plugin_id: String,
    pub channel_ids: Vec<String>,
}
