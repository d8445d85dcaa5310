/// Stable, wire-observable status returned to the application for every
/// public operation (§6).
///
/// `Timeout` is a deliberate addition over the original C++ source, which
/// conflated timeouts with `InternalError` (§9, open questions). Callers
/// that want the old behavior can match `Timeout | InternalError` together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStatus {
    Invalid,
    Ok,
    Closing,
    ChannelInvalid,
    InvalidArgument,
    PluginError,
    InternalError,
    Cancelled,
    Timeout,
}

impl std::fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApiStatus::Invalid => "INVALID",
            ApiStatus::Ok => "OK",
            ApiStatus::Closing => "CLOSING",
            ApiStatus::ChannelInvalid => "CHANNEL_INVALID",
            ApiStatus::InvalidArgument => "INVALID_ARGUMENT",
            ApiStatus::PluginError => "PLUGIN_ERROR",
            ApiStatus::InternalError => "INTERNAL_ERROR",
            ApiStatus::Cancelled => "CANCELLED",
            ApiStatus::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a channel (§3). Only `Available` permits new links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Undef,
    Starting,
    Available,
    Unavailable,
    Enabled,
    Disabled,
    Failed,
    Unsupported,
}

/// Lifecycle of a link (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Created,
    Loaded,
    Destroyed,
}

/// Lifecycle of a connection (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Opening,
    Open,
    Closed,
    Unavailable,
}

/// Outcome of a `sendPackage` call, reported later via `onPackageStatusChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStatus {
    Sent,
    FailedGeneric,
    FailedTimeout,
    FailedRetransmission,
    Invalid,
}

/// Which direction a connection carries data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Send,
    Recv,
    BiDi,
}

/// Which side of a channel must "create" a link versus "load" an address
/// advertised by the other side (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    CreatorToLoader,
    LoaderToCreator,
    Bidi,
}
