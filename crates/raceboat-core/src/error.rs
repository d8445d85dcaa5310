use raceboat_plugin::ApiStatus;

/// Internal error type for `raceboat-core`. Every public entry point on
/// [`crate::manager::ApiManager`] collapses this down to an [`ApiStatus`] before
/// it reaches the application or a plugin — callers across that boundary
/// only ever see the stable status enum (§6).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("handle {0} is not known to the manager")]
    UnknownHandle(u64),

    #[error("channel {0} has not been activated")]
    ChannelNotActivated(String),

    #[error("channel {0} is in status {1:?}, which does not accept new links")]
    ChannelUnavailable(String, raceboat_plugin::ChannelStatus),

    #[error("link {0} is not known to the manager")]
    UnknownLink(String),

    #[error("connection {0} is not known to the manager")]
    UnknownConnection(String),

    #[error("{context} deadline of {timeout_ms}ms elapsed before the operation completed")]
    TimedOut { context: &'static str, timeout_ms: u64 },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("handshake envelope malformed: {0}")]
    MalformedEnvelope(String),

    #[error("handler queue error: {0}")]
    Handler(#[from] crate::handler::HandlerError),

    #[error("plugin reported an error for handle {0}")]
    PluginError(u64),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("connection bring-up failed with {0}")]
    ConnectionFailed(ApiStatus),
}

impl CoreError {
    /// Maps an internal failure onto the stable status surface (§6, §9).
    pub fn to_api_status(&self) -> ApiStatus {
        match self {
            CoreError::UnknownHandle(_) => ApiStatus::InvalidArgument,
            CoreError::ChannelNotActivated(_) => ApiStatus::ChannelInvalid,
            CoreError::ChannelUnavailable(_, _) => ApiStatus::ChannelInvalid,
            CoreError::UnknownLink(_) => ApiStatus::InvalidArgument,
            CoreError::UnknownConnection(_) => ApiStatus::InvalidArgument,
            CoreError::TimedOut { .. } => ApiStatus::Timeout,
            CoreError::Cancelled => ApiStatus::Cancelled,
            CoreError::InvalidArgument(_) => ApiStatus::InvalidArgument,
            CoreError::MalformedEnvelope(_) => ApiStatus::InvalidArgument,
            CoreError::Handler(_) => ApiStatus::InternalError,
            CoreError::PluginError(_) => ApiStatus::PluginError,
            CoreError::Internal(_) => ApiStatus::InternalError,
            CoreError::ConnectionFailed(status) => *status,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
