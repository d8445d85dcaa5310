use crate::ids::RaceHandle;
use crate::status::ApiStatus;

/// Immediate return value of every call into a plugin (§4.2, §6). The call
/// itself is asynchronous; completion is reported later through
/// [`crate::PluginSdk`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdkResponse {
    pub status: ApiStatus,
    /// Fraction of the target work queue currently occupied, in `[0.0, 1.0]`.
    /// Callers can use this to throttle before hitting hard back-pressure.
    pub queue_utilization: f32,
    pub handle: RaceHandle,
}

impl SdkResponse {
    pub fn ok(handle: RaceHandle, queue_utilization: f32) -> Self {
        SdkResponse {
            status: ApiStatus::Ok,
            queue_utilization,
            handle,
        }
    }

    pub fn error(status: ApiStatus, handle: RaceHandle) -> Self {
        SdkResponse {
            status,
            queue_utilization: 0.0,
            handle,
        }
    }
}
