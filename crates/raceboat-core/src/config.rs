use std::time::Duration;

/// Tunables for a [`crate::manager::ApiManager`] instance (§10.4). There is no
/// file or environment parsing here: the embedding application builds this
/// programmatically, the same way it supplies plugins.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Depth of the manager's own work queue before `post` starts logging
    /// back-pressure warnings (§4.1). Posts are never rejected for depth
    /// alone; this only affects when we start warning.
    pub manager_queue_capacity: usize,
    /// Depth of each per-connection send queue a `PluginWrapper` opens
    /// (§4.2).
    pub connection_queue_capacity: usize,
    /// Default timeout for `sendPackage` when the caller does not specify
    /// one.
    pub default_send_timeout: Duration,
    /// Default timeout for connection open/close when the caller does not
    /// specify one.
    pub default_connection_timeout: Duration,
    /// How long an unassociated package (§4.8, edge case) is kept before
    /// being dropped.
    pub unassociated_package_ttl: Duration,
    /// Maximum number of unassociated packages queued per connection id
    /// before the oldest is evicted.
    pub unassociated_package_queue_depth: usize,
}

impl Default for RaceConfig {
    fn default() -> Self {
        RaceConfig {
            manager_queue_capacity: 256,
            connection_queue_capacity: 16,
            default_send_timeout: Duration::from_secs(30),
            default_connection_timeout: Duration::from_secs(30),
            unassociated_package_ttl: Duration::from_secs(60),
            unassociated_package_queue_depth: 32,
        }
    }
}

impl RaceConfig {
    /// Rejects configurations that would make the manager unable to make
    /// progress at all.
    pub fn validate(&self) -> Result<(), String> {
        if self.manager_queue_capacity == 0 {
            return Err("manager_queue_capacity must be > 0".to_string());
        }
        if self.connection_queue_capacity == 0 {
            return Err("connection_queue_capacity must be > 0".to_string());
        }
        if self.unassociated_package_queue_depth == 0 {
            return Err("unassociated_package_queue_depth must be > 0".to_string());
        }
        Ok(())
    }
}
