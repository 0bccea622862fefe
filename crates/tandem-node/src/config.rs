//! Node configuration.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use tandem_types::ParticipantId;
use tandem_viewservice::ClientOptions;

/// Failure-detection and reconfiguration timing.
///
/// The defaults are tuned together: a follower declares the primary dead
/// after `missed_heartbeat_limit` heartbeat intervals, and the primary
/// change guard covers that detection plus a reaction margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Interval between follower heartbeats.
    pub heartbeat_interval: Duration,
    /// Consecutive unacknowledged heartbeats before the primary is declared failed.
    pub missed_heartbeat_limit: u32,
    /// Primary heartbeat-check window.
    pub check_interval: Duration,
    /// Delay before the first heartbeat check after a view change.
    pub check_grace: Duration,
    /// Wait before reconnecting when only the backup changed.
    pub backup_change_guard: Duration,
    /// Wait before reconnecting when the primary changed.
    pub primary_change_guard: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub connect_timeout: Duration,
    /// How long a new backup waits for `InitBackupReply`.
    pub init_backup_timeout: Duration,
    /// Bound on a single backup sync.
    pub sync_timeout: Duration,
    /// Poll interval while a backup waits for a newer view.
    pub view_poll_interval: Duration,
    /// Per-attempt wait for a view-service reply.
    pub view_request_timeout: Duration,
    pub view_request_attempts: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            missed_heartbeat_limit: 2,
            check_interval: Duration::from_millis(600),
            check_grace: Duration::from_millis(1500),
            backup_change_guard: Duration::from_millis(500),
            primary_change_guard: Duration::from_millis(1200),
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(1000),
            init_backup_timeout: Duration::from_millis(2000),
            sync_timeout: Duration::from_millis(1200),
            view_poll_interval: Duration::from_millis(50),
            view_request_timeout: Duration::from_millis(500),
            view_request_attempts: 6,
        }
    }
}

impl Timing {
    /// Resend policy for this node's view-service client.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: self.view_request_timeout,
            request_attempts: self.view_request_attempts,
        }
    }
}

/// Sizing for the participant worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Capacity of each worker's bounded inbox.
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: thread::available_parallelism()
                .map_or(2, std::num::NonZero::get)
                .min(8),
            queue_capacity: 1024,
        }
    }
}

/// Replication node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This participant's name.
    pub name: ParticipantId,
    /// Address the listener binds to while this node could become primary.
    pub listen_address: SocketAddr,
    /// Address advertised to the view service. Defaults to the bound
    /// listener address.
    pub advertise_address: Option<SocketAddr>,
    pub view_service_address: SocketAddr,
    pub timing: Timing,
    pub workers: WorkerConfig,
    /// Remove participants silent for two heartbeat-check windows in a row.
    pub evict_silent_participants: bool,
}

impl NodeConfig {
    pub fn new(
        name: ParticipantId,
        listen_address: SocketAddr,
        view_service_address: SocketAddr,
    ) -> Self {
        Self {
            name,
            listen_address,
            advertise_address: None,
            view_service_address,
            timing: Timing::default(),
            workers: WorkerConfig::default(),
            evict_silent_participants: true,
        }
    }

    pub fn with_advertise_address(mut self, addr: SocketAddr) -> Self {
        self.advertise_address = Some(addr);
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_workers(mut self, workers: WorkerConfig) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_eviction(mut self, enabled: bool) -> Self {
        self.evict_silent_participants = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timing_matches_protocol_constants() {
        let timing = Timing::default();
        assert_eq!(timing.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(timing.missed_heartbeat_limit, 2);
        assert_eq!(timing.check_interval, Duration::from_millis(600));
        assert_eq!(timing.check_grace, Duration::from_millis(1500));
        assert_eq!(timing.backup_change_guard, Duration::from_millis(500));
        assert_eq!(timing.primary_change_guard, Duration::from_millis(1200));
        assert_eq!(timing.sync_timeout, Duration::from_millis(1200));
    }

    #[test]
    fn primary_guard_covers_detection() {
        let timing = Timing::default();
        let detection = timing.heartbeat_interval * timing.missed_heartbeat_limit;
        assert!(timing.primary_change_guard > detection);
        assert!(timing.check_grace > timing.primary_change_guard);
    }

    #[test]
    fn builder_overrides() {
        let config = NodeConfig::new(
            ParticipantId::new("a").unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
        )
        .with_eviction(false)
        .with_workers(WorkerConfig {
            worker_count: 1,
            queue_capacity: 4,
        });

        assert!(!config.evict_silent_participants);
        assert_eq!(config.workers.worker_count, 1);
        assert!(config.advertise_address.is_none());
        assert!(WorkerConfig::default().worker_count >= 1);
    }
}
