//! Broker configuration.
//!
//! Loaded from an optional YAML file plus `STATION_BROKER__*` environment
//! overrides. Every field has a default so an empty file is a valid config.

use std::time::Duration;

use serde::Deserialize;

use crate::error::BrokerError;
use crate::Core::RegionBacking;
use crate::Station::Buffer::{QueueKind, MAXCLIENTS};
use crate::Station::Service::layout::{CLIENT_NAME_LEN, STATION_NAME_LEN};
use crate::Station::Service::wire::{record_encoded_len, FETCH_REPLY_HEADER_LEN};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "STATION_BROKER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "STATION_BROKER";
/// Environment variable holding the tracing filter for the demo binaries.
pub const LOG_ENV_VAR: &str = "STATION_BROKER_LOG";

/// Main broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Station code, also used to name the region.
    pub station: String,
    /// Where the region lives.
    pub backing: RegionBacking,
    /// Region name prefix; the region is `<prefix><station>`.
    pub region_prefix: String,
    /// Ring sizes per record kind.
    pub queues: QueueSizes,
    /// Output bytes available in each client mailbox.
    pub mailbox_bytes: usize,
    /// Requests serviced per poll iteration.
    pub max_proc: usize,
    /// Longest sleep between poll iterations.
    pub poll_interval_ms: u64,
    /// Client-side wait policy published in the region header.
    pub service: ServicePolicy,
    /// Statically declared clients; these are blocking unless told otherwise.
    pub clients: Vec<ReservedClient>,
    /// Privilege allow-list.
    pub privileges: Vec<PrivilegeGrant>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueueConfig {
    /// Number of slots in the ring.
    pub slots: usize,
    /// Largest record payload a slot can hold.
    pub slot_size: usize,
}

impl QueueConfig {
    pub const fn new(slots: usize, slot_size: usize) -> Self {
        Self { slots, slot_size }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSizes {
    pub data: QueueConfig,
    pub detection: QueueConfig,
    pub calibration: QueueConfig,
    pub timing: QueueConfig,
    pub message: QueueConfig,
    pub blockette: QueueConfig,
}

impl Default for QueueSizes {
    fn default() -> Self {
        Self {
            data: QueueConfig::new(200, 512),
            detection: QueueConfig::new(20, 512),
            calibration: QueueConfig::new(20, 512),
            timing: QueueConfig::new(20, 512),
            message: QueueConfig::new(20, 256),
            blockette: QueueConfig::new(20, 512),
        }
    }
}

impl QueueSizes {
    pub fn get(&self, kind: QueueKind) -> QueueConfig {
        match kind {
            QueueKind::Data => self.data,
            QueueKind::Detection => self.detection,
            QueueKind::Calibration => self.calibration,
            QueueKind::Timing => self.timing,
            QueueKind::Message => self.message,
            QueueKind::Blockette => self.blockette,
        }
    }

    pub fn get_mut(&mut self, kind: QueueKind) -> &mut QueueConfig {
        match kind {
            QueueKind::Data => &mut self.data,
            QueueKind::Detection => &mut self.detection,
            QueueKind::Calibration => &mut self.calibration,
            QueueKind::Timing => &mut self.timing,
            QueueKind::Message => &mut self.message,
            QueueKind::Blockette => &mut self.blockette,
        }
    }
}

/// How long and how often clients wait for the broker.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ServicePolicy {
    /// Hard limit on any single service call.
    pub max_wait_ms: u64,
    /// Poll rate for clients running as the broker's user.
    pub same_user_poll_ms: u64,
    /// Poll rate for clients of other users.
    pub foreign_user_poll_ms: u64,
    /// Minimum spacing of broker liveness probes.
    pub probe_interval_ms: u64,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            max_wait_ms: 30_000,
            same_user_poll_ms: 10,
            foreign_user_poll_ms: 100,
            probe_interval_ms: 5_000,
        }
    }
}

impl ServicePolicy {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReservedClient {
    pub name: String,
    #[serde(default = "default_blocking")]
    pub blocking: bool,
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
}

fn default_blocking() -> bool {
    true
}

fn default_client_timeout() -> u64 {
    3600
}

impl ReservedClient {
    pub fn blocking(name: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            blocking: true,
            timeout_secs: timeout.as_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One allow-list line: a uid and the command bits it may use.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PrivilegeGrant {
    pub uid: u32,
    pub mask: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            station: "STN".to_string(),
            backing: RegionBacking::File,
            region_prefix: "station_broker_".to_string(),
            queues: QueueSizes::default(),
            mailbox_bytes: 64 * 1024,
            max_proc: 4,
            poll_interval_ms: 20,
            service: ServicePolicy::default(),
            clients: Vec::new(),
            privileges: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. File given by `path` (if provided)
    /// 2. File named by `CONFIG_ENV_VAR` (if set)
    /// 3. Environment variables with the `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, BrokerError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder();

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BrokerConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the broker cannot lay out.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.station.is_empty() || self.station.len() > STATION_NAME_LEN {
            return Err(BrokerError::Invalid(format!(
                "station name must be 1..={} bytes, got {:?}",
                STATION_NAME_LEN, self.station
            )));
        }
        for kind in QueueKind::ALL {
            let queue = self.queues.get(kind);
            if queue.slots == 0 || queue.slot_size == 0 {
                return Err(BrokerError::Invalid(format!(
                    "queue {} needs at least one slot of non-zero size",
                    kind.name()
                )));
            }
        }
        if self.clients.len() > MAXCLIENTS {
            return Err(BrokerError::Invalid(format!(
                "{} reserved clients configured, at most {} supported",
                self.clients.len(),
                MAXCLIENTS
            )));
        }
        for client in &self.clients {
            if client.name.is_empty() || client.name.len() > CLIENT_NAME_LEN {
                return Err(BrokerError::Invalid(format!(
                    "client name must be 1..={} bytes, got {:?}",
                    CLIENT_NAME_LEN, client.name
                )));
            }
        }
        if self.max_proc == 0 {
            return Err(BrokerError::Invalid("max_proc must be at least 1".into()));
        }
        if self.mailbox_bytes < 1024 {
            return Err(BrokerError::Invalid(
                "mailbox_bytes must be at least 1024".into(),
            ));
        }
        let largest = QueueKind::ALL
            .iter()
            .map(|&kind| self.queues.get(kind).slot_size)
            .max()
            .unwrap_or(0);
        let needed = FETCH_REPLY_HEADER_LEN + record_encoded_len(largest);
        if self.mailbox_bytes < needed {
            return Err(BrokerError::Invalid(format!(
                "mailbox_bytes {} cannot hold a {}-byte record (needs {})",
                self.mailbox_bytes, largest, needed
            )));
        }
        Ok(())
    }

    /// Name of the region clients attach to.
    pub fn region_name(&self) -> String {
        region_name(&self.region_prefix, &self.station)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Region name for a station under a prefix.
pub fn region_name(prefix: &str, station: &str) -> String {
    format!("{}{}", prefix, station)
}
