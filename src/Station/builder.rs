use std::time::Duration;

use tracing::info;

use super::Buffer::{QueueKind, RecordStore};
use super::Dispatch::{BrokerState, DeviceLink, NoLink, PrivilegeTable};
use super::Service::layout::RegionState;
use super::Service::{RegionParams, ServiceRegion};
use super::{Broker, ClientTable};
use crate::config::{BrokerConfig, PrivilegeGrant, QueueConfig, ReservedClient};
use crate::error::BrokerError;
use crate::Core::process::{current_pid, current_uid, invocation_code};
use crate::Core::RegionBacking;

pub struct BrokerBuilder {
    config: BrokerConfig,
    link: Box<dyn DeviceLink>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            config: BrokerConfig::default(),
            link: Box::new(NoLink),
        }
    }
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_station(mut self, station: &str) -> Self {
        self.config.station = station.to_string();
        self
    }

    pub fn with_backing(mut self, backing: RegionBacking) -> Self {
        self.config.backing = backing;
        self
    }

    pub fn with_queue(mut self, kind: QueueKind, slots: usize, slot_size: usize) -> Self {
        *self.config.queues.get_mut(kind) = QueueConfig::new(slots, slot_size);
        self
    }

    /// Declare a reserved client that is blocking with the given timeout.
    pub fn with_client(mut self, name: &str, timeout: Duration) -> Self {
        self.config.clients.push(ReservedClient::blocking(name, timeout));
        self
    }

    pub fn with_privilege(mut self, uid: u32, mask: u64) -> Self {
        self.config.privileges.push(PrivilegeGrant { uid, mask });
        self
    }

    pub fn with_mailbox_bytes(mut self, bytes: usize) -> Self {
        self.config.mailbox_bytes = bytes;
        self
    }

    pub fn with_link(mut self, link: Box<dyn DeviceLink>) -> Self {
        self.link = link;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Validate the configuration, create the region and mark it running.
    pub fn build(self) -> Result<Broker, BrokerError> {
        let config = self.config;
        config.validate()?;

        let uid = current_uid();
        let invocation = invocation_code(&config.station);
        let store = RecordStore::from_config(&config.queues);
        let clients = ClientTable::with_reserved(&config.clients)?;
        let privileges = PrivilegeTable::new(uid, &config.privileges);

        let region_name = config.region_name();
        let region = ServiceRegion::create(
            &region_name,
            config.backing,
            &RegionParams {
                station: config.station.clone(),
                invocation,
                broker_pid: current_pid(),
                broker_uid: uid,
                output_capacity: config.mailbox_bytes,
                policy: config.service,
            },
        )?;

        let state = BrokerState::new(store, clients, privileges, invocation).with_link(self.link);
        region.set_state(RegionState::Running);

        info!(
            station = %config.station,
            region = %region_name,
            invocation,
            clients = config.clients.len(),
            "broker started"
        );

        Ok(Broker::new(
            state,
            region,
            config.max_proc,
            config.poll_interval(),
        ))
    }
}
