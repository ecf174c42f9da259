// Module naming follows project convention (Core = OS plumbing, Station = broker engine)
#[allow(non_snake_case)]
pub mod Core;
#[allow(non_snake_case)]
pub mod Station;
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}

pub mod config;
pub mod error;

pub use crate::config::BrokerConfig;
pub use error::{BrokerError, CommandStatus, RecordError, ResultCode};
pub use Station::{Broker, BrokerBuilder};
