mod broker;
mod builder;
mod clients;
mod debug;

pub use broker::Broker;
pub use builder::BrokerBuilder;
pub use clients::{
    ClientSlot, ClientTable, Cursor, DetachReason, Registration, DEFAULT_CLIENT_TIMEOUT,
};

pub mod Buffer {
    pub mod Buffer;
    pub mod Buffer_impl;
    pub mod clientset;
    pub use Buffer::{QueueKind, QueueMask, Ring, Slot, SlotIdx}; // re-export for stable path
    pub use Buffer_impl::RecordStore;
    pub use clientset::{ClientId, ClientSet, MAXCLIENTS};
}

pub mod Structs {
    pub mod Record_Structs;
    pub use Record_Structs::{Record, Selector, SelectorParseError, StreamId}; // re-export for stable path
}

pub mod Service {
    pub mod client;
    pub mod layout;
    pub mod region;
    pub mod wire;
    pub use client::{ClientSession, LinkState, ScanEvent, StationConnection};
    pub use layout::{ClientName, ConnectionId, RegionState};
    pub use region::{Mailbox, RegionParams, ServiceRegion};
}

pub mod Dispatch {
    pub mod commands;
    pub mod device;
    pub mod fetch;
    pub mod handler;
    pub use commands::{Command, InfoKind, PrivilegeMask, PrivilegeTable};
    pub use device::{DeviceLink, NoLink};
    pub use handler::{BrokerState, Caller};
}
