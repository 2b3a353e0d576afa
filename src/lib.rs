#![doc = include_str!("../README.md")]

/// Named-topic publish/subscribe for in-process consumers
pub mod events;
/// SSDP wire format: HTTP/1.1 shaped framing over UDP and the typed
/// messages carried in it
pub mod message;
/// Map of every known service, local and remote, keyed by USN
pub mod registry;
mod scheduler;
/// The protocol peer: dispatch, advertisement, search handling
pub mod server;
/// UDP multicast endpoint on 239.255.255.250:1900
pub mod transport;

pub use events::{Event, EventBus, SubscriptionId};
pub use registry::{Manifestation, ServiceRecord};
pub use server::{Registration, SsdpConfig, SsdpServer};
