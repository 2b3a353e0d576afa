use std::{
    collections::HashMap,
    net::IpAddr,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crate::registry::ServiceRecord;

/// Topics the protocol core publishes on.
pub mod topic {
    /// A root device appeared on the network. Payload: [Event::NewDevice].
    pub const NEW_DEVICE: &str = "ssdp.new_device";
    /// A root device left the network or expired. Payload: [Event::RemovedDevice].
    pub const REMOVED_DEVICE: &str = "ssdp.removed_device";
    /// Raw traffic, published after every dispatch regardless of outcome.
    pub const DATAGRAM_RECEIVED: &str = "ssdp.datagram_received";
    /// Human-readable protocol activity lines.
    pub const LOG: &str = "ssdp.log";
}

#[derive(Debug, Clone)]
pub enum Event {
    NewDevice {
        device_type: String,
        record: ServiceRecord,
    },
    RemovedDevice {
        device_type: String,
        record: ServiceRecord,
    },
    DatagramReceived {
        data: Vec<u8>,
        host: IpAddr,
        port: u16,
    },
    Log {
        source: IpAddr,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Topic-keyed multicast to in-process subscribers.
///
/// Delivery is synchronous and in subscription order within a topic. The
/// handler list is snapshotted before delivery, so a handler may unsubscribe
/// anything (itself included) mid-publish; the change applies from the next
/// publish on.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.topics
            .lock()
            .expect("event bus lock")
            .entry(topic.to_owned())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns false when the subscription was not present.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self.topics.lock().expect("event bus lock");
        let Some(handlers) = topics.get_mut(topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn publish(&self, topic: &str, event: &Event) {
        let handlers: Vec<Handler> = {
            let topics = self.topics.lock().expect("event bus lock");
            match topics.get(topic) {
                Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            // a misbehaving subscriber must not take the protocol loop down
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(topic, "event handler panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}
