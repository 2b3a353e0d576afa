use std::{collections::HashMap, net::IpAddr, sync::Arc, sync::Mutex, time::Duration};

use tokio::time::Instant;

use crate::{
    events::{topic, Event, EventBus},
    message::ST_ROOT_DEVICE,
};

/// Slack added on top of `max-age` before a remote record is expired, to
/// absorb clock skew and lost re-advertisements.
const EXPIRY_GRACE: Duration = Duration::from_secs(30);

/// Distinguishes services this peer hosts from services it has discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manifestation {
    Local,
    Remote,
}

/// One known service, keyed by its unique service name.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    /// Unique service name; the registry key.
    pub usn: String,
    /// Service type announced in `NT`/`ST`.
    pub st: String,
    /// Url of the device description document.
    pub location: String,
    /// Server banner sent in advertisements.
    pub server: String,
    /// Advertisement lifetime in seconds (`CACHE-CONTROL: max-age=`).
    pub max_age: u64,
    /// Silent records are never advertised and do not answer `ssdp:all`
    /// searches. Only local records can be silent.
    pub silent: bool,
    pub manifestation: Manifestation,
    /// Remote address observed when the record was learned.
    pub host: Option<IpAddr>,
    /// Monotonic timestamp of the most recent confirmation. Only meaningful
    /// for remote records; local records never expire.
    pub last_seen: Instant,
}

impl ServiceRecord {
    pub fn is_expired(&self) -> bool {
        self.manifestation == Manifestation::Remote
            && self.last_seen.elapsed() > Duration::from_secs(self.max_age) + EXPIRY_GRACE
    }
}

/// In-memory map of every service this peer knows about, local and remote.
///
/// All mutations go through one lock; iteration happens over [snapshot]
/// copies so no caller ever holds the lock across protocol work. Device
/// lifecycle events are published with the lock released.
///
/// [snapshot]: Registry::snapshot
#[derive(Debug)]
pub struct Registry {
    events: Arc<EventBus>,
    known: Mutex<HashMap<String, ServiceRecord>>,
}

impl Registry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            events,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a record, replacing any previous record under the same USN and
    /// refreshing its `last_seen`. Publishes [topic::NEW_DEVICE] when a root
    /// device USN is seen for the first time.
    pub fn register(&self, record: ServiceRecord) -> anyhow::Result<()> {
        anyhow::ensure!(
            !(record.silent && record.manifestation == Manifestation::Remote),
            "remote service {} cannot be registered silent",
            record.usn
        );
        tracing::info!("registering {} ({})", record.st, record.location);
        let fresh_root = {
            let mut known = self.known.lock().expect("registry lock");
            let previous = known.insert(record.usn.clone(), record.clone());
            record.st == ST_ROOT_DEVICE && previous.is_none()
        };
        if fresh_root {
            self.events.publish(
                topic::NEW_DEVICE,
                &Event::NewDevice {
                    device_type: record.st.clone(),
                    record,
                },
            );
        }
        Ok(())
    }

    /// Remove a record. Unknown USNs are a no-op. Root devices are announced
    /// on [topic::REMOVED_DEVICE] while the record is still registered.
    pub fn unregister(&self, usn: &str) -> Option<ServiceRecord> {
        let record = self.known.lock().expect("registry lock").get(usn).cloned()?;
        tracing::info!("un-registering {usn}");
        if record.st == ST_ROOT_DEVICE {
            self.events.publish(
                topic::REMOVED_DEVICE,
                &Event::RemovedDevice {
                    device_type: record.st.clone(),
                    record: record.clone(),
                },
            );
        }
        self.known.lock().expect("registry lock").remove(usn)
    }

    /// Refresh `last_seen`. Returns false for unknown USNs.
    pub fn touch(&self, usn: &str) -> bool {
        let mut known = self.known.lock().expect("registry lock");
        match known.get_mut(usn) {
            Some(record) => {
                tracing::debug!("updating last seen for {usn}");
                record.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn is_known(&self, usn: &str) -> bool {
        self.known.lock().expect("registry lock").contains_key(usn)
    }

    pub fn get(&self, usn: &str) -> Option<ServiceRecord> {
        self.known.lock().expect("registry lock").get(usn).cloned()
    }

    /// Defensive copy of every record, for iteration without the lock.
    pub fn snapshot(&self) -> Vec<ServiceRecord> {
        self.known
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(usn: &str, st: &str) -> ServiceRecord {
        ServiceRecord {
            usn: usn.to_owned(),
            st: st.to_owned(),
            location: "http://10.0.0.2:8000/desc.xml".to_owned(),
            server: "Test/1.0 UPnP/1.0".to_owned(),
            max_age: 1800,
            silent: false,
            manifestation: Manifestation::Local,
            host: None,
            last_seen: Instant::now(),
        }
    }

    fn remote(usn: &str, st: &str, max_age: u64) -> ServiceRecord {
        ServiceRecord {
            manifestation: Manifestation::Remote,
            host: Some("10.0.0.2".parse().unwrap()),
            max_age,
            ..local(usn, st)
        }
    }

    fn bus_with_device_log() -> (Arc<EventBus>, Arc<Mutex<Vec<String>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for topic in [topic::NEW_DEVICE, topic::REMOVED_DEVICE] {
            let seen = seen.clone();
            bus.subscribe(topic, move |event| {
                let line = match event {
                    Event::NewDevice { record, .. } => format!("new:{}", record.usn),
                    Event::RemovedDevice { record, .. } => format!("removed:{}", record.usn),
                    _ => return,
                };
                seen.lock().unwrap().push(line);
            });
        }
        (bus, seen)
    }

    #[tokio::test]
    async fn known_follows_register_and_unregister() {
        let registry = Registry::new(Arc::new(EventBus::new()));
        let usn = "uuid:abc::upnp:rootdevice";
        assert!(!registry.is_known(usn));
        registry.register(local(usn, ST_ROOT_DEVICE)).unwrap();
        assert!(registry.is_known(usn));
        assert!(registry.unregister(usn).is_some());
        assert!(!registry.is_known(usn));
        // idempotent no-op
        assert!(registry.unregister(usn).is_none());
    }

    #[tokio::test]
    async fn root_device_events_fire_once_per_usn() {
        let (bus, seen) = bus_with_device_log();
        let registry = Registry::new(bus);
        let usn = "uuid:abc::upnp:rootdevice";
        registry.register(local(usn, ST_ROOT_DEVICE)).unwrap();
        // replace refreshes fields without announcing the device again
        registry.register(local(usn, ST_ROOT_DEVICE)).unwrap();
        registry.unregister(usn);
        assert_eq!(
            *seen.lock().unwrap(),
            [format!("new:{usn}"), format!("removed:{usn}")]
        );
    }

    #[tokio::test]
    async fn non_root_services_are_announced_to_nobody() {
        let (bus, seen) = bus_with_device_log();
        let registry = Registry::new(bus);
        let usn = "uuid:abc::urn:schemas-upnp-org:service:ContentDirectory:1";
        registry
            .register(local(usn, "urn:schemas-upnp-org:service:ContentDirectory:1"))
            .unwrap();
        registry.unregister(usn);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn silent_remote_records_are_rejected() {
        let registry = Registry::new(Arc::new(EventBus::new()));
        let mut record = remote("uuid:abc", "upnp:rootdevice", 1800);
        record.silent = true;
        assert!(registry.register(record).is_err());
        assert!(!registry.is_known("uuid:abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_needs_max_age_plus_grace() {
        let record = remote("uuid:abc", "upnp:rootdevice", 1);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!record.is_expired());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(record.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn local_records_never_expire() {
        let record = local("uuid:abc", ST_ROOT_DEVICE);
        tokio::time::advance(Duration::from_secs(60 * 60 * 24)).await;
        assert!(!record.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_restarts_the_expiry_window() {
        let registry = Registry::new(Arc::new(EventBus::new()));
        registry.register(remote("uuid:abc", "upnp:rootdevice", 1)).unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(registry.touch("uuid:abc"));
        tokio::time::advance(Duration::from_secs(20)).await;
        // 40s since registration but only 20s since the touch
        assert!(!registry.get("uuid:abc").unwrap().is_expired());
        assert!(!registry.touch("uuid:missing"));
    }
}
