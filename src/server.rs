use std::{
    net::{Ipv4Addr, SocketAddr},
    str,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    events::{topic, Event, EventBus},
    message::{
        http_date, Alive, ByeBye, NotificationSubType, Packet, PacketKind, Search, SsdpMessage,
        ST_ALL,
    },
    registry::{Manifestation, Registry, ServiceRecord},
    scheduler::Scheduler,
    transport::{Transport, UdpTransport, SSDP_ADDR, SSDP_IP_ADDR, SSDP_PORT},
};

/// How often every local service is re-advertised.
const NOTIFY_INTERVAL: Duration = Duration::from_secs(777);
/// How often remote records are checked against their advertised lifetime.
const EXPIRY_INTERVAL: Duration = Duration::from_secs(333);
/// Advertised lifetime when a registration does not pick one.
const DEFAULT_MAX_AGE: u64 = 1800;
/// Ceiling on the `MX` value a searcher may ask for.
const MX_CEILING: u64 = 5;
/// Every alive notification goes out this many times back to back;
/// receivers must tolerate the duplicates.
const NOTIFY_REPEAT: usize = 2;

const DEFAULT_SERVER_ID: &str = concat!("ssdp/", env!("CARGO_PKG_VERSION"), " UPnP/1.0");

#[derive(Debug, Clone)]
pub struct SsdpConfig {
    /// Interface address to join the multicast group on; `None` joins on
    /// all interfaces.
    pub interface: Option<Ipv4Addr>,
    /// Value of the `SERVER` header on advertisements and search responses.
    pub server_id: String,
    /// Multicast TTL of outgoing datagrams.
    pub ttl: Option<u32>,
    /// Seed for the search response delay. Fixing it makes response timing
    /// reproducible.
    pub rng_seed: Option<u64>,
}

impl Default for SsdpConfig {
    fn default() -> Self {
        Self {
            interface: None,
            server_id: DEFAULT_SERVER_ID.to_owned(),
            ttl: None,
            rng_seed: None,
        }
    }
}

/// A local service to advertise.
#[derive(Debug, Clone)]
pub struct Registration {
    usn: String,
    st: String,
    location: String,
    server: Option<String>,
    max_age: u64,
    silent: bool,
}

impl Registration {
    pub fn new(
        usn: impl Into<String>,
        st: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            usn: usn.into(),
            st: st.into(),
            location: location.into(),
            server: None,
            max_age: DEFAULT_MAX_AGE,
            silent: false,
        }
    }

    /// Override the configured `SERVER` banner for this service.
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn max_age(mut self, max_age: u64) -> Self {
        self.max_age = max_age;
        self
    }

    /// Silent services are registered but never advertised and do not
    /// answer `ssdp:all` searches; only a search for their exact type
    /// reaches them.
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

/// The SSDP protocol peer.
///
/// Advertises locally registered services, learns about remote peers from
/// their announcements, and answers discovery searches. All protocol work
/// happens on the task driving [run]; the only concurrency is the randomly
/// delayed unicast search responses.
///
/// [run]: SsdpServer::run
pub struct SsdpServer {
    registry: Registry,
    events: Arc<EventBus>,
    scheduler: Scheduler,
    transport: Option<Arc<dyn Transport>>,
    socket: Option<Arc<UdpTransport>>,
    server_id: String,
    rng: Mutex<StdRng>,
}

impl SsdpServer {
    /// Join the SSDP multicast group and build a peer ready to [run].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [run]: SsdpServer::run
    pub fn bind(config: SsdpConfig, events: Arc<EventBus>) -> anyhow::Result<Self> {
        let socket = Arc::new(
            UdpTransport::bind(config.interface, config.ttl)
                .context("failed to bind ssdp socket")?,
        );
        let transport: Arc<dyn Transport> = socket.clone();
        Ok(Self::new(config, events, Some(transport), Some(socket)))
    }

    /// Build a peer with no network endpoint.
    ///
    /// Dispatch can be exercised in memory through [handle_datagram];
    /// outbound datagrams are dropped.
    ///
    /// [handle_datagram]: SsdpServer::handle_datagram
    pub fn detached(config: SsdpConfig, events: Arc<EventBus>) -> Self {
        Self::new(config, events, None, None)
    }

    #[cfg(test)]
    pub(crate) fn with_transport(
        config: SsdpConfig,
        events: Arc<EventBus>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::new(config, events, Some(transport), None)
    }

    fn new(
        config: SsdpConfig,
        events: Arc<EventBus>,
        transport: Option<Arc<dyn Transport>>,
        socket: Option<Arc<UdpTransport>>,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            registry: Registry::new(events.clone()),
            events,
            scheduler: Scheduler::new(),
            transport,
            socket,
            server_id: config.server_id,
            rng: Mutex::new(rng),
        }
    }

    /// Drive the peer until `cancellation_token` fires, then say goodbye.
    pub async fn run(&self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        let socket = self
            .socket
            .clone()
            .context("detached ssdp peer cannot join the network")?;
        let mut notify_interval = tokio::time::interval(NOTIFY_INTERVAL);
        let mut expiry_interval = tokio::time::interval(EXPIRY_INTERVAL);
        // consume the immediate tick so both loops start one full period out
        notify_interval.tick().await;
        expiry_interval.tick().await;

        let mut buf = [0; 2048];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((read, sender)) => self.handle_datagram(&buf[..read], sender),
                    Err(e) => tracing::warn!("failed to receive ssdp datagram: {e}"),
                },
                _ = notify_interval.tick() => self.resend_notify(),
                _ = expiry_interval.tick() => self.sweep_expired(),
                _ = cancellation_token.cancelled() => {
                    self.shutdown();
                    return Ok(());
                }
            }
        }
    }

    /// Register a service hosted by this peer and announce it immediately.
    pub fn register(&self, registration: Registration) -> anyhow::Result<()> {
        let Registration {
            usn,
            st,
            location,
            server,
            max_age,
            silent,
        } = registration;
        let record = ServiceRecord {
            usn,
            st,
            location,
            server: server.unwrap_or_else(|| self.server_id.clone()),
            max_age,
            silent,
            manifestation: Manifestation::Local,
            host: None,
            last_seen: Instant::now(),
        };
        self.registry.register(record.clone())?;
        self.do_notify(&record);
        Ok(())
    }

    /// Remove a service. Local services say goodbye on the way out.
    /// Unknown USNs are a no-op.
    pub fn unregister(&self, usn: &str) -> Option<ServiceRecord> {
        if let Some(record) = self.registry.get(usn) {
            if record.manifestation == Manifestation::Local {
                self.do_byebye(&record);
            }
        }
        self.registry.unregister(usn)
    }

    pub fn is_known(&self, usn: &str) -> bool {
        self.registry.is_known(usn)
    }

    pub fn snapshot(&self) -> Vec<ServiceRecord> {
        self.registry.snapshot()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Cancel pending delayed responses and say goodbye for every local
    /// service. Send failures are logged, never raised.
    pub fn shutdown(&self) {
        self.scheduler.stop_all();
        for record in self.registry.snapshot() {
            if record.manifestation == Manifestation::Local {
                self.do_byebye(&record);
            }
        }
    }

    /// Dispatch one inbound datagram.
    ///
    /// Malformed traffic is logged and dropped; it never unwinds into the
    /// caller. The raw bytes are republished on
    /// [topic::DATAGRAM_RECEIVED] whatever the outcome.
    pub fn handle_datagram(&self, data: &[u8], source: SocketAddr) {
        if let Err(e) = self.dispatch(data, source) {
            tracing::warn!(%source, "failed to handle ssdp datagram: {e:#}");
        }
        self.events.publish(
            topic::DATAGRAM_RECEIVED,
            &Event::DatagramReceived {
                data: data.to_vec(),
                host: source.ip(),
                port: source.port(),
            },
        );
    }

    fn dispatch(&self, data: &[u8], source: SocketAddr) -> anyhow::Result<()> {
        let payload = str::from_utf8(data).context("construct string from bytes")?;
        let packet = Packet::parse(payload)?;
        tracing::debug!("ssdp {:?} from {source}", packet.kind);
        match SsdpMessage::from_packet(&packet)? {
            SsdpMessage::Alive(alive) => self.handle_alive(alive, source),
            SsdpMessage::ByeBye(byebye) => self.handle_byebye(byebye, source),
            SsdpMessage::Search(search) => self.handle_search(search, source),
            SsdpMessage::Response(_) => anyhow::bail!("unsolicited search response"),
        }
    }

    fn handle_alive(&self, alive: Alive, source: SocketAddr) -> anyhow::Result<()> {
        tracing::info!("notification from {source} for {}", alive.nt);
        if !self.registry.touch(&alive.usn) {
            self.registry.register(ServiceRecord {
                usn: alive.usn.clone(),
                st: alive.nt,
                location: alive.location,
                server: alive.server,
                max_age: alive.max_age,
                silent: false,
                manifestation: Manifestation::Remote,
                host: Some(source.ip()),
                last_seen: Instant::now(),
            })?;
        }
        self.events.publish(
            topic::LOG,
            &Event::Log {
                source: source.ip(),
                message: format!("Notify ssdp:alive for {}", alive.usn),
            },
        );
        Ok(())
    }

    fn handle_byebye(&self, byebye: ByeBye, source: SocketAddr) -> anyhow::Result<()> {
        self.registry.unregister(&byebye.usn);
        self.events.publish(
            topic::LOG,
            &Event::Log {
                source: source.ip(),
                message: format!("Notify ssdp:byebye for {}", byebye.usn),
            },
        );
        Ok(())
    }

    fn handle_search(&self, search: Search, source: SocketAddr) -> anyhow::Result<()> {
        tracing::info!("discovery request from {source} for {}", search.st);
        self.events.publish(
            topic::LOG,
            &Event::Log {
                source: source.ip(),
                message: format!("M-Search for {}", search.st),
            },
        );
        for record in self.registry.snapshot() {
            if record.manifestation != Manifestation::Local {
                continue;
            }
            if search.st == ST_ALL && record.silent {
                continue;
            }
            if record.st == search.st || search.st == ST_ALL {
                let payload = search_response(&record).to_bytes();
                let delay = response_delay(&mut self.rng.lock().expect("rng lock"), search.mx);
                let transport = self.transport.clone();
                let usn = record.usn.clone();
                self.scheduler
                    .schedule_after(Duration::from_secs(delay), move || {
                        tracing::info!(
                            "sending discovery response delayed by {delay}s for {usn} to {source}"
                        );
                        transmit(&transport, &payload, source);
                    });
            }
        }
        Ok(())
    }

    /// Multicast an alive notification for a local service.
    fn do_notify(&self, record: &ServiceRecord) {
        if record.silent {
            return;
        }
        tracing::info!("sending alive notification for {}", record.usn);
        let payload = notify_packet(record, NotificationSubType::Alive).to_bytes();
        for _ in 0..NOTIFY_REPEAT {
            self.send(&payload, SSDP_ADDR);
        }
    }

    /// Multicast a byebye notification for a local service.
    fn do_byebye(&self, record: &ServiceRecord) {
        tracing::info!("sending byebye notification for {}", record.usn);
        let payload = notify_packet(record, NotificationSubType::ByeBye).to_bytes();
        self.send(&payload, SSDP_ADDR);
    }

    pub(crate) fn resend_notify(&self) {
        for record in self.registry.snapshot() {
            if record.manifestation == Manifestation::Local {
                self.do_notify(&record);
            }
        }
    }

    /// Drop remote records whose advertisements have gone stale.
    pub(crate) fn sweep_expired(&self) {
        for record in self.registry.snapshot() {
            if record.is_expired() {
                tracing::debug!("expiring {}", record.usn);
                self.registry.unregister(&record.usn);
            }
        }
    }

    fn send(&self, payload: &[u8], target: SocketAddr) {
        transmit(&self.transport, payload, target);
    }
}

fn transmit(transport: &Option<Arc<dyn Transport>>, payload: &[u8], target: SocketAddr) {
    match transport {
        Some(transport) => {
            if let Err(e) = transport.send(payload, target) {
                tracing::info!("failure sending ssdp datagram to {target}: {e}");
            }
        }
        None => tracing::trace!("dropping ssdp datagram to {target}: peer is detached"),
    }
}

fn response_delay(rng: &mut StdRng, mx: u64) -> u64 {
    rng.random_range(0..=mx.min(MX_CEILING))
}

fn notify_packet(record: &ServiceRecord, nts: NotificationSubType) -> Packet {
    Packet::new(PacketKind::Notify)
        .header("host", format!("{SSDP_IP_ADDR}:{SSDP_PORT}"))
        .header("nts", nts.to_string())
        .header("nt", record.st.clone())
        .header("usn", record.usn.clone())
        .header("location", record.location.clone())
        .header("server", record.server.clone())
        .header("cache-control", format!("max-age={}", record.max_age))
        .header("ext", "")
}

fn search_response(record: &ServiceRecord) -> Packet {
    Packet::new(PacketKind::Response)
        .header("st", record.st.clone())
        .header("usn", record.usn.clone())
        .header("location", record.location.clone())
        .header("server", record.server.clone())
        .header("cache-control", format!("max-age={}", record.max_age))
        .header("ext", "")
        .header("date", http_date())
}
