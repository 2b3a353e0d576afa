use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use anyhow::Context;

/// Wildcard search target matching every advertised service.
pub const ST_ALL: &str = "ssdp:all";
/// Search/service target of a root device announcement.
pub const ST_ROOT_DEVICE: &str = "upnp:rootdevice";

/// Header block of an SSDP datagram, keyed by lowercased header name.
///
/// `BTreeMap` keeps serialization order deterministic.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// `NOTIFY * HTTP/1.1`
    Notify,
    /// `M-SEARCH * HTTP/1.1`
    Search,
    /// `HTTP/1.1 200 OK`
    Response,
}

impl PacketKind {
    fn start_line(&self) -> &'static str {
        match self {
            PacketKind::Notify => "NOTIFY * HTTP/1.1",
            PacketKind::Search => "M-SEARCH * HTTP/1.1",
            PacketKind::Response => "HTTP/1.1 200 OK",
        }
    }
}

/// An SSDP datagram in framing form: a start line plus raw headers.
///
/// SSDP messages are HTTP/1.1 shaped but carried over UDP and never have a
/// body; the header block ends at the first blank line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub headers: Headers,
}

impl Packet {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            headers: Headers::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Parse a UDP payload into a packet.
    ///
    /// Header names are lowercased, values are trimmed, lines without a `:`
    /// and empty trailing lines are ignored. Anything after the blank line
    /// is discarded.
    pub fn parse(payload: &str) -> anyhow::Result<Packet> {
        let (header_block, _) = payload
            .split_once("\r\n\r\n")
            .context("no header terminator")?;
        let mut lines = header_block.lines();
        let start_line = lines.next().context("empty datagram")?;
        let kind = match start_line {
            "NOTIFY * HTTP/1.1" => PacketKind::Notify,
            "M-SEARCH * HTTP/1.1" => PacketKind::Search,
            "HTTP/1.1 200 OK" => PacketKind::Response,
            line => anyhow::bail!("unrecognized start line: {line:?}"),
        };
        let headers = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_owned()))
            .collect();
        Ok(Packet { kind, headers })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\r\n", self.kind.start_line())?;
        for (name, value) in &self.headers {
            write!(f, "{}:{}\r\n", name.to_ascii_uppercase(), value)?;
        }
        write!(f, "\r\n")
    }
}

/// Notification subtype. Specifies type of notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationSubType {
    /// Sent when a service joins the network and periodically to reaffirm
    /// its presence.
    Alive,
    /// Sent when a service leaves the network or shuts down.
    ByeBye,
}

impl Display for NotificationSubType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            NotificationSubType::Alive => "alive",
            NotificationSubType::ByeBye => "byebye",
        };
        write!(f, "ssdp:{msg}")
    }
}

impl FromStr for NotificationSubType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ssdp:alive" => Self::Alive,
            "ssdp:byebye" => Self::ByeBye,
            rest => Err(anyhow::anyhow!("unknown notification sub type: {rest}"))?,
        })
    }
}

/// A presence announcement with `NTS: ssdp:alive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alive {
    pub usn: String,
    /// Notification type; the service type being announced.
    pub nt: String,
    /// Url of the device description document.
    pub location: String,
    pub server: String,
    /// Advertisement lifetime in seconds, from `CACHE-CONTROL: max-age=`.
    pub max_age: u64,
}

/// A departure announcement with `NTS: ssdp:byebye`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByeBye {
    pub usn: String,
}

/// A discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    /// Search target; a concrete service type or [ST_ALL].
    pub st: String,
    /// Maximum wait in seconds before a response must be sent. Responders
    /// delay a random duration up to this value to balance load on the
    /// control point.
    pub mx: u64,
}

/// A unicast answer to a discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub st: String,
    pub usn: String,
    pub location: String,
    pub server: String,
    pub max_age: u64,
}

/// An SSDP datagram dispatched into its protocol meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsdpMessage {
    Alive(Alive),
    ByeBye(ByeBye),
    Search(Search),
    Response(SearchResponse),
}

impl SsdpMessage {
    /// Lift a framing-level packet into a typed message, enforcing the
    /// headers each shape requires.
    pub fn from_packet(packet: &Packet) -> anyhow::Result<Self> {
        let header = |name: &str| {
            packet
                .headers
                .get(name)
                .cloned()
                .with_context(|| format!("missing {name}"))
        };
        match packet.kind {
            PacketKind::Notify => {
                let nts: NotificationSubType = header("nts")?.parse()?;
                let usn = header("usn")?;
                match nts {
                    NotificationSubType::Alive => Ok(Self::Alive(Alive {
                        usn,
                        nt: header("nt")?,
                        location: header("location")?,
                        server: header("server")?,
                        max_age: parse_max_age(&header("cache-control")?)?,
                    })),
                    NotificationSubType::ByeBye => Ok(Self::ByeBye(ByeBye { usn })),
                }
            }
            PacketKind::Search => Ok(Self::Search(Search {
                st: header("st")?,
                mx: header("mx")?.parse().context("parse mx seconds")?,
            })),
            PacketKind::Response => Ok(Self::Response(SearchResponse {
                st: header("st")?,
                usn: header("usn")?,
                location: header("location")?,
                server: header("server")?,
                max_age: parse_max_age(&header("cache-control")?)?,
            })),
        }
    }
}

/// Parse a `CACHE-CONTROL` value of the form `max-age=<seconds>`.
pub fn parse_max_age(value: &str) -> anyhow::Result<u64> {
    let (prefix, max_age) = value.split_once('=').context("split cache control")?;
    anyhow::ensure!(prefix.trim() == "max-age");
    max_age.trim().parse().context("parse max-age seconds")
}

/// Current wall-clock time in the RFC 1123 form the `DATE` header wants.
pub fn http_date() -> String {
    let now = time::OffsetDateTime::now_utc();
    let format = time::format_description::parse_borrowed::<2>("[weekday repr:short], [day padding:zero] [month repr:short] [year] [hour]:[minute]:[second] GMT").expect("infallible");
    now.format(&format).expect("infallible")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALIVE: &str = "NOTIFY * HTTP/1.1\r\n\
HOST:239.255.255.250:1900\r\n\
NT:upnp:rootdevice\r\n\
NTS:ssdp:alive\r\n\
USN:uuid:abc::upnp:rootdevice\r\n\
LOCATION:http://10.0.0.2:8000/desc.xml\r\n\
SERVER:Foo/1\r\n\
CACHE-CONTROL:max-age=1800\r\n\r\n";

    #[test]
    fn parse_notify_alive() {
        let packet = Packet::parse(ALIVE).unwrap();
        assert_eq!(packet.kind, PacketKind::Notify);
        assert_eq!(
            packet.headers.get("usn").map(String::as_str),
            Some("uuid:abc::upnp:rootdevice")
        );
        let message = SsdpMessage::from_packet(&packet).unwrap();
        let SsdpMessage::Alive(alive) = message else {
            panic!("expected alive, got {message:?}");
        };
        assert_eq!(alive.nt, "upnp:rootdevice");
        assert_eq!(alive.location, "http://10.0.0.2:8000/desc.xml");
        assert_eq!(alive.server, "Foo/1");
        assert_eq!(alive.max_age, 1800);
    }

    #[test]
    fn parse_search_with_space_and_mixed_case() {
        let payload = "M-SEARCH * HTTP/1.1\r\n\
Host: 239.255.255.250:1900\r\n\
MAN: \"ssdp:discover\"\r\n\
St: ssdp:all\r\n\
mx: 2\r\n\r\n";
        let packet = Packet::parse(payload).unwrap();
        assert_eq!(packet.kind, PacketKind::Search);
        let SsdpMessage::Search(search) = SsdpMessage::from_packet(&packet).unwrap() else {
            panic!("expected search");
        };
        assert_eq!(search.st, "ssdp:all");
        assert_eq!(search.mx, 2);
    }

    #[test]
    fn parse_search_response() {
        let payload = "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL:max-age=1800\r\n\
DATE:Sat, 01 Feb 2026 10:00:00 GMT\r\n\
EXT:\r\n\
LOCATION:http://10.0.0.2:8000/desc.xml\r\n\
SERVER:Foo/1\r\n\
ST:upnp:rootdevice\r\n\
USN:uuid:abc::upnp:rootdevice\r\n\r\n";
        let packet = Packet::parse(payload).unwrap();
        assert_eq!(packet.kind, PacketKind::Response);
        let SsdpMessage::Response(response) = SsdpMessage::from_packet(&packet).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.st, "upnp:rootdevice");
        assert_eq!(response.max_age, 1800);
    }

    #[test]
    fn round_trip_preserves_kind_and_headers() {
        for kind in [PacketKind::Notify, PacketKind::Search, PacketKind::Response] {
            let packet = Packet::new(kind)
                .header("usn", "uuid:abc")
                .header("ext", "")
                .header("cache-control", "max-age=1800");
            let reparsed = Packet::parse(&packet.to_string()).unwrap();
            assert_eq!(reparsed, packet);
        }
    }

    #[test]
    fn serialization_is_deterministic_and_terminated() {
        let packet = Packet::new(PacketKind::Response)
            .header("usn", "uuid:abc")
            .header("st", "upnp:rootdevice")
            .header("ext", "")
            .header("cache-control", "max-age=1800");
        let wire = packet.to_string();
        assert!(wire.ends_with("\r\n\r\n"));
        assert_eq!(
            wire,
            "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL:max-age=1800\r\n\
EXT:\r\n\
ST:upnp:rootdevice\r\n\
USN:uuid:abc\r\n\r\n"
        );
    }

    #[test]
    fn malformed_datagrams_are_errors() {
        assert!(Packet::parse("hello world").is_err());
        // header block never terminates
        assert!(Packet::parse("NOTIFY * HTTP/1.1\r\nUSN:uuid:abc\r\n").is_err());
        assert!(Packet::parse("GET / HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn unknown_nts_is_an_error() {
        let payload = "NOTIFY * HTTP/1.1\r\n\
USN:uuid:abc\r\n\
NTS:ssdp:update\r\n\r\n";
        let packet = Packet::parse(payload).unwrap();
        assert!(SsdpMessage::from_packet(&packet).is_err());
    }

    #[test]
    fn missing_required_header_is_an_error() {
        let payload = "NOTIFY * HTTP/1.1\r\n\
NT:upnp:rootdevice\r\n\
NTS:ssdp:alive\r\n\
USN:uuid:abc::upnp:rootdevice\r\n\
SERVER:Foo/1\r\n\
CACHE-CONTROL:max-age=1800\r\n\r\n";
        let packet = Packet::parse(payload).unwrap();
        let err = SsdpMessage::from_packet(&packet).unwrap_err();
        assert!(err.to_string().contains("location"));
    }

    #[test]
    fn max_age_rejects_other_directives() {
        assert_eq!(parse_max_age("max-age=120").unwrap(), 120);
        assert!(parse_max_age("no-cache").is_err());
        assert!(parse_max_age("s-maxage=120").is_err());
    }
}
