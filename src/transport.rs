use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;

pub(crate) const SSDP_IP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub(crate) const SSDP_PORT: u16 = 1900;
pub(crate) const SSDP_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(SSDP_IP_ADDR, SSDP_PORT));
pub const DEFAULT_SSDP_TTL: u32 = 2;

/// Outbound side of the datagram endpoint.
///
/// Sends are non-blocking; failures surface synchronously and callers log
/// and swallow them, a lost datagram never propagates into protocol state.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, payload: &[u8], target: SocketAddr) -> io::Result<()>;
}

/// The real multicast endpoint on UDP port 1900.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind port 1900 with address reuse so multiple peers can coexist on
    /// one host, and join the SSDP group on `interface` (`None` = all
    /// interfaces).
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(interface: Option<Ipv4Addr>, ttl: Option<u32>) -> anyhow::Result<Self> {
        let local_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT);
        let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_ttl(ttl.unwrap_or(DEFAULT_SSDP_TTL))?;
        socket.set_reuse_address(true)?;
        #[cfg(target_os = "linux")]
        socket.set_reuse_port(false)?;
        socket.set_nonblocking(true)?;
        socket.set_multicast_loop_v4(true)?;
        socket.join_multicast_v4(&SSDP_IP_ADDR, &interface.unwrap_or(Ipv4Addr::UNSPECIFIED))?;
        socket.bind(&SocketAddr::V4(local_addr).into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: &[u8], target: SocketAddr) -> io::Result<()> {
        self.socket.try_send_to(payload, target)?;
        Ok(())
    }
}

/// Capturing sink for exercising the engine without a network.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryTransport {
    sent: std::sync::Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

#[cfg(test)]
impl MemoryTransport {
    /// Drain everything sent so far.
    pub fn take(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[cfg(test)]
impl Transport for MemoryTransport {
    fn send(&self, payload: &[u8], target: SocketAddr) -> io::Result<()> {
        self.sent.lock().unwrap().push((payload.to_vec(), target));
        Ok(())
    }
}
