//! Network addresses and socket plumbing.

use crate::{Error, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::warn;

/// Target address as carried by SOCKS5 and the tunnel header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// Read `atyp || addr || port` from an async stream (SOCKS5 requests).
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Self, u16)> {
        let mut atyp = [0u8; 1];
        reader.read_exact(&mut atyp).await?;

        match atyp[0] {
            0x01 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let addr = Address::Ipv4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok((addr, port))
            }
            0x03 => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let len = len[0] as usize;
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let domain = String::from_utf8(buf[..len].to_vec())
                    .map_err(|e| Error::protocol(format!("Invalid domain: {}", e)))?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                Ok((Address::Domain(domain), port))
            }
            0x04 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                let addr = Address::Ipv6(Ipv6Addr::from(ip));
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok((addr, port))
            }
            t => Err(Error::protocol(format!("Unknown address type: {}", t))),
        }
    }

    /// Decode `atyp || addr || port` from a byte slice (UDP datagrams and
    /// tunnel headers). Returns the address, port and consumed length.
    pub fn decode(data: &[u8]) -> Result<(Self, u16, usize)> {
        if data.is_empty() {
            return Err(Error::protocol("empty address"));
        }
        match data[0] {
            0x01 => {
                if data.len() < 7 {
                    return Err(Error::protocol("short IPv4 address"));
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ipv4(ip), port, 7))
            }
            0x03 => {
                if data.len() < 2 {
                    return Err(Error::protocol("short domain address"));
                }
                let len = data[1] as usize;
                if data.len() < 2 + len + 2 {
                    return Err(Error::protocol("short domain address"));
                }
                let domain = String::from_utf8(data[2..2 + len].to_vec())
                    .map_err(|e| Error::protocol(format!("Invalid domain: {}", e)))?;
                let port = u16::from_be_bytes([data[2 + len], data[2 + len + 1]]);
                Ok((Address::Domain(domain), port, 2 + len + 2))
            }
            0x04 => {
                if data.len() < 19 {
                    return Err(Error::protocol("short IPv6 address"));
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Address::Ipv6(Ipv6Addr::from(ip)), port, 19))
            }
            t => Err(Error::protocol(format!("Unknown address type: {}", t))),
        }
    }

    /// Encode `atyp || addr || port` for the tunnel wire.
    pub fn to_wire(&self, port: u16) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.wire_len());
        match self {
            Address::Ipv4(ip) => {
                buf.push(0x01);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.push(0x04);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let bytes = domain.as_bytes();
                if bytes.len() > 255 {
                    return Err(Error::address("Domain name too long"));
                }
                buf.push(0x03);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf.extend_from_slice(&port.to_be_bytes());
        Ok(buf)
    }

    /// Write in SOCKS5 wire format.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W, port: u16) -> Result<()> {
        let buf = self.to_wire(port)?;
        writer.write_all(&buf).await?;
        Ok(())
    }

    /// Encoded length on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 1 + 4 + 2,
            Address::Ipv6(_) => 1 + 16 + 2,
            Address::Domain(d) => 1 + 1 + d.len() + 2,
        }
    }

    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }

    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }

    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv4(ip) => format!("{}:{}", ip, port),
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            Address::Domain(d) => format!("{}:{}", d, port),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<String> for Address {
    fn from(host: String) -> Self {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Address::Ipv4(ip);
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            return Address::Ipv6(ip);
        }
        Address::Domain(host)
    }
}

/// Multipath TCP request mode for outbound sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MptcpMode {
    #[default]
    Off,
    /// Create the socket with IPPROTO_MPTCP, falling back to plain TCP.
    Any,
    /// Enable MPTCP through a fixed setsockopt option number (older kernels).
    Fixed(i32),
}

impl TryFrom<&str> for MptcpMode {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "off" | "false" => Ok(MptcpMode::Off),
            "any" | "on" | "true" => Ok(MptcpMode::Any),
            other => other
                .parse::<i32>()
                .map(MptcpMode::Fixed)
                .map_err(|_| Error::config(format!("Invalid mptcp mode: {}", s))),
        }
    }
}

/// Options applied to every outbound connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectOpts {
    pub fast_open: bool,
    pub mptcp: MptcpMode,
    pub interface: Option<String>,
    pub connect_timeout: Duration,
}

/// Cleared process-wide the first time the platform reports that
/// TCP Fast Open is unavailable.
static FAST_OPEN_AVAILABLE: AtomicBool = AtomicBool::new(true);

pub fn fast_open_available() -> bool {
    FAST_OPEN_AVAILABLE.load(Ordering::Relaxed)
}

fn clear_fast_open() {
    if FAST_OPEN_AVAILABLE.swap(false, Ordering::Relaxed) {
        warn!("TCP Fast Open is not supported on this platform, disabled");
    }
}

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

fn new_outbound_socket(addr: SocketAddr, mptcp: MptcpMode) -> Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    #[cfg(target_os = "linux")]
    if matches!(mptcp, MptcpMode::Any) {
        match Socket::new(domain, Type::STREAM, Some(Protocol::MPTCP)) {
            Ok(socket) => return Ok(socket),
            Err(e) => warn!("MPTCP socket unavailable ({}), falling back to TCP", e),
        }
    }

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(target_os = "linux")]
    if let MptcpMode::Fixed(optnum) = mptcp {
        use std::os::fd::AsRawFd;
        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_TCP,
                optnum,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            warn!(
                "MPTCP option {} rejected: {}, continuing with plain TCP",
                optnum,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    if !matches!(mptcp, MptcpMode::Off) {
        warn!("MPTCP requested but not supported on this platform");
    }

    Ok(socket)
}

#[cfg(target_os = "linux")]
fn try_set_fast_open_connect(socket: &Socket) {
    use std::os::fd::AsRawFd;
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_TCP,
            libc::TCP_FASTOPEN_CONNECT,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        clear_fast_open();
    }
}

/// Connect to `addr` with the configured socket options and connect timeout.
pub async fn connect_remote(addr: SocketAddr, opts: &ConnectOpts) -> Result<TcpStream> {
    let socket = new_outbound_socket(addr, opts.mptcp)?;
    socket.set_nonblocking(true)?;

    #[cfg(target_os = "linux")]
    if let Some(ref iface) = opts.interface {
        socket
            .bind_device(Some(iface.as_bytes()))
            .map_err(|e| Error::connection(format!("bind to {}: {}", iface, e)))?;
    }

    if opts.fast_open && fast_open_available() {
        #[cfg(target_os = "linux")]
        try_set_fast_open_connect(&socket);
        #[cfg(not(target_os = "linux"))]
        clear_fast_open();
    }

    let sock = TcpSocket::from_std_stream(socket.into());
    let stream = timeout(opts.connect_timeout, sock.connect(addr))
        .await
        .map_err(|_| Error::timeout(format!("connect to {}", addr)))?
        .map_err(|e| Error::connection(format!("connect to {}: {}", addr, e)))?;

    configure_tcp_stream(&stream);
    Ok(stream)
}

/// Bind the local TCP listener.
pub fn bind_tcp_listener(addr: SocketAddr, reuse_port: bool) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::bind(e.to_string()))?;

    socket
        .set_reuseaddr(true)
        .map_err(|e| Error::bind(e.to_string()))?;
    #[cfg(unix)]
    if reuse_port {
        socket
            .set_reuseport(true)
            .map_err(|e| Error::bind(e.to_string()))?;
    }

    socket
        .bind(addr)
        .map_err(|e| Error::bind(format!("{}: {}", addr, e)))?;
    socket
        .listen(1024)
        .map_err(|e| Error::bind(format!("{}: {}", addr, e)))
}

/// Bind the local UDP relay socket.
pub fn bind_udp_socket(addr: SocketAddr, reuse_port: bool) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::bind(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::bind(e.to_string()))?;
    #[cfg(unix)]
    if reuse_port {
        socket
            .set_reuse_port(true)
            .map_err(|e| Error::bind(e.to_string()))?;
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::bind(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::bind(format!("{}: {}", addr, e)))?;

    UdpSocket::from_std(socket.into()).map_err(|e| Error::bind(e.to_string()))
}
