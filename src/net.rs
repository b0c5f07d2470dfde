use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use crate::error::NtpError;
use crate::packet::NTP_PACKET_SIZE;
use crate::timer::DeadlineTimer;

// Receive buffer larger than a packet so oversized datagrams are detected
// instead of silently truncated.
const RECV_BUFFER_SIZE: usize = 512;

static NET_GUARD: Mutex<Weak<NetGuard>> = Mutex::new(Weak::new());

/// Reference-counted handle on the platform socket subsystem.
///
/// The first `acquire()` initialises the stack; further calls share the same
/// guard. It is released when the last handle drops, so holding a handle for
/// the duration of an exchange keeps the stack alive while I/O is in flight.
#[derive(Debug)]
pub struct NetGuard {
    ret_code: i32,
}

impl NetGuard {
    pub fn acquire() -> Result<Arc<NetGuard>, NtpError> {
        let mut slot = NET_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(guard) = slot.upgrade() {
            return Ok(guard);
        }

        let guard = Arc::new(Self::init());
        if !guard.success() {
            warn!("Socket subsystem initialization failed (code {})", guard.ret_code);
            return Err(NtpError::SocketInitFailure(guard.ret_code));
        }
        debug!("Socket subsystem initialized");
        *slot = Arc::downgrade(&guard);
        Ok(guard)
    }

    fn init() -> NetGuard {
        // Creating a socket forces the platform stack up (WSAStartup on Windows
        // is performed by std/socket2 on first use) and reports failure early.
        match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
            Ok(_) => NetGuard { ret_code: 0 },
            Err(e) => NetGuard {
                ret_code: e.raw_os_error().unwrap_or(-1),
            },
        }
    }

    pub fn success(&self) -> bool {
        self.ret_code == 0
    }

    pub fn ret_code(&self) -> i32 {
        self.ret_code
    }

    /// Number of live handles, for diagnostics.
    pub fn active_handles() -> usize {
        NET_GUARD
            .lock()
            .map(|slot| slot.strong_count())
            .unwrap_or(0)
    }
}

impl Drop for NetGuard {
    fn drop(&mut self) {
        debug!("Socket subsystem released");
    }
}

/// Opens a connected datagram path to one server.
///
/// Name resolution and socket setup happen here, before the caller stamps
/// its transmit time, so their latency never lands in the measured delay.
#[cfg_attr(test, mockall::automock)]
pub trait UdpTransport: Send + Sync {
    /// `timeout` bounds connection setup and the exchange that follows.
    fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn UdpExchange>, NtpError>;
}

/// One request/response datagram exchange on an already connected path.
#[cfg_attr(test, mockall::automock)]
pub trait UdpExchange {
    /// Send `request` and wait for a single reply datagram, within what is
    /// left of the deadline given to `connect`.
    fn round_trip(&mut self, request: &[u8; NTP_PACKET_SIZE]) -> Result<Vec<u8>, NtpError>;
}

/// Blocking UDP transport over the OS socket API.
#[derive(Debug, Default)]
pub struct SocketTransport {
    guard: OnceLock<Arc<NetGuard>>,
}

impl SocketTransport {
    pub fn new() -> Self {
        SocketTransport {
            guard: OnceLock::new(),
        }
    }

    fn guard(&self) -> Result<Arc<NetGuard>, NtpError> {
        if let Some(g) = self.guard.get() {
            return Ok(g.clone());
        }
        let g = NetGuard::acquire()?;
        Ok(self.guard.get_or_init(|| g).clone())
    }
}

pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, NtpError> {
    let all: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| NtpError::ResolveFailure(format!("{}:{} ({})", host, port, e)))?
        .collect();
    // Prefer IPv4, the family most public NTP pools answer on.
    all.iter()
        .find(|a| a.is_ipv4())
        .or_else(|| all.first())
        .copied()
        .ok_or_else(|| NtpError::ResolveFailure(format!("{}:{} (no addresses)", host, port)))
}

fn connected_socket(addr: SocketAddr) -> Result<UdpSocket, NtpError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NtpError::SocketInitFailure(e.raw_os_error().unwrap_or(-1)))?;

    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    socket
        .bind(&local.into())
        .map_err(|e| NtpError::SocketInitFailure(e.raw_os_error().unwrap_or(-1)))?;

    // Connecting filters replies to the queried peer only.
    socket
        .connect(&addr.into())
        .map_err(|e| NtpError::ResolveFailure(format!("{} ({})", addr, e)))?;

    Ok(socket.into())
}

impl UdpTransport for SocketTransport {
    fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn UdpExchange>, NtpError> {
        let guard = self.guard()?;
        let deadline = DeadlineTimer::from_timeout(timeout);

        let addr = resolve(host, port)?;
        let socket = connected_socket(addr)?;
        debug!("Connected to {}", addr);

        Ok(Box::new(SocketExchange {
            socket,
            addr,
            deadline,
            _guard: guard,
        }))
    }
}

/// Connected socket plus the deadline left over from setup.
struct SocketExchange {
    socket: UdpSocket,
    addr: SocketAddr,
    deadline: DeadlineTimer,
    // Keeps the socket subsystem up while I/O is in flight.
    _guard: Arc<NetGuard>,
}

impl SocketExchange {
    fn remaining(&self) -> Result<Duration, NtpError> {
        let remaining = self.deadline.remaining();
        if remaining.is_zero() {
            return Err(NtpError::Timeout);
        }
        Ok(remaining)
    }
}

impl UdpExchange for SocketExchange {
    fn round_trip(&mut self, request: &[u8; NTP_PACKET_SIZE]) -> Result<Vec<u8>, NtpError> {
        self.socket
            .set_write_timeout(Some(self.remaining()?))
            .map_err(NtpError::from_send)?;
        let sent = self.socket.send(request).map_err(NtpError::from_send)?;
        if sent != request.len() {
            return Err(NtpError::SendFailure(format!(
                "short send: {} of {} bytes",
                sent,
                request.len()
            )));
        }

        self.socket
            .set_read_timeout(Some(self.remaining()?))
            .map_err(NtpError::from_recv)?;

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let received = self.socket.recv(&mut buf).map_err(NtpError::from_recv)?;
        debug!("Received {} bytes from {}", received, self.addr);

        Ok(buf[..received].to_vec())
    }
}

/// Logs once which address a host name resolves to; used by the CLI.
pub fn describe_endpoint(host: &str, port: u16) {
    match resolve(host, port) {
        Ok(addr) => info!("{}:{} -> {}", host, port, addr),
        Err(e) => warn!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_is_shared_while_alive() {
        let a = NetGuard::acquire().unwrap();
        let b = NetGuard::acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.success());
        assert_eq!(a.ret_code(), 0);
        assert!(NetGuard::active_handles() >= 2);
    }

    #[test]
    fn test_resolve_literal_address() {
        let addr = resolve("127.0.0.1", 123).unwrap();
        assert_eq!(addr, "127.0.0.1:123".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_resolve_failure_is_typed() {
        let err = resolve("host.invalid.", 123).unwrap_err();
        assert!(matches!(err, NtpError::ResolveFailure(_)));
    }

    #[test]
    fn test_round_trip_times_out_on_silent_peer() {
        // A bound socket that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        let transport = SocketTransport::new();
        let start = std::time::Instant::now();
        let mut conn = transport
            .connect("127.0.0.1", port, Duration::from_millis(150))
            .unwrap();
        let res = conn.round_trip(&[0u8; NTP_PACKET_SIZE]);
        assert_eq!(res, Err(NtpError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(100));

        let mut buf = [0u8; 64];
        let (n, _) = silent.recv_from(&mut buf).unwrap();
        assert_eq!(n, NTP_PACKET_SIZE);
    }

    #[test]
    fn test_round_trip_returns_reply_bytes() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, peer) = server.recv_from(&mut buf).unwrap();
            server.send_to(&buf[..n - 8], peer).unwrap();
        });

        let transport = SocketTransport::new();
        let mut conn = transport
            .connect("127.0.0.1", port, Duration::from_secs(2))
            .unwrap();
        let reply = conn.round_trip(&[7u8; NTP_PACKET_SIZE]).unwrap();
        handle.join().unwrap();
        // Short reply is passed through; the codec rejects it.
        assert_eq!(reply, vec![7u8; NTP_PACKET_SIZE - 8]);
    }

    #[test]
    fn test_connect_failure_is_reported_before_any_send() {
        let transport = SocketTransport::new();
        let err = transport
            .connect("host.invalid.", 123, Duration::from_millis(500))
            .err()
            .unwrap();
        assert!(matches!(err, NtpError::ResolveFailure(_)));
    }
}
