use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::clock::{LocalClock, SystemClock};
use crate::config::ServerEndpoint;
use crate::error::{NtpError, NO_ERROR};
use crate::net::{SocketTransport, UdpExchange, UdpTransport};
use crate::packet::{fill_packet, parse_packet, validate_reply, ClientRequest};
use crate::traits::NtpSource;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of one successful request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeSample {
    /// Estimated server − local, microseconds.
    pub offset_us: i64,
    pub delay_us: i64,
    pub stratum: u8,
    /// Local arrival instant (T4), Unix microseconds.
    pub local_time_us: i64,
}

pub type ExchangeResult = Result<ExchangeSample, NtpError>;

/// Offset and round-trip delay from the four exchange timestamps (µs):
/// T1 client send, T2 server receive, T3 server send, T4 client receive.
pub fn compute_offset_delay(t1: i64, t2: i64, t3: i64, t4: i64) -> (i64, i64) {
    let delay = (t4 - t1) - (t3 - t2);
    let offset = ((t2 - t1) + (t3 - t4)) / 2;
    (offset, delay)
}

/// SNTP client.
///
/// Each `query` performs one exchange and remembers its outcome; the UTC
/// accessors apply the last good offset to the local clock without touching
/// the network.
pub struct NtpClient<T = SocketTransport, C = SystemClock>
where
    T: UdpTransport,
    C: LocalClock,
{
    transport: T,
    clock: C,

    offset_us: AtomicI64,
    delay_us: AtomicI64,
    stratum: AtomicI32,
    success: AtomicBool,
    last_error: Mutex<Option<NtpError>>,
}

impl NtpClient {
    pub fn new() -> Self {
        NtpClient::with_parts(SocketTransport::new(), SystemClock)
    }
}

impl Default for NtpClient {
    fn default() -> Self {
        NtpClient::new()
    }
}

impl<T, C> NtpClient<T, C>
where
    T: UdpTransport,
    C: LocalClock,
{
    pub fn with_parts(transport: T, clock: C) -> Self {
        NtpClient {
            transport,
            clock,
            offset_us: AtomicI64::new(0),
            delay_us: AtomicI64::new(0),
            stratum: AtomicI32::new(-1),
            success: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn query(&self, host: &str, port: u16, timeout: Duration) -> ExchangeResult {
        let result = self.exchange(host, port, timeout);
        match &result {
            Ok(sample) => {
                debug!(
                    "[NTP] {}:{} offset={}us delay={}us stratum={}",
                    host, port, sample.offset_us, sample.delay_us, sample.stratum
                );
                self.offset_us.store(sample.offset_us, Ordering::SeqCst);
                self.delay_us.store(sample.delay_us, Ordering::SeqCst);
                self.stratum.store(sample.stratum as i32, Ordering::SeqCst);
                self.success.store(true, Ordering::SeqCst);
                self.set_last_error(None);
            }
            Err(e) => {
                warn!("[NTP] {}:{} query failed: {}", host, port, e);
                self.success.store(false, Ordering::SeqCst);
                self.set_last_error(Some(e.clone()));
            }
        }
        result
    }

    fn exchange(&self, host: &str, port: u16, timeout: Duration) -> ExchangeResult {
        let mut conn = self.transport.connect(host, port, timeout)?;

        // T1 right before the datagram leaves; setup time is not round trip.
        let t1 = self.clock.now_us();
        let request = ClientRequest::at(t1);
        let bytes = fill_packet(&request);

        let reply = conn.round_trip(&bytes)?;
        let t4 = self.clock.now_us();

        let packet = parse_packet(&reply)?;
        validate_reply(&packet, &request)?;

        // validate_reply guarantees both convert
        let (t2, t3) = match (packet.receive.to_unix_us(), packet.transmit.to_unix_us()) {
            (Some(t2), Some(t3)) => (t2, t3),
            _ => return Err(NtpError::BadTimestamps("server timestamps out of range".into())),
        };

        let (offset_us, delay_us) = compute_offset_delay(t1, t2, t3, t4);
        if delay_us < 0 {
            return Err(NtpError::BadTimestamps(format!(
                "negative round-trip delay {}us",
                delay_us
            )));
        }

        Ok(ExchangeSample {
            offset_us,
            delay_us,
            stratum: packet.stratum,
            local_time_us: t4,
        })
    }

    fn set_last_error(&self, err: Option<NtpError>) {
        let mut slot = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *slot = err;
    }

    pub fn success(&self) -> bool {
        self.success.load(Ordering::SeqCst)
    }

    pub fn get_offset_us(&self) -> i64 {
        self.offset_us.load(Ordering::SeqCst)
    }

    pub fn get_delay_us(&self) -> i64 {
        self.delay_us.load(Ordering::SeqCst)
    }

    /// -1 until a query has succeeded.
    pub fn get_stratum(&self) -> i32 {
        self.stratum.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<NtpError> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get_last_error_code(&self) -> i32 {
        self.last_error().map_or(NO_ERROR, |e| e.code())
    }

    pub fn get_utc_time_us(&self) -> i64 {
        self.clock.now_us() + self.get_offset_us()
    }

    pub fn get_utc_time_ms(&self) -> i64 {
        self.get_utc_time_us().div_euclid(1_000)
    }

    pub fn get_utc_time(&self) -> i64 {
        self.get_utc_time_us().div_euclid(1_000_000)
    }
}

impl<T, C> NtpSource for NtpClient<T, C>
where
    T: UdpTransport,
    C: LocalClock,
{
    fn query(&self, server: &ServerEndpoint, timeout: Duration) -> ExchangeResult {
        NtpClient::query(self, &server.host, server.port, timeout)
    }
}
