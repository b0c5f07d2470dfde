use std::time::Duration;

use crate::config::ServerEndpoint;
use crate::ntp::ExchangeResult;

/// Anything that can perform one NTP exchange against a server.
///
/// The sync service only talks to servers through this seam, so tests can
/// script per-server outcomes without sockets.
#[cfg_attr(test, mockall::automock)]
pub trait NtpSource: Send {
    fn query(&self, server: &ServerEndpoint, timeout: Duration) -> ExchangeResult;
}

impl<T: NtpSource + ?Sized> NtpSource for Box<T> {
    fn query(&self, server: &ServerEndpoint, timeout: Duration) -> ExchangeResult {
        (**self).query(server, timeout)
    }
}
