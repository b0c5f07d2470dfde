//! Error taxonomy shared by the wire codec, the client and the sync service.
//!
//! Every variant maps to a stable integer code so that callers polling
//! `get_last_error_code()` can compare against constants instead of strings.
//! `NO_ERROR` (0) is reported after a successful exchange.

use std::io;
use thiserror::Error;

/// Sentinel returned by `get_last_error_code()` when the last exchange succeeded.
pub const NO_ERROR: i32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NtpError {
    #[error("timed out waiting for NTP response")]
    Timeout,

    #[error("malformed NTP packet: {0}")]
    MalformedPacket(String),

    #[error("inconsistent NTP timestamps: {0}")]
    BadTimestamps(String),

    #[error("socket subsystem initialization failed (code {0})")]
    SocketInitFailure(i32),

    #[error("failed to send NTP request: {0}")]
    SendFailure(String),

    #[error("failed to receive NTP response: {0}")]
    ReceiveFailure(String),

    #[error("no NTP servers available (pool empty or every server cooling down)")]
    NoServersAvailable,

    #[error("failed to resolve or connect to {0}")]
    ResolveFailure(String),

    #[error("server sent Kiss-o'-Death ({0})")]
    KissOfDeath(String),

    #[error("server clock is unsynchronized: {0}")]
    Unsynchronized(String),

    #[error("round-trip delay {delay_us}us exceeds the {limit_us}us limit")]
    DelayTooHigh { delay_us: i64, limit_us: i64 },
}

impl NtpError {
    pub fn code(&self) -> i32 {
        match self {
            NtpError::Timeout => 1,
            NtpError::MalformedPacket(_) => 2,
            NtpError::BadTimestamps(_) => 3,
            NtpError::SocketInitFailure(_) => 4,
            NtpError::SendFailure(_) => 5,
            NtpError::ReceiveFailure(_) => 6,
            NtpError::NoServersAvailable => 7,
            NtpError::ResolveFailure(_) => 8,
            NtpError::KissOfDeath(_) => 9,
            NtpError::Unsynchronized(_) => 10,
            NtpError::DelayTooHigh { .. } => 11,
        }
    }

    /// Maps a socket send error. Timeouts surface as `Timeout` regardless of direction.
    pub(crate) fn from_send(err: io::Error) -> Self {
        if is_timeout(&err) {
            NtpError::Timeout
        } else {
            NtpError::SendFailure(err.to_string())
        }
    }

    pub(crate) fn from_recv(err: io::Error) -> Self {
        if is_timeout(&err) {
            NtpError::Timeout
        } else {
            NtpError::ReceiveFailure(err.to_string())
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Converts an optional error into its code, `NO_ERROR` for `None`.
pub fn error_code(err: Option<&NtpError>) -> i32 {
    err.map_or(NO_ERROR, NtpError::code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_and_nonzero() {
        let all = [
            NtpError::Timeout,
            NtpError::MalformedPacket(String::new()),
            NtpError::BadTimestamps(String::new()),
            NtpError::SocketInitFailure(-1),
            NtpError::SendFailure(String::new()),
            NtpError::ReceiveFailure(String::new()),
            NtpError::NoServersAvailable,
            NtpError::ResolveFailure(String::new()),
            NtpError::KissOfDeath("RATE".into()),
            NtpError::Unsynchronized(String::new()),
            NtpError::DelayTooHigh {
                delay_us: 300_000,
                limit_us: 250_000,
            },
        ];
        let mut codes: Vec<i32> = all.iter().map(NtpError::code).collect();
        assert!(codes.iter().all(|c| *c != NO_ERROR));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_io_timeouts_map_to_timeout() {
        let would_block = io::Error::new(io::ErrorKind::WouldBlock, "eagain");
        assert_eq!(NtpError::from_recv(would_block), NtpError::Timeout);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(NtpError::from_send(timed_out), NtpError::Timeout);

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(NtpError::from_recv(refused), NtpError::ReceiveFailure(_)));
    }

    #[test]
    fn test_error_code_helper() {
        assert_eq!(error_code(None), NO_ERROR);
        assert_eq!(error_code(Some(&NtpError::Timeout)), 1);
    }
}
