use serde::{Deserialize, Serialize};

use crate::error::error_code;
use crate::pool::ServerHealth;
use crate::service::SyncState;

/// Sync status in a form suitable for printing or handing to another process.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncStatus {
    /// Estimated server − local offset (microseconds)
    pub offset_us: i64,

    /// Offset measured by the last exchange, before smoothing
    #[serde(default)]
    pub sample_offset_us: i64,

    /// Round-trip delay of the exchange that produced the offset
    pub delay_us: i64,

    pub stratum: Option<u8>,

    /// Server that produced the current offset, as `host:port`
    pub server: Option<String>,

    /// True once any exchange has succeeded
    pub synchronized: bool,

    /// Local Unix time (µs) of the last successful exchange
    pub last_sync_unix_us: Option<i64>,

    /// Milliseconds since the last successful exchange
    pub age_ms: Option<u64>,

    /// `NtpError::code()` of the last failure, 0 after a success
    pub last_error_code: i32,
    pub last_error: Option<String>,

    pub cycles: u64,
    pub failed_cycles: u64,

    pub servers: Vec<ServerHealth>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            offset_us: 0,
            sample_offset_us: 0,
            delay_us: 0,
            stratum: None,
            server: None,
            synchronized: false,
            last_sync_unix_us: None,
            age_ms: None,
            last_error_code: 0,
            last_error: None,
            cycles: 0,
            failed_cycles: 0,
            servers: Vec::new(),
        }
    }
}

impl SyncStatus {
    pub fn from_state(state: &SyncState) -> Self {
        SyncStatus {
            offset_us: state.offset_us,
            sample_offset_us: state.sample_offset_us,
            delay_us: state.delay_us,
            stratum: state.stratum,
            server: state.server.as_ref().map(|s| s.to_string()),
            synchronized: state.last_sync.is_some(),
            last_sync_unix_us: state.last_sync_unix_us,
            age_ms: state.last_sync.map(|at| at.elapsed().as_millis() as u64),
            last_error_code: error_code(state.last_error.as_ref()),
            last_error: state.last_error.as_ref().map(|e| e.to_string()),
            cycles: state.cycles,
            failed_cycles: state.failed_cycles,
            servers: state.servers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerEndpoint;
    use crate::error::NtpError;
    use std::time::Instant;

    #[test]
    fn test_sync_status_default() {
        let status = SyncStatus::default();
        assert_eq!(status.offset_us, 0);
        assert!(!status.synchronized);
        assert_eq!(status.last_error_code, 0);
        assert!(status.servers.is_empty());
    }

    #[test]
    fn test_from_state() {
        let state = SyncState {
            offset_us: -1_250,
            delay_us: 800,
            stratum: Some(2),
            server: Some(ServerEndpoint::new("time.example", 123)),
            last_sync: Some(Instant::now()),
            last_sync_unix_us: Some(1_700_000_000_000_000),
            last_error: Some(NtpError::Timeout),
            cycles: 4,
            failed_cycles: 1,
            ..SyncState::default()
        };
        let status = SyncStatus::from_state(&state);
        assert!(status.synchronized);
        assert_eq!(status.server.as_deref(), Some("time.example:123"));
        assert_eq!(status.last_error_code, 1);
        assert!(status.age_ms.is_some());
    }

    #[test]
    fn test_sync_status_serde_roundtrip() {
        let status = SyncStatus {
            offset_us: 150,
            synchronized: true,
            server: Some("10.0.0.1:123".into()),
            servers: vec![ServerHealth {
                server: "10.0.0.1:123".into(),
                consecutive_failures: 0,
                total_successes: 3,
                total_failures: 1,
                cooling_down: false,
                cooldown_remaining_ms: 0,
                last_error_code: 0,
            }],
            ..SyncStatus::default()
        };

        let json = serde_json::to_string(&status).expect("serialize failed");
        let restored: SyncStatus = serde_json::from_str(&json).expect("deserialize failed");
        assert_eq!(restored, status);
    }
}
