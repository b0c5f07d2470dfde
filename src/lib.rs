pub mod clock;
pub mod config;
pub mod error;
pub mod net;
pub mod ntp;
pub mod packet;
pub mod pool;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod timer;
pub mod traits;

pub use config::{ServerEndpoint, ServiceConfig};
pub use error::{NtpError, NO_ERROR};
pub use ntp::{ExchangeResult, ExchangeSample, NtpClient};
pub use scheduler::{FireAt, TimerHandle, TimerScheduler};
pub use service::NtpTimeService;
