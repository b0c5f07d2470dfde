//! Lightweight value-type timers.
//!
//! None of these own a thread or a callback; they answer "how long since" and
//! "is it time yet" questions for the scheduler, the transport and the sync
//! service.

mod cpu_tick;
mod deadline;
mod elapsed;

pub use cpu_tick::CpuTickTimer;
pub use deadline::DeadlineTimer;
pub use elapsed::ElapsedTimer;
