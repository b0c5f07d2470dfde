use libc::{clock_gettime, timespec, CLOCK_PROCESS_CPUTIME_ID};
use std::mem;

/// CPU time consumed by this process, in seconds.
///
/// Returns 0.0 if the kernel refuses the query.
pub fn process_cpu_time() -> f64 {
    let mut ts: timespec = unsafe { mem::zeroed() };
    let ret = unsafe { clock_gettime(CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    if ret != 0 {
        log::warn!(
            "clock_gettime(CLOCK_PROCESS_CPUTIME_ID) failed: {}",
            std::io::Error::last_os_error()
        );
        return 0.0;
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
}
