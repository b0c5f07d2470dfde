use ::windows::Win32::Foundation::FILETIME;
use ::windows::Win32::System::Threading::{GetCurrentProcess, GetProcessTimes};

fn filetime_to_secs(ft: &FILETIME) -> f64 {
    // FILETIME counts 100ns intervals
    let ticks = ((ft.dwHighDateTime as u64) << 32) | ft.dwLowDateTime as u64;
    ticks as f64 / 10_000_000.0
}

/// CPU time (kernel + user) consumed by this process, in seconds.
///
/// Returns 0.0 if the query fails.
pub fn process_cpu_time() -> f64 {
    let mut creation = FILETIME::default();
    let mut exit = FILETIME::default();
    let mut kernel = FILETIME::default();
    let mut user = FILETIME::default();

    let res = unsafe {
        GetProcessTimes(GetCurrentProcess(), &mut creation, &mut exit, &mut kernel, &mut user)
    };
    if let Err(e) = res {
        log::warn!("GetProcessTimes failed: {}", e);
        return 0.0;
    }
    filetime_to_secs(&kernel) + filetime_to_secs(&user)
}
