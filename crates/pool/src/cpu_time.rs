//! OS-level thread CPU time, used to attribute cost to GC passes.

use std::time::Duration;

/// CPU time consumed by the current thread.
#[cfg(target_os = "linux")]
pub(crate) fn thread_cpu_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// CPU time consumed by the current thread (macOS).
#[cfg(target_os = "macos")]
pub(crate) fn thread_cpu_time() -> Duration {
    use libc::{THREAD_BASIC_INFO, thread_basic_info, thread_info};
    use mach2::mach_init::mach_thread_self;

    unsafe {
        let mut info = std::mem::zeroed::<thread_basic_info>();
        let mut count =
            (std::mem::size_of::<thread_basic_info>() / std::mem::size_of::<libc::c_int>()) as u32;

        let kr = thread_info(
            mach_thread_self(),
            THREAD_BASIC_INFO as u32,
            &mut info as *mut _ as *mut _,
            &mut count,
        );

        if kr == 0 {
            let user = Duration::new(
                info.user_time.seconds as u64,
                info.user_time.microseconds as u32 * 1000,
            );
            let sys = Duration::new(
                info.system_time.seconds as u64,
                info.system_time.microseconds as u32 * 1000,
            );
            user + sys
        } else {
            Duration::ZERO
        }
    }
}

/// Fallback for unsupported platforms.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub(crate) fn thread_cpu_time() -> Duration {
    Duration::ZERO
}
