//! Best-effort CPU affinity and priority for stage threads. Failures are
//! logged and ignored; the pipeline runs fine unpinned, just with more
//! jitter.

use tracing::warn;

#[cfg(target_os = "linux")]
pub fn pin_cpu(cpu: usize) {
    // SAFETY: plain affinity syscall on the calling thread with a properly
    // zeroed cpu_set_t.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!(
                cpu,
                error = %std::io::Error::last_os_error(),
                "could not pin thread"
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_cpu(cpu: usize) {
    warn!(cpu, "thread pinning not supported on this platform");
}

/// Raise the stage's scheduling priority a notch. Needs CAP_SYS_NICE (or
/// a root run) to actually take effect.
pub fn raise_priority() {
    const NICE: libc::c_int = -10;
    // SAFETY: setpriority with our own process id.
    let rv = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, NICE) };
    if rv != 0 {
        warn!(
            nice = NICE,
            error = %std::io::Error::last_os_error(),
            "could not raise priority"
        );
    }
}
