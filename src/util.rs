use rand::rngs::OsRng;
use rand::RngCore;

/// Monotonic clock reading in nanoseconds. All record timestamps come
/// from here.
pub fn gettime() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Kernel entropy; used for the session id. Aborts if the kernel cannot
/// provide randomness, which can only happen before tracing started.
pub fn good_random() -> u64 {
    OsRng.next_u64()
}

pub fn read_exename() -> String {
    match std::fs::read_link("/proc/self/exe") {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => String::from("unknown"),
    }
}

pub const fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
