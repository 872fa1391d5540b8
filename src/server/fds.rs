//! Descriptor hygiene for freshly forked children.

use std::os::unix::io::RawFd;

/// Close every open descriptor except those in `keep`.
pub(crate) fn close_all_except(keep: &[RawFd]) {
    for fd in open_descriptors() {
        if !keep.contains(&fd) {
            // SAFETY: the child owns its descriptor table; nothing that
            // runs afterwards uses a descriptor outside `keep` from before
            // the fork.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

fn open_descriptors() -> Vec<RawFd> {
    #[cfg(target_os = "linux")]
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        // The directory's own descriptor shows up in the listing but is
        // closed again by the time we iterate the result.
        return entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect();
    }

    // SAFETY: sysconf has no preconditions.
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = if limit <= 0 { 1024 } else { limit.min(65_536) };
    (0..limit as RawFd).collect()
}
