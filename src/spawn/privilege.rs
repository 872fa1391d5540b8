//! Process identity of a freshly forked worker: passed environment
//! variables and dropping root.

use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::errno::Errno;
use nix::unistd::{Uid, User, geteuid, setgid, setuid};
use tracing::debug;

use super::loader::BootstrapError;

/// Export `variables` into the worker's environment.
///
/// Only called in a just-forked worker, which runs a single thread.
pub(crate) fn apply_environment(variables: &BTreeMap<String, String>) {
    for (name, value) in variables {
        if name.is_empty() || name.contains('=') || name.contains('\0') || value.contains('\0') {
            debug!(%name, "Skipping environment variable that cannot be exported");
            continue;
        }
        // SAFETY: the worker has no other threads that could read the
        // environment concurrently.
        unsafe { std::env::set_var(name, value) };
    }
}

/// The account a root worker should switch to: the owner of
/// `owner_uid` unless that is root or unknown, else `lowest_user` unless
/// that is root or unknown.
pub(crate) fn choose_user(owner_uid: u32, lowest_user: &str) -> Option<User> {
    let not_root = |user: &User| !user.uid.is_root();
    User::from_uid(Uid::from_raw(owner_uid))
        .ok()
        .flatten()
        .filter(not_root)
        .or_else(|| User::from_name(lowest_user).ok().flatten().filter(not_root))
}

/// When running as root, switch to the owner of `startup_file` (or to
/// `lowest_user`). Returns the account switched to, if any.
///
/// Lacking the permission to switch is not an error; the worker keeps
/// running as it is.
pub(crate) fn lower_privilege(
    startup_file: &Path,
    lowest_user: &str,
) -> Result<Option<User>, BootstrapError> {
    if !geteuid().is_root() {
        return Ok(None);
    }
    let owner = std::fs::symlink_metadata(startup_file)
        .map_err(|e| {
            BootstrapError::general(format!(
                "cannot stat startup file {}: {}",
                startup_file.display(),
                e
            ))
        })?
        .uid();
    let Some(user) = choose_user(owner, lowest_user) else {
        debug!(owner, lowest_user, "No unprivileged account to switch to");
        return Ok(None);
    };

    match switch_to(&user) {
        Ok(()) => {
            // SAFETY: single-threaded worker, as in apply_environment.
            unsafe { std::env::set_var("HOME", &user.dir) };
            debug!(user = %user.name, uid = %user.uid, "Lowered worker privileges");
            Ok(Some(user))
        }
        Err(Errno::EPERM) => {
            debug!(user = %user.name, "Not permitted to switch user");
            Ok(None)
        }
        Err(errno) => Err(BootstrapError::general(format!(
            "could not switch to user {}: {}",
            user.name, errno
        ))),
    }
}

fn switch_to(user: &User) -> nix::Result<()> {
    // Supplementary groups are best effort.
    #[cfg(not(target_vendor = "apple"))]
    if let Ok(name) = std::ffi::CString::new(user.name.as_str()) {
        let _ = nix::unistd::initgroups(&name, user.gid);
    }
    setgid(user.gid)?;
    setuid(user.uid)
}
