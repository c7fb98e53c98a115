//! OS glue the rest of the crate stays safe on top of.
//!
//! Two concerns live here: reading the peer credentials of a connected
//! Unix stream socket (`SO_PEERCRED`) and demoting the calling thread to
//! the background niceness class. Both are raw libc calls; everything
//! else in the crate goes through std, mio, or rustix.
#![allow(unsafe_code)]

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Niceness assigned to worker threads that accept background scheduling.
const BACKGROUND_NICENESS: libc::c_int = 10;

/// Identity of the process on the far end of a Unix stream connection.
///
/// Filled in by the kernel at `connect` time; unforgeable by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    /// Process ID of the peer.
    pub pid: i32,
    /// Effective user ID of the peer.
    pub uid: u32,
    /// Effective group ID of the peer.
    pub gid: u32,
}

/// Reads `SO_PEERCRED` for a connected Unix stream socket.
pub(crate) fn peer_credentials(fd: BorrowedFd<'_>) -> io::Result<PeerCred> {
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = size_of::<libc::ucred>() as libc::socklen_t;

    // SAFETY: `ucred` is a plain-old-data struct sized by `len`; the kernel
    // writes at most `len` bytes into it and updates `len`. The fd is
    // borrowed, so it is open for the duration of the call.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&raw mut ucred).cast(),
            &raw mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCred {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

/// Moves the calling thread to the background niceness class.
///
/// On Linux, `setpriority` with `PRIO_PROCESS` and `who == 0` targets the
/// calling thread, not the whole process.
pub(crate) fn demote_to_background() -> io::Result<()> {
    // SAFETY: setpriority touches no user memory; it only adjusts the
    // scheduler attributes of the calling thread.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, BACKGROUND_NICENESS) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
