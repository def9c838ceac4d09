//! Peer-credential lookup on local sockets.
//!
//! The admin tooling connects to the daemon over a unix socket and the
//! daemon authorises it by asking the kernel who is on the other end.

use std::os::unix::net::UnixStream;

use crate::error::{TransportError, TransportResult};

/// Credentials of the process on the far side of a local socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Peer user id.
    pub uid: u32,
    /// Peer group id.
    pub gid: u32,
    /// Peer process id.
    pub pid: i32,
}

/// Returns the peer's credentials for a connected unix-domain stream.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn peer_credentials(stream: &UnixStream) -> TransportResult<PeerCredentials> {
    use std::os::unix::io::AsRawFd;

    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: fd is a valid connected socket owned by `stream`, and the
    // out-parameters are sized exactly for SO_PEERCRED.
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::from_mut(&mut cred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(TransportError::Read(std::io::Error::last_os_error()));
    }
    Ok(PeerCredentials {
        uid: cred.uid,
        gid: cred.gid,
        pid: cred.pid,
    })
}

/// Peer credentials are only implemented for Linux's `SO_PEERCRED`.
#[cfg(not(target_os = "linux"))]
pub fn peer_credentials(_stream: &UnixStream) -> TransportResult<PeerCredentials> {
    Err(TransportError::Unsupported("peer credentials"))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn own_socketpair_reports_current_uid() {
        let (a, _b) = UnixStream::pair().unwrap();
        let creds = peer_credentials(&a).unwrap();
        // SAFETY: getuid/getgid cannot fail.
        #[allow(unsafe_code)]
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        assert_eq!(creds.uid, uid);
        assert_eq!(creds.gid, gid);
    }
}
