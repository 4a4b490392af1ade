//! The Unmount Handshake (spec §4.6): two named POSIX message queues that
//! let the short-lived unmount client hand the mount daemon its
//! commit/integrity decision, and let the daemon hand back a terminal
//! status once the Commit Engine (or a no-op discard) has run.
//!
//! Grounded on `original_source/src/mount.c`'s `open_message_queues`,
//! `wimfs_destroy`, and `wimlib_unmount`.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::MountError;

/// Names for the two handshake channels, derived from the mount
/// directory's basename (spec §4.6): `/<basename>wimlib-unmount-to-daemon-mq`
/// and `/<basename>wimlib-daemon-to-unmount-mq`, each with trailing slashes
/// stripped from the basename and any remaining internal slashes replaced
/// by underscores.
fn channel_names(mount_dir: &Path) -> (String, String) {
    let basename = mount_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sanitized = basename.trim_end_matches('/').replace('/', "_");
    let unmount_to_daemon = format!("/{sanitized}wimlib-unmount-to-daemon-mq");
    let daemon_to_unmount = format!("/{sanitized}wimlib-daemon-to-unmount-mq");
    (unmount_to_daemon, daemon_to_unmount)
}

/// The decision the unmount client sends the daemon (spec §4.6 2-byte
/// message `[commit, check_integrity]`).
#[derive(Debug, Clone, Copy)]
pub struct CommitDecision {
    pub commit: bool,
    pub check_integrity: bool,
}

/// Claims both channel names for this mount (spec §9 "message-channel
/// naming collision"): the original leaves two simultaneous mounts whose
/// directories share a basename to silently fight over one pair of queues.
/// This crate instead reserves the names at mount time with an
/// exclusive-create, so a colliding second mount fails fast with
/// [`MountError::HandshakeNameConflict`] instead of racing the first mount's
/// daemon for handshake messages later.
pub async fn claim_channel_names(mount_dir: &Path) -> Result<(), MountError> {
    let (u2d_name, d2u_name) = channel_names(mount_dir);
    mqueue::claim(&u2d_name, &d2u_name).await
}

/// Releases a claim taken by [`claim_channel_names`] without ever running
/// the handshake — used when `mount()` fails after claiming but before the
/// FUSE session (and therefore `destroy()`'s own unlink) starts, so a
/// failed mount attempt doesn't permanently block retrying at the same
/// mountpoint.
pub async fn release_channel_names(mount_dir: &Path) {
    let (u2d_name, d2u_name) = channel_names(mount_dir);
    mqueue::unlink_names(&u2d_name, &d2u_name).await
}

/// Daemon side: opens both channels, waits up to `timeout` for the
/// client's decision. On timeout, behaves as if `commit = false` (spec
/// §4.6) rather than returning an error — the caller still needs to reply
/// with a status byte either way.
pub async fn daemon_receive_decision(mount_dir: &Path, timeout: Duration) -> CommitDecision {
    let (u2d_name, d2u_name) = channel_names(mount_dir);
    match mqueue::receive_decision(&u2d_name, &d2u_name, timeout).await {
        Ok(decision) => {
            debug!(commit = decision.commit, check_integrity = decision.check_integrity, "received handshake decision");
            decision
        }
        Err(err) => {
            warn!(error = %err, "handshake receive failed or timed out, not committing");
            CommitDecision { commit: false, check_integrity: false }
        }
    }
}

/// Daemon side: sends the final status byte and tears down both channels.
pub async fn daemon_send_status(mount_dir: &Path, status: u8) {
    let (u2d_name, d2u_name) = channel_names(mount_dir);
    if let Err(err) = mqueue::send_status(&u2d_name, &d2u_name, status).await {
        warn!(error = %err, "failed to send handshake status to unmount process");
    }
}

/// Client side (spec §4.6): sends `[commit, check_integrity]`, then waits
/// up to `timeout` (600s per spec) for the daemon's 1-byte terminal
/// status. `Ok(true)` is a clean commit, `Ok(false)` is a reported daemon
/// failure, `Err(MountError::Timeout)` is a handshake timeout.
pub async fn client_round_trip(mount_dir: &Path, decision: CommitDecision, timeout: Duration) -> Result<bool, MountError> {
    let (u2d_name, d2u_name) = channel_names(mount_dir);
    let status = mqueue::client_send_and_wait(&u2d_name, &d2u_name, decision, timeout).await?;
    Ok(status == 0)
}

#[cfg(target_os = "linux")]
mod mqueue {
    use std::ffi::CString;
    use std::time::Duration;

    use super::CommitDecision;
    use crate::error::MountError;

    const QUEUE_MODE: libc::mode_t = 0o700;

    struct MessageQueue(libc::mqd_t);

    impl MessageQueue {
        fn open(name: &str, flags: libc::c_int) -> Result<Self, MountError> {
            let cname = CString::new(name).map_err(|_| MountError::Mqueue)?;
            let mqd = unsafe { libc::mq_open(cname.as_ptr(), flags | libc::O_CREAT, QUEUE_MODE, std::ptr::null::<libc::mq_attr>()) };
            if mqd == -1 {
                return Err(MountError::Mqueue);
            }
            Ok(Self(mqd))
        }

        /// Like `open`, but fails with `HandshakeNameConflict` rather than
        /// reusing a queue that already exists.
        fn create_exclusive(name: &str) -> Result<Self, MountError> {
            let cname = CString::new(name).map_err(|_| MountError::Mqueue)?;
            let mqd = unsafe {
                libc::mq_open(cname.as_ptr(), libc::O_RDONLY | libc::O_CREAT | libc::O_EXCL, QUEUE_MODE, std::ptr::null::<libc::mq_attr>())
            };
            if mqd == -1 {
                if std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
                    return Err(MountError::HandshakeNameConflict);
                }
                return Err(MountError::Mqueue);
            }
            Ok(Self(mqd))
        }

        fn msgsize(&self) -> usize {
            let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
            if unsafe { libc::mq_getattr(self.0, &mut attr) } == 0 {
                attr.mq_msgsize as usize
            } else {
                8192
            }
        }

        fn send(&self, bytes: &[u8]) -> Result<(), MountError> {
            let ret = unsafe { libc::mq_send(self.0, bytes.as_ptr() as *const libc::c_char, bytes.len(), 1) };
            if ret == -1 {
                return Err(MountError::Mqueue);
            }
            Ok(())
        }

        fn timed_receive(&self, timeout: Duration) -> Result<Vec<u8>, MountError> {
            let mut buf = vec![0u8; self.msgsize()];
            let deadline = deadline_timespec(timeout);
            let ret = unsafe {
                libc::mq_timedreceive(self.0, buf.as_mut_ptr() as *mut libc::c_char, buf.len(), std::ptr::null_mut(), &deadline)
            };
            if ret == -1 {
                let errno = std::io::Error::last_os_error().raw_os_error();
                if errno == Some(libc::ETIMEDOUT) {
                    return Err(MountError::Timeout);
                }
                return Err(MountError::Mqueue);
            }
            buf.truncate(ret as usize);
            Ok(buf)
        }
    }

    impl Drop for MessageQueue {
        fn drop(&mut self) {
            unsafe {
                libc::mq_close(self.0);
            }
        }
    }

    fn unlink(name: &str) {
        if let Ok(cname) = CString::new(name) {
            unsafe {
                libc::mq_unlink(cname.as_ptr());
            }
        }
    }

    fn deadline_timespec(timeout: Duration) -> libc::timespec {
        let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }
        let total_nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (total_nanos / 1_000_000_000) as libc::time_t,
            tv_nsec: (total_nanos % 1_000_000_000) as _,
        }
    }

    /// Reserves both channel names by creating them exclusively, then
    /// leaves them in place (unlinked only by `send_status` at the end of
    /// the real handshake) for the daemon's later plain `open` to reuse.
    pub async fn claim(u2d_name: &str, d2u_name: &str) -> Result<(), MountError> {
        let u2d_name = u2d_name.to_string();
        let d2u_name = d2u_name.to_string();
        tokio::task::spawn_blocking(move || {
            let u2d = MessageQueue::create_exclusive(&u2d_name)?;
            match MessageQueue::create_exclusive(&d2u_name) {
                Ok(d2u) => {
                    drop(d2u);
                    drop(u2d);
                    Ok(())
                }
                Err(err) => {
                    drop(u2d);
                    unlink(&u2d_name);
                    Err(err)
                }
            }
        })
        .await
        .map_err(|_| MountError::Mqueue)?
    }

    /// Unlinks both channels without opening them, for an aborted mount
    /// that claimed names it will never use.
    pub async fn unlink_names(u2d_name: &str, d2u_name: &str) {
        let u2d_name = u2d_name.to_string();
        let d2u_name = d2u_name.to_string();
        let _ = tokio::task::spawn_blocking(move || {
            unlink(&u2d_name);
            unlink(&d2u_name);
        })
        .await;
    }

    /// Daemon side: opens both channels read-then-write (spec §4.6), waits
    /// for the 2-byte decision message.
    pub async fn receive_decision(u2d_name: &str, d2u_name: &str, timeout: Duration) -> Result<CommitDecision, MountError> {
        let u2d_name = u2d_name.to_string();
        let d2u_name = d2u_name.to_string();
        tokio::task::spawn_blocking(move || {
            let unmount_to_daemon = MessageQueue::open(&u2d_name, libc::O_RDONLY)?;
            let _daemon_to_unmount = MessageQueue::open(&d2u_name, libc::O_WRONLY)?;
            let msg = unmount_to_daemon.timed_receive(timeout)?;
            Ok(CommitDecision {
                commit: msg.first().copied().unwrap_or(0) != 0,
                check_integrity: msg.get(1).copied().unwrap_or(0) != 0,
            })
        })
        .await
        .map_err(|_| MountError::Mqueue)?
    }

    /// Daemon side: sends the 1-byte terminal status and unlinks both
    /// channels (spec §4.6 "wimfs_destroy... close_message_queues").
    pub async fn send_status(u2d_name: &str, d2u_name: &str, status: u8) -> Result<(), MountError> {
        let u2d_name = u2d_name.to_string();
        let d2u_name = d2u_name.to_string();
        tokio::task::spawn_blocking(move || {
            let daemon_to_unmount = MessageQueue::open(&d2u_name, libc::O_WRONLY)?;
            let result = daemon_to_unmount.send(&[status]);
            unlink(&u2d_name);
            unlink(&d2u_name);
            result
        })
        .await
        .map_err(|_| MountError::Mqueue)?
    }

    /// Client side: opens both channels write-then-read, sends the
    /// decision, waits up to `timeout` for the daemon's status byte.
    pub async fn client_send_and_wait(
        u2d_name: &str,
        d2u_name: &str,
        decision: CommitDecision,
        timeout: Duration,
    ) -> Result<u8, MountError> {
        let u2d_name = u2d_name.to_string();
        let d2u_name = d2u_name.to_string();
        tokio::task::spawn_blocking(move || {
            let unmount_to_daemon = MessageQueue::open(&u2d_name, libc::O_WRONLY)?;
            let daemon_to_unmount = MessageQueue::open(&d2u_name, libc::O_RDONLY)?;
            let msg = [decision.commit as u8, decision.check_integrity as u8];
            unmount_to_daemon.send(&msg)?;
            let reply = daemon_to_unmount.timed_receive(timeout)?;
            Ok(reply.first().copied().unwrap_or(1))
        })
        .await
        .map_err(|_| MountError::Mqueue)?
    }
}

#[cfg(not(target_os = "linux"))]
mod mqueue {
    use std::time::Duration;

    use super::CommitDecision;
    use crate::error::MountError;

    pub async fn claim(_u2d_name: &str, _d2u_name: &str) -> Result<(), MountError> {
        Ok(())
    }

    pub async fn unlink_names(_u2d_name: &str, _d2u_name: &str) {}

    pub async fn receive_decision(_u2d_name: &str, _d2u_name: &str, _timeout: Duration) -> Result<CommitDecision, MountError> {
        Err(MountError::Unsupported)
    }

    pub async fn send_status(_u2d_name: &str, _d2u_name: &str, _status: u8) -> Result<(), MountError> {
        Err(MountError::Unsupported)
    }

    pub async fn client_send_and_wait(
        _u2d_name: &str,
        _d2u_name: &str,
        _decision: CommitDecision,
        _timeout: Duration,
    ) -> Result<u8, MountError> {
        Err(MountError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_strip_trailing_slashes_and_underscore_internal_ones() {
        let (u2d, d2u) = channel_names(Path::new("/mnt/my mount/"));
        assert_eq!(u2d, "/my mountwimlib-unmount-to-daemon-mq");
        assert_eq!(d2u, "/my mountwimlib-daemon-to-unmount-mq");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn claiming_an_already_claimed_mountpoint_name_conflicts() {
        use rand::Rng;
        let suffix: u64 = rand::thread_rng().gen();
        let mount_dir = std::path::PathBuf::from(format!("/tmp/wimfs-handshake-test-{suffix}"));

        claim_channel_names(&mount_dir).await.unwrap();
        let second = claim_channel_names(&mount_dir).await;
        release_channel_names(&mount_dir).await;

        assert_eq!(second.unwrap_err(), MountError::HandshakeNameConflict);
    }
}
