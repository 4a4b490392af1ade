//! Error taxonomy for the filesystem layer.
//!
//! [`WimFsError`] covers the per-handler errors returned to the FUSE kernel
//! bridge as negated errnos (spec §7 taxonomy (a)/(b)). [`MountError`] covers
//! the operational error codes surfaced at the mount/unmount entry points
//! (spec §6/§7 taxonomy (c)/(d)).

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive as _;

/// Errors a filesystem operation handler can return.
///
/// Each variant corresponds to a POSIX errno the handler propagates to the
/// kernel bridge verbatim; handlers never retry a failed syscall.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum WimFsError {
    Perm = libc::EPERM,
    NoEnt = libc::ENOENT,
    Io = libc::EIO,
    Access = libc::EACCES,
    Exist = libc::EEXIST,
    NotDir = libc::ENOTDIR,
    IsDir = libc::EISDIR,
    Inval = libc::EINVAL,
    NoSpc = libc::ENOSPC,
    NameTooLong = libc::ENAMETOOLONG,
    NotEmpty = libc::ENOTEMPTY,
    Stale = libc::ESTALE,
    NoMem = libc::ENOMEM,
    MFile = libc::EMFILE,
    Overflow = libc::EOVERFLOW,
    NotSupp = libc::ENOTSUP,
    /// Requested extended attribute / alternate data stream does not exist.
    NoData = libc::ENODATA,
}

impl WimFsError {
    /// The negated errno FUSE handler replies expect.
    pub fn to_errno(self) -> i32 {
        self.to_i32().expect("all variants map to a valid errno")
    }
}

impl std::fmt::Display for WimFsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?} (errno {})", self.to_errno())
    }
}

impl std::error::Error for WimFsError {}

impl From<std::io::Error> for WimFsError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => WimFsError::NoEnt,
            Some(libc::EEXIST) => WimFsError::Exist,
            Some(libc::ENOTDIR) => WimFsError::NotDir,
            Some(libc::EISDIR) => WimFsError::IsDir,
            Some(libc::EINVAL) => WimFsError::Inval,
            Some(libc::ENOSPC) => WimFsError::NoSpc,
            Some(libc::ENAMETOOLONG) => WimFsError::NameTooLong,
            Some(libc::ENOTEMPTY) => WimFsError::NotEmpty,
            Some(libc::EACCES) => WimFsError::Access,
            Some(libc::EMFILE) => WimFsError::MFile,
            Some(libc::ENODATA) => WimFsError::NoData,
            _ => WimFsError::Io,
        }
    }
}

/// Result alias used throughout the filesystem operation layer.
pub type WimFsResult<T> = Result<T, WimFsError>;

/// Operational error codes surfaced at the mount/unmount entry points
/// (spec §6).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum MountError {
    InvalidParam = 1,
    NoMem = 2,
    NotDir = 3,
    Mkdir = 4,
    Mqueue = 5,
    Fork = 6,
    Fusermount = 7,
    Timeout = 8,
    DeleteStagingDir = 9,
    Write = 10,
    Fuse = 11,
    Unsupported = 12,
    /// Two simultaneous mounts with the same mountpoint basename collided on
    /// handshake channel names (spec §9, open question).
    HandshakeNameConflict = 13,
}

impl std::fmt::Display for MountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for MountError {}
