//! The synchronous `fuser::Filesystem` bridge (spec §5 "Concurrency model").
//!
//! `fuser`'s lowlevel loop calls each trait method synchronously from one
//! dedicated thread; [`WimFsAdapter`] drives the async [`WimFs`] handlers
//! to completion on a private current-thread Tokio runtime before
//! returning control to that loop, so exactly one operation's `.await`
//! points are ever live at a time — no handler-level interleaving, no
//! `tokio::task::spawn` per call.
//!
//! Grounded on `examples/other_examples/77b7def9_..._fuse.rs.rs`'s
//! `impl fuser::Filesystem for Session`, adapted from its per-call
//! `tokio::task::spawn` dispatch to a blocking `runtime.block_on` call.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tracing::warn;

use crate::commit;
use crate::error::WimFsError;
use crate::handshake;
use crate::ops::{Attr, TimeUpdate, WimFs};

/// Attribute validity as reported to the kernel cache. The tree is the
/// sole source of truth and every handler mutates it before replying, so a
/// short TTL (rather than zero) just trims redundant `getattr` round trips.
const ATTR_TTL: Duration = Duration::from_secs(1);

const WINDOWS_TO_UNIX_EPOCH_SECONDS: i64 = 11_644_473_600;

fn millis_to_system_time(ms: i64) -> SystemTime {
    let unix_seconds = ms / 1000 - WINDOWS_TO_UNIX_EPOCH_SECONDS;
    let unix_nanos = (ms % 1000).unsigned_abs() as u32 * 1_000_000;
    if unix_seconds >= 0 {
        UNIX_EPOCH + Duration::new(unix_seconds as u64, unix_nanos)
    } else {
        UNIX_EPOCH - Duration::new((-unix_seconds) as u64, unix_nanos)
    }
}

fn system_time_to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => (duration.as_millis() as i64) + WINDOWS_TO_UNIX_EPOCH_SECONDS * 1000,
        Err(err) => -(err.duration().as_millis() as i64) + WINDOWS_TO_UNIX_EPOCH_SECONDS * 1000,
    }
}

fn to_file_attr(attr: Attr) -> FileAttr {
    let kind = if attr.is_dir {
        FileType::Directory
    } else if attr.is_symlink {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };
    let time = millis_to_system_time(attr.mtime_ms);
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: millis_to_system_time(attr.atime_ms),
        mtime: time,
        ctime: time,
        crtime: time,
        kind,
        perm: if attr.is_dir { 0o755 } else { 0o644 },
        nlink: attr.nlink,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

fn name_to_str(name: &OsStr) -> Result<&str, i32> {
    name.to_str().ok_or(libc::EINVAL)
}

fn time_or_now_to_update(value: Option<TimeOrNow>) -> TimeUpdate {
    match value {
        None => TimeUpdate::Unchanged,
        Some(TimeOrNow::Now) => TimeUpdate::Now,
        Some(TimeOrNow::SpecificTime(time)) => TimeUpdate::SetMillis(system_time_to_millis(time)),
    }
}

/// Bridges `fuser`'s lowlevel callback surface to [`WimFs`]'s async
/// operation handlers via a dedicated single-threaded Tokio runtime (spec
/// §5).
pub struct WimFsAdapter {
    fs: std::sync::Arc<WimFs>,
    mount_dir: PathBuf,
    runtime: tokio::runtime::Runtime,
}

impl WimFsAdapter {
    pub fn new(fs: std::sync::Arc<WimFs>, mount_dir: PathBuf) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        Ok(Self { fs, mount_dir, runtime })
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl Filesystem for WimFsAdapter {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        // The unmount handshake (spec §4.6) hands us the client's decision;
        // only a read-write mount that was asked to commit runs the Commit
        // Engine before replying with the terminal status byte.
        let fs = self.fs.clone();
        let mount_dir = self.mount_dir.clone();
        self.block_on(async move {
            let timeout = Duration::from_millis(fs.config().handshake_daemon_timeout_ms);
            let decision = handshake::daemon_receive_decision(&mount_dir, timeout).await;

            let status = if decision.commit && fs.config().read_write {
                match commit::run(&fs, decision.check_integrity).await {
                    Ok(status) => status.to_byte(),
                    Err(err) => {
                        warn!(error = %err, "commit engine failed");
                        1
                    }
                }
            } else {
                0
            };

            handshake::daemon_send_status(&mount_dir, status).await;
        });
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name_to_str(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        match self.block_on(self.fs.lookup(parent, name)) {
            Ok((ino, attr)) => reply.entry(&ATTR_TTL, &to_file_attr(Attr { ino, ..attr }), 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.block_on(self.fs.forget(ino, nlookup));
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.block_on(self.fs.getattr(ino)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(attr)),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let fut = async {
            if let Some(size) = size {
                self.fs.truncate(ino, size).await?;
            }
            if atime.is_some() || mtime.is_some() {
                self.fs.utimens(ino, time_or_now_to_update(atime), time_or_now_to_update(mtime)).await?;
            }
            self.fs.getattr(ino).await
        };
        match self.block_on(fut) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(attr)),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.block_on(self.fs.readlink(ino)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn mknod(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, _rdev: u32, reply: ReplyEntry) {
        let name = match name_to_str(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let fut = async {
            let ino = self.fs.mknod(parent, name).await?;
            self.fs.getattr(ino).await
        };
        match self.block_on(fut) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(attr), 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let name = match name_to_str(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let fut = async {
            let ino = self.fs.mkdir(parent, name).await?;
            self.fs.getattr(ino).await
        };
        match self.block_on(fut) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(attr), 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_to_str(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        match self.block_on(self.fs.unlink(parent, name)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_to_str(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        match self.block_on(self.fs.rmdir(parent, name)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn symlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, target: &std::path::Path, reply: ReplyEntry) {
        let name = match name_to_str(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let target = match target.to_str() {
            Some(target) => target,
            None => return reply.error(libc::EINVAL),
        };
        let fut = async {
            let ino = self.fs.symlink(parent, name, target).await?;
            self.fs.getattr(ino).await
        };
        match self.block_on(fut) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(attr), 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, new_name) = match (name_to_str(name), name_to_str(new_name)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(libc::EINVAL),
        };
        match self.block_on(self.fs.rename(parent, name, new_parent, new_name)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, new_parent: u64, new_name: &OsStr, reply: ReplyEntry) {
        let new_name = match name_to_str(new_name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let fut = async {
            let new_ino = self.fs.link(ino, new_parent, new_name).await?;
            self.fs.getattr(new_ino).await
        };
        match self.block_on(fut) {
            Ok(attr) => reply.entry(&ATTR_TTL, &to_file_attr(attr), 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let write_requested = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        match self.block_on(self.fs.open(ino, write_requested)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.block_on(self.fs.read(fh, offset.max(0) as u64, size)) {
            Ok(bytes) => reply.data(&bytes),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.block_on(self.fs.write(fh, offset.max(0) as u64, data)) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.block_on(self.fs.flush(fh)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.block_on(self.fs.release(fh, ino)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.block_on(self.fs.fsync(fh, datasync)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.block_on(self.fs.opendir(ino)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let entries = match self.block_on(self.fs.readdir(ino)) {
            Ok(entries) => entries,
            Err(err) => return reply.error(err.to_errno()),
        };
        for (index, entry) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            let kind = if entry.is_dir { FileType::Directory } else { FileType::RegularFile };
            if reply.add(entry.ino, (index + 1) as i64, kind, entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.block_on(self.fs.releasedir(ino)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok()
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // spec §1 Non-goals: capacity accounting is not modeled; report a
        // permissive, static statfs the way `original_source/src/mount.c`'s
        // `wimfs_statfs` does.
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.block_on(self.fs.access(ino, mask)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn create(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, flags: i32, reply: ReplyCreate) {
        let name = match name_to_str(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let _ = flags;
        let fut = async {
            let (ino, fh) = self.fs.create(parent, name).await?;
            let attr = self.fs.getattr(ino).await?;
            Ok::<_, WimFsError>((attr, fh))
        };
        match self.block_on(fut) {
            Ok((attr, fh)) => reply.created(&ATTR_TTL, &to_file_attr(attr), 0, fh, 0),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = match name_to_str(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        match self.block_on(self.fs.set_xattr(ino, name, value)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let name = match name_to_str(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        match self.block_on(self.fs.get_xattr(ino, name)) {
            Ok(bytes) if size == 0 => reply.size(bytes.len() as u32),
            Ok(bytes) if bytes.len() as u32 <= size => reply.data(&bytes),
            Ok(_) => reply.error(libc::ERANGE),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.block_on(self.fs.list_xattr(ino)) {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                if size == 0 {
                    reply.size(buf.len() as u32)
                } else if buf.len() as u32 <= size {
                    reply.data(&buf)
                } else {
                    reply.error(libc::ERANGE)
                }
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_to_str(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        match self.block_on(self.fs.remove_xattr(ino, name)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }
}
