/// Per-descriptor handlers for a child's standard file descriptors
///
/// Each handler binds one target descriptor to a backing source and knows how
/// to stage itself before `exec` (`start`), undo the staging for in-process
/// tooling use (`restore`), and release owned resources (`close`).
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::{close, dup, dup2, lseek, mkstemp, read, unlink, Whence};

use crate::types::{Result, RunError};

const CAPTURE_PREFIX: &str = "capture";

/// Open-mode set for the `file` handler kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub append: bool,
    pub truncate: bool,
}

impl OpenMode {
    pub fn read_only() -> Self {
        OpenMode {
            read: true,
            ..Default::default()
        }
    }

    pub fn read_write_create() -> Self {
        OpenMode {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    /// Compact letter encoding: one of `rwcat` per enabled flag, in that
    /// fixed order.
    pub fn as_str(&self) -> String {
        let mut s = String::new();
        for (flag, ch) in [
            (self.read, 'r'),
            (self.write, 'w'),
            (self.create, 'c'),
            (self.append, 'a'),
            (self.truncate, 't'),
        ] {
            if flag {
                s.push(ch);
            }
        }
        s
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut mode = OpenMode::default();
        for ch in s.chars() {
            match ch {
                'r' => mode.read = true,
                'w' => mode.write = true,
                'c' => mode.create = true,
                'a' => mode.append = true,
                't' => mode.truncate = true,
                _ => {
                    return Err(RunError::Value(format!(
                        "unknown open-mode flag {:?} in {:?}",
                        ch, s
                    )))
                }
            }
        }
        Ok(mode)
    }

    fn to_oflag(self) -> OFlag {
        let mut flags = match (self.read, self.write) {
            (_, false) => OFlag::O_RDONLY,
            (false, true) => OFlag::O_WRONLY,
            (true, true) => OFlag::O_RDWR,
        };
        if self.create {
            flags |= OFlag::O_CREAT;
        }
        if self.append {
            flags |= OFlag::O_APPEND;
        }
        if self.truncate {
            flags |= OFlag::O_TRUNC;
        }
        flags
    }
}

/// An anonymous buffer file: created with an `mkstemp` template and unlinked
/// immediately, so it persists only through the open descriptor.
///
/// The descriptor is marked close-on-exec at creation; a staged copy made
/// with `dup2` does not inherit the flag, so only the mapped standard
/// descriptor survives into the child image.
pub struct CaptureFile {
    fd: Option<OwnedFd>,
}

impl CaptureFile {
    pub fn create() -> Result<Self> {
        Self::create_in(&std::env::temp_dir())
    }

    pub fn create_in(dir: &Path) -> Result<Self> {
        let template = dir.join(format!("{}-XXXXXX", CAPTURE_PREFIX));
        let (fd, path) =
            mkstemp(&template).map_err(|errno| RunError::from_errno("mkstemp", errno))?;
        if let Err(errno) = unlink(&path) {
            let _ = close(fd);
            return Err(RunError::from_errno("unlink", errno));
        }
        if let Err(errno) = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
            let _ = close(fd);
            return Err(RunError::from_errno("fcntl", errno));
        }
        Ok(CaptureFile {
            fd: Some(unsafe { OwnedFd::from_raw_fd(fd) }),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    pub fn close(&mut self) {
        self.fd = None;
    }

    fn raw_fd(&self) -> Result<RawFd> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| RunError::Value("capture file already closed".to_string()))
    }

    /// Duplicate the buffer descriptor onto `target`.
    pub fn dup_onto(&self, target: RawFd) -> Result<()> {
        let fd = self.raw_fd()?;
        dup2(fd, target).map_err(|errno| RunError::from_errno("dup2", errno))?;
        Ok(())
    }

    /// Read everything written so far: rewind and read up to the size
    /// reported by `fstat`.
    pub fn read_all(&self) -> Result<String> {
        let fd = self.raw_fd()?;
        let stat = fstat(fd).map_err(|errno| RunError::from_errno("fstat", errno))?;
        let size = stat.st_size as usize;
        lseek(fd, 0, Whence::SeekSet).map_err(|errno| RunError::from_errno("lseek", errno))?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match read(fd, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(RunError::from_errno("read", errno)),
            }
        }
        buf.truncate(filled);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

enum HandlerKind {
    Leave,
    Close,
    Null,
    Capture { file: CaptureFile },
    Dup { from_fd: RawFd },
    File { path: CString, mode: OpenMode },
}

/// Runtime handler bound to a concrete target descriptor.
pub struct FdHandler {
    fd: RawFd,
    saved: Option<RawFd>,
    kind: HandlerKind,
}

impl FdHandler {
    pub fn leave(fd: RawFd) -> Self {
        Self::new(fd, HandlerKind::Leave)
    }

    pub fn close_target(fd: RawFd) -> Self {
        Self::new(fd, HandlerKind::Close)
    }

    pub fn null(fd: RawFd) -> Self {
        Self::new(fd, HandlerKind::Null)
    }

    pub fn capture(fd: RawFd) -> Result<Self> {
        let file = CaptureFile::create()?;
        Ok(Self::new(fd, HandlerKind::Capture { file }))
    }

    pub fn dup(fd: RawFd, from_fd: RawFd) -> Self {
        Self::new(fd, HandlerKind::Dup { from_fd })
    }

    pub fn file(fd: RawFd, path: &Path, mode: OpenMode) -> Result<Self> {
        let path_c = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| RunError::Value(format!("path contains NUL: {:?}", path)))?;
        Ok(Self::new(fd, HandlerKind::File { path: path_c, mode }))
    }

    fn new(fd: RawFd, kind: HandlerKind) -> Self {
        FdHandler {
            fd,
            saved: None,
            kind,
        }
    }

    pub fn target_fd(&self) -> RawFd {
        self.fd
    }

    /// Stage the handler onto its target descriptor.
    ///
    /// With `final_` false the previous descriptor is duplicated first so a
    /// later `restore` can put it back; the pre-`exec` path passes true and
    /// keeps nothing.
    pub fn start(&mut self, final_: bool) -> Result<()> {
        if !final_ && !matches!(self.kind, HandlerKind::Leave) {
            let saved = dup(self.fd).map_err(|errno| RunError::from_errno("dup", errno))?;
            self.saved = Some(saved);
        }
        match &self.kind {
            HandlerKind::Leave => Ok(()),
            HandlerKind::Close => {
                close(self.fd).map_err(|errno| RunError::from_errno("close", errno))
            }
            HandlerKind::Null => {
                let null_fd = open("/dev/null", OFlag::O_RDONLY, Mode::empty())
                    .map_err(|errno| RunError::from_errno("open", errno))?;
                let staged = dup2(null_fd, self.fd);
                let _ = close(null_fd);
                staged.map_err(|errno| RunError::from_errno("dup2", errno))?;
                Ok(())
            }
            HandlerKind::Capture { file } => file.dup_onto(self.fd),
            HandlerKind::Dup { from_fd } => {
                dup2(*from_fd, self.fd).map_err(|errno| RunError::from_errno("dup2", errno))?;
                Ok(())
            }
            HandlerKind::File { path, mode } => {
                let file_fd = open(
                    path.as_c_str(),
                    mode.to_oflag(),
                    Mode::from_bits_truncate(0o666),
                )
                .map_err(|errno| RunError::from_errno("open", errno))?;
                let staged = dup2(file_fd, self.fd);
                let _ = close(file_fd);
                staged.map_err(|errno| RunError::from_errno("dup2", errno))?;
                Ok(())
            }
        }
    }

    /// Put back the descriptor saved by a non-final `start`.
    pub fn restore(&mut self) -> Result<()> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| RunError::Value("nothing saved to restore".to_string()))?;
        let restored = dup2(saved, self.fd);
        let _ = close(saved);
        restored.map_err(|errno| RunError::from_errno("dup2", errno))?;
        Ok(())
    }

    /// Release owned auxiliary resources (the capture buffer descriptor).
    pub fn close(&mut self) {
        if let HandlerKind::Capture { file } = &mut self.kind {
            file.close();
        }
    }

    /// Captured bytes, if this is a capture handler.
    pub fn captured(&self) -> Option<Result<String>> {
        match &self.kind {
            HandlerKind::Capture { file } => Some(file.read_all()),
            _ => None,
        }
    }
}
