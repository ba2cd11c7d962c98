/// Process-wide signal dispatch
///
/// OS signal handlers must be async-signal-safe, so the installed handler
/// does exactly one thing: set an atomic flag in a static table. Everything
/// user-visible happens later, from normal code paths that poll the flags.
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::types::{Result, RunError};

/// Exclusive upper bound of dispatchable signal numbers.
pub fn sig_max() -> i32 {
    #[cfg(target_os = "linux")]
    {
        libc::SIGRTMIN()
    }
    #[cfg(not(target_os = "linux"))]
    {
        libc::NSIG
    }
}

const TABLE_LEN: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const FLAG_INIT: AtomicBool = AtomicBool::new(false);
static RAISED: [AtomicBool; TABLE_LEN] = [FLAG_INIT; TABLE_LEN];
static INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn mark_raised(signum: libc::c_int) {
    if signum >= 0 && (signum as usize) < TABLE_LEN {
        RAISED[signum as usize].store(true, Ordering::SeqCst);
    }
}

/// Handle onto the raised flag for one registered signal.
#[derive(Clone, Copy, Debug)]
pub struct SignalFlag {
    signum: i32,
}

impl SignalFlag {
    pub fn signum(&self) -> i32 {
        self.signum
    }

    pub fn is_raised(&self) -> bool {
        RAISED[self.signum as usize].load(Ordering::SeqCst)
    }

    /// Read and clear the flag in one step.
    pub fn take(&self) -> bool {
        RAISED[self.signum as usize].swap(false, Ordering::SeqCst)
    }

    pub fn clear(&self) {
        RAISED[self.signum as usize].store(false, Ordering::SeqCst);
    }
}

struct Entry {
    previous: Option<SigAction>,
}

/// Routes OS signals to raised flags, preserving prior dispositions so an
/// `uninstall` puts everything back.
///
/// At most one dispatcher may be installed at any time; violating that is a
/// programmer error and asserts. `install` and `uninstall` are always
/// paired; dropping an installed dispatcher uninstalls it.
pub struct SignalDispatcher {
    entries: Vec<Option<Entry>>,
    installed: bool,
}

impl Default for SignalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalDispatcher {
    pub fn new() -> Self {
        let len = (sig_max() as usize).min(TABLE_LEN);
        let mut entries = Vec::new();
        entries.resize_with(len, || None);
        SignalDispatcher {
            entries,
            installed: false,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Register `signum` for dispatch and hand back its raised flag.
    ///
    /// If this dispatcher is currently installed, the OS-level handler is
    /// installed immediately; otherwise it is deferred until `install`.
    pub fn set(&mut self, signum: i32) -> Result<SignalFlag> {
        assert!(
            signum > 0 && (signum as usize) < self.entries.len(),
            "signal number out of range: {}",
            signum
        );
        if self.entries[signum as usize].is_some() {
            return Err(RunError::AlreadySet(format!("signal {}", signum)));
        }
        self.entries[signum as usize] = Some(Entry { previous: None });
        let flag = SignalFlag { signum };
        flag.clear();
        if self.installed {
            self.install_one(signum)?;
        }
        Ok(flag)
    }

    /// Become the process's dispatcher: install an OS handler for every
    /// registered signal, saving the previous dispositions.
    pub fn install(&mut self) -> Result<()> {
        let was_installed = INSTALLED.swap(true, Ordering::SeqCst);
        assert!(!was_installed, "a signal dispatcher is already installed");
        self.installed = true;
        for signum in 1..self.entries.len() as i32 {
            if self.entries[signum as usize].is_some() {
                self.install_one(signum)?;
            }
        }
        Ok(())
    }

    /// Restore every saved disposition and release the process-wide slot.
    pub fn uninstall(&mut self) -> Result<()> {
        assert!(self.installed, "dispatcher is not installed");
        for signum in 1..self.entries.len() as i32 {
            self.uninstall_one(signum)?;
        }
        self.installed = false;
        INSTALLED.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn install_one(&mut self, signum: i32) -> Result<()> {
        let signal = Signal::try_from(signum)
            .map_err(|_| RunError::Value(format!("bad signal number: {}", signum)))?;
        let action = SigAction::new(
            SigHandler::Handler(mark_raised),
            // No SA_RESTART: a pending flag must be able to interrupt a
            // sleeping reactor.
            SaFlags::empty(),
            SigSet::empty(),
        );
        let previous = unsafe { sigaction(signal, &action) }
            .map_err(|errno| RunError::from_errno("sigaction", errno))?;
        if let Some(entry) = &mut self.entries[signum as usize] {
            entry.previous = Some(previous);
        }
        Ok(())
    }

    fn uninstall_one(&mut self, signum: i32) -> Result<()> {
        let entry = match &mut self.entries[signum as usize] {
            Some(entry) => entry,
            None => return Ok(()),
        };
        if let Some(previous) = entry.previous.take() {
            let signal = Signal::try_from(signum)
                .map_err(|_| RunError::Value(format!("bad signal number: {}", signum)))?;
            unsafe { sigaction(signal, &previous) }
                .map_err(|errno| RunError::from_errno("sigaction", errno))?;
        }
        Ok(())
    }
}

impl Drop for SignalDispatcher {
    fn drop(&mut self) {
        if self.installed {
            let _ = self.uninstall();
        }
    }
}
