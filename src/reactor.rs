/// Single-threaded cooperative event reactor
///
/// Multiplexes three event sources on the calling thread: deadline timers,
/// user signals, and child-process completion. Blocking happens only inside
/// `run`, in a time-bounded `nanosleep` that pending signals interrupt.
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::signal::{SignalDispatcher, SignalFlag};
use crate::types::{Result, RunError};

/// Sleep bound when nothing at all is scheduled.
const IDLE_SLEEP: Duration = Duration::from_secs(86_400);
/// Sleep bound while child waits are pending. A SIGCHLD delivered to some
/// other thread sets the pending flag without interrupting this thread's
/// nanosleep, so pending waits are re-polled at least this often.
const WAIT_POLL: Duration = Duration::from_millis(100);

type TimerCallback = Box<dyn FnOnce()>;
type WaitCallback = Box<dyn FnOnce()>;
type SignalCallback = Box<dyn FnMut()>;

struct Timer {
    deadline: Instant,
    callback: TimerCallback,
}

struct UserSignal {
    flag: SignalFlag,
    callback: SignalCallback,
}

pub struct Reactor {
    /// Pending timers in ascending deadline order; equal deadlines keep
    /// insertion order.
    timers: Vec<Timer>,
    waits: BTreeMap<libc::pid_t, WaitCallback>,
    signals: Vec<Option<UserSignal>>,
    sigchld: SignalFlag,
    dispatcher: SignalDispatcher,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let mut dispatcher = SignalDispatcher::new();
        let sigchld = dispatcher.set(Signal::SIGCHLD as i32)?;
        dispatcher.install()?;
        let mut signals = Vec::new();
        signals.resize_with(crate::signal::sig_max() as usize, || None);
        Ok(Reactor {
            timers: Vec::new(),
            waits: BTreeMap::new(),
            signals,
            sigchld,
            dispatcher,
        })
    }

    /// Schedule `callback` to run once `deadline` has passed.
    pub fn add_timer(&mut self, deadline: Instant, callback: impl FnOnce() + 'static) {
        let index = self.timers.partition_point(|t| t.deadline <= deadline);
        self.timers.insert(
            index,
            Timer {
                deadline,
                callback: Box::new(callback),
            },
        );
    }

    /// Run `callback` from the reactor loop each time `signum` is raised.
    ///
    /// SIGCHLD is reserved for completion dispatch and refused.
    pub fn set_signal(&mut self, signum: i32, callback: impl FnMut() + 'static) -> Result<()> {
        if signum == Signal::SIGCHLD as i32 {
            return Err(RunError::Value(
                "SIGCHLD is reserved for child completion".to_string(),
            ));
        }
        if signum <= 0 || signum as usize >= self.signals.len() {
            return Err(RunError::Value(format!(
                "signal number out of range: {}",
                signum
            )));
        }
        if self.signals[signum as usize].is_some() {
            return Err(RunError::AlreadySet(format!("signal {}", signum)));
        }
        let flag = self.dispatcher.set(signum)?;
        self.signals[signum as usize] = Some(UserSignal {
            flag,
            callback: Box::new(callback),
        });
        Ok(())
    }

    /// Run `callback` once the child with `pid` has completed.
    pub fn set_wait(&mut self, pid: Pid, callback: impl FnOnce() + 'static) -> Result<()> {
        if self.waits.contains_key(&pid.as_raw()) {
            return Err(RunError::AlreadySet(format!("pid {}", pid)));
        }
        self.waits.insert(pid.as_raw(), Box::new(callback));
        Ok(())
    }

    /// True when no timers, no waits, and no user signals remain.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
            && self.waits.is_empty()
            && self.signals.iter().all(Option::is_none)
    }

    /// One scheduling step; returns the number of callbacks fired.
    ///
    /// With `sleep` true, blocks until at least one callback has fired:
    /// until the earliest timer deadline, or in bounded intervals while
    /// only waits or signals are outstanding.
    pub fn run(&mut self, sleep: bool) -> Result<usize> {
        assert!(!self.is_empty());
        let mut num_done = self.handle_current()?;
        while sleep && num_done == 0 {
            let pause = if let Some(timer) = self.timers.first() {
                timer.deadline.saturating_duration_since(Instant::now())
            } else if !self.waits.is_empty() {
                WAIT_POLL
            } else {
                IDLE_SLEEP
            };
            nanosleep(pause)?;
            num_done += self.handle_current()?;
        }
        Ok(num_done)
    }

    /// Fire everything currently ready: raised signals first (ascending
    /// signal number), then overdue timers in deadline order.
    fn handle_current(&mut self) -> Result<usize> {
        let mut num_done = self.handle_signals()?;

        let now = Instant::now();
        let due = self.timers.partition_point(|t| t.deadline < now);
        for timer in self.timers.drain(..due) {
            (timer.callback)();
            num_done += 1;
        }
        Ok(num_done)
    }

    fn handle_signals(&mut self) -> Result<usize> {
        let mut num_done = 0;
        let sigchld = Signal::SIGCHLD as i32 as usize;
        for signum in 1..self.signals.len() {
            if signum == sigchld {
                if self.sigchld.take() {
                    num_done += self.handle_sigchld()?;
                }
                continue;
            }
            if let Some(signal) = &mut self.signals[signum] {
                if signal.flag.take() {
                    (signal.callback)();
                    num_done += 1;
                }
            }
        }
        Ok(num_done)
    }

    /// Probe every awaited child with a non-blocking, non-consuming wait;
    /// completed children fire their callback and leave the map. The zombie
    /// is left reapable for the callback's own result collection.
    fn handle_sigchld(&mut self) -> Result<usize> {
        let mut completed = Vec::new();
        for &pid in self.waits.keys() {
            loop {
                match waitid(
                    Id::Pid(Pid::from_raw(pid)),
                    WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT,
                ) {
                    Ok(WaitStatus::StillAlive) => break,
                    Ok(_) => {
                        completed.push(pid);
                        break;
                    }
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(RunError::from_errno("waitid", errno)),
                }
            }
        }
        let mut num_done = 0;
        for pid in completed {
            if let Some(callback) = self.waits.remove(&pid) {
                callback();
                num_done += 1;
            }
        }
        Ok(num_done)
    }
}

fn nanosleep(duration: Duration) -> Result<()> {
    let ts = libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };
    let rval = unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
    // EINTR means a signal probably has work for us; the caller re-drains.
    if rval == -1 && Errno::last() != Errno::EINTR {
        return Err(RunError::system("nanosleep"));
    }
    Ok(())
}
