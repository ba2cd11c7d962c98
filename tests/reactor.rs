//! Reactor and signal-dispatch tests.
//!
//! The dispatcher is a process-wide singleton, so every test that installs
//! one (including every `Reactor::new`) runs under a shared lock.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use runbox::reactor::Reactor;
use runbox::signal::SignalDispatcher;
use runbox::spec::{FdHandlerSpec, ProgramSpec};
use runbox::types::RunError;

static INSTALL_LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    INSTALL_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let _guard = serial();
    let mut reactor = Reactor::new().unwrap();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let now = Instant::now();
    for delay_ms in [30u64, 10, 20] {
        let fired = Rc::clone(&fired);
        reactor.add_timer(now + Duration::from_millis(delay_ms), move || {
            fired.borrow_mut().push(delay_ms);
        });
    }
    while !reactor.is_empty() {
        reactor.run(true).unwrap();
    }
    assert_eq!(*fired.borrow(), vec![10, 20, 30]);
}

#[test]
fn test_equal_deadlines_keep_insertion_order() {
    let _guard = serial();
    let mut reactor = Reactor::new().unwrap();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let deadline = Instant::now() - Duration::from_millis(1);
    for label in 1..=3u32 {
        let fired = Rc::clone(&fired);
        reactor.add_timer(deadline, move || fired.borrow_mut().push(label));
    }
    assert_eq!(reactor.run(false).unwrap(), 3);
    assert_eq!(*fired.borrow(), vec![1, 2, 3]);
}

#[test]
fn test_run_without_sleep_and_no_ready_work() {
    let _guard = serial();
    let mut reactor = Reactor::new().unwrap();
    reactor.add_timer(Instant::now() + Duration::from_secs(3600), || {
        panic!("must not fire")
    });
    assert_eq!(reactor.run(false).unwrap(), 0);
    assert!(!reactor.is_empty());
}

#[test]
fn test_set_signal_rejects_sigchld() {
    let _guard = serial();
    let mut reactor = Reactor::new().unwrap();
    let result = reactor.set_signal(Signal::SIGCHLD as i32, || {});
    assert!(matches!(result, Err(RunError::Value(_))));
}

#[test]
fn test_duplicate_wait_registration_fails() {
    let _guard = serial();
    let mut reactor = Reactor::new().unwrap();
    let pid = nix::unistd::Pid::from_raw(999_999);
    reactor.set_wait(pid, || {}).unwrap();
    assert!(matches!(
        reactor.set_wait(pid, || {}),
        Err(RunError::AlreadySet(_))
    ));
}

#[test]
fn test_duplicate_signal_registration_fails() {
    let _guard = serial();
    let mut reactor = Reactor::new().unwrap();
    reactor.set_signal(Signal::SIGUSR2 as i32, || {}).unwrap();
    assert!(matches!(
        reactor.set_signal(Signal::SIGUSR2 as i32, || {}),
        Err(RunError::AlreadySet(_))
    ));
}

#[test]
fn test_user_signal_callback_runs_from_reactor() {
    let _guard = serial();
    let mut reactor = Reactor::new().unwrap();
    let seen = Rc::new(RefCell::new(0u32));
    {
        let seen = Rc::clone(&seen);
        reactor
            .set_signal(Signal::SIGUSR1 as i32, move || *seen.borrow_mut() += 1)
            .unwrap();
    }
    raise(Signal::SIGUSR1).unwrap();
    assert_eq!(reactor.run(false).unwrap(), 1);
    assert_eq!(*seen.borrow(), 1);
    // Not raised again; nothing further fires.
    assert_eq!(reactor.run(false).unwrap(), 0);
}

#[test]
fn test_timers_and_child_completion_ordering() {
    let _guard = serial();
    let mut reactor = Reactor::new().unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));
    let started = Instant::now();

    let spec = ProgramSpec {
        executable: PathBuf::from("/bin/sleep"),
        args: vec!["0.05".to_string()],
        stdin: FdHandlerSpec::Null,
        ..Default::default()
    };
    let mut child = spec.start().unwrap();
    let pid = child.pid();

    for delay_ms in [10u64, 30, 20] {
        let events = Rc::clone(&events);
        reactor.add_timer(started + Duration::from_millis(delay_ms), move || {
            events.borrow_mut().push(format!("timer-{}", delay_ms));
        });
    }
    {
        let events = Rc::clone(&events);
        reactor
            .set_wait(pid, move || {
                assert!(child.is_done().unwrap());
                let result = child.get_result().unwrap();
                assert_eq!(result.get("status").unwrap(), "0");
                events.borrow_mut().push("child".to_string());
            })
            .unwrap();
    }

    while !reactor.is_empty() {
        reactor.run(true).unwrap();
    }

    assert_eq!(
        *events.borrow(),
        vec!["timer-10", "timer-20", "timer-30", "child"]
    );
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_dispatcher_restores_previous_disposition() {
    let _guard = serial();

    // Give SIGWINCH a known disposition to restore.
    let probe = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGWINCH, &probe) }.unwrap();

    let mut dispatcher = SignalDispatcher::new();
    let flag = dispatcher.set(Signal::SIGWINCH as i32).unwrap();
    dispatcher.install().unwrap();
    raise(Signal::SIGWINCH).unwrap();
    assert!(flag.take());
    dispatcher.uninstall().unwrap();

    // Querying the disposition means re-installing the probe; the value it
    // displaces must be what the dispatcher restored.
    let observed = unsafe { sigaction(Signal::SIGWINCH, &probe) }.unwrap();
    assert!(matches!(observed.handler(), SigHandler::SigIgn));
}

#[test]
fn test_dropping_installed_dispatcher_releases_slot() {
    let _guard = serial();
    {
        let mut dispatcher = SignalDispatcher::new();
        dispatcher.set(Signal::SIGUSR1 as i32).unwrap();
        dispatcher.install().unwrap();
    }
    // The slot is free again, so a second install works.
    let mut next = SignalDispatcher::new();
    next.set(Signal::SIGUSR1 as i32).unwrap();
    next.install().unwrap();
    next.uninstall().unwrap();
}
