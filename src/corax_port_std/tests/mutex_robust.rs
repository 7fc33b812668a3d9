//! Robust-mutex recovery, plus the mutex type/protocol lattice.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use corax_kernel::{
    error::{LockMutexError, TryLockMutexError},
    mutex::{MutexProtocol, MutexType},
    task, Task,
};
use corax_port_std as port;

port::use_port!(unsafe struct SystemTraits);
corax_kernel::configure_kernel! {
    SystemTraits {
        startup_hook: startup,
        time_slice: 0,
    }
}

type Mtx = corax_kernel::Mutex<SystemTraits>;

static ROBUST: Mtx = Mtx::new_robust(MutexType::Normal, MutexProtocol::Inherit);
static ERRORCHECK: Mtx = Mtx::new(MutexType::ErrorCheck, MutexProtocol::None);
static RECURSIVE: Mtx = Mtx::new(MutexType::Recursive, MutexProtocol::None);
static CEILED: Mtx = Mtx::new(MutexType::Normal, MutexProtocol::Ceiling(2));

static VICTIM: Task<SystemTraits> = Task::new(3, victim_body, 0);
static CONTROL: Task<SystemTraits> = Task::new(2, control_body, 0);
static HIGH: Task<SystemTraits> = Task::new(5, high_body, 0);

static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn log(entry: &'static str) {
    LOG.lock().unwrap().push(entry);
}

fn logged(entry: &'static str) -> bool {
    LOG.lock().unwrap().contains(&entry)
}

fn spin_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn startup() {
    VICTIM.start().unwrap();
}

fn victim_body(_: usize) {
    // Take the robust mutex and then hang on to it forever; the test
    // forcibly resets this task.
    ROBUST.wait().unwrap();
    log("victim holds robust");
    loop {
        let _ = task::suspend::<SystemTraits>();
    }
}

fn high_body(_: usize) {
    // Priority 5 exceeds the ceiling of 2.
    assert_eq!(CEILED.take(), Err(TryLockMutexError::BadParam));
    assert_eq!(CEILED.wait(), Err(LockMutexError::BadParam));
    log("ceiling rejected");
    let _ = task::exit_task::<SystemTraits>();
}

fn control_body(_: usize) {
    // The abandoned lock is acquired together with the `Abandoned` verdict.
    assert_eq!(ROBUST.wait(), Err(LockMutexError::Abandoned));

    // A normal release/acquire cycle afterwards is clean.
    ROBUST.give().unwrap();
    ROBUST.wait().unwrap();
    ROBUST.give().unwrap();
    log("robust recovered");

    // ErrorCheck reports a self-deadlock instead of hanging.
    ERRORCHECK.wait().unwrap();
    assert_eq!(ERRORCHECK.wait(), Err(LockMutexError::WouldDeadlock));
    assert_eq!(ERRORCHECK.give(), Ok(()));

    // A recursive mutex counts its acquisitions.
    RECURSIVE.wait().unwrap();
    RECURSIVE.wait().unwrap();
    RECURSIVE.wait().unwrap();
    RECURSIVE.give().unwrap();
    RECURSIVE.give().unwrap();
    assert!(RECURSIVE.is_locked().unwrap());
    RECURSIVE.give().unwrap();
    assert!(!RECURSIVE.is_locked().unwrap());

    // The ceiling protocol rejects over-ceiling acquirers outright.
    HIGH.start().unwrap();
    log("control done");
    port::shutdown::<SystemTraits>();
    let _ = task::exit_task::<SystemTraits>();
}

#[test]
fn robust_mutex_recovery() {
    let booter = std::thread::spawn(SystemTraits::port_boot);
    spin_until("victim holds robust", || logged("victim holds robust"));

    // Forcibly reset the holder; the robust mutex becomes inconsistent.
    VICTIM.reset().unwrap();

    // Only now start the recovering task.
    CONTROL.start().unwrap();

    spin_until("robust recovered", || logged("robust recovered"));
    spin_until("ceiling rejected", || logged("ceiling rejected"));
    spin_until("control done", || logged("control done"));

    booter.join().unwrap();
}
