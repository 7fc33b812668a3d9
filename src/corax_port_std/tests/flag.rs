//! Flag wait modes: All-mode accumulation and consumption, Protect mode,
//! give idempotence.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use corax_kernel::{
    error::PollFlagError,
    flag::FlagMode,
    task, Flag, Task,
};
use corax_port_std as port;

port::use_port!(unsafe struct SystemTraits);
corax_kernel::configure_kernel! {
    SystemTraits {
        startup_hook: startup,
        time_slice: 0,
    }
}

static FLAG: Flag<SystemTraits> = Flag::new(0);
static WAITER: Task<SystemTraits> = Task::new(2, waiter_body, 0);

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
    WAITER.start().unwrap();
}

fn waiter_body(_: usize) {
    log("waiting");
    // All-mode, consuming: both bits must arrive; they are consumed on the
    // way.
    FLAG.wait(0b0101, FlagMode::ALL).unwrap();
    log("satisfied");

    loop {
        let _ = task::suspend::<SystemTraits>();
    }
}

#[test]
fn flag_all_mode_consume() {
    let booter = std::thread::spawn(SystemTraits::port_boot);
    spin_until("waiting", || logged("waiting"));

    // One of the two bits does not wake the waiter, but is latched for it.
    FLAG.give(0b0001).unwrap();
    std::thread::sleep(Duration::from_millis(10));
    assert!(!logged("satisfied"));

    // The second bit completes the set.
    FLAG.give(0b0100).unwrap();
    spin_until("satisfied", || logged("satisfied"));

    // A consuming waiter leaves the flag clear.
    assert_eq!(FLAG.get().unwrap(), 0);

    // OR semantics: give is idempotent on the flag state.
    FLAG.give(0b1010).unwrap();
    FLAG.give(0b1010).unwrap();
    assert_eq!(FLAG.get().unwrap(), 0b1010);

    // Protect mode checks without consuming.
    FLAG.take(0b0010, FlagMode::PROTECT).unwrap();
    assert_eq!(FLAG.get().unwrap(), 0b1010);

    // Any-mode consuming take clears what it matched.
    FLAG.take(0b0010, FlagMode::empty()).unwrap();
    assert_eq!(FLAG.get().unwrap(), 0b1000);

    // No match: `Timeout`, and in Any mode nothing is consumed.
    assert_eq!(
        FLAG.take(0b0100, FlagMode::empty()),
        Err(PollFlagError::Timeout)
    );
    assert_eq!(FLAG.get().unwrap(), 0b1000);

    port::shutdown::<SystemTraits>();
    booter.join().unwrap();
}
