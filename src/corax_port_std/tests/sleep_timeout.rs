//! Delay-space boundaries: IMMEDIATE, INFINITE, timed sleeps, and wait
//! timeouts.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use corax_kernel::{
    error::{PollSemaphoreError, WaitSemaphoreTimeoutError},
    task, Semaphore, Task, IMMEDIATE, INFINITE,
};
use corax_port_std as port;

port::use_port!(unsafe struct SystemTraits);
corax_kernel::configure_kernel! {
    SystemTraits {
        startup_hook: startup,
        time_slice: 0,
    }
}

static SEM: Semaphore<SystemTraits> = Semaphore::new(0, 1);
static FOREVER: Semaphore<SystemTraits> = Semaphore::new(0, 1);

static SLEEPER: Task<SystemTraits> = Task::new(1, sleeper_body, 0);
static FOREVER_WAITER: Task<SystemTraits> = Task::new(2, forever_body, 0);

static LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn log(entry: String) {
    LOG.lock().unwrap().push(entry);
}

fn logged(entry: &str) -> bool {
    LOG.lock().unwrap().iter().any(|e| e == entry)
}

fn now() -> u64 {
    corax_kernel::time::<SystemTraits>().unwrap()
}

fn spin_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn startup() {
    FOREVER_WAITER.start().unwrap();
    SLEEPER.start().unwrap();
}

fn forever_body(_: usize) {
    // An INFINITE wait never times out spontaneously.
    log("forever: blocking".to_string());
    FOREVER.wait_for(INFINITE).unwrap();
    log("forever: woken".to_string());
    loop {
        let _ = task::suspend::<SystemTraits>();
    }
}

fn sleeper_body(_: usize) {
    // An IMMEDIATE delay on a would-block operation reports `Timeout`
    // without touching any queue.
    assert_eq!(
        SEM.wait_for(IMMEDIATE),
        Err(WaitSemaphoreTimeoutError::Timeout)
    );
    // ... so a subsequent give lands in the counter, not in a waiter.
    SEM.give().unwrap();
    assert_eq!(SEM.value().unwrap(), 1);
    SEM.take().unwrap();

    // A zero-length sleep returns at once.
    task::sleep_for::<SystemTraits>(IMMEDIATE).unwrap();

    let start = now();
    task::sleep_for::<SystemTraits>(25).unwrap();
    log(format!("slept {}", now() - start));

    let start = now();
    assert_eq!(
        SEM.wait_for(40),
        Err(WaitSemaphoreTimeoutError::Timeout)
    );
    log(format!("sem timeout {}", now() - start));

    // An absolute deadline in the past degenerates to IMMEDIATE.
    assert_eq!(
        SEM.wait_until(now().saturating_sub(1)),
        Err(WaitSemaphoreTimeoutError::Timeout)
    );

    // A take on an empty semaphore is also just `Timeout`.
    assert_eq!(SEM.take(), Err(PollSemaphoreError::Timeout));

    log("sleeper done".to_string());
    loop {
        let _ = task::suspend::<SystemTraits>();
    }
}

#[test]
fn delay_boundaries() {
    let booter = std::thread::spawn(SystemTraits::port_boot);
    spin_until("forever blocked", || logged("forever: blocking"));

    // Drive time in single ticks until the sleeper has run its course; its
    // sleeps are measured relative to their own start, so the exact tick at
    // which it begins doesn't matter.
    let mut ticks = 0u32;
    while !logged("sleeper done") {
        assert!(ticks < 5000, "sleeper never finished");
        port::advance::<SystemTraits>(1);
        ticks += 1;
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(logged("slept 25"));
    assert!(logged("sem timeout 40"));

    // All those ticks of inactivity never woke the INFINITE waiter.
    assert!(!logged("forever: woken"));
    FOREVER.give().unwrap();
    spin_until("forever woken", || logged("forever: woken"));

    port::shutdown::<SystemTraits>();
    booter.join().unwrap();
}
