//! Timer expiry: one-shot firing, drift-free periodic re-queueing, and the
//! joiner wait protocol.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use corax_kernel::{error::PollTimerError, task, Task, Timer};
use corax_port_std as port;

port::use_port!(unsafe struct SystemTraits);
corax_kernel::configure_kernel! {
    SystemTraits {
        startup_hook: startup,
        time_slice: 0,
    }
}

static ONE_SHOT: Timer<SystemTraits> = Timer::new(Some(one_shot_fired));
static PERIODIC: Timer<SystemTraits> = Timer::new(Some(periodic_fired));
static WAITER: Task<SystemTraits> = Task::new(1, waiter_body, 0);
static GO: corax_kernel::Semaphore<SystemTraits> = corax_kernel::Semaphore::new(0, 1);

static ONE_SHOT_FIRINGS: Mutex<Vec<u64>> = Mutex::new(Vec::new());
static PERIODIC_FIRINGS: Mutex<Vec<u64>> = Mutex::new(Vec::new());
static WAITER_LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn now() -> u64 {
    corax_kernel::time::<SystemTraits>().unwrap()
}

fn one_shot_fired() {
    ONE_SHOT_FIRINGS.lock().unwrap().push(now());
}

fn periodic_fired() {
    PERIODIC_FIRINGS.lock().unwrap().push(now());
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
    // A never-started timer cannot be waited for.
    assert_eq!(PERIODIC.take(), Err(PollTimerError::BadObjectState));
    WAITER_LOG.lock().unwrap().push("ready");

    // The test arms the timers before giving the go-ahead, so the wait
    // below either blocks until tick 100 or completes at once.
    GO.wait().unwrap();
    ONE_SHOT.wait().unwrap();
    assert_eq!(ONE_SHOT.take(), Ok(()));
    WAITER_LOG.lock().unwrap().push("one-shot observed");

    loop {
        let _ = task::suspend::<SystemTraits>();
    }
}

#[test]
fn timer_one_shot_and_periodic() {
    let booter = std::thread::spawn(SystemTraits::port_boot);
    spin_until("waiter ready", || {
        WAITER_LOG.lock().unwrap().contains(&"ready")
    });

    // Arm both timers at `now == 0`.
    ONE_SHOT.start(100, 0).unwrap();
    PERIODIC.start(100, 100).unwrap();
    GO.give().unwrap();

    // Unevenly-sized steps exercise the drift-free re-queue: expiries land
    // on exact multiples of the period no matter when ticks are processed.
    let mut t = 0u64;
    for step in [30u64, 30, 30, 30, 30, 30, 37, 30, 30, 23] {
        t += step;
        port::advance::<SystemTraits>(step);
        assert!(t == now());
    }
    assert_eq!(t, 300);

    assert_eq!(*ONE_SHOT_FIRINGS.lock().unwrap(), [120]);
    {
        let firings = PERIODIC_FIRINGS.lock().unwrap();
        // Scheduled for 100, 200, 300; each processed at the first tick at
        // or after its deadline.
        assert_eq!(firings.len(), 3);
        assert!(firings[0] >= 100 && firings[0] < 200, "{firings:?}");
        assert!(firings[1] >= 200 && firings[1] < 300, "{firings:?}");
        assert_eq!(firings[2], 300, "{firings:?}");
    }

    spin_until("one-shot observed", || {
        WAITER_LOG.lock().unwrap().contains(&"one-shot observed")
    });

    // A one-shot that already fired reports success without waiting.
    assert_eq!(ONE_SHOT.take(), Ok(()));

    port::shutdown::<SystemTraits>();
    booter.join().unwrap();
}
