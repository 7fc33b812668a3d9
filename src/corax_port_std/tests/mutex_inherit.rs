//! Priority inheritance across a chain of mutexes.
//!
//! Tasks at priorities {1, 2, 3}: task-1 acquires `A`; task-2 acquires `B`
//! and then waits on `A`; task-3 waits on `B`. The inheritance chain must
//! raise both owners to priority 3, and deflate stepwise as the chain
//! unwinds.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use corax_kernel::{
    mutex::{MutexProtocol, MutexType},
    task, Semaphore, Task,
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

static A: Mtx = Mtx::new(MutexType::Normal, MutexProtocol::Inherit);
static B: Mtx = Mtx::new(MutexType::Normal, MutexProtocol::Inherit);

static GO1: Semaphore<SystemTraits> = Semaphore::new(0, 8);
static GO2: Semaphore<SystemTraits> = Semaphore::new(0, 8);
static GO3: Semaphore<SystemTraits> = Semaphore::new(0, 8);

static T1: Task<SystemTraits> = Task::new(1, t1_body, 0);
static T2: Task<SystemTraits> = Task::new(2, t2_body, 0);
static T3: Task<SystemTraits> = Task::new(3, t3_body, 0);

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

fn park_forever() -> ! {
    loop {
        let _ = task::suspend::<SystemTraits>();
    }
}

fn startup() {
    T1.start().unwrap();
    T2.start().unwrap();
    T3.start().unwrap();
}

fn t1_body(_: usize) {
    GO1.wait().unwrap();
    A.wait().unwrap();
    log("t1 has A");
    GO1.wait().unwrap();
    A.give().unwrap();
    log("t1 released A");
    park_forever();
}

fn t2_body(_: usize) {
    GO2.wait().unwrap();
    B.wait().unwrap();
    log("t2 has B");
    A.wait().unwrap();
    log("t2 has A");
    GO2.wait().unwrap();
    B.give().unwrap();
    log("t2 released B");
    park_forever();
}

fn t3_body(_: usize) {
    GO3.wait().unwrap();
    B.wait().unwrap();
    log("t3 has B");
    park_forever();
}

#[test]
fn priority_inheritance_chain_of_three() {
    let booter = std::thread::spawn(SystemTraits::port_boot);
    spin_until("boot", || {
        corax_kernel::scheduled_task::<SystemTraits>()
            .map(|t| t.is_some())
            .unwrap_or(false)
    });

    // task-1 acquires A.
    GO1.give().unwrap();
    spin_until("t1 has A", || logged("t1 has A"));
    assert_eq!(T1.effective_priority().unwrap(), 1);

    // task-2 acquires B, then blocks on A; task-1 inherits priority 2.
    GO2.give().unwrap();
    spin_until("t1 inherits 2", || T1.effective_priority().unwrap() == 2);
    assert!(logged("t2 has B"));
    assert_eq!(T2.effective_priority().unwrap(), 2);

    // task-3 blocks on B; the raise propagates along the chain.
    GO3.give().unwrap();
    spin_until("t2 inherits 3", || T2.effective_priority().unwrap() == 3);
    spin_until("t1 inherits 3", || T1.effective_priority().unwrap() == 3);

    // task-1 releases A: its priority is restored, task-2 takes A over but
    // stays raised through B's waiter.
    GO1.give().unwrap();
    spin_until("t1 released A", || logged("t1 released A"));
    spin_until("t2 has A", || logged("t2 has A"));
    assert_eq!(T1.effective_priority().unwrap(), 1);
    assert_eq!(T2.effective_priority().unwrap(), 3);

    // task-2 releases B: the chain is gone, and task-3 owns B.
    GO2.give().unwrap();
    spin_until("t2 released B", || logged("t2 released B"));
    spin_until("t3 has B", || logged("t3 has B"));
    assert_eq!(T2.effective_priority().unwrap(), 2);
    assert_eq!(T3.effective_priority().unwrap(), 3);

    port::shutdown::<SystemTraits>();
    booter.join().unwrap();
}
