//! Semaphore behavior: counting laws, direct handoff, priority wake order.
use std::sync::Mutex;

use corax_kernel::{error::PollSemaphoreError, task, Semaphore, Task, INFINITE};
use corax_port_std as port;

port::use_port!(unsafe struct SystemTraits);
corax_kernel::configure_kernel! {
    SystemTraits {
        startup_hook: startup,
        time_slice: 0,
    }
}

static SEM: Semaphore<SystemTraits> = Semaphore::new(0, 2);
static GATE: Semaphore<SystemTraits> = Semaphore::new(0, 1);

static CONTROL: Task<SystemTraits> = Task::new(1, control_body, 0);
static WAITER_LO: Task<SystemTraits> = Task::new(2, waiter_body, 0);
static WAITER_HI: Task<SystemTraits> = Task::new(3, waiter_body, 1);

static LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn log(entry: &str) {
    LOG.lock().unwrap().push(entry.to_string());
}

fn startup() {
    CONTROL.start().unwrap();
}

fn waiter_body(id: usize) {
    SEM.wait().unwrap();
    log(&format!("woken {id}"));
    GATE.give().unwrap();
    let _ = task::exit_task::<SystemTraits>();
}

fn control_body(_: usize) {
    // An empty semaphore polls as `Timeout` and leaves no trace.
    assert_eq!(SEM.take(), Err(PollSemaphoreError::Timeout));
    assert_eq!(SEM.value().unwrap(), 0);

    // give-then-take with no waiters leaves the count unchanged.
    SEM.give().unwrap();
    assert_eq!(SEM.value().unwrap(), 1);
    SEM.take().unwrap();
    assert_eq!(SEM.value().unwrap(), 0);

    // The count saturates at the limit.
    SEM.give().unwrap();
    SEM.give().unwrap();
    assert!(SEM.give().is_err());
    assert_eq!(SEM.value().unwrap(), 2);
    SEM.take().unwrap();
    SEM.take().unwrap();

    // Both waiters block (they start at higher priorities, so they run and
    // block as soon as they are started).
    WAITER_LO.start().unwrap();
    WAITER_HI.start().unwrap();

    // A give hands the permit to the highest-priority waiter first, without
    // touching the count.
    SEM.give().unwrap();
    GATE.wait_for(INFINITE).unwrap();
    SEM.give().unwrap();
    GATE.wait_for(INFINITE).unwrap();
    assert_eq!(SEM.value().unwrap(), 0);

    {
        let log = LOG.lock().unwrap();
        assert_eq!(*log, ["woken 1", "woken 0"]);
    }

    port::shutdown::<SystemTraits>();
    let _ = task::exit_task::<SystemTraits>();
}

#[test]
fn semaphore_laws() {
    SystemTraits::port_boot();
}
