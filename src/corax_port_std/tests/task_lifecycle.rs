//! Task lifecycle: join, entry restart, flip, and the
//! set-priority/inheritance boundary.
use std::time::{Duration, Instant};

fn spin_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

mod lifecycle {
    use super::spin_until;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use corax_kernel::{task, Semaphore, Task};
    use corax_port_std as port;

    port::use_port!(unsafe struct SystemTraits);
    corax_kernel::configure_kernel! {
        SystemTraits {
            startup_hook: startup,
            time_slice: 0,
        }
    }

    static SHORT_LIVED: Task<SystemTraits> = Task::new(2, short_lived_body, 0);
    static RESTARTER: Task<SystemTraits> = Task::new(2, restarter_body, 0);
    static FLIPPER: Task<SystemTraits> = Task::new(2, flipper_body, 0);
    static CONTROL: Task<SystemTraits> = Task::new(4, control_body, 0);

    static GO_RESTART: Semaphore<SystemTraits> = Semaphore::new(0, 4);

    static SHORT_RUNS: AtomicU32 = AtomicU32::new(0);
    static RESTART_RUNS: AtomicU32 = AtomicU32::new(0);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn log(entry: &'static str) {
        LOG.lock().unwrap().push(entry);
    }

    fn logged(entry: &'static str) -> bool {
        LOG.lock().unwrap().contains(&entry)
    }

    fn startup() {
        CONTROL.start().unwrap();
    }

    fn short_lived_body(_: usize) {
        SHORT_RUNS.fetch_add(1, Ordering::SeqCst);
        let _ = task::exit_task::<SystemTraits>();
    }

    fn restarter_body(_: usize) {
        RESTART_RUNS.fetch_add(1, Ordering::SeqCst);
        GO_RESTART.wait().unwrap();
        // Returning from the entry function re-enters it.
    }

    fn flipped_body(_: usize) {
        log("flipped entry ran");
        let _ = task::exit_task::<SystemTraits>();
    }

    fn flipper_body(_: usize) {
        log("flipper first entry");
        let _ = task::flip::<SystemTraits>(flipped_body, 0);
        unreachable!("flip does not return on success");
    }

    fn control_body(_: usize) {
        // Joining a task observes its termination; the static slot stays
        // restartable afterwards.
        SHORT_LIVED.start().unwrap();
        SHORT_LIVED.join().unwrap();
        SHORT_LIVED.start().unwrap();
        SHORT_LIVED.join().unwrap();
        assert_eq!(SHORT_RUNS.load(Ordering::SeqCst), 2);
        log("joined short-lived");

        // Joining a running task blocks; self-join would deadlock.
        assert!(CONTROL.join().is_err());

        // Feed the restarter two passes; returning from its entry function
        // re-enters it, so it eventually blocks inside its third run.
        RESTARTER.start().unwrap();
        GO_RESTART.give().unwrap();
        GO_RESTART.give().unwrap();

        // `flip` replaces the entry and restarts the task. Joining the
        // flipper also yields the processor to the restarter above.
        FLIPPER.start().unwrap();
        FLIPPER.join().unwrap();
        assert!(RESTART_RUNS.load(Ordering::SeqCst) >= 2);

        task::yield_now::<SystemTraits>().unwrap();

        log("lifecycle done");
        port::shutdown::<SystemTraits>();
        let _ = task::exit_task::<SystemTraits>();
    }

    #[test]
    fn lifecycle() {
        let booter = std::thread::spawn(SystemTraits::port_boot);
        spin_until("lifecycle done", || logged("lifecycle done"));

        assert!(logged("joined short-lived"));
        assert!(logged("flipper first entry"));
        assert!(logged("flipped entry ran"));
        assert!(RESTART_RUNS.load(Ordering::SeqCst) >= 2);

        booter.join().unwrap();
    }
}

mod priority_boundary {
    use super::spin_until;
    use std::sync::Mutex;

    use corax_kernel::{
        mutex::{MutexProtocol, MutexType},
        task, Semaphore, Task,
    };
    use corax_port_std as port;

    port::use_port!(unsafe struct BoundaryTraits);
    corax_kernel::configure_kernel! {
        BoundaryTraits {
            startup_hook: startup,
            time_slice: 0,
        }
    }

    type Mtx = corax_kernel::Mutex<BoundaryTraits>;

    static M: Mtx = Mtx::new(MutexType::Normal, MutexProtocol::Inherit);
    static OWNER: Task<BoundaryTraits> = Task::new(2, owner_body, 0);
    static WAITER: Task<BoundaryTraits> = Task::new(3, waiter_body, 0);
    static GO: Semaphore<BoundaryTraits> = Semaphore::new(0, 4);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn log(entry: &'static str) {
        LOG.lock().unwrap().push(entry);
    }

    fn logged(entry: &'static str) -> bool {
        LOG.lock().unwrap().contains(&entry)
    }

    fn startup() {
        OWNER.start().unwrap();
    }

    fn owner_body(_: usize) {
        M.wait().unwrap();
        log("owner has M");
        GO.wait().unwrap();
        M.give().unwrap();
        log("owner released M");
        loop {
            let _ = task::suspend::<BoundaryTraits>();
        }
    }

    fn waiter_body(_: usize) {
        M.wait().unwrap();
        M.give().unwrap();
        log("waiter done");
        loop {
            let _ = task::suspend::<BoundaryTraits>();
        }
    }

    /// Lowering the base priority of a task that holds a mutex with a
    /// higher-priority waiter must not deflate the inherited effective
    /// priority until the release.
    #[test]
    fn set_priority_boundary_under_inheritance() {
        let booter = std::thread::spawn(BoundaryTraits::port_boot);

        spin_until("owner has M", || logged("owner has M"));
        WAITER.start().unwrap();
        spin_until("owner inherits 3", || {
            OWNER.effective_priority().unwrap() == 3
        });

        // Lower the base priority below everything; the effective priority
        // stays pinned by the waiter.
        OWNER.set_priority(1).unwrap();
        assert_eq!(OWNER.base_priority().unwrap(), 1);
        assert_eq!(OWNER.effective_priority().unwrap(), 3);

        // After the release, the new base priority shows through.
        GO.give().unwrap();
        spin_until("owner released M", || logged("owner released M"));
        spin_until("waiter done", || logged("waiter done"));
        assert_eq!(OWNER.effective_priority().unwrap(), 1);

        port::shutdown::<BoundaryTraits>();
        booter.join().unwrap();
    }
}
