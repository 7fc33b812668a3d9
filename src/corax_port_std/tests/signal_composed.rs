//! Signal objects, per-task signal actions, and the composed primitives
//! (barrier, condition variable, reader-writer lock, once-flag, fast
//! mutex).
use std::time::{Duration, Instant};

fn spin_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

mod signal_object {
    use super::spin_until;
    use std::sync::Mutex;
    use std::time::Duration;

    use corax_kernel::{error::PollSignalError, task, Signal, Task};
    use corax_port_std as port;

    port::use_port!(unsafe struct SystemTraits);
    corax_kernel::configure_kernel! {
        SystemTraits {
            startup_hook: startup,
            time_slice: 0,
        }
    }

    // Signal 4 is sticky.
    static SIG: Signal<SystemTraits> = Signal::new(1 << 4);
    static WAITER: Task<SystemTraits> = Task::new(2, waiter_body, 0);
    static LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn log(entry: String) {
        LOG.lock().unwrap().push(entry);
    }

    fn logged(entry: &str) -> bool {
        LOG.lock().unwrap().iter().any(|e| e == entry)
    }

    fn startup() {
        WAITER.start().unwrap();
    }

    fn waiter_body(_: usize) {
        // Accept only signals 2 and 7.
        let signo = SIG.wait((1 << 2) | (1 << 7)).unwrap();
        log(format!("took {signo}"));
        loop {
            let _ = task::suspend::<SystemTraits>();
        }
    }

    #[test]
    fn signal_selection_and_stickiness() {
        let booter = std::thread::spawn(SystemTraits::port_boot);

        // A non-accepted signal leaves the waiter blocked.
        SIG.give(1).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(LOG.lock().unwrap().is_empty());

        // An accepted one is delivered to it directly.
        SIG.give(7).unwrap();
        spin_until("took 7", || logged("took 7"));

        // Pending signals are taken lowest-numbered first. (Signal 1 from
        // above is still pending; nobody accepted it.)
        SIG.give(5).unwrap();
        SIG.give(3).unwrap();
        assert_eq!(SIG.take(0), Ok(1));
        assert_eq!(SIG.take(0), Ok(3));
        assert_eq!(SIG.take(0), Ok(5));
        assert_eq!(SIG.take(0), Err(PollSignalError::Timeout));

        // ... and a sticky signal stays pending across takes.
        SIG.give(4).unwrap();
        assert_eq!(SIG.take(0), Ok(4));
        assert_eq!(SIG.take(0), Ok(4));
        SIG.clear(4).unwrap();
        assert_eq!(SIG.take(0), Err(PollSignalError::Timeout));

        port::shutdown::<SystemTraits>();
        booter.join().unwrap();
    }
}

mod task_signal_action {
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

    static TARGET: Task<SystemTraits> = Task::new(1, target_body, 0);
    static GATE: Semaphore<SystemTraits> = Semaphore::new(0, 4);
    static HANDLED: AtomicU32 = AtomicU32::new(0);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn logged(entry: &'static str) -> bool {
        LOG.lock().unwrap().contains(&entry)
    }

    fn startup() {
        TARGET.start().unwrap();
    }

    fn on_signal(signo: u32) {
        HANDLED.fetch_add(100 + signo, Ordering::SeqCst);
    }

    fn target_body(_: usize) {
        TARGET.set_signal_action(Some(on_signal)).unwrap();
        LOG.lock().unwrap().push("armed");

        // The pending signal is delivered in this task's context on the way
        // out of this blocking call.
        GATE.wait().unwrap();
        assert_eq!(HANDLED.load(Ordering::SeqCst), 103);
        LOG.lock().unwrap().push("handled");
        loop {
            let _ = task::suspend::<SystemTraits>();
        }
    }

    #[test]
    fn per_task_signal_delivery() {
        let booter = std::thread::spawn(SystemTraits::port_boot);
        spin_until("armed", || logged("armed"));

        TARGET.raise(3).unwrap();
        GATE.give().unwrap();

        spin_until("handled", || logged("handled"));
        assert_eq!(HANDLED.load(Ordering::SeqCst), 103);

        port::shutdown::<SystemTraits>();
        booter.join().unwrap();
    }
}

mod composed {
    use super::spin_until;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use corax_kernel::{
        sync::{Barrier, CondVar, FastMutex, OnceFlag, RwLock},
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
    use corax_kernel::mutex::{MutexProtocol, MutexType};

    static BARRIER: Barrier<SystemTraits> = Barrier::new(3);
    static CV: CondVar<SystemTraits> = CondVar::new();
    static CV_MUTEX: Mtx = Mtx::new(MutexType::Normal, MutexProtocol::None);
    static RW: RwLock<SystemTraits> = RwLock::new();
    static ONCE: OnceFlag<SystemTraits> = OnceFlag::new();
    static FAST: FastMutex<SystemTraits> = FastMutex::new();

    static T1: Task<SystemTraits> = Task::new(1, party_body, 1);
    static T2: Task<SystemTraits> = Task::new(2, party_body, 2);
    static T3: Task<SystemTraits> = Task::new(3, party_body, 3);

    static ARRIVED: AtomicU32 = AtomicU32::new(0);
    static RELEASED: AtomicU32 = AtomicU32::new(0);
    static ONCE_RUNS: AtomicU32 = AtomicU32::new(0);
    static CV_READY: AtomicU32 = AtomicU32::new(0);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn logged(entry: &'static str) -> bool {
        LOG.lock().unwrap().contains(&entry)
    }

    fn startup() {
        T1.start().unwrap();
        T2.start().unwrap();
        T3.start().unwrap();
    }

    fn run_once() {
        ONCE_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn party_body(id: usize) {
        // Everyone initializes through the once-flag; the function runs a
        // single time.
        ONCE.call_once(run_once).unwrap();

        // Rendezvous at the barrier.
        ARRIVED.fetch_add(1, Ordering::SeqCst);
        BARRIER.wait().unwrap();
        RELEASED.fetch_add(1, Ordering::SeqCst);

        // Shared reads are concurrent; the gate serializes writers.
        RW.read_lock().unwrap();
        RW.read_unlock().unwrap();

        FAST.wait().unwrap();
        FAST.give().unwrap();

        if id == 3 {
            // The highest-priority party waits on the condition variable;
            // one of the others notifies it.
            CV_MUTEX.wait().unwrap();
            CV_READY.store(1, Ordering::SeqCst);
            CV.wait(&CV_MUTEX).unwrap();
            CV_MUTEX.give().unwrap();
            LOG.lock().unwrap().push("cv woken");
        } else if id == 2 {
            while CV_READY.load(Ordering::SeqCst) == 0 {
                task::yield_now::<SystemTraits>().unwrap();
            }
            CV_MUTEX.wait().unwrap();
            CV.notify_one().unwrap();
            CV_MUTEX.give().unwrap();
            LOG.lock().unwrap().push("cv notified");
        }

        if id == 1 {
            // Exclusive writing still works after all the reading.
            RW.write_lock().unwrap();
            RW.write_unlock().unwrap();
            spin_wait_for_cv();
            LOG.lock().unwrap().push("composed done");
            port::shutdown::<SystemTraits>();
        }
        loop {
            let _ = task::suspend::<SystemTraits>();
        }
    }

    fn spin_wait_for_cv() {
        while !logged("cv woken") {
            task::yield_now::<SystemTraits>().unwrap();
        }
    }

    #[test]
    fn composed_primitives() {
        let booter = std::thread::spawn(SystemTraits::port_boot);
        spin_until("composed done", || logged("composed done"));

        assert_eq!(ONCE_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(ARRIVED.load(Ordering::SeqCst), 3);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 3);
        assert!(logged("cv notified"));
        assert!(logged("cv woken"));

        booter.join().unwrap();
    }
}
