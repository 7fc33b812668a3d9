//! Event queues and job queues.
use std::time::{Duration, Instant};

fn spin_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

mod event_queue {
    use super::spin_until;
    use std::sync::Mutex;

    use corax_kernel::{error::TrySendError, task, BufferStorage, EventQueue, Task};
    use corax_port_std as port;

    port::use_port!(unsafe struct SystemTraits);
    corax_kernel::configure_kernel! {
        SystemTraits {
            startup_hook: startup,
            time_slice: 0,
        }
    }

    static SLOTS: BufferStorage<u32, 2> = BufferStorage::new();
    static EVQ: EventQueue<SystemTraits> = EventQueue::new(SLOTS.as_cells());

    static SENDER: Task<SystemTraits> = Task::new(2, sender_body, 0);
    static CONTROL: Task<SystemTraits> = Task::new(1, control_body, 0);

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn logged(entry: &'static str) -> bool {
        LOG.lock().unwrap().contains(&entry)
    }

    fn startup() {
        SENDER.start().unwrap();
        CONTROL.start().unwrap();
    }

    fn sender_body(_: usize) {
        EVQ.give(10).unwrap();
        EVQ.give(20).unwrap();
        // The queue is full; this send blocks until a receive frees a slot.
        LOG.lock().unwrap().push("sender blocking");
        EVQ.send(30).unwrap();
        LOG.lock().unwrap().push("sender resumed");
        loop {
            let _ = task::suspend::<SystemTraits>();
        }
    }

    fn control_body(_: usize) {
        // FIFO, with the blocked sender's event admitted by the receive.
        assert_eq!(EVQ.recv(), Ok(10));
        assert_eq!(EVQ.recv(), Ok(20));
        assert_eq!(EVQ.recv(), Ok(30));
        assert_eq!(EVQ.count().unwrap(), 0);

        // `push` overwrites the oldest event.
        EVQ.give(1).unwrap();
        EVQ.give(2).unwrap();
        assert_eq!(EVQ.give(3), Err(TrySendError::Timeout));
        EVQ.push(3).unwrap();
        assert_eq!(EVQ.recv(), Ok(2));
        assert_eq!(EVQ.recv(), Ok(3));

        LOG.lock().unwrap().push("events done");
        port::shutdown::<SystemTraits>();
        let _ = task::exit_task::<SystemTraits>();
    }

    #[test]
    fn event_queue() {
        let booter = std::thread::spawn(SystemTraits::port_boot);
        spin_until("events done", || logged("events done"));
        assert!(logged("sender resumed"));
        booter.join().unwrap();
    }
}

mod job_queue {
    use super::spin_until;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use corax_kernel::{task, BufferStorage, JobQueue, Task};
    use corax_port_std as port;

    port::use_port!(unsafe struct SystemTraits);
    corax_kernel::configure_kernel! {
        SystemTraits {
            startup_hook: startup,
            time_slice: 0,
        }
    }

    static SLOTS: BufferStorage<Option<fn()>, 4> = BufferStorage::new();
    static JOBQ: JobQueue<SystemTraits> = JobQueue::new(SLOTS.as_cells());

    static WORKER: Task<SystemTraits> = Task::new(1, worker_body, 0);
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn logged(entry: &'static str) -> bool {
        LOG.lock().unwrap().contains(&entry)
    }

    fn startup() {
        WORKER.start().unwrap();
    }

    fn bump_one() {
        COUNTER.fetch_add(1, Ordering::SeqCst);
    }

    fn bump_ten() {
        COUNTER.fetch_add(10, Ordering::SeqCst);
    }

    fn worker_body(_: usize) {
        // Execute exactly three jobs, in submission order.
        JOBQ.process().unwrap();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 1);
        JOBQ.process().unwrap();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 11);
        let job = JOBQ.recv().unwrap();
        job();
        assert_eq!(COUNTER.load(Ordering::SeqCst), 12);

        LOG.lock().unwrap().push("jobs done");
        port::shutdown::<SystemTraits>();
        let _ = task::exit_task::<SystemTraits>();
    }

    #[test]
    fn job_queue() {
        let booter = std::thread::spawn(SystemTraits::port_boot);

        JOBQ.give(bump_one).unwrap();
        JOBQ.give(bump_ten).unwrap();
        JOBQ.give(bump_one).unwrap();

        spin_until("jobs done", || logged("jobs done"));
        assert_eq!(COUNTER.load(Ordering::SeqCst), 12);
        booter.join().unwrap();
    }
}
