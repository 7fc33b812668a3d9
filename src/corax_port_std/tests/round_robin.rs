//! Round-robin fairness: three equal-priority tasks with a 10-tick slice
//! each run exactly 20 of 60 ticks, rotating in start order.
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use corax_kernel::Task;
use corax_port_std as port;

port::use_port!(unsafe struct SystemTraits);
corax_kernel::configure_kernel! {
    SystemTraits {
        startup_hook: startup,
        time_slice: 10,
    }
}

static TASK_A: Task<SystemTraits> = Task::new(1, busy_body, 0);
static TASK_B: Task<SystemTraits> = Task::new(1, busy_body, 1);
static TASK_C: Task<SystemTraits> = Task::new(1, busy_body, 2);

fn startup() {
    TASK_A.start().unwrap();
    TASK_B.start().unwrap();
    TASK_C.start().unwrap();
}

fn busy_body(_: usize) {
    // Spin forever; every checkpoint is a preemption point, like an
    // instruction boundary on real hardware.
    loop {
        port::checkpoint::<SystemTraits>();
    }
}

fn task_key(task: &'static Task<SystemTraits>) -> &'static str {
    if std::ptr::eq(task, &TASK_A) {
        "A"
    } else if std::ptr::eq(task, &TASK_B) {
        "B"
    } else if std::ptr::eq(task, &TASK_C) {
        "C"
    } else {
        "?"
    }
}

fn spin_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn round_robin_fairness() {
    let booter = std::thread::spawn(SystemTraits::port_boot);
    spin_until("first dispatch", || {
        matches!(
            corax_kernel::scheduled_task::<SystemTraits>(),
            Ok(Some(t)) if task_key(t) != "?"
        )
    });

    let mut ran_for: HashMap<&str, u32> = HashMap::new();
    let mut sequence = Vec::new();
    for _ in 0..60 {
        let current = corax_kernel::scheduled_task::<SystemTraits>()
            .unwrap()
            .unwrap();
        let key = task_key(current);
        *ran_for.entry(key).or_insert(0) += 1;
        if sequence.last() != Some(&key) {
            sequence.push(key);
        }

        port::advance::<SystemTraits>(1);
    }

    // 60 ticks, 10-tick slices: two full rotations in start order.
    assert_eq!(sequence, ["A", "B", "C", "A", "B", "C"]);
    for key in ["A", "B", "C"] {
        let ticks = ran_for[key];
        assert!(
            (19..=21).contains(&ticks),
            "task {key} ran for {ticks} of 60 ticks"
        );
    }

    port::shutdown::<SystemTraits>();
    booter.join().unwrap();
}
