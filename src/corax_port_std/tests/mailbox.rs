//! Mailbox FIFO ordering, the rendezvous path, and `push` overwrite.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use corax_kernel::{task, BufferStorage, Mailbox, Semaphore, Task};
use corax_port_std as port;

port::use_port!(unsafe struct SystemTraits);
corax_kernel::configure_kernel! {
    SystemTraits {
        startup_hook: startup,
        time_slice: 0,
    }
}

// One two-byte record.
static BUF: BufferStorage<u8, 2> = BufferStorage::new();
static BOX1: Mailbox<SystemTraits> = Mailbox::new(BUF.as_cells(), 2);

static SENDER: Task<SystemTraits> = Task::new(2, sender_body, 0);
static RECEIVER: Task<SystemTraits> = Task::new(1, receiver_body, 0);
static GO: Semaphore<SystemTraits> = Semaphore::new(0, 4);

static LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn log(entry: String) {
    LOG.lock().unwrap().push(entry);
}

fn logged(entry: &str) -> bool {
    LOG.lock().unwrap().iter().any(|e| e == entry)
}

fn spin_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn startup() {
    SENDER.start().unwrap();
}

fn sender_body(_: usize) {
    // Fill the single slot, then block in the second send.
    BOX1.send(&[0x11, 0x22]).unwrap();
    log("sent first".to_string());
    BOX1.send(&[0xDE, 0xAD]).unwrap();
    log("sender resumed".to_string());

    loop {
        let _ = task::suspend::<SystemTraits>();
    }
}

fn receiver_body(_: usize) {
    GO.wait().unwrap();

    // FIFO: the buffered record comes out first...
    let mut rec = [0u8; 2];
    BOX1.recv(&mut rec).unwrap();
    log(format!("got {rec:02x?}"));

    // ...and the blocked sender's record is spliced into the ring by the
    // same receive, so the next one needs no further send.
    BOX1.recv(&mut rec).unwrap();
    log(format!("got {rec:02x?}"));
    assert_eq!(BOX1.count().unwrap(), 0);

    // `push` overwrites the oldest record when full.
    BOX1.give(&[0x01, 0x02]).unwrap();
    BOX1.push(&[0x03, 0x04]).unwrap();
    let mut rec = [0u8; 2];
    BOX1.recv(&mut rec).unwrap();
    assert_eq!(rec, [0x03, 0x04]);

    log("receiver done".to_string());
    port::shutdown::<SystemTraits>();
    let _ = task::exit_task::<SystemTraits>();
}

#[test]
fn mailbox_rendezvous() {
    let booter = std::thread::spawn(SystemTraits::port_boot);

    // Wait until the sender is parked in its second send.
    spin_until("sent first", || logged("sent first"));

    RECEIVER.start().unwrap();
    GO.give().unwrap();

    spin_until("receiver done", || logged("receiver done"));

    let log = LOG.lock().unwrap();
    let sender_resumed = log.iter().position(|e| e == "sender resumed").unwrap();
    let first_recv = log.iter().position(|e| e == "got [11, 22]").unwrap();
    assert!(log.iter().any(|e| e == "got [de, ad]"));
    // The blocked sender resumes once its record has been taken over.
    assert!(sender_resumed > first_recv);
    drop(log);

    booter.join().unwrap();
}
