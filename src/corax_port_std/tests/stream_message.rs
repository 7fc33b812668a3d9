//! Stream buffers (unframed) and message buffers (framed).
use std::time::{Duration, Instant};

fn spin_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

mod stream {
    use super::spin_until;
    use std::sync::Mutex;

    use corax_kernel::{
        error::{TryRecvError, TrySendError},
        task, BufferStorage, Semaphore, StreamBuffer, Task,
    };
    use corax_port_std as port;

    port::use_port!(unsafe struct SystemTraits);
    corax_kernel::configure_kernel! {
        SystemTraits {
            startup_hook: startup,
            time_slice: 0,
        }
    }

    static BUF: BufferStorage<u8, 8> = BufferStorage::new();
    static STM: StreamBuffer<SystemTraits> = StreamBuffer::new(BUF.as_cells());

    static SENDER: Task<SystemTraits> = Task::new(2, sender_body, 0);
    static CONTROL: Task<SystemTraits> = Task::new(1, control_body, 0);
    static GO: Semaphore<SystemTraits> = Semaphore::new(0, 4);

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn log(entry: &'static str) {
        LOG.lock().unwrap().push(entry);
    }

    fn logged(entry: &'static str) -> bool {
        LOG.lock().unwrap().contains(&entry)
    }

    fn startup() {
        SENDER.start().unwrap();
        CONTROL.start().unwrap();
    }

    fn sender_body(_: usize) {
        // 6 of 8 bytes fit; the next 4-byte send must wait for room.
        STM.give(&[1, 2, 3, 4, 5, 6]).unwrap();
        log("sent six");
        STM.send(&[7, 8, 9, 10]).unwrap();
        log("sent four more");
        loop {
            let _ = task::suspend::<SystemTraits>();
        }
    }

    fn control_body(_: usize) {
        GO.wait().unwrap();

        // The sender is parked. Reading three bytes makes room for its
        // whole pending send, which is admitted by the same receive.
        let mut buf = [0u8; 3];
        assert_eq!(STM.recv(&mut buf), Ok(3));
        assert_eq!(buf, [1, 2, 3]);

        // 3 remaining + 4 flushed-in bytes.
        assert_eq!(STM.count().unwrap(), 7);

        let mut buf = [0u8; 16];
        assert_eq!(STM.recv(&mut buf), Ok(7));
        assert_eq!(&buf[..7], &[4, 5, 6, 7, 8, 9, 10]);

        // Empty now; a poll is a clean timeout.
        assert_eq!(STM.take(&mut buf[..4]), Err(TryRecvError::Timeout));

        // An oversized send can never succeed.
        assert_eq!(
            STM.give(&[0; 9]),
            Err(TrySendError::BadParam)
        );

        // `push` discards the oldest bytes to make room.
        STM.give(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        STM.push(&[8, 9, 10]).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(STM.recv(&mut buf), Ok(8));
        assert_eq!(&buf[..8], &[3, 4, 5, 6, 7, 8, 9, 10]);

        log("stream done");
        port::shutdown::<SystemTraits>();
        let _ = task::exit_task::<SystemTraits>();
    }

    #[test]
    fn stream_buffer() {
        let booter = std::thread::spawn(SystemTraits::port_boot);
        spin_until("sent six", || logged("sent six"));
        GO.give().unwrap();
        spin_until("stream done", || logged("stream done"));
        assert!(logged("sent four more"));
        booter.join().unwrap();
    }
}

mod message {
    use super::spin_until;
    use std::sync::Mutex;

    use corax_kernel::{
        error::{TryRecvError, TrySendError},
        task, BufferStorage, MessageBuffer, Task,
    };
    use corax_port_std as port;

    port::use_port!(unsafe struct SystemTraits);
    corax_kernel::configure_kernel! {
        SystemTraits {
            startup_hook: startup,
            time_slice: 0,
        }
    }

    static BUF: BufferStorage<u8, 32> = BufferStorage::new();
    static MSG: MessageBuffer<SystemTraits> = MessageBuffer::new(BUF.as_cells());

    static CONTROL: Task<SystemTraits> = Task::new(1, control_body, 0);
    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn logged(entry: &'static str) -> bool {
        LOG.lock().unwrap().contains(&entry)
    }

    fn startup() {
        CONTROL.start().unwrap();
    }

    fn control_body(_: usize) {
        // Frames come out whole and in order, regardless of read buffer
        // size.
        MSG.give(&[1, 2, 3]).unwrap();
        MSG.give(&[4]).unwrap();
        MSG.give(&[5, 6, 7, 8, 9]).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(MSG.recv(&mut buf), Ok(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(MSG.recv(&mut buf), Ok(1));
        assert_eq!(buf[0], 4);

        // A too-small read buffer cannot take the head frame.
        let mut small = [0u8; 2];
        assert_eq!(MSG.take(&mut small), Err(TryRecvError::BadParam));
        assert_eq!(MSG.recv(&mut buf), Ok(5));
        assert_eq!(&buf[..5], &[5, 6, 7, 8, 9]);

        // Empty.
        assert_eq!(MSG.take(&mut buf), Err(TryRecvError::Timeout));

        // A frame that can never fit fails outright (4-byte header + 29).
        assert_eq!(MSG.give(&[0; 29]), Err(TrySendError::BadParam));

        LOG.lock().unwrap().push("message done");
        port::shutdown::<SystemTraits>();
        let _ = task::exit_task::<SystemTraits>();
    }

    #[test]
    fn message_buffer() {
        let booter = std::thread::spawn(SystemTraits::port_boot);
        spin_until("message done", || logged("message done"));
        booter.join().unwrap();
    }
}
