//! Synchronization objects composed from the core primitives
//!
//! None of these introduce new scheduler hooks; they block and wake
//! exclusively through the wait queues of the primitives they embed.
mod barrier;
mod condvar;
mod once;
mod rwlock;

pub use self::{barrier::*, condvar::*, once::*, rwlock::*};
