//! Result codes and per-operation error types
//!
//! Every fallible kernel operation has its own error enum listing exactly the
//! conditions it can report. All of them are numerically compatible with
//! [`ResultCode`], so a C-style binding can collapse them into plain
//! integers.
use core::fmt;

macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the flattened C-style API
    /// can return.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is
        /// available.
        Success = 0,
        /// The operation is not supported.
        NotSupported = -9,
        /// A parameter is invalid in a way that is not covered by any other
        /// error codes.
        BadParam = -17,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
        /// The current context disallows the operation.
        BadContext = -25,
        /// The caller does not own the resource.
        NotOwner = -29,
        /// Completing the operation would cause a deadlock.
        WouldDeadlock = -30,
        /// A queue or counter is at its limit.
        QueueOverflow = -43,
        /// The owner of a robust mutex exited while holding it. The lock was
        /// nevertheless acquired.
        Abandoned = -44,
        /// The object the caller was blocked on was destroyed.
        Deleted = -47,
        /// The wait operation was interrupted by a reset of the blocked task
        /// or of the object it was blocked on.
        Stopped = -48,
        /// The operation timed out.
        Timeout = -50,
    }
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_error! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_error! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

// Operation-specific error types
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for blocking operations with no timeout.
    #[into(WaitTimeoutError)]
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(SleepError)]
    #[into(SuspendError)]
    #[into(JoinError)]
    #[into(WaitSemaphoreError)]
    #[into(WaitSemaphoreTimeoutError)]
    #[into(WaitFlagError)]
    #[into(WaitFlagTimeoutError)]
    #[into(WaitSignalError)]
    #[into(WaitSignalTimeoutError)]
    #[into(WaitTimerError)]
    #[into(WaitTimerTimeoutError)]
    #[into(SendError)]
    #[into(SendTimeoutError)]
    #[into(RecvError)]
    #[into(RecvTimeoutError)]
    pub enum WaitError {
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for blocking operations with a timeout.
    #[into(LockMutexTimeoutError)]
    #[into(JoinError)]
    #[into(WaitSemaphoreTimeoutError)]
    #[into(WaitFlagTimeoutError)]
    #[into(WaitSignalTimeoutError)]
    #[into(WaitTimerTimeoutError)]
    #[into(SendTimeoutError)]
    #[into(RecvTimeoutError)]
    pub enum WaitTimeoutError {
        Timeout,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// `BadContext`
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(SetCeilingError)]
    #[into(StartTaskError)]
    #[into(StopTaskError)]
    #[into(ResetTaskError)]
    #[into(ResumeTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(ExitTaskError)]
    #[into(FlipTaskError)]
    #[into(JoinError)]
    #[into(SleepError)]
    #[into(SuspendError)]
    #[into(SignalSemaphoreError)]
    #[into(PollSemaphoreError)]
    #[into(WaitSemaphoreError)]
    #[into(WaitSemaphoreTimeoutError)]
    #[into(PollFlagError)]
    #[into(WaitFlagError)]
    #[into(WaitFlagTimeoutError)]
    #[into(PollSignalError)]
    #[into(WaitSignalError)]
    #[into(WaitSignalTimeoutError)]
    #[into(PollTimerError)]
    #[into(WaitTimerError)]
    #[into(WaitTimerTimeoutError)]
    #[into(TrySendError)]
    #[into(SendError)]
    #[into(SendTimeoutError)]
    #[into(TryRecvError)]
    #[into(RecvError)]
    #[into(RecvTimeoutError)]
    pub enum BadContextError {
        BadContext,
    }
}

define_error! {
    /// Some of the error codes shared by [`TryLockMutexError`],
    /// [`LockMutexError`], and [`LockMutexTimeoutError`]. Used internally
    /// by the mutex implementation.
    #[into(LockMutexError)]
    #[into(LockMutexTimeoutError)]
    #[into(TryLockMutexError)]
    pub(super) enum LockMutexPrecheckError {
        WouldDeadlock,
        BadParam,
        QueueOverflow,
    }
}

define_error! {
    /// Error type for [`Mutex::wait`](crate::mutex::Mutex::wait).
    pub enum LockMutexError {
        BadContext,
        Stopped,
        Deleted,
        WouldDeadlock,
        BadParam,
        QueueOverflow,
        Abandoned,
    }
}

define_error! {
    /// Error type for [`Mutex::wait_for`](crate::mutex::Mutex::wait_for) and
    /// [`Mutex::wait_until`](crate::mutex::Mutex::wait_until).
    pub enum LockMutexTimeoutError {
        BadContext,
        Timeout,
        Stopped,
        Deleted,
        WouldDeadlock,
        BadParam,
        QueueOverflow,
        Abandoned,
    }
}

define_error! {
    /// Error type for [`Mutex::take`](crate::mutex::Mutex::take).
    pub enum TryLockMutexError {
        BadContext,
        Timeout,
        WouldDeadlock,
        BadParam,
        QueueOverflow,
        Abandoned,
    }
}

define_error! {
    /// Error type for [`Mutex::give`](crate::mutex::Mutex::give).
    pub enum UnlockMutexError {
        BadContext,
        NotOwner,
    }
}

define_error! {
    /// Error type for [`Mutex::set_ceiling`](crate::mutex::Mutex::set_ceiling).
    pub enum SetCeilingError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Task::start`](crate::task::Task::start).
    pub enum StartTaskError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Task::stop`](crate::task::Task::stop).
    pub enum StopTaskError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Task::reset`](crate::task::Task::reset) and
    /// [`Task::destroy`](crate::task::Task::destroy).
    pub enum ResetTaskError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`Task::resume`](crate::task::Task::resume).
    pub enum ResumeTaskError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Task::set_priority`](crate::task::Task::set_priority).
    pub enum SetTaskPriorityError {
        BadContext,
        BadParam,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`exit_task`](crate::task::exit_task).
    pub enum ExitTaskError {
        BadContext,
    }
}

define_error! {
    /// Error type for [`Task::flip`](crate::task::Task::flip).
    pub enum FlipTaskError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Task::join`](crate::task::Task::join) and its timed
    /// variants.
    pub enum JoinError {
        BadContext,
        BadObjectState,
        WouldDeadlock,
        Timeout,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for [`sleep_for`](crate::task::sleep_for) and
    /// [`sleep_until`](crate::task::sleep_until).
    pub enum SleepError {
        BadContext,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for [`suspend`](crate::task::suspend).
    pub enum SuspendError {
        BadContext,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for [`Semaphore::give`](crate::semaphore::Semaphore::give).
    pub enum SignalSemaphoreError {
        BadContext,
        Timeout,
    }
}

define_error! {
    /// Error type for [`Semaphore::take`](crate::semaphore::Semaphore::take).
    pub enum PollSemaphoreError {
        BadContext,
        Timeout,
    }
}

define_error! {
    /// Error type for [`Semaphore::wait`](crate::semaphore::Semaphore::wait).
    pub enum WaitSemaphoreError {
        BadContext,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for the timed variants of
    /// [`Semaphore::wait`](crate::semaphore::Semaphore::wait).
    pub enum WaitSemaphoreTimeoutError {
        BadContext,
        Timeout,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for [`Flag::take`](crate::flag::Flag::take).
    pub enum PollFlagError {
        BadContext,
        Timeout,
    }
}

define_error! {
    /// Error type for [`Flag::wait`](crate::flag::Flag::wait).
    pub enum WaitFlagError {
        BadContext,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for the timed variants of
    /// [`Flag::wait`](crate::flag::Flag::wait).
    pub enum WaitFlagTimeoutError {
        BadContext,
        Timeout,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for [`Signal::take`](crate::signal::Signal::take).
    pub enum PollSignalError {
        BadContext,
        Timeout,
    }
}

define_error! {
    /// Error type for [`Signal::wait`](crate::signal::Signal::wait).
    pub enum WaitSignalError {
        BadContext,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for the timed variants of
    /// [`Signal::wait`](crate::signal::Signal::wait).
    pub enum WaitSignalTimeoutError {
        BadContext,
        Timeout,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for [`Timer::take`](crate::timer::Timer::take).
    pub enum PollTimerError {
        BadContext,
        Timeout,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Timer::wait`](crate::timer::Timer::wait).
    pub enum WaitTimerError {
        BadContext,
        BadObjectState,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for the timed variants of
    /// [`Timer::wait`](crate::timer::Timer::wait).
    pub enum WaitTimerTimeoutError {
        BadContext,
        Timeout,
        BadObjectState,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for the non-blocking send operations of the transfer
    /// primitives (mailbox, stream buffer, message buffer, event queue, job
    /// queue).
    pub enum TrySendError {
        BadContext,
        Timeout,
        BadParam,
    }
}

define_error! {
    /// Error type for the untimed blocking send operations of the transfer
    /// primitives.
    pub enum SendError {
        BadContext,
        BadParam,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for the timed send operations of the transfer primitives.
    pub enum SendTimeoutError {
        BadContext,
        Timeout,
        BadParam,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for the non-blocking receive operations of the transfer
    /// primitives.
    pub enum TryRecvError {
        BadContext,
        Timeout,
        BadParam,
    }
}

define_error! {
    /// Error type for the untimed blocking receive operations of the transfer
    /// primitives.
    pub enum RecvError {
        BadContext,
        BadParam,
        Stopped,
        Deleted,
    }
}

define_error! {
    /// Error type for the timed receive operations of the transfer
    /// primitives.
    pub enum RecvTimeoutError {
        BadContext,
        Timeout,
        BadParam,
        Stopped,
        Deleted,
    }
}

/// Convert `e` to [`WaitError`], panicking if `e == Timeout`.
///
/// Used by untimed blocking paths, which never register a timeout and
/// therefore can never observe one.
#[inline]
pub(super) fn expect_not_timeout(e: WaitTimeoutError) -> WaitError {
    match e {
        WaitTimeoutError::Stopped => WaitError::Stopped,
        WaitTimeoutError::Deleted => WaitError::Deleted,
        WaitTimeoutError::Timeout => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}
