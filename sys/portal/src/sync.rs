// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler primitives the portals consume but do not implement.
//!
//! Exchanges and semaphores belong to the scheduler, outside this
//! crate. They are referenced from many partitions and from deferred
//! interrupt context, so the traits take `&self` and require `Sync`;
//! implementations do their own internal locking (on the target that is
//! typically a brief interrupt mask).

use abi::{OwnerId, Timeout};

/// A message in flight: the sender's identity plus ownership of the
/// buffer. Buffers live in pool or pool-region memory, hence the
/// `'static`.
pub struct Envelope {
    pub from: OwnerId,
    pub buf: &'static mut [u8],
}

/// Delivery order a given exchange provides.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExchangeMode {
    /// Arrival order.
    Fifo,
    /// Sender priority order.
    Priority,
    /// Every attached receiver sees the message.
    Broadcast,
}

/// Rendezvous point for handing buffers from client to server.
pub trait Exchange: Sync {
    fn mode(&self) -> ExchangeMode;

    /// Queues a message. On a full exchange the envelope comes back to
    /// the caller, buffer intact.
    fn send(&self, env: Envelope) -> Result<(), Envelope>;

    /// Takes the next message per this exchange's mode, blocking up to
    /// `timeout`.
    fn receive(&self, timeout: Timeout) -> Option<Envelope>;

    /// Discards everything queued. Used at session close so a stale
    /// message is never misread as belonging to a new session.
    fn flush(&self);
}

pub trait Semaphore: Sync {
    fn signal(&self);

    /// Consumes one signal, blocking up to `timeout`. Returns whether a
    /// signal was consumed.
    fn wait(&self, timeout: Timeout) -> bool;

    /// Drops any pending signals.
    fn reset(&self);
}

/// Resolves the semaphore handles carried in a tunnel OPEN message.
/// Handle values are scheduler-assigned and opaque here.
pub trait SemTable: Sync {
    fn get(&self, handle: u32) -> Option<&dyn Semaphore>;
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Host doubles: a counting semaphore on a condvar and a FIFO
    //! exchange on a mutexed queue, so protocol tests can run the
    //! client and server on real threads.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    fn duration(t: Timeout) -> Option<Duration> {
        match t {
            Timeout::NoWait => Some(Duration::ZERO),
            // One tick is one millisecond as far as tests care.
            Timeout::Ticks(n) => Some(Duration::from_millis(n as u64)),
            Timeout::Forever => None,
        }
    }

    #[derive(Default)]
    pub struct TestSem {
        count: Mutex<u32>,
        cv: Condvar,
    }

    impl TestSem {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Semaphore for TestSem {
        fn signal(&self) {
            *self.count.lock().unwrap() += 1;
            self.cv.notify_one();
        }

        fn wait(&self, timeout: Timeout) -> bool {
            let mut count = self.count.lock().unwrap();
            match duration(timeout) {
                None => {
                    while *count == 0 {
                        count = self.cv.wait(count).unwrap();
                    }
                }
                Some(d) => {
                    let (c, res) = self
                        .cv
                        .wait_timeout_while(count, d, |c| *c == 0)
                        .unwrap();
                    count = c;
                    if res.timed_out() && *count == 0 {
                        return false;
                    }
                }
            }
            *count -= 1;
            true
        }

        fn reset(&self) {
            *self.count.lock().unwrap() = 0;
        }
    }

    #[derive(Default)]
    pub struct TestExchange {
        queue: Mutex<VecDeque<Envelope>>,
        cv: Condvar,
    }

    impl TestExchange {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Exchange for TestExchange {
        fn mode(&self) -> ExchangeMode {
            ExchangeMode::Fifo
        }

        fn send(&self, env: Envelope) -> Result<(), Envelope> {
            self.queue.lock().unwrap().push_back(env);
            self.cv.notify_one();
            Ok(())
        }

        fn receive(&self, timeout: Timeout) -> Option<Envelope> {
            let mut q = self.queue.lock().unwrap();
            match duration(timeout) {
                None => loop {
                    if let Some(env) = q.pop_front() {
                        return Some(env);
                    }
                    q = self.cv.wait(q).unwrap();
                },
                Some(d) => {
                    let (mut q, _) = self
                        .cv
                        .wait_timeout_while(q, d, |q| q.is_empty())
                        .unwrap();
                    q.pop_front()
                }
            }
        }

        fn flush(&self) {
            self.queue.lock().unwrap().clear();
        }
    }

    pub struct TestSemTable {
        pub sems: Vec<&'static dyn Semaphore>,
    }

    impl SemTable for TestSemTable {
        fn get(&self, handle: u32) -> Option<&dyn Semaphore> {
            self.sems.get(handle as usize).copied()
        }
    }

    /// Leaks a buffer to get the `'static` lifetime pool memory has in
    /// production. Word-backed so header casts never trip on
    /// alignment.
    pub fn leak_buf(len: usize) -> &'static mut [u8] {
        let words = Box::leak(vec![0u64; len.div_ceil(8)].into_boxed_slice());
        // Safety: the words are leaked, exclusively ours, and at least
        // `len` bytes long.
        unsafe {
            std::slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), len)
        }
    }
}
