//! Group input channel.
//!
//! A bounded multi-producer/single-consumer queue of buffer handles plus a
//! status word. The status word packs a produce sequence number with a
//! tri-state signal:
//!
//! - `Ok`: data was produced since the consumer last went idle.
//! - `Idle`: the consumer has no pending pass; the next producer must schedule one.
//! - `Blocked`: shutting down, producers are rejected.
//!
//! Producers bump the sequence after pushing, so the consumer's idle transition
//! (a compare-and-swap against the sequence it saw before its last empty poll)
//! fails whenever data raced in.

use crate::buffer::BufferHandle;
use crate::error::{Result, SimError};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Ok = 0,
    Idle = 1,
    Blocked = 2,
}

const SIGNAL_BITS: u64 = 2;
const SIGNAL_MASK: u64 = (1 << SIGNAL_BITS) - 1;

fn signal_of(word: u64) -> Signal {
    match word & SIGNAL_MASK {
        0 => Signal::Ok,
        1 => Signal::Idle,
        _ => Signal::Blocked,
    }
}

fn pack(seq: u64, signal: Signal) -> u64 {
    (seq << SIGNAL_BITS) | signal as u64
}

fn seq_of(word: u64) -> u64 {
    word >> SIGNAL_BITS
}

pub(crate) struct InputChannel {
    queue: ArrayQueue<BufferHandle>,
    status: AtomicU64,
    /// Status word seen before the consumer's last empty poll.
    observed: AtomicU64,
}

impl InputChannel {
    /// `capacity` is rounded up to a power of two. Starts idle.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            queue: ArrayQueue::new(capacity),
            status: AtomicU64::new(pack(0, Signal::Idle)),
            observed: AtomicU64::new(pack(0, Signal::Idle)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn signal(&self) -> Signal {
        signal_of(self.status.load(Ordering::Acquire))
    }

    /// Pushes a handle. Returns whether the channel was idle, in which case the
    /// caller is responsible for scheduling a drain. The handle is dropped on error.
    pub fn produce(&self, handle: BufferHandle) -> Result<bool> {
        if self.signal() == Signal::Blocked {
            return Err(SimError::Locked);
        }
        self.queue.push(handle).map_err(|_| SimError::WouldBlock)?;

        let mut word = self.status.load(Ordering::Acquire);
        loop {
            let prev = signal_of(word);
            let next = match prev {
                // raced with block(): the entry is freed when the channel is dropped
                Signal::Blocked => pack(seq_of(word) + 1, Signal::Blocked),
                _ => pack(seq_of(word) + 1, Signal::Ok),
            };
            match self
                .status
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(prev == Signal::Idle),
                Err(actual) => word = actual,
            }
        }
    }

    /// Single consumer only.
    pub fn try_consume(&self) -> Option<BufferHandle> {
        let word = self.status.load(Ordering::Acquire);
        let item = self.queue.pop();
        if item.is_none() {
            self.observed.store(word, Ordering::Relaxed);
        }
        item
    }

    /// Declares the consumer idle. Must follow an empty `try_consume`.
    /// Fails with the current signal if data or a block raced in.
    pub fn try_switch_to_idle(&self) -> std::result::Result<(), Signal> {
        let observed = self.observed.load(Ordering::Relaxed);
        if signal_of(observed) == Signal::Blocked {
            return Err(Signal::Blocked);
        }
        let idle = pack(seq_of(observed), Signal::Idle);
        self.status
            .compare_exchange(observed, idle, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(signal_of)
    }

    /// Rejects all further producers.
    pub fn block(&self) {
        let mut word = self.status.load(Ordering::Acquire);
        loop {
            let next = pack(seq_of(word), Signal::Blocked);
            match self
                .status
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }
}

impl Drop for InputChannel {
    fn drop(&mut self) {
        while self.queue.pop().is_some() {}
    }
}
