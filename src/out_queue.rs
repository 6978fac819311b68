//! Output channel with time-ordered delivery.
//!
//! Fibers push records into a bounded lock-free queue. The reader moves them
//! into a staging area sorted by logical timestamp and only hands out records
//! whose timestamp has been reached by the wall clock, so delivery order is
//! non-decreasing in time even though fibers run out of lockstep.

use crate::GroupId;
use crate::deadlines::Deadlines;
use crate::error::{Result, SimError};
use crate::sync::{Exclusive, SleepBackoff};
use crate::time::{self, Timepoint};
use crossbeam::queue::ArrayQueue;
use tracing::warn;

/// Kind of an output record, without its storage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Bytes,
    String,
    Error,
}

/// Payload of an output record.
///
/// Dynamic variants own their storage and are handed to
/// [`Simulation::dealloc`](crate::Simulation::dealloc) once consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputData {
    StaticBytes(&'static [u8]),
    DynamicBytes(Box<[u8]>),
    StaticString(&'static str),
    DynamicString(String),
    Error { code: SimError, message: &'static str },
}

impl OutputData {
    pub fn kind(&self) -> OutputKind {
        match self {
            OutputData::StaticBytes(_) | OutputData::DynamicBytes(_) => OutputKind::Bytes,
            OutputData::StaticString(_) | OutputData::DynamicString(_) => OutputKind::String,
            OutputData::Error { .. } => OutputKind::Error,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, OutputData::DynamicBytes(_) | OutputData::DynamicString(_))
    }

    /// Raw bytes of a bytes or string record.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            OutputData::StaticBytes(b) => Some(*b),
            OutputData::DynamicBytes(b) => Some(&b[..]),
            OutputData::StaticString(s) => Some(s.as_bytes()),
            OutputData::DynamicString(s) => Some(s.as_bytes()),
            OutputData::Error { .. } => None,
        }
    }
}

/// A record produced by a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub data: OutputData,
    pub group: GroupId,
    /// Logical time of the producing fiber.
    pub time: Timepoint,
}

pub(crate) struct OutputChannel {
    queue: ArrayQueue<OutputRecord>,
    staging: Exclusive<Deadlines<OutputRecord>>,
}

impl OutputChannel {
    /// `size` is rounded up to a power of two; staging holds four times that.
    pub fn new(size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        Self {
            queue: ArrayQueue::new(size),
            staging: Exclusive::new(Deadlines::new(size * 4)),
        }
    }

    /// Never blocks. Hands the record back when the channel is full.
    pub fn produce(&self, record: OutputRecord) -> std::result::Result<(), OutputRecord> {
        self.queue.push(record)
    }

    /// Reads up to `capacity` records whose time has come, waiting at most
    /// `timeout_us`. Records evicted from a full staging area go to `evicted`.
    pub fn consume(
        &self,
        capacity: usize,
        timeout_us: u64,
        mut evicted: impl FnMut(OutputRecord),
    ) -> Result<Vec<OutputRecord>> {
        if capacity == 0 {
            return Err(SimError::Invalid);
        }
        let deadline = time::now().saturating_add(timeout_us);
        let mut capacity = capacity;
        let mut backoff = SleepBackoff::new(1, (timeout_us / 4).clamp(1, 1000));
        let mut staging = self.staging.lock_spinning();
        let mut out = Vec::new();

        loop {
            let has_room = self.transfer(&mut staging);
            Self::take_ready(&mut staging, &mut out, capacity);

            if !out.is_empty() {
                if !has_room {
                    self.transfer(&mut staging);
                }
                return Ok(out);
            }
            if !has_room {
                if let Some(record) = self.queue.pop() {
                    if let Some((_, oldest)) = staging.pop_head() {
                        warn!(
                            group = oldest.group,
                            time = oldest.time,
                            "output staging full, evicting oldest record"
                        );
                        evicted(oldest);
                    }
                    let _ = staging.insert(record.time, record);
                    continue;
                }
            }

            // after the first miss only wait for the earliest record
            capacity = 1;
            let now = time::now();
            if now >= deadline {
                return Err(SimError::Timeout);
            }
            backoff.wait(deadline - now);
        }
    }

    /// Moves raw records into staging. Returns false if staging filled up first.
    fn transfer(&self, staging: &mut Deadlines<OutputRecord>) -> bool {
        while staging.can_insert() {
            match self.queue.pop() {
                Some(record) => {
                    let _ = staging.insert(record.time, record);
                }
                None => return true,
            }
        }
        false
    }

    fn take_ready(
        staging: &mut Deadlines<OutputRecord>,
        out: &mut Vec<OutputRecord>,
        capacity: usize,
    ) {
        while out.len() < capacity {
            match staging.pop_expired(time::now()) {
                Some((_, record)) => out.push(record),
                None => break,
            }
        }
    }

    /// Removes every record, staged or not.
    pub fn drain_all(&self) -> Vec<OutputRecord> {
        let mut staging = self.staging.lock_spinning();
        let mut all: Vec<_> = staging.drain().map(|(_, r)| r).collect();
        while let Some(record) = self.queue.pop() {
            all.push(record);
        }
        all
    }
}
