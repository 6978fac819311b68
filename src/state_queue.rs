//! Fiber state queues.
//!
//! Fibers live in a fixed arena and are addressed by index. Every fiber belongs
//! to exactly one queue at a time; queues are index-linked lists so moving a
//! fiber between queues is O(1) and iteration order is insertion order.

const NIL: usize = usize::MAX;

/// Queue membership of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Queue {
    /// Finished, or not started yet.
    Finished = 0,
    /// Eligible to be resumed on the next pass.
    Run = 1,
    /// Waiting on a signal or parked on its own timer.
    Blocked = 2,
    /// Blocked on an input read.
    OnQueue = 3,
}

const QUEUES: usize = 4;

#[derive(Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
    queue: Queue,
}

#[derive(Clone, Copy)]
struct Head {
    first: usize,
    last: usize,
    len: usize,
}

const EMPTY: Head = Head {
    first: NIL,
    last: NIL,
    len: 0,
};

pub(crate) struct StateQueues {
    links: Vec<Link>,
    heads: [Head; QUEUES],
}

impl StateQueues {
    /// All fibers start in `Finished`, in index order.
    pub fn new(fibers: usize) -> Self {
        let mut queues = Self {
            links: Vec::with_capacity(fibers),
            heads: [EMPTY; QUEUES],
        };
        queues.reset(fibers);
        queues
    }

    /// Puts every fiber back into `Finished`, in index order.
    pub fn reset(&mut self, fibers: usize) {
        self.links.clear();
        self.heads = [EMPTY; QUEUES];
        for idx in 0..fibers {
            self.links.push(Link {
                prev: NIL,
                next: NIL,
                queue: Queue::Finished,
            });
            self.push_back(idx, Queue::Finished);
        }
    }

    pub fn queue_of(&self, idx: usize) -> Queue {
        self.links[idx].queue
    }

    pub fn len(&self, queue: Queue) -> usize {
        self.heads[queue as usize].len
    }

    pub fn is_empty(&self, queue: Queue) -> bool {
        self.len(queue) == 0
    }

    /// True when no fiber is runnable or blocked.
    pub fn all_inactive(&self) -> bool {
        self.is_empty(Queue::Run) && self.is_empty(Queue::Blocked) && self.is_empty(Queue::OnQueue)
    }

    pub fn first(&self, queue: Queue) -> Option<usize> {
        let first = self.heads[queue as usize].first;
        (first != NIL).then_some(first)
    }

    pub fn next(&self, idx: usize) -> Option<usize> {
        let next = self.links[idx].next;
        (next != NIL).then_some(next)
    }

    /// Snapshot of a queue in order.
    pub fn members(&self, queue: Queue) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len(queue));
        let mut cur = self.first(queue);
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.next(idx);
        }
        out
    }

    /// Moves `idx` to the tail of `to`, even if it is already there.
    pub fn move_to(&mut self, idx: usize, to: Queue) {
        self.unlink(idx);
        self.push_back(idx, to);
    }

    fn unlink(&mut self, idx: usize) {
        let Link { prev, next, queue } = self.links[idx];
        let head = &mut self.heads[queue as usize];
        if prev == NIL {
            head.first = next;
        } else {
            self.links[prev].next = next;
        }
        if next == NIL {
            head.last = prev;
        } else {
            self.links[next].prev = prev;
        }
        head.len -= 1;
    }

    fn push_back(&mut self, idx: usize, queue: Queue) {
        let head = &mut self.heads[queue as usize];
        let last = head.last;
        self.links[idx] = Link {
            prev: last,
            next: NIL,
            queue,
        };
        if last == NIL {
            head.first = idx;
        } else {
            self.links[last].next = idx;
        }
        head.last = idx;
        head.len += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let q = StateQueues::new(3);
        assert_eq!(q.members(Queue::Finished), vec![0, 1, 2]);
        assert!(q.all_inactive());
    }

    #[test]
    fn test_moves_keep_order() {
        let mut q = StateQueues::new(4);
        q.move_to(2, Queue::Run);
        q.move_to(0, Queue::Run);
        q.move_to(3, Queue::Blocked);

        assert_eq!(q.members(Queue::Run), vec![2, 0]);
        assert_eq!(q.members(Queue::Finished), vec![1]);
        assert_eq!(q.queue_of(3), Queue::Blocked);
        assert!(!q.all_inactive());

        // re-append within the same queue
        q.move_to(2, Queue::Run);
        assert_eq!(q.members(Queue::Run), vec![0, 2]);

        q.move_to(0, Queue::OnQueue);
        assert_eq!(q.first(Queue::Run), Some(2));
        assert_eq!(q.next(2), None);
        assert_eq!(q.len(Queue::OnQueue), 1);
    }

    #[test]
    fn test_reset() {
        let mut q = StateQueues::new(3);
        q.move_to(1, Queue::Run);
        q.reset(3);
        assert_eq!(q.members(Queue::Finished), vec![0, 1, 2]);
        assert!(q.is_empty(Queue::Run));
    }
}
