//! Execution queue - pending jobs and messages of one execution context
//!
//! Each execution loop owns one queue. Any core or interrupt handler may
//! push into it; only the owning loop pops. Items are either jobs
//! (callbacks run by the loop) or messages (dispatched to their port
//! handler).

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::clock::Clock;
use crate::config::QUEUE_DEFAULT_LIMIT;
use crate::irq::IrqMutex;
use crate::message::Message;

// ============================================================================
// Jobs
// ============================================================================

/// A unit of deferred work run by an execution loop
///
/// The job is consumed by `run`, so a job that wants to release itself
/// simply returns.
pub trait Job: Send {
    fn run(self: Box<Self>);
}

impl<F: FnOnce() + Send> Job for F {
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// A pending queue entry
pub enum QueueItem {
    Job(Box<dyn Job>),
    Message(Message),
}

impl QueueItem {
    /// Whether this entry is a job rather than a message
    pub fn is_job(&self) -> bool {
        matches!(self, QueueItem::Job(_))
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueItem::Job(_) => f.write_str("Job"),
            QueueItem::Message(m) => f.debug_tuple("Message").field(&m.header).finish(),
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

/// FIFO of pending items with message-class semantics
///
/// - `queue_head` messages go to the front.
/// - `Replace`/`NoWakeReplace` messages overwrite a pending message with the
///   same id and destination instead of queuing a second copy.
/// - `NoWake*` messages do not raise the wake request consumed by power
///   management.
///
/// The limit applies to messages only; jobs are framework control flow and
/// are always accepted.
pub struct Queue {
    items: IrqMutex<VecDeque<QueueItem>>,
    limit: usize,
    wake: AtomicBool,
}

impl Queue {
    /// Create a queue with the default limit
    pub fn new() -> Self {
        Self::with_limit(QUEUE_DEFAULT_LIMIT)
    }

    /// Create a queue accepting at most `limit` pending messages
    pub fn with_limit(limit: usize) -> Self {
        Self {
            items: IrqMutex::new(VecDeque::new()),
            limit: limit.max(1),
            wake: AtomicBool::new(false),
        }
    }

    /// Queue limit
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Post a message; a full queue hands the message back. A replacing
    /// message returns the pending message it superseded, which the caller
    /// must release.
    pub fn push_message(&self, msg: Message) -> Result<Option<Message>, Message> {
        let flags = msg.header.flags;
        {
            let mut items = self.items.lock();

            if flags.class.replaces() {
                let pending = items.iter_mut().find(|item| match item {
                    QueueItem::Message(m) => m.id() == msg.id() && m.dst() == msg.dst(),
                    QueueItem::Job(_) => false,
                });
                if let Some(slot) = pending {
                    let old = core::mem::replace(slot, QueueItem::Message(msg));
                    if flags.class.wakes() {
                        self.wake.store(true, Ordering::Release);
                    }
                    return Ok(match old {
                        QueueItem::Message(m) => Some(m),
                        QueueItem::Job(_) => None,
                    });
                }
            }

            let messages = items.iter().filter(|i| !i.is_job()).count();
            if messages >= self.limit {
                return Err(msg);
            }

            if flags.queue_head {
                items.push_front(QueueItem::Message(msg));
            } else {
                items.push_back(QueueItem::Message(msg));
            }
        }
        if flags.class.wakes() {
            self.wake.store(true, Ordering::Release);
        }
        Ok(None)
    }

    /// Post a job at the tail
    pub fn push_job(&self, job: Box<dyn Job>) {
        self.items.lock().push_back(QueueItem::Job(job));
        self.wake.store(true, Ordering::Release);
    }

    /// Post any item; only messages can be refused or supersede another
    pub fn push(&self, item: QueueItem) -> Result<Option<Message>, QueueItem> {
        match item {
            QueueItem::Job(job) => {
                self.push_job(job);
                Ok(None)
            }
            QueueItem::Message(msg) => self.push_message(msg).map_err(QueueItem::Message),
        }
    }

    /// Take the next item without waiting
    pub fn pop(&self) -> Option<QueueItem> {
        self.items.lock().pop_front()
    }

    /// Take the next item, waiting up to `timeout_ms` (forever on `None`)
    pub fn pop_wait(&self, clock: &dyn Clock, timeout_ms: Option<u64>) -> Option<QueueItem> {
        let deadline = timeout_ms.map(|t| clock.now_ms().saturating_add(t));
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if let Some(deadline) = deadline {
                if clock.now_ms() >= deadline {
                    return None;
                }
            }
            clock.relax();
        }
    }

    /// Consume the wake request raised by waking posts
    pub fn take_wake_request(&self) -> bool {
        self.wake.swap(false, Ordering::AcqRel)
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("pending", &self.len())
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::MsgClass;
    use crate::types::PortId;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;

    fn msg(id: u16) -> Message {
        Message::alloc(id, 0).to_port(PortId(1))
    }

    fn next_id(q: &Queue) -> Option<u16> {
        match q.pop()? {
            QueueItem::Message(m) => Some(m.id()),
            QueueItem::Job(_) => None,
        }
    }

    #[test]
    fn fifo_with_head_insertion() {
        let q = Queue::new();
        q.push_message(msg(1)).unwrap();
        q.push_message(msg(2)).unwrap();
        q.push_message(msg(3).at_head()).unwrap();
        assert_eq!(next_id(&q), Some(3));
        assert_eq!(next_id(&q), Some(1));
        assert_eq!(next_id(&q), Some(2));
        assert!(q.is_empty());
    }

    #[test]
    fn limit_refuses_messages_but_not_jobs() {
        let q = Queue::with_limit(1);
        q.push_message(msg(1)).unwrap();
        let back = q.push_message(msg(2)).unwrap_err();
        assert_eq!(back.id(), 2);
        q.push_job(Box::new(|| {}));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn replace_class_overwrites_pending_message() {
        let q = Queue::new();
        q.push_message(msg(7).priority(1)).unwrap();
        assert!(q.push_message(msg(8)).unwrap().is_none());
        let old = q
            .push_message(msg(7).priority(2).class(MsgClass::Replace))
            .unwrap()
            .expect("superseded message is handed back");
        assert_eq!(old.id(), 7);
        assert_eq!(old.header.flags.priority, 1);
        assert_eq!(q.len(), 2);
        match q.pop() {
            Some(QueueItem::Message(m)) => {
                assert_eq!(m.id(), 7);
                assert_eq!(m.header.flags.priority, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn no_wake_messages_leave_wake_request_clear() {
        let q = Queue::new();
        q.push_message(msg(1).class(MsgClass::NoWake)).unwrap();
        assert!(!q.take_wake_request());
        q.push_message(msg(2)).unwrap();
        assert!(q.take_wake_request());
        assert!(!q.take_wake_request());
    }

    #[test]
    fn pop_wait_times_out_on_empty_queue() {
        let q = Queue::new();
        let clock = ManualClock::with_idle_step(1);
        assert!(q.pop_wait(&clock, Some(10)).is_none());
        assert!(clock.now_ms() >= 10);
    }

    #[test]
    fn jobs_run_once_when_popped() {
        let q = Queue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        q.push_job(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        match q.pop() {
            Some(QueueItem::Job(job)) => job.run(),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
