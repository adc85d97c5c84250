//! Execution loop
//!
//! An [`Xloop`] is the cooperative dispatcher of one execution context. It
//! owns a queue and a time-ordered list of delayed items:
//!
//! 1. expired delayed items are moved to the tail of the queue, they are
//!    never run inline,
//! 2. the loop blocks on the queue until the next delayed item is due,
//! 3. a popped job runs, a popped message goes to its port handler.
//!
//! Delayed posts travel through the loop's own queue as a small insertion
//! job, so the sorted list is only ever modified by the loop itself.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use core::ops::ControlFlow;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{error, trace};
use spin::Mutex;

use crate::clock::Clock;
use crate::cpu::{Cpu, Dispatched};
use crate::error::PortError;
use crate::message::Message;
use crate::queue::{Job, Queue, QueueItem};

/// Cancellation handle of a delayed job or periodic function
///
/// Cancelling is idempotent. A cancelled item that is still pending is
/// discarded by the loop instead of running.
#[derive(Debug, Clone, Default)]
pub struct JobHandle {
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    fn new() -> Self {
        Self::default()
    }

    /// Stop the job from running (again)
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Delayed {
    due: u64,
    item: QueueItem,
    handle: JobHandle,
}

struct Inner {
    cpu: Arc<Cpu>,
    queue: Arc<Queue>,
    clock: Arc<dyn Clock>,
    delayed: Mutex<VecDeque<Delayed>>,
}

impl Inner {
    fn insert_delayed(&self, entry: Delayed) {
        if entry.handle.is_cancelled() {
            self.discard(entry.item);
            return;
        }
        let mut delayed = self.delayed.lock();
        // after every entry due at the same time, so equal deadlines keep
        // their posting order
        let at = delayed.partition_point(|d| d.due <= entry.due);
        trace!("{}: delayed item due at {} ms (slot {})", self.cpu.id(), entry.due, at);
        delayed.insert(at, entry);
    }

    /// Move every expired item to the queue; returns the time left until the
    /// next one is due
    fn promote_expired(&self, now: u64) -> Option<u64> {
        loop {
            let expired = {
                let mut delayed = self.delayed.lock();
                match delayed.front() {
                    Some(head) if head.due <= now => delayed.pop_front(),
                    Some(head) => return Some(head.due - now),
                    None => return None,
                }
            };
            let Some(entry) = expired else {
                return None;
            };
            if entry.handle.is_cancelled() {
                self.discard(entry.item);
                continue;
            }
            match self.queue.push(entry.item) {
                Ok(Some(replaced)) => self.cpu.free_message(replaced),
                Ok(None) => {}
                Err(QueueItem::Message(msg)) => {
                    error!(
                        "{}: queue full, dropping expired msg {:#x} for {}",
                        self.cpu.id(),
                        msg.id(),
                        msg.dst()
                    );
                    self.cpu.drop_unroutable(msg);
                }
                Err(item) => self.discard(item),
            }
        }
    }

    fn discard(&self, item: QueueItem) {
        if let QueueItem::Message(msg) = item {
            self.cpu.free_message(msg);
        }
    }

    fn post_delayed(self: &Arc<Self>, item: QueueItem, delay_ms: u64, handle: JobHandle) {
        let due = self.clock.now_ms().saturating_add(delay_ms);
        let weak = Arc::downgrade(self);
        let entry = Delayed { due, item, handle };
        self.queue.push_job(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.insert_delayed(entry);
            }
        }));
    }

    fn schedule_periodic(
        self: &Arc<Self>,
        period_ms: u64,
        handle: JobHandle,
        mut func: Box<dyn FnMut() -> ControlFlow<()> + Send>,
    ) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let h = handle.clone();
        let job = move || {
            if func().is_continue() {
                if let Some(inner) = weak.upgrade() {
                    inner.schedule_periodic(period_ms, h, func);
                }
            }
        };
        self.post_delayed(QueueItem::Job(Box::new(job)), period_ms, handle);
    }
}

/// Cooperative execution loop of one context
#[derive(Clone)]
pub struct Xloop {
    inner: Arc<Inner>,
}

impl Xloop {
    /// Create a loop dispatching `queue` on `cpu`
    pub fn new(cpu: Arc<Cpu>, queue: Arc<Queue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cpu,
                queue,
                clock,
                delayed: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.inner.cpu
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.inner.queue
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    // ========================================================================
    // Posting
    // ========================================================================

    /// Queue a message for dispatch by this loop; a full queue releases it
    pub fn post_message(&self, msg: Message) -> Result<(), PortError> {
        let dst = msg.dst();
        match self.inner.queue.push_message(msg) {
            Ok(replaced) => {
                if let Some(old) = replaced {
                    self.inner.cpu.free_message(old);
                }
                Ok(())
            }
            Err(msg) => {
                self.inner.cpu.free_message(msg);
                Err(PortError::QueueFull(dst))
            }
        }
    }

    /// Queue a job
    pub fn post_job(&self, job: Box<dyn Job>) {
        self.inner.queue.push_job(job);
    }

    /// Queue a one-shot function
    pub fn post_func<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue.push_job(Box::new(func));
    }

    /// Run `job` once `delay_ms` have elapsed
    pub fn post_job_delayed(&self, job: Box<dyn Job>, delay_ms: u64) -> JobHandle {
        let handle = JobHandle::new();
        let guard = handle.clone();
        let guarded = move || {
            if !guard.is_cancelled() {
                job.run();
            }
        };
        self.inner
            .post_delayed(QueueItem::Job(Box::new(guarded)), delay_ms, handle.clone());
        handle
    }

    /// Run a one-shot function once `delay_ms` have elapsed
    pub fn post_func_delayed<F>(&self, func: F, delay_ms: u64) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_job_delayed(Box::new(func), delay_ms)
    }

    /// Queue `msg` once `delay_ms` have elapsed
    pub fn post_message_delayed(&self, msg: Message, delay_ms: u64) -> JobHandle {
        let handle = JobHandle::new();
        self.inner
            .post_delayed(QueueItem::Message(msg), delay_ms, handle.clone());
        handle
    }

    /// Call `func` every `period_ms` (first call after one period) until it
    /// returns `Break` or the handle is cancelled
    pub fn post_func_periodic<F>(&self, period_ms: u64, func: F) -> JobHandle
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let handle = JobHandle::new();
        let guard = handle.clone();
        let mut func = func;
        let guarded = move || {
            if guard.is_cancelled() {
                ControlFlow::Break(())
            } else {
                func()
            }
        };
        self.inner
            .schedule_periodic(period_ms, handle.clone(), Box::new(guarded));
        handle
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Number of items waiting in the delayed list
    pub fn delayed_len(&self) -> usize {
        self.inner.delayed.lock().len()
    }

    /// Due time of the next delayed item
    pub fn next_due(&self) -> Option<u64> {
        self.inner.delayed.lock().front().map(|d| d.due)
    }

    /// Dispatch at most one item, waiting at most `max_wait_ms` (forever on
    /// `None`). Returns `None` when nothing was dispatched in time.
    pub fn run_once(&self, max_wait_ms: Option<u64>) -> Option<Dispatched> {
        let inner = &self.inner;
        let clock = inner.clock.as_ref();
        let limit = max_wait_ms.map(|w| clock.now_ms().saturating_add(w));
        loop {
            let now = clock.now_ms();
            let until_due = inner.promote_expired(now);
            let until_limit = limit.map(|l| l.saturating_sub(now));
            let wait = match (until_due, until_limit) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            };
            if let Some(item) = inner.queue.pop_wait(clock, wait) {
                return Some(inner.cpu.dispatch(item));
            }
            if limit.is_some_and(|l| clock.now_ms() >= l) {
                return None;
            }
        }
    }

    /// Dispatch everything that is ready now without waiting
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.run_once(Some(0)).is_some() {
            count += 1;
        }
        count
    }

    /// Main loop of the execution context
    pub fn run(&self) -> ! {
        loop {
            self.run_once(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::shared::SharedData;
    use crate::types::CpuId;
    use alloc::vec::Vec;

    fn make_loop(clock: Arc<ManualClock>) -> Xloop {
        let cpu = Cpu::new(CpuId(0), Arc::new(SharedData::new()));
        Xloop::new(cpu, Arc::new(Queue::new()), clock)
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn Job>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move |tag: u32| -> Box<dyn Job> {
            let l = l.clone();
            Box::new(move || l.lock().push(tag))
        };
        (log, make)
    }

    #[test]
    fn immediate_jobs_run_in_order() {
        let xloop = make_loop(Arc::new(ManualClock::new()));
        let (log, job) = recorder();
        xloop.post_job(job(1));
        xloop.post_job(job(2));
        assert_eq!(xloop.run_until_idle(), 2);
        assert_eq!(*log.lock(), [1, 2]);
    }

    #[test]
    fn delayed_jobs_fire_in_due_order_and_not_early() {
        let clock = Arc::new(ManualClock::new());
        let xloop = make_loop(clock.clone());
        let (log, job) = recorder();
        xloop.post_job_delayed(job(30), 30);
        xloop.post_job_delayed(job(10), 10);
        xloop.post_job_delayed(job(20), 20);
        xloop.run_until_idle();
        assert_eq!(xloop.delayed_len(), 3);
        assert_eq!(xloop.next_due(), Some(10));

        clock.set(9);
        xloop.run_until_idle();
        assert!(log.lock().is_empty());

        clock.set(20);
        xloop.run_until_idle();
        assert_eq!(*log.lock(), [10, 20]);

        clock.set(100);
        xloop.run_until_idle();
        assert_eq!(*log.lock(), [10, 20, 30]);
    }

    #[test]
    fn equal_deadlines_keep_posting_order() {
        let clock = Arc::new(ManualClock::new());
        let xloop = make_loop(clock.clone());
        let (log, job) = recorder();
        for tag in 0..4 {
            xloop.post_job_delayed(job(tag), 5);
        }
        clock.set(5);
        xloop.run_until_idle();
        xloop.run_until_idle();
        assert_eq!(*log.lock(), [0, 1, 2, 3]);
    }

    #[test]
    fn cancelled_job_never_runs() {
        let clock = Arc::new(ManualClock::new());
        let xloop = make_loop(clock.clone());
        let (log, job) = recorder();
        let handle = xloop.post_job_delayed(job(1), 5);
        xloop.post_job_delayed(job(2), 5);
        xloop.run_until_idle();
        handle.cancel();
        handle.cancel();
        clock.set(5);
        xloop.run_until_idle();
        assert_eq!(*log.lock(), [2]);
        assert_eq!(xloop.delayed_len(), 0);
    }

    #[test]
    fn periodic_function_runs_until_break() {
        let clock = Arc::new(ManualClock::new());
        let xloop = make_loop(clock.clone());
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        xloop.post_func_periodic(10, move || {
            let mut n = h.lock();
            *n += 1;
            if *n == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        for t in 1..=10 {
            clock.set(t * 10);
            xloop.run_until_idle();
            xloop.run_until_idle();
        }
        assert_eq!(*hits.lock(), 3);
        assert_eq!(xloop.delayed_len(), 0);
    }

    #[test]
    fn periodic_function_stops_on_cancel() {
        let clock = Arc::new(ManualClock::new());
        let xloop = make_loop(clock.clone());
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        let handle = xloop.post_func_periodic(10, move || {
            *h.lock() += 1;
            ControlFlow::Continue(())
        });
        clock.set(10);
        xloop.run_until_idle();
        xloop.run_until_idle();
        handle.cancel();
        clock.set(50);
        xloop.run_until_idle();
        xloop.run_until_idle();
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn run_once_blocks_until_delayed_item_is_due() {
        let clock = Arc::new(ManualClock::with_idle_step(1));
        let xloop = make_loop(clock.clone());
        let (log, job) = recorder();
        xloop.post_job_delayed(job(7), 25);
        // insertion job
        assert_eq!(xloop.run_once(None), Some(Dispatched::Job));
        assert_eq!(xloop.run_once(None), Some(Dispatched::Job));
        assert_eq!(*log.lock(), [7]);
        assert!(clock.now_ms() >= 25);
    }

    #[test]
    fn run_once_honours_its_wait_limit() {
        let clock = Arc::new(ManualClock::with_idle_step(1));
        let xloop = make_loop(clock.clone());
        assert_eq!(xloop.run_once(Some(4)), None);
        assert!(clock.now_ms() >= 4);
    }

    #[test]
    fn delayed_message_is_queued_not_dispatched_inline() {
        let clock = Arc::new(ManualClock::new());
        let xloop = make_loop(clock.clone());
        let port = xloop.cpu().shared().ports.allocate(CpuId(0)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        xloop
            .cpu()
            .port_set_handler(port, Arc::new(move |m: Message| s.lock().push(m.id())))
            .unwrap();
        xloop.post_message_delayed(Message::alloc(0x33, 0).to_port(port), 3);
        xloop.run_until_idle();
        clock.set(3);
        assert_eq!(xloop.run_once(Some(0)), Some(Dispatched::Message(0x33)));
        assert_eq!(*seen.lock(), [0x33]);
    }

    #[test]
    fn expired_message_meeting_a_full_queue_is_counted() {
        let clock = Arc::new(ManualClock::new());
        let cpu = Cpu::new(CpuId(0), Arc::new(SharedData::new()));
        let xloop = Xloop::new(cpu, Arc::new(Queue::with_limit(1)), clock.clone());
        let port = xloop.cpu().shared().ports.allocate(CpuId(0)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        xloop
            .cpu()
            .port_set_handler(port, Arc::new(move |m: Message| s.lock().push(m.id())))
            .unwrap();

        xloop.post_message_delayed(Message::alloc(0x33, 0).to_port(port), 1);
        xloop.run_until_idle();
        xloop.post_message(Message::alloc(0x44, 0).to_port(port)).unwrap();
        clock.set(1);
        xloop.run_until_idle();

        assert_eq!(*seen.lock(), [0x44]);
        assert_eq!(xloop.delayed_len(), 0);
        let stats = xloop.cpu().stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.routing_errors, 1);
    }
}
