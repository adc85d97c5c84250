//! Per-core runtime context
//!
//! A [`Cpu`] is the view one core has of the platform: the shared port
//! table, the links towards its peers and, on slaves, the synchronous
//! mailbox to the master. All message routing goes through it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error, trace};
use spin::{Once, RwLock};

use crate::clock::Clock;
use crate::config::{MASTER_CPU, NUM_CPU};
use crate::error::{IpcError, PortError};
use crate::ipc::{CpuLink, IpcRequest, IpcRequestCode, SyncIpc};
use crate::message::Message;
use crate::port::MessageHandler;
use crate::queue::{Queue, QueueItem};
use crate::shared::SharedData;
use crate::types::{CpuId, MsgId, PortId};

/// What a dispatch step ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Job,
    Message(MsgId),
}

// ============================================================================
// Statistics
// ============================================================================

/// Routing counters of one core
#[derive(Debug, Default)]
pub struct CpuStats {
    dispatched: AtomicUsize,
    forwarded: AtomicUsize,
    routing_errors: AtomicUsize,
    remote_frees_sent: AtomicUsize,
    remote_frees_received: AtomicUsize,
}

/// Copy of the counters at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStatsSnapshot {
    /// Messages handed to a local handler
    pub dispatched: usize,
    /// Messages sent to another core
    pub forwarded: usize,
    /// Messages released because they could not be routed
    pub routing_errors: usize,
    /// Frees redirected to the origin core
    pub remote_frees_sent: usize,
    /// Frees executed on behalf of another core
    pub remote_frees_received: usize,
}

impl CpuStats {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CpuStatsSnapshot {
        CpuStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            routing_errors: self.routing_errors.load(Ordering::Relaxed),
            remote_frees_sent: self.remote_frees_sent.load(Ordering::Relaxed),
            remote_frees_received: self.remote_frees_received.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Cpu
// ============================================================================

/// Runtime context of one core
pub struct Cpu {
    id: CpuId,
    shared: Arc<SharedData>,
    links: RwLock<[Option<Arc<dyn CpuLink>>; NUM_CPU]>,
    master: Once<Arc<dyn SyncIpc>>,
    stats: CpuStats,
}

impl Cpu {
    /// Create the context of core `id`
    pub fn new(id: CpuId, shared: Arc<SharedData>) -> Arc<Self> {
        assert!(id.index() < NUM_CPU, "{} out of range", id);
        Arc::new(Self {
            id,
            shared,
            links: RwLock::new(core::array::from_fn(|_| None)),
            master: Once::new(),
            stats: CpuStats::default(),
        })
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Whether this core owns the port id space
    pub fn is_master(&self) -> bool {
        self.id == MASTER_CPU
    }

    pub fn shared(&self) -> &Arc<SharedData> {
        &self.shared
    }

    pub fn stats(&self) -> CpuStatsSnapshot {
        self.stats.snapshot()
    }

    /// Install the transport towards `peer` (message sender and free handler)
    pub fn set_link(&self, peer: CpuId, link: Arc<dyn CpuLink>) {
        if let Some(slot) = self.links.write().get_mut(peer.index()) {
            *slot = Some(link);
        }
    }

    fn link(&self, peer: CpuId) -> Option<Arc<dyn CpuLink>> {
        self.links.read().get(peer.index()).cloned().flatten()
    }

    /// Install the synchronous mailbox to the master (slaves only)
    pub fn set_master_ipc(&self, ipc: Arc<dyn SyncIpc>) {
        self.master.call_once(|| ipc);
    }

    /// Issue a synchronous request to the master and block for the answer
    pub fn sync_request(&self, code: IpcRequestCode, param1: u32, param2: u32) -> Result<u32, IpcError> {
        let ipc = self.master.get().ok_or(IpcError::PeerUnreachable(MASTER_CPU))?;
        ipc.request(IpcRequest::new(code, self.id, param1, param2))
    }

    // ========================================================================
    // Ports
    // ========================================================================

    /// Allocate a port owned by this core and bind it to `queue`
    pub fn try_port_alloc(&self, queue: Arc<Queue>) -> Result<PortId, PortError> {
        let port = if self.is_master() {
            self.shared.ports.allocate(self.id)?
        } else {
            let id = self.sync_request(IpcRequestCode::AllocPort, 0, 0)?;
            PortId(id as u16)
        };
        self.shared.ports.bind_queue(port, queue)?;
        debug!("{}: allocated {}", self.id, port);
        Ok(port)
    }

    /// Allocate a port; running out of ports is a boot-time invariant
    /// violation and therefore fatal
    pub fn port_alloc(&self, queue: Arc<Queue>) -> PortId {
        match self.try_port_alloc(queue) {
            Ok(port) => port,
            Err(e) => panic!("{}: port allocation failed: {}", self.id, e),
        }
    }

    /// Install the handler of a port
    pub fn port_set_handler(&self, port: PortId, handler: Arc<dyn MessageHandler>) -> Result<(), PortError> {
        self.shared.ports.set_handler(port, handler)
    }

    /// Owning core of a port
    pub fn port_cpu(&self, port: PortId) -> Option<CpuId> {
        self.shared.ports.cpu_of(port)
    }

    // ========================================================================
    // Routing
    // ========================================================================

    fn forward(&self, peer: CpuId, msg: Message) -> Result<(), PortError> {
        let Some(link) = self.link(peer) else {
            error!("{}: no link to {} for msg {:#x}", self.id, peer, msg.id());
            self.drop_unroutable(msg);
            return Err(PortError::NoLink(peer));
        };
        trace!("{}: forward msg {:#x} to {}", self.id, msg.id(), peer);
        CpuStats::bump(&self.stats.forwarded);
        link.send_message(msg).map_err(|e| {
            error!("{}: link to {} failed: {}", self.id, peer, e);
            CpuStats::bump(&self.stats.routing_errors);
            PortError::Ipc(e)
        })
    }

    /// Count and release a message that cannot reach its destination
    pub(crate) fn drop_unroutable(&self, msg: Message) {
        CpuStats::bump(&self.stats.routing_errors);
        self.free_message(msg);
    }

    /// Post a message to the queue of its destination port, crossing to the
    /// owning core when needed. Unroutable messages are logged and released.
    pub fn send_message(&self, msg: Message) -> Result<(), PortError> {
        let dst = msg.dst();
        let route = match self.shared.ports.route(dst) {
            Ok(route) => route,
            Err(e) => {
                error!("{}: cannot send msg {:#x}: {}", self.id, msg.id(), e);
                self.drop_unroutable(msg);
                return Err(e);
            }
        };
        if route.cpu != self.id {
            return self.forward(route.cpu, msg);
        }
        let Some(queue) = route.queue else {
            error!("{}: {} has no queue", self.id, dst);
            self.drop_unroutable(msg);
            return Err(PortError::Unbound(dst));
        };
        match queue.push_message(msg) {
            Ok(replaced) => {
                if let Some(old) = replaced {
                    trace!("{}: msg {:#x} for {} replaced", self.id, old.id(), dst);
                    self.free_message(old);
                }
                Ok(())
            }
            Err(msg) => {
                error!("{}: queue of {} full, dropping msg {:#x}", self.id, dst, msg.id());
                self.drop_unroutable(msg);
                Err(PortError::QueueFull(dst))
            }
        }
    }

    /// Run the handler of the destination port, or hand the message to the
    /// owning core's sender when the port is remote
    pub fn process_message(&self, msg: Message) {
        let dst = msg.dst();
        let route = match self.shared.ports.route(dst) {
            Ok(route) => route,
            Err(e) => {
                error!("{}: cannot dispatch msg {:#x}: {}", self.id, msg.id(), e);
                self.drop_unroutable(msg);
                return;
            }
        };
        if route.cpu != self.id {
            let _ = self.forward(route.cpu, msg);
            return;
        }
        match route.handler {
            Some(handler) => {
                CpuStats::bump(&self.stats.dispatched);
                handler.handle_message(msg);
            }
            None => {
                error!("{}: {} has no handler", self.id, dst);
                self.drop_unroutable(msg);
            }
        }
    }

    /// Release a message; memory allocated by another core goes back to it
    pub fn free_message(&self, msg: Message) {
        let origin = match self.shared.ports.cpu_of(msg.src()) {
            Some(cpu) if cpu != self.id => cpu,
            _ => return,
        };
        match self.link(origin) {
            Some(link) => {
                CpuStats::bump(&self.stats.remote_frees_sent);
                if let Err(e) = link.free_message(msg) {
                    error!("{}: remote free to {} failed: {}", self.id, origin, e);
                }
            }
            None => debug!("{}: no link to {}, releasing locally", self.id, origin),
        }
    }

    /// Entry point of the link: a message from a peer arrives on this core
    pub fn receive_from_link(&self, msg: Message) {
        trace!("{}: received msg {:#x} for {}", self.id, msg.id(), msg.dst());
        let _ = self.send_message(msg);
    }

    /// Entry point of the link: a peer hands back a message this core owns
    pub fn release_remote(&self, msg: Message) {
        CpuStats::bump(&self.stats.remote_frees_received);
        drop(msg);
    }

    // ========================================================================
    // Queue processing
    // ========================================================================

    /// Run one popped queue item
    pub fn dispatch(&self, item: QueueItem) -> Dispatched {
        match item {
            QueueItem::Job(job) => {
                job.run();
                Dispatched::Job
            }
            QueueItem::Message(msg) => {
                let id = msg.id();
                self.process_message(msg);
                Dispatched::Message(id)
            }
        }
    }

    /// Dispatch at most one pending item without waiting
    pub fn queue_process_message(&self, queue: &Queue) -> Option<Dispatched> {
        queue.pop().map(|item| self.dispatch(item))
    }

    /// Dispatch at most one item, waiting up to `timeout_ms` (forever on
    /// `None`); `None` means the wait expired
    pub fn queue_process_message_wait(
        &self,
        queue: &Queue,
        clock: &dyn Clock,
        timeout_ms: Option<u64>,
    ) -> Option<Dispatched> {
        queue
            .pop_wait(clock, timeout_ms)
            .map(|item| self.dispatch(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ipc::LoopbackLink;
    use crate::message::MsgClass;
    use alloc::vec::Vec;
    use spin::Mutex;

    fn two_cores() -> (Arc<Cpu>, Arc<Cpu>) {
        let shared = Arc::new(SharedData::new());
        let a = Cpu::new(CpuId(0), shared.clone());
        let b = Cpu::new(CpuId(1), shared);
        a.set_link(CpuId(1), Arc::new(LoopbackLink::new(CpuId(1), Arc::downgrade(&b))));
        b.set_link(CpuId(0), Arc::new(LoopbackLink::new(CpuId(0), Arc::downgrade(&a))));
        (a, b)
    }

    fn recorder() -> (Arc<Mutex<Vec<Message>>>, Arc<dyn MessageHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        (seen, Arc::new(move |m: Message| s.lock().push(m)))
    }

    #[test]
    fn local_send_then_process_runs_handler() {
        let (a, _b) = two_cores();
        let q = Arc::new(Queue::new());
        let port = a.port_alloc(q.clone());
        let (seen, handler) = recorder();
        a.port_set_handler(port, handler).unwrap();

        a.send_message(Message::alloc(0x42, 2).to_port(port)).unwrap();
        assert_eq!(a.queue_process_message(&q), Some(Dispatched::Message(0x42)));
        assert_eq!(a.queue_process_message(&q), None);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn remote_port_goes_through_the_link() {
        let (a, b) = two_cores();
        let qb = Arc::new(Queue::new());
        // master allocates on behalf of cpu1, cpu1 binds its queue
        let port = a.shared().ports.allocate(CpuId(1)).unwrap();
        a.shared().ports.bind_queue(port, qb.clone()).unwrap();
        let (seen, handler) = recorder();
        b.port_set_handler(port, handler).unwrap();

        let src_q = Arc::new(Queue::new());
        let src = a.port_alloc(src_q);
        a.send_message(Message::with_body(7, b"xy").to_port(port).from_port(src))
            .unwrap();
        assert_eq!(a.stats().forwarded, 1);
        assert_eq!(qb.len(), 1);
        b.queue_process_message(&qb);
        let msg = seen.lock().pop().unwrap();
        assert_eq!(msg.body(), b"xy");

        // freeing on cpu1 returns the buffer to cpu0
        b.free_message(msg);
        assert_eq!(b.stats().remote_frees_sent, 1);
        assert_eq!(a.stats().remote_frees_received, 1);
    }

    #[test]
    fn replaced_remote_message_returns_to_its_origin() {
        let (a, b) = two_cores();
        let qa = Arc::new(Queue::new());
        let dst = a.port_alloc(qa.clone());
        let handler_cpu = a.clone();
        a.port_set_handler(dst, Arc::new(move |m: Message| handler_cpu.free_message(m)))
            .unwrap();
        let src = a.shared().ports.allocate(CpuId(1)).unwrap();
        a.shared().ports.bind_queue(src, Arc::new(Queue::new())).unwrap();

        for level in [1u8, 2] {
            let msg = Message::alloc(0x21, 0)
                .to_port(dst)
                .from_port(src)
                .priority(level)
                .class(MsgClass::Replace);
            b.send_message(msg).unwrap();
        }
        assert_eq!(qa.len(), 1);
        // the superseded copy went back before anything was dispatched
        assert_eq!(b.stats().remote_frees_received, 1);

        assert_eq!(a.queue_process_message(&qa), Some(Dispatched::Message(0x21)));
        assert_eq!(a.stats().remote_frees_sent, 2);
        assert_eq!(b.stats().remote_frees_received, 2);
    }

    #[test]
    fn unknown_destination_is_reported_not_dropped_silently() {
        let (a, _b) = two_cores();
        let err = a.send_message(Message::alloc(1, 0).to_port(PortId(33)));
        assert_eq!(err, Err(PortError::UnknownPort(PortId(33))));
        assert_eq!(a.stats().routing_errors, 1);
    }

    #[test]
    fn process_without_handler_counts_an_error() {
        let (a, _b) = two_cores();
        let q = Arc::new(Queue::new());
        let port = a.port_alloc(q);
        a.process_message(Message::alloc(1, 0).to_port(port));
        assert_eq!(a.stats().routing_errors, 1);
        assert_eq!(a.stats().dispatched, 0);
    }

    #[test]
    fn wait_variant_times_out() {
        let (a, _b) = two_cores();
        let q = Queue::new();
        let clock = ManualClock::with_idle_step(1);
        assert_eq!(a.queue_process_message_wait(&q, &clock, Some(3)), None);
    }

    #[test]
    fn slave_without_mailbox_cannot_allocate() {
        let (_a, b) = two_cores();
        assert_eq!(
            b.try_port_alloc(Arc::new(Queue::new())),
            Err(PortError::Ipc(IpcError::PeerUnreachable(MASTER_CPU)))
        );
    }
}
