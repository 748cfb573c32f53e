use crate::error::{Error, Result};
use crate::memory_region::MemoryRegion;
use crate::queue_pair::{QueuePairState, RcQueuePair};
use crate::ticket::{Command, ControlFrame, FrameKind, Ticket, FRAME_LEN};
use crate::transfer_future::{FailureCause, TransferFuture};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use rdma_sys::ibv_wc_opcode;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Tag bit distinguishing control-frame `wr_id`s from data `wr_id`s on the
/// send completion queue
const CTRL_WR_BIT: u64 = 1_u64 << 63_u32;
/// Send work requests held back from the hardware limit
const SEND_WR_SAFETY_MARGIN: u32 = 16;
/// Bounded retries for a transient post failure
const POST_RETRY_LIMIT: u32 = 16;
/// Work completions drained per poll
const POLL_BATCH: usize = 32;
/// How long workers let in-flight work requests drain at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);
/// Spin rounds before an idle worker starts yielding
const IDLE_SPINS: u32 = 64;
/// Yield rounds before an idle worker starts sleeping
const IDLE_YIELDS: u32 = 1024;
/// Sleep interval for a worker whose queues stay empty
const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// Signature of the user-supplied copy routine for the bounce-buffer
/// protocol. Must return 0 on success. Allows GPU device memory on either
/// side of the copy.
pub type MemCpyFn = fn(dst: *mut u8, src: *const u8, len: u64) -> i32;

/// Per-stream FIFOs keyed by stream id.
///
/// A `HashMap` of ring buffers rather than an ordered map: streams are
/// independent, only the order inside one stream matters.
#[derive(Debug)]
struct StreamQueues<T> {
    /// one FIFO per stream
    queues: HashMap<u32, VecDeque<T>>,
}

impl<T> StreamQueues<T> {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    fn push(&mut self, stream_id: u32, item: T) {
        self.queues.entry(stream_id).or_default().push_back(item);
    }

    fn front(&self, stream_id: u32) -> Option<&T> {
        self.queues.get(&stream_id).and_then(VecDeque::front)
    }

    fn pop(&mut self, stream_id: u32) -> Option<T> {
        let queue = self.queues.get_mut(&stream_id)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            let _ = self.queues.remove(&stream_id);
        }
        item
    }

    fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    fn stream_ids(&self) -> Vec<u32> {
        self.queues.keys().copied().collect()
    }

    /// Take every queued item, in per-stream order
    fn drain_all(&mut self) -> Vec<T> {
        let mut items = Vec::new();
        for (_, mut queue) in self.queues.drain() {
            items.extend(queue.drain(..));
        }
        items
    }
}

/// Poisoning state: the first fatal cause wins and is fanned out to every
/// tracked future
#[derive(Debug, Default)]
struct FatalFlag {
    /// Set when a fatal error stops the engine
    poisoned: AtomicBool,
    /// The first fatal cause
    cause: Mutex<Option<FailureCause>>,
}

impl FatalFlag {
    /// Record the first fatal cause and mark the engine poisoned
    fn poison(&self, cause: FailureCause) {
        let mut slot = self.cause.lock();
        if slot.is_none() {
            error!("transfer engine poisoned: {:?}", cause);
            *slot = Some(cause);
        }
        drop(slot);
        self.poisoned.store(true, Ordering::Release);
    }

    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// The recorded cause, for resolving futures after poisoning
    fn cause(&self) -> FailureCause {
        self.cause.lock().unwrap_or(FailureCause::InvalidState)
    }
}

/// State both workers share
#[derive(Debug)]
struct Shared {
    /// The queue pair both workers drive. The send worker is the only
    /// thread posting to the send queue and polling the send CQ; the recv
    /// worker owns the receive side the same way.
    qp: Arc<RcQueuePair>,
    /// Set once by the engine destructor
    finalized: AtomicBool,
    /// Poisoning state
    fatal: FatalFlag,
}

impl Shared {
    fn new(qp: Arc<RcQueuePair>) -> Self {
        Self {
            qp,
            finalized: AtomicBool::new(false),
            fatal: FatalFlag::default(),
        }
    }

    fn poison(&self, cause: FailureCause) {
        self.fatal.poison(cause);
    }

    fn is_poisoned(&self) -> bool {
        self.fatal.is_poisoned()
    }

    fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    fn fatal_cause(&self) -> FailureCause {
        self.fatal.cause()
    }
}

/// Backoff for a worker iteration that made no progress
#[derive(Debug, Default)]
struct IdleBackoff {
    /// consecutive idle iterations
    rounds: u32,
}

impl IdleBackoff {
    fn reset(&mut self) {
        self.rounds = 0;
    }

    fn idle(&mut self) {
        if self.rounds < IDLE_SPINS {
            std::hint::spin_loop();
        } else if self.rounds < IDLE_YIELDS {
            thread::yield_now();
        } else {
            thread::sleep(IDLE_SLEEP);
        }
        self.rounds = self.rounds.saturating_add(1);
    }
}

/// Retry a post whose failure errno is transient; any other failure (or
/// retry exhaustion) is returned for the caller to treat as fatal
fn post_with_retry(mut post: impl FnMut() -> Result<()>) -> Result<()> {
    let mut delay_us = 1_u64;
    let mut last = None;
    for _ in 0..POST_RETRY_LIMIT {
        match post() {
            Ok(()) => return Ok(()),
            Err(Error::PostFailed(errno))
                if errno == libc::ENOMEM || errno == libc::EAGAIN =>
            {
                last = Some(errno);
                thread::sleep(Duration::from_micros(delay_us));
                delay_us = delay_us.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
    Err(Error::PostFailed(last.unwrap_or(libc::ENOMEM)))
}

/// Which protocol the engine was created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiVersion {
    /// Zero-copy writes into receiver-advertised slots
    V1,
    /// Legacy bounce-buffer SEND/RECV path
    V2,
}

/// The transfer-coordination engine.
///
/// Gives users a symmetric `send(stream, addr, len, lkey)` /
/// `recv(stream, addr, len, rkey)` over one RC queue pair, multiplexing
/// arbitrary streams and hiding the RDMA mechanics. Within one stream the
/// N-th `send` on this side pairs with the N-th `recv` on the peer; across
/// streams there is no ordering.
///
/// Two background threads drive the queue pair: the send worker posts every
/// send-queue work request and drains the send CQ, the recv worker posts
/// every receive-queue work request and drains the recv CQ.
#[derive(Debug)]
pub struct TcclContext {
    /// user -> send worker
    send_requests: Arc<SegQueue<Command>>,
    /// user -> recv worker
    recv_requests: Arc<SegQueue<Command>>,
    /// flags shared with the workers
    shared: Arc<Shared>,
    /// the send worker thread
    send_worker: Option<JoinHandle<()>>,
    /// the recv worker thread
    recv_worker: Option<JoinHandle<()>>,
    /// which protocol this engine runs
    api_version: ApiVersion,
    /// declared after `shared`: the control staging rings must only be
    /// deregistered once the queue pair (and its posted receives) is gone
    _staging: Vec<Arc<MemoryRegion>>,
}

impl TcclContext {
    /// Create an engine speaking the recommended zero-copy protocol.
    ///
    /// Consumes ownership of an already-RTS queue pair and spawns the two
    /// worker threads. The engine allocates two small host staging rings
    /// for control frames and pre-posts the whole receive ring.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the queue pair has not reached RTS, or any error
    /// from staging-ring allocation and pre-posting.
    pub fn create_v1(qp: RcQueuePair) -> Result<Arc<Self>> {
        if qp.query_state()? != QueuePairState::ReadyToSend {
            return Err(Error::InvalidState(
                "the transfer engine requires an RTS queue pair".to_owned(),
            ));
        }
        let qp = Arc::new(qp);
        let ring_slots = *qp.cap().max_recv_wr();

        let send_staging = Arc::new(MemoryRegion::alloc_host(
            qp.pd(),
            (ring_slots as usize) * FRAME_LEN,
        )?);
        let recv_staging = Arc::new(MemoryRegion::alloc_host(
            qp.pd(),
            (ring_slots as usize) * FRAME_LEN,
        )?);

        // the workers are not running yet, pre-posting from here is the only
        // time the receive queue is touched outside the recv worker
        for slot in 0..ring_slots {
            qp.post_recv(
                u64::from(slot),
                recv_staging.addr() + u64::from(slot) * FRAME_LEN as u64,
                FRAME_LEN as u32,
                recv_staging.lkey(),
            )?;
        }

        let send_requests = Arc::new(SegQueue::new());
        let recv_requests = Arc::new(SegQueue::new());
        let announce_frames = Arc::new(SegQueue::new());
        let remote_tickets = Arc::new(SegQueue::new());
        let shared = Arc::new(Shared::new(Arc::<RcQueuePair>::clone(&qp)));

        let send_worker = {
            let worker = SendWorker {
                shared: Arc::<Shared>::clone(&shared),
                staging: Arc::<MemoryRegion>::clone(&send_staging),
                free_slots: (0..ring_slots).rev().collect(),
                send_requests: Arc::<SegQueue<Command>>::clone(&send_requests),
                announce_frames: Arc::<SegQueue<ControlFrame>>::clone(&announce_frames),
                remote_tickets: Arc::<SegQueue<Ticket>>::clone(&remote_tickets),
                announce_backlog: VecDeque::new(),
                pending_sends: StreamQueues::new(),
                remote_slots: StreamQueues::new(),
                inflight: HashMap::new(),
                next_data_wr_id: 0,
                outstanding: 0,
                cap: (*qp.cap().max_send_wr()).saturating_sub(SEND_WR_SAFETY_MARGIN),
            };
            thread::Builder::new()
                .name("tccl-send".to_owned())
                .spawn(move || worker.run())
                .map_err(|err| Error::InvalidState(format!("failed to spawn worker: {err}")))?
        };
        let recv_worker = {
            let worker = RecvWorker {
                shared: Arc::<Shared>::clone(&shared),
                staging: Arc::<MemoryRegion>::clone(&recv_staging),
                recv_requests: Arc::<SegQueue<Command>>::clone(&recv_requests),
                announce_frames,
                remote_tickets,
                expected: StreamQueues::new(),
            };
            let spawned = thread::Builder::new()
                .name("tccl-recv".to_owned())
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    // let the already-running send worker exit
                    shared.finalized.store(true, Ordering::Release);
                    return Err(Error::InvalidState(format!(
                        "failed to spawn worker: {err}"
                    )));
                }
            }
        };

        Ok(Arc::new(Self {
            send_requests,
            recv_requests,
            shared,
            send_worker: Some(send_worker),
            recv_worker: Some(recv_worker),
            api_version: ApiVersion::V1,
            _staging: vec![send_staging, recv_staging],
        }))
    }

    /// Create an engine speaking the legacy bounce-buffer protocol.
    ///
    /// Every transfer is staged through the two pre-registered bounce
    /// regions with the user-supplied `mem_cpy` routine, which doubles the
    /// memory-copy bill but avoids exchanging remote keys.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the queue pair has not reached RTS.
    #[deprecated(note = "the bounce-buffer protocol is kept for compatibility, use create_v1")]
    pub fn create_v2(
        qp: RcQueuePair,
        device_send_buffer: Arc<MemoryRegion>,
        device_recv_buffer: Arc<MemoryRegion>,
        mem_cpy: MemCpyFn,
    ) -> Result<Arc<Self>> {
        if qp.query_state()? != QueuePairState::ReadyToSend {
            return Err(Error::InvalidState(
                "the transfer engine requires an RTS queue pair".to_owned(),
            ));
        }
        let qp = Arc::new(qp);
        let send_requests = Arc::new(SegQueue::new());
        let recv_requests = Arc::new(SegQueue::new());
        let shared = Arc::new(Shared::new(Arc::<RcQueuePair>::clone(&qp)));

        let send_worker = {
            let worker = SendWorkerV2 {
                shared: Arc::<Shared>::clone(&shared),
                bounce: Arc::<MemoryRegion>::clone(&device_send_buffer),
                mem_cpy,
                send_requests: Arc::<SegQueue<Command>>::clone(&send_requests),
                next_wr_id: 0,
            };
            thread::Builder::new()
                .name("tccl-send-v2".to_owned())
                .spawn(move || worker.run())
                .map_err(|err| Error::InvalidState(format!("failed to spawn worker: {err}")))?
        };
        let recv_worker = {
            let worker = RecvWorkerV2 {
                shared: Arc::<Shared>::clone(&shared),
                bounce: Arc::<MemoryRegion>::clone(&device_recv_buffer),
                mem_cpy,
                recv_requests: Arc::<SegQueue<Command>>::clone(&recv_requests),
                expected: StreamQueues::new(),
                undelivered: None,
                recv_posted: false,
                next_wr_id: 0,
            };
            let spawned = thread::Builder::new()
                .name("tccl-recv-v2".to_owned())
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    // let the already-running send worker exit
                    shared.finalized.store(true, Ordering::Release);
                    return Err(Error::InvalidState(format!(
                        "failed to spawn worker: {err}"
                    )));
                }
            }
        };

        Ok(Arc::new(Self {
            send_requests,
            recv_requests,
            shared,
            send_worker: Some(send_worker),
            recv_worker: Some(recv_worker),
            api_version: ApiVersion::V2,
            _staging: vec![device_send_buffer, device_recv_buffer],
        }))
    }

    /// Queue a send of `[addr, addr+length)` on `stream_id`.
    ///
    /// The bytes go to wherever the peer's matching `recv` points. The
    /// buffer must stay valid and unmodified until the returned future
    /// resolves. With the bounce-buffer protocol the `lkey` is unused.
    ///
    /// # Errors
    ///
    /// `InvalidState` once the engine is finalized or poisoned.
    pub fn send(
        &self,
        stream_id: u32,
        addr: u64,
        length: u32,
        lkey: u32,
    ) -> Result<TransferFuture> {
        self.submit(
            &self.send_requests,
            Ticket {
                stream_id,
                length,
                addr,
                key: lkey,
            },
        )
    }

    /// Queue a receive into `[addr, addr+length)` on `stream_id`.
    ///
    /// The buffer must stay valid until the returned future resolves. With
    /// the bounce-buffer protocol the `rkey` is unused.
    ///
    /// # Errors
    ///
    /// `InvalidState` once the engine is finalized or poisoned.
    pub fn recv(
        &self,
        stream_id: u32,
        addr: u64,
        length: u32,
        rkey: u32,
    ) -> Result<TransferFuture> {
        self.submit(
            &self.recv_requests,
            Ticket {
                stream_id,
                length,
                addr,
                key: rkey,
            },
        )
    }

    /// Hand one request to a worker
    fn submit(&self, queue: &SegQueue<Command>, ticket: Ticket) -> Result<TransferFuture> {
        if self.shared.is_finalized() || self.shared.is_poisoned() {
            return Err(Error::InvalidState(
                "the transfer engine is shut down".to_owned(),
            ));
        }
        let future = TransferFuture::new();
        queue.push(Command {
            ticket,
            future: future.clone(),
        });
        Ok(future)
    }

    /// Whether this engine runs the legacy bounce-buffer protocol
    #[must_use]
    pub fn is_bounce_buffer(&self) -> bool {
        self.api_version == ApiVersion::V2
    }
}

impl Drop for TcclContext {
    fn drop(&mut self) {
        self.shared.finalized.store(true, Ordering::Release);
        if let Some(handle) = self.send_worker.take() {
            if handle.join().is_err() {
                error!("send worker panicked");
            }
        }
        if let Some(handle) = self.recv_worker.take() {
            if handle.join().is_err() {
                error!("recv worker panicked");
            }
        }
    }
}

/// The worker owning the send queue and the send completion queue
struct SendWorker {
    /// shared engine state
    shared: Arc<Shared>,
    /// host staging ring for outbound control frames
    staging: Arc<MemoryRegion>,
    /// staging slots not referenced by an in-flight control SEND
    free_slots: Vec<u32>,
    /// user send requests
    send_requests: Arc<SegQueue<Command>>,
    /// control frames handed over by the recv worker
    announce_frames: Arc<SegQueue<ControlFrame>>,
    /// peer-advertised landing slots handed over by the recv worker
    remote_tickets: Arc<SegQueue<Ticket>>,
    /// frames drained from `announce_frames`, kept in order while waiting
    /// for a staging slot
    announce_backlog: VecDeque<ControlFrame>,
    /// sends waiting for a peer slot, per stream
    pending_sends: StreamQueues<Command>,
    /// peer slots waiting for a local send, per stream
    remote_slots: StreamQueues<Ticket>,
    /// posted data writes, by `wr_id`
    inflight: HashMap<u64, TransferFuture>,
    /// next data `wr_id`
    next_data_wr_id: u64,
    /// signaled work requests posted but not yet completed
    outstanding: u32,
    /// `outstanding` ceiling
    cap: u32,
}

impl SendWorker {
    fn run(mut self) {
        debug!("send worker started, outstanding cap {}", self.cap);
        let mut backoff = IdleBackoff::default();
        loop {
            let mut progressed = false;
            if self.shared.is_poisoned() {
                progressed |= self.resolve_incoming_poisoned();
            } else {
                progressed |= self.flush_announces();
                progressed |= self.drain_send_requests();
                progressed |= self.drain_remote_tickets();
                progressed |= self.match_and_post();
            }
            progressed |= self.poll_completions();

            if self.shared.is_finalized()
                && self.send_requests.is_empty()
                && self.announce_frames.is_empty()
            {
                break;
            }
            if progressed {
                backoff.reset();
            } else {
                backoff.idle();
            }
        }
        self.shutdown();
        debug!("send worker stopped");
    }

    /// Whether one more signaled work request may be posted
    fn below_cap(&self) -> bool {
        self.outstanding < self.cap
    }

    /// Post control frames from the backlog while slots and budget last
    fn flush_announces(&mut self) -> bool {
        while let Some(frame) = self.announce_frames.pop() {
            self.announce_backlog.push_back(frame);
        }
        let mut progressed = false;
        while !self.announce_backlog.is_empty() {
            if !self.below_cap() || self.free_slots.is_empty() {
                break;
            }
            // both checked non-empty above
            #[allow(clippy::unwrap_used)]
            let frame = self.announce_backlog.pop_front().unwrap();
            if let Err(err) = self.post_control_frame(&frame) {
                self.fatal_post_error(&err);
                return progressed;
            }
            progressed = true;
        }
        progressed
    }

    /// Encode `frame` into a free staging slot and SEND it, signaled
    fn post_control_frame(&mut self, frame: &ControlFrame) -> Result<()> {
        // the caller checked `free_slots` is non-empty
        #[allow(clippy::unwrap_used)]
        let slot = self.free_slots.pop().unwrap();
        let offset = u64::from(slot) * FRAME_LEN as u64;
        let bytes = frame.encode();
        // SAFETY: the slot is inside the staging region and not referenced
        // by any in-flight work request
        unsafe {
            let dst = (self.staging.addr() + offset) as *mut u8;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, FRAME_LEN);
        }
        let res = post_with_retry(|| {
            self.shared.qp.post_send(
                CTRL_WR_BIT | u64::from(slot),
                self.staging.addr() + offset,
                FRAME_LEN as u32,
                self.staging.lkey(),
                true,
            )
        });
        match res {
            Ok(()) => {
                self.outstanding = self.outstanding.saturating_add(1);
                Ok(())
            }
            Err(err) => {
                self.free_slots.push(slot);
                Err(err)
            }
        }
    }

    /// Move queued user sends into the per-stream pending map
    fn drain_send_requests(&mut self) -> bool {
        let mut progressed = false;
        while let Some(cmd) = self.send_requests.pop() {
            self.pending_sends.push(cmd.ticket.stream_id, cmd);
            progressed = true;
        }
        progressed
    }

    /// Move peer-advertised slots into the per-stream map
    fn drain_remote_tickets(&mut self) -> bool {
        let mut progressed = false;
        while let Some(ticket) = self.remote_tickets.pop() {
            self.remote_slots.push(ticket.stream_id, ticket);
            progressed = true;
        }
        progressed
    }

    /// Pair pending sends with peer slots, strictly FIFO per stream, and
    /// post the data writes
    fn match_and_post(&mut self) -> bool {
        let mut progressed = false;
        for stream_id in self.remote_slots.stream_ids() {
            loop {
                if !self.below_cap() {
                    return progressed;
                }
                let (Some(cmd), Some(slot)) = (
                    self.pending_sends.front(stream_id),
                    self.remote_slots.front(stream_id),
                ) else {
                    break;
                };
                let local = cmd.ticket.length;
                let remote = slot.length;
                if local == remote {
                    // both fronts exist
                    #[allow(clippy::unwrap_used)]
                    let cmd = self.pending_sends.pop(stream_id).unwrap();
                    #[allow(clippy::unwrap_used)]
                    let slot = self.remote_slots.pop(stream_id).unwrap();
                    if let Err(err) = self.post_data_write(&cmd, &slot) {
                        cmd.future.resolve_failure(post_cause(&err));
                        self.fatal_post_error(&err);
                        return progressed;
                    }
                    progressed = true;
                } else {
                    // a reject frame must reach the wire before any later
                    // write on this queue pair, or the peer pops the wrong
                    // expected entry; stall until a slot frees up
                    if self.free_slots.is_empty() {
                        return progressed;
                    }
                    #[allow(clippy::unwrap_used)]
                    let cmd = self.pending_sends.pop(stream_id).unwrap();
                    #[allow(clippy::unwrap_used)]
                    let slot = self.remote_slots.pop(stream_id).unwrap();
                    warn!(
                        "length mismatch on stream {stream_id}: local {local}, remote {remote}"
                    );
                    let _ = cmd.future.resolve_failure(FailureCause::LengthMismatch {
                        stream_id,
                        local,
                        remote,
                    });
                    let reject = ControlFrame {
                        kind: FrameKind::LengthReject,
                        ticket: Ticket {
                            stream_id,
                            length: local,
                            addr: slot.addr,
                            key: 0,
                        },
                    };
                    if let Err(err) = self.post_control_frame(&reject) {
                        self.fatal_post_error(&err);
                        return progressed;
                    }
                    progressed = true;
                }
            }
        }
        progressed
    }

    /// RDMA-write the matched pair, immediate data carrying the stream id
    fn post_data_write(&mut self, cmd: &Command, slot: &Ticket) -> Result<()> {
        let wr_id = self.next_data_wr_id;
        post_with_retry(|| {
            self.shared.qp.post_write_with_imm(
                wr_id,
                cmd.ticket.addr,
                slot.addr,
                cmd.ticket.length,
                cmd.ticket.stream_id,
                cmd.ticket.key,
                slot.key,
                true,
            )
        })?;
        self.next_data_wr_id = self.next_data_wr_id.wrapping_add(1);
        self.outstanding = self.outstanding.saturating_add(1);
        let _ = self.inflight.insert(wr_id, cmd.future.clone());
        Ok(())
    }

    /// Drain the send completion queue once
    fn poll_completions(&mut self) -> bool {
        let wcs = match self.shared.qp.poll_send_cq_once(POLL_BATCH) {
            Ok(wcs) => wcs,
            Err(err) => {
                self.fatal_post_error(&err);
                return false;
            }
        };
        let mut progressed = false;
        for wc in wcs {
            progressed = true;
            self.outstanding = self.outstanding.saturating_sub(1);
            if !wc.is_success() {
                self.poison_with(FailureCause::WcFailed(wc.status));
                continue;
            }
            if wc.wr_id & CTRL_WR_BIT != 0 {
                self.free_slots.push((wc.wr_id & !CTRL_WR_BIT) as u32);
            } else if let Some(future) = self.inflight.remove(&wc.wr_id) {
                let _ = future.resolve_success();
            } else {
                warn!("send completion for unknown wr_id {}", wc.wr_id);
            }
        }
        progressed
    }

    /// While poisoned, fail queued requests instead of queueing work
    fn resolve_incoming_poisoned(&mut self) -> bool {
        let cause = self.shared.fatal_cause();
        let mut progressed = false;
        while let Some(cmd) = self.send_requests.pop() {
            let _ = cmd.future.resolve_failure(cause);
            progressed = true;
        }
        while self.announce_frames.pop().is_some() {
            progressed = true;
        }
        while self.remote_tickets.pop().is_some() {
            progressed = true;
        }
        for cmd in self.pending_sends.drain_all() {
            let _ = cmd.future.resolve_failure(cause);
            progressed = true;
        }
        for (_, future) in self.inflight.drain() {
            let _ = future.resolve_failure(cause);
            progressed = true;
        }
        progressed
    }

    /// Poison the engine with a post/poll error
    fn fatal_post_error(&mut self, err: &Error) {
        self.poison_with(post_cause(err));
    }

    /// Poison the engine and fail everything this worker tracks
    fn poison_with(&mut self, cause: FailureCause) {
        self.shared.poison(cause);
        let cause = self.shared.fatal_cause();
        for cmd in self.pending_sends.drain_all() {
            let _ = cmd.future.resolve_failure(cause);
        }
        for (_, future) in self.inflight.drain() {
            let _ = future.resolve_failure(cause);
        }
    }

    /// Let in-flight writes drain for one grace interval, then cancel
    /// whatever is left
    fn shutdown(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.inflight.is_empty() && Instant::now() < deadline {
            match self.shared.qp.poll_send_cq_once(POLL_BATCH) {
                Ok(wcs) => {
                    for wc in wcs {
                        // fatal statuses arriving during teardown are ignored
                        if wc.is_success() && wc.wr_id & CTRL_WR_BIT == 0 {
                            if let Some(future) = self.inflight.remove(&wc.wr_id) {
                                let _ = future.resolve_success();
                            }
                        }
                    }
                }
                Err(_) => break,
            }
            thread::yield_now();
        }
        for (_, future) in self.inflight.drain() {
            let _ = future.resolve_failure(FailureCause::Cancelled);
        }
        for cmd in self.pending_sends.drain_all() {
            let _ = cmd.future.resolve_failure(FailureCause::Cancelled);
        }
        while let Some(cmd) = self.send_requests.pop() {
            let _ = cmd.future.resolve_failure(FailureCause::Cancelled);
        }
    }
}

/// The worker owning the receive queue and the receive completion queue
struct RecvWorker {
    /// shared engine state
    shared: Arc<Shared>,
    /// host staging ring backing the pre-posted receive slots
    staging: Arc<MemoryRegion>,
    /// user recv requests
    recv_requests: Arc<SegQueue<Command>>,
    /// control frames handed to the send worker for transmission
    announce_frames: Arc<SegQueue<ControlFrame>>,
    /// peer-advertised slots handed to the send worker
    remote_tickets: Arc<SegQueue<Ticket>>,
    /// local recvs awaiting the peer's write, per stream
    expected: StreamQueues<Command>,
}

impl RecvWorker {
    fn run(mut self) {
        debug!("recv worker started");
        let mut backoff = IdleBackoff::default();
        loop {
            let mut progressed = false;
            if self.shared.is_poisoned() {
                progressed |= self.resolve_incoming_poisoned();
            } else {
                progressed |= self.drain_recv_requests();
            }
            progressed |= self.poll_completions();

            if self.shared.is_finalized() && self.recv_requests.is_empty() {
                break;
            }
            if progressed {
                backoff.reset();
            } else {
                backoff.idle();
            }
        }
        self.shutdown();
        debug!("recv worker stopped");
    }

    /// Record expected recvs and hand their announcements to the send worker
    fn drain_recv_requests(&mut self) -> bool {
        let mut progressed = false;
        while let Some(cmd) = self.recv_requests.pop() {
            self.announce_frames.push(ControlFrame {
                kind: FrameKind::RecvAnnounce,
                ticket: cmd.ticket,
            });
            self.expected.push(cmd.ticket.stream_id, cmd);
            progressed = true;
        }
        progressed
    }

    /// Drain the receive completion queue once: control frames from the
    /// peer and completions of inbound data writes
    fn poll_completions(&mut self) -> bool {
        let wcs = match self.shared.qp.poll_recv_cq_once(POLL_BATCH) {
            Ok(wcs) => wcs,
            Err(err) => {
                self.poison_with(post_cause(&err));
                return false;
            }
        };
        let mut progressed = false;
        for wc in wcs {
            progressed = true;
            if !wc.is_success() {
                self.poison_with(FailureCause::WcFailed(wc.status));
                continue;
            }
            let slot = wc.wr_id as u32;
            if wc.opcode == ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM {
                // the peer's write landed, imm_data names the stream
                match wc.imm_data {
                    Some(stream_id) => self.complete_expected(stream_id),
                    None => warn!("inbound write completion without imm_data"),
                }
            } else {
                self.handle_control_frame(slot);
            }
            self.repost_slot(slot);
        }
        progressed
    }

    /// Resolve the head of the stream's expected queue
    fn complete_expected(&mut self, stream_id: u32) {
        match self.expected.pop(stream_id) {
            Some(cmd) => {
                let _ = cmd.future.resolve_success();
            }
            None => warn!("inbound write on stream {stream_id} without a matching recv"),
        }
    }

    /// Decode one staging slot written by an inbound control SEND
    fn handle_control_frame(&mut self, slot: u32) {
        let offset = u64::from(slot) * FRAME_LEN as u64;
        // SAFETY: the slot is inside the staging region; the hardware wrote
        // it before signaling the completion that brought us here
        let bytes = unsafe {
            std::slice::from_raw_parts((self.staging.addr() + offset) as *const u8, FRAME_LEN)
        };
        let Some(frame) = ControlFrame::decode(bytes) else {
            warn!("undecodable control frame in slot {slot}");
            return;
        };
        match frame.kind {
            FrameKind::RecvAnnounce => self.remote_tickets.push(frame.ticket),
            FrameKind::LengthReject => {
                let stream_id = frame.ticket.stream_id;
                match self.expected.pop(stream_id) {
                    Some(cmd) => {
                        let _ = cmd.future.resolve_failure(FailureCause::LengthMismatch {
                            stream_id,
                            local: cmd.ticket.length,
                            remote: frame.ticket.length,
                        });
                    }
                    None => warn!("length reject on stream {stream_id} without a matching recv"),
                }
            }
        }
    }

    /// Put a consumed receive slot back on the queue pair
    fn repost_slot(&mut self, slot: u32) {
        let offset = u64::from(slot) * FRAME_LEN as u64;
        let res = post_with_retry(|| {
            self.shared.qp.post_recv(
                u64::from(slot),
                self.staging.addr() + offset,
                FRAME_LEN as u32,
                self.staging.lkey(),
            )
        });
        if let Err(err) = res {
            self.poison_with(post_cause(&err));
        }
    }

    /// While poisoned, fail queued requests instead of queueing work
    fn resolve_incoming_poisoned(&mut self) -> bool {
        let cause = self.shared.fatal_cause();
        let mut progressed = false;
        while let Some(cmd) = self.recv_requests.pop() {
            let _ = cmd.future.resolve_failure(cause);
            progressed = true;
        }
        for cmd in self.expected.drain_all() {
            let _ = cmd.future.resolve_failure(cause);
            progressed = true;
        }
        progressed
    }

    /// Poison the engine and fail everything this worker tracks
    fn poison_with(&mut self, cause: FailureCause) {
        self.shared.poison(cause);
        let cause = self.shared.fatal_cause();
        for cmd in self.expected.drain_all() {
            let _ = cmd.future.resolve_failure(cause);
        }
    }

    /// Let in-flight writes land for one grace interval, then cancel the
    /// recvs that never matched
    fn shutdown(&mut self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.expected.is_empty() && Instant::now() < deadline {
            match self.shared.qp.poll_recv_cq_once(POLL_BATCH) {
                Ok(wcs) => {
                    for wc in wcs {
                        // fatal statuses arriving during teardown are ignored
                        if wc.is_success()
                            && wc.opcode == ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM
                        {
                            if let Some(stream_id) = wc.imm_data {
                                self.complete_expected(stream_id);
                            }
                        }
                    }
                }
                Err(_) => break,
            }
            thread::yield_now();
        }
        for cmd in self.expected.drain_all() {
            let _ = cmd.future.resolve_failure(FailureCause::Cancelled);
        }
        while let Some(cmd) = self.recv_requests.pop() {
            let _ = cmd.future.resolve_failure(FailureCause::Cancelled);
        }
    }
}

/// Map a post/poll error to the cause stored on futures
fn post_cause(err: &Error) -> FailureCause {
    match *err {
        Error::PostFailed(errno) => FailureCause::PostFailed(errno),
        Error::WcFailed(ref wc_err) => FailureCause::WcFailed(*wc_err as u32),
        _ => FailureCause::InvalidState,
    }
}

/// Legacy bounce-buffer send worker: copy in, SEND_WITH_IMM, wait, resolve.
/// One transfer in flight at a time.
struct SendWorkerV2 {
    /// shared engine state
    shared: Arc<Shared>,
    /// the pre-registered send bounce region
    bounce: Arc<MemoryRegion>,
    /// user-supplied copy routine
    mem_cpy: MemCpyFn,
    /// user send requests
    send_requests: Arc<SegQueue<Command>>,
    /// next `wr_id`
    next_wr_id: u64,
}

impl SendWorkerV2 {
    fn run(mut self) {
        debug!("bounce-buffer send worker started");
        let mut backoff = IdleBackoff::default();
        loop {
            if self.shared.is_poisoned() {
                let cause = self.shared.fatal_cause();
                while let Some(cmd) = self.send_requests.pop() {
                    let _ = cmd.future.resolve_failure(cause);
                }
            } else if let Some(cmd) = self.send_requests.pop() {
                self.transfer(&cmd);
                backoff.reset();
                continue;
            }
            if self.shared.is_finalized() && self.send_requests.is_empty() {
                break;
            }
            backoff.idle();
        }
        while let Some(cmd) = self.send_requests.pop() {
            let _ = cmd.future.resolve_failure(FailureCause::Cancelled);
        }
        debug!("bounce-buffer send worker stopped");
    }

    /// Run one send end-to-end
    fn transfer(&mut self, cmd: &Command) {
        let len = cmd.ticket.length;
        if len as usize > self.bounce.length() {
            let _ = cmd.future.resolve_failure(FailureCause::InvalidState);
            return;
        }
        let rc = (self.mem_cpy)(
            self.bounce.addr() as *mut u8,
            cmd.ticket.addr as *const u8,
            u64::from(len),
        );
        if rc != 0_i32 {
            let _ = cmd.future.resolve_failure(FailureCause::InvalidState);
            return;
        }
        let wr_id = self.next_wr_id;
        self.next_wr_id = self.next_wr_id.wrapping_add(1);
        let res = post_with_retry(|| {
            self.shared.qp.post_send_with_imm(
                wr_id,
                self.bounce.addr(),
                len,
                self.bounce.lkey(),
                cmd.ticket.stream_id,
                true,
            )
        });
        if let Err(err) = res {
            let cause = post_cause(&err);
            let _ = cmd.future.resolve_failure(cause);
            self.shared.poison(cause);
            return;
        }
        // serialized: the bounce buffer is reused only after this completes
        loop {
            match self.shared.qp.poll_send_cq_once(1) {
                Ok(wcs) => {
                    if let Some(wc) = wcs.first() {
                        if wc.is_success() {
                            let _ = cmd.future.resolve_success();
                        } else {
                            let cause = FailureCause::WcFailed(wc.status);
                            let _ = cmd.future.resolve_failure(cause);
                            self.shared.poison(cause);
                        }
                        return;
                    }
                }
                Err(err) => {
                    let cause = post_cause(&err);
                    let _ = cmd.future.resolve_failure(cause);
                    self.shared.poison(cause);
                    return;
                }
            }
            if self.shared.is_poisoned() {
                let _ = cmd.future.resolve_failure(self.shared.fatal_cause());
                return;
            }
            std::hint::spin_loop();
        }
    }
}

/// Legacy bounce-buffer recv worker: one posted receive covering the bounce
/// region, copy out on match, repost afterwards. The repost gap is covered
/// by the queue pair's RNR retry.
struct RecvWorkerV2 {
    /// shared engine state
    shared: Arc<Shared>,
    /// the pre-registered recv bounce region
    bounce: Arc<MemoryRegion>,
    /// user-supplied copy routine
    mem_cpy: MemCpyFn,
    /// user recv requests
    recv_requests: Arc<SegQueue<Command>>,
    /// local recvs awaiting inbound data, per stream
    expected: StreamQueues<Command>,
    /// a landed message waiting for its matching recv: `(stream, byte_len)`
    undelivered: Option<(u32, u32)>,
    /// whether the bounce region currently backs a posted receive
    recv_posted: bool,
    /// next `wr_id`
    next_wr_id: u64,
}

impl RecvWorkerV2 {
    fn run(mut self) {
        debug!("bounce-buffer recv worker started");
        let mut backoff = IdleBackoff::default();
        loop {
            let mut progressed = false;
            if self.shared.is_poisoned() {
                let cause = self.shared.fatal_cause();
                while let Some(cmd) = self.recv_requests.pop() {
                    let _ = cmd.future.resolve_failure(cause);
                    progressed = true;
                }
                for cmd in self.expected.drain_all() {
                    let _ = cmd.future.resolve_failure(cause);
                    progressed = true;
                }
            } else {
                while let Some(cmd) = self.recv_requests.pop() {
                    self.expected.push(cmd.ticket.stream_id, cmd);
                    progressed = true;
                }
                self.ensure_recv_posted();
                progressed |= self.poll_inbound();
                progressed |= self.deliver();
            }
            if self.shared.is_finalized() && self.recv_requests.is_empty() {
                break;
            }
            if progressed {
                backoff.reset();
            } else {
                backoff.idle();
            }
        }
        for cmd in self.expected.drain_all() {
            let _ = cmd.future.resolve_failure(FailureCause::Cancelled);
        }
        while let Some(cmd) = self.recv_requests.pop() {
            let _ = cmd.future.resolve_failure(FailureCause::Cancelled);
        }
        debug!("bounce-buffer recv worker stopped");
    }

    /// Keep one receive posted whenever the bounce region is free
    fn ensure_recv_posted(&mut self) {
        if self.recv_posted || self.undelivered.is_some() {
            return;
        }
        let wr_id = self.next_wr_id;
        self.next_wr_id = self.next_wr_id.wrapping_add(1);
        let length: u32 = self.bounce.length().try_into().unwrap_or(u32::MAX);
        let res = post_with_retry(|| {
            self.shared
                .qp
                .post_recv(wr_id, self.bounce.addr(), length, self.bounce.lkey())
        });
        match res {
            Ok(()) => self.recv_posted = true,
            Err(err) => self.shared.poison(post_cause(&err)),
        }
    }

    /// Check for a landed message
    fn poll_inbound(&mut self) -> bool {
        if !self.recv_posted || self.undelivered.is_some() {
            return false;
        }
        let wcs = match self.shared.qp.poll_recv_cq_once(1) {
            Ok(wcs) => wcs,
            Err(err) => {
                self.shared.poison(post_cause(&err));
                return false;
            }
        };
        let Some(wc) = wcs.first() else {
            return false;
        };
        self.recv_posted = false;
        if !wc.is_success() {
            self.shared.poison(FailureCause::WcFailed(wc.status));
            return false;
        }
        match wc.imm_data {
            Some(stream_id) => self.undelivered = Some((stream_id, wc.byte_len)),
            None => warn!("inbound bounce-buffer message without imm_data"),
        }
        true
    }

    /// Copy a landed message out to its matching recv, if one is queued
    fn deliver(&mut self) -> bool {
        let Some((stream_id, byte_len)) = self.undelivered else {
            return false;
        };
        let Some(cmd) = self.expected.pop(stream_id) else {
            return false;
        };
        if cmd.ticket.length == byte_len {
            let rc = (self.mem_cpy)(
                cmd.ticket.addr as *mut u8,
                self.bounce.addr() as *const u8,
                u64::from(byte_len),
            );
            if rc == 0_i32 {
                let _ = cmd.future.resolve_success();
            } else {
                let _ = cmd.future.resolve_failure(FailureCause::InvalidState);
            }
        } else {
            let _ = cmd.future.resolve_failure(FailureCause::LengthMismatch {
                stream_id,
                local: cmd.ticket.length,
                remote: byte_len,
            });
        }
        self.undelivered = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_queues_are_fifo_per_stream() {
        let mut queues = StreamQueues::new();
        queues.push(0, "a0");
        queues.push(1, "b0");
        queues.push(0, "a1");
        queues.push(0, "a2");

        assert_eq!(queues.front(0), Some(&"a0"));
        assert_eq!(queues.pop(0), Some("a0"));
        assert_eq!(queues.pop(0), Some("a1"));
        // stream 1 is untouched by stream 0 traffic
        assert_eq!(queues.front(1), Some(&"b0"));
        assert_eq!(queues.pop(0), Some("a2"));
        assert_eq!(queues.pop(0), None);
        assert_eq!(queues.pop(1), Some("b0"));
        assert!(queues.is_empty());
    }

    #[test]
    fn stream_queues_drain_all_empties() {
        let mut queues = StreamQueues::new();
        for stream in 0..4_u32 {
            for item in 0..8_u32 {
                queues.push(stream, (stream, item));
            }
        }
        let drained = queues.drain_all();
        assert_eq!(drained.len(), 32);
        assert!(queues.is_empty());
    }

    #[test]
    fn stream_ids_reflect_pending_streams() {
        let mut queues = StreamQueues::new();
        queues.push(7, ());
        queues.push(9, ());
        let mut ids = queues.stream_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![7, 9]);
        let _ = queues.pop(7);
        assert_eq!(queues.stream_ids(), vec![9]);
    }

    #[test]
    fn transient_post_failures_are_retried() {
        let mut attempts = 0_u32;
        let res = post_with_retry(|| {
            attempts += 1;
            if attempts < 3 {
                Err(Error::PostFailed(libc::ENOMEM))
            } else {
                Ok(())
            }
        });
        assert!(res.is_ok());
        assert_eq!(attempts, 3);
    }

    #[test]
    fn persistent_post_failures_give_up() {
        let mut attempts = 0_u32;
        let res = post_with_retry(|| {
            attempts += 1;
            Err(Error::PostFailed(libc::EAGAIN))
        });
        assert!(matches!(res, Err(Error::PostFailed(errno)) if errno == libc::EAGAIN));
        assert_eq!(attempts, POST_RETRY_LIMIT);
    }

    #[test]
    fn non_transient_post_failures_fail_fast() {
        let mut attempts = 0_u32;
        let res = post_with_retry(|| {
            attempts += 1;
            Err(Error::PostFailed(libc::EINVAL))
        });
        assert!(matches!(res, Err(Error::PostFailed(errno)) if errno == libc::EINVAL));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn poison_keeps_the_first_cause() {
        let fatal = FatalFlag::default();
        assert!(!fatal.is_poisoned());
        assert_eq!(fatal.cause(), FailureCause::InvalidState);
        fatal.poison(FailureCause::WcFailed(12));
        fatal.poison(FailureCause::Cancelled);
        assert!(fatal.is_poisoned());
        assert_eq!(fatal.cause(), FailureCause::WcFailed(12));
    }
}
