//! The emulated HCA: per-port UDP sockets, the object registries, and
//! the single-threaded cooperative worker that multiplexes receive,
//! deferred work and the QP scheduler.
//!
//! All protocol logic runs on the worker. External callers only lock a
//! QP or CQ briefly to enqueue a request and then signal the worker.

#[cfg(test)]
mod tests;

use std::{
    collections::{HashMap, VecDeque},
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bitvec::vec::BitVec;
use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    config::{Behaviors, FabricConfig},
    constants::{
        LID_PERMISSIVE, MAX_CQE, MAX_CQ_CNT, MGMT_HANDLE_BASE, PACKET_BUFFER, QP0, QP1, QPN_MASK,
    },
    cq::{CompletionHandler, CompletionQueue, CqInsertError, CqNotify},
    error::{Error, Result},
    mem::MemoryRegistry,
    packet::{self, Bth, Deth, Footer, Opcode, ParsedPacket},
    pma::PerfCounters,
    qp::{ModifyQp, QpState, QpType, QpnAllocator, QueuePair, RecvWqe, SendWqe, WqeList},
    rc,
    sched::SchedIndex,
    types::{is_multicast_lid, is_unicast_lid},
    ud,
    wr::{RecvWr, SendWr, WcOpcode, WcStatus, WorkCompletion},
};

const FLAG_READY_TO_RECV: u32 = 1 << 0;
const FLAG_WQ_SCHEDULE: u32 = 1 << 1;
const FLAG_QP_SCHEDULE: u32 = 1 << 2;
const FLAG_STOP: u32 = 1 << 3;

/// Iterations one scheduler pass may run before yielding back to the
/// worker loop.
const SCHED_PASS_BOUND: usize = 1024;

const READER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Asynchronous fabric events delivered to the registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    CqError { cq_num: u32 },
    QpFatal { qp_num: u32 },
}

pub(crate) enum DeferredWork {
    CqOverflow { cq_num: u32 },
    Event(AsyncEvent),
}

/// Parameters for `create_qp`.
#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr {
    pub qp_type: QpType,
    pub port_num: u8,
    pub send_cq: u32,
    pub recv_cq: u32,
}

struct PortAttr {
    lid: u16,
    lid_table: HashMap<u16, SocketAddr>,
    perf: PerfCounters,
}

pub(crate) struct Port {
    port_num: u8,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    attr: Mutex<PortAttr>,
}

struct DeviceTables {
    qps: HashMap<u32, Arc<Mutex<QueuePair>>>,
    mgmt_qps: HashMap<(u8, u32), Arc<Mutex<QueuePair>>>,
    qpn_alloc: QpnAllocator,
    cqs: HashMap<u32, Arc<CompletionQueue>>,
    cqn_bitmap: BitVec,
    /// MLID -> attached QP handles.
    mcast: HashMap<u16, Vec<u32>>,
}

pub(crate) struct DeviceInner {
    dev_id: u8,
    config: FabricConfig,
    memory: Arc<dyn MemoryRegistry>,
    switch_addr: Option<SocketAddr>,
    ports: Vec<Port>,
    /// The device lock: object registries and the multicast table.
    tables: Mutex<DeviceTables>,
    sched: Mutex<SchedIndex>,
    tid_counter: AtomicU64,
    work_queue: Mutex<VecDeque<DeferredWork>>,
    flags: Mutex<u32>,
    wake: Condvar,
    stopped: AtomicBool,
    recv_tx: flume::Sender<(usize, Vec<u8>)>,
    recv_rx: flume::Receiver<(usize, Vec<u8>)>,
    event_handler: Mutex<Option<Box<dyn Fn(AsyncEvent) + Send + Sync>>>,
    drops: AtomicU64,
}

/// One emulated RDMA device.
pub struct Device {
    inner: Arc<DeviceInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl Device {
    pub fn new(
        dev_id: u8,
        config: FabricConfig,
        memory: Arc<dyn MemoryRegistry>,
        switch_addr: Option<SocketAddr>,
    ) -> Result<Self> {
        let mut ports = Vec::with_capacity(usize::from(config.ports_per_device));
        for index in 0..config.ports_per_device {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.set_read_timeout(Some(READER_POLL_INTERVAL))?;
            let bound = socket.local_addr()?;
            let local_addr = SocketAddr::from(([127, 0, 0, 1], bound.port()));
            ports.push(Port {
                port_num: index + 1,
                socket: Arc::new(socket),
                local_addr,
                attr: Mutex::new(PortAttr {
                    lid: 0,
                    lid_table: HashMap::new(),
                    perf: PerfCounters::default(),
                }),
            });
        }

        let mut cqn_bitmap = BitVec::with_capacity(MAX_CQ_CNT);
        cqn_bitmap.resize(MAX_CQ_CNT, false);

        let (recv_tx, recv_rx) = flume::unbounded();

        let inner = Arc::new(DeviceInner {
            dev_id,
            config,
            memory,
            switch_addr,
            ports,
            tables: Mutex::new(DeviceTables {
                qps: HashMap::new(),
                mgmt_qps: HashMap::new(),
                qpn_alloc: QpnAllocator::new(),
                cqs: HashMap::new(),
                cqn_bitmap,
                mcast: HashMap::new(),
            }),
            sched: Mutex::new(SchedIndex::new()),
            tid_counter: AtomicU64::new(0),
            work_queue: Mutex::new(VecDeque::new()),
            flags: Mutex::new(0),
            wake: Condvar::new(),
            stopped: AtomicBool::new(false),
            recv_tx,
            recv_rx,
            event_handler: Mutex::new(None),
            drops: AtomicU64::new(0),
        });

        Ok(Self {
            inner,
            worker: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the worker and the per-port reader threads.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let mut readers = self.readers.lock();
        for (index, port) in self.inner.ports.iter().enumerate() {
            let socket = Arc::clone(&port.socket);
            let inner = Arc::clone(&self.inner);
            let handle = std::thread::Builder::new()
                .name(format!("softib_d{}p{}_rx", self.inner.dev_id, port.port_num))
                .spawn(move || reader_routine(&inner, index, &socket))
                .expect("failed to spawn reader thread");
            readers.push(handle);
        }

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name(format!("softib_d{}", self.inner.dev_id))
            .spawn(move || inner.worker_routine())
            .expect("failed to spawn worker thread");
        *worker = Some(handle);
    }

    /// Signals STOP and joins the worker and readers. Outstanding WQEs
    /// are not flushed; destroy QPs first.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Relaxed);
        self.inner.set_flag(FLAG_STOP);
        if let Some(handle) = self.worker.lock().take() {
            let _joined = handle.join();
        }
        for handle in self.readers.lock().drain(..) {
            let _joined = handle.join();
        }
    }

    pub fn dev_id(&self) -> u8 {
        self.inner.dev_id
    }

    pub fn local_addr(&self, port_num: u8) -> Result<SocketAddr> {
        Ok(self.inner.port(port_num)?.local_addr)
    }

    pub fn set_async_event_handler(&self, handler: Box<dyn Fn(AsyncEvent) + Send + Sync>) {
        *self.inner.event_handler.lock() = Some(handler);
    }

    /// Publishes each port's socket address to the switch by sending a
    /// bare registration frame.
    pub fn register_with_switch(&self) -> Result<()> {
        let Some(switch_addr) = self.inner.switch_addr else {
            return Err(Error::invalid_input("no switch configured"));
        };
        for port in &self.inner.ports {
            let frame = Footer {
                dev_id: self.inner.dev_id,
                port_num: port.port_num,
            }
            .registration_frame();
            let _sent = port.socket.send_to(&frame, switch_addr)?;
        }
        Ok(())
    }

    pub fn set_port_lid(&self, port_num: u8, lid: u16) -> Result<()> {
        self.inner.port(port_num)?.attr.lock().lid = lid;
        Ok(())
    }

    pub fn port_lid(&self, port_num: u8) -> Result<u16> {
        Ok(self.inner.port(port_num)?.attr.lock().lid)
    }

    /// Traffic counters of one port, as the performance-management
    /// class would report them.
    pub fn port_counters(&self, port_num: u8) -> Result<PerfCounters> {
        Ok(self.inner.port(port_num)?.attr.lock().perf)
    }

    /// Maps a unicast DLID to a remote socket address in the port's
    /// forwarding table.
    pub fn map_lid(&self, port_num: u8, dlid: u16, addr: SocketAddr) -> Result<()> {
        let port = self.inner.port(port_num)?;
        let _old = port.attr.lock().lid_table.insert(dlid, addr);
        Ok(())
    }

    pub fn drop_count(&self) -> u64 {
        self.inner.drops.load(Ordering::Relaxed)
    }

    // -- completion queues ------------------------------------------------

    pub fn create_cq(&self, cap: usize) -> Result<u32> {
        if cap < 1 || cap > MAX_CQE {
            return Err(Error::invalid_input("cq capacity out of range"));
        }
        let mut tables = self.inner.tables.lock();
        let Some(index) = tables.cqn_bitmap.first_zero() else {
            return Err(Error::exhausted("cq table is full"));
        };
        tables.cqn_bitmap.set(index, true);
        let cq_num = index as u32;
        let cq = Arc::new(CompletionQueue::new(cq_num, cap));
        let _old = tables.cqs.insert(cq_num, cq);
        Ok(cq_num)
    }

    pub fn destroy_cq(&self, cq_num: u32) -> Result<()> {
        let mut tables = self.inner.tables.lock();
        if tables.cqs.remove(&cq_num).is_none() {
            return Err(Error::not_found(format!("cq {cq_num}")));
        }
        tables.cqn_bitmap.set(cq_num as usize, false);
        Ok(())
    }

    pub fn poll_cq(&self, cq_num: u32, n: usize) -> Result<Vec<WorkCompletion>> {
        self.inner.cq(cq_num)?.poll(n)
    }

    pub fn req_notify_cq(&self, cq_num: u32, flag: CqNotify, report_missed: bool) -> Result<bool> {
        self.inner.cq(cq_num)?.req_notify(flag, report_missed)
    }

    pub fn set_cq_handler(&self, cq_num: u32, handler: CompletionHandler) -> Result<()> {
        self.inner.cq(cq_num)?.set_handler(handler);
        Ok(())
    }

    // -- queue pairs ------------------------------------------------------

    /// Creates a QP and returns its handle. For SMI/GSI the handle is
    /// synthetic (QP0/QP1 exist once per port); for RC/UD it equals
    /// the allocated QPN.
    pub fn create_qp(&self, init: QpInitAttr) -> Result<u32> {
        let _port = self.inner.port(init.port_num)?;
        let now = Instant::now();
        let mut tables = self.inner.tables.lock();
        let send_cq = tables
            .cqs
            .get(&init.send_cq)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("cq {}", init.send_cq)))?;
        let recv_cq = tables
            .cqs
            .get(&init.recv_cq)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("cq {}", init.recv_cq)))?;

        let (qp_num, handle) = match init.qp_type {
            QpType::Smi | QpType::Gsi => {
                let qp_num = if init.qp_type == QpType::Smi { QP0 } else { QP1 };
                let key = (init.port_num, qp_num);
                if tables.mgmt_qps.contains_key(&key) {
                    return Err(Error::invalid_input(format!(
                        "management qp {qp_num} already exists on port {}",
                        init.port_num
                    )));
                }
                (qp_num, mgmt_handle(init.port_num, qp_num))
            }
            QpType::Rc | QpType::Ud => {
                let qp_num = tables
                    .qpn_alloc
                    .alloc()
                    .ok_or_else(|| Error::exhausted("qp table is full"))?;
                (qp_num, qp_num)
            }
        };

        let mut qp = QueuePair::new(
            qp_num,
            init.qp_type,
            init.port_num,
            send_cq,
            recv_cq,
            self.inner.config.retry_cnt,
            self.inner.config.rnr_retry,
            now,
        );
        qp.sched_handle = handle;
        let qp = Arc::new(Mutex::new(qp));
        match init.qp_type {
            QpType::Smi | QpType::Gsi => {
                let _old = tables.mgmt_qps.insert((init.port_num, qp_num), qp);
            }
            QpType::Rc | QpType::Ud => {
                let _old = tables.qps.insert(qp_num, qp);
            }
        }
        Ok(handle)
    }

    pub fn destroy_qp(&self, handle: u32) -> Result<()> {
        let mut tables = self.inner.tables.lock();
        let qp = if handle & MGMT_HANDLE_BASE != 0 {
            let (port_num, qp_num) = split_mgmt_handle(handle);
            tables.mgmt_qps.remove(&(port_num, qp_num))
        } else {
            let removed = tables.qps.remove(&handle);
            if removed.is_some() {
                tables.qpn_alloc.release(handle);
            }
            removed
        };
        let Some(qp) = qp else {
            return Err(Error::not_found(format!("qp handle {handle:#x}")));
        };
        for qpns in tables.mcast.values_mut() {
            qpns.retain(|&attached| attached != handle);
        }
        drop(tables);

        let mut qp = qp.lock();
        qp.send_cq.remove_by_qp(handle);
        qp.recv_cq.remove_by_qp(handle);
        qp.reset();
        let _removed = self.inner.sched.lock().remove(handle);
        Ok(())
    }

    pub fn modify_qp(&self, handle: u32, modify: &ModifyQp) -> Result<()> {
        let qp = self.inner.find_qp(handle)?;
        let mut qp = qp.lock();
        let prev_state = qp.state;
        qp.modify(modify)?;

        match qp.state {
            QpState::Reset if prev_state != QpState::Reset => {
                qp.reset();
                qp.send_cq.remove_by_qp(handle);
                qp.recv_cq.remove_by_qp(handle);
                let _removed = self.inner.sched.lock().remove(handle);
            }
            QpState::Err if prev_state != QpState::Err => {
                self.inner.flush_qp(&mut qp);
            }
            _ => {}
        }
        self.inner.reschedule_qp(&mut qp);
        Ok(())
    }

    pub fn post_send(&self, handle: u32, wr: SendWr) -> Result<()> {
        let qp = self.inner.find_qp(handle)?;
        let mut qp = qp.lock();
        match qp.state {
            QpState::Err | QpState::Sqe => {
                // flush semantics: complete immediately with an error
                self.inner.insert_send_error_raw(
                    &qp,
                    wr.wr_id,
                    WcStatus::WrFlushErr,
                    WcOpcode::from_wr(wr.opcode),
                );
                return Ok(());
            }
            QpState::Rts | QpState::Sqd => {}
            _ => {
                return Err(Error::QpState(format!(
                    "post_send in state {:?}",
                    qp.state
                )));
            }
        }
        if qp.qp_type.is_ud_like() && wr.ud.is_none() {
            return Err(Error::invalid_input("UD work request without destination"));
        }
        let wqe = SendWqe::new(wr, Instant::now());
        qp.requester.submitted.push_back(wqe);
        self.inner.reschedule_qp(&mut qp);
        Ok(())
    }

    pub fn post_recv(&self, handle: u32, wr: RecvWr) -> Result<()> {
        let qp = self.inner.find_qp(handle)?;
        let mut qp = qp.lock();
        if qp.state == QpState::Reset {
            return Err(Error::QpState("post_recv in RESET".into()));
        }
        qp.responder.recv_queue.push_back(RecvWqe { wr });
        Ok(())
    }

    // -- multicast --------------------------------------------------------

    pub fn attach_mcast(&self, handle: u32, mlid: u16) -> Result<()> {
        if !is_multicast_lid(mlid) {
            return Err(Error::invalid_input("not a multicast LID"));
        }
        let _qp = self.inner.find_qp(handle)?;
        let mut tables = self.inner.tables.lock();
        let attached = tables.mcast.entry(mlid).or_default();
        if !attached.contains(&handle) {
            attached.push(handle);
        }
        Ok(())
    }

    pub fn detach_mcast(&self, handle: u32, mlid: u16) -> Result<()> {
        let mut tables = self.inner.tables.lock();
        match tables.mcast.get_mut(&mlid) {
            Some(attached) => {
                attached.retain(|&qpn| qpn != handle);
                Ok(())
            }
            None => Err(Error::not_found(format!("multicast group {mlid:#x}"))),
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<DeviceInner> {
        &self.inner
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn mgmt_handle(port_num: u8, qp_num: u32) -> u32 {
    MGMT_HANDLE_BASE | u32::from(port_num) << 8 | qp_num
}

fn split_mgmt_handle(handle: u32) -> (u8, u32) {
    ((handle >> 8) as u8, handle & 0xFF)
}

fn reader_routine(inner: &DeviceInner, port_index: usize, socket: &UdpSocket) {
    let mut buf = vec![0u8; PACKET_BUFFER];
    info!("reader d{}p{} running", inner.dev_id, port_index + 1);
    loop {
        if inner.stopped.load(Ordering::Relaxed) {
            break;
        }
        match socket.recv_from(&mut buf) {
            Ok((len, _src)) => {
                let _send = inner.recv_tx.send((port_index, buf[..len].to_vec()));
                inner.set_flag(FLAG_READY_TO_RECV);
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                warn!("reader d{}p{} exiting: {err}", inner.dev_id, port_index + 1);
                break;
            }
        }
    }
    info!("reader d{}p{} exited", inner.dev_id, port_index + 1);
}

impl DeviceInner {
    // -- lookup helpers ---------------------------------------------------

    fn port(&self, port_num: u8) -> Result<&Port> {
        self.ports
            .get(usize::from(port_num).wrapping_sub(1))
            .ok_or_else(|| Error::invalid_input(format!("port {port_num}")))
    }

    fn cq(&self, cq_num: u32) -> Result<Arc<CompletionQueue>> {
        self.tables
            .lock()
            .cqs
            .get(&cq_num)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("cq {cq_num}")))
    }

    pub(crate) fn find_qp(&self, handle: u32) -> Result<Arc<Mutex<QueuePair>>> {
        let tables = self.tables.lock();
        let qp = if handle & MGMT_HANDLE_BASE != 0 {
            let (port_num, qp_num) = split_mgmt_handle(handle);
            tables.mgmt_qps.get(&(port_num, qp_num)).cloned()
        } else {
            tables.qps.get(&handle).cloned()
        };
        qp.ok_or_else(|| Error::not_found(format!("qp handle {handle:#x}")))
    }

    pub(crate) fn memory(&self) -> &dyn MemoryRegistry {
        &*self.memory
    }

    pub(crate) fn sched_timeout(&self) -> Duration {
        self.config.sched_timeout()
    }

    fn behaviors(&self) -> Behaviors {
        self.config.behaviors
    }

    pub(crate) fn count_drop(&self, reason: &str) {
        let _count = self.drops.fetch_add(1, Ordering::Relaxed);
        trace!("drop packet: {reason}");
    }

    // -- worker signalling ------------------------------------------------

    fn set_flag(&self, flag: u32) {
        let mut flags = self.flags.lock();
        *flags |= flag;
        self.wake.notify_one();
    }

    pub(crate) fn queue_work(&self, work: DeferredWork) {
        self.work_queue.lock().push_back(work);
        self.set_flag(FLAG_WQ_SCHEDULE);
    }

    pub(crate) fn raise_qp_fatal(&self, qp_num: u32) {
        self.queue_work(DeferredWork::Event(AsyncEvent::QpFatal { qp_num }));
    }

    fn deliver_event(&self, event: AsyncEvent) {
        if let Some(handler) = self.event_handler.lock().as_ref() {
            handler(event);
        }
    }

    // -- worker loop ------------------------------------------------------

    fn worker_routine(self: Arc<Self>) {
        info!("device worker d{} running", self.dev_id);
        loop {
            // the next deterministic wake-up, capped at the horizon
            let now = Instant::now();
            let horizon = self.config.sched_horizon();
            let timeout = self
                .sched
                .lock()
                .first()
                .map_or(horizon, |(_qpn, wake)| {
                    wake.saturating_duration_since(now).min(horizon)
                });

            {
                let mut flags = self.flags.lock();
                if *flags == 0 {
                    let _timed_out = self.wake.wait_for(&mut flags, timeout);
                }
            }

            // drain every wake-up source to quiescence; incoming acks
            // are processed before retransmit decisions
            loop {
                let bits = {
                    let mut flags = self.flags.lock();
                    std::mem::take(&mut *flags)
                };
                if bits == 0 {
                    break;
                }
                if bits & FLAG_STOP != 0 {
                    info!("device worker d{} exited", self.dev_id);
                    return;
                }
                if bits & FLAG_READY_TO_RECV != 0 {
                    for (port_index, data) in self.recv_rx.try_iter() {
                        self.handle_datagram(port_index, &data);
                    }
                }
                if bits & FLAG_WQ_SCHEDULE != 0 {
                    self.process_work_queue();
                }
                if bits & FLAG_QP_SCHEDULE != 0 {
                    self.scheduler_pass();
                }
            }

            self.scheduler_pass();
        }
    }

    pub(crate) fn process_work_queue(&self) {
        loop {
            let Some(work) = self.work_queue.lock().pop_front() else {
                return;
            };
            match work {
                DeferredWork::CqOverflow { cq_num } => self.cq_overflow_handler(cq_num),
                DeferredWork::Event(event) => self.deliver_event(event),
            }
        }
    }

    /// Escalates a CQ overflow: CQ_ERR event, then every QP using the
    /// CQ goes to the error state with its WQEs flushed to whichever
    /// CQs remain usable.
    fn cq_overflow_handler(&self, cq_num: u32) {
        let Some(cq) = self.tables.lock().cqs.get(&cq_num).cloned() else {
            return;
        };
        cq.mark_err();
        self.deliver_event(AsyncEvent::CqError { cq_num });

        let victims: Vec<Arc<Mutex<QueuePair>>> = {
            let tables = self.tables.lock();
            tables
                .qps
                .values()
                .chain(tables.mgmt_qps.values())
                .cloned()
                .collect()
        };
        for qp in victims {
            let mut qp = qp.lock();
            if qp.send_cq.cq_num() != cq_num && qp.recv_cq.cq_num() != cq_num {
                continue;
            }
            if qp.state != QpState::Err {
                qp.state = QpState::Err;
                self.flush_qp(&mut qp);
                self.raise_qp_fatal(qp.qp_num);
            }
            let _removed = self.sched.lock().remove(qp.sched_handle);
        }
    }

    // -- receive path -----------------------------------------------------

    /// Demultiplexes one received datagram. Runs on the worker.
    pub(crate) fn handle_datagram(&self, port_index: usize, data: &[u8]) {
        let Some(port) = self.ports.get(port_index) else {
            return;
        };
        {
            let mut attr = port.attr.lock();
            attr.perf.rcv_packets += 1;
            attr.perf.rcv_data += data.len() as u64;
        }

        let Ok((packet_bytes, _footer)) = packet::strip_footer(data) else {
            self.count_drop("missing footer");
            return;
        };
        let Ok(parsed) = packet::parse_packet(packet_bytes) else {
            self.count_drop("malformed packet");
            return;
        };

        let dlid = parsed.lrh.dlid;
        let dest_qp = parsed.bth.dest_qp & QPN_MASK;

        if dest_qp != QP0 && is_multicast_lid(dlid) {
            self.deliver_multicast(port_index, &parsed);
        } else {
            self.deliver_unicast(port_index, dlid, dest_qp, &parsed, Instant::now());
        }
    }

    fn deliver_multicast(&self, port_index: usize, parsed: &ParsedPacket<'_>) {
        let Some(opcode) = Opcode::from_u8(parsed.bth.opcode) else {
            self.count_drop("unknown multicast opcode");
            return;
        };
        if !matches!(opcode, Opcode::UdSendOnly | Opcode::UdSendOnlyImm) {
            self.count_drop("non-UD multicast packet");
            return;
        }
        let Ok((deth, _rest)) = Deth::parse(parsed.body) else {
            self.count_drop("truncated multicast DETH");
            return;
        };

        let port_lid = self
            .ports
            .get(port_index)
            .map_or(0, |port| port.attr.lock().lid);
        let slid = parsed.lrh.slid;

        let attached: Vec<u32> = self
            .tables
            .lock()
            .mcast
            .get(&parsed.lrh.dlid)
            .cloned()
            .unwrap_or_default();

        // the sending QP never receives its own multicast copy
        for handle in attached {
            let Ok(qp) = self.find_qp(handle) else {
                continue;
            };
            let mut qp = qp.lock();
            if ud::is_multicast_self(&qp, port_lid, slid, deth.src_qp) {
                continue;
            }
            ud::receive(self, &mut qp, &parsed.lrh, parsed.grh.as_ref(), &parsed.bth, parsed.body);
            self.reschedule_qp(&mut qp);
        }
    }

    fn deliver_unicast(
        &self,
        port_index: usize,
        dlid: u16,
        dest_qp: u32,
        parsed: &ParsedPacket<'_>,
        now: Instant,
    ) {
        let port_num = port_index as u8 + 1;
        let tables = self.tables.lock();
        let qp = match dest_qp {
            QP0 | QP1 => tables.mgmt_qps.get(&(port_num, dest_qp)).cloned(),
            _ => tables.qps.get(&dest_qp).cloned(),
        };
        let Some(qp) = qp else {
            drop(tables);
            self.count_drop("unknown destination qp");
            return;
        };

        // LRH: the DLID of a unicast packet must match the port LID
        let port_lid = self
            .ports
            .get(port_index)
            .map_or(0, |port| port.attr.lock().lid);
        let lid_ok = (dest_qp == QP0 && dlid == LID_PERMISSIVE)
            || !is_unicast_lid(dlid)
            || dlid == port_lid;
        if !lid_ok {
            drop(tables);
            self.count_drop("dlid does not match port lid");
            return;
        }

        let mut qp = lock_qp_then_release_device(tables, &qp);
        match qp.qp_type {
            QpType::Rc => rc::receive(self, &mut qp, &parsed.lrh, &parsed.bth, parsed.body, now),
            QpType::Ud | QpType::Smi | QpType::Gsi => {
                ud::receive(self, &mut qp, &parsed.lrh, parsed.grh.as_ref(), &parsed.bth, parsed.body);
            }
        }
        self.reschedule_qp(&mut qp);
    }

    // -- scheduler --------------------------------------------------------

    /// Runs due QPs until none is due, bounded per pass so receive
    /// processing is never starved.
    pub(crate) fn scheduler_pass(&self) {
        for _ in 0..SCHED_PASS_BOUND {
            let now = Instant::now();
            let Some((handle, wake)) = self.sched.lock().first() else {
                return;
            };
            if wake > now {
                return;
            }

            let tables = self.tables.lock();
            let qp = if handle & MGMT_HANDLE_BASE != 0 {
                let (port_num, qp_num) = split_mgmt_handle(handle);
                tables.mgmt_qps.get(&(port_num, qp_num)).cloned()
            } else {
                tables.qps.get(&handle).cloned()
            };
            let Some(qp) = qp else {
                drop(tables);
                let _removed = self.sched.lock().remove(handle);
                continue;
            };

            let mut qp = lock_qp_then_release_device(tables, &qp);
            self.run_qp_once(&mut qp, now);
            self.reschedule_qp(&mut qp);
            drop(qp);

            // let incoming acks in before further retransmit decisions
            if *self.flags.lock() & FLAG_READY_TO_RECV != 0 {
                return;
            }
        }
        self.set_flag(FLAG_QP_SCHEDULE);
    }

    /// One scheduler visit to a QP: responder ack generation, the
    /// retransmit timer, dispatch and requester packetisation.
    fn run_qp_once(&self, qp: &mut QueuePair, now: Instant) {
        if qp.qp_type == QpType::Rc && qp.state.recv_ok() && rc::generate_one_ack(self, qp) {
            return;
        }
        if !matches!(qp.state, QpState::Rts | QpState::Sqd) {
            return;
        }

        // retransmit timer on the waiting-list head
        let timed_out = qp
            .requester
            .waiting
            .front()
            .is_some_and(|head| head.local_ack_time <= now);
        if timed_out {
            let head = qp
                .requester
                .waiting
                .front_mut()
                .unwrap_or_else(|| unreachable!("checked above"));
            if head.retry_cnt == 0 {
                debug!("transport retry exhausted, qpn: {}", qp.qp_num);
                rc::fatal_requester_error(self, qp, WcStatus::RetryExcErr);
                return;
            }
            head.retry_cnt -= 1;
            head.local_ack_time = now + self.sched_timeout();
            qp.rewind_waiting();
        }

        if qp.requester.sending.is_empty()
            && !qp.dispatch_from_submitted(now, self.sched_timeout())
        {
            return;
        }
        let Some(head) = qp.requester.sending.front() else {
            return;
        };

        // an errored head waits for the waiting list to drain first
        if head.status != WcStatus::Success && !qp.requester.waiting.is_empty() {
            return;
        }
        // RNR back-off
        if head.schedule_time > now {
            return;
        }

        let mut wqe = qp
            .requester
            .sending
            .pop_front()
            .unwrap_or_else(|| unreachable!("head checked above"));
        wqe.schedule_time = now;

        if wqe.status == WcStatus::Success {
            match qp.qp_type {
                QpType::Rc => rc::process_send_wqe(self, qp, &mut wqe),
                QpType::Ud | QpType::Smi | QpType::Gsi => ud::process_send_wqe(self, qp, &mut wqe),
            }
        }

        if wqe.status != WcStatus::Success {
            self.completion_error(qp, wqe);
            return;
        }

        match wqe.list_type {
            WqeList::Sending => qp.requester.sending.push_front(wqe),
            WqeList::Waiting => qp.requester.waiting.push_back(wqe),
            WqeList::Free => {
                // UD completes at send time
                rc::complete_send_success(self, qp, &wqe);
            }
            WqeList::Submitted => unreachable!("engines never move a WQE back to submitted"),
        }
    }

    /// Error completion for a send WQE plus the per-transport state
    /// fallout.
    fn completion_error(&self, qp: &mut QueuePair, mut wqe: SendWqe) {
        wqe.list_type = WqeList::Free;
        self.insert_send_error(qp, &wqe, wqe.status);
        match qp.qp_type {
            QpType::Rc => {
                qp.state = QpState::Err;
                self.flush_qp(qp);
            }
            QpType::Ud | QpType::Smi | QpType::Gsi => {
                qp.state = QpState::Sqe;
                self.flush_send_queue(qp);
            }
        }
    }

    /// Recomputes a QP's wake time and its membership in the scheduler
    /// index. Called after every mutation of the QP's lists or state.
    pub(crate) fn reschedule_qp(&self, qp: &mut QueuePair) {
        if qp.sched.on_tree {
            qp.sched.on_tree = false;
            let _removed = self.sched.lock().remove(qp.sched_handle);
        }

        let now = Instant::now();
        let horizon = now + self.config.sched_horizon();
        let mut wake: Option<Instant> = None;

        if qp.qp_type == QpType::Rc
            && qp.state.recv_ok()
            && !qp.responder.ack_queue.is_empty()
        {
            wake = Some(now);
        } else {
            if !matches!(qp.state, QpState::Rts | QpState::Sqd) {
                return;
            }
            if let Some(head) = qp.requester.waiting.front() {
                wake = Some(head.local_ack_time);
            }
            if let Some(head) = qp.requester.sending.front() {
                let blocked = head.status != WcStatus::Success && !qp.requester.waiting.is_empty();
                if !blocked {
                    wake = Some(wake.map_or(head.schedule_time, |w| w.min(head.schedule_time)));
                }
            }
            if qp.state == QpState::Rts {
                if let Some(head) = qp.requester.submitted.front() {
                    let fence_blocked = head.wr.flags.fence && qp.requester.nr_rd_atomic > 0;
                    let window_blocked = qp.qp_type == QpType::Rc
                        && head.wr.opcode.is_rd_atomic()
                        && qp.requester.nr_rd_atomic >= qp.attrs.max_rd_atomic;
                    if !fence_blocked && !window_blocked {
                        wake = Some(now);
                    }
                }
            }
        }

        let Some(wake) = wake else {
            return;
        };
        if wake >= horizon {
            return;
        }

        let tid = self.tid_counter.fetch_add(1, Ordering::Relaxed);
        qp.sched.on_tree = true;
        qp.sched.wake_time = wake;
        qp.sched.tid = tid;
        self.sched.lock().insert(qp.sched_handle, wake, tid);

        if wake <= now {
            self.set_flag(FLAG_QP_SCHEDULE);
        } else {
            // the worker recomputes its sleep on any wake-up
            self.wake.notify_one();
        }
    }

    // -- send path --------------------------------------------------------

    /// Builds and transmits one datagram out of `port_num`. The
    /// destination socket address comes from the per-DLID table, the
    /// loopback shortcut, or falls back to the switch.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send_from_port(
        &self,
        port_num: u8,
        src_qp: u32,
        dlid: u16,
        sl: u8,
        bth: Bth,
        ext: &[u8],
        payload: &[u8],
    ) {
        let Ok(port) = self.port(port_num) else {
            return;
        };
        let (port_lid, unicast_dst) = {
            let attr = port.attr.lock();
            (attr.lid, attr.lid_table.get(&dlid).copied())
        };

        let slid = if src_qp == QP0 && port_lid == 0 {
            LID_PERMISSIVE
        } else {
            port_lid
        };
        if src_qp != QP0 && (slid == 0 || dlid == 0) {
            self.count_drop("unaddressed packet outside QP0");
            return;
        }

        let footer = Footer {
            dev_id: self.dev_id,
            port_num,
        };
        let frame = packet::build_datagram(slid, dlid, sl, bth, ext, payload, footer);

        let multicast = is_multicast_lid(dlid);
        let dst = if src_qp == QP0 {
            self.switch_addr
        } else if dlid == port_lid && is_unicast_lid(dlid) {
            Some(port.local_addr)
        } else if is_unicast_lid(dlid) {
            unicast_dst.or(self.switch_addr)
        } else {
            self.switch_addr
        };

        if let Some(dst) = dst {
            self.transmit(port, &frame, dst);
        } else if !multicast {
            self.count_drop("no destination for dlid");
            return;
        }

        // a local copy for same-device members of the multicast group
        if multicast {
            self.transmit(port, &frame, port.local_addr);
        }
    }

    fn transmit(&self, port: &Port, frame: &[u8], dst: SocketAddr) {
        match port.socket.send_to(frame, dst) {
            Ok(sent) => {
                let mut attr = port.attr.lock();
                attr.perf.xmit_packets += 1;
                attr.perf.xmit_data += sent as u64;
            }
            Err(err) => warn!("send_to {dst} failed: {err}"),
        }
    }

    // -- completion insertion --------------------------------------------

    pub(crate) fn insert_send_completion(&self, qp: &QueuePair, wc: WorkCompletion, solicited: bool) {
        match qp.send_cq.insert_success(qp.sched_handle, wc, solicited) {
            Ok(()) => {}
            Err(CqInsertError::Overflow) => self.queue_work(DeferredWork::CqOverflow {
                cq_num: qp.send_cq.cq_num(),
            }),
            Err(CqInsertError::NotOk) => {}
        }
    }

    pub(crate) fn insert_recv_completion(&self, qp: &QueuePair, wc: WorkCompletion, solicited: bool) {
        match qp.recv_cq.insert_success(qp.sched_handle, wc, solicited) {
            Ok(()) => {}
            Err(CqInsertError::Overflow) => self.queue_work(DeferredWork::CqOverflow {
                cq_num: qp.recv_cq.cq_num(),
            }),
            Err(CqInsertError::NotOk) => {}
        }
    }

    pub(crate) fn insert_send_error(&self, qp: &QueuePair, wqe: &SendWqe, status: WcStatus) {
        self.insert_send_error_raw(qp, wqe.wr.wr_id, status, WcOpcode::from_wr(wqe.wr.opcode));
    }

    fn insert_send_error_raw(
        &self,
        qp: &QueuePair,
        wr_id: u64,
        status: WcStatus,
        opcode: WcOpcode,
    ) {
        match qp.send_cq.insert_error(qp.sched_handle, wr_id, status, opcode, self.behaviors()) {
            Ok(()) => {}
            Err(CqInsertError::Overflow) => self.queue_work(DeferredWork::CqOverflow {
                cq_num: qp.send_cq.cq_num(),
            }),
            Err(CqInsertError::NotOk) => {}
        }
    }

    pub(crate) fn insert_recv_error(&self, qp: &QueuePair, wr_id: u64, status: WcStatus) {
        match qp
            .recv_cq
            .insert_error(qp.sched_handle, wr_id, status, WcOpcode::Recv, self.behaviors())
        {
            Ok(()) => {}
            Err(CqInsertError::Overflow) => self.queue_work(DeferredWork::CqOverflow {
                cq_num: qp.recv_cq.cq_num(),
            }),
            Err(CqInsertError::NotOk) => {}
        }
    }

    // -- flush ------------------------------------------------------------

    /// Flushes every outstanding WQE with FLUSH_ERR completions.
    pub(crate) fn flush_qp(&self, qp: &mut QueuePair) {
        let (send_wqes, recv_wqes) = qp.take_all_wqes();
        for wqe in &send_wqes {
            self.insert_send_error(qp, wqe, WcStatus::WrFlushErr);
        }
        for wqe in &recv_wqes {
            self.insert_recv_error(qp, wqe.wr.wr_id, WcStatus::WrFlushErr);
        }
    }

    /// Send-queue-only flush, used when a UD QP enters SQE.
    fn flush_send_queue(&self, qp: &mut QueuePair) {
        let requester = &mut qp.requester;
        let mut wqes = Vec::with_capacity(
            requester.sending.len() + requester.waiting.len() + requester.submitted.len(),
        );
        wqes.extend(requester.sending.drain(..));
        wqes.extend(requester.waiting.drain(..));
        wqes.extend(requester.submitted.drain(..));
        requester.nr_rd_atomic = 0;
        for mut wqe in wqes {
            wqe.list_type = WqeList::Free;
            self.insert_send_error(qp, &wqe, WcStatus::WrFlushErr);
        }
    }
}

/// The only permitted lock-order inversion: the receive path takes the
/// QP lock while still holding the device lock, then releases the
/// device lock before doing QP work. Keep every such sequence here.
fn lock_qp_then_release_device<'a>(
    tables: MutexGuard<'_, DeviceTables>,
    qp: &'a Arc<Mutex<QueuePair>>,
) -> MutexGuard<'a, QueuePair> {
    let guard = qp.lock();
    drop(tables);
    guard
}
