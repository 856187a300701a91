//! Queue-pair objects: attributes, the three requester-side WQE lists,
//! responder state and the per-QP scheduling record.
//!
//! List surgery happens only through the helpers here; a WQE's
//! `list_type` always matches the list that owns it.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use bitvec::vec::BitVec;
use rand::Rng;

use crate::{
    constants::{MAX_QP_CNT, MAX_RD_ATOMIC, QPN_KEY_PART_WIDTH, RESPONSE_CACHE_DEPTH},
    cq::CompletionQueue,
    error::{Error, Result},
    packet::NakCode,
    types::{qpn_index, PathMtu, Psn},
    wr::{RecvWr, SendWr, WcStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    Rc,
    Ud,
    Smi,
    Gsi,
}

impl QpType {
    pub(crate) fn is_ud_like(self) -> bool {
        matches!(self, QpType::Ud | QpType::Smi | QpType::Gsi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Sqd,
    Sqe,
    Err,
}

impl QpState {
    /// States in which the responder accepts inbound packets.
    pub(crate) fn recv_ok(self) -> bool {
        matches!(self, QpState::Rtr | QpState::Rts | QpState::Sqd | QpState::Sqe)
    }
}

/// Which list a send WQE currently lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WqeList {
    Submitted,
    Sending,
    Waiting,
    Free,
}

/// A submitted work request plus its mutable processing state.
#[derive(Debug)]
pub(crate) struct SendWqe {
    pub(crate) wr: SendWr,
    pub(crate) total_length: u32,
    pub(crate) list_type: WqeList,
    pub(crate) based_psn: Psn,
    pub(crate) expected_psn: Psn,
    pub(crate) all_packets: u32,
    pub(crate) ack_packets: u32,
    pub(crate) sent_packets: u32,
    pub(crate) status: WcStatus,
    pub(crate) retry_cnt: u8,
    pub(crate) rnr_retry: u8,
    pub(crate) schedule_time: Instant,
    pub(crate) local_ack_time: Instant,
}

impl SendWqe {
    pub(crate) fn new(wr: SendWr, now: Instant) -> Self {
        let total_length = wr.total_length();
        Self {
            wr,
            total_length,
            list_type: WqeList::Submitted,
            based_psn: Psn::default(),
            expected_psn: Psn::default(),
            all_packets: 0,
            ack_packets: 0,
            sent_packets: 0,
            status: WcStatus::Success,
            retry_cnt: 0,
            rnr_retry: 0,
            schedule_time: now,
            local_ack_time: now,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RecvWqe {
    pub(crate) wr: RecvWr,
}

/// Pending responder-side transmissions, drained one per scheduler pass.
#[derive(Debug)]
pub(crate) enum AckEntry {
    Ack {
        psn: Psn,
        msn: u32,
    },
    Nak {
        psn: Psn,
        code: NakCode,
        msn: u32,
    },
    RnrNak {
        psn: Psn,
        timer: u8,
        msn: u32,
    },
    ReadResponse {
        based_psn: Psn,
        num_packets: u32,
        sent: u32,
        addr: u64,
        rkey: u32,
        length: u32,
        msn: u32,
    },
    AtomicAck {
        psn: Psn,
        orig: u64,
        msn: u32,
    },
}

/// Responses remembered for duplicate request detection.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CachedResponse {
    Atomic {
        psn: Psn,
        orig: u64,
        msn: u32,
    },
    Read {
        based_psn: Psn,
        num_packets: u32,
        addr: u64,
        rkey: u32,
        length: u32,
        msn: u32,
    },
}

impl CachedResponse {
    pub(crate) fn psn(&self) -> Psn {
        match *self {
            CachedResponse::Atomic { psn, .. } => psn,
            CachedResponse::Read { based_psn, .. } => based_psn,
        }
    }
}

/// Message kind the responder is in the middle of receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InflightKind {
    Send,
    Write,
}

/// Per-message responder reassembly state between FIRST and LAST.
#[derive(Debug)]
pub(crate) struct InflightRecv {
    pub(crate) kind: InflightKind,
    /// Consumed RWQE for SEND messages; write-with-immediate consumes
    /// one at the LAST packet instead.
    pub(crate) wqe: Option<RecvWqe>,
    pub(crate) received: u32,
    pub(crate) write_addr: u64,
    pub(crate) write_rkey: u32,
}

#[derive(Debug, Default)]
pub(crate) struct RequesterState {
    pub(crate) submitted: VecDeque<SendWqe>,
    pub(crate) sending: VecDeque<SendWqe>,
    pub(crate) waiting: VecDeque<SendWqe>,
    /// Next PSN handed to a dispatched WQE.
    pub(crate) expected_psn: Psn,
    /// Outstanding RDMA READ / atomic operations.
    pub(crate) nr_rd_atomic: u8,
}

#[derive(Debug, Default)]
pub(crate) struct ResponderState {
    /// Next PSN the responder expects.
    pub(crate) psn: Psn,
    pub(crate) msn: u32,
    pub(crate) recv_queue: VecDeque<RecvWqe>,
    pub(crate) ack_queue: VecDeque<AckEntry>,
    pub(crate) inflight: Option<InflightRecv>,
    pub(crate) response_cache: VecDeque<CachedResponse>,
    /// A NAK-sequence-error was sent and the expected PSN has not
    /// reappeared yet.
    pub(crate) nak_seq_pinned: bool,
}

impl ResponderState {
    pub(crate) fn cache_response(&mut self, entry: CachedResponse) {
        if self.response_cache.len() == RESPONSE_CACHE_DEPTH {
            let _oldest = self.response_cache.pop_front();
        }
        self.response_cache.push_back(entry);
    }

    pub(crate) fn cached_response(&self, psn: Psn) -> Option<&CachedResponse> {
        self.response_cache.iter().find(|entry| entry.psn() == psn)
    }
}

#[derive(Debug)]
pub(crate) struct SchedState {
    pub(crate) on_tree: bool,
    pub(crate) wake_time: Instant,
    pub(crate) tid: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct QpAttrs {
    pub path_mtu: PathMtu,
    pub dest_qp_num: u32,
    pub dlid: u16,
    pub pkey_index: u16,
    pub qkey: u32,
    pub sl: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub min_rnr_timer: u8,
    pub max_rd_atomic: u8,
}

/// Attribute changes applied by `modify_qp`; unset fields keep their
/// current value.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModifyQp {
    pub state: Option<QpState>,
    pub path_mtu: Option<PathMtu>,
    pub dest_qp_num: Option<u32>,
    pub dlid: Option<u16>,
    pub pkey_index: Option<u16>,
    pub qkey: Option<u32>,
    pub sl: Option<u8>,
    pub retry_cnt: Option<u8>,
    pub rnr_retry: Option<u8>,
    pub min_rnr_timer: Option<u8>,
    pub max_rd_atomic: Option<u8>,
    pub sq_psn: Option<u32>,
    pub rq_psn: Option<u32>,
}

pub(crate) struct QueuePair {
    pub(crate) qp_num: u32,
    /// Device-unique scheduler/registry handle. Equals `qp_num` for
    /// regular QPs; management QPs get a synthetic handle because QP0
    /// and QP1 exist once per port.
    pub(crate) sched_handle: u32,
    pub(crate) qp_type: QpType,
    pub(crate) state: QpState,
    pub(crate) port_num: u8,
    pub(crate) attrs: QpAttrs,
    pub(crate) send_cq: Arc<CompletionQueue>,
    pub(crate) recv_cq: Arc<CompletionQueue>,
    pub(crate) requester: RequesterState,
    pub(crate) responder: ResponderState,
    pub(crate) sched: SchedState,
}

impl QueuePair {
    pub(crate) fn new(
        qp_num: u32,
        qp_type: QpType,
        port_num: u8,
        send_cq: Arc<CompletionQueue>,
        recv_cq: Arc<CompletionQueue>,
        retry_cnt: u8,
        rnr_retry: u8,
        now: Instant,
    ) -> Self {
        Self {
            qp_num,
            sched_handle: qp_num,
            qp_type,
            state: if qp_type.is_ud_like() && qp_num < 2 {
                // management QPs come up ready
                QpState::Rts
            } else {
                QpState::Reset
            },
            port_num,
            attrs: QpAttrs {
                path_mtu: PathMtu::Mtu256,
                dest_qp_num: 0,
                dlid: 0,
                pkey_index: 0,
                qkey: 0,
                sl: 0,
                retry_cnt,
                rnr_retry,
                min_rnr_timer: 0,
                max_rd_atomic: 1,
            },
            send_cq,
            recv_cq,
            requester: RequesterState::default(),
            responder: ResponderState::default(),
            sched: SchedState {
                on_tree: false,
                wake_time: now,
                tid: 0,
            },
        }
    }

    /// Applies a state transition plus attribute changes, validating
    /// both. Administrative failures leave the QP untouched.
    pub(crate) fn modify(&mut self, modify: &ModifyQp) -> Result<()> {
        if let Some(next) = modify.state {
            self.check_transition(next)?;
        }
        if let Some(max_rd_atomic) = modify.max_rd_atomic {
            if max_rd_atomic == 0 || max_rd_atomic > MAX_RD_ATOMIC {
                return Err(Error::invalid_input("max_rd_atomic out of range"));
            }
        }
        if modify.retry_cnt.is_some_and(|cnt| cnt > 7)
            || modify.rnr_retry.is_some_and(|cnt| cnt > 7)
        {
            return Err(Error::invalid_input("retry counters are 3-bit fields"));
        }

        let attrs = &mut self.attrs;
        if let Some(path_mtu) = modify.path_mtu {
            attrs.path_mtu = path_mtu;
        }
        if let Some(dest_qp_num) = modify.dest_qp_num {
            attrs.dest_qp_num = dest_qp_num;
        }
        if let Some(dlid) = modify.dlid {
            attrs.dlid = dlid;
        }
        if let Some(pkey_index) = modify.pkey_index {
            attrs.pkey_index = pkey_index;
        }
        if let Some(qkey) = modify.qkey {
            attrs.qkey = qkey;
        }
        if let Some(sl) = modify.sl {
            attrs.sl = sl;
        }
        if let Some(retry_cnt) = modify.retry_cnt {
            attrs.retry_cnt = retry_cnt;
        }
        if let Some(rnr_retry) = modify.rnr_retry {
            attrs.rnr_retry = rnr_retry;
        }
        if let Some(min_rnr_timer) = modify.min_rnr_timer {
            attrs.min_rnr_timer = min_rnr_timer & 0x1F;
        }
        if let Some(max_rd_atomic) = modify.max_rd_atomic {
            attrs.max_rd_atomic = max_rd_atomic;
        }
        if let Some(sq_psn) = modify.sq_psn {
            self.requester.expected_psn = Psn::new(sq_psn);
        }
        if let Some(rq_psn) = modify.rq_psn {
            self.responder.psn = Psn::new(rq_psn);
        }
        if let Some(next) = modify.state {
            self.state = next;
        }
        Ok(())
    }

    fn check_transition(&self, next: QpState) -> Result<()> {
        use QpState::{Err as E, Init, Reset, Rtr, Rts, Sqd};
        let ok = matches!(
            (self.state, next),
            (_, Reset)
                | (_, E)
                | (Reset, Init)
                | (Init, Init)
                | (Init, Rtr)
                | (Rtr, Rts)
                | (Rts, Rts)
                | (Rts, Sqd)
                | (Sqd, Rts)
        );
        if ok {
            Ok(())
        } else {
            Err(Error::QpState(format!(
                "invalid transition {:?} -> {:?}",
                self.state, next
            )))
        }
    }

    /// Moves the head of the submitted list to the sending list if it
    /// may be dispatched, assigning its PSN range and timers. Returns
    /// whether a WQE was dispatched.
    pub(crate) fn dispatch_from_submitted(
        &mut self,
        now: Instant,
        sched_timeout: Duration,
    ) -> bool {
        if self.state != QpState::Rts {
            return false;
        }
        let Some(head) = self.requester.submitted.front() else {
            return false;
        };

        // A fenced request blocks until prior reads and atomics finish.
        if head.wr.flags.fence && self.requester.nr_rd_atomic > 0 {
            return false;
        }
        if self.qp_type == QpType::Rc && head.wr.opcode.is_rd_atomic() {
            if self.requester.nr_rd_atomic >= self.attrs.max_rd_atomic {
                return false;
            }
            self.requester.nr_rd_atomic += 1;
        }

        let mut wqe = self
            .requester
            .submitted
            .pop_front()
            .unwrap_or_else(|| unreachable!("head checked above"));

        let num_packets = num_packets(&wqe, self.attrs.path_mtu);
        wqe.list_type = WqeList::Sending;
        wqe.based_psn = self.requester.expected_psn;
        wqe.expected_psn = self.requester.expected_psn + num_packets;
        wqe.all_packets = num_packets;
        wqe.ack_packets = 0;
        wqe.sent_packets = 0;
        wqe.schedule_time = now;
        wqe.local_ack_time = now + sched_timeout;
        wqe.retry_cnt = self.attrs.retry_cnt;
        wqe.rnr_retry = self.attrs.rnr_retry;
        self.requester.expected_psn += num_packets;
        self.requester.sending.push_back(wqe);
        true
    }

    /// Moves every waiting WQE back to the head of the sending list in
    /// the same relative order and rewinds each to its first unacked
    /// packet.
    pub(crate) fn rewind_waiting(&mut self) {
        while let Some(mut wqe) = self.requester.waiting.pop_back() {
            wqe.list_type = WqeList::Sending;
            self.requester.sending.push_front(wqe);
        }
        for wqe in &mut self.requester.sending {
            wqe.sent_packets = wqe.ack_packets;
        }
    }

    /// Drains every outstanding WQE for a flush or reset. Recv WQEs are
    /// returned too.
    pub(crate) fn take_all_wqes(&mut self) -> (Vec<SendWqe>, Vec<RecvWqe>) {
        let requester = &mut self.requester;
        let mut send_wqes = Vec::with_capacity(
            requester.sending.len() + requester.waiting.len() + requester.submitted.len(),
        );
        send_wqes.extend(requester.sending.drain(..));
        send_wqes.extend(requester.waiting.drain(..));
        send_wqes.extend(requester.submitted.drain(..));
        for wqe in &mut send_wqes {
            wqe.list_type = WqeList::Free;
        }
        requester.nr_rd_atomic = 0;
        let recv_wqes = self.responder.recv_queue.drain(..).collect();
        self.responder.ack_queue.clear();
        self.responder.inflight = None;
        (send_wqes, recv_wqes)
    }

    /// Clears all transient state on a transition to RESET.
    pub(crate) fn reset(&mut self) {
        let _drained = self.take_all_wqes();
        self.requester = RequesterState::default();
        self.responder = ResponderState::default();
    }

    /// Requester invariant: the next assigned PSN equals the head of
    /// the pipeline plus everything in flight.
    #[cfg(test)]
    pub(crate) fn psn_accounting_holds(&self) -> bool {
        let requester = &self.requester;
        let head = requester
            .waiting
            .front()
            .or_else(|| requester.sending.front());
        let Some(head) = head else {
            return true;
        };
        let in_flight: u32 = requester
            .waiting
            .iter()
            .chain(requester.sending.iter())
            .map(|wqe| wqe.all_packets)
            .sum();
        head.based_psn + in_flight == requester.expected_psn
    }
}

/// Packets needed to carry a WQE: payload split at the path MTU for
/// sends and writes, the response span for reads, always at least one.
pub(crate) fn num_packets(wqe: &SendWqe, path_mtu: PathMtu) -> u32 {
    let mtu = path_mtu.in_bytes();
    if wqe.wr.opcode.is_atomic() {
        return 1;
    }
    wqe.total_length.div_ceil(mtu).max(1)
}

/// Allocates QP numbers: a bitmap index in the high bits and a random
/// key in the low bits. Numbers 0 and 1 are reserved for the
/// management QPs.
pub(crate) struct QpnAllocator {
    bitmap: BitVec,
}

impl QpnAllocator {
    pub(crate) fn new() -> Self {
        let mut bitmap = BitVec::with_capacity(MAX_QP_CNT);
        bitmap.resize(MAX_QP_CNT, false);
        bitmap.set(0, true); // index 0 holds QP0/QP1
        Self { bitmap }
    }

    #[allow(clippy::cast_possible_truncation)] // no larger than u32
    pub(crate) fn alloc(&mut self) -> Option<u32> {
        let index = self.bitmap.first_zero()? as u32;
        let key = rand::thread_rng().gen_range(0..1u32 << QPN_KEY_PART_WIDTH);
        self.bitmap.set(index as usize, true);
        Some(index << QPN_KEY_PART_WIDTH | key)
    }

    pub(crate) fn release(&mut self, qpn: u32) {
        let index = qpn_index(qpn);
        if index < MAX_QP_CNT {
            self.bitmap.set(index, false);
        }
    }
}
