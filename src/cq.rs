//! Completion queues.
//!
//! A CQ owns a preallocated pool of CQE slots; an insert moves a slot
//! from the free list to the pending FIFO and a poll moves it back, so
//! `|pending| + |free|` always equals the capacity. Exhausting the free
//! list is a consumer error: the CQ enters the error state and the
//! device worker later escalates it asynchronously.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use rand::Rng;

use crate::{
    config::Behaviors,
    error::{Error, Result},
    wr::{WcOpcode, WcStatus, WorkCompletion},
};

/// Completion notification arming.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CqNotify {
    #[default]
    None,
    Solicited,
    NextComp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CqState {
    Ok,
    Err,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CqInsertError {
    /// The free list was exhausted by this insert; the CQ is now in the
    /// error state and the caller must schedule the overflow handler.
    Overflow,
    /// The CQ was already unusable; the completion is dropped.
    NotOk,
}

pub(crate) type CompletionHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default, Clone)]
struct Cqe {
    wc: WorkCompletion,
    qpn: u32,
}

struct CqInner {
    state: CqState,
    notify_flag: CqNotify,
    has_notified: bool,
    pending: VecDeque<Cqe>,
    free: Vec<Cqe>,
    handler: Option<CompletionHandler>,
}

pub(crate) struct CompletionQueue {
    cq_num: u32,
    cap: usize,
    inner: Mutex<CqInner>,
}

impl CompletionQueue {
    pub(crate) fn new(cq_num: u32, cap: usize) -> Self {
        Self {
            cq_num,
            cap,
            inner: Mutex::new(CqInner {
                state: CqState::Ok,
                notify_flag: CqNotify::None,
                // assume the CQ has been notified when initial
                has_notified: true,
                pending: VecDeque::with_capacity(cap),
                free: vec![Cqe::default(); cap],
                handler: None,
            }),
        }
    }

    pub(crate) fn cq_num(&self) -> u32 {
        self.cq_num
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    pub(crate) fn set_handler(&self, handler: CompletionHandler) {
        self.inner.lock().handler = Some(handler);
    }

    /// Drains up to `n` completions in FIFO order.
    pub(crate) fn poll(&self, n: usize) -> Result<Vec<WorkCompletion>> {
        let mut inner = self.inner.lock();
        if inner.state != CqState::Ok {
            return Err(Error::CqState(format!("cq {} is in error", self.cq_num)));
        }
        let mut out = Vec::with_capacity(n.min(inner.pending.len()));
        for _ in 0..n {
            let Some(mut cqe) = inner.pending.pop_front() else {
                break;
            };
            out.push(cqe.wc);
            cqe.wc = WorkCompletion::default();
            inner.free.push(cqe);
        }
        Ok(out)
    }

    /// Arms completion notification. Returns `true` when
    /// `report_missed` is set and completions are already pending.
    pub(crate) fn req_notify(&self, flag: CqNotify, report_missed: bool) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.state != CqState::Ok {
            return Err(Error::CqState(format!("cq {} is in error", self.cq_num)));
        }
        if flag != CqNotify::None {
            inner.notify_flag = flag;
        }
        let missed = report_missed && !inner.pending.is_empty();
        inner.has_notified = false;
        Ok(missed)
    }

    pub(crate) fn insert_success(
        &self,
        qpn: u32,
        wc: WorkCompletion,
        solicited: bool,
    ) -> std::result::Result<(), CqInsertError> {
        self.insert(qpn, wc, solicited)
    }

    pub(crate) fn insert_error(
        &self,
        qpn: u32,
        wr_id: u64,
        status: WcStatus,
        opcode: WcOpcode,
        behaviors: Behaviors,
    ) -> std::result::Result<(), CqInsertError> {
        let mut wc = WorkCompletion {
            wr_id,
            status,
            opcode,
            qp_num: qpn,
            ..WorkCompletion::default()
        };

        if behaviors.corrupt_invalid_wc_attrs {
            let mut rng = rand::thread_rng();
            wc.byte_len = rng.gen();
            wc.imm = Some(rng.gen());
            wc.src_qp = rng.gen::<u32>() & crate::constants::QPN_MASK;
            wc.slid = rng.gen();
            wc.sl = rng.gen();
            wc.pkey_index = rng.gen();
            wc.dlid_path_bits = rng.gen();
        }

        self.insert(qpn, wc, true)
    }

    fn insert(
        &self,
        qpn: u32,
        wc: WorkCompletion,
        solicited: bool,
    ) -> std::result::Result<(), CqInsertError> {
        let mut inner = self.inner.lock();

        if inner.state != CqState::Ok {
            return Err(CqInsertError::NotOk);
        }

        let Some(mut cqe) = inner.free.pop() else {
            inner.state = CqState::Err;
            return Err(CqInsertError::Overflow);
        };
        cqe.wc = wc;
        cqe.qpn = qpn;
        inner.pending.push_back(cqe);

        let fire = match inner.notify_flag {
            CqNotify::NextComp => true,
            CqNotify::Solicited => solicited,
            CqNotify::None => false,
        } && !inner.has_notified;

        if fire {
            // has_notified must be set before the handler runs: the
            // handler may re-arm notification on this very CQ.
            inner.has_notified = true;
            let handler = inner.handler.clone();
            drop(inner);
            if let Some(handler) = handler {
                handler();
            }
        }

        Ok(())
    }

    /// Moves every pending CQE belonging to `qpn` back to the free
    /// list. Returns the number removed.
    pub(crate) fn remove_by_qp(&self, qpn: u32) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.pending.len();
        let mut kept = VecDeque::with_capacity(before);
        while let Some(mut cqe) = inner.pending.pop_front() {
            if cqe.qpn == qpn {
                cqe.wc = WorkCompletion::default();
                inner.free.push(cqe);
            } else {
                kept.push_back(cqe);
            }
        }
        inner.pending = kept;
        before - inner.pending.len()
    }

    /// Marks the CQ unusable; used by the overflow escalation.
    pub(crate) fn mark_err(&self) {
        self.inner.lock().state = CqState::Err;
    }

    #[cfg(test)]
    pub(crate) fn conservation_holds(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending.len() + inner.free.len() == self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wc(wr_id: u64) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            ..WorkCompletion::default()
        }
    }

    #[test]
    fn fifo_and_conservation() {
        let cq = CompletionQueue::new(1, 4);
        for i in 0..3 {
            cq.insert_success(9, wc(i), false).unwrap();
            assert!(cq.conservation_holds());
        }
        let polled = cq.poll(8).unwrap();
        assert_eq!(polled.iter().map(|w| w.wr_id).collect::<Vec<_>>(), [0, 1, 2]);
        assert!(cq.conservation_holds());
        assert!(cq.poll(1).unwrap().is_empty());
    }

    #[test]
    fn overflow_marks_error_once() {
        let cq = CompletionQueue::new(1, 2);
        cq.insert_success(9, wc(0), false).unwrap();
        cq.insert_success(9, wc(1), false).unwrap();
        assert_eq!(cq.insert_success(9, wc(2), false), Err(CqInsertError::Overflow));
        // already in error: subsequent inserts are dropped, not overflow
        assert_eq!(cq.insert_success(9, wc(3), false), Err(CqInsertError::NotOk));
        assert!(cq.poll(1).is_err());
    }

    #[test]
    fn notify_gating() {
        let cq = Arc::new(CompletionQueue::new(1, 8));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_c = Arc::clone(&fired);
        cq.set_handler(Arc::new(move || {
            let _count = fired_c.fetch_add(1, Ordering::SeqCst);
        }));

        // not armed: no callback
        cq.insert_success(9, wc(0), false).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // armed for next completion: exactly one callback
        assert!(!cq.req_notify(CqNotify::NextComp, false).unwrap());
        cq.insert_success(9, wc(1), false).unwrap();
        cq.insert_success(9, wc(2), false).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // solicited arming ignores unsolicited completions
        assert!(cq.req_notify(CqNotify::Solicited, true).unwrap());
        cq.insert_success(9, wc(3), false).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        cq.insert_success(9, wc(4), true).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reentrant_req_notify_from_handler() {
        let cq = Arc::new(CompletionQueue::new(1, 8));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_c = Arc::clone(&fired);
        let cq_c = Arc::clone(&cq);
        cq.set_handler(Arc::new(move || {
            let _count = fired_c.fetch_add(1, Ordering::SeqCst);
            let _missed = cq_c.req_notify(CqNotify::NextComp, false);
        }));

        cq.req_notify(CqNotify::NextComp, false).unwrap();
        cq.insert_success(9, wc(0), false).unwrap();
        cq.insert_success(9, wc(1), false).unwrap();
        cq.insert_success(9, wc(2), false).unwrap();
        // the handler re-armed itself each time
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn remove_by_qp_filters() {
        let cq = CompletionQueue::new(1, 8);
        cq.insert_success(1, wc(10), false).unwrap();
        cq.insert_success(2, wc(20), false).unwrap();
        cq.insert_success(1, wc(11), false).unwrap();
        assert_eq!(cq.remove_by_qp(1), 2);
        assert!(cq.conservation_holds());
        let polled = cq.poll(8).unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].wr_id, 20);
    }

    #[test]
    fn corrupt_behavior_randomizes_error_wc() {
        let cq = CompletionQueue::new(1, 4);
        let behaviors = Behaviors {
            corrupt_invalid_wc_attrs: true,
        };
        cq.insert_error(7, 99, WcStatus::RemAccessErr, WcOpcode::Send, behaviors)
            .unwrap();
        let polled = cq.poll(1).unwrap();
        assert_eq!(polled[0].wr_id, 99);
        assert_eq!(polled[0].status, WcStatus::RemAccessErr);
    }
}
