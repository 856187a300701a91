//! Reliable-connected transport engine.
//!
//! The requester side packetises send WQEs, tracks PSN windows and
//! drives retransmission; the responder side executes inbound requests,
//! queues acknowledgements and detects duplicates. Both run on the
//! device worker under the QP lock.

use std::time::Instant;

use log::{debug, trace};

use crate::{
    constants::SEND_BURST_QUOTA,
    device::DeviceInner,
    mem::{self, MemAccessError},
    packet::{
        parse_imm, Aeth, AethKind, AtomicAckEth, AtomicEth, Bth, Lrh, NakCode, Opcode, Reth,
    },
    qp::{AckEntry, CachedResponse, InflightKind, InflightRecv, QpState, QueuePair, SendWqe, WqeList},
    types::{rnr_nak_timeout, Psn},
    wr::{WcOpcode, WcStatus, WorkCompletion, WrOpcode},
};

/// The infinite RNR retry sentinel.
const RNR_RETRY_INFINITE: u8 = 7;

// ---------------------------------------------------------------------
// requester: packetisation
// ---------------------------------------------------------------------

/// Emits the next burst of packets for the head sending WQE. Moves the
/// WQE to `Waiting` once every packet of a response-requiring operation
/// has been sent. Local faults set an error status and leave the list
/// transition to the caller.
pub(crate) fn process_send_wqe(dev: &DeviceInner, qp: &mut QueuePair, wqe: &mut SendWqe) {
    match wqe.wr.opcode {
        WrOpcode::Send | WrOpcode::SendWithImm | WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => {
            emit_data_burst(dev, qp, wqe);
        }
        WrOpcode::RdmaRead => {
            emit_read_request(dev, qp, wqe);
        }
        WrOpcode::CompSwap | WrOpcode::FetchAdd => {
            emit_atomic_request(dev, qp, wqe);
        }
    }
}

fn emit_data_burst(dev: &DeviceInner, qp: &mut QueuePair, wqe: &mut SendWqe) {
    let mtu = qp.attrs.path_mtu.in_bytes();
    let is_write = matches!(wqe.wr.opcode, WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm);

    // The window grows with unacked progress, bounded by the per-pass
    // quota.
    let window = wqe
        .sent_packets
        .saturating_sub(wqe.ack_packets)
        .saturating_add(1)
        .min(SEND_BURST_QUOTA);
    let remaining = wqe.all_packets - wqe.sent_packets;
    let burst = window.min(remaining);

    for _ in 0..burst {
        let seq = wqe.sent_packets;
        let offset = seq * mtu;
        let chunk = (wqe.total_length - offset).min(mtu);
        let last = seq + 1 == wqe.all_packets;

        let opcode = data_opcode(wqe, seq, last, is_write);

        let mut ext = Vec::new();
        if is_write && seq == 0 {
            Reth {
                vaddr: wqe.wr.remote_addr,
                rkey: wqe.wr.rkey,
                dlen: wqe.total_length,
            }
            .emit(&mut ext);
        }
        if last {
            if let Some(imm) = wqe.wr.imm {
                ext.extend_from_slice(&imm.to_be_bytes());
            }
        }

        let mut payload = Vec::with_capacity(chunk as usize);
        if wqe.wr.flags.inline {
            let start = offset as usize;
            let end = (offset + chunk) as usize;
            payload.extend_from_slice(&wqe.wr.inline_data[start..end]);
        } else if let Err(err) = mem::gather(dev.memory(), &wqe.wr.sg_list, offset, chunk, &mut payload)
        {
            debug!("local gather failed: {err}");
            wqe.status = WcStatus::LocProtErr;
            return;
        }

        let bth = Bth {
            opcode: opcode as u8,
            se: wqe.wr.flags.solicited && last,
            pkey: 0xFFFF,
            dest_qp: qp.attrs.dest_qp_num,
            ack_req: last,
            psn: wqe.based_psn + seq,
            ..Bth::default()
        };
        dev.send_from_port(qp.port_num, qp.qp_num, qp.attrs.dlid, qp.attrs.sl, bth, &ext, &payload);
        wqe.sent_packets += 1;
    }

    if wqe.sent_packets == wqe.all_packets {
        wqe.list_type = WqeList::Waiting;
    }
}

fn data_opcode(wqe: &SendWqe, seq: u32, last: bool, is_write: bool) -> Opcode {
    let only = wqe.all_packets == 1;
    let imm = wqe.wr.imm.is_some();
    match (is_write, only, seq == 0, last, imm) {
        (false, true, _, _, false) => Opcode::SendOnly,
        (false, true, _, _, true) => Opcode::SendOnlyImm,
        (false, false, true, _, _) => Opcode::SendFirst,
        (false, false, false, false, _) => Opcode::SendMiddle,
        (false, false, false, true, false) => Opcode::SendLast,
        (false, false, false, true, true) => Opcode::SendLastImm,
        (true, true, _, _, false) => Opcode::WriteOnly,
        (true, true, _, _, true) => Opcode::WriteOnlyImm,
        (true, false, true, _, _) => Opcode::WriteFirst,
        (true, false, false, false, _) => Opcode::WriteMiddle,
        (true, false, false, true, false) => Opcode::WriteLast,
        (true, false, false, true, true) => Opcode::WriteLastImm,
    }
}

fn emit_read_request(dev: &DeviceInner, qp: &mut QueuePair, wqe: &mut SendWqe) {
    let mut ext = Vec::new();
    Reth {
        vaddr: wqe.wr.remote_addr,
        rkey: wqe.wr.rkey,
        dlen: wqe.total_length,
    }
    .emit(&mut ext);

    let bth = Bth {
        opcode: Opcode::ReadRequest as u8,
        pkey: 0xFFFF,
        dest_qp: qp.attrs.dest_qp_num,
        ack_req: true,
        psn: wqe.based_psn,
        ..Bth::default()
    };
    dev.send_from_port(qp.port_num, qp.qp_num, qp.attrs.dlid, qp.attrs.sl, bth, &ext, &[]);
    // the whole response span is outstanding now
    wqe.sent_packets = wqe.all_packets;
    wqe.list_type = WqeList::Waiting;
}

fn emit_atomic_request(dev: &DeviceInner, qp: &mut QueuePair, wqe: &mut SendWqe) {
    let opcode = if wqe.wr.opcode == WrOpcode::CompSwap {
        Opcode::CompareSwap
    } else {
        Opcode::FetchAdd
    };
    let mut ext = Vec::new();
    AtomicEth {
        vaddr: wqe.wr.remote_addr,
        rkey: wqe.wr.rkey,
        swap_add: wqe.wr.swap_add,
        compare: wqe.wr.compare,
    }
    .emit(&mut ext);

    let bth = Bth {
        opcode: opcode as u8,
        pkey: 0xFFFF,
        dest_qp: qp.attrs.dest_qp_num,
        ack_req: true,
        psn: wqe.based_psn,
        ..Bth::default()
    };
    dev.send_from_port(qp.port_num, qp.qp_num, qp.attrs.dlid, qp.attrs.sl, bth, &ext, &[]);
    wqe.sent_packets = wqe.all_packets;
    wqe.list_type = WqeList::Waiting;
}

// ---------------------------------------------------------------------
// responder: ack generation
// ---------------------------------------------------------------------

/// Sends at most one responder packet per scheduler pass. Returns
/// whether anything was emitted.
pub(crate) fn generate_one_ack(dev: &DeviceInner, qp: &mut QueuePair) -> bool {
    let Some(mut entry) = qp.responder.ack_queue.pop_front() else {
        return false;
    };

    let mtu = qp.attrs.path_mtu.in_bytes();
    let dlid = qp.attrs.dlid;
    let sl = qp.attrs.sl;
    let dest_qp = qp.attrs.dest_qp_num;

    let mut requeue = false;
    match &mut entry {
        AckEntry::Ack { psn, msn } => {
            send_aeth(dev, qp.port_num, qp.qp_num, dlid, sl, dest_qp, Opcode::Acknowledge, *psn, AethKind::Ack, *msn, &[]);
        }
        AckEntry::Nak { psn, code, msn } => {
            send_aeth(dev, qp.port_num, qp.qp_num, dlid, sl, dest_qp, Opcode::Acknowledge, *psn, AethKind::Nak(*code), *msn, &[]);
        }
        AckEntry::RnrNak { psn, timer, msn } => {
            send_aeth(dev, qp.port_num, qp.qp_num, dlid, sl, dest_qp, Opcode::Acknowledge, *psn, AethKind::RnrNak { timer: *timer }, *msn, &[]);
        }
        AckEntry::AtomicAck { psn, orig, msn } => {
            let mut tail = Vec::new();
            AtomicAckEth { orig_data: *orig }.emit(&mut tail);
            send_aeth(dev, qp.port_num, qp.qp_num, dlid, sl, dest_qp, Opcode::AtomicAcknowledge, *psn, AethKind::Ack, *msn, &tail);
        }
        AckEntry::ReadResponse {
            based_psn,
            num_packets,
            sent,
            addr,
            rkey,
            length,
            msn,
        } => {
            let seq = *sent;
            let offset = seq * mtu;
            let chunk = (*length - offset).min(mtu);
            let last = seq + 1 == *num_packets;
            let opcode = match (*num_packets == 1, seq == 0, last) {
                (true, _, _) => Opcode::ReadResponseOnly,
                (false, true, _) => Opcode::ReadResponseFirst,
                (false, false, false) => Opcode::ReadResponseMiddle,
                (false, false, true) => Opcode::ReadResponseLast,
            };

            let mut payload = vec![0u8; chunk as usize];
            if let Err(err) = dev.memory().read(*rkey, *addr + u64::from(offset), &mut payload) {
                debug!("read response fetch failed: {err}");
                push_nak(qp, NakCode::RemoteOp);
                return true;
            }

            let mut ext = Vec::new();
            // middle response packets carry no AETH
            if !matches!(opcode, Opcode::ReadResponseMiddle) {
                Aeth {
                    kind: AethKind::Ack,
                    msn: *msn,
                }
                .emit(&mut ext);
            }
            let bth = Bth {
                opcode: opcode as u8,
                pkey: 0xFFFF,
                dest_qp,
                psn: *based_psn + seq,
                ..Bth::default()
            };
            dev.send_from_port(qp.port_num, qp.qp_num, dlid, sl, bth, &ext, &payload);

            *sent += 1;
            requeue = *sent < *num_packets;
        }
    }

    if requeue {
        qp.responder.ack_queue.push_front(entry);
    }
    true
}

#[allow(clippy::too_many_arguments)]
fn send_aeth(
    dev: &DeviceInner,
    port_num: u8,
    src_qp: u32,
    dlid: u16,
    sl: u8,
    dest_qp: u32,
    opcode: Opcode,
    psn: Psn,
    kind: AethKind,
    msn: u32,
    tail: &[u8],
) {
    let mut ext = Vec::new();
    Aeth { kind, msn }.emit(&mut ext);
    ext.extend_from_slice(tail);
    let bth = Bth {
        opcode: opcode as u8,
        pkey: 0xFFFF,
        dest_qp,
        psn,
        ..Bth::default()
    };
    dev.send_from_port(port_num, src_qp, dlid, sl, bth, &ext, &[]);
}

// ---------------------------------------------------------------------
// receive dispatch
// ---------------------------------------------------------------------

pub(crate) fn receive(
    dev: &DeviceInner,
    qp: &mut QueuePair,
    lrh: &Lrh,
    bth: &Bth,
    body: &[u8],
    now: Instant,
) {
    let Some(opcode) = Opcode::from_u8(bth.opcode) else {
        dev.count_drop("unknown RC opcode");
        return;
    };
    if !qp.state.recv_ok() {
        dev.count_drop("RC packet outside receiving state");
        return;
    }
    if opcode.is_rc_request() {
        responder_receive(dev, qp, lrh, bth, opcode, body);
    } else {
        requester_receive(dev, qp, bth, opcode, body, now);
    }
}

// ---------------------------------------------------------------------
// responder: request execution
// ---------------------------------------------------------------------

fn responder_receive(
    dev: &DeviceInner,
    qp: &mut QueuePair,
    lrh: &Lrh,
    bth: &Bth,
    opcode: Opcode,
    body: &[u8],
) {
    let expected = qp.responder.psn;
    match bth.psn.cmp(&expected) {
        std::cmp::Ordering::Less => {
            replay_duplicate(qp, bth.psn);
            return;
        }
        std::cmp::Ordering::Greater => {
            // one NAK per sequence break, re-armed when the expected
            // PSN shows up
            if !qp.responder.nak_seq_pinned {
                qp.responder.nak_seq_pinned = true;
                push_nak(qp, NakCode::PsnSeqError);
            }
            return;
        }
        std::cmp::Ordering::Equal => {
            qp.responder.nak_seq_pinned = false;
        }
    }

    if !opcode_legal_here(qp, opcode) {
        qp.responder.inflight = None;
        push_nak(qp, NakCode::InvalidRequest);
        return;
    }

    match opcode {
        Opcode::SendFirst
        | Opcode::SendMiddle
        | Opcode::SendLast
        | Opcode::SendLastImm
        | Opcode::SendOnly
        | Opcode::SendOnlyImm => responder_send(dev, qp, lrh, bth, opcode, body),
        Opcode::WriteFirst
        | Opcode::WriteMiddle
        | Opcode::WriteLast
        | Opcode::WriteLastImm
        | Opcode::WriteOnly
        | Opcode::WriteOnlyImm => responder_write(dev, qp, lrh, bth, opcode, body),
        Opcode::ReadRequest => responder_read(dev, qp, body),
        Opcode::CompareSwap | Opcode::FetchAdd => responder_atomic(dev, qp, opcode, body),
        _ => unreachable!("requester opcode on responder path"),
    }
}

fn opcode_legal_here(qp: &QueuePair, opcode: Opcode) -> bool {
    match &qp.responder.inflight {
        None => opcode.starts_message(),
        Some(inflight) => match inflight.kind {
            InflightKind::Send => matches!(
                opcode,
                Opcode::SendMiddle | Opcode::SendLast | Opcode::SendLastImm
            ),
            InflightKind::Write => matches!(
                opcode,
                Opcode::WriteMiddle | Opcode::WriteLast | Opcode::WriteLastImm
            ),
        },
    }
}

fn replay_duplicate(qp: &mut QueuePair, psn: Psn) {
    if let Some(cached) = qp.responder.cached_response(psn).copied() {
        match cached {
            CachedResponse::Atomic { psn, orig, msn } => {
                qp.responder
                    .ack_queue
                    .push_back(AckEntry::AtomicAck { psn, orig, msn });
            }
            CachedResponse::Read {
                based_psn,
                num_packets,
                addr,
                rkey,
                length,
                msn,
            } => {
                qp.responder.ack_queue.push_back(AckEntry::ReadResponse {
                    based_psn,
                    num_packets,
                    sent: 0,
                    addr,
                    rkey,
                    length,
                    msn,
                });
            }
        }
        return;
    }
    // otherwise re-ACK everything received so far
    let psn = qp.responder.psn + (crate::constants::PSN_MASK);
    let msn = qp.responder.msn;
    push_coalesced_ack(qp, psn, msn);
}

fn push_coalesced_ack(qp: &mut QueuePair, psn: Psn, msn: u32) {
    if let Some(AckEntry::Ack {
        psn: last_psn,
        msn: last_msn,
    }) = qp.responder.ack_queue.back_mut()
    {
        *last_psn = psn;
        *last_msn = msn;
        return;
    }
    qp.responder.ack_queue.push_back(AckEntry::Ack { psn, msn });
}

fn push_nak(qp: &mut QueuePair, code: NakCode) {
    let psn = qp.responder.psn;
    let msn = qp.responder.msn;
    qp.responder
        .ack_queue
        .push_back(AckEntry::Nak { psn, code, msn });
}

fn push_rnr_nak(qp: &mut QueuePair) {
    let psn = qp.responder.psn;
    let msn = qp.responder.msn;
    let timer = qp.attrs.min_rnr_timer;
    qp.responder
        .ack_queue
        .push_back(AckEntry::RnrNak { psn, timer, msn });
}

fn responder_send(
    dev: &DeviceInner,
    qp: &mut QueuePair,
    lrh: &Lrh,
    bth: &Bth,
    opcode: Opcode,
    body: &[u8],
) {
    if opcode.starts_message() {
        let Some(wqe) = qp.responder.recv_queue.pop_front() else {
            push_rnr_nak(qp);
            return;
        };
        qp.responder.inflight = Some(InflightRecv {
            kind: InflightKind::Send,
            wqe: Some(wqe),
            received: 0,
            write_addr: 0,
            write_rkey: 0,
        });
    }

    let (imm, payload) = if opcode.has_immediate() {
        match parse_imm(body) {
            Ok((imm, rest)) => (Some(imm), rest),
            Err(_err) => {
                dev.count_drop("truncated immediate");
                qp.responder.inflight = None;
                push_nak(qp, NakCode::InvalidRequest);
                return;
            }
        }
    } else {
        (None, body)
    };

    let scatter_result = {
        let inflight = qp
            .responder
            .inflight
            .as_ref()
            .unwrap_or_else(|| unreachable!("opcode legality guarantees an inflight message"));
        let wqe = inflight
            .wqe
            .as_ref()
            .unwrap_or_else(|| unreachable!("send messages hold their RWQE"));
        mem::scatter(dev.memory(), &wqe.wr.sg_list, inflight.received, payload)
    };
    if let Err(err) = scatter_result {
        debug!("recv scatter failed: {err}");
        qp.responder.inflight = None;
        push_nak(qp, NakCode::InvalidRequest);
        return;
    }
    if let Some(inflight) = qp.responder.inflight.as_mut() {
        inflight.received += payload.len() as u32;
    }
    qp.responder.psn += 1;

    if opcode.ends_message() {
        let inflight = qp
            .responder
            .inflight
            .take()
            .unwrap_or_else(|| unreachable!("checked above"));
        let wqe = inflight
            .wqe
            .unwrap_or_else(|| unreachable!("send messages hold their RWQE"));
        qp.responder.msn += 1;

        let wc = WorkCompletion {
            wr_id: wqe.wr.wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len: inflight.received,
            imm,
            qp_num: qp.qp_num,
            src_qp: qp.attrs.dest_qp_num,
            slid: lrh.slid,
            sl: lrh.sl,
            port_num: qp.port_num,
            ..WorkCompletion::default()
        };
        dev.insert_recv_completion(qp, wc, bth.se);

        let psn = qp.responder.psn + crate::constants::PSN_MASK;
        let msn = qp.responder.msn;
        push_coalesced_ack(qp, psn, msn);
    } else if bth.ack_req {
        let psn = qp.responder.psn + crate::constants::PSN_MASK;
        let msn = qp.responder.msn;
        push_coalesced_ack(qp, psn, msn);
    }
}

fn responder_write(
    dev: &DeviceInner,
    qp: &mut QueuePair,
    lrh: &Lrh,
    bth: &Bth,
    opcode: Opcode,
    body: &[u8],
) {
    let mut body = body;

    if opcode.starts_message() {
        let (reth, rest) = match Reth::parse(body) {
            Ok(parsed) => parsed,
            Err(_err) => {
                dev.count_drop("truncated RETH");
                push_nak(qp, NakCode::InvalidRequest);
                return;
            }
        };
        body = rest;
        if dev
            .memory()
            .check(reth.rkey, reth.vaddr, reth.dlen, crate::mem::access::REMOTE_WRITE)
            .is_err()
        {
            push_nak(qp, NakCode::RemoteAccess);
            return;
        }
        qp.responder.inflight = Some(InflightRecv {
            kind: InflightKind::Write,
            wqe: None,
            received: 0,
            write_addr: reth.vaddr,
            write_rkey: reth.rkey,
        });
    }

    let (imm, payload) = if opcode.has_immediate() {
        match parse_imm(body) {
            Ok((imm, rest)) => (Some(imm), rest),
            Err(_err) => {
                dev.count_drop("truncated immediate");
                qp.responder.inflight = None;
                push_nak(qp, NakCode::InvalidRequest);
                return;
            }
        }
    } else {
        (None, body)
    };

    // write-with-immediate consumes a receive WQE at the last packet
    let consumed_wr_id = if imm.is_some() {
        match qp.responder.recv_queue.pop_front() {
            Some(wqe) => Some(wqe.wr.wr_id),
            None => {
                qp.responder.inflight = None;
                push_rnr_nak(qp);
                return;
            }
        }
    } else {
        None
    };

    let write_result = {
        let inflight = qp
            .responder
            .inflight
            .as_ref()
            .unwrap_or_else(|| unreachable!("opcode legality guarantees an inflight message"));
        let addr = inflight.write_addr + u64::from(inflight.received);
        dev.memory().write(inflight.write_rkey, addr, payload)
    };
    if let Err(err) = write_result {
        let code = match err {
            MemAccessError::InvalidKey | MemAccessError::OutOfRange | MemAccessError::AccessDenied => {
                NakCode::RemoteAccess
            }
            MemAccessError::Misaligned => NakCode::InvalidRequest,
        };
        qp.responder.inflight = None;
        push_nak(qp, code);
        return;
    }
    if let Some(inflight) = qp.responder.inflight.as_mut() {
        inflight.received += payload.len() as u32;
    }
    qp.responder.psn += 1;

    if opcode.ends_message() {
        let inflight = qp
            .responder
            .inflight
            .take()
            .unwrap_or_else(|| unreachable!("checked above"));
        qp.responder.msn += 1;

        if let Some(imm) = imm {
            let wc = WorkCompletion {
                wr_id: consumed_wr_id.unwrap_or_default(),
                status: WcStatus::Success,
                opcode: WcOpcode::RecvRdmaWithImm,
                byte_len: inflight.received,
                imm: Some(imm),
                qp_num: qp.qp_num,
                src_qp: qp.attrs.dest_qp_num,
                slid: lrh.slid,
                sl: lrh.sl,
                port_num: qp.port_num,
                ..WorkCompletion::default()
            };
            dev.insert_recv_completion(qp, wc, bth.se);
        }

        let psn = qp.responder.psn + crate::constants::PSN_MASK;
        let msn = qp.responder.msn;
        push_coalesced_ack(qp, psn, msn);
    } else if bth.ack_req {
        let psn = qp.responder.psn + crate::constants::PSN_MASK;
        let msn = qp.responder.msn;
        push_coalesced_ack(qp, psn, msn);
    }
}

fn responder_read(dev: &DeviceInner, qp: &mut QueuePair, body: &[u8]) {
    let (reth, _rest) = match Reth::parse(body) {
        Ok(parsed) => parsed,
        Err(_err) => {
            dev.count_drop("truncated RETH");
            push_nak(qp, NakCode::InvalidRequest);
            return;
        }
    };
    if dev
        .memory()
        .check(reth.rkey, reth.vaddr, reth.dlen, crate::mem::access::REMOTE_READ)
        .is_err()
    {
        push_nak(qp, NakCode::RemoteAccess);
        return;
    }

    let mtu = qp.attrs.path_mtu.in_bytes();
    let num_packets = reth.dlen.div_ceil(mtu).max(1);
    let based_psn = qp.responder.psn;
    qp.responder.psn += num_packets;
    qp.responder.msn += 1;
    let msn = qp.responder.msn;

    qp.responder.ack_queue.push_back(AckEntry::ReadResponse {
        based_psn,
        num_packets,
        sent: 0,
        addr: reth.vaddr,
        rkey: reth.rkey,
        length: reth.dlen,
        msn,
    });
    qp.responder.cache_response(CachedResponse::Read {
        based_psn,
        num_packets,
        addr: reth.vaddr,
        rkey: reth.rkey,
        length: reth.dlen,
        msn,
    });
}

fn responder_atomic(dev: &DeviceInner, qp: &mut QueuePair, opcode: Opcode, body: &[u8]) {
    let (eth, _rest) = match AtomicEth::parse(body) {
        Ok(parsed) => parsed,
        Err(_err) => {
            dev.count_drop("truncated AtomicETH");
            push_nak(qp, NakCode::InvalidRequest);
            return;
        }
    };

    let result = if opcode == Opcode::CompareSwap {
        dev.memory()
            .compare_swap(eth.rkey, eth.vaddr, eth.compare, eth.swap_add)
    } else {
        dev.memory().fetch_add(eth.rkey, eth.vaddr, eth.swap_add)
    };
    let orig = match result {
        Ok(orig) => orig,
        Err(MemAccessError::Misaligned) => {
            push_nak(qp, NakCode::InvalidRequest);
            return;
        }
        Err(_err) => {
            push_nak(qp, NakCode::RemoteAccess);
            return;
        }
    };

    let psn = qp.responder.psn;
    qp.responder.psn += 1;
    qp.responder.msn += 1;
    let msn = qp.responder.msn;
    qp.responder
        .ack_queue
        .push_back(AckEntry::AtomicAck { psn, orig, msn });
    qp.responder
        .cache_response(CachedResponse::Atomic { psn, orig, msn });
}

// ---------------------------------------------------------------------
// requester: response processing
// ---------------------------------------------------------------------

fn requester_receive(
    dev: &DeviceInner,
    qp: &mut QueuePair,
    bth: &Bth,
    opcode: Opcode,
    body: &[u8],
    now: Instant,
) {
    match opcode {
        Opcode::Acknowledge => {
            let Ok((aeth, _rest)) = Aeth::parse(body) else {
                dev.count_drop("truncated AETH");
                return;
            };
            match aeth.kind {
                AethKind::Ack => apply_ack(dev, qp, bth.psn, now),
                AethKind::RnrNak { timer } => handle_rnr_nak(dev, qp, timer, now),
                AethKind::Nak(code) => handle_nak(dev, qp, code, now),
            }
        }
        Opcode::AtomicAcknowledge => {
            let Ok((_aeth, rest)) = Aeth::parse(body) else {
                dev.count_drop("truncated AETH");
                return;
            };
            let Ok((ack, _rest)) = AtomicAckEth::parse(rest) else {
                dev.count_drop("truncated AtomicAckETH");
                return;
            };
            apply_atomic_ack(dev, qp, bth.psn, ack.orig_data, now);
        }
        Opcode::ReadResponseFirst
        | Opcode::ReadResponseMiddle
        | Opcode::ReadResponseLast
        | Opcode::ReadResponseOnly => {
            let payload = if matches!(opcode, Opcode::ReadResponseMiddle) {
                body
            } else {
                match Aeth::parse(body) {
                    Ok((_aeth, rest)) => rest,
                    Err(_err) => {
                        dev.count_drop("truncated AETH");
                        return;
                    }
                }
            };
            apply_read_response(dev, qp, bth.psn, payload, now);
        }
        _ => dev.count_drop("unexpected opcode on requester path"),
    }
}

/// A plain ACK with PSN `p` acknowledges every request packet up to and
/// including `p`.
fn apply_ack(dev: &DeviceInner, qp: &mut QueuePair, ack_psn: Psn, now: Instant) {
    let timeout = dev.sched_timeout();
    let mut progressed = false;

    for wqe in qp.requester.waiting.iter_mut().chain(qp.requester.sending.iter_mut()) {
        let last_psn = wqe.expected_psn + crate::constants::PSN_MASK; // expected_psn - 1
        if last_psn <= ack_psn {
            if wqe.ack_packets != wqe.all_packets {
                // reads and atomics complete only through their own
                // response packets
                if wqe.wr.opcode.is_rd_atomic() {
                    break;
                }
                wqe.ack_packets = wqe.all_packets;
                progressed = true;
            }
        } else if wqe.based_psn <= ack_psn {
            let acked = ack_psn - wqe.based_psn + 1;
            if !wqe.wr.opcode.is_rd_atomic() && acked > wqe.ack_packets {
                wqe.ack_packets = acked;
                progressed = true;
            }
            break;
        } else {
            break;
        }
    }

    if progressed {
        if let Some(head) = qp.requester.waiting.front_mut() {
            head.local_ack_time = now + timeout;
        }
        drain_completed(dev, qp);
    } else {
        trace!("duplicate ack ignored, qpn: {}", qp.qp_num);
    }
}

fn apply_atomic_ack(dev: &DeviceInner, qp: &mut QueuePair, psn: Psn, orig: u64, now: Instant) {
    let timeout = dev.sched_timeout();
    let Some(pos) = qp
        .requester
        .waiting
        .iter()
        .position(|wqe| wqe.based_psn == psn && wqe.wr.opcode.is_atomic())
    else {
        trace!("atomic ack with no matching request, qpn: {}", qp.qp_num);
        return;
    };
    let wqe = &qp.requester.waiting[pos];
    if wqe.ack_packets == wqe.all_packets {
        return; // duplicate
    }
    let sge = wqe.wr.sg_list.first().copied();
    if let Some(sge) = sge {
        if let Err(err) = dev.memory().write(sge.lkey, sge.addr, &orig.to_be_bytes()) {
            debug!("atomic result store failed: {err}");
            fatal_requester_error(dev, qp, WcStatus::LocProtErr);
            return;
        }
    }
    let wqe = &mut qp.requester.waiting[pos];
    wqe.ack_packets = wqe.all_packets;
    wqe.local_ack_time = now + timeout;
    drain_completed(dev, qp);
}

fn apply_read_response(dev: &DeviceInner, qp: &mut QueuePair, psn: Psn, payload: &[u8], now: Instant) {
    let timeout = dev.sched_timeout();
    let mtu = qp.attrs.path_mtu.in_bytes();

    let Some(pos) = qp.requester.waiting.iter().position(|wqe| {
        wqe.wr.opcode == WrOpcode::RdmaRead && wqe.based_psn <= psn && psn < wqe.expected_psn
    }) else {
        trace!("read response with no matching request, qpn: {}", qp.qp_num);
        return;
    };

    let scatter_result = {
        let wqe = &qp.requester.waiting[pos];
        let idx = psn - wqe.based_psn;
        if idx < wqe.ack_packets {
            return; // duplicate response packet
        }
        if idx > wqe.ack_packets {
            // a gap: wait for retransmission of the missing packets
            return;
        }
        mem::scatter(dev.memory(), &wqe.wr.sg_list, idx * mtu, payload)
    };
    if let Err(err) = scatter_result {
        debug!("read response scatter failed: {err}");
        fatal_requester_error(dev, qp, WcStatus::LocProtErr);
        return;
    }

    let wqe = &mut qp.requester.waiting[pos];
    wqe.ack_packets += 1;
    wqe.local_ack_time = now + timeout;

    drain_completed(dev, qp);
}

/// Completes fully-acked WQEs from the head of the waiting list, in
/// submission order.
pub(crate) fn drain_completed(dev: &DeviceInner, qp: &mut QueuePair) {
    while let Some(head) = qp.requester.waiting.front() {
        if head.ack_packets != head.all_packets {
            break;
        }
        let mut wqe = qp
            .requester
            .waiting
            .pop_front()
            .unwrap_or_else(|| unreachable!("head checked above"));
        wqe.list_type = WqeList::Free;
        if wqe.wr.opcode.is_rd_atomic() {
            qp.requester.nr_rd_atomic = qp.requester.nr_rd_atomic.saturating_sub(1);
        }
        complete_send_success(dev, qp, &wqe);
    }
}

pub(crate) fn complete_send_success(dev: &DeviceInner, qp: &QueuePair, wqe: &SendWqe) {
    if !wqe.wr.flags.signaled {
        return;
    }
    let byte_len = match wqe.wr.opcode {
        WrOpcode::CompSwap | WrOpcode::FetchAdd => 8,
        _ => wqe.total_length,
    };
    let wc = WorkCompletion {
        wr_id: wqe.wr.wr_id,
        status: WcStatus::Success,
        opcode: WcOpcode::from_wr(wqe.wr.opcode),
        byte_len,
        qp_num: qp.qp_num,
        port_num: qp.port_num,
        ..WorkCompletion::default()
    };
    dev.insert_send_completion(qp, wc, wqe.wr.flags.solicited);
}

fn handle_rnr_nak(dev: &DeviceInner, qp: &mut QueuePair, timer: u8, now: Instant) {
    qp.rewind_waiting();
    let Some(head) = qp.requester.sending.front_mut() else {
        return;
    };
    if head.rnr_retry == 0 {
        fatal_requester_error(dev, qp, WcStatus::RnrRetryExcErr);
        return;
    }
    if head.rnr_retry != RNR_RETRY_INFINITE {
        head.rnr_retry -= 1;
    }
    head.schedule_time = now + rnr_nak_timeout(timer);
    debug!("RNR NAK, qpn: {}, timer: {timer}", qp.qp_num);
}

fn handle_nak(dev: &DeviceInner, qp: &mut QueuePair, code: NakCode, now: Instant) {
    match code {
        NakCode::PsnSeqError => {
            let Some(head) = qp.requester.waiting.front_mut() else {
                return;
            };
            if head.retry_cnt == 0 {
                fatal_requester_error(dev, qp, WcStatus::RetryExcErr);
                return;
            }
            head.retry_cnt -= 1;
            head.local_ack_time = now + dev.sched_timeout();
            qp.rewind_waiting();
            if let Some(head) = qp.requester.sending.front_mut() {
                head.schedule_time = now;
            }
        }
        NakCode::InvalidRequest | NakCode::InvalidRdRequest => {
            fatal_requester_error(dev, qp, WcStatus::RemInvReqErr);
        }
        NakCode::RemoteAccess => {
            fatal_requester_error(dev, qp, WcStatus::RemAccessErr);
        }
        NakCode::RemoteOp => {
            fatal_requester_error(dev, qp, WcStatus::RemOpErr);
        }
    }
}

/// Completes the head outstanding WQE with `status`, moves the QP to
/// the error state and flushes everything else.
pub(crate) fn fatal_requester_error(dev: &DeviceInner, qp: &mut QueuePair, status: WcStatus) {
    let head = qp
        .requester
        .waiting
        .pop_front()
        .or_else(|| qp.requester.sending.pop_front());
    if let Some(mut wqe) = head {
        wqe.list_type = WqeList::Free;
        if wqe.wr.opcode.is_rd_atomic() {
            qp.requester.nr_rd_atomic = qp.requester.nr_rd_atomic.saturating_sub(1);
        }
        dev.insert_send_error(qp, &wqe, status);
    }
    qp.state = QpState::Err;
    dev.flush_qp(qp);
    dev.raise_qp_fatal(qp.qp_num);
}
