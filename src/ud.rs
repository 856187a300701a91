//! Unreliable-datagram transport engine, also serving the SMI and GSI
//! management QPs. No retransmission, no PSN matching beyond
//! statistics; a missing receive WQE drops the datagram silently.

use log::debug;

use crate::{
    constants::QPN_MASK,
    device::DeviceInner,
    mem,
    packet::{parse_imm, Bth, Deth, Grh, Lrh, Opcode},
    qp::{QueuePair, SendWqe, WqeList},
    wr::{WcOpcode, WcStatus, WorkCompletion},
};

/// Emits the single datagram of a UD send WQE and completes it
/// immediately. Local faults set an error status and leave the list
/// transition to the caller.
pub(crate) fn process_send_wqe(dev: &DeviceInner, qp: &mut QueuePair, wqe: &mut SendWqe) {
    let Some(dest) = wqe.wr.ud else {
        debug!("UD send without address handle, qpn: {}", qp.qp_num);
        wqe.status = WcStatus::LocQpOpErr;
        return;
    };

    let mtu = qp.attrs.path_mtu.in_bytes();
    if wqe.total_length > mtu {
        wqe.status = WcStatus::LocLenErr;
        return;
    }

    let mut ext = Vec::new();
    Deth {
        qkey: dest.qkey,
        src_qp: qp.qp_num,
    }
    .emit(&mut ext);
    if let Some(imm) = wqe.wr.imm {
        ext.extend_from_slice(&imm.to_be_bytes());
    }

    let mut payload = Vec::with_capacity(wqe.total_length as usize);
    if wqe.wr.flags.inline {
        payload.extend_from_slice(&wqe.wr.inline_data);
    } else if let Err(err) = mem::gather(
        dev.memory(),
        &wqe.wr.sg_list,
        0,
        wqe.total_length,
        &mut payload,
    ) {
        debug!("local gather failed: {err}");
        wqe.status = WcStatus::LocProtErr;
        return;
    }

    let opcode = if wqe.wr.imm.is_some() {
        Opcode::UdSendOnlyImm
    } else {
        Opcode::UdSendOnly
    };
    let bth = Bth {
        opcode: opcode as u8,
        se: wqe.wr.flags.solicited,
        pkey: 0xFFFF,
        dest_qp: dest.dqpn & QPN_MASK,
        psn: wqe.based_psn,
        ..Bth::default()
    };
    dev.send_from_port(qp.port_num, qp.qp_num, dest.dlid, qp.attrs.sl, bth, &ext, &payload);

    // no acknowledgement will come; the WQE is done
    wqe.sent_packets = wqe.all_packets;
    wqe.ack_packets = wqe.all_packets;
    wqe.list_type = WqeList::Free;
}

/// Delivers an inbound UD datagram to `qp`.
pub(crate) fn receive(
    dev: &DeviceInner,
    qp: &mut QueuePair,
    lrh: &Lrh,
    _grh: Option<&Grh>,
    bth: &Bth,
    body: &[u8],
) {
    let Some(opcode) = Opcode::from_u8(bth.opcode) else {
        dev.count_drop("unknown UD opcode");
        return;
    };
    if !matches!(opcode, Opcode::UdSendOnly | Opcode::UdSendOnlyImm) {
        dev.count_drop("non-UD opcode on UD QP");
        return;
    }
    if !qp.state.recv_ok() {
        dev.count_drop("UD packet outside receiving state");
        return;
    }

    let Ok((deth, rest)) = Deth::parse(body) else {
        dev.count_drop("truncated DETH");
        return;
    };
    // the management QPs skip the qkey check
    if qp.qp_num > crate::constants::QP1 && deth.qkey != qp.attrs.qkey {
        dev.count_drop("qkey mismatch");
        return;
    }

    let (imm, payload) = if opcode == Opcode::UdSendOnlyImm {
        match parse_imm(rest) {
            Ok((imm, rest)) => (Some(imm), rest),
            Err(_err) => {
                dev.count_drop("truncated immediate");
                return;
            }
        }
    } else {
        (None, rest)
    };

    if payload.len() as u32 > qp.attrs.path_mtu.in_bytes() {
        dev.count_drop("UD payload exceeds path MTU");
        return;
    }

    // UD has no RNR: no posted receive means a silent drop
    let Some(wqe) = qp.responder.recv_queue.pop_front() else {
        dev.count_drop("no receive WQE posted");
        return;
    };

    if let Err(err) = mem::scatter(dev.memory(), &wqe.wr.sg_list, 0, payload) {
        debug!("UD recv scatter failed: {err}");
        dev.insert_recv_error(qp, wqe.wr.wr_id, WcStatus::LocProtErr);
        return;
    }

    let wc = WorkCompletion {
        wr_id: wqe.wr.wr_id,
        status: WcStatus::Success,
        opcode: WcOpcode::Recv,
        byte_len: payload.len() as u32,
        imm,
        qp_num: qp.qp_num,
        src_qp: deth.src_qp,
        slid: lrh.slid,
        sl: lrh.sl,
        port_num: qp.port_num,
        ..WorkCompletion::default()
    };
    dev.insert_recv_completion(qp, wc, bth.se);
}

/// Whether a looped-back multicast datagram originates from this very
/// QP; such copies are not delivered.
pub(crate) fn is_multicast_self(qp: &QueuePair, port_lid: u16, slid: u16, src_qp: u32) -> bool {
    port_lid == slid && src_qp == qp.qp_num
}
