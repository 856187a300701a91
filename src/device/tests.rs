//! End-to-end transport scenarios over loopback UDP.
//!
//! Most tests drive the device deterministically: the worker threads
//! stay parked and the test pumps the receive path, the deferred work
//! queue and the QP scheduler by hand, feeding sent datagrams back in.

use super::*;

use std::sync::atomic::AtomicUsize;

use crate::{
    config::FabricConfig,
    constants::{MCAST_LID_BASE, MULTICAST_QPN},
    mad::{attr, method, Mad, NodeInfo, MAD_SIZE, NODE_TYPE_SWITCH},
    mem::{access, ProcessMemory},
    qp::ModifyQp,
    switch::EmulatedSwitch,
    types::{PathMtu, Psn},
    wr::{RecvWr, SendFlags, SendWr, Sge, UdDest, WcOpcode, WcStatus},
};

struct Harness {
    dev: Device,
    mem: Arc<ProcessMemory>,
    mkey: u32,
}

const PORT_LID: u16 = 5;
const MEM_BASE: u64 = 0x10_0000;
const MEM_LEN: usize = 64 * 1024;

fn harness(config: FabricConfig) -> Harness {
    let mem = Arc::new(ProcessMemory::new());
    let mkey = mem.register(MEM_BASE, MEM_LEN, access::ALL);
    let dev = Device::new(0, config, Arc::clone(&mem) as Arc<dyn MemoryRegistry>, None).unwrap();
    dev.set_port_lid(1, PORT_LID).unwrap();
    for port in &dev.inner().ports {
        port.socket.set_nonblocking(true).unwrap();
    }
    Harness { dev, mem, mkey }
}

impl Harness {
    fn sge(&self, offset: u64, length: u32) -> Sge {
        Sge {
            addr: MEM_BASE + offset,
            length,
            lkey: self.mkey,
        }
    }

    fn write_mem(&self, offset: u64, data: &[u8]) {
        self.mem.write(self.mkey, MEM_BASE + offset, data).unwrap();
    }

    fn read_mem(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.mem.read(self.mkey, MEM_BASE + offset, &mut buf).unwrap();
        buf
    }

    /// Creates a connected loopback RC pair on port 1.
    fn rc_pair(&self) -> (u32, u32, u32, u32, u32, u32) {
        let scq_a = self.dev.create_cq(64).unwrap();
        let rcq_a = self.dev.create_cq(64).unwrap();
        let scq_b = self.dev.create_cq(64).unwrap();
        let rcq_b = self.dev.create_cq(64).unwrap();
        let qp_a = self.create_rc(scq_a, rcq_a);
        let qp_b = self.create_rc(scq_b, rcq_b);
        self.connect(qp_a, qp_b);
        self.connect(qp_b, qp_a);
        (qp_a, qp_b, scq_a, rcq_a, scq_b, rcq_b)
    }

    fn create_rc(&self, send_cq: u32, recv_cq: u32) -> u32 {
        self.dev
            .create_qp(QpInitAttr {
                qp_type: QpType::Rc,
                port_num: 1,
                send_cq,
                recv_cq,
            })
            .unwrap()
    }

    fn connect(&self, qp: u32, dest: u32) {
        self.dev
            .modify_qp(
                qp,
                &ModifyQp {
                    state: Some(QpState::Init),
                    ..ModifyQp::default()
                },
            )
            .unwrap();
        self.dev
            .modify_qp(
                qp,
                &ModifyQp {
                    state: Some(QpState::Rtr),
                    path_mtu: Some(PathMtu::Mtu256),
                    dest_qp_num: Some(dest),
                    dlid: Some(PORT_LID),
                    rq_psn: Some(0),
                    min_rnr_timer: Some(1),
                    ..ModifyQp::default()
                },
            )
            .unwrap();
        self.dev
            .modify_qp(
                qp,
                &ModifyQp {
                    state: Some(QpState::Rts),
                    sq_psn: Some(0),
                    max_rd_atomic: Some(4),
                    ..ModifyQp::default()
                },
            )
            .unwrap();
    }

    /// Pulls every datagram currently sitting in the port sockets.
    fn drain_frames(&self) -> Vec<(usize, Vec<u8>)> {
        let mut frames = Vec::new();
        for (index, port) in self.dev.inner().ports.iter().enumerate() {
            let mut buf = vec![0u8; PACKET_BUFFER];
            while let Ok((len, _src)) = port.socket.recv_from(&mut buf) {
                frames.push((index, buf[..len].to_vec()));
            }
        }
        frames
    }

    /// Runs scheduler, work queue and receive delivery to quiescence,
    /// bounded so a live retry loop cannot hang the test.
    fn pump(&self) {
        let inner = self.dev.inner();
        let mut idle_rounds = 0;
        for _round in 0..200 {
            if idle_rounds >= 3 {
                break;
            }
            inner.scheduler_pass();
            inner.process_work_queue();
            let frames = self.drain_frames();
            if frames.is_empty() {
                idle_rounds += 1;
                continue;
            }
            idle_rounds = 0;
            for (port_index, frame) in frames {
                inner.handle_datagram(port_index, &frame);
            }
        }
    }

    fn dest_qpn_of(&self, frame: &[u8]) -> u32 {
        let (packet_bytes, _footer) = crate::packet::strip_footer(frame).unwrap();
        let parsed = crate::packet::parse_packet(packet_bytes).unwrap();
        parsed.bth.dest_qp
    }
}

#[test]
fn rc_send_single_packet() {
    let h = harness(FabricConfig::default());
    let (qp_a, qp_b, scq_a, _rcq_a, _scq_b, rcq_b) = h.rc_pair();

    let payload: Vec<u8> = (0..=255).collect();
    h.write_mem(0, &payload);

    h.dev.post_recv(qp_b, RecvWr::new(9, vec![h.sge(0x1000, 1024)])).unwrap();
    h.dev.post_send(qp_a, SendWr::send(1, vec![h.sge(0, 256)])).unwrap();
    h.pump();

    let send_wcs = h.dev.poll_cq(scq_a, 8).unwrap();
    assert_eq!(send_wcs.len(), 1);
    assert_eq!(send_wcs[0].wr_id, 1);
    assert_eq!(send_wcs[0].status, WcStatus::Success);
    assert_eq!(send_wcs[0].opcode, WcOpcode::Send);

    let recv_wcs = h.dev.poll_cq(rcq_b, 8).unwrap();
    assert_eq!(recv_wcs.len(), 1);
    assert_eq!(recv_wcs[0].wr_id, 9);
    assert_eq!(recv_wcs[0].byte_len, 256);
    assert_eq!(h.read_mem(0x1000, 256), payload);
}

#[test]
fn rc_send_five_packets_advances_psn() {
    let h = harness(FabricConfig::default());
    let (qp_a, qp_b, scq_a, _rcq_a, _scq_b, rcq_b) = h.rc_pair();

    let payload: Vec<u8> = (0..1025u32).map(|i| i as u8).collect();
    h.write_mem(0, &payload);

    h.dev.post_recv(qp_b, RecvWr::new(9, vec![h.sge(0x2000, 2048)])).unwrap();
    h.dev.post_send(qp_a, SendWr::send(2, vec![h.sge(0, 1025)])).unwrap();
    h.pump();

    assert_eq!(h.dev.poll_cq(scq_a, 8).unwrap().len(), 1);
    let recv_wcs = h.dev.poll_cq(rcq_b, 8).unwrap();
    assert_eq!(recv_wcs.len(), 1);
    assert_eq!(recv_wcs[0].byte_len, 1025);
    assert_eq!(h.read_mem(0x2000, 1025), payload);

    // FIRST + 3 MIDDLE + LAST consumed five sequence numbers
    {
        let qp = h.dev.inner().find_qp(qp_a).unwrap();
        let qp = qp.lock();
        assert_eq!(qp.requester.expected_psn, Psn::new(5));
        assert!(qp.requester.waiting.is_empty());
        assert!(qp.requester.sending.is_empty());
    }
    {
        let qp = h.dev.inner().find_qp(qp_b).unwrap();
        let qp = qp.lock();
        assert_eq!(qp.responder.psn, Psn::new(5));
    }
}

#[test]
fn rc_retry_after_lost_ack() {
    let mut config = FabricConfig::default();
    config.sched_timeout_ms = 30;
    let h = harness(config);
    let (qp_a, qp_b, scq_a, _rcq_a, _scq_b, rcq_b) = h.rc_pair();

    let payload: Vec<u8> = (0..1025u32).map(|i| (i * 7) as u8).collect();
    h.write_mem(0, &payload);
    h.dev.post_recv(qp_b, RecvWr::new(9, vec![h.sge(0x2000, 2048)])).unwrap();
    h.dev.post_send(qp_a, SendWr::send(3, vec![h.sge(0, 1025)])).unwrap();

    // run the fabric, but swallow every ack headed for the requester
    let inner = h.dev.inner();
    let mut dropped_acks = 0;
    for _round in 0..64 {
        inner.scheduler_pass();
        let frames = h.drain_frames();
        if frames.is_empty() && dropped_acks > 0 {
            break;
        }
        for (port_index, frame) in frames {
            if h.dest_qpn_of(&frame) == qp_a {
                dropped_acks += 1;
            } else {
                inner.handle_datagram(port_index, &frame);
            }
        }
    }
    assert!(dropped_acks >= 1, "responder never acked");
    assert!(h.dev.poll_cq(scq_a, 8).unwrap().is_empty());

    // after the local-ack timeout the request rewinds and decrements
    // its retry budget
    std::thread::sleep(Duration::from_millis(40));
    inner.scheduler_pass();
    {
        let qp = h.dev.inner().find_qp(qp_a).unwrap();
        let qp = qp.lock();
        let head = qp
            .requester
            .sending
            .front()
            .or_else(|| qp.requester.waiting.front())
            .expect("request still outstanding");
        assert_eq!(head.retry_cnt, h.dev.inner().config.retry_cnt - 1);
    }

    // full retransmission completes the message
    h.pump();
    let send_wcs = h.dev.poll_cq(scq_a, 8).unwrap();
    assert_eq!(send_wcs.len(), 1);
    assert_eq!(send_wcs[0].status, WcStatus::Success);
    assert_eq!(h.dev.poll_cq(rcq_b, 8).unwrap().len(), 1);
    assert_eq!(h.read_mem(0x2000, 1025), payload);
}

#[test]
fn rc_rdma_write_then_read_back() {
    let h = harness(FabricConfig::default());
    let (qp_a, _qp_b, scq_a, _rcq_a, _scq_b, _rcq_b) = h.rc_pair();

    let payload: Vec<u8> = (0..1025u32).map(|i| (i * 3) as u8).collect();
    h.write_mem(0, &payload);

    h.dev
        .post_send(
            qp_a,
            SendWr::rdma_write(11, vec![h.sge(0, 1025)], MEM_BASE + 0x3000, h.mkey),
        )
        .unwrap();
    h.pump();
    let wcs = h.dev.poll_cq(scq_a, 8).unwrap();
    assert_eq!(wcs.len(), 1);
    assert_eq!(wcs[0].opcode, WcOpcode::RdmaWrite);
    assert_eq!(h.read_mem(0x3000, 1025), payload);

    h.dev
        .post_send(
            qp_a,
            SendWr::rdma_read(12, vec![h.sge(0x5000, 1025)], MEM_BASE + 0x3000, h.mkey),
        )
        .unwrap();
    h.pump();
    let wcs = h.dev.poll_cq(scq_a, 8).unwrap();
    assert_eq!(wcs.len(), 1);
    assert_eq!(wcs[0].opcode, WcOpcode::RdmaRead);
    assert_eq!(wcs[0].status, WcStatus::Success);
    assert_eq!(h.read_mem(0x5000, 1025), payload);

    // read and atomic gauges drained back to zero
    let qp = h.dev.inner().find_qp(qp_a).unwrap();
    assert_eq!(qp.lock().requester.nr_rd_atomic, 0);
}

#[test]
fn rc_duplicate_atomic_replays_cached_response() {
    let h = harness(FabricConfig::default());
    let (qp_a, qp_b, scq_a, _rcq_a, _scq_b, _rcq_b) = h.rc_pair();

    h.dev
        .post_send(
            qp_a,
            SendWr::fetch_add(21, h.sge(0x100, 8), MEM_BASE + 0x4000, h.mkey, 5),
        )
        .unwrap();

    // capture the atomic request so it can be replayed later
    let inner = h.dev.inner();
    let mut request_frame = None;
    for _round in 0..32 {
        inner.scheduler_pass();
        for (port_index, frame) in h.drain_frames() {
            if h.dest_qpn_of(&frame) == qp_b && request_frame.is_none() {
                request_frame = Some((port_index, frame.clone()));
            }
            inner.handle_datagram(port_index, &frame);
        }
    }
    h.pump();

    let wcs = h.dev.poll_cq(scq_a, 8).unwrap();
    assert_eq!(wcs.len(), 1);
    assert_eq!(wcs[0].opcode, WcOpcode::FetchAdd);
    // the original value came back, and memory holds old + 5
    assert_eq!(h.read_mem(0x100, 8), 0u64.to_be_bytes());
    assert_eq!(h.read_mem(0x4000, 8), 5u64.to_be_bytes());

    // replaying the duplicate does not execute the add twice
    let (port_index, frame) = request_frame.expect("atomic request seen");
    inner.handle_datagram(port_index, &frame);
    h.pump();
    assert_eq!(h.read_mem(0x4000, 8), 5u64.to_be_bytes());
}

#[test]
fn rc_rnr_nak_then_recovery() {
    let h = harness(FabricConfig::default());
    let (qp_a, qp_b, scq_a, _rcq_a, _scq_b, rcq_b) = h.rc_pair();

    h.write_mem(0, b"rnr payload");
    // no receive posted on the responder yet
    h.dev
        .post_send(qp_a, SendWr::send(31, vec![h.sge(0, 11)]))
        .unwrap();
    h.pump();
    assert!(h.dev.poll_cq(scq_a, 8).unwrap().is_empty());

    {
        let qp = h.dev.inner().find_qp(qp_a).unwrap();
        let qp = qp.lock();
        // still outstanding, bouncing between RNR NAK and back-off
        assert!(
            !qp.requester.sending.is_empty() || !qp.requester.waiting.is_empty(),
            "request gave up instead of backing off"
        );
        // the infinite sentinel never burns the RNR budget
        let head = qp
            .requester
            .sending
            .front()
            .or_else(|| qp.requester.waiting.front())
            .expect("request outstanding");
        assert_eq!(head.rnr_retry, 7);
    }

    h.dev.post_recv(qp_b, RecvWr::new(32, vec![h.sge(0x800, 64)])).unwrap();
    // the RNR timer of class 1 is 10us; one short sleep is plenty
    std::thread::sleep(Duration::from_millis(2));
    h.pump();

    assert_eq!(h.dev.poll_cq(scq_a, 8).unwrap().len(), 1);
    let recv_wcs = h.dev.poll_cq(rcq_b, 8).unwrap();
    assert_eq!(recv_wcs.len(), 1);
    assert_eq!(recv_wcs[0].byte_len, 11);
    assert_eq!(h.read_mem(0x800, 11), b"rnr payload");
}

#[test]
fn cq_overflow_escalates_to_qp_error() {
    let h = harness(FabricConfig::default());
    let scq = h.dev.create_cq(2).unwrap();
    let rcq_a = h.dev.create_cq(16).unwrap();
    let scq_b = h.dev.create_cq(16).unwrap();
    let rcq_b = h.dev.create_cq(16).unwrap();
    let qp_a = h.create_rc(scq, rcq_a);
    let qp_b = h.create_rc(scq_b, rcq_b);
    h.connect(qp_a, qp_b);
    h.connect(qp_b, qp_a);

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_c = Arc::clone(&events);
    h.dev
        .set_async_event_handler(Box::new(move |event| events_c.lock().push(event)));

    h.write_mem(0, &[0xAB; 64]);
    for wr_id in 0..3u64 {
        h.dev
            .post_recv(qp_b, RecvWr::new(100 + wr_id, vec![h.sge(0x900, 64)]))
            .unwrap();
        h.dev
            .post_send(qp_a, SendWr::send(wr_id, vec![h.sge(0, 64)]))
            .unwrap();
    }
    h.pump();

    // the third signaled completion found no free CQE slot
    assert!(matches!(h.dev.poll_cq(scq, 8), Err(Error::CqState(_))));
    let events = events.lock();
    assert!(events.contains(&AsyncEvent::CqError { cq_num: scq }));
    assert!(events
        .iter()
        .any(|event| matches!(event, AsyncEvent::QpFatal { .. })));

    let qp = h.dev.inner().find_qp(qp_a).unwrap();
    assert_eq!(qp.lock().state, QpState::Err);
}

#[test]
fn ud_multicast_fans_in_without_self_delivery() {
    let h = harness(FabricConfig::default());
    let mlid = MCAST_LID_BASE + 3;
    const QKEY: u32 = 0x1234;

    let mut qps = Vec::new();
    let mut rcqs = Vec::new();
    for _i in 0..3 {
        let scq = h.dev.create_cq(16).unwrap();
        let rcq = h.dev.create_cq(16).unwrap();
        let qp = h
            .dev
            .create_qp(QpInitAttr {
                qp_type: QpType::Ud,
                port_num: 1,
                send_cq: scq,
                recv_cq: rcq,
            })
            .unwrap();
        for state in [QpState::Init, QpState::Rtr, QpState::Rts] {
            h.dev
                .modify_qp(
                    qp,
                    &ModifyQp {
                        state: Some(state),
                        qkey: Some(QKEY),
                        ..ModifyQp::default()
                    },
                )
                .unwrap();
        }
        qps.push((qp, scq));
        rcqs.push(rcq);
    }

    // two receivers join the group; the sender does not
    h.dev.attach_mcast(qps[0].0, mlid).unwrap();
    h.dev.attach_mcast(qps[1].0, mlid).unwrap();
    for (i, (qp, _scq)) in qps.iter().enumerate().take(2) {
        h.dev
            .post_recv(*qp, RecvWr::new(i as u64, vec![h.sge(0x600 + i as u64 * 0x100, 256)]))
            .unwrap();
    }

    h.write_mem(0, b"group message");
    let sender = qps[2].0;
    let wr = SendWr::send(77, vec![h.sge(0, 13)]).with_ud_dest(UdDest {
        dlid: mlid,
        dqpn: MULTICAST_QPN,
        qkey: QKEY,
    });
    h.dev.post_send(sender, wr).unwrap();
    h.pump();

    assert_eq!(h.dev.poll_cq(qps[2].1, 8).unwrap().len(), 1);
    for (i, rcq) in rcqs.iter().enumerate().take(2) {
        let wcs = h.dev.poll_cq(*rcq, 8).unwrap();
        assert_eq!(wcs.len(), 1, "receiver {i} got the datagram");
        assert_eq!(wcs[0].byte_len, 13);
    }
    // the sender has no loopback copy
    assert!(h.dev.poll_cq(rcqs[2], 8).unwrap().is_empty());
}

#[test]
fn ud_send_without_recv_wqe_is_dropped() {
    let h = harness(FabricConfig::default());
    const QKEY: u32 = 0x99;

    let mut qps = Vec::new();
    for _i in 0..2 {
        let scq = h.dev.create_cq(16).unwrap();
        let rcq = h.dev.create_cq(16).unwrap();
        let qp = h
            .dev
            .create_qp(QpInitAttr {
                qp_type: QpType::Ud,
                port_num: 1,
                send_cq: scq,
                recv_cq: rcq,
            })
            .unwrap();
        for state in [QpState::Init, QpState::Rtr, QpState::Rts] {
            h.dev
                .modify_qp(
                    qp,
                    &ModifyQp {
                        state: Some(state),
                        qkey: Some(QKEY),
                        ..ModifyQp::default()
                    },
                )
                .unwrap();
        }
        qps.push((qp, scq, rcq));
    }

    h.write_mem(0, b"nobody listens");
    let wr = SendWr::send(1, vec![h.sge(0, 14)]).with_ud_dest(UdDest {
        dlid: PORT_LID,
        dqpn: qps[1].0,
        qkey: QKEY,
    });
    let drops = h.dev.drop_count();
    h.dev.post_send(qps[0].0, wr).unwrap();
    h.pump();

    // sender still completes; receiver silently dropped the datagram
    assert_eq!(h.dev.poll_cq(qps[0].1, 8).unwrap().len(), 1);
    assert!(h.dev.poll_cq(qps[1].2, 8).unwrap().is_empty());
    assert!(h.dev.drop_count() > drops);
}

#[test]
fn wqe_list_membership_matches_list_type() {
    let h = harness(FabricConfig::default());
    let (qp_a, qp_b, _scq_a, _rcq_a, _scq_b, _rcq_b) = h.rc_pair();

    h.write_mem(0, &[1; 600]);
    h.dev.post_recv(qp_b, RecvWr::new(1, vec![h.sge(0x700, 1024)])).unwrap();
    h.dev.post_send(qp_a, SendWr::send(1, vec![h.sge(0, 600)])).unwrap();

    let inner = h.dev.inner();
    for _round in 0..6 {
        inner.scheduler_pass();
        {
            let qp = inner.find_qp(qp_a).unwrap();
            let qp = qp.lock();
            assert!(qp
                .requester
                .submitted
                .iter()
                .all(|w| w.list_type == crate::qp::WqeList::Submitted));
            assert!(qp
                .requester
                .sending
                .iter()
                .all(|w| w.list_type == crate::qp::WqeList::Sending));
            assert!(qp
                .requester
                .waiting
                .iter()
                .all(|w| w.list_type == crate::qp::WqeList::Waiting));
            assert!(qp.psn_accounting_holds());
        }
        for (port_index, frame) in h.drain_frames() {
            inner.handle_datagram(port_index, &frame);
        }
    }
}

/// Directed-route GetNodeInfo issued from a real device SMI QP through
/// the running switch, workers and sockets included.
#[test]
fn dr_smp_round_trip_through_switch() {
    let _logger = env_logger::builder().is_test(true).try_init();
    let config = FabricConfig::default();
    let switch = EmulatedSwitch::new(1, config.ports_per_device).unwrap();
    switch.start();

    let mem = Arc::new(ProcessMemory::new());
    let mkey = mem.register(MEM_BASE, 4096, access::ALL);
    let dev = Device::new(
        0,
        config,
        Arc::clone(&mem) as Arc<dyn MemoryRegistry>,
        Some(switch.local_addr()),
    )
    .unwrap();
    dev.start();
    dev.register_with_switch().unwrap();

    let scq = dev.create_cq(16).unwrap();
    let rcq = dev.create_cq(16).unwrap();
    let smi = dev
        .create_qp(QpInitAttr {
            qp_type: QpType::Smi,
            port_num: 1,
            send_cq: scq,
            recv_cq: rcq,
        })
        .unwrap();

    dev.post_recv(
        smi,
        RecvWr::new(
            1,
            vec![Sge {
                addr: MEM_BASE,
                length: MAD_SIZE as u32,
                lkey: mkey,
            }],
        ),
    )
    .unwrap();

    let mad = Mad::directed_route_request(method::GET, attr::NODE_INFO, 0, &[0, 1]);
    let wr = SendWr::send(2, Vec::new())
        .with_inline_data(mad.as_bytes().to_vec())
        .with_ud_dest(UdDest {
            dlid: LID_PERMISSIVE,
            dqpn: QP0,
            qkey: 0,
        });
    dev.post_send(smi, wr).unwrap();

    // wait for the reply to come back through the fabric
    let deadline = Instant::now() + Duration::from_secs(3);
    let reply_wc = loop {
        let wcs = dev.poll_cq(rcq, 1).unwrap();
        if let Some(wc) = wcs.first().copied() {
            break wc;
        }
        assert!(Instant::now() < deadline, "no SMP reply within deadline");
        std::thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(reply_wc.byte_len, MAD_SIZE as u32);

    let mut buf = vec![0u8; MAD_SIZE];
    mem.read(mkey, MEM_BASE, &mut buf).unwrap();
    let reply = Mad::parse(&buf).unwrap();
    assert_eq!(reply.method(), method::GET_RESP);
    assert!(reply.is_returning());
    assert_eq!(reply.hop_ptr(), 0);
    let info = NodeInfo::read_from(reply.data());
    assert_eq!(info.node_type, NODE_TYPE_SWITCH);
    assert_eq!(info.local_port_num, 1);

    dev.stop();
    switch.stop();
}

#[test]
fn completion_callback_fires_through_device() {
    let h = harness(FabricConfig::default());
    let (qp_a, qp_b, scq_a, _rcq_a, _scq_b, _rcq_b) = h.rc_pair();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_c = Arc::clone(&fired);
    h.dev
        .set_cq_handler(scq_a, Arc::new(move || {
            let _count = fired_c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }))
        .unwrap();
    assert!(!h.dev.req_notify_cq(scq_a, CqNotify::NextComp, false).unwrap());

    h.write_mem(0, &[7; 32]);
    h.dev.post_recv(qp_b, RecvWr::new(1, vec![h.sge(0x500, 64)])).unwrap();
    h.dev.post_send(qp_a, SendWr::send(1, vec![h.sge(0, 32)])).unwrap();
    h.pump();

    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(h.dev.poll_cq(scq_a, 8).unwrap().len(), 1);
}

#[test]
fn unsignaled_send_completes_silently() {
    let h = harness(FabricConfig::default());
    let (qp_a, qp_b, scq_a, _rcq_a, _scq_b, rcq_b) = h.rc_pair();

    h.write_mem(0, &[3; 128]);
    h.dev.post_recv(qp_b, RecvWr::new(1, vec![h.sge(0x400, 256)])).unwrap();
    let wr = SendWr::send(50, vec![h.sge(0, 128)]).with_flags(SendFlags {
        signaled: false,
        ..SendFlags::default()
    });
    h.dev.post_send(qp_a, wr).unwrap();
    h.pump();

    assert!(h.dev.poll_cq(scq_a, 8).unwrap().is_empty());
    assert_eq!(h.dev.poll_cq(rcq_b, 8).unwrap().len(), 1);
}
