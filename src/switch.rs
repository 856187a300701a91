//! The emulated switch: a UDP relay with a subnet-management agent.
//!
//! One switch connects every port of every device in the process. It
//! owns a single socket; devices register their per-port socket
//! addresses with bare footer frames, and the switch relays unicast
//! and multicast traffic by LID while terminating management packets
//! addressed to QP0/QP1.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::{
    constants::{
        DRIVER_DEVICE_ID, DRIVER_REVISION, LID_PERMISSIVE, MCAST_LID_BASE, MULTICAST_QPN,
        PACKET_BUFFER, QP0, QP1, SWITCH_DESCRIPTION, SWITCH_NODE_GUID, SWITCH_SYS_GUID,
    },
    error::Result,
    mad::{attr, mgmt_class, method, status, Mad, NodeInfo, PortInfo, MAD_SIZE, NODE_TYPE_SWITCH},
    packet::{self, DETH_LEN, FOOTER_LEN, LRH_LEN},
    pma::{self, PerfCounters},
    types::{is_unicast_lid, is_permissive_lid},
};

const PKEY_PER_BLOCK: usize = 32;
const PKEY_DEFAULT_FULL: u16 = 0xFFFF;

const PORT_STATE_DOWN: u8 = 1;
const PORT_STATE_INIT: u8 = 2;
const PHYS_STATE_LINK_UP: u8 = 5;

const LINEAR_FDB_CAP: u16 = 768;
const RANDOM_FDB_CAP: u16 = 3072;
const MCAST_FDB_CAP: u16 = 256;

/// Port bits per multicast forwarding entry: 16 blocks of 16 ports.
const PM_BLOCKS: usize = 16;

const READER_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct SwPort {
    lid: u16,
    sm_lid: u16,
    state: u8,
    pkey_table: [u16; PKEY_PER_BLOCK],
    /// Learned socket address of the attached device port; `None` for
    /// the management port 0 and unregistered ports.
    peer: Option<SocketAddr>,
    perf: PerfCounters,
}

impl SwPort {
    fn new() -> Self {
        Self {
            lid: 0,
            sm_lid: 0,
            state: PORT_STATE_DOWN,
            pkey_table: [PKEY_DEFAULT_FULL; PKEY_PER_BLOCK],
            peer: None,
            perf: PerfCounters::default(),
        }
    }
}

struct SwitchState {
    ports: Vec<SwPort>,
    /// LID -> out port, one byte per unicast LID.
    ucast_fwd: Vec<u8>,
    /// Port bitmask per multicast LID.
    mcast_fwd: Vec<[u16; PM_BLOCKS]>,
    linear_fdb_top: u16,
    default_port: u8,
    default_mcast_primary_port: u8,
    default_mcast_not_primary_port: u8,
    life_time_value: u8,
    port_state_change: bool,
}

/// The per-process emulated switch worker.
pub struct EmulatedSwitch {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    ports_per_device: u8,
    state: Mutex<SwitchState>,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    drops: AtomicU64,
}

impl EmulatedSwitch {
    /// Creates a switch with `num_devices * ports_per_device` external
    /// ports plus the management port 0.
    pub fn new(num_devices: u8, ports_per_device: u8) -> Result<Arc<Self>> {
        let port_cnt = usize::from(num_devices) * usize::from(ports_per_device) + 1;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(READER_POLL_INTERVAL))?;
        let bound = socket.local_addr()?;
        let local_addr = SocketAddr::from(([127, 0, 0, 1], bound.port()));

        let ports = (0..port_cnt).map(|_i| SwPort::new()).collect();
        let mcast_entries = usize::from(LID_PERMISSIVE - MCAST_LID_BASE);

        info!("internal switch up, ports={}", port_cnt - 1);
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local_addr,
            ports_per_device,
            state: Mutex::new(SwitchState {
                ports,
                ucast_fwd: vec![0; usize::from(MCAST_LID_BASE)],
                mcast_fwd: vec![[0; PM_BLOCKS]; mcast_entries],
                linear_fdb_top: 0,
                default_port: 0,
                default_mcast_primary_port: 0,
                default_mcast_not_primary_port: 0,
                life_time_value: 0,
                port_state_change: false,
            }),
            stopped: AtomicBool::new(false),
            worker: Mutex::new(None),
            drops: AtomicU64::new(0),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port_cnt(&self) -> usize {
        self.state.lock().ports.len()
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Spawns the switch worker.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("softib_sw".into())
            .spawn(move || this.worker_routine())
            .expect("failed to spawn switch worker");
        *worker = Some(handle);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            let _joined = handle.join();
        }
    }

    fn worker_routine(&self) {
        let mut buf = vec![0u8; PACKET_BUFFER];
        info!("switch worker running");
        loop {
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }
            match self.socket.recv_from(&mut buf) {
                Ok((len, src)) => self.handle_datagram(src, &buf[..len]),
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => {
                    warn!("switch socket error: {err}");
                    break;
                }
            }
        }
        info!("switch worker exited");
    }

    fn count_drop(&self, reason: &str) {
        let _count = self.drops.fetch_add(1, Ordering::Relaxed);
        trace!("switch drop: {reason}");
    }

    /// Processes one received datagram: registration, relay, or
    /// management termination.
    pub(crate) fn handle_datagram(&self, src: SocketAddr, data: &[u8]) {
        // a bare footer registers the sender as a switch port
        if data.len() == FOOTER_LEN {
            if let Ok(footer) = packet::Footer::parse(data) {
                self.register_port(src, footer.dev_id, footer.port_num);
            } else {
                self.count_drop("bad registration frame");
            }
            return;
        }

        let Ok((packet_bytes, _footer)) = packet::strip_footer(data) else {
            self.count_drop("missing footer");
            return;
        };

        let in_port = {
            let mut state = self.state.lock();
            let Some(in_port) = state
                .ports
                .iter()
                .position(|port| port.peer == Some(src))
            else {
                drop(state);
                self.count_drop("datagram from unregistered address");
                return;
            };
            state.ports[in_port].perf.rcv_packets += 1;
            state.ports[in_port].perf.rcv_data += data.len() as u64;
            in_port as u8
        };

        let Ok(parsed) = packet::parse_packet(packet_bytes) else {
            self.count_drop("malformed packet");
            return;
        };
        let dlid = parsed.lrh.dlid;
        let slid = parsed.lrh.slid;
        let dest_qp = parsed.bth.dest_qp;

        if dest_qp == QP0 || dest_qp == QP1 {
            self.handle_management(in_port, data, parsed.body, dlid, slid);
            return;
        }

        let own_lid = self.state.lock().ports[0].lid;
        if !is_permissive_lid(dlid) && dlid != own_lid {
            if dest_qp == MULTICAST_QPN || !is_unicast_lid(dlid) {
                self.relay_mcast(in_port, dlid, data);
            } else {
                self.relay_ucast(dlid, data);
            }
            return;
        }

        // non-management traffic addressed to the switch itself
        self.count_drop("unexpected packet for switch lid");
    }

    fn register_port(&self, src: SocketAddr, dev_id: u8, port_num: u8) {
        if port_num == 0 {
            self.count_drop("registration for port 0");
            return;
        }
        let index =
            usize::from(dev_id) * usize::from(self.ports_per_device) + usize::from(port_num);
        let mut state = self.state.lock();
        let Some(port) = state.ports.get_mut(index) else {
            self.count_drop("registration outside port table");
            return;
        };
        port.peer = Some(src);
        if port.state < PORT_STATE_INIT {
            port.state = PORT_STATE_INIT;
        }
        debug!("registered dev {dev_id} port {port_num} at {src} as switch port {index}");
    }

    // -- relay ------------------------------------------------------------

    fn relay_ucast(&self, dlid: u16, frame: &[u8]) {
        let out = {
            let state = self.state.lock();
            state.ucast_fwd[usize::from(dlid)]
        };
        if out == 0 || usize::from(out) >= self.port_cnt() {
            self.count_drop("no unicast forwarding entry");
            return;
        }
        self.send_to_port(out, frame);
    }

    fn relay_mcast(&self, in_port: u8, dlid: u16, frame: &[u8]) {
        let offset = usize::from(dlid - MCAST_LID_BASE);
        let port_cnt = self.port_cnt();
        for out in 1..port_cnt as u8 {
            // never reflect a multicast back out its ingress port
            if out == in_port {
                continue;
            }
            let masked = {
                let state = self.state.lock();
                let blocks = &state.mcast_fwd[offset];
                blocks[usize::from(out) / 16] & (1 << (usize::from(out) % 16)) != 0
            };
            if masked {
                self.send_to_port(out, frame);
            }
        }
    }

    fn send_to_port(&self, out: u8, frame: &[u8]) {
        let peer = {
            let state = self.state.lock();
            state.ports.get(usize::from(out)).and_then(|port| port.peer)
        };
        let Some(peer) = peer else {
            self.count_drop("out port has no registered peer");
            return;
        };
        match self.socket.send_to(frame, peer) {
            Ok(sent) => {
                let mut state = self.state.lock();
                if let Some(port) = state.ports.get_mut(usize::from(out)) {
                    port.perf.xmit_packets += 1;
                    port.perf.xmit_data += sent as u64;
                }
            }
            Err(err) => warn!("switch send_to {peer} failed: {err}"),
        }
    }

    // -- management -------------------------------------------------------

    /// Terminates or forwards a management packet. `frame` is the full
    /// datagram including footer; `body` points at the DETH.
    fn handle_management(&self, in_port: u8, frame: &[u8], body: &[u8], dlid: u16, slid: u16) {
        if body.len() < DETH_LEN + MAD_SIZE {
            self.count_drop("short management datagram");
            return;
        }
        let Some(mut mad) = Mad::parse(&body[DETH_LEN..]) else {
            self.count_drop("unparseable MAD");
            return;
        };

        let out_port;
        let mut reply_dlid = dlid;
        let mut reply_slid = slid;

        match mad.mgmt_class() {
            mgmt_class::SUBN_DIRECTED_ROUTE => {
                if !is_permissive_lid(mad.dr_slid()) || !is_permissive_lid(mad.dr_dlid()) {
                    warn!(
                        "directed-route SMP with LID-routed segments: dr_slid={:#x} dr_dlid={:#x}",
                        mad.dr_slid(),
                        mad.dr_dlid()
                    );
                    return;
                }
                match self.walk_directed_route(in_port, &mut mad) {
                    DrOutcome::Forward(out) => {
                        let mut forwarded = frame.to_vec();
                        write_mad(&mut forwarded, &mad);
                        self.send_to_port(out, &forwarded);
                        return;
                    }
                    DrOutcome::Reply(out) => {
                        out_port = out;
                        reply_dlid = slid;
                        reply_slid = LID_PERMISSIVE;
                    }
                    DrOutcome::Drop => return,
                }
            }
            mgmt_class::SUBN_LID_ROUTED => {
                let own_lid = self.state.lock().ports[0].lid;
                if dlid != own_lid {
                    self.relay_ucast(dlid, frame);
                    return;
                }
                self.process_smp(in_port, &mut mad);
                out_port = in_port;
                reply_dlid = slid;
                reply_slid = dlid;
            }
            mgmt_class::PERF_MGMT => {
                let mut state = self.state.lock();
                let mut counters: Vec<PerfCounters> =
                    state.ports.iter().map(|port| port.perf).collect();
                let _ok = pma::process(&mut counters, &mut mad);
                for (port, perf) in state.ports.iter_mut().zip(counters) {
                    port.perf = perf;
                }
                drop(state);
                out_port = in_port;
                reply_dlid = slid;
                reply_slid = dlid;
            }
            other => {
                warn!("unhandled management class {other:#x}");
                return;
            }
        }

        let mut reply = frame.to_vec();
        write_mad(&mut reply, &mad);
        patch_lrh_lids(&mut reply, reply_slid, reply_dlid);
        self.send_to_port(out_port, &reply);
    }

    /// The directed-route walker. Outbound SMPs record the ingress
    /// port in the return path and hop forward; a next hop of port 0
    /// terminates at this switch's management agent. Returning SMPs
    /// hop backward along the recorded path.
    fn walk_directed_route(&self, in_port: u8, mad: &mut Mad) -> DrOutcome {
        if !mad.is_returning() {
            if mad.hop_cnt() == 0 {
                warn!("outbound directed-route SMP with zero hop count");
                return DrOutcome::Drop;
            }
            loop {
                let hop_ptr = mad.hop_ptr();
                let hop_cnt = mad.hop_cnt();
                if hop_ptr == 0 {
                    // the origin state never appears on a switch
                    warn!("outbound directed-route SMP at origin state");
                    return DrOutcome::Drop;
                } else if hop_ptr < hop_cnt {
                    mad.set_return_path_hop(usize::from(hop_ptr), in_port);
                    mad.set_hop_ptr(hop_ptr + 1);
                    let next = mad.initial_path(usize::from(hop_ptr + 1));
                    if next == 0 {
                        // the path ends at this switch; fall through to
                        // the terminal state with the same ingress
                        continue;
                    }
                    if usize::from(next) >= self.port_cnt() {
                        self.count_drop("directed route beyond port table");
                        return DrOutcome::Drop;
                    }
                    return DrOutcome::Forward(next);
                } else if hop_ptr == hop_cnt {
                    if !is_permissive_lid(mad.dr_dlid()) {
                        warn!("terminal directed-route SMP with dr_dlid {:#x}", mad.dr_dlid());
                        return DrOutcome::Drop;
                    }
                    mad.set_return_path_hop(usize::from(hop_ptr), in_port);
                    self.process_smp(in_port, mad);
                    mad.set_hop_ptr(hop_ptr - 1);
                    return DrOutcome::Reply(in_port);
                } else {
                    debug!("directed-route SMP past its hop count");
                    return DrOutcome::Drop;
                }
            }
        } else {
            let hop_ptr = mad.hop_ptr();
            if hop_ptr == 0 {
                warn!("returning directed-route SMP at origin state");
                return DrOutcome::Drop;
            }
            mad.set_hop_ptr(hop_ptr - 1);
            let out = mad.return_path(usize::from(hop_ptr - 1));
            if out == 0 || usize::from(out) >= self.port_cnt() {
                self.count_drop("returning directed route beyond port table");
                return DrOutcome::Drop;
            }
            DrOutcome::Forward(out)
        }
    }

    /// Dispatches an SMP to its attribute handler. SET runs the
    /// mutation and then reports like GET unless it raised an error
    /// status.
    fn process_smp(&self, in_port: u8, mad: &mut Mad) {
        match mad.method() {
            method::GET => self.smp_get(in_port, mad),
            method::SET => {
                self.smp_set(mad);
                if mad.status() & !status::DIRECTION == 0 {
                    self.smp_get(in_port, mad);
                }
            }
            other => {
                debug!("unsupported SMP method {other:#x}");
                mad.or_status(status::UNSUP_METHOD);
            }
        }
        mad.make_response();
    }

    fn smp_get(&self, in_port: u8, mad: &mut Mad) {
        mad.clear_data();
        let state = self.state.lock();
        match mad.attr_id() {
            attr::NODE_DESC => {
                if mad.attr_mod() != 0 {
                    mad.or_status(status::INVALID_FIELD);
                }
                let desc = SWITCH_DESCRIPTION.as_bytes();
                mad.data_mut()[..desc.len()].copy_from_slice(desc);
            }
            attr::NODE_INFO => {
                let info = NodeInfo {
                    node_type: NODE_TYPE_SWITCH,
                    node_ports: (state.ports.len() - 1) as u8,
                    sys_image_guid: SWITCH_SYS_GUID,
                    node_guid: SWITCH_NODE_GUID,
                    port_guid: SWITCH_NODE_GUID,
                    partition_cap: 1,
                    device_id: DRIVER_DEVICE_ID,
                    revision: DRIVER_REVISION,
                    local_port_num: in_port,
                };
                info.write_to(mad.data_mut());
            }
            attr::SWITCH_INFO => {
                let data = mad.data_mut();
                data[0..2].copy_from_slice(&LINEAR_FDB_CAP.to_be_bytes());
                data[2..4].copy_from_slice(&RANDOM_FDB_CAP.to_be_bytes());
                data[4..6].copy_from_slice(&MCAST_FDB_CAP.to_be_bytes());
                data[6..8].copy_from_slice(&state.linear_fdb_top.to_be_bytes());
                data[8] = state.default_port;
                data[9] = state.default_mcast_primary_port;
                data[10] = state.default_mcast_not_primary_port;
                data[11] = state.life_time_value << 3 | u8::from(state.port_state_change) << 2;
                data[12..14].copy_from_slice(&1u16.to_be_bytes()); // lids per port
                data[14..16].copy_from_slice(&0u16.to_be_bytes()); // partition enforcement
            }
            attr::PORT_INFO => {
                let index = mad.attr_mod() as usize;
                let Some(port) = state.ports.get(index) else {
                    mad.or_status(status::INVALID_FIELD);
                    return;
                };
                let info = PortInfo {
                    gid_prefix: 0xFE80_0000_0000_0000,
                    lid: port.lid,
                    sm_lid: port.sm_lid,
                    cap_mask: 0,
                    local_port_num: in_port,
                    link_width_active: 8,
                    port_state: port.state,
                    phys_state: PHYS_STATE_LINK_UP,
                    lmc: 0,
                    neighbor_mtu: 1,
                };
                info.write_to(mad.data_mut());
            }
            attr::PKEY_TABLE => {
                let attr_mod = mad.attr_mod();
                let block = attr_mod & 0xFFFF;
                let index = (attr_mod >> 16) as usize & 0xFFFF;
                if block != 0 || index >= state.ports.len() {
                    mad.or_status(status::INVALID_FIELD);
                    return;
                }
                let table = state.ports[index].pkey_table;
                let data = mad.data_mut();
                for (i, pkey) in table.iter().enumerate() {
                    data[i * 2..i * 2 + 2].copy_from_slice(&pkey.to_be_bytes());
                }
            }
            attr::LINEAR_FWD_TABLE => {
                let attr_mod = mad.attr_mod();
                if attr_mod >= u32::from(LINEAR_FDB_CAP) {
                    mad.or_status(status::INVALID_FIELD);
                    return;
                }
                let data = mad.data_mut();
                for i in 0..64u32 {
                    let lid = attr_mod * 64 + i;
                    if lid <= u32::from(state.linear_fdb_top) {
                        data[i as usize] = state.ucast_fwd[lid as usize];
                    }
                }
            }
            attr::MCAST_FWD_TABLE => {
                let attr_mod = mad.attr_mod();
                let offset = (attr_mod & 0xFF) as usize * 32;
                let block = (attr_mod >> 28) as usize;
                if block >= PM_BLOCKS || offset + 32 > state.mcast_fwd.len() {
                    mad.or_status(status::INVALID_FIELD);
                    return;
                }
                let data = mad.data_mut();
                for i in 0..32 {
                    let mask = state.mcast_fwd[offset + i][block];
                    data[i * 2..i * 2 + 2].copy_from_slice(&mask.to_be_bytes());
                }
            }
            // interface defined, semantics deferred to a subnet
            // manager that needs them
            attr::GUID_INFO
            | attr::SL_TO_VL_TABLE
            | attr::VL_ARB_TABLE
            | attr::RANDOM_FWD_TABLE => {
                mad.or_status(status::UNSUP_METH_ATTR);
            }
            other => {
                debug!("unsupported SMP attribute {other:#x}");
                mad.or_status(status::UNSUP_METH_ATTR);
            }
        }
    }

    fn smp_set(&self, mad: &mut Mad) {
        let mut state = self.state.lock();
        match mad.attr_id() {
            attr::SWITCH_INFO => {
                let data = mad.data();
                state.linear_fdb_top =
                    u16::from_be_bytes(data[6..8].try_into().unwrap_or_default());
                state.default_port = data[8];
                state.default_mcast_primary_port = data[9];
                state.default_mcast_not_primary_port = data[10];
                state.life_time_value = (data[11] >> 3) & 0x1F;
                if data[11] >> 2 & 1 == 1 {
                    state.port_state_change = false;
                }
            }
            attr::PORT_INFO => {
                let index = mad.attr_mod() as usize;
                let info = PortInfo::read_from(mad.data());
                if index >= state.ports.len() {
                    mad.or_status(status::INVALID_FIELD);
                    return;
                }
                let mut state_changed = false;
                {
                    let port = &mut state.ports[index];
                    port.lid = info.lid;
                    port.sm_lid = info.sm_lid;
                    if port.state < PORT_STATE_INIT {
                        port.state = PORT_STATE_INIT;
                        state_changed = true;
                    }
                    if info.port_state != 0 {
                        port.state = info.port_state;
                    }
                }
                if state_changed {
                    state.port_state_change = true;
                }
            }
            attr::PKEY_TABLE => {
                let attr_mod = mad.attr_mod();
                let block = attr_mod & 0xFFFF;
                let index = (attr_mod >> 16) as usize & 0xFFFF;
                if block != 0 || index >= state.ports.len() {
                    mad.or_status(status::INVALID_FIELD);
                    return;
                }
                let data = mad.data();
                for i in 0..PKEY_PER_BLOCK {
                    state.ports[index].pkey_table[i] =
                        u16::from_be_bytes(data[i * 2..i * 2 + 2].try_into().unwrap_or_default());
                }
            }
            attr::LINEAR_FWD_TABLE => {
                let attr_mod = mad.attr_mod();
                if attr_mod >= u32::from(LINEAR_FDB_CAP) {
                    mad.or_status(status::INVALID_FIELD);
                    return;
                }
                let data = mad.data();
                for i in 0..64u32 {
                    let lid = (attr_mod * 64 + i) as usize;
                    if lid < state.ucast_fwd.len() {
                        state.ucast_fwd[lid] = data[i as usize];
                    }
                }
            }
            attr::RANDOM_FWD_TABLE => {
                let attr_mod = mad.attr_mod();
                if attr_mod >= u32::from(RANDOM_FDB_CAP) {
                    mad.or_status(status::INVALID_FIELD);
                    return;
                }
                let data = mad.data();
                for i in 0..16 {
                    let mut value =
                        u32::from_be_bytes(data[i * 4..i * 4 + 4].try_into().unwrap_or_default());
                    let dlid = (value >> 16) as u16;
                    // 0xFF as port number is an invalid port
                    if value & 0xFF == 0xFF {
                        value &= !0x8000;
                    }
                    let out = if value & 0x8000 != 0 {
                        (value & 0xFF) as u8
                    } else {
                        state.default_port
                    };
                    if usize::from(dlid) < state.ucast_fwd.len() {
                        state.ucast_fwd[usize::from(dlid)] = out;
                    }
                }
            }
            attr::MCAST_FWD_TABLE => {
                let attr_mod = mad.attr_mod();
                let offset = (attr_mod & 0xFF) as usize * 32;
                let block = (attr_mod >> 28) as usize;
                if block >= PM_BLOCKS || offset + 32 > state.mcast_fwd.len() {
                    mad.or_status(status::INVALID_FIELD);
                    return;
                }
                let data = mad.data();
                for i in 0..32 {
                    state.mcast_fwd[offset + i][block] =
                        u16::from_be_bytes(data[i * 2..i * 2 + 2].try_into().unwrap_or_default());
                }
            }
            attr::GUID_INFO | attr::SL_TO_VL_TABLE | attr::VL_ARB_TABLE => {
                mad.or_status(status::UNSUP_METH_ATTR);
            }
            other => {
                debug!("unsupported SMP set attribute {other:#x}");
                mad.or_status(status::UNSUP_METH_ATTR);
            }
        }
    }
}

impl Drop for EmulatedSwitch {
    fn drop(&mut self) {
        self.stop();
    }
}

enum DrOutcome {
    /// Relay out of this port.
    Forward(u8),
    /// Terminal: reply out of this port.
    Reply(u8),
    Drop,
}

/// Copies the (possibly mutated) MAD back over its position in the raw
/// frame. Management frames never carry a GRH.
fn write_mad(frame: &mut [u8], mad: &Mad) {
    let offset = LRH_LEN + packet::BTH_LEN + DETH_LEN;
    frame[offset..offset + MAD_SIZE].copy_from_slice(mad.as_bytes());
}

fn patch_lrh_lids(frame: &mut [u8], slid: u16, dlid: u16) {
    frame[2..4].copy_from_slice(&dlid.to_be_bytes());
    frame[6..8].copy_from_slice(&slid.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_datagram, Bth, Footer, Opcode};
    use crate::types::Psn;

    /// A raw UDP socket standing in for a device port.
    struct FakePort {
        socket: UdpSocket,
        addr: SocketAddr,
    }

    impl FakePort {
        fn new() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            let addr = SocketAddr::from(([127, 0, 0, 1], socket.local_addr().unwrap().port()));
            Self { socket, addr }
        }

        fn register(&self, sw: &EmulatedSwitch, dev_id: u8, port_num: u8) {
            let frame = Footer { dev_id, port_num }.registration_frame();
            sw.handle_datagram(self.addr, &frame);
        }

        fn recv(&self) -> Vec<u8> {
            let mut buf = vec![0u8; PACKET_BUFFER];
            let (len, _src) = self.socket.recv_from(&mut buf).unwrap();
            buf.truncate(len);
            buf
        }
    }

    fn mad_frame(slid: u16, dlid: u16, dev_id: u8, port_num: u8, mad: &Mad) -> Vec<u8> {
        let bth = Bth {
            opcode: Opcode::UdSendOnly as u8,
            pkey: 0xFFFF,
            dest_qp: QP0,
            psn: Psn::new(0),
            ..Bth::default()
        };
        let mut payload = Vec::with_capacity(DETH_LEN + MAD_SIZE);
        crate::packet::Deth {
            qkey: 0,
            src_qp: QP0,
        }
        .emit(&mut payload);
        payload.extend_from_slice(mad.as_bytes());
        build_datagram(slid, dlid, 0, bth, &[], &payload, Footer { dev_id, port_num })
    }

    fn parse_reply_mad(frame: &[u8]) -> Mad {
        let (packet_bytes, _footer) = packet::strip_footer(frame).unwrap();
        let parsed = packet::parse_packet(packet_bytes).unwrap();
        Mad::parse(&parsed.body[DETH_LEN..]).unwrap()
    }

    #[test]
    fn registration_learns_port_mapping() {
        let sw = EmulatedSwitch::new(2, 2).unwrap();
        assert_eq!(sw.port_cnt(), 5);
        let port = FakePort::new();
        port.register(&sw, 1, 2);
        let state = sw.state.lock();
        assert_eq!(state.ports[4].peer, Some(port.addr));
        assert_eq!(state.ports[4].state, PORT_STATE_INIT);
    }

    #[test]
    fn directed_route_get_node_info() {
        let sw = EmulatedSwitch::new(1, 2).unwrap();
        let port = FakePort::new();
        port.register(&sw, 0, 1);

        // host -> switch and back along the path [0, 1, 0]
        let mad = Mad::directed_route_request(method::GET, attr::NODE_INFO, 0, &[0, 1, 0]);
        assert_eq!(mad.hop_ptr(), 1);
        assert_eq!(mad.hop_cnt(), 2);
        let frame = mad_frame(LID_PERMISSIVE, LID_PERMISSIVE, 0, 1, &mad);
        sw.handle_datagram(port.addr, &frame);

        let reply = parse_reply_mad(&port.recv());
        assert_eq!(reply.method(), method::GET_RESP);
        assert!(reply.is_returning());
        // terminal processing decremented the hop pointer back to 1;
        // the host SM agent performs the final 1 -> 0 step
        assert_eq!(reply.hop_ptr(), 1);
        assert_eq!(reply.return_path(1), 1);
        assert_eq!(reply.return_path(2), 1);

        let info = NodeInfo::read_from(reply.data());
        assert_eq!(info.node_type, NODE_TYPE_SWITCH);
        assert_eq!(info.node_ports, 2);
        // the reply names the switch port the request came in on
        assert_eq!(info.local_port_num, 1);
    }

    #[test]
    fn set_behaves_as_get_on_success() {
        let sw = EmulatedSwitch::new(1, 1).unwrap();
        let port = FakePort::new();
        port.register(&sw, 0, 1);

        let mut mad = Mad::directed_route_request(method::SET, attr::SWITCH_INFO, 0, &[0, 1]);
        mad.data_mut()[6..8].copy_from_slice(&42u16.to_be_bytes()); // linear_fdb_top
        let frame = mad_frame(LID_PERMISSIVE, LID_PERMISSIVE, 0, 1, &mad);
        sw.handle_datagram(port.addr, &frame);

        let reply = parse_reply_mad(&port.recv());
        assert_eq!(reply.status() & !status::DIRECTION, 0);
        // the reply carries the freshly written value
        assert_eq!(
            u16::from_be_bytes(reply.data()[6..8].try_into().unwrap()),
            42
        );
        assert_eq!(sw.state.lock().linear_fdb_top, 42);
    }

    #[test]
    fn unsupported_attribute_replies_unsup_meth_attr() {
        let sw = EmulatedSwitch::new(1, 1).unwrap();
        let port = FakePort::new();
        port.register(&sw, 0, 1);

        let mad = Mad::directed_route_request(method::GET, attr::SL_TO_VL_TABLE, 0, &[0, 1]);
        let frame = mad_frame(LID_PERMISSIVE, LID_PERMISSIVE, 0, 1, &mad);
        sw.handle_datagram(port.addr, &frame);

        let reply = parse_reply_mad(&port.recv());
        assert_eq!(reply.status() & status::UNSUP_METH_ATTR, status::UNSUP_METH_ATTR);
    }

    #[test]
    fn unicast_relay_follows_linear_table() {
        let sw = EmulatedSwitch::new(1, 2).unwrap();
        let port_a = FakePort::new();
        let port_b = FakePort::new();
        port_a.register(&sw, 0, 1);
        port_b.register(&sw, 0, 2);

        // route LID 5 out of switch port 2
        sw.state.lock().ucast_fwd[5] = 2;

        let bth = Bth {
            opcode: Opcode::SendOnly as u8,
            pkey: 0xFFFF,
            dest_qp: 0x77,
            psn: Psn::new(3),
            ..Bth::default()
        };
        let frame = build_datagram(4, 5, 0, bth, &[], b"ping", Footer { dev_id: 0, port_num: 1 });
        sw.handle_datagram(port_a.addr, &frame);

        let relayed = port_b.recv();
        assert_eq!(relayed, frame);
    }

    #[test]
    fn unicast_without_route_is_dropped() {
        let sw = EmulatedSwitch::new(1, 1).unwrap();
        let port = FakePort::new();
        port.register(&sw, 0, 1);

        let bth = Bth {
            opcode: Opcode::SendOnly as u8,
            pkey: 0xFFFF,
            dest_qp: 0x77,
            psn: Psn::new(0),
            ..Bth::default()
        };
        let frame = build_datagram(4, 9, 0, bth, &[], b"ping", Footer { dev_id: 0, port_num: 1 });
        let drops = sw.drop_count();
        sw.handle_datagram(port.addr, &frame);
        assert_eq!(sw.drop_count(), drops + 1);
    }

    #[test]
    fn multicast_relay_excludes_ingress() {
        let sw = EmulatedSwitch::new(3, 1).unwrap();
        let ports: Vec<FakePort> = (0..3).map(|_i| FakePort::new()).collect();
        for (dev, port) in ports.iter().enumerate() {
            port.register(&sw, dev as u8, 1);
        }

        let mlid = MCAST_LID_BASE + 7;
        {
            let mut state = sw.state.lock();
            // all three external ports are group members
            state.mcast_fwd[7][0] = 0b1110;
        }

        let bth = Bth {
            opcode: Opcode::UdSendOnly as u8,
            pkey: 0xFFFF,
            dest_qp: MULTICAST_QPN,
            psn: Psn::new(0),
            ..Bth::default()
        };
        let mut payload = Vec::new();
        crate::packet::Deth {
            qkey: 7,
            src_qp: 0x50,
        }
        .emit(&mut payload);
        let frame = build_datagram(2, mlid, 0, bth, &[], &payload, Footer { dev_id: 0, port_num: 1 });
        sw.handle_datagram(ports[0].addr, &frame);

        assert_eq!(ports[1].recv(), frame);
        assert_eq!(ports[2].recv(), frame);
        let mut buf = [0u8; 64];
        assert!(ports[0].socket.recv_from(&mut buf).is_err());
    }

    #[test]
    fn pma_counts_relayed_traffic() {
        let sw = EmulatedSwitch::new(1, 2).unwrap();
        let port_a = FakePort::new();
        let port_b = FakePort::new();
        port_a.register(&sw, 0, 1);
        port_b.register(&sw, 0, 2);
        sw.state.lock().ucast_fwd[5] = 2;

        let bth = Bth {
            opcode: Opcode::SendOnly as u8,
            pkey: 0xFFFF,
            dest_qp: 0x77,
            psn: Psn::new(0),
            ..Bth::default()
        };
        let frame = build_datagram(4, 5, 0, bth, &[], b"ping", Footer { dev_id: 0, port_num: 1 });
        sw.handle_datagram(port_a.addr, &frame);
        let _relayed = port_b.recv();

        let mut mad = Mad::default();
        mad.set_mgmt_class(mgmt_class::PERF_MGMT);
        mad.set_method(method::GET);
        mad.set_attr_id(attr::PORT_COUNTERS);
        mad.pma_data_mut()[1] = 1; // port select: ingress port
        let frame = mad_frame(4, 0, 0, 1, &mad);
        sw.handle_datagram(port_a.addr, &frame);

        let reply = parse_reply_mad(&port_a.recv());
        let rcv_packets =
            u32::from_be_bytes(reply.pma_data()[36..40].try_into().unwrap());
        assert!(rcv_packets >= 1);
    }
}
