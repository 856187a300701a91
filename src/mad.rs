//! Management datagrams: the 256-byte MAD frame, subnet-management
//! packet (SMP) field accessors, and the attribute encodings the switch
//! serves.

pub(crate) const MAD_SIZE: usize = 256;

pub(crate) const MAD_DATA_OFFSET: usize = 64;
pub(crate) const MAD_DATA_SIZE: usize = 64;
const INITIAL_PATH_OFFSET: usize = 128;
const RETURN_PATH_OFFSET: usize = 192;
pub(crate) const MAX_HOPS: usize = 63;

pub mod mgmt_class {
    pub const SUBN_LID_ROUTED: u8 = 0x01;
    pub const SUBN_DIRECTED_ROUTE: u8 = 0x81;
    pub const PERF_MGMT: u8 = 0x04;
}

pub mod method {
    pub const GET: u8 = 0x01;
    pub const SET: u8 = 0x02;
    pub const GET_RESP: u8 = 0x81;
    pub const TRAP: u8 = 0x05;
}

pub mod attr {
    pub const CLASS_PORT_INFO: u16 = 0x0001;
    pub const NODE_DESC: u16 = 0x0010;
    pub const NODE_INFO: u16 = 0x0011;
    pub const SWITCH_INFO: u16 = 0x0012;
    pub const GUID_INFO: u16 = 0x0014;
    pub const PORT_INFO: u16 = 0x0015;
    pub const PKEY_TABLE: u16 = 0x0016;
    pub const SL_TO_VL_TABLE: u16 = 0x0017;
    pub const VL_ARB_TABLE: u16 = 0x0018;
    pub const LINEAR_FWD_TABLE: u16 = 0x0019;
    pub const RANDOM_FWD_TABLE: u16 = 0x001A;
    pub const MCAST_FWD_TABLE: u16 = 0x001B;
    pub const PORT_COUNTERS: u16 = 0x0012;
}

pub mod status {
    /// Direction bit of a directed-route SMP: set on the return trip.
    pub const DIRECTION: u16 = 0x8000;
    pub const BUSY: u16 = 0x0001;
    pub const UNSUP_CLASS_VERSION: u16 = 0x0004;
    pub const UNSUP_METHOD: u16 = 0x0008;
    pub const UNSUP_METH_ATTR: u16 = 0x000C;
    pub const INVALID_FIELD: u16 = 0x001C;
}

pub(crate) const MGMT_BASE_VERSION: u8 = 1;
pub(crate) const MGMT_CLASS_VERSION: u8 = 1;

pub const NODE_TYPE_CA: u8 = 1;
pub const NODE_TYPE_SWITCH: u8 = 2;

/// A 256-byte management datagram, accessed through typed getters and
/// setters over the raw frame. The same layout serves LID-routed SMPs,
/// directed-route SMPs and performance-management MADs (whose payload
/// also starts at byte 64).
#[derive(Clone)]
pub struct Mad {
    bytes: [u8; MAD_SIZE],
}

impl Default for Mad {
    fn default() -> Self {
        let mut mad = Self {
            bytes: [0; MAD_SIZE],
        };
        mad.set_base_version(MGMT_BASE_VERSION);
        mad.set_class_version(MGMT_CLASS_VERSION);
        mad
    }
}

impl std::fmt::Debug for Mad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mad")
            .field("mgmt_class", &self.mgmt_class())
            .field("method", &self.method())
            .field("status", &self.status())
            .field("attr_id", &self.attr_id())
            .field("attr_mod", &self.attr_mod())
            .field("hop_ptr", &self.hop_ptr())
            .field("hop_cnt", &self.hop_cnt())
            .finish()
    }
}

macro_rules! u8_field {
    ($get:ident, $set:ident, $offset:expr) => {
        pub fn $get(&self) -> u8 {
            self.bytes[$offset]
        }

        pub fn $set(&mut self, value: u8) {
            self.bytes[$offset] = value;
        }
    };
}

macro_rules! be_field {
    ($get:ident, $set:ident, $ty:ty, $offset:expr) => {
        pub fn $get(&self) -> $ty {
            const LEN: usize = std::mem::size_of::<$ty>();
            <$ty>::from_be_bytes(
                self.bytes[$offset..$offset + LEN]
                    .try_into()
                    .unwrap_or_default(),
            )
        }

        pub fn $set(&mut self, value: $ty) {
            const LEN: usize = std::mem::size_of::<$ty>();
            self.bytes[$offset..$offset + LEN].copy_from_slice(&value.to_be_bytes());
        }
    };
}

impl Mad {
    u8_field!(base_version, set_base_version, 0);
    u8_field!(mgmt_class, set_mgmt_class, 1);
    u8_field!(class_version, set_class_version, 2);
    u8_field!(method, set_method, 3);
    be_field!(status, set_status, u16, 4);
    u8_field!(hop_ptr, set_hop_ptr, 6);
    u8_field!(hop_cnt, set_hop_cnt, 7);
    be_field!(tid, set_tid, u64, 8);
    be_field!(attr_id, set_attr_id, u16, 16);
    be_field!(attr_mod, set_attr_mod, u32, 20);
    be_field!(mkey, set_mkey, u64, 24);
    be_field!(dr_slid, set_dr_slid, u16, 32);
    be_field!(dr_dlid, set_dr_dlid, u16, 34);

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; MAD_SIZE] = buf.get(..MAD_SIZE)?.try_into().ok()?;
        Some(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[MAD_DATA_OFFSET..MAD_DATA_OFFSET + MAD_DATA_SIZE]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[MAD_DATA_OFFSET..MAD_DATA_OFFSET + MAD_DATA_SIZE]
    }

    pub fn clear_data(&mut self) {
        self.data_mut().fill(0);
    }

    /// Wider payload view used by the performance-management class.
    pub fn pma_data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[MAD_DATA_OFFSET..]
    }

    pub fn pma_data(&self) -> &[u8] {
        &self.bytes[MAD_DATA_OFFSET..]
    }

    pub fn initial_path(&self, hop: usize) -> u8 {
        self.bytes[INITIAL_PATH_OFFSET + hop.min(MAX_HOPS)]
    }

    pub fn set_initial_path(&mut self, path: &[u8]) {
        let len = path.len().min(MAD_DATA_SIZE);
        self.bytes[INITIAL_PATH_OFFSET..INITIAL_PATH_OFFSET + len].copy_from_slice(&path[..len]);
    }

    pub fn return_path(&self, hop: usize) -> u8 {
        self.bytes[RETURN_PATH_OFFSET + hop.min(MAX_HOPS)]
    }

    pub fn set_return_path_hop(&mut self, hop: usize, port: u8) {
        self.bytes[RETURN_PATH_OFFSET + hop.min(MAX_HOPS)] = port;
    }

    pub fn is_directed_route(&self) -> bool {
        self.mgmt_class() == mgmt_class::SUBN_DIRECTED_ROUTE
    }

    /// Whether a directed-route SMP is on its way back.
    pub fn is_returning(&self) -> bool {
        self.status() & status::DIRECTION != 0
    }

    pub fn or_status(&mut self, bits: u16) {
        let merged = self.status() | bits;
        self.set_status(merged);
    }

    /// Turns the MAD into a response in place.
    pub fn make_response(&mut self) {
        self.set_method(method::GET_RESP);
        if self.is_directed_route() {
            self.or_status(status::DIRECTION);
        }
    }

    /// Builds a directed-route request with the given path.
    pub fn directed_route_request(method_: u8, attr_id: u16, attr_mod: u32, path: &[u8]) -> Self {
        let mut mad = Self::default();
        mad.set_mgmt_class(mgmt_class::SUBN_DIRECTED_ROUTE);
        mad.set_method(method_);
        mad.set_attr_id(attr_id);
        mad.set_attr_mod(attr_mod);
        mad.set_dr_slid(crate::constants::LID_PERMISSIVE);
        mad.set_dr_dlid(crate::constants::LID_PERMISSIVE);
        mad.set_hop_cnt((path.len().saturating_sub(1)) as u8);
        // the source management agent emits with hop_ptr already at 1
        mad.set_hop_ptr(1);
        mad.set_initial_path(path);
        mad
    }
}

/// NodeInfo attribute content (64-byte data area).
#[derive(Debug, Clone, Copy)]
pub struct NodeInfo {
    pub node_type: u8,
    pub node_ports: u8,
    pub sys_image_guid: u64,
    pub node_guid: u64,
    pub port_guid: u64,
    pub partition_cap: u16,
    pub device_id: u16,
    pub revision: u32,
    pub local_port_num: u8,
}

impl NodeInfo {
    pub fn write_to(&self, data: &mut [u8]) {
        data[0] = MGMT_BASE_VERSION;
        data[1] = MGMT_CLASS_VERSION;
        data[2] = self.node_type;
        data[3] = self.node_ports;
        data[4..12].copy_from_slice(&self.sys_image_guid.to_be_bytes());
        data[12..20].copy_from_slice(&self.node_guid.to_be_bytes());
        data[20..28].copy_from_slice(&self.port_guid.to_be_bytes());
        data[28..30].copy_from_slice(&self.partition_cap.to_be_bytes());
        data[30..32].copy_from_slice(&self.device_id.to_be_bytes());
        data[32..36].copy_from_slice(&self.revision.to_be_bytes());
        data[36] = self.local_port_num;
        // vendor OUI stays zero
    }

    pub fn read_from(data: &[u8]) -> Self {
        Self {
            node_type: data[2],
            node_ports: data[3],
            sys_image_guid: u64::from_be_bytes(data[4..12].try_into().unwrap_or_default()),
            node_guid: u64::from_be_bytes(data[12..20].try_into().unwrap_or_default()),
            port_guid: u64::from_be_bytes(data[20..28].try_into().unwrap_or_default()),
            partition_cap: u16::from_be_bytes(data[28..30].try_into().unwrap_or_default()),
            device_id: u16::from_be_bytes(data[30..32].try_into().unwrap_or_default()),
            revision: u32::from_be_bytes(data[32..36].try_into().unwrap_or_default()),
            local_port_num: data[36],
        }
    }
}

/// The PortInfo fields this fabric models.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortInfo {
    pub gid_prefix: u64,
    pub lid: u16,
    pub sm_lid: u16,
    pub cap_mask: u32,
    pub local_port_num: u8,
    pub link_width_active: u8,
    /// Low nibble: logical port state.
    pub port_state: u8,
    pub phys_state: u8,
    pub lmc: u8,
    pub neighbor_mtu: u8,
}

impl PortInfo {
    pub fn write_to(&self, data: &mut [u8]) {
        data[8..16].copy_from_slice(&self.gid_prefix.to_be_bytes());
        data[16..18].copy_from_slice(&self.lid.to_be_bytes());
        data[18..20].copy_from_slice(&self.sm_lid.to_be_bytes());
        data[20..24].copy_from_slice(&self.cap_mask.to_be_bytes());
        data[28] = self.local_port_num;
        data[31] = self.link_width_active;
        data[32] = self.port_state & 0xF;
        data[33] = (self.phys_state & 0xF) << 4;
        data[34] = self.lmc & 0x7;
        data[36] = (self.neighbor_mtu & 0xF) << 4;
    }

    pub fn read_from(data: &[u8]) -> Self {
        Self {
            gid_prefix: u64::from_be_bytes(data[8..16].try_into().unwrap_or_default()),
            lid: u16::from_be_bytes(data[16..18].try_into().unwrap_or_default()),
            sm_lid: u16::from_be_bytes(data[18..20].try_into().unwrap_or_default()),
            cap_mask: u32::from_be_bytes(data[20..24].try_into().unwrap_or_default()),
            local_port_num: data[28],
            link_width_active: data[31],
            port_state: data[32] & 0xF,
            phys_state: data[33] >> 4,
            lmc: data[34] & 0x7,
            neighbor_mtu: data[36] >> 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mad_field_round_trip() {
        let mut mad = Mad::default();
        mad.set_mgmt_class(mgmt_class::SUBN_DIRECTED_ROUTE);
        mad.set_method(method::GET);
        mad.set_attr_id(attr::NODE_INFO);
        mad.set_attr_mod(0xAABBCCDD);
        mad.set_tid(0x0102_0304_0506_0708);
        mad.set_hop_ptr(1);
        mad.set_hop_cnt(2);

        let parsed = Mad::parse(mad.as_bytes()).unwrap();
        assert_eq!(parsed.mgmt_class(), mgmt_class::SUBN_DIRECTED_ROUTE);
        assert_eq!(parsed.attr_id(), attr::NODE_INFO);
        assert_eq!(parsed.attr_mod(), 0xAABBCCDD);
        assert_eq!(parsed.tid(), 0x0102_0304_0506_0708);
        assert_eq!(parsed.hop_ptr(), 1);
        assert_eq!(parsed.hop_cnt(), 2);
        assert!(!parsed.is_returning());
    }

    #[test]
    fn make_response_sets_direction_for_dr_only() {
        let mut dr = Mad::default();
        dr.set_mgmt_class(mgmt_class::SUBN_DIRECTED_ROUTE);
        dr.make_response();
        assert_eq!(dr.method(), method::GET_RESP);
        assert!(dr.is_returning());

        let mut lr = Mad::default();
        lr.set_mgmt_class(mgmt_class::SUBN_LID_ROUTED);
        lr.make_response();
        assert!(!lr.is_returning());
    }

    #[test]
    fn node_info_round_trip() {
        let info = NodeInfo {
            node_type: NODE_TYPE_SWITCH,
            node_ports: 4,
            sys_image_guid: 0x1111,
            node_guid: 0x2222,
            port_guid: 0x3333,
            partition_cap: 1,
            device_id: 0x0b1e,
            revision: 7,
            local_port_num: 3,
        };
        let mut mad = Mad::default();
        info.write_to(mad.data_mut());
        let read = NodeInfo::read_from(mad.data());
        assert_eq!(read.node_type, NODE_TYPE_SWITCH);
        assert_eq!(read.node_ports, 4);
        assert_eq!(read.node_guid, 0x2222);
        assert_eq!(read.local_port_num, 3);
    }

    #[test]
    fn port_info_round_trip() {
        let info = PortInfo {
            gid_prefix: 0xFE80_0000_0000_0000,
            lid: 42,
            sm_lid: 1,
            cap_mask: 0,
            local_port_num: 2,
            link_width_active: 8,
            port_state: 4,
            phys_state: 5,
            lmc: 0,
            neighbor_mtu: 1,
        };
        let mut data = [0u8; MAD_DATA_SIZE];
        info.write_to(&mut data);
        let read = PortInfo::read_from(&data);
        assert_eq!(read.lid, 42);
        assert_eq!(read.port_state, 4);
        assert_eq!(read.phys_state, 5);
        assert_eq!(read.neighbor_mtu, 1);
    }
}
