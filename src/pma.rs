//! Performance-management class handler.
//!
//! Serves `PortCounters` over a node's per-port counters; the emulated
//! switch presents itself as a node whose port array includes the
//! management port 0.

use crate::mad::{attr, method, status, Mad};

/// Per-port traffic counters, updated on every relay or socket
/// operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfCounters {
    pub rcv_packets: u64,
    pub rcv_data: u64,
    pub xmit_packets: u64,
    pub xmit_data: u64,
}

const PORT_SELECT: usize = 1;
const COUNTER_SELECT: usize = 2;
const XMIT_DATA: usize = 24;
const RCV_DATA: usize = 28;
const XMIT_PACKETS: usize = 32;
const RCV_PACKETS: usize = 36;

const SEL_XMIT_DATA: u16 = 0x1000;
const SEL_RCV_DATA: u16 = 0x2000;
const SEL_XMIT_PACKETS: u16 = 0x4000;
const SEL_RCV_PACKETS: u16 = 0x8000;

/// Handles one performance-management MAD in place. Returns `false`
/// when the request was rejected.
pub(crate) fn process(counters: &mut [PerfCounters], mad: &mut Mad) -> bool {
    let ok = match (mad.method(), mad.attr_id()) {
        (method::GET, attr::CLASS_PORT_INFO) => {
            mad.clear_data();
            true
        }
        (method::GET, attr::PORT_COUNTERS) => get_port_counters(counters, mad),
        (method::SET, attr::PORT_COUNTERS) => set_port_counters(counters, mad),
        (method::GET | method::SET, _) => {
            mad.or_status(status::UNSUP_METH_ATTR);
            false
        }
        _ => {
            mad.or_status(status::UNSUP_METHOD);
            false
        }
    };
    mad.make_response();
    ok
}

fn selected_port<'a>(
    counters: &'a mut [PerfCounters],
    mad: &mut Mad,
) -> Option<&'a mut PerfCounters> {
    let port = mad.pma_data()[PORT_SELECT] as usize;
    if port >= counters.len() {
        mad.or_status(status::INVALID_FIELD);
        return None;
    }
    Some(&mut counters[port])
}

fn get_port_counters(counters: &mut [PerfCounters], mad: &mut Mad) -> bool {
    let Some(perf) = selected_port(counters, mad) else {
        return false;
    };
    let perf = *perf;
    let data = mad.pma_data_mut();
    write_u32(data, XMIT_DATA, perf.xmit_data);
    write_u32(data, RCV_DATA, perf.rcv_data);
    write_u32(data, XMIT_PACKETS, perf.xmit_packets);
    write_u32(data, RCV_PACKETS, perf.rcv_packets);
    true
}

fn set_port_counters(counters: &mut [PerfCounters], mad: &mut Mad) -> bool {
    let select = u16::from_be_bytes(
        mad.pma_data()[COUNTER_SELECT..COUNTER_SELECT + 2]
            .try_into()
            .unwrap_or_default(),
    );
    let supplied = |data: &[u8], offset: usize| {
        u64::from(u32::from_be_bytes(
            data[offset..offset + 4].try_into().unwrap_or_default(),
        ))
    };
    let xmit_data = supplied(mad.pma_data(), XMIT_DATA);
    let rcv_data = supplied(mad.pma_data(), RCV_DATA);
    let xmit_packets = supplied(mad.pma_data(), XMIT_PACKETS);
    let rcv_packets = supplied(mad.pma_data(), RCV_PACKETS);

    let Some(perf) = selected_port(counters, mad) else {
        return false;
    };
    if select & SEL_XMIT_DATA != 0 {
        perf.xmit_data = xmit_data;
    }
    if select & SEL_RCV_DATA != 0 {
        perf.rcv_data = rcv_data;
    }
    if select & SEL_XMIT_PACKETS != 0 {
        perf.xmit_packets = xmit_packets;
    }
    if select & SEL_RCV_PACKETS != 0 {
        perf.rcv_packets = rcv_packets;
    }
    get_port_counters(counters, mad)
}

fn write_u32(data: &mut [u8], offset: usize, value: u64) {
    let clamped = u32::try_from(value).unwrap_or(u32::MAX);
    data[offset..offset + 4].copy_from_slice(&clamped.to_be_bytes());
}
