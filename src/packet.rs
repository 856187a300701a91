//! Wire codec: LRH / GRH / BTH and the transport extension headers,
//! plus the trailing fabric footer every datagram carries.
//!
//! Parsing yields borrowed payload slices; emission is pure and the
//! inverse of parsing.

use bilge::prelude::*;
use thiserror::Error;

use crate::types::Psn;

pub(crate) const LRH_LEN: usize = 8;
pub(crate) const GRH_LEN: usize = 40;
pub(crate) const BTH_LEN: usize = 12;
pub(crate) const DETH_LEN: usize = 8;
pub(crate) const RETH_LEN: usize = 16;
pub(crate) const AETH_LEN: usize = 4;
pub(crate) const ATOMIC_ETH_LEN: usize = 28;
pub(crate) const ATOMIC_ACK_ETH_LEN: usize = 8;
pub(crate) const IMM_DT_LEN: usize = 4;
pub(crate) const ICRC_LEN: usize = 4;
pub(crate) const FOOTER_LEN: usize = 8;

const FOOTER_MAGIC: u16 = 0x51B0;

/// Link-next-header values in the LRH.
const LNH_IBA_LOCAL: u8 = 0x2;
const LNH_IBA_GLOBAL: u8 = 0x3;

#[non_exhaustive]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("malformed packet")]
pub(crate) struct Malformed;

/// RC and UD transport opcodes (IBA encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Opcode {
    SendFirst = 0x00,
    SendMiddle = 0x01,
    SendLast = 0x02,
    SendLastImm = 0x03,
    SendOnly = 0x04,
    SendOnlyImm = 0x05,
    WriteFirst = 0x06,
    WriteMiddle = 0x07,
    WriteLast = 0x08,
    WriteLastImm = 0x09,
    WriteOnly = 0x0A,
    WriteOnlyImm = 0x0B,
    ReadRequest = 0x0C,
    ReadResponseFirst = 0x0D,
    ReadResponseMiddle = 0x0E,
    ReadResponseLast = 0x0F,
    ReadResponseOnly = 0x10,
    Acknowledge = 0x11,
    AtomicAcknowledge = 0x12,
    CompareSwap = 0x13,
    FetchAdd = 0x14,
    UdSendOnly = 0x64,
    UdSendOnlyImm = 0x65,
}

impl Opcode {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Opcode::SendFirst,
            0x01 => Opcode::SendMiddle,
            0x02 => Opcode::SendLast,
            0x03 => Opcode::SendLastImm,
            0x04 => Opcode::SendOnly,
            0x05 => Opcode::SendOnlyImm,
            0x06 => Opcode::WriteFirst,
            0x07 => Opcode::WriteMiddle,
            0x08 => Opcode::WriteLast,
            0x09 => Opcode::WriteLastImm,
            0x0A => Opcode::WriteOnly,
            0x0B => Opcode::WriteOnlyImm,
            0x0C => Opcode::ReadRequest,
            0x0D => Opcode::ReadResponseFirst,
            0x0E => Opcode::ReadResponseMiddle,
            0x0F => Opcode::ReadResponseLast,
            0x10 => Opcode::ReadResponseOnly,
            0x11 => Opcode::Acknowledge,
            0x12 => Opcode::AtomicAcknowledge,
            0x13 => Opcode::CompareSwap,
            0x14 => Opcode::FetchAdd,
            0x64 => Opcode::UdSendOnly,
            0x65 => Opcode::UdSendOnlyImm,
            _ => return None,
        })
    }

    pub(crate) fn is_rc_request(self) -> bool {
        (self as u8) <= 0x0C || matches!(self, Opcode::CompareSwap | Opcode::FetchAdd)
    }

    pub(crate) fn has_immediate(self) -> bool {
        matches!(
            self,
            Opcode::SendLastImm
                | Opcode::SendOnlyImm
                | Opcode::WriteLastImm
                | Opcode::WriteOnlyImm
                | Opcode::UdSendOnlyImm
        )
    }

    /// First packet of a message (or the only one).
    pub(crate) fn starts_message(self) -> bool {
        matches!(
            self,
            Opcode::SendFirst
                | Opcode::SendOnly
                | Opcode::SendOnlyImm
                | Opcode::WriteFirst
                | Opcode::WriteOnly
                | Opcode::WriteOnlyImm
                | Opcode::ReadRequest
                | Opcode::CompareSwap
                | Opcode::FetchAdd
                | Opcode::UdSendOnly
                | Opcode::UdSendOnlyImm
        )
    }

    /// Last packet of a message (or the only one).
    pub(crate) fn ends_message(self) -> bool {
        !matches!(
            self,
            Opcode::SendFirst | Opcode::SendMiddle | Opcode::WriteFirst | Opcode::WriteMiddle
        )
    }
}

// The three 32-bit words of the BTH, least-significant field first.

#[bitsize(32)]
#[derive(Default, Clone, Copy, DebugBits, FromBits)]
struct BthWord0 {
    pkey: u16,
    tver: u4,
    pad_cnt: u2,
    migreq: bool,
    se: bool,
    opcode: u8,
}

#[bitsize(32)]
#[derive(Default, Clone, Copy, DebugBits, FromBits)]
struct BthWord1 {
    dest_qp: u24,
    resv: u8,
}

#[bitsize(32)]
#[derive(Default, Clone, Copy, DebugBits, FromBits)]
struct BthWord2 {
    psn: u24,
    resv: u7,
    ack_req: bool,
}

#[bitsize(32)]
#[derive(Default, Clone, Copy, DebugBits, FromBits)]
struct AethWord {
    msn: u24,
    syndrome: u8,
}

#[bitsize(32)]
#[derive(Default, Clone, Copy, DebugBits, FromBits)]
struct DethWord1 {
    src_qp: u24,
    resv: u8,
}

/// Local route header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lrh {
    pub(crate) vl: u8,
    pub(crate) lver: u8,
    pub(crate) sl: u8,
    pub(crate) lnh: u8,
    pub(crate) dlid: u16,
    /// Datagram length in 4-byte words, LRH through ICRC.
    pub(crate) pktlen: u16,
    pub(crate) slid: u16,
}

impl Lrh {
    fn parse(buf: &[u8]) -> Result<Self, Malformed> {
        let bytes: &[u8; LRH_LEN] = buf.get(..LRH_LEN).and_then(|b| b.try_into().ok()).ok_or(Malformed)?;
        Ok(Self {
            vl: bytes[0] >> 4,
            lver: bytes[0] & 0xF,
            sl: bytes[1] >> 4,
            lnh: bytes[1] & 0x3,
            dlid: u16::from_be_bytes([bytes[2], bytes[3]]),
            pktlen: u16::from_be_bytes([bytes[4], bytes[5]]) & 0x7FF,
            slid: u16::from_be_bytes([bytes[6], bytes[7]]),
        })
    }

    fn emit(&self, out: &mut Vec<u8>) {
        out.push(self.vl << 4 | (self.lver & 0xF));
        out.push(self.sl << 4 | (self.lnh & 0x3));
        out.extend_from_slice(&self.dlid.to_be_bytes());
        out.extend_from_slice(&(self.pktlen & 0x7FF).to_be_bytes());
        out.extend_from_slice(&self.slid.to_be_bytes());
    }
}

/// Global route header, kept opaque; only present when `lnh` selects
/// IBA-global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Grh {
    pub(crate) bytes: [u8; GRH_LEN],
}

/// Base transport header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Bth {
    pub(crate) opcode: u8,
    pub(crate) se: bool,
    pub(crate) migreq: bool,
    pub(crate) pad_cnt: u8,
    pub(crate) tver: u8,
    pub(crate) pkey: u16,
    pub(crate) dest_qp: u32,
    pub(crate) ack_req: bool,
    pub(crate) psn: Psn,
}

impl Bth {
    fn parse(buf: &[u8]) -> Result<Self, Malformed> {
        if buf.len() < BTH_LEN {
            return Err(Malformed);
        }
        let w0 = BthWord0::from(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
        let w1 = BthWord1::from(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]));
        let w2 = BthWord2::from(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]));
        Ok(Self {
            opcode: w0.opcode(),
            se: w0.se(),
            migreq: w0.migreq(),
            pad_cnt: u8::from(w0.pad_cnt()),
            tver: u8::from(w0.tver()),
            pkey: w0.pkey(),
            dest_qp: u32::from(w1.dest_qp()),
            ack_req: w2.ack_req(),
            psn: Psn::new(u32::from(w2.psn())),
        })
    }

    fn emit(&self, out: &mut Vec<u8>) {
        let mut w0 = BthWord0::default();
        w0.set_pkey(self.pkey);
        w0.set_tver(u4::from_u8(self.tver & 0xF));
        w0.set_pad_cnt(u2::from_u8(self.pad_cnt & 0x3));
        w0.set_migreq(self.migreq);
        w0.set_se(self.se);
        w0.set_opcode(self.opcode);
        let mut w1 = BthWord1::default();
        w1.set_dest_qp(u24::from_u32(self.dest_qp & 0x00FF_FFFF));
        let mut w2 = BthWord2::default();
        w2.set_psn(u24::from_u32(self.psn.into_inner()));
        w2.set_ack_req(self.ack_req);
        out.extend_from_slice(&w0.value.to_be_bytes());
        out.extend_from_slice(&w1.value.to_be_bytes());
        out.extend_from_slice(&w2.value.to_be_bytes());
    }
}

/// Datagram extended transport header (UD).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deth {
    pub(crate) qkey: u32,
    pub(crate) src_qp: u32,
}

impl Deth {
    pub(crate) fn parse(buf: &[u8]) -> Result<(Self, &[u8]), Malformed> {
        if buf.len() < DETH_LEN {
            return Err(Malformed);
        }
        let qkey = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let w1 = DethWord1::from(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]));
        Ok((
            Self {
                qkey,
                src_qp: u32::from(w1.src_qp()),
            },
            &buf[DETH_LEN..],
        ))
    }

    pub(crate) fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.qkey.to_be_bytes());
        let mut w1 = DethWord1::default();
        w1.set_src_qp(u24::from_u32(self.src_qp & 0x00FF_FFFF));
        out.extend_from_slice(&w1.value.to_be_bytes());
    }
}

/// RDMA extended transport header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reth {
    pub(crate) vaddr: u64,
    pub(crate) rkey: u32,
    pub(crate) dlen: u32,
}

impl Reth {
    pub(crate) fn parse(buf: &[u8]) -> Result<(Self, &[u8]), Malformed> {
        if buf.len() < RETH_LEN {
            return Err(Malformed);
        }
        Ok((
            Self {
                vaddr: u64::from_be_bytes(buf[0..8].try_into().unwrap_or_default()),
                rkey: u32::from_be_bytes(buf[8..12].try_into().unwrap_or_default()),
                dlen: u32::from_be_bytes(buf[12..16].try_into().unwrap_or_default()),
            },
            &buf[RETH_LEN..],
        ))
    }

    pub(crate) fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.vaddr.to_be_bytes());
        out.extend_from_slice(&self.rkey.to_be_bytes());
        out.extend_from_slice(&self.dlen.to_be_bytes());
    }
}

/// Ack extended transport header syndrome classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AethKind {
    Ack,
    RnrNak { timer: u8 },
    Nak(NakCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NakCode {
    PsnSeqError,
    InvalidRequest,
    RemoteAccess,
    RemoteOp,
    InvalidRdRequest,
}

impl NakCode {
    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => NakCode::PsnSeqError,
            1 => NakCode::InvalidRequest,
            2 => NakCode::RemoteAccess,
            3 => NakCode::RemoteOp,
            4 => NakCode::InvalidRdRequest,
            _ => return None,
        })
    }

    fn bits(self) -> u8 {
        match self {
            NakCode::PsnSeqError => 0,
            NakCode::InvalidRequest => 1,
            NakCode::RemoteAccess => 2,
            NakCode::RemoteOp => 3,
            NakCode::InvalidRdRequest => 4,
        }
    }
}

/// Ack extended transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Aeth {
    pub(crate) kind: AethKind,
    pub(crate) msn: u32,
}

impl Aeth {
    pub(crate) fn parse(buf: &[u8]) -> Result<(Self, &[u8]), Malformed> {
        if buf.len() < AETH_LEN {
            return Err(Malformed);
        }
        let word = AethWord::from(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
        let syndrome = word.syndrome();
        let kind = match syndrome >> 5 {
            0b000 => AethKind::Ack,
            0b001 => AethKind::RnrNak {
                timer: syndrome & 0x1F,
            },
            0b011 => AethKind::Nak(NakCode::from_bits(syndrome & 0x1F).ok_or(Malformed)?),
            _ => return Err(Malformed),
        };
        Ok((
            Self {
                kind,
                msn: u32::from(word.msn()),
            },
            &buf[AETH_LEN..],
        ))
    }

    pub(crate) fn emit(&self, out: &mut Vec<u8>) {
        let syndrome = match self.kind {
            // unlimited credits
            AethKind::Ack => 0b000_11111,
            AethKind::RnrNak { timer } => 0b001_00000 | (timer & 0x1F),
            AethKind::Nak(code) => 0b011_00000 | code.bits(),
        };
        let mut word = AethWord::default();
        word.set_msn(u24::from_u32(self.msn & 0x00FF_FFFF));
        word.set_syndrome(syndrome);
        out.extend_from_slice(&word.value.to_be_bytes());
    }
}

/// Atomic extended transport header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AtomicEth {
    pub(crate) vaddr: u64,
    pub(crate) rkey: u32,
    pub(crate) swap_add: u64,
    pub(crate) compare: u64,
}

impl AtomicEth {
    pub(crate) fn parse(buf: &[u8]) -> Result<(Self, &[u8]), Malformed> {
        if buf.len() < ATOMIC_ETH_LEN {
            return Err(Malformed);
        }
        Ok((
            Self {
                vaddr: u64::from_be_bytes(buf[0..8].try_into().unwrap_or_default()),
                rkey: u32::from_be_bytes(buf[8..12].try_into().unwrap_or_default()),
                swap_add: u64::from_be_bytes(buf[12..20].try_into().unwrap_or_default()),
                compare: u64::from_be_bytes(buf[20..28].try_into().unwrap_or_default()),
            },
            &buf[ATOMIC_ETH_LEN..],
        ))
    }

    pub(crate) fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.vaddr.to_be_bytes());
        out.extend_from_slice(&self.rkey.to_be_bytes());
        out.extend_from_slice(&self.swap_add.to_be_bytes());
        out.extend_from_slice(&self.compare.to_be_bytes());
    }
}

/// Atomic acknowledge extended transport header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AtomicAckEth {
    pub(crate) orig_data: u64,
}

impl AtomicAckEth {
    pub(crate) fn parse(buf: &[u8]) -> Result<(Self, &[u8]), Malformed> {
        if buf.len() < ATOMIC_ACK_ETH_LEN {
            return Err(Malformed);
        }
        Ok((
            Self {
                orig_data: u64::from_be_bytes(buf[0..8].try_into().unwrap_or_default()),
            },
            &buf[ATOMIC_ACK_ETH_LEN..],
        ))
    }

    pub(crate) fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.orig_data.to_be_bytes());
    }
}

pub(crate) fn parse_imm(buf: &[u8]) -> Result<(u32, &[u8]), Malformed> {
    if buf.len() < IMM_DT_LEN {
        return Err(Malformed);
    }
    Ok((
        u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        &buf[IMM_DT_LEN..],
    ))
}

/// Trailing diagnostic-routing footer carried by every datagram. The
/// switch learns a port's socket address from the footer of a bare
/// registration frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Footer {
    pub(crate) dev_id: u8,
    pub(crate) port_num: u8,
}

impl Footer {
    pub(crate) fn parse(buf: &[u8]) -> Result<Self, Malformed> {
        if buf.len() != FOOTER_LEN {
            return Err(Malformed);
        }
        if u16::from_be_bytes([buf[0], buf[1]]) != FOOTER_MAGIC {
            return Err(Malformed);
        }
        Ok(Self {
            dev_id: buf[2],
            port_num: buf[3],
        })
    }

    pub(crate) fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&FOOTER_MAGIC.to_be_bytes());
        out.push(self.dev_id);
        out.push(self.port_num);
        out.extend_from_slice(&[0u8; 4]);
    }

    /// A bare registration frame: footer only, no packet in front.
    pub(crate) fn registration_frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FOOTER_LEN);
        self.emit(&mut out);
        out
    }
}

/// Splits a received datagram into packet bytes and footer.
pub(crate) fn strip_footer(data: &[u8]) -> Result<(&[u8], Footer), Malformed> {
    let split = data.len().checked_sub(FOOTER_LEN).ok_or(Malformed)?;
    let footer = Footer::parse(&data[split..])?;
    Ok((&data[..split], footer))
}

/// A parsed datagram: fixed headers plus the remaining transport bytes
/// (extension headers and payload, padding and ICRC already removed).
#[derive(Debug)]
pub(crate) struct ParsedPacket<'a> {
    pub(crate) lrh: Lrh,
    pub(crate) grh: Option<Grh>,
    pub(crate) bth: Bth,
    pub(crate) body: &'a [u8],
}

/// Parses LRH, optional GRH and BTH off the front of `data` (footer
/// already stripped). Fails on length mismatch, nonzero link version,
/// an unknown `lnh` or pad-count underflow.
pub(crate) fn parse_packet(data: &[u8]) -> Result<ParsedPacket<'_>, Malformed> {
    let lrh = Lrh::parse(data)?;

    if usize::from(lrh.pktlen) * 4 != data.len() {
        return Err(Malformed);
    }
    if lrh.lver != 0 {
        return Err(Malformed);
    }

    let mut rest = &data[LRH_LEN..];
    let grh = match lrh.lnh {
        LNH_IBA_LOCAL => None,
        LNH_IBA_GLOBAL => {
            let bytes: &[u8; GRH_LEN] = rest
                .get(..GRH_LEN)
                .and_then(|b| b.try_into().ok())
                .ok_or(Malformed)?;
            rest = &rest[GRH_LEN..];
            Some(Grh { bytes: *bytes })
        }
        _ => return Err(Malformed),
    };

    let bth = Bth::parse(rest)?;
    rest = &rest[BTH_LEN..];

    // Strip ICRC and pad bytes off the tail.
    let body_len = rest
        .len()
        .checked_sub(ICRC_LEN + usize::from(bth.pad_cnt))
        .ok_or(Malformed)?;

    Ok(ParsedPacket {
        lrh,
        grh,
        bth,
        body: &rest[..body_len],
    })
}

/// Assembles a complete datagram: LRH + BTH + extension bytes + payload,
/// padded to a word boundary, ICRC placeholder and footer appended. The
/// LRH length field and BTH pad count are computed here.
pub(crate) fn build_datagram(
    slid: u16,
    dlid: u16,
    sl: u8,
    mut bth: Bth,
    ext: &[u8],
    payload: &[u8],
    footer: Footer,
) -> Vec<u8> {
    debug_assert_eq!(ext.len() % 4, 0, "extension headers are word aligned");

    let pad = (4 - payload.len() % 4) % 4;
    let total = LRH_LEN + BTH_LEN + ext.len() + payload.len() + pad + ICRC_LEN;
    bth.pad_cnt = pad as u8;

    let lrh = Lrh {
        vl: 0,
        lver: 0,
        sl,
        lnh: LNH_IBA_LOCAL,
        dlid,
        pktlen: (total / 4) as u16,
        slid,
    };

    let mut out = Vec::with_capacity(total + FOOTER_LEN);
    lrh.emit(&mut out);
    bth.emit(&mut out);
    out.extend_from_slice(ext);
    out.extend_from_slice(payload);
    out.resize(out.len() + pad, 0);
    // ICRC placeholder; wire integrity is out of scope
    out.extend_from_slice(&[0u8; ICRC_LEN]);
    footer.emit(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bth(opcode: Opcode) -> Bth {
        Bth {
            opcode: opcode as u8,
            se: false,
            migreq: false,
            pad_cnt: 0,
            tver: 0,
            pkey: 0xFFFF,
            dest_qp: 0x12,
            ack_req: true,
            psn: Psn::new(0x00AB_CDEF & 0x00FF_FFFF),
        }
    }

    #[test]
    fn datagram_round_trip() {
        let payload = [7u8; 13]; // forces 3 pad bytes
        let footer = Footer {
            dev_id: 2,
            port_num: 1,
        };
        let frame = build_datagram(5, 9, 0, sample_bth(Opcode::SendOnly), &[], &payload, footer);

        let (packet, parsed_footer) = strip_footer(&frame).unwrap();
        assert_eq!(parsed_footer, footer);

        let parsed = parse_packet(packet).unwrap();
        assert_eq!(parsed.lrh.slid, 5);
        assert_eq!(parsed.lrh.dlid, 9);
        assert_eq!(parsed.bth.opcode, Opcode::SendOnly as u8);
        assert_eq!(parsed.bth.pad_cnt, 3);
        assert!(parsed.bth.ack_req);
        assert_eq!(parsed.bth.psn, Psn::new(0x00AB_CDEF));
        assert_eq!(parsed.body, &payload);
    }

    #[test]
    fn length_mismatch_is_malformed() {
        let footer = Footer::default();
        let mut frame = build_datagram(1, 2, 0, sample_bth(Opcode::SendOnly), &[], &[0u8; 8], footer);
        let (packet, _) = strip_footer(&frame).unwrap();
        let mut truncated = packet.to_vec();
        truncated.pop();
        assert!(parse_packet(&truncated).is_err());

        // corrupt the link version field
        frame[0] |= 0x1;
        let (packet, _) = strip_footer(&frame).unwrap();
        assert!(parse_packet(packet).is_err());
    }

    #[test]
    fn bad_lnh_is_malformed() {
        let footer = Footer::default();
        let mut frame = build_datagram(1, 2, 0, sample_bth(Opcode::SendOnly), &[], &[], footer);
        frame[1] = (frame[1] & !0x3) | 0x1; // raw datagram, unsupported
        let (packet, _) = strip_footer(&frame).unwrap();
        assert!(parse_packet(packet).is_err());
    }

    #[test]
    fn aeth_syndrome_round_trip() {
        for kind in [
            AethKind::Ack,
            AethKind::RnrNak { timer: 0x0C },
            AethKind::Nak(NakCode::PsnSeqError),
            AethKind::Nak(NakCode::RemoteAccess),
        ] {
            let mut buf = Vec::new();
            Aeth { kind, msn: 77 }.emit(&mut buf);
            let (parsed, rest) = Aeth::parse(&buf).unwrap();
            assert!(rest.is_empty());
            assert_eq!(parsed.msn, 77);
            assert_eq!(parsed.kind, kind);
        }
    }

    #[test]
    fn atomic_eth_round_trip() {
        let eth = AtomicEth {
            vaddr: 0xDEAD_BEEF_0000_1000,
            rkey: 0x1234_5678,
            swap_add: 42,
            compare: 41,
        };
        let mut buf = Vec::new();
        eth.emit(&mut buf);
        let (parsed, rest) = AtomicEth::parse(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, eth);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let frame = Footer::default().registration_frame();
        assert!(Footer::parse(&frame).is_ok());
        let mut bad = frame;
        bad[0] ^= 0xFF;
        assert!(Footer::parse(&bad).is_err());
    }
}
