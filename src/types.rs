use std::{
    cmp::Ordering,
    fmt::Display,
    ops::{Add, AddAssign, Sub},
    time::Duration,
};

use crate::constants::{LID_PERMISSIVE, MAX_PSN_WINDOW, MCAST_LID_BASE, PSN_MASK, QPN_KEY_PART_WIDTH};

/// 24-bit packet sequence number with wrapping comparison.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Psn(pub(crate) u32);

impl Psn {
    pub(crate) fn new(value: u32) -> Self {
        Self(value & PSN_MASK)
    }

    pub fn into_inner(self) -> u32 {
        self.0
    }
}

impl From<u32> for Psn {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl PartialOrd for Psn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Psn {
    fn cmp(&self, other: &Self) -> Ordering {
        let x = self.0.wrapping_sub(other.0) & PSN_MASK;
        match x {
            0 => Ordering::Equal,
            x if x as usize > MAX_PSN_WINDOW => Ordering::Less,
            _ => Ordering::Greater,
        }
    }
}

impl Add<u32> for Psn {
    type Output = Psn;

    fn add(self, rhs: u32) -> Self::Output {
        Psn(self.0.wrapping_add(rhs) & PSN_MASK)
    }
}

impl AddAssign<u32> for Psn {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs) & PSN_MASK;
    }
}

impl Sub<Psn> for Psn {
    type Output = u32;

    fn sub(self, rhs: Psn) -> Self::Output {
        self.0.wrapping_sub(rhs.0) & PSN_MASK
    }
}

impl Display for Psn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn is_unicast_lid(lid: u16) -> bool {
    lid < MCAST_LID_BASE
}

pub(crate) fn is_multicast_lid(lid: u16) -> bool {
    (MCAST_LID_BASE..LID_PERMISSIVE).contains(&lid)
}

pub(crate) fn is_permissive_lid(lid: u16) -> bool {
    lid == LID_PERMISSIVE
}

/// Index part of a QPN; the low bits are a random key.
#[allow(clippy::as_conversions)] // u32 to usize
pub(crate) fn qpn_index(qpn: u32) -> usize {
    (qpn >> QPN_KEY_PART_WIDTH) as usize
}

/// Path MTU of a connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PathMtu {
    #[default]
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl PathMtu {
    pub fn in_bytes(self) -> u32 {
        match self {
            PathMtu::Mtu256 => 256,
            PathMtu::Mtu512 => 512,
            PathMtu::Mtu1024 => 1024,
            PathMtu::Mtu2048 => 2048,
            PathMtu::Mtu4096 => 4096,
        }
    }
}

/// Decodes a 5-bit RNR NAK timer field into a wait duration (IBA table 45).
pub(crate) fn rnr_nak_timeout(code: u8) -> Duration {
    let micros = match code & 0x1F {
        0x00 => 655_360,
        0x01 => 10,
        0x02 => 20,
        0x03 => 30,
        0x04 => 40,
        0x05 => 60,
        0x06 => 80,
        0x07 => 120,
        0x08 => 160,
        0x09 => 240,
        0x0A => 320,
        0x0B => 480,
        0x0C => 640,
        0x0D => 960,
        0x0E => 1_280,
        0x0F => 1_920,
        0x10 => 2_560,
        0x11 => 3_840,
        0x12 => 5_120,
        0x13 => 7_680,
        0x14 => 10_240,
        0x15 => 15_360,
        0x16 => 20_480,
        0x17 => 30_720,
        0x18 => 40_960,
        0x19 => 61_440,
        0x1A => 81_920,
        0x1B => 122_880,
        0x1C => 163_840,
        0x1D => 245_760,
        0x1E => 327_680,
        _ => 491_520,
    };
    Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psn_ordering_wraps() {
        assert_eq!(Psn::new(100).cmp(&Psn::new(100)), Ordering::Equal);
        assert_eq!(Psn::new(101).cmp(&Psn::new(100)), Ordering::Greater);
        assert_eq!(Psn::new(100).cmp(&Psn::new(101)), Ordering::Less);

        assert_eq!(Psn::new(0).cmp(&Psn::new((1 << 24) - 1)), Ordering::Greater);
        assert_eq!(Psn::new((1 << 24) - 1).cmp(&Psn::new(0)), Ordering::Less);
    }

    #[test]
    fn psn_arithmetic_masks() {
        assert_eq!((Psn::new(PSN_MASK) + 1).into_inner(), 0);
        assert_eq!(Psn::new(0) - Psn::new(PSN_MASK), 1);
    }

    #[test]
    fn lid_classes() {
        assert!(is_unicast_lid(1));
        assert!(!is_unicast_lid(MCAST_LID_BASE));
        assert!(is_multicast_lid(MCAST_LID_BASE));
        assert!(!is_multicast_lid(LID_PERMISSIVE));
        assert!(is_permissive_lid(LID_PERMISSIVE));
    }
}
