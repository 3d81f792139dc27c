use std::ops::{Add, AddAssign, BitAnd, BitOr, BitOrAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::provider::{Access, DeviceCaps};

/// Intended usage of a memory region.
///
/// The usage decides the hardware access mask of a local region and, for
/// the two flush bits, is advertised to the remote side in the region's
/// descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MrUsage(u32);

impl MrUsage {
    pub const EMPTY: Self = Self(0);
    pub const READ_SRC: Self = Self(1 << 0);
    pub const READ_DST: Self = Self(1 << 1);
    pub const WRITE_SRC: Self = Self(1 << 2);
    pub const WRITE_DST: Self = Self(1 << 3);
    pub const FLUSH_TYPE_VISIBILITY: Self = Self(1 << 4);
    pub const FLUSH_TYPE_PERSISTENT: Self = Self(1 << 5);
    pub const SEND: Self = Self(1 << 6);
    pub const RECV: Self = Self(1 << 7);

    /// Both flush capability bits.
    pub const FLUSH_TYPES: Self = Self(Self::FLUSH_TYPE_VISIBILITY.0 | Self::FLUSH_TYPE_PERSISTENT.0);

    /// Every recognized bit.
    pub const ALL: Self = Self(0xFF);

    /// Build a usage from raw bits, keeping unrecognized ones so that
    /// validation can reject them.
    #[inline]
    pub const fn from_bits_retain(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Non-empty and made only of recognized bits.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0 && self.0 & !Self::ALL.0 == 0
    }

    /// Derive the hardware access mask.
    ///
    /// - READ_SRC and both flush types need remote read, since flush can be
    ///   emulated by reading back;
    /// - READ_DST, WRITE_SRC and RECV need local write;
    /// - WRITE_DST needs remote write and local write;
    /// - SEND needs nothing.
    ///
    /// With native flush on the device, the flush types also grant the
    /// matching flush placement.
    pub fn access(self, caps: &DeviceCaps) -> Access {
        let mut access = Access::EMPTY;
        if self.intersects(Self::READ_SRC | Self::FLUSH_TYPES) {
            access |= Access::REMOTE_READ;
        }
        if self.intersects(Self::READ_DST | Self::WRITE_SRC | Self::RECV) {
            access |= Access::LOCAL_WRITE;
        }
        if self.contains(Self::WRITE_DST) {
            access |= Access::REMOTE_WRITE | Access::LOCAL_WRITE;
        }
        if caps.iwarp && self.contains(Self::READ_DST) {
            // iWARP targets of an RDMA read are written remotely.
            access |= Access::REMOTE_WRITE;
        }
        if caps.native_flush {
            if self.contains(Self::FLUSH_TYPE_VISIBILITY) {
                access |= Access::FLUSH_GLOBAL;
            }
            if self.contains(Self::FLUSH_TYPE_PERSISTENT) {
                access |= Access::FLUSH_PERSISTENT;
            }
        }
        access
    }
}

impl Add for MrUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl AddAssign for MrUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Sub for MrUsage {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 & !rhs.0)
    }
}

impl SubAssign for MrUsage {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 &= !rhs.0;
    }
}

impl BitAnd for MrUsage {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for MrUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self + rhs
    }
}

impl BitOrAssign for MrUsage {
    fn bitor_assign(&mut self, rhs: Self) {
        *self += rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_derivation() {
        let caps = DeviceCaps::default();
        assert_eq!(MrUsage::READ_SRC.access(&caps), Access::REMOTE_READ);
        assert_eq!(MrUsage::READ_DST.access(&caps), Access::LOCAL_WRITE);
        assert_eq!(
            MrUsage::WRITE_DST.access(&caps),
            Access::REMOTE_WRITE | Access::LOCAL_WRITE
        );
        assert_eq!(MrUsage::SEND.access(&caps), Access::EMPTY);
        assert_eq!(MrUsage::RECV.access(&caps), Access::LOCAL_WRITE);
        assert_eq!(
            MrUsage::FLUSH_TYPE_PERSISTENT.access(&caps),
            Access::REMOTE_READ
        );
    }

    #[test]
    fn native_flush_grants_placement() {
        let caps = DeviceCaps {
            native_flush: true,
            ..Default::default()
        };
        let access = (MrUsage::WRITE_DST | MrUsage::FLUSH_TYPES).access(&caps);
        assert!(access.contains(Access::FLUSH_GLOBAL));
        assert!(access.contains(Access::FLUSH_PERSISTENT));
        assert!(access.contains(Access::REMOTE_WRITE));
    }

    #[test]
    fn iwarp_read_destination() {
        let caps = DeviceCaps {
            iwarp: true,
            ..Default::default()
        };
        assert!(MrUsage::READ_DST.access(&caps).contains(Access::REMOTE_WRITE));
    }

    #[test]
    fn validity() {
        assert!(!MrUsage::EMPTY.is_valid());
        assert!(MrUsage::ALL.is_valid());
        assert!(!MrUsage::from_bits_retain(1 << 8).is_valid());
        assert!(!MrUsage::from_bits_retain(1 | 1 << 12).is_valid());
        assert_eq!(MrUsage::ALL - MrUsage::FLUSH_TYPES, MrUsage::from_bits_retain(0xCF));
    }
}
