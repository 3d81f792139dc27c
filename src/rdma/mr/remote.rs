use serde::{Deserialize, Serialize};

use super::MrUsage;
use crate::error::{Error, Result};
use crate::provider::RemoteAddr;
use crate::rdma::type_alias::RKey;

/// Size of a memory region descriptor on the wire.
pub const MR_DESCRIPTOR_SIZE: usize = 8 + 8 + 4 + 1;

/// Flush capability bits of the descriptor's last byte.
const DESC_FLUSH_PERSISTENT: u8 = 1 << 0;
const DESC_FLUSH_VISIBILITY: u8 = 1 << 1;

/// Serialize a region into its wire descriptor.
///
/// Layout, every field little-endian and byte-packed:
///
/// | offset | size | field                  |
/// |-------:|-----:|------------------------|
/// |      0 |    8 | address                |
/// |      8 |    8 | length                 |
/// |     16 |    4 | access key (rkey)      |
/// |     20 |    1 | flush capability flags |
pub(crate) fn encode_descriptor(addr: u64, len: u64, rkey: RKey, usage: MrUsage) -> [u8; MR_DESCRIPTOR_SIZE] {
    let mut flush = 0;
    if usage.contains(MrUsage::FLUSH_TYPE_PERSISTENT) {
        flush |= DESC_FLUSH_PERSISTENT;
    }
    if usage.contains(MrUsage::FLUSH_TYPE_VISIBILITY) {
        flush |= DESC_FLUSH_VISIBILITY;
    }

    let mut desc = [0u8; MR_DESCRIPTOR_SIZE];
    desc[0..8].copy_from_slice(&addr.to_le_bytes());
    desc[8..16].copy_from_slice(&len.to_le_bytes());
    desc[16..20].copy_from_slice(&rkey.to_le_bytes());
    desc[20] = flush;
    desc
}

/// Remote memory region.
///
/// This structure is rebuilt from a descriptor received from the peer and
/// does not hold any RDMA resources locally. It only parameterizes one-sided
/// operations against the peer's memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrRemote {
    addr: u64,
    len: u64,
    rkey: RKey,
    flush: MrUsage,
}

impl MrRemote {
    /// Size of the descriptor this type is built from.
    pub const DESCRIPTOR_SIZE: usize = MR_DESCRIPTOR_SIZE;

    /// Rebuild a remote memory region from its wire descriptor.
    ///
    /// The descriptor may sit at any alignment. It is rejected if its size
    /// is not exactly [`Self::DESCRIPTOR_SIZE`], if its access key is zero,
    /// if its flush byte carries unknown bits, or if the region it describes
    /// runs past the end of the address space.
    pub fn from_descriptor(desc: &[u8]) -> Result<Self> {
        let desc: &[u8; MR_DESCRIPTOR_SIZE] = desc
            .try_into()
            .map_err(|_| Error::InvalidArgument("memory region descriptor size mismatch"))?;

        let mut addr = [0u8; 8];
        let mut len = [0u8; 8];
        let mut rkey = [0u8; 4];
        addr.copy_from_slice(&desc[0..8]);
        len.copy_from_slice(&desc[8..16]);
        rkey.copy_from_slice(&desc[16..20]);
        let flush_byte = desc[20];

        let addr = u64::from_le_bytes(addr);
        let len = u64::from_le_bytes(len);
        if addr.checked_add(len).is_none() {
            return Err(Error::InvalidArgument("memory region descriptor wraps the address space"));
        }

        let rkey = u32::from_le_bytes(rkey);
        if rkey == 0 {
            return Err(Error::InvalidArgument("memory region descriptor has a zero access key"));
        }
        if flush_byte & !(DESC_FLUSH_PERSISTENT | DESC_FLUSH_VISIBILITY) != 0 {
            return Err(Error::InvalidArgument("memory region descriptor has unknown flush bits"));
        }

        let mut flush = MrUsage::EMPTY;
        if flush_byte & DESC_FLUSH_PERSISTENT != 0 {
            flush |= MrUsage::FLUSH_TYPE_PERSISTENT;
        }
        if flush_byte & DESC_FLUSH_VISIBILITY != 0 {
            flush |= MrUsage::FLUSH_TYPE_VISIBILITY;
        }

        Ok(Self {
            addr,
            len,
            rkey,
            flush,
        })
    }

    /// Serialize this remote memory region back into a descriptor.
    pub fn descriptor(&self) -> [u8; MR_DESCRIPTOR_SIZE] {
        encode_descriptor(self.addr, self.len, self.rkey, self.flush)
    }

    /// Get the size of the remote memory region.
    #[inline]
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Get the flush types the remote memory region supports, as a subset of
    /// [`MrUsage::FLUSH_TYPES`].
    #[inline]
    pub fn flush_type(&self) -> MrUsage {
        self.flush
    }

    /// Get the remote start address.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Get the remote key.
    #[inline]
    pub fn rkey(&self) -> RKey {
        self.rkey
    }

    /// Check that `[offset, offset + len)` lies inside the region.
    pub(crate) fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let end = (offset as u64)
            .checked_add(len as u64)
            .ok_or(Error::InvalidArgument("remote range overflows"))?;
        if end > self.len {
            return Err(Error::InvalidArgument("remote range exceeds the memory region"));
        }
        Ok(())
    }

    /// Address the remote memory at the given offset, which
    /// [`check_range`](Self::check_range) has accepted.
    #[inline]
    pub(crate) fn at(&self, offset: usize) -> RemoteAddr {
        RemoteAddr {
            addr: self.addr.wrapping_add(offset as u64),
            rkey: self.rkey,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> [u8; MR_DESCRIPTOR_SIZE] {
        encode_descriptor(0x7f00_dead_b000, 4096, 0x1234, MrUsage::WRITE_DST | MrUsage::FLUSH_TYPES)
    }

    #[test]
    fn layout_is_little_endian() {
        let desc = sample();
        assert_eq!(&desc[0..8], &0x7f00_dead_b000u64.to_le_bytes());
        assert_eq!(&desc[8..16], &4096u64.to_le_bytes());
        assert_eq!(&desc[16..20], &[0x34, 0x12, 0, 0]);
        assert_eq!(desc[20], DESC_FLUSH_PERSISTENT | DESC_FLUSH_VISIBILITY);
    }

    #[test]
    fn decode_any_alignment() {
        let desc = sample();
        for shift in 0..MR_DESCRIPTOR_SIZE {
            let mut buf = vec![0xAAu8; shift + MR_DESCRIPTOR_SIZE];
            buf[shift..].copy_from_slice(&desc);
            let mr = MrRemote::from_descriptor(&buf[shift..]).unwrap();
            assert_eq!(mr.size(), 4096);
            assert_eq!(mr.rkey(), 0x1234);
            assert_eq!(mr.flush_type(), MrUsage::FLUSH_TYPES);
            assert_eq!(mr.descriptor(), desc);
        }
    }

    #[test]
    fn reject_wrong_size() {
        let desc = sample();
        assert!(matches!(
            MrRemote::from_descriptor(&desc[..MR_DESCRIPTOR_SIZE - 1]),
            Err(Error::InvalidArgument(_))
        ));
        let mut longer = desc.to_vec();
        longer.push(0);
        assert!(matches!(
            MrRemote::from_descriptor(&longer),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn reject_zero_key() {
        let desc = encode_descriptor(0x1000, 64, 0, MrUsage::READ_SRC);
        assert!(matches!(
            MrRemote::from_descriptor(&desc),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn reject_unknown_flush_bits() {
        let mut desc = sample();
        desc[20] |= 1 << 5;
        assert!(matches!(
            MrRemote::from_descriptor(&desc),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn reject_wrapping_region() {
        let desc = encode_descriptor(u64::MAX - 3, 64, 1, MrUsage::WRITE_DST);
        assert!(matches!(
            MrRemote::from_descriptor(&desc),
            Err(Error::InvalidArgument(_))
        ));

        let desc = encode_descriptor(u64::MAX - 64, 64, 1, MrUsage::WRITE_DST);
        let mr = MrRemote::from_descriptor(&desc).unwrap();
        assert!(mr.check_range(56, 8).is_ok());
        assert_eq!(mr.at(56).addr, u64::MAX - 8);
    }

    #[test]
    fn range_check() {
        let mr = MrRemote::from_descriptor(&sample()).unwrap();
        assert!(mr.check_range(0, 4096).is_ok());
        assert!(mr.check_range(4095, 1).is_ok());
        assert!(mr.check_range(4095, 2).is_err());
        assert!(mr.check_range(usize::MAX, 2).is_err());
        assert_eq!(mr.at(8).addr, 0x7f00_dead_b008);
    }
}
