//! Peer configuration exchanged during connection setup.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a peer guarantees about its memory.
///
/// The configuration is serialized into a descriptor, carried inside the
/// connection's private data, and applied on the other side with
/// [`Connection::apply_remote_peer_cfg`](crate::Connection::apply_remote_peer_cfg).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerCfg {
    direct_write_to_pmem: bool,
}

impl PeerCfg {
    /// Size of the descriptor.
    pub const DESCRIPTOR_SIZE: usize = 1;

    /// Create a configuration that asserts nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare whether RDMA writes to this peer's memory land directly in
    /// persistent memory.
    pub fn set_direct_write_to_pmem(&mut self, supported: bool) -> &mut Self {
        self.direct_write_to_pmem = supported;
        self
    }

    #[inline]
    pub fn direct_write_to_pmem(&self) -> bool {
        self.direct_write_to_pmem
    }

    /// Serialize into the wire descriptor.
    pub fn descriptor(&self) -> [u8; Self::DESCRIPTOR_SIZE] {
        [self.direct_write_to_pmem as u8]
    }

    /// Rebuild a configuration from its wire descriptor. Any non-zero byte
    /// means `true`.
    pub fn from_descriptor(desc: &[u8]) -> Result<Self> {
        match desc {
            [flag] => Ok(Self {
                direct_write_to_pmem: *flag != 0,
            }),
            _ => Err(Error::InvalidArgument("peer configuration descriptor size mismatch")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor() {
        let mut cfg = PeerCfg::new();
        assert_eq!(cfg.descriptor(), [0]);
        cfg.set_direct_write_to_pmem(true);
        assert_eq!(cfg.descriptor(), [1]);
        assert_eq!(PeerCfg::from_descriptor(&cfg.descriptor()).unwrap(), cfg);
        assert!(PeerCfg::from_descriptor(&[7]).unwrap().direct_write_to_pmem());
    }

    #[test]
    fn size_mismatch() {
        assert!(matches!(
            PeerCfg::from_descriptor(&[]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            PeerCfg::from_descriptor(&[1, 0]),
            Err(Error::InvalidArgument(_))
        ));
    }
}
