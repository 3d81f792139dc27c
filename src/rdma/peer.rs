//! Peer: a protection domain bound to one device.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::provider::*;
use crate::utils::teardown::Delete;

/// Ownership holder of the protection domain.
struct PeerInner {
    provider: Arc<dyn Provider>,
    dev: DeviceHandle,
    pd: Option<PdHandle>,
    caps: DeviceCaps,
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        if let Some(pd) = self.pd.take() {
            if let Err(e) = self.provider.dealloc_pd(pd) {
                log::warn!("rrpma: cannot dealloc PD on drop: {}", e);
            }
        }
    }
}

/// Local RDMA peer.
///
/// A peer owns the protection domain of one device. Every memory region,
/// completion queue, shared receive queue, connection request and flush
/// strategy of that device is created through it and keeps it alive.
/// Clone it to share it.
#[derive(Clone)]
pub struct Peer {
    /// Cached protection domain.
    pd: PdHandle,

    /// Peer body.
    inner: Arc<PeerInner>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("dev", &self.inner.dev)
            .field("pd", &self.pd)
            .field("caps", &self.inner.caps)
            .finish()
    }
}

impl Peer {
    /// Allocate a protection domain on the given device and query its
    /// capabilities.
    pub fn new(provider: Arc<dyn Provider>, dev: DeviceHandle) -> Result<Self> {
        let caps = provider.query_device(dev)?;
        let pd = provider.alloc_pd(dev)?;
        log::debug!("rrpma: peer created on {:?} with {:?}", dev, caps);

        Ok(Self {
            pd,
            inner: Arc::new(PeerInner {
                provider,
                dev,
                pd: Some(pd),
                caps,
            }),
        })
    }

    /// Look up the device serving `addr` and create a peer on it.
    pub fn for_addr(provider: Arc<dyn Provider>, addr: SocketAddr, kind: AddrKind) -> Result<Self> {
        let dev = provider.lookup_device(addr, kind)?;
        Self::new(provider, dev)
    }

    /// Get the hardware provider.
    #[inline]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.inner.provider
    }

    /// Get the device this peer is bound to.
    #[inline]
    pub fn device(&self) -> DeviceHandle {
        self.inner.dev
    }

    /// Get the protection domain.
    #[inline]
    pub fn pd(&self) -> PdHandle {
        self.pd
    }

    /// Get the capabilities of the device.
    #[inline]
    pub fn caps(&self) -> DeviceCaps {
        self.inner.caps
    }
}

impl Delete for Peer {
    /// Deallocate the protection domain.
    ///
    /// Fails with a provider error (`EBUSY`) if any resource created through
    /// this peer, or another clone of it, is still alive. In that case this
    /// handle is released and the protection domain stays with the remaining
    /// holders.
    fn delete(self) -> Result<()> {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(_) => {
                log::warn!("rrpma: peer still has resources attached");
                return Err(Error::provider(libc::EBUSY));
            }
        };
        match inner.pd.take() {
            Some(pd) => Ok(inner.provider.dealloc_pd(pd)?),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;

    #[test]
    fn new_queries_caps() {
        let fake = FakeProvider::new();
        fake.set_caps(DeviceCaps {
            odp: true,
            ..Default::default()
        });
        let peer = fake.peer();
        assert!(peer.caps().odp);
        assert!(!peer.caps().native_flush);
        assert_eq!(fake.calls("alloc_pd"), 1);
    }

    #[test]
    fn delete_fails_while_shared() {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let clone = peer.clone();

        let err = peer.delete().unwrap_err();
        assert_eq!(err.provider_code(), Some(libc::EBUSY));
        assert_eq!(fake.calls("dealloc_pd"), 0);

        clone.delete().unwrap();
        assert_eq!(fake.calls("dealloc_pd"), 1);
    }

    #[test]
    fn pd_alloc_failure_is_provider_error() {
        let fake = FakeProvider::new();
        fake.fail_next("alloc_pd", libc::ENOMEM);
        let err = Peer::new(fake.clone(), fake.device()).unwrap_err();
        assert_eq!(err.provider_code(), Some(libc::ENOMEM));
    }

    #[test]
    fn drop_deallocs_pd() {
        let fake = FakeProvider::new();
        drop(fake.peer());
        assert_eq!(fake.calls("dealloc_pd"), 1);
    }
}
