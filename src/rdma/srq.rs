//! Shared receive queues.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::SrqHandle;
use crate::rdma::cq::Cq;
use crate::rdma::mr::{verbs, MrLocal};
use crate::rdma::peer::Peer;
use crate::rdma::type_alias::OpContext;
use crate::utils::teardown::{Delete, FirstError};

/// Shared receive queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrqCfg {
    /// Receive queue depth.
    pub rq_size: u32,

    /// Depth of the receive completion queue shared by every attached
    /// connection. `0` means no dedicated receive completion queue: receive
    /// completions then land on each connection's main queue.
    pub rcq_size: u32,
}

impl Default for SrqCfg {
    fn default() -> Self {
        Self {
            rq_size: 100,
            rcq_size: 100,
        }
    }
}

impl SrqCfg {
    /// Parse the `[rrpma.srq]` table of a TOML document. Missing keys keep
    /// their defaults, and so does a missing table.
    pub fn from_toml(s: &str) -> Result<Self> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Root {
            rrpma: Section,
        }
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Section {
            srq: SrqCfg,
        }

        let root: Root = toml::from_str(s)?;
        Ok(root.rrpma.srq)
    }
}

/// Ownership holder of the shared receive queue.
struct SrqInner {
    peer: Peer,
    srq: Option<SrqHandle>,
    rcq: Option<Cq>,
}

impl SrqInner {
    fn destroy(&mut self, first: &mut FirstError) {
        if let Some(srq) = self.srq.take() {
            first.record(self.peer.provider().destroy_srq(srq));
        }
        first.record(self.rcq.take().delete());
    }
}

impl Drop for SrqInner {
    fn drop(&mut self) {
        let mut first = FirstError::new();
        self.destroy(&mut first);
        if let Err(e) = first.into_result() {
            log::warn!("rrpma: cannot destroy SRQ on drop: {}", e);
        }
    }
}

/// Shared receive queue.
///
/// Receive buffers posted here are consumed, in post order, by whichever
/// attached connection receives a message first. Clone it to attach it to
/// several connections through [`ConnCfg`](crate::ConnCfg).
#[derive(Clone)]
pub struct Srq {
    /// Cached SRQ handle.
    srq: SrqHandle,

    /// SRQ body.
    inner: Arc<SrqInner>,
}

impl fmt::Debug for Srq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Srq")
            .field("srq", &self.srq)
            .field("rcq", &self.inner.rcq)
            .finish()
    }
}

impl Srq {
    /// Create a shared receive queue, and its receive completion queue if
    /// the configuration asks for one. `None` uses [`SrqCfg::default`].
    pub fn new(peer: &Peer, cfg: Option<&SrqCfg>) -> Result<Self> {
        let cfg = cfg.copied().unwrap_or_default();
        if cfg.rq_size == 0 {
            return Err(Error::InvalidArgument("shared receive queue size is zero"));
        }

        let provider = peer.provider();
        let srq = provider.create_srq(peer.pd(), cfg.rq_size, 1)?;
        let rcq = if cfg.rcq_size > 0 {
            match Cq::new(peer, cfg.rcq_size, None) {
                Ok(rcq) => Some(rcq),
                Err(e) => {
                    if let Err(e) = provider.destroy_srq(srq) {
                        log::warn!("rrpma: cannot destroy SRQ on rollback: {}", e);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            srq,
            inner: Arc::new(SrqInner {
                peer: peer.clone(),
                srq: Some(srq),
                rcq,
            }),
        })
    }

    #[inline]
    pub(crate) fn handle(&self) -> SrqHandle {
        self.srq
    }

    /// Get the receive completion queue shared by every attached connection.
    #[inline]
    pub fn rcq(&self) -> Option<&Cq> {
        self.inner.rcq.as_ref()
    }

    /// Post a receive buffer. A null receive (no region, zero offset and
    /// length) is allowed.
    pub fn recv(
        &self,
        dst: Option<&MrLocal<'_>>,
        offset: usize,
        len: usize,
        op_context: OpContext,
    ) -> Result<()> {
        let wr = verbs::recv(dst, offset, len, op_context)?;
        Ok(self.inner.peer.provider().post_srq_recv(self.srq, &wr)?)
    }
}

impl Delete for Srq {
    /// Destroy the shared receive queue, then its receive completion queue.
    ///
    /// Fails with a provider error (`EBUSY`) while a connection still uses
    /// it. In that case this handle is released and the queue stays with the
    /// remaining holders.
    fn delete(self) -> Result<()> {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(_) => {
                log::warn!("rrpma: SRQ still has connections attached");
                return Err(Error::provider(libc::EBUSY));
            }
        };
        let mut first = FirstError::new();
        inner.destroy(&mut first);
        first.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;

    #[test]
    fn cfg_defaults_and_toml() -> anyhow::Result<()> {
        assert_eq!(SrqCfg::default().rq_size, 100);
        assert_eq!(SrqCfg::default().rcq_size, 100);

        let cfg = SrqCfg::from_toml("[rrpma.srq]\nrcq_size = 0\n")?;
        assert_eq!(cfg, SrqCfg { rq_size: 100, rcq_size: 0 });
        assert_eq!(SrqCfg::from_toml("")?, SrqCfg::default());
        assert!(matches!(
            SrqCfg::from_toml("[rrpma.srq]\nrq_size = \"x\"\n"),
            Err(Error::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn with_and_without_rcq() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();

        let srq = Srq::new(&peer, None)?;
        assert!(srq.rcq().is_some());
        srq.delete()?;
        assert_eq!(fake.calls("destroy_srq"), 1);
        assert_eq!(fake.calls("destroy_cq"), 1);

        let cfg = SrqCfg {
            rcq_size: 0,
            ..Default::default()
        };
        let srq = Srq::new(&peer, Some(&cfg))?;
        assert!(srq.rcq().is_none());
        srq.delete()?;
        assert_eq!(fake.calls("destroy_cq"), 1);
        Ok(())
    }

    #[test]
    fn rcq_failure_rolls_back() {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        fake.fail_next("create_cq", libc::ENOMEM);
        assert!(Srq::new(&peer, None).is_err());
        assert_eq!(fake.calls("destroy_srq"), 1);
    }

    #[test]
    fn delete_fails_while_shared() {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let srq = Srq::new(&peer, None).unwrap();
        let attached = srq.clone();
        assert_eq!(srq.delete().unwrap_err().provider_code(), Some(libc::EBUSY));
        attached.delete().unwrap();
        assert_eq!(fake.calls("destroy_srq"), 1);
    }

    #[test]
    fn recv_validates_range() {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let srq = Srq::new(&peer, None).unwrap();
        assert!(srq.recv(None, 0, 0, 1).is_ok());
        assert!(matches!(
            srq.recv(None, 0, 8, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(fake.calls("post_srq_recv"), 1);
    }
}
