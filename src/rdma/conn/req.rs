use std::net::{SocketAddr, ToSocketAddrs};
use std::{fmt, mem};

use super::pdata::{PrivateData, ACCEPT_PDATA_MAX, CONNECT_PDATA_MAX};
use super::{ConnCfg, ConnState, Connection, Resources};
use crate::error::{Error, Result};
use crate::provider::{CmIdHandle, QpInitAttr, RawCmEvent};
use crate::rdma::cq::Cq;
use crate::rdma::flush;
use crate::rdma::mr::{verbs, MrLocal};
use crate::rdma::peer::Peer;
use crate::rdma::type_alias::OpContext;
use crate::utils::teardown::{Delete, FirstError};

/// Inline payload the send queue must hold: an emulated atomic write.
const MAX_INLINE_DATA: u32 = 8;

/// Resolve `addr:port` into one socket address.
pub(crate) fn resolve_addr(addr: &str, port: u16) -> Result<SocketAddr> {
    (addr, port)
        .to_socket_addrs()
        .map_err(|e| {
            log::debug!("rrpma: cannot resolve {}:{}: {}", addr, port, e);
            Error::InvalidArgument("address cannot be resolved")
        })?
        .next()
        .ok_or(Error::InvalidArgument("address resolves to nothing"))
}

/// Connection request.
///
/// A request is either outgoing, created with [`ConnReq::new`], or incoming,
/// taken from an [`Endpoint`](crate::Endpoint). It owns every resource of
/// the future connection, and is consumed by [`ConnReq::connect`] (connect
/// or accept) or by [`Delete::delete`] (abandon or reject).
pub struct ConnReq {
    peer: Peer,
    res: Resources,
    incoming: bool,
    private_data: PrivateData,
}

impl fmt::Debug for ConnReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnReq")
            .field("id", &self.res.id)
            .field("qp", &self.res.qp)
            .field("incoming", &self.incoming)
            .finish()
    }
}

impl ConnReq {
    /// Create an outgoing connection request to `addr:port`.
    ///
    /// The route is resolved within the configured timeout. `None` uses
    /// [`ConnCfg::default`].
    pub fn new(peer: &Peer, addr: &str, port: u16, cfg: Option<&ConnCfg>) -> Result<Self> {
        let default_cfg;
        let cfg = match cfg {
            Some(cfg) => cfg,
            None => {
                default_cfg = ConnCfg::default();
                &default_cfg
            }
        };
        cfg.validate()?;
        let addr = resolve_addr(addr, port)?;

        let provider = peer.provider();
        let id = provider.create_id(None)?;
        if let Err(e) = provider.resolve_route(id, addr, cfg.timeout_ms) {
            if let Err(e) = provider.destroy_id(id) {
                log::warn!("rrpma: cannot destroy CM ID on rollback: {}", e);
            }
            return Err(e.into());
        }

        let res = Self::build(peer, id, cfg)?;
        Ok(Self {
            peer: peer.clone(),
            res,
            incoming: false,
            private_data: PrivateData::default(),
        })
    }

    /// Build an incoming request from a connection-request event. The event
    /// stays unacknowledged.
    pub(crate) fn from_event(peer: &Peer, event: &RawCmEvent, cfg: &ConnCfg) -> Result<Self> {
        cfg.validate()?;
        let res = Self::build(peer, event.id, cfg)?;
        Ok(Self {
            peer: peer.clone(),
            res,
            incoming: true,
            private_data: PrivateData::from(event.private_data.as_slice()),
        })
    }

    /// Create the queues of the connection on `id`. On failure everything,
    /// including `id`, is released.
    fn build(peer: &Peer, id: CmIdHandle, cfg: &ConnCfg) -> Result<Resources> {
        let mut res = Resources {
            id: Some(id),
            srq: cfg.srq.clone(),
            ..Default::default()
        };
        match Self::build_queues(peer, &mut res, cfg) {
            Ok(()) => Ok(res),
            Err(e) => {
                let mut first = FirstError::new();
                res.destroy(peer, &mut first);
                if let Err(e) = first.into_result() {
                    log::warn!("rrpma: cannot roll back connection resources: {}", e);
                }
                Err(e)
            }
        }
    }

    fn build_queues(peer: &Peer, res: &mut Resources, cfg: &ConnCfg) -> Result<()> {
        let provider = peer.provider();
        let caps = peer.caps();

        if cfg.shared_comp_channel {
            res.shared_channel = Some(provider.create_comp_channel(peer.device())?);
        }
        let cq = res.cq.insert(Cq::new(peer, cfg.cq_size, res.shared_channel)?).handle()?;
        if res.srq.is_none() && cfg.rcq_size > 0 {
            res.rcq = Some(Cq::new(peer, cfg.rcq_size, res.shared_channel)?);
        }
        let recv_cq = match res.rcq() {
            Some(rcq) => rcq.handle()?,
            None => cq,
        };

        let attr = QpInitAttr {
            send_cq: cq,
            recv_cq,
            srq: res.srq.as_ref().map(|srq| srq.handle()),
            max_send_wr: cfg.sq_size,
            max_recv_wr: if res.srq.is_some() { 0 } else { cfg.rq_size },
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: MAX_INLINE_DATA,
            native_flush: caps.native_flush,
            native_atomic_write: caps.native_atomic_write,
        };
        let id = res.id()?;
        res.qp = Some(provider.create_qp(id, peer.pd(), &attr)?);
        res.flush = Some(flush::new_strategy(peer)?);
        Ok(())
    }

    /// Private data of an incoming request. Empty for outgoing ones.
    #[inline]
    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    /// Whether this request was received from an endpoint.
    #[inline]
    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    /// Post a receive before connecting, so that the first message from the
    /// peer cannot race the connection.
    ///
    /// Invalid when the connection uses a shared receive queue.
    pub fn recv(
        &self,
        dst: Option<&MrLocal<'_>>,
        offset: usize,
        len: usize,
        op_context: OpContext,
    ) -> Result<()> {
        if self.res.srq.is_some() {
            return Err(Error::InvalidArgument("receives go through the shared receive queue"));
        }
        let wr = verbs::recv(dst, offset, len, op_context)?;
        Ok(self.peer.provider().post_recv(self.res.qp()?, &wr)?)
    }

    /// Connect (outgoing) or accept (incoming), carrying `pdata` to the peer.
    ///
    /// The request is consumed. On failure, every resource it owned is
    /// released, and an incoming request is rejected. On success the
    /// connection starts in [`ConnState::Connecting`]; call
    /// [`Connection::establish`] or [`Connection::next_event`] to see it
    /// established.
    pub fn connect(mut self, pdata: Option<&[u8]>) -> Result<Connection> {
        let pdata = pdata.unwrap_or_default();
        let limit = if self.incoming {
            ACCEPT_PDATA_MAX
        } else {
            CONNECT_PDATA_MAX
        };
        if pdata.len() > limit {
            return Err(Error::InvalidArgument("private data exceeds the connection manager limit"));
        }

        let provider = self.peer.provider().clone();
        let id = self.res.id()?;
        let incoming = mem::replace(&mut self.incoming, false);
        let request_pdata = mem::take(&mut self.private_data);
        let mut conn = Connection {
            peer: self.peer.clone(),
            res: mem::take(&mut self.res),
            state: ConnState::Connecting,
            disconnecting: false,
            remote_peer_cfg: None,
            private_data: (!request_pdata.is_empty()).then_some(request_pdata),
        };

        let started = provider.create_event_channel().and_then(|evch| {
            conn.res.evch = Some(evch);
            provider.migrate_id(id, evch)?;
            if incoming {
                provider.accept(id, pdata)
            } else {
                provider.connect(id, pdata)
            }
        });
        if let Err(e) = started {
            if incoming {
                log::info!("rrpma: rejecting connection request on {:?} after failed accept", id);
                if let Err(e) = provider.reject(id, &[]) {
                    log::warn!("rrpma: cannot reject connection request: {}", e);
                }
            }
            return Err(e.into());
        }
        Ok(conn)
    }
}

impl Delete for ConnReq {
    /// Release the request. An incoming request is rejected first.
    fn delete(mut self) -> Result<()> {
        let mut first = FirstError::new();
        self.teardown(&mut first);
        first.into_result()
    }
}

impl ConnReq {
    fn teardown(&mut self, first: &mut FirstError) {
        if mem::replace(&mut self.incoming, false) {
            if let Some(id) = self.res.id {
                log::info!("rrpma: rejecting connection request on {:?}", id);
                first.record(self.peer.provider().reject(id, &[]));
            }
        }
        self.res.destroy(&self.peer, first);
    }
}

impl Drop for ConnReq {
    fn drop(&mut self) {
        let mut first = FirstError::new();
        self.teardown(&mut first);
        if let Err(e) = first.into_result() {
            log::warn!("rrpma: cannot release connection request on drop: {}", e);
        }
    }
}
