use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use super::req::resolve_addr;
use super::{ConnCfg, ConnEvent, ConnReq};
use crate::error::{Error, Result};
use crate::provider::{is_would_block, CmEventKind, CmIdHandle, EventChannelHandle};
use crate::rdma::peer::Peer;
use crate::utils::teardown::{Delete, FirstError};

/// Listening endpoint.
///
/// Incoming connection requests queue up on the endpoint's event channel
/// and are taken one at a time with [`Endpoint::next_conn_req`].
pub struct Endpoint {
    peer: Peer,
    addr: SocketAddr,
    id: Option<CmIdHandle>,
    evch: Option<EventChannelHandle>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("addr", &self.addr)
            .field("id", &self.id)
            .finish()
    }
}

impl Endpoint {
    /// Start listening on `addr:port`.
    pub fn listen(peer: &Peer, addr: &str, port: u16) -> Result<Self> {
        let addr = resolve_addr(addr, port)?;
        let provider = peer.provider();

        let evch = provider.create_event_channel()?;
        let mut ep = Self {
            peer: peer.clone(),
            addr,
            id: None,
            evch: Some(evch),
        };
        let id = ep.id.insert(provider.create_id(Some(evch))?);
        provider.bind_addr(*id, addr)?;
        provider.listen(*id, 0)?;
        log::debug!("rrpma: listening on {}", addr);
        Ok(ep)
    }

    /// Get the address the endpoint listens on.
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the file descriptor of the event channel incoming requests
    /// arrive on.
    pub fn fd(&self) -> Result<RawFd> {
        let evch = self
            .evch
            .ok_or(Error::InvalidArgument("endpoint is shut down"))?;
        Ok(self.peer.provider().event_channel_fd(evch))
    }

    /// Take the next incoming connection request and set up its resources
    /// with `cfg` (`None` uses [`ConnCfg::default`]).
    ///
    /// Returns [`Error::NoNext`] if no request is pending on a non-blocking
    /// channel. Any other event is acknowledged and reported as
    /// [`Error::UnexpectedEvent`].
    pub fn next_conn_req(&self, cfg: Option<&ConnCfg>) -> Result<ConnReq> {
        let evch = self
            .evch
            .ok_or(Error::InvalidArgument("endpoint is shut down"))?;
        let provider = self.peer.provider();

        let event = match provider.get_cm_event(evch) {
            Ok(event) => event,
            Err(e) if is_would_block(&e) => return Err(Error::NoNext),
            Err(e) => return Err(e.into()),
        };
        if event.kind != CmEventKind::ConnectRequest {
            log::warn!("rrpma: unexpected CM event {:?} on an endpoint", event.kind);
            provider.ack_cm_event(event.handle)?;
            return Err(Error::UnexpectedEvent(ConnEvent::from_cm(event.kind)));
        }

        let req = match cfg {
            Some(cfg) => ConnReq::from_event(&self.peer, &event, cfg),
            None => ConnReq::from_event(&self.peer, &event, &ConnCfg::default()),
        };
        let req = match req {
            Ok(req) => req,
            Err(e) => {
                // The identifier is already destroyed, which refuses the peer.
                if let Err(e) = provider.ack_cm_event(event.handle) {
                    log::warn!("rrpma: cannot ack connection request: {}", e);
                }
                return Err(e);
            }
        };
        provider.ack_cm_event(event.handle)?;
        Ok(req)
    }

    /// Stop listening.
    pub fn shutdown(self) -> Result<()> {
        self.delete()
    }

    fn teardown(&mut self, first: &mut FirstError) {
        let provider = self.peer.provider();
        if let Some(id) = self.id.take() {
            first.record(provider.destroy_id(id));
        }
        if let Some(evch) = self.evch.take() {
            first.record(provider.destroy_event_channel(evch));
        }
    }
}

impl Delete for Endpoint {
    fn delete(mut self) -> Result<()> {
        let mut first = FirstError::new();
        self.teardown(&mut first);
        first.into_result()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let mut first = FirstError::new();
        self.teardown(&mut first);
        if let Err(e) = first.into_result() {
            log::warn!("rrpma: cannot shut down endpoint on drop: {}", e);
        }
    }
}
