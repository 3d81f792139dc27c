//! Connections and their setup.

mod cfg;
mod ep;
mod event;
mod pdata;
mod req;

use std::fmt;
use std::os::fd::RawFd;

pub use self::cfg::*;
pub use self::ep::*;
pub use self::event::*;
pub use self::pdata::*;
pub use self::req::*;
use crate::error::{Error, Result};
use crate::provider::{
    is_would_block, CmIdHandle, CompChannelHandle, CqHandle, EventChannelHandle, QpHandle,
};
use crate::rdma::cq::Cq;
use crate::rdma::flush::{FlushStrategy, FlushType};
use crate::rdma::mr::{verbs, CompletionFlags, MrLocal, MrRemote, MrUsage};
use crate::rdma::peer::Peer;
use crate::rdma::peer_cfg::PeerCfg;
use crate::rdma::srq::Srq;
use crate::rdma::type_alias::{ImmData, OpContext, Qpn};
use crate::utils::teardown::{Delete, FirstError};

/// Hardware resources shared by a request and the connection it becomes.
#[derive(Default)]
pub(crate) struct Resources {
    id: Option<CmIdHandle>,
    qp: Option<QpHandle>,
    cq: Option<Cq>,
    rcq: Option<Cq>,
    shared_channel: Option<CompChannelHandle>,
    srq: Option<Srq>,
    flush: Option<Box<dyn FlushStrategy>>,
    evch: Option<EventChannelHandle>,
}

impl Resources {
    fn id(&self) -> Result<CmIdHandle> {
        self.id.ok_or(Error::InvalidArgument("connection is torn down"))
    }

    fn qp(&self) -> Result<QpHandle> {
        self.qp.ok_or(Error::InvalidArgument("connection is torn down"))
    }

    /// The receive completion queue, owned or borrowed from the SRQ.
    fn rcq(&self) -> Option<&Cq> {
        self.rcq
            .as_ref()
            .or_else(|| self.srq.as_ref().and_then(|srq| srq.rcq()))
    }

    /// Release everything in dependency order, continuing past failures.
    fn destroy(&mut self, peer: &Peer, first: &mut FirstError) {
        let provider = peer.provider();
        if self.qp.take().is_some() {
            if let Some(id) = self.id {
                first.record(provider.destroy_qp(id));
            }
        }
        if let Some(flush) = self.flush.take() {
            first.record(flush.delete());
        }
        first.record(self.rcq.take().delete());
        first.record(self.cq.take().delete());
        if let Some(channel) = self.shared_channel.take() {
            first.record(provider.destroy_comp_channel(channel));
        }
        if let Some(id) = self.id.take() {
            first.record(provider.destroy_id(id));
        }
        if let Some(evch) = self.evch.take() {
            first.record(provider.destroy_event_channel(evch));
        }
        self.srq = None;
    }
}

/// The queue in `slot`, if it is the one `ev_cq` names.
fn signaled(slot: &Option<Cq>, ev_cq: CqHandle) -> Option<&Cq> {
    slot.as_ref().filter(|cq| cq.handle().ok() == Some(ev_cq))
}

/// Which completion queue of a connection signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CqKind {
    Main,
    Receive,
}

/// RDMA connection.
///
/// Created by [`ConnReq::connect`]. Data-plane operations are only allowed
/// in [`ConnState::Established`] and fail with [`Error::InvalidArgument`]
/// otherwise, without reaching the hardware.
///
/// Operations are not internally synchronized; callers sharing a connection
/// across threads serialize posts, event retrieval and teardown themselves.
pub struct Connection {
    peer: Peer,
    res: Resources,
    state: ConnState,
    disconnecting: bool,
    remote_peer_cfg: Option<PeerCfg>,
    private_data: Option<PrivateData>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.res.id)
            .field("qp", &self.res.qp)
            .field("state", &self.state)
            .field("disconnecting", &self.disconnecting)
            .finish()
    }
}

impl Connection {
    /// Get the current state.
    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    fn check_established(&self) -> Result<QpHandle> {
        if self.state != ConnState::Established || self.disconnecting {
            return Err(Error::InvalidArgument("connection is not established"));
        }
        self.res.qp()
    }

    /* Events */

    /// Fetch the next connection event. Blocks if the event channel is
    /// blocking; otherwise returns [`Error::NoEvent`] when nothing is
    /// pending.
    ///
    /// The first [`ConnEvent::Established`] carrying private data stores a
    /// copy of it, unless the connection already holds some.
    pub fn next_event(&mut self) -> Result<ConnEvent> {
        let evch = self
            .res
            .evch
            .ok_or(Error::InvalidArgument("connection is torn down"))?;
        let provider = self.peer.provider().clone();
        let event = match provider.get_cm_event(evch) {
            Ok(event) => event,
            Err(e) if is_would_block(&e) => return Err(Error::NoEvent),
            Err(e) => return Err(e.into()),
        };

        let conn_event = ConnEvent::from_cm(event.kind);
        if conn_event == ConnEvent::Established
            && self.private_data.is_none()
            && !event.private_data.is_empty()
        {
            self.private_data = Some(PrivateData::from(event.private_data.as_slice()));
        }
        provider.ack_cm_event(event.handle)?;

        match ConnState::after(conn_event) {
            Some(state) => {
                if conn_event != ConnEvent::Established {
                    log::info!("rrpma: connection {:?} {:?}", self.res.id, conn_event);
                }
                self.state = state;
                Ok(conn_event)
            }
            None => {
                log::warn!("rrpma: unexpected CM event {:?} on a connection", event.kind);
                Err(Error::Unknown("unexpected connection manager event"))
            }
        }
    }

    /// Wait for the connection to be established.
    ///
    /// Any other event means the peer broke the protocol: the connection is
    /// torn down and [`Error::UnexpectedEvent`] is returned.
    pub fn establish(&mut self) -> Result<()> {
        match self.next_event()? {
            ConnEvent::Established => Ok(()),
            event => {
                let mut first = FirstError::new();
                self.res.destroy(&self.peer, &mut first);
                if let Err(e) = first.into_result() {
                    log::warn!("rrpma: cannot tear down unestablished connection: {}", e);
                }
                Err(Error::UnexpectedEvent(event))
            }
        }
    }

    /// Start disconnecting. Both sides then receive [`ConnEvent::Closed`],
    /// and no further operation may be posted.
    pub fn disconnect(&mut self) -> Result<()> {
        let id = self.res.id()?;
        self.peer.provider().disconnect(id)?;
        self.disconnecting = true;
        Ok(())
    }

    /* Private data & peer configuration */

    /// Private data received from the peer: the request's for an accepted
    /// connection, the accept's for a connected one. Empty if none.
    pub fn private_data(&self) -> &[u8] {
        self.private_data.as_deref().unwrap_or_default()
    }

    /// Hand private data over to the connection, replacing what it holds.
    pub fn transfer_private_data(&mut self, data: PrivateData) {
        self.private_data = Some(data);
    }

    /// Record the configuration the peer advertised. It decides which flush
    /// types are allowed.
    pub fn apply_remote_peer_cfg(&mut self, cfg: &PeerCfg) {
        self.remote_peer_cfg = Some(*cfg);
    }

    /* Identification */

    /// Get the local queue pair number.
    pub fn qp_num(&self) -> Result<Qpn> {
        Ok(self.peer.provider().qp_num(self.res.qp()?))
    }

    /// Get an identifier unique among the live connections of the process.
    pub fn unique_id(&self) -> Result<u64> {
        Ok(self.res.id()?.as_raw().get() as u64)
    }

    /* Completions */

    /// Get the main completion queue.
    pub fn cq(&self) -> Result<&Cq> {
        self.res
            .cq
            .as_ref()
            .ok_or(Error::InvalidArgument("connection is torn down"))
    }

    /// Get the receive completion queue, if the connection has one.
    pub fn rcq(&self) -> Option<&Cq> {
        self.res.rcq()
    }

    /// Get the file descriptor of the connection-manager event channel.
    pub fn event_fd(&self) -> Result<RawFd> {
        let evch = self
            .res
            .evch
            .ok_or(Error::InvalidArgument("connection is torn down"))?;
        Ok(self.peer.provider().event_channel_fd(evch))
    }

    /// Get the file descriptor of the shared completion channel.
    pub fn completion_fd(&self) -> Result<RawFd> {
        let channel = self.res.shared_channel.ok_or(Error::NotSharedChannel)?;
        Ok(self.peer.provider().comp_channel_fd(channel))
    }

    /// Block until one of the queues on the shared completion channel
    /// signals, rearm it, and tell which one it was.
    pub fn wait(&self) -> Result<CqKind> {
        let channel = self.res.shared_channel.ok_or(Error::NotSharedChannel)?;
        let ev_cq = self
            .peer
            .provider()
            .get_cq_event(channel)
            .map_err(|_| Error::NoCompletion)?;

        let (kind, cq) = match (signaled(&self.res.cq, ev_cq), signaled(&self.res.rcq, ev_cq)) {
            (Some(cq), _) => (CqKind::Main, cq),
            (None, Some(rcq)) => (CqKind::Receive, rcq),
            (None, None) => {
                self.peer.provider().ack_cq_events(ev_cq, 1);
                return Err(Error::Unknown("completion event for a foreign queue"));
            }
        };
        cq.ack_and_rearm()?;
        Ok(kind)
    }

    /* Data plane */

    /// RDMA read `len` bytes from `src` at `src_offset` into `dst` at
    /// `dst_offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &self,
        dst: Option<&MrLocal<'_>>,
        dst_offset: usize,
        src: Option<&MrRemote>,
        src_offset: usize,
        len: usize,
        flags: CompletionFlags,
        op_context: OpContext,
    ) -> Result<()> {
        let qp = self.check_established()?;
        let wr = verbs::read(dst, dst_offset, src, src_offset, len, flags, op_context)?;
        Ok(self.peer.provider().post_send(qp, &wr)?)
    }

    /// RDMA write `len` bytes from `src` at `src_offset` into `dst` at
    /// `dst_offset`.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        dst: Option<&MrRemote>,
        dst_offset: usize,
        src: Option<&MrLocal<'_>>,
        src_offset: usize,
        len: usize,
        flags: CompletionFlags,
        op_context: OpContext,
    ) -> Result<()> {
        let qp = self.check_established()?;
        let wr = verbs::write(dst, dst_offset, src, src_offset, len, flags, None, op_context)?;
        Ok(self.peer.provider().post_send(qp, &wr)?)
    }

    /// RDMA write with immediate data. The immediate data consumes one
    /// receive on the peer.
    #[allow(clippy::too_many_arguments)]
    pub fn write_with_imm(
        &self,
        dst: Option<&MrRemote>,
        dst_offset: usize,
        src: Option<&MrLocal<'_>>,
        src_offset: usize,
        len: usize,
        flags: CompletionFlags,
        imm: ImmData,
        op_context: OpContext,
    ) -> Result<()> {
        let qp = self.check_established()?;
        let wr = verbs::write(dst, dst_offset, src, src_offset, len, flags, Some(imm), op_context)?;
        Ok(self.peer.provider().post_send(qp, &wr)?)
    }

    /// Send `len` bytes of `src` at `offset`.
    pub fn send(
        &self,
        src: Option<&MrLocal<'_>>,
        offset: usize,
        len: usize,
        flags: CompletionFlags,
        op_context: OpContext,
    ) -> Result<()> {
        let qp = self.check_established()?;
        let wr = verbs::send(src, offset, len, flags, None, op_context)?;
        Ok(self.peer.provider().post_send(qp, &wr)?)
    }

    /// Send with immediate data.
    pub fn send_with_imm(
        &self,
        src: Option<&MrLocal<'_>>,
        offset: usize,
        len: usize,
        flags: CompletionFlags,
        imm: ImmData,
        op_context: OpContext,
    ) -> Result<()> {
        let qp = self.check_established()?;
        let wr = verbs::send(src, offset, len, flags, Some(imm), op_context)?;
        Ok(self.peer.provider().post_send(qp, &wr)?)
    }

    /// Post a receive buffer. Invalid with a shared receive queue; post to
    /// the [`Srq`] instead.
    pub fn recv(
        &self,
        dst: Option<&MrLocal<'_>>,
        offset: usize,
        len: usize,
        op_context: OpContext,
    ) -> Result<()> {
        let qp = self.check_established()?;
        if self.res.srq.is_some() {
            return Err(Error::InvalidArgument("receives go through the shared receive queue"));
        }
        let wr = verbs::recv(dst, offset, len, op_context)?;
        Ok(self.peer.provider().post_recv(qp, &wr)?)
    }

    /// Atomically write 8 bytes into `dst` at `dst_offset`, which must be
    /// 8-byte aligned.
    pub fn atomic_write(
        &self,
        dst: &MrRemote,
        dst_offset: usize,
        src: &[u8; 8],
        flags: CompletionFlags,
        op_context: OpContext,
    ) -> Result<()> {
        let qp = self.check_established()?;
        let caps = self.peer.caps();
        let wr = verbs::atomic_write(&caps, dst, dst_offset, src, flags, op_context)?;
        Ok(self.peer.provider().post_send(qp, &wr)?)
    }

    /// Make `[offset, offset + len)` of `dst` visible or persistent.
    ///
    /// A persistent flush needs both the region to advertise
    /// [`MrUsage::FLUSH_TYPE_PERSISTENT`] and the peer configuration applied
    /// with [`Connection::apply_remote_peer_cfg`] to assert direct write to
    /// persistent memory. A visibility flush needs the region to advertise
    /// [`MrUsage::FLUSH_TYPE_VISIBILITY`]. Otherwise the flush fails with
    /// [`Error::NotSupported`].
    #[allow(clippy::too_many_arguments)]
    pub fn flush(
        &self,
        dst: &MrRemote,
        offset: usize,
        len: usize,
        flush_type: FlushType,
        flags: CompletionFlags,
        op_context: OpContext,
    ) -> Result<()> {
        let qp = self.check_established()?;
        let signaled = flags.signaled()?;
        dst.check_range(offset, len)?;

        let supported = match flush_type {
            FlushType::Persistent => {
                dst.flush_type().contains(MrUsage::FLUSH_TYPE_PERSISTENT)
                    && self
                        .remote_peer_cfg
                        .is_some_and(|cfg| cfg.direct_write_to_pmem())
            }
            FlushType::Visibility => dst.flush_type().contains(MrUsage::FLUSH_TYPE_VISIBILITY),
        };
        if !supported {
            return Err(Error::NotSupported("flush type not supported by the remote side"));
        }

        let strategy = self
            .res
            .flush
            .as_ref()
            .ok_or(Error::InvalidArgument("connection is torn down"))?;
        strategy.flush(qp, dst, offset, len, flush_type, signaled, op_context)
    }

    fn teardown(&mut self, first: &mut FirstError) {
        self.res.destroy(&self.peer, first);
        self.private_data = None;
    }
}

impl Delete for Connection {
    /// Release the queue pair, the flush strategy, the completion queues and
    /// channels, the connection-manager identifier and event channel, then
    /// the private data. Teardown continues past failures and reports the
    /// first one.
    fn delete(mut self) -> Result<()> {
        let mut first = FirstError::new();
        self.teardown(&mut first);
        first.into_result()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut first = FirstError::new();
        self.teardown(&mut first);
        if let Err(e) = first.into_result() {
            log::warn!("rrpma: cannot release connection on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::provider::{CmEventKind, DeviceCaps};
    use crate::rdma::cq::{Completion, CompletionOp, WcStatus};

    const ADDR: &str = "127.0.0.1";
    const PORT: u16 = 7204;

    /// Accept one connection on `ep` and bring both ends up.
    fn accept_one(
        peer: &Peer,
        ep: &Endpoint,
        client_cfg: Option<&ConnCfg>,
        server_cfg: Option<&ConnCfg>,
        connect_pdata: &[u8],
        accept_pdata: &[u8],
    ) -> Result<(Connection, Connection)> {
        let mut client = ConnReq::new(peer, ADDR, PORT, client_cfg)?.connect(Some(connect_pdata))?;
        let mut server = ep.next_conn_req(server_cfg)?.connect(Some(accept_pdata))?;
        server.establish()?;
        client.establish()?;
        Ok((client, server))
    }

    /// Connect a client to a server with default configurations.
    fn pair(peer: &Peer, accept_pdata: &[u8]) -> Result<(Connection, Connection)> {
        let ep = Endpoint::listen(peer, ADDR, PORT)?;
        let conns = accept_one(peer, &ep, None, None, &[], accept_pdata)?;
        ep.shutdown()?;
        Ok(conns)
    }

    fn next_wc(cq: &Cq) -> Completion {
        cq.get_completion().unwrap()
    }

    #[test]
    fn read_through_advertised_envelope() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();

        let mut server_buf = vec![0u8; 1024];
        server_buf[16..21].copy_from_slice(b"hello");
        let server_mr = MrLocal::reg(&peer, &mut server_buf, MrUsage::READ_SRC)?;
        let envelope = ConnEnvelope::new(server_mr.as_remote()?, 16);

        let (client, server) = pair(&peer, &envelope.encode())?;
        assert_eq!(client.state(), ConnState::Established);
        assert_eq!(server.state(), ConnState::Established);

        let received = ConnEnvelope::decode(client.private_data())?;
        assert_eq!(received, envelope);

        let mut buf = vec![0u8; 64];
        let dst = MrLocal::reg(&peer, &mut buf, MrUsage::READ_DST)?;
        client.read(
            Some(&dst),
            0,
            Some(&received.mr),
            received.data_offset as usize,
            5,
            CompletionFlags::ALWAYS,
            42,
        )?;

        client.cq()?.wait()?;
        let wc = next_wc(client.cq()?);
        assert_eq!(wc.op, Some(CompletionOp::Read));
        assert_eq!(wc.op_context, 42);
        assert_eq!(wc.status, WcStatus::Success);
        assert_eq!(wc.qp_num, client.qp_num()?);

        dst.delete()?;
        assert_eq!(&buf[..5], b"hello");
        client.delete()?;
        server.delete()?;
        server_mr.delete()?;
        Ok(())
    }

    #[test]
    fn private_data_reaches_both_sides() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let ep = Endpoint::listen(&peer, ADDR, PORT)?;
        let (client, server) = accept_one(&peer, &ep, None, None, b"from client", b"from server")?;
        assert_eq!(server.private_data(), b"from client");
        assert_eq!(client.private_data(), b"from server");

        let mut server = server;
        server.transfer_private_data(PrivateData::from(&b"replaced"[..]));
        assert_eq!(server.private_data(), b"replaced");
        Ok(())
    }

    #[test]
    fn private_data_limits() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let ep = Endpoint::listen(&peer, ADDR, PORT)?;

        let req = ConnReq::new(&peer, ADDR, PORT, None)?;
        let err = req.connect(Some(&[0u8; CONNECT_PDATA_MAX + 1])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(fake.calls("connect"), 0);

        let _client = ConnReq::new(&peer, ADDR, PORT, None)?.connect(Some(&[1u8; CONNECT_PDATA_MAX]))?;
        let req = ep.next_conn_req(None)?;
        assert!(req.is_incoming());
        assert_eq!(req.private_data().len(), CONNECT_PDATA_MAX);
        let err = req.connect(Some(&[0u8; ACCEPT_PDATA_MAX + 1])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(fake.calls("accept"), 0);
        // The dropped incoming request is refused.
        assert_eq!(fake.calls("reject"), 1);
        Ok(())
    }

    #[test]
    fn misaligned_atomic_write_never_posts() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let mut server_buf = vec![0u8; 64];
        let server_mr = MrLocal::reg(&peer, &mut server_buf, MrUsage::WRITE_DST)?;
        let remote = server_mr.as_remote()?;
        let (client, _server) = pair(&peer, &[])?;

        let posted = fake.calls("post_send");
        let err = client
            .atomic_write(&remote, 3, &[9; 8], CompletionFlags::ALWAYS, 1)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(fake.calls("post_send"), posted);

        client.atomic_write(&remote, 8, &[7; 8], CompletionFlags::ALWAYS, 2)?;
        let wc = next_wc(client.cq()?);
        assert_eq!(wc.ok(), Ok(0));
        assert_eq!(wc.op_context, 2);

        server_mr.delete()?;
        assert_eq!(&server_buf[8..16], &[7; 8]);
        assert_eq!(&server_buf[..8], &[0; 8]);
        Ok(())
    }

    #[test]
    fn flush_gating() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let mut buf = vec![0u8; 4096];
        let mr = MrLocal::reg(
            &peer,
            &mut buf,
            MrUsage::WRITE_DST | MrUsage::FLUSH_TYPE_PERSISTENT,
        )?;
        let remote = mr.as_remote()?;
        let (mut client, _server) = pair(&peer, &[])?;

        let flags = CompletionFlags::ALWAYS;
        let err = client
            .flush(&remote, 0, 64, FlushType::Persistent, flags, 1)
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
        let err = client
            .flush(&remote, 0, 64, FlushType::Visibility, flags, 1)
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));

        client.apply_remote_peer_cfg(PeerCfg::new().set_direct_write_to_pmem(true));
        client.flush(&remote, 4090, 6, FlushType::Persistent, flags, 3)?;
        let wc = next_wc(client.cq()?);
        assert_eq!(wc.op, Some(CompletionOp::Read));
        assert_eq!(wc.op_context, 3);
        assert_eq!(wc.status, WcStatus::Success);

        assert!(matches!(
            client.flush(&remote, 4090, 7, FlushType::Persistent, flags, 4),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn native_flush_reports_flush() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        fake.set_caps(DeviceCaps {
            native_flush: true,
            ..Default::default()
        });
        let peer = fake.peer();
        let mut buf = vec![0u8; 256];
        let mr = MrLocal::reg(&peer, &mut buf, MrUsage::FLUSH_TYPE_VISIBILITY)?;
        let remote = mr.as_remote()?;
        let (client, _server) = pair(&peer, &[])?;

        client.flush(&remote, 0, 256, FlushType::Visibility, CompletionFlags::ALWAYS, 5)?;
        let wc = next_wc(client.cq()?);
        assert_eq!(wc.op, Some(CompletionOp::Flush));
        assert_eq!(wc.op_context, 5);

        // Unsignaled success leaves nothing behind.
        client.flush(&remote, 0, 8, FlushType::Visibility, CompletionFlags::ON_ERROR, 6)?;
        assert!(matches!(client.cq()?.get_completion(), Err(Error::NoCompletion)));
        Ok(())
    }

    #[test]
    fn completions_come_in_post_order() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let mut server_buf = vec![0u8; 64];
        let server_mr = MrLocal::reg(&peer, &mut server_buf, MrUsage::WRITE_DST)?;
        let remote = server_mr.as_remote()?;
        let mut buf = *b"abcdefgh";
        let src = MrLocal::reg(&peer, &mut buf, MrUsage::WRITE_SRC)?;
        let (client, _server) = pair(&peer, &[])?;

        for ctx in 1..=3u64 {
            let off = (ctx as usize - 1) * 8;
            client.write(Some(&remote), off, Some(&src), 0, 8, CompletionFlags::ALWAYS, ctx)?;
        }
        let mut wc = [Completion::default(); 4];
        let n = client.cq()?.get_completions(&mut wc)?;
        assert_eq!(n, 3);
        let contexts: Vec<_> = wc[..n].iter().map(|wc| wc.op_context).collect();
        assert_eq!(contexts, [1, 2, 3]);
        assert!(wc[..n].iter().all(|wc| wc.op == Some(CompletionOp::Write)));

        src.delete()?;
        server_mr.delete()?;
        assert_eq!(&server_buf[16..24], b"abcdefgh");
        Ok(())
    }

    #[test]
    fn wait_then_get_yields_each_completion_in_order() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let mut server_buf = vec![0u8; 64];
        let server_mr = MrLocal::reg(&peer, &mut server_buf, MrUsage::WRITE_DST)?;
        let remote = server_mr.as_remote()?;
        let mut buf = [0u8; 8];
        let src = MrLocal::reg(&peer, &mut buf, MrUsage::WRITE_SRC)?;
        let (client, _server) = pair(&peer, &[])?;
        let cq = client.cq()?;

        for ctx in 1..=5u64 {
            let off = (ctx as usize - 1) * 8;
            client.write(Some(&remote), off, Some(&src), 0, 8, CompletionFlags::ALWAYS, ctx)?;
            cq.wait()?;
            let wc = cq.get_completion()?;
            assert_eq!(wc.op_context, ctx);
            assert!(wc.ok().is_ok());
            assert!(matches!(cq.get_completion(), Err(Error::NoCompletion)));
        }
        Ok(())
    }

    #[test]
    fn one_notification_covers_a_batch() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let mut server_buf = vec![0u8; 64];
        let server_mr = MrLocal::reg(&peer, &mut server_buf, MrUsage::WRITE_DST)?;
        let remote = server_mr.as_remote()?;
        let mut buf = [0u8; 8];
        let src = MrLocal::reg(&peer, &mut buf, MrUsage::WRITE_SRC)?;
        let (client, _server) = pair(&peer, &[])?;
        let cq = client.cq()?;

        for ctx in 4..=6u64 {
            let off = (ctx as usize - 4) * 8;
            client.write(Some(&remote), off, Some(&src), 0, 8, CompletionFlags::ALWAYS, ctx)?;
        }
        cq.wait()?;
        let mut contexts = Vec::new();
        loop {
            match cq.get_completion() {
                Ok(wc) => contexts.push(wc.op_context),
                Err(Error::NoCompletion) => break,
                Err(e) => return Err(e.into()),
            }
        }
        assert_eq!(contexts, [4, 5, 6]);
        assert!(matches!(cq.wait(), Err(Error::NoCompletion)));
        Ok(())
    }

    #[test]
    fn operations_need_an_established_connection() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let ep = Endpoint::listen(&peer, ADDR, PORT)?;
        let mut buf = [0u8; 8];
        let mr = MrLocal::reg(&peer, &mut buf, MrUsage::SEND | MrUsage::RECV)?;

        let client = ConnReq::new(&peer, ADDR, PORT, None)?.connect(None)?;
        assert_eq!(client.state(), ConnState::Connecting);
        let flags = CompletionFlags::ALWAYS;
        assert!(matches!(client.send(Some(&mr), 0, 8, flags, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(client.recv(Some(&mr), 0, 8, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(client.read(None, 0, None, 0, 0, flags, 0), Err(Error::InvalidArgument(_))));
        assert_eq!(fake.calls("post_send"), 0);
        assert_eq!(fake.calls("post_recv"), 0);

        let mut server = ep.next_conn_req(None)?.connect(None)?;
        let mut client = client;
        client.establish()?;
        server.establish()?;

        client.disconnect()?;
        assert!(matches!(client.send(Some(&mr), 0, 8, flags, 0), Err(Error::InvalidArgument(_))));
        assert_eq!(client.next_event()?, ConnEvent::Closed);
        assert_eq!(client.state(), ConnState::Closed);
        assert_eq!(server.next_event()?, ConnEvent::Closed);
        assert!(matches!(server.next_event(), Err(Error::NoEvent)));
        Ok(())
    }

    #[test]
    fn send_and_write_with_imm() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let mut send_buf = *b"ping";
        let src = MrLocal::reg(&peer, &mut send_buf, MrUsage::SEND)?;
        let mut recv_buf = [0u8; 16];
        let dst = MrLocal::reg(&peer, &mut recv_buf, MrUsage::RECV)?;
        let (client, server) = pair(&peer, &[])?;

        server.recv(Some(&dst), 0, 16, 10)?;
        server.recv(None, 0, 0, 11)?;
        client.send_with_imm(Some(&src), 0, 4, CompletionFlags::ALWAYS, 0xbeef, 20)?;
        client.write_with_imm(None, 0, None, 0, 0, CompletionFlags::ALWAYS, 0xcafe, 21)?;

        let wc = next_wc(server.cq()?);
        assert_eq!(wc.op, Some(CompletionOp::Recv));
        assert_eq!(wc.op_context, 10);
        assert_eq!(wc.ok(), Ok(4));
        assert_eq!(wc.imm, Some(0xbeef));
        let wc = next_wc(server.cq()?);
        assert_eq!(wc.op, Some(CompletionOp::RecvRdmaWithImm));
        assert_eq!(wc.op_context, 11);
        assert_eq!(wc.imm, Some(0xcafe));

        assert_eq!(next_wc(client.cq()?).op, Some(CompletionOp::Send));
        assert_eq!(next_wc(client.cq()?).op, Some(CompletionOp::Write));

        // Nothing posted on the other side.
        client.send(Some(&src), 0, 4, CompletionFlags::ON_ERROR, 30)?;
        let wc = next_wc(client.cq()?);
        assert_eq!(wc.op_context, 30);
        assert_eq!(wc.status, WcStatus::RnrRetryExcErr);

        dst.delete()?;
        assert_eq!(&recv_buf[..4], b"ping");
        Ok(())
    }

    #[test]
    fn srq_completions_name_their_queue_pair() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let srq = Srq::new(&peer, None)?;
        let server_cfg = ConnCfg::default().with_srq(srq.clone());
        let ep = Endpoint::listen(&peer, ADDR, PORT)?;
        let (client1, server1) = accept_one(&peer, &ep, None, Some(&server_cfg), &[], &[])?;
        let (client2, server2) = accept_one(&peer, &ep, None, Some(&server_cfg), &[], &[])?;
        drop(server_cfg);
        ep.shutdown()?;
        assert_ne!(server1.qp_num()?, server2.qp_num()?);

        let mut recv_buf = [0u8; 32];
        let dst = MrLocal::reg(&peer, &mut recv_buf, MrUsage::RECV)?;
        assert!(matches!(server1.recv(Some(&dst), 0, 16, 1), Err(Error::InvalidArgument(_))));
        srq.recv(Some(&dst), 0, 16, 1)?;
        srq.recv(Some(&dst), 16, 16, 2)?;

        client2.send(None, 0, 0, CompletionFlags::ON_ERROR, 0)?;
        client1.send(None, 0, 0, CompletionFlags::ON_ERROR, 0)?;

        let rcq = server1.rcq().ok_or(Error::Unknown("no receive queue"))?;
        let first = next_wc(rcq);
        let second = next_wc(rcq);
        assert_eq!((first.op_context, first.qp_num), (1, server2.qp_num()?));
        assert_eq!((second.op_context, second.qp_num), (2, server1.qp_num()?));

        // The queue stays while connections use it.
        let held = srq.clone();
        assert_eq!(held.delete().unwrap_err().provider_code(), Some(libc::EBUSY));
        for conn in [client1, server1, client2, server2] {
            conn.delete()?;
        }
        dst.delete()?;
        srq.delete()?;
        assert_eq!(fake.live_objects(), 0);
        Ok(())
    }

    #[test]
    fn shared_channel_tells_which_queue() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let cfg = ConnCfg {
            shared_comp_channel: true,
            rcq_size: 10,
            ..Default::default()
        };
        let ep = Endpoint::listen(&peer, ADDR, PORT)?;
        let (client, server) = accept_one(&peer, &ep, Some(&cfg), Some(&cfg), &[], &[])?;
        assert!(server.completion_fd()? >= 0);
        assert!(matches!(server.cq()?.wait(), Err(Error::SharedChannel)));

        let mut recv_buf = [0u8; 8];
        let dst = MrLocal::reg(&peer, &mut recv_buf, MrUsage::RECV)?;
        server.recv(Some(&dst), 0, 8, 1)?;
        client.send(None, 0, 0, CompletionFlags::ALWAYS, 2)?;

        assert_eq!(server.wait()?, CqKind::Receive);
        let rcq = server.rcq().ok_or(Error::Unknown("no receive queue"))?;
        assert_eq!(next_wc(rcq).op_context, 1);
        assert_eq!(client.wait()?, CqKind::Main);
        assert_eq!(next_wc(client.cq()?).op_context, 2);
        assert!(matches!(client.wait(), Err(Error::NoCompletion)));

        let (plain_client, _plain_server) = accept_one(&peer, &ep, None, None, &[], &[])?;
        assert!(matches!(plain_client.wait(), Err(Error::NotSharedChannel)));
        assert!(matches!(plain_client.completion_fd(), Err(Error::NotSharedChannel)));
        Ok(())
    }

    #[test]
    fn rejected_flows() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();

        // Nobody listens.
        let mut client = ConnReq::new(&peer, ADDR, PORT, None)?.connect(None)?;
        assert_eq!(client.next_event()?, ConnEvent::Rejected);
        assert_eq!(client.state(), ConnState::Rejected);

        // The listener refuses.
        let ep = Endpoint::listen(&peer, ADDR, PORT)?;
        let mut client = ConnReq::new(&peer, ADDR, PORT, None)?.connect(None)?;
        ep.next_conn_req(None)?.delete()?;
        assert!(matches!(client.establish(), Err(Error::UnexpectedEvent(ConnEvent::Rejected))));
        assert!(matches!(client.qp_num(), Err(Error::InvalidArgument(_))));
        assert_eq!(fake.unacked_events(), 0);
        Ok(())
    }

    #[test]
    fn undefined_event_is_unknown() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let (mut client, _server) = pair(&peer, &[])?;
        fake.inject_event(client.unique_id()?, CmEventKind::AddrChange);
        assert!(matches!(client.next_event(), Err(Error::Unknown(_))));
        assert_eq!(client.state(), ConnState::Established);
        assert_eq!(fake.unacked_events(), 0);

        fake.inject_event(client.unique_id()?, CmEventKind::DeviceRemoval);
        assert_eq!(client.next_event()?, ConnEvent::Lost);
        assert_eq!(client.state(), ConnState::Lost);
        Ok(())
    }

    #[test]
    fn endpoint_without_requests() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let ep = Endpoint::listen(&peer, ADDR, PORT)?;
        assert_eq!(ep.addr().port(), PORT);
        assert!(ep.fd()? >= 0);
        assert!(matches!(ep.next_conn_req(None), Err(Error::NoNext)));
        assert!(matches!(
            Endpoint::listen(&peer, ADDR, PORT).unwrap_err().provider_code(),
            Some(libc::EADDRINUSE)
        ));
        ep.shutdown()?;
        assert_eq!(fake.live_objects(), 0);
        Ok(())
    }

    #[test]
    fn delete_releases_everything() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let cfg = ConnCfg {
            shared_comp_channel: true,
            rcq_size: 4,
            ..Default::default()
        };
        let ep = Endpoint::listen(&peer, ADDR, PORT)?;
        let (client, server) = accept_one(&peer, &ep, Some(&cfg), None, &[], &[])?;
        ep.shutdown()?;

        client.delete()?;
        assert_eq!(fake.calls("destroy_qp"), 1);
        assert_eq!(fake.calls("destroy_cq"), 2);
        assert_eq!(fake.calls("destroy_comp_channel"), 1);
        server.delete()?;
        assert_eq!(fake.live_objects(), 0);

        let absent: Option<Connection> = None;
        absent.delete()?;
        Ok(())
    }

    #[test]
    fn delete_continues_past_failures() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let (client, _server) = pair(&peer, &[])?;

        fake.fail_next("destroy_qp", libc::EIO);
        let err = client.delete().unwrap_err();
        assert_eq!(err.provider_code(), Some(libc::EIO));
        assert_eq!(fake.calls("destroy_event_channel"), 2);
        assert_eq!(fake.calls("dereg_mr"), 1);
        Ok(())
    }

    #[test]
    fn failed_connect_releases_request() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        fake.fail_next("connect", libc::ECONNREFUSED);
        let err = ConnReq::new(&peer, ADDR, PORT, None)?.connect(None).unwrap_err();
        assert_eq!(err.provider_code(), Some(libc::ECONNREFUSED));
        assert_eq!(fake.live_objects(), 0);

        fake.fail_next("create_qp", libc::ENOMEM);
        assert!(ConnReq::new(&peer, ADDR, PORT, None).is_err());
        assert_eq!(fake.live_objects(), 0);
        Ok(())
    }

    #[test]
    fn failed_accept_rejects_the_peer() -> anyhow::Result<()> {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let ep = Endpoint::listen(&peer, ADDR, PORT)?;
        let mut client = ConnReq::new(&peer, ADDR, PORT, None)?.connect(None)?;

        fake.fail_next("accept", libc::EIO);
        let err = ep.next_conn_req(None)?.connect(None).unwrap_err();
        assert_eq!(err.provider_code(), Some(libc::EIO));
        assert_eq!(fake.calls("reject"), 1);
        assert_eq!(client.next_event()?, ConnEvent::Rejected);
        assert_eq!(client.state(), ConnState::Rejected);
        assert_eq!(fake.unacked_events(), 0);
        Ok(())
    }

    #[test]
    fn providers_do_not_share_state() -> anyhow::Result<()> {
        let a = FakeProvider::new();
        let b = FakeProvider::new();
        let peer_a = a.peer();
        let peer_b = b.peer();
        let ep = Endpoint::listen(&peer_a, ADDR, PORT)?;
        let mut client = ConnReq::new(&peer_b, ADDR, PORT, None)?.connect(None)?;
        assert_eq!(client.next_event()?, ConnEvent::Rejected);
        assert!(matches!(ep.next_conn_req(None), Err(Error::NoNext)));
        Ok(())
    }
}
