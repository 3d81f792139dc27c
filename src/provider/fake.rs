//! In-process loopback fabric.
//!
//! [`FakeProvider`] implements [`Provider`] without any hardware. Every
//! connection it carries links two queue pairs of the same instance, and
//! operations really move bytes between the registered buffers, so both
//! ends of a connection can be driven from one thread.
//!
//! Each instance also counts its calls by method name and can fail the next
//! call of a method with a chosen error code. Instances share no state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::*;
use crate::rdma::peer::Peer;
use crate::utils::interop::from_c_ret;

/* Raw `ibv_wc_status` values produced by the fabric. */
const WC_SUCCESS: u32 = 0;
const WC_LOC_LEN_ERR: u32 = 1;
const WC_LOC_PROT_ERR: u32 = 4;
const WC_WR_FLUSH_ERR: u32 = 5;
const WC_REM_INV_REQ_ERR: u32 = 9;
const WC_REM_ACCESS_ERR: u32 = 10;
const WC_RNR_RETRY_EXC_ERR: u32 = 13;

/* Raw `ibv_wc_opcode` values produced by the fabric. */
const WC_SEND: u32 = 0;
const WC_RDMA_WRITE: u32 = 1;
const WC_RDMA_READ: u32 = 2;
const WC_FLUSH: u32 = 8;
const WC_ATOMIC_WRITE: u32 = 9;
const WC_RECV: u32 = 128;
const WC_RECV_RDMA_WITH_IMM: u32 = 129;

/// Base of the fake file descriptors.
const FD_BASE: RawFd = 1000;

struct FakeMr {
    addr: usize,
    len: usize,
    access: Access,
    key: u32,
}

impl FakeMr {
    fn covers(&self, addr: u64, len: u64) -> bool {
        let start = self.addr as u64;
        addr >= start && addr.saturating_add(len) <= start + self.len as u64
    }
}

#[derive(Default)]
struct FakeCq {
    channel: Option<CompChannelHandle>,
    entries: VecDeque<RawCompletion>,
    armed: bool,
}

struct FakeQp {
    id: CmIdHandle,
    num: u32,
    send_cq: CqHandle,
    recv_cq: CqHandle,
    srq: Option<SrqHandle>,
    rq: VecDeque<RecvRequest>,
}

#[derive(Default)]
struct FakeId {
    channel: Option<EventChannelHandle>,
    bound: Option<SocketAddr>,
    dst: Option<SocketAddr>,
    qp: Option<QpHandle>,
    peer: Option<CmIdHandle>,
    established: bool,
}

#[derive(Default)]
struct State {
    next_handle: usize,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, i32>,
    caps: DeviceCaps,
    overreport: bool,
    last_access: Access,

    pds: HashSet<PdHandle>,
    mrs: HashMap<MrHandle, FakeMr>,
    comp_channels: HashMap<CompChannelHandle, VecDeque<CqHandle>>,
    cqs: HashMap<CqHandle, FakeCq>,
    srqs: HashMap<SrqHandle, VecDeque<RecvRequest>>,
    qps: HashMap<QpHandle, FakeQp>,
    event_channels: HashMap<EventChannelHandle, VecDeque<RawCmEvent>>,
    ids: HashMap<CmIdHandle, FakeId>,
    listeners: HashMap<SocketAddr, CmIdHandle>,
    unacked: HashSet<CmEventHandle>,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl State {
    /// Fresh handle value. Handles are counters and never dereferenced.
    fn handle<H: From<ptr::NonNull<u8>>>(&mut self) -> H {
        self.next_handle += 1;
        let raw = self.next_handle as *mut u8;
        H::from(ptr::NonNull::new(raw).unwrap_or(ptr::NonNull::dangling()))
    }

    fn mr_by_key(&self, key: u32) -> Option<&FakeMr> {
        self.mrs.values().find(|mr| mr.key == key)
    }

    fn channel_of(&self, id: CmIdHandle) -> Option<EventChannelHandle> {
        self.ids.get(&id).and_then(|id| id.channel)
    }

    fn push_event(
        &mut self,
        id: CmIdHandle,
        kind: CmEventKind,
        listen_id: Option<CmIdHandle>,
        private_data: &[u8],
    ) {
        let channel = match listen_id {
            Some(listen_id) => self.channel_of(listen_id),
            None => self.channel_of(id),
        };
        let Some(channel) = channel else {
            return;
        };
        let event = RawCmEvent {
            handle: self.handle(),
            kind,
            id,
            listen_id,
            status: 0,
            private_data: private_data.to_vec(),
        };
        if let Some(queue) = self.event_channels.get_mut(&channel) {
            queue.push_back(event);
        }
    }

    fn complete(&mut self, cq: CqHandle, wc: RawCompletion) {
        let Some(fake_cq) = self.cqs.get_mut(&cq) else {
            return;
        };
        fake_cq.entries.push_back(wc);
        if fake_cq.armed {
            if let Some(channel) = fake_cq.channel {
                fake_cq.armed = false;
                if let Some(queue) = self.comp_channels.get_mut(&channel) {
                    queue.push_back(cq);
                }
            }
        }
    }

    /// Queue pair at the other end of `qp`'s connection.
    fn remote_qp(&self, qp: QpHandle) -> Option<QpHandle> {
        let id = self.qps.get(&qp)?.id;
        let peer = self.ids.get(&id)?.peer?;
        if !self.ids.get(&peer)?.established {
            return None;
        }
        self.ids.get(&peer)?.qp
    }

    /// Local source or destination of a work request, as a raw address.
    fn local_buf(&self, sge: &Sge, inline: bool) -> Result<u64, u32> {
        if inline || sge.len == 0 {
            return Ok(sge.addr);
        }
        match self.mr_by_key(sge.lkey) {
            Some(mr) if mr.covers(sge.addr, sge.len as u64) => Ok(sge.addr),
            _ => Err(WC_LOC_PROT_ERR),
        }
    }

    /// Remote target of a one-sided operation, checked against its region.
    fn remote_buf(&self, remote: &RemoteAddr, len: u64, access: Access) -> Result<u64, u32> {
        if len == 0 {
            return Ok(remote.addr);
        }
        match self.mr_by_key(remote.rkey) {
            Some(mr) if mr.covers(remote.addr, len) && mr.access.contains(access) => {
                Ok(remote.addr)
            }
            _ => Err(WC_REM_ACCESS_ERR),
        }
    }

    /// Consume one receive posted at `qp`, directly or through its SRQ.
    fn take_recv(&mut self, qp: QpHandle) -> Option<RecvRequest> {
        let fake_qp = self.qps.get_mut(&qp)?;
        match fake_qp.srq {
            Some(srq) => self.srqs.get_mut(&srq)?.pop_front(),
            None => fake_qp.rq.pop_front(),
        }
    }

    /// Deliver a message, or the immediate data of a write, to `remote`.
    /// Returns the sender status.
    fn deliver(
        &mut self,
        remote: QpHandle,
        src: Option<u64>,
        len: u32,
        imm: Option<u32>,
        rdma: bool,
    ) -> u32 {
        let Some(recv) = self.take_recv(remote) else {
            return WC_RNR_RETRY_EXC_ERR;
        };
        let (recv_cq, num) = match self.qps.get(&remote) {
            Some(qp) => (qp.recv_cq, qp.num),
            None => return WC_WR_FLUSH_ERR,
        };

        let mut wc = RawCompletion {
            wr_id: recv.wr_id,
            status: WC_SUCCESS,
            opcode: if rdma { WC_RECV_RDMA_WITH_IMM } else { WC_RECV },
            byte_len: len,
            imm,
            qp_num: num,
            ..Default::default()
        };
        let sender_status = match src {
            None => WC_SUCCESS,
            Some(_) if len == 0 => WC_SUCCESS,
            Some(src) => match recv.sge {
                Some(dst) if dst.len >= len => match self.local_buf(&dst, false) {
                    Ok(dst) => {
                        // SAFETY: both ranges lie in registered memory.
                        unsafe { ptr::copy(src as *const u8, dst as *mut u8, len as usize) };
                        WC_SUCCESS
                    }
                    Err(status) => {
                        wc.status = status;
                        WC_REM_INV_REQ_ERR
                    }
                },
                _ => {
                    wc.status = WC_LOC_LEN_ERR;
                    WC_REM_INV_REQ_ERR
                }
            },
        };
        self.complete(recv_cq, wc);
        sender_status
    }

    /// Carry out a send-queue work request. Returns the completion opcode
    /// and status.
    fn execute(&mut self, qp: QpHandle, wr: &SendRequest) -> (u32, u32) {
        let opcode = match wr.op {
            SendOp::Read { .. } => WC_RDMA_READ,
            SendOp::Write { .. } => WC_RDMA_WRITE,
            SendOp::Send { .. } => WC_SEND,
            SendOp::AtomicWrite { .. } => WC_ATOMIC_WRITE,
            SendOp::Flush { .. } => WC_FLUSH,
        };
        let Some(remote_qp) = self.remote_qp(qp) else {
            return (opcode, WC_WR_FLUSH_ERR);
        };
        let local = match wr.sge.map(|sge| self.local_buf(&sge, wr.inline)).transpose() {
            Ok(local) => local,
            Err(status) => return (opcode, status),
        };
        let len = wr.sge.map_or(0, |sge| sge.len);

        let status = match wr.op {
            SendOp::Read { remote } => {
                match self.remote_buf(&remote, len as u64, Access::REMOTE_READ) {
                    Ok(src) => {
                        if let Some(dst) = local {
                            // SAFETY: both ranges lie in registered memory.
                            unsafe { ptr::copy(src as *const u8, dst as *mut u8, len as usize) };
                        }
                        WC_SUCCESS
                    }
                    Err(status) => status,
                }
            }
            SendOp::Write { remote, imm } => {
                match self.remote_buf(&remote, len as u64, Access::REMOTE_WRITE) {
                    Ok(dst) => {
                        if let Some(src) = local {
                            // SAFETY: both ranges lie in registered memory.
                            unsafe { ptr::copy(src as *const u8, dst as *mut u8, len as usize) };
                        }
                        match imm {
                            Some(_) => self.deliver(remote_qp, None, len, imm, true),
                            None => WC_SUCCESS,
                        }
                    }
                    Err(status) => status,
                }
            }
            SendOp::Send { imm } => self.deliver(remote_qp, local, len, imm, false),
            SendOp::AtomicWrite { remote, value } => {
                match self.remote_buf(&remote, value.len() as u64, Access::REMOTE_WRITE) {
                    Ok(dst) => {
                        // SAFETY: the range lies in registered memory.
                        unsafe { ptr::copy(value.as_ptr(), dst as *mut u8, value.len()) };
                        WC_SUCCESS
                    }
                    Err(status) => status,
                }
            }
            SendOp::Flush { remote, len, .. } => {
                match self.remote_buf(&remote, len, Access::EMPTY) {
                    Ok(_) => WC_SUCCESS,
                    Err(status) => status,
                }
            }
        };
        (opcode, status)
    }
}

/// In-process loopback provider with one device.
pub struct FakeProvider {
    device: DeviceHandle,
    state: Mutex<State>,
}

impl FakeProvider {
    /// Create a fabric.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        let mut state = State::default();
        let device = state.handle();
        Arc::new(Self {
            device,
            state: Mutex::new(state),
        })
    }

    /// Get the only device of the fabric.
    #[inline]
    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    /// Create a peer on the device.
    ///
    /// # Panics
    ///
    /// Panics if the protection domain cannot be allocated.
    pub fn peer(self: &Arc<Self>) -> Peer {
        Peer::new(self.clone(), self.device).expect("fake fabric cannot allocate a PD")
    }

    /// Set the capabilities reported for the device from now on.
    pub fn set_caps(&self, caps: DeviceCaps) {
        self.lock().caps = caps;
    }

    /// Get the number of calls made to the named method.
    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    /// Make the next call of the named method fail with `code`.
    pub fn fail_next(&self, method: &'static str, code: i32) {
        self.lock().failures.insert(method, code);
    }

    /// Make the next poll report one completion more than requested.
    pub fn overreport_next_poll(&self) {
        self.lock().overreport = true;
    }

    /// Get the access flags of the last registration attempt.
    pub fn last_access(&self) -> Access {
        self.lock().last_access
    }

    /// Get the number of connection-manager events fetched but not yet
    /// acknowledged.
    pub fn unacked_events(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Get the number of live objects, excluding protection domains.
    pub fn live_objects(&self) -> usize {
        let st = self.lock();
        st.mrs.len()
            + st.comp_channels.len()
            + st.cqs.len()
            + st.srqs.len()
            + st.qps.len()
            + st.event_channels.len()
            + st.ids.len()
    }

    /// Deliver a connection-manager event to the connection identified by
    /// `unique_id`.
    pub fn inject_event(&self, unique_id: u64, kind: CmEventKind) {
        let Some(raw) = NonZeroUsize::new(unique_id as usize) else {
            return;
        };
        self.lock()
            .push_event(CmIdHandle::from_raw(raw), kind, None, &[]);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test must not poison the other checks of its fabric.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count a call and apply a pending failure.
    fn enter(&self, method: &'static str) -> io::Result<MutexGuard<'_, State>> {
        let mut st = self.lock();
        *st.calls.entry(method).or_default() += 1;
        match st.failures.remove(method) {
            Some(code) => Err(errno(code)),
            None => Ok(st),
        }
    }
}

impl Provider for FakeProvider {
    fn lookup_device(&self, _addr: SocketAddr, _kind: AddrKind) -> io::Result<DeviceHandle> {
        self.enter("lookup_device")?;
        Ok(self.device)
    }

    fn query_device(&self, dev: DeviceHandle) -> io::Result<DeviceCaps> {
        let st = self.enter("query_device")?;
        if dev != self.device {
            return Err(errno(libc::ENODEV));
        }
        Ok(st.caps)
    }

    fn alloc_pd(&self, _dev: DeviceHandle) -> io::Result<PdHandle> {
        let mut st = self.enter("alloc_pd")?;
        let pd = st.handle();
        st.pds.insert(pd);
        Ok(pd)
    }

    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()> {
        let mut st = self.enter("dealloc_pd")?;
        from_c_ret(if st.pds.remove(&pd) { 0 } else { libc::EINVAL })
    }

    fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        len: usize,
        access: Access,
    ) -> io::Result<RegisteredMr> {
        let mut st = self.lock();
        st.last_access = access;
        drop(st);
        let mut st = self.enter("reg_mr")?;
        if !st.pds.contains(&pd) || addr.is_null() || len == 0 {
            return Err(errno(libc::EINVAL));
        }
        let handle = st.handle::<MrHandle>();
        let key = handle.as_raw().get() as u32;
        st.mrs.insert(
            handle,
            FakeMr {
                addr: addr as usize,
                len,
                access,
                key,
            },
        );
        Ok(RegisteredMr {
            handle,
            lkey: key,
            rkey: key,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> io::Result<()> {
        let mut st = self.enter("dereg_mr")?;
        from_c_ret(if st.mrs.remove(&mr).is_some() { 0 } else { libc::EINVAL })
    }

    fn create_comp_channel(&self, _dev: DeviceHandle) -> io::Result<CompChannelHandle> {
        let mut st = self.enter("create_comp_channel")?;
        let channel = st.handle();
        st.comp_channels.insert(channel, VecDeque::new());
        Ok(channel)
    }

    fn destroy_comp_channel(&self, channel: CompChannelHandle) -> io::Result<()> {
        let mut st = self.enter("destroy_comp_channel")?;
        if st.cqs.values().any(|cq| cq.channel == Some(channel)) {
            return Err(errno(libc::EBUSY));
        }
        from_c_ret(if st.comp_channels.remove(&channel).is_some() { 0 } else { libc::EINVAL })
    }

    fn comp_channel_fd(&self, channel: CompChannelHandle) -> RawFd {
        drop(self.enter("comp_channel_fd"));
        FD_BASE + channel.as_raw().get() as RawFd
    }

    fn create_cq(
        &self,
        _dev: DeviceHandle,
        cqe: u32,
        channel: Option<CompChannelHandle>,
    ) -> io::Result<CqHandle> {
        let mut st = self.enter("create_cq")?;
        if cqe == 0 || channel.is_some_and(|ch| !st.comp_channels.contains_key(&ch)) {
            return Err(errno(libc::EINVAL));
        }
        let cq = st.handle();
        st.cqs.insert(
            cq,
            FakeCq {
                channel,
                ..Default::default()
            },
        );
        Ok(cq)
    }

    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()> {
        let mut st = self.enter("destroy_cq")?;
        if st.qps.values().any(|qp| qp.send_cq == cq || qp.recv_cq == cq) {
            return Err(errno(libc::EBUSY));
        }
        from_c_ret(if st.cqs.remove(&cq).is_some() { 0 } else { libc::EINVAL })
    }

    fn req_notify_cq(&self, cq: CqHandle, _solicited_only: bool) -> io::Result<()> {
        let mut st = self.enter("req_notify_cq")?;
        let fake_cq = st.cqs.get_mut(&cq).ok_or_else(|| errno(libc::EINVAL))?;
        fake_cq.armed = true;
        Ok(())
    }

    fn get_cq_event(&self, channel: CompChannelHandle) -> io::Result<CqHandle> {
        let mut st = self.enter("get_cq_event")?;
        let queue = st
            .comp_channels
            .get_mut(&channel)
            .ok_or_else(|| errno(libc::EINVAL))?;
        queue.pop_front().ok_or_else(|| errno(libc::EAGAIN))
    }

    fn ack_cq_events(&self, _cq: CqHandle, _num: u32) {
        drop(self.enter("ack_cq_events"));
    }

    fn poll_cq(&self, cq: CqHandle, wc: &mut [RawCompletion]) -> io::Result<usize> {
        let mut st = self.enter("poll_cq")?;
        if std::mem::take(&mut st.overreport) {
            return Ok(wc.len() + 1);
        }
        let fake_cq = st.cqs.get_mut(&cq).ok_or_else(|| errno(libc::EINVAL))?;
        let mut num = 0;
        for slot in wc.iter_mut() {
            match fake_cq.entries.pop_front() {
                Some(entry) => {
                    *slot = entry;
                    num += 1;
                }
                None => break,
            }
        }
        Ok(num)
    }

    fn create_srq(&self, pd: PdHandle, max_wr: u32, _max_sge: u32) -> io::Result<SrqHandle> {
        let mut st = self.enter("create_srq")?;
        if !st.pds.contains(&pd) || max_wr == 0 {
            return Err(errno(libc::EINVAL));
        }
        let srq = st.handle();
        st.srqs.insert(srq, VecDeque::new());
        Ok(srq)
    }

    fn destroy_srq(&self, srq: SrqHandle) -> io::Result<()> {
        let mut st = self.enter("destroy_srq")?;
        if st.qps.values().any(|qp| qp.srq == Some(srq)) {
            return Err(errno(libc::EBUSY));
        }
        from_c_ret(if st.srqs.remove(&srq).is_some() { 0 } else { libc::EINVAL })
    }

    fn post_srq_recv(&self, srq: SrqHandle, wr: &RecvRequest) -> io::Result<()> {
        let mut st = self.enter("post_srq_recv")?;
        if wr.sge.is_some_and(|sge| st.mr_by_key(sge.lkey).is_none()) {
            return Err(errno(libc::EINVAL));
        }
        let queue = st.srqs.get_mut(&srq).ok_or_else(|| errno(libc::EINVAL))?;
        queue.push_back(*wr);
        Ok(())
    }

    fn create_qp(&self, id: CmIdHandle, pd: PdHandle, attr: &QpInitAttr) -> io::Result<QpHandle> {
        let mut st = self.enter("create_qp")?;
        let valid = st.pds.contains(&pd)
            && st.cqs.contains_key(&attr.send_cq)
            && st.cqs.contains_key(&attr.recv_cq)
            && attr.srq.map_or(true, |srq| st.srqs.contains_key(&srq))
            && st.ids.get(&id).is_some_and(|id| id.qp.is_none());
        if !valid {
            return Err(errno(libc::EINVAL));
        }
        let qp = st.handle::<QpHandle>();
        st.qps.insert(
            qp,
            FakeQp {
                id,
                num: qp.as_raw().get() as u32,
                send_cq: attr.send_cq,
                recv_cq: attr.recv_cq,
                srq: attr.srq,
                rq: VecDeque::new(),
            },
        );
        if let Some(fake_id) = st.ids.get_mut(&id) {
            fake_id.qp = Some(qp);
        }
        Ok(qp)
    }

    fn destroy_qp(&self, id: CmIdHandle) -> io::Result<()> {
        let mut st = self.enter("destroy_qp")?;
        let qp = st
            .ids
            .get_mut(&id)
            .and_then(|id| id.qp.take())
            .ok_or_else(|| errno(libc::EINVAL))?;
        st.qps.remove(&qp);
        Ok(())
    }

    fn qp_num(&self, qp: QpHandle) -> u32 {
        let st = self.lock();
        st.qps.get(&qp).map_or(0, |qp| qp.num)
    }

    fn post_send(&self, qp: QpHandle, wr: &SendRequest) -> io::Result<()> {
        let mut st = self.enter("post_send")?;
        let (send_cq, num) = match st.qps.get(&qp) {
            Some(fake_qp) => (fake_qp.send_cq, fake_qp.num),
            None => return Err(errno(libc::EINVAL)),
        };
        let (opcode, status) = st.execute(qp, wr);
        if wr.signaled || status != WC_SUCCESS {
            st.complete(
                send_cq,
                RawCompletion {
                    wr_id: wr.wr_id,
                    status,
                    opcode,
                    qp_num: num,
                    ..Default::default()
                },
            );
        }
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvRequest) -> io::Result<()> {
        let mut st = self.enter("post_recv")?;
        if wr.sge.is_some_and(|sge| st.mr_by_key(sge.lkey).is_none()) {
            return Err(errno(libc::EINVAL));
        }
        let fake_qp = st.qps.get_mut(&qp).ok_or_else(|| errno(libc::EINVAL))?;
        if fake_qp.srq.is_some() {
            return Err(errno(libc::EINVAL));
        }
        fake_qp.rq.push_back(*wr);
        Ok(())
    }

    fn create_event_channel(&self) -> io::Result<EventChannelHandle> {
        let mut st = self.enter("create_event_channel")?;
        let channel = st.handle();
        st.event_channels.insert(channel, VecDeque::new());
        Ok(channel)
    }

    fn destroy_event_channel(&self, channel: EventChannelHandle) -> io::Result<()> {
        let mut st = self.enter("destroy_event_channel")?;
        if st.ids.values().any(|id| id.channel == Some(channel)) {
            return Err(errno(libc::EBUSY));
        }
        from_c_ret(if st.event_channels.remove(&channel).is_some() { 0 } else { libc::EINVAL })
    }

    fn event_channel_fd(&self, channel: EventChannelHandle) -> RawFd {
        drop(self.enter("event_channel_fd"));
        FD_BASE + channel.as_raw().get() as RawFd
    }

    fn create_id(&self, channel: Option<EventChannelHandle>) -> io::Result<CmIdHandle> {
        let mut st = self.enter("create_id")?;
        if channel.is_some_and(|ch| !st.event_channels.contains_key(&ch)) {
            return Err(errno(libc::EINVAL));
        }
        let id = st.handle();
        st.ids.insert(
            id,
            FakeId {
                channel,
                ..Default::default()
            },
        );
        Ok(id)
    }

    fn destroy_id(&self, id: CmIdHandle) -> io::Result<()> {
        let mut st = self.enter("destroy_id")?;
        let fake_id = st.ids.get(&id).ok_or_else(|| errno(libc::EINVAL))?;
        if fake_id.qp.is_some() {
            return Err(errno(libc::EBUSY));
        }
        let (peer, established) = (fake_id.peer, fake_id.established);
        st.ids.remove(&id);
        st.listeners.retain(|_, listener| *listener != id);
        if let Some(peer) = peer {
            if let Some(peer_id) = st.ids.get_mut(&peer) {
                peer_id.peer = None;
                peer_id.established = false;
            }
            let kind = if established {
                CmEventKind::Disconnected
            } else {
                CmEventKind::Rejected
            };
            st.push_event(peer, kind, None, &[]);
        }
        Ok(())
    }

    fn id_device(&self, id: CmIdHandle) -> Option<DeviceHandle> {
        let st = self.lock();
        let fake_id = st.ids.get(&id)?;
        (fake_id.bound.is_some() || fake_id.dst.is_some() || fake_id.peer.is_some())
            .then_some(self.device)
    }

    fn resolve_route(&self, id: CmIdHandle, addr: SocketAddr, timeout_ms: i32) -> io::Result<()> {
        let mut st = self.enter("resolve_route")?;
        if timeout_ms <= 0 {
            return Err(errno(libc::EINVAL));
        }
        let fake_id = st.ids.get_mut(&id).ok_or_else(|| errno(libc::EINVAL))?;
        fake_id.dst = Some(addr);
        Ok(())
    }

    fn migrate_id(&self, id: CmIdHandle, channel: EventChannelHandle) -> io::Result<()> {
        let mut st = self.enter("migrate_id")?;
        if !st.event_channels.contains_key(&channel) {
            return Err(errno(libc::EINVAL));
        }
        let fake_id = st.ids.get_mut(&id).ok_or_else(|| errno(libc::EINVAL))?;
        fake_id.channel = Some(channel);
        Ok(())
    }

    fn bind_addr(&self, id: CmIdHandle, addr: SocketAddr) -> io::Result<()> {
        let mut st = self.enter("bind_addr")?;
        let fake_id = st.ids.get_mut(&id).ok_or_else(|| errno(libc::EINVAL))?;
        fake_id.bound = Some(addr);
        Ok(())
    }

    fn listen(&self, id: CmIdHandle, _backlog: i32) -> io::Result<()> {
        let mut st = self.enter("listen")?;
        let addr = st
            .ids
            .get(&id)
            .and_then(|id| id.bound)
            .ok_or_else(|| errno(libc::EINVAL))?;
        if st.listeners.contains_key(&addr) {
            return Err(errno(libc::EADDRINUSE));
        }
        st.listeners.insert(addr, id);
        Ok(())
    }

    fn connect(&self, id: CmIdHandle, private_data: &[u8]) -> io::Result<()> {
        let mut st = self.enter("connect")?;
        if private_data.len() > 56 {
            return Err(errno(libc::EINVAL));
        }
        let dst = st
            .ids
            .get(&id)
            .and_then(|id| id.dst)
            .ok_or_else(|| errno(libc::EINVAL))?;

        let Some(listener) = st.listeners.get(&dst).copied() else {
            st.push_event(id, CmEventKind::Rejected, None, &[]);
            return Ok(());
        };
        let server = st.handle::<CmIdHandle>();
        let listen_channel = st.channel_of(listener);
        st.ids.insert(
            server,
            FakeId {
                channel: listen_channel,
                bound: Some(dst),
                peer: Some(id),
                ..Default::default()
            },
        );
        if let Some(client) = st.ids.get_mut(&id) {
            client.peer = Some(server);
        }
        st.push_event(server, CmEventKind::ConnectRequest, Some(listener), private_data);
        Ok(())
    }

    fn accept(&self, id: CmIdHandle, private_data: &[u8]) -> io::Result<()> {
        let mut st = self.enter("accept")?;
        if private_data.len() > 196 {
            return Err(errno(libc::EINVAL));
        }
        let client = match st.ids.get(&id) {
            Some(FakeId {
                peer: Some(peer),
                qp: Some(_),
                ..
            }) => *peer,
            _ => return Err(errno(libc::EINVAL)),
        };
        for end in [id, client] {
            if let Some(fake_id) = st.ids.get_mut(&end) {
                fake_id.established = true;
            }
        }
        st.push_event(client, CmEventKind::Established, None, private_data);
        st.push_event(id, CmEventKind::Established, None, &[]);
        Ok(())
    }

    fn reject(&self, id: CmIdHandle, private_data: &[u8]) -> io::Result<()> {
        let mut st = self.enter("reject")?;
        let client = st
            .ids
            .get_mut(&id)
            .and_then(|id| id.peer.take())
            .ok_or_else(|| errno(libc::EINVAL))?;
        if let Some(client_id) = st.ids.get_mut(&client) {
            client_id.peer = None;
        }
        st.push_event(client, CmEventKind::Rejected, None, private_data);
        Ok(())
    }

    fn disconnect(&self, id: CmIdHandle) -> io::Result<()> {
        let mut st = self.enter("disconnect")?;
        let fake_id = st.ids.get_mut(&id).ok_or_else(|| errno(libc::EINVAL))?;
        let Some(peer) = fake_id.peer.take() else {
            return Ok(());
        };
        fake_id.established = false;
        if let Some(peer_id) = st.ids.get_mut(&peer) {
            peer_id.peer = None;
            peer_id.established = false;
        }
        st.push_event(id, CmEventKind::Disconnected, None, &[]);
        st.push_event(peer, CmEventKind::Disconnected, None, &[]);
        Ok(())
    }

    fn get_cm_event(&self, channel: EventChannelHandle) -> io::Result<RawCmEvent> {
        let mut st = self.enter("get_cm_event")?;
        let queue = st
            .event_channels
            .get_mut(&channel)
            .ok_or_else(|| errno(libc::EINVAL))?;
        let event = queue.pop_front().ok_or_else(|| errno(libc::EAGAIN))?;
        st.unacked.insert(event.handle);
        Ok(event)
    }

    fn ack_cm_event(&self, event: CmEventHandle) -> io::Result<()> {
        let mut st = self.enter("ack_cm_event")?;
        from_c_ret(if st.unacked.remove(&event) { 0 } else { libc::EINVAL })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_distinct_per_fabric() {
        let a = FakeProvider::new();
        let b = FakeProvider::new();
        let pd_a = a.alloc_pd(a.device()).unwrap();
        let pd_b = b.alloc_pd(b.device()).unwrap();
        assert_ne!(pd_a.as_raw(), a.device().as_raw());
        assert_eq!(a.calls("alloc_pd"), 1);
        assert_eq!(b.calls("alloc_pd"), 1);
        a.dealloc_pd(pd_a).unwrap();
        assert!(a.dealloc_pd(pd_a).is_err());
        b.dealloc_pd(pd_b).unwrap();
    }

    #[test]
    fn failure_injection_is_one_shot() {
        let fake = FakeProvider::new();
        fake.fail_next("create_event_channel", libc::EMFILE);
        let err = fake.create_event_channel().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EMFILE));
        let channel = fake.create_event_channel().unwrap();
        assert_eq!(fake.calls("create_event_channel"), 2);
        assert!(is_would_block(&fake.get_cm_event(channel).unwrap_err()));
        fake.destroy_event_channel(channel).unwrap();
        assert_eq!(fake.live_objects(), 0);
    }

    #[test]
    fn cq_refuses_destroy_while_in_use() {
        let fake = FakeProvider::new();
        let pd = fake.alloc_pd(fake.device()).unwrap();
        let cq = fake.create_cq(fake.device(), 4, None).unwrap();
        let id = fake.create_id(None).unwrap();
        let attr = QpInitAttr {
            send_cq: cq,
            recv_cq: cq,
            srq: None,
            max_send_wr: 4,
            max_recv_wr: 4,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 8,
            native_flush: false,
            native_atomic_write: false,
        };
        fake.create_qp(id, pd, &attr).unwrap();
        assert_eq!(fake.destroy_cq(cq).unwrap_err().raw_os_error(), Some(libc::EBUSY));
        assert_eq!(fake.destroy_id(id).unwrap_err().raw_os_error(), Some(libc::EBUSY));
        fake.destroy_qp(id).unwrap();
        fake.destroy_cq(cq).unwrap();
        fake.destroy_id(id).unwrap();
        fake.dealloc_pd(pd).unwrap();
    }
}
