//! Provider backed by `libibverbs` and `librdmacm`.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::os::raw::c_void;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::{io, mem, slice};

use super::*;
use crate::bindings::*;
use crate::utils::interop::{from_c_errno, from_c_ret, from_c_ret_explained};

/// Timeout of the address resolution done by device lookup.
const LOOKUP_TIMEOUT_MS: i32 = 1000;

/// Retries of the connection manager on transport and RNR errors.
const RETRY_COUNT: u8 = 7;

/// Most completions one poll asks the hardware for.
const POLL_BATCH: usize = 16;

fn err(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// `ibv_poll_cq` returns the number of completions, or a negated errno.
fn poll_count(ret: i32) -> io::Result<usize> {
    if ret < 0 {
        Err(err(-ret))
    } else {
        Ok(ret as usize)
    }
}

fn non_null<T>(ptr: *mut T) -> io::Result<NonNull<T>> {
    NonNull::new(ptr).ok_or_else(io::Error::last_os_error)
}

/// Socket address in the C layout.
fn sockaddr_of(addr: SocketAddr) -> libc::sockaddr_storage {
    // SAFETY: all-zero is a valid `sockaddr_storage`.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: `sockaddr_storage` is large and aligned enough for any
            // socket address.
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
        }
        SocketAddr::V6(v6) => {
            // SAFETY: as above.
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
        }
    }
    storage
}

fn cm_event_kind(event: rdma_cm_event_type::Type) -> Option<CmEventKind> {
    use rdma_cm_event_type::*;

    let kind = match event {
        RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
        RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
        RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
        RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
        RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
        RDMA_CM_EVENT_CONNECT_RESPONSE => CmEventKind::ConnectResponse,
        RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
        RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
        RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
        RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
        RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
        RDMA_CM_EVENT_DEVICE_REMOVAL => CmEventKind::DeviceRemoval,
        RDMA_CM_EVENT_MULTICAST_JOIN => CmEventKind::MulticastJoin,
        RDMA_CM_EVENT_MULTICAST_ERROR => CmEventKind::MulticastError,
        RDMA_CM_EVENT_ADDR_CHANGE => CmEventKind::AddrChange,
        RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventKind::TimewaitExit,
        _ => return None,
    };
    Some(kind)
}

fn conn_param(private_data: &[u8]) -> io::Result<rdma_conn_param> {
    let len = u8::try_from(private_data.len()).map_err(|_| err(libc::EINVAL))?;

    // SAFETY: all-zero is a valid `rdma_conn_param`.
    let mut param: rdma_conn_param = unsafe { mem::zeroed() };
    if len > 0 {
        param.private_data = private_data.as_ptr() as *const c_void;
        param.private_data_len = len;
    }
    param.responder_resources = RDMA_MAX_RESP_RES;
    param.initiator_depth = RDMA_MAX_INIT_DEPTH;
    param.flow_control = 1;
    param.retry_count = RETRY_COUNT;
    param.rnr_retry_count = RETRY_COUNT;
    Ok(param)
}

fn send_flags(wr: &SendRequest) -> u32 {
    let mut flags = 0;
    if wr.signaled {
        flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
    }
    if wr.fence {
        flags |= ibv_send_flags::IBV_SEND_FENCE.0;
    }
    if wr.inline {
        flags |= ibv_send_flags::IBV_SEND_INLINE.0;
    }
    flags
}

fn raw_sge(sge: Option<Sge>) -> Option<ibv_sge> {
    sge.map(|sge| ibv_sge {
        addr: sge.addr,
        length: sge.len,
        lkey: sge.lkey,
    })
}

fn raw_completion(wc: &ibv_wc) -> RawCompletion {
    let imm = (wc.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0)
        // SAFETY: the flag says the union holds immediate data.
        .then(|| u32::from_be(unsafe { wc.__bindgen_anon_1.imm_data }));
    RawCompletion {
        wr_id: wc.wr_id,
        status: wc.status,
        opcode: wc.opcode,
        vendor_err: wc.vendor_err,
        byte_len: wc.byte_len,
        imm,
        qp_num: wc.qp_num,
    }
}

/// Post one request through the extended send API.
#[cfg(rdma_core_flush)]
unsafe fn post_ex(
    qp: *mut ibv_qp,
    wr: &SendRequest,
    build: impl FnOnce(*mut ibv_qp_ex) -> i32,
) -> io::Result<()> {
    let qpx = ibv_qp_to_qp_ex(qp);
    if qpx.is_null() {
        return Err(err(libc::EOPNOTSUPP));
    }
    from_c_ret(ibv_wr_start(qpx))?;
    (*qpx).wr_id = wr.wr_id;
    (*qpx).wr_flags = send_flags(wr);
    if let Err(e) = from_c_ret(build(qpx)) {
        ibv_wr_abort(qpx);
        return Err(e);
    }
    from_c_ret(ibv_wr_complete(qpx))
}

/// The rdma-core provider.
///
/// Device contexts are the ones opened by `librdmacm`, which keeps them open
/// for the life of the process.
#[derive(Debug, Default)]
pub struct RdmaCore {
    _priv: (),
}

impl RdmaCore {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[cfg(rdma_core_flush)]
    fn post_native(&self, qp: *mut ibv_qp, wr: &SendRequest) -> io::Result<()> {
        match wr.op {
            SendOp::AtomicWrite { remote, value } => unsafe {
                // SAFETY: the builder copies the 8 bytes before returning.
                post_ex(qp, wr, |qpx| {
                    ibv_wr_atomic_write(qpx, remote.rkey, remote.addr, value.as_ptr() as _)
                })
            },
            SendOp::Flush {
                remote,
                len,
                placement,
            } => {
                let placement = match placement {
                    FlushPlacement::Global => IBV_FLUSH_GLOBAL,
                    FlushPlacement::Persistent => IBV_FLUSH_PERSISTENT,
                };
                // SAFETY: `qp` is a live queue pair.
                unsafe {
                    post_ex(qp, wr, |qpx| {
                        ibv_wr_flush(
                            qpx,
                            remote.rkey,
                            remote.addr,
                            len as usize,
                            placement,
                            IBV_FLUSH_RANGE,
                        )
                    })
                }
            }
            _ => Err(err(libc::EINVAL)),
        }
    }

    #[cfg(not(rdma_core_flush))]
    fn post_native(&self, _qp: *mut ibv_qp, _wr: &SendRequest) -> io::Result<()> {
        Err(err(libc::EOPNOTSUPP))
    }
}

impl Provider for RdmaCore {
    fn lookup_device(&self, addr: SocketAddr, kind: AddrKind) -> io::Result<DeviceHandle> {
        let mut id = ptr::null_mut();
        let mut sa = sockaddr_of(addr);
        // SAFETY: FFI. The temporary identifier is destroyed before return.
        unsafe {
            from_c_errno(rdma_create_id(
                ptr::null_mut(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            ))?;
            let sa = &mut sa as *mut _ as *mut sockaddr;
            let ret = match kind {
                AddrKind::Local => rdma_bind_addr(id, sa),
                AddrKind::Remote => rdma_resolve_addr(id, ptr::null_mut(), sa, LOOKUP_TIMEOUT_MS),
            };
            let dev = from_c_errno(ret)
                .and_then(|()| NonNull::new((*id).verbs).ok_or_else(|| err(libc::ENODEV)));
            rdma_destroy_id(id);
            dev.map(DeviceHandle::from)
        }
    }

    fn query_device(&self, dev: DeviceHandle) -> io::Result<DeviceCaps> {
        let ctx = dev.as_ptr::<ibv_context>();
        // SAFETY: all-zero is a valid attribute buffer, `ctx` is open.
        unsafe {
            let mut attr: ibv_device_attr_ex = mem::zeroed();
            from_c_ret(ibv_query_device_ex(ctx, ptr::null(), &mut attr))?;

            let odp = attr.odp_caps.general_caps & IBV_ODP_SUPPORT != 0
                && attr.odp_caps.per_transport_caps.rc_odp_caps & IBV_ODP_SUPPORT_RC_ALL
                    == IBV_ODP_SUPPORT_RC_ALL;
            let flush = IBV_DEVICE_FLUSH_GLOBAL | IBV_DEVICE_FLUSH_PERSISTENT;
            let iwarp = (*(*ctx).device).transport_type == ibv_transport_type::IBV_TRANSPORT_IWARP;

            Ok(DeviceCaps {
                native_flush: cfg!(rdma_core_flush) && attr.device_cap_flags_ex & flush == flush,
                native_atomic_write: cfg!(rdma_core_flush)
                    && attr.device_cap_flags_ex & IBV_DEVICE_ATOMIC_WRITE != 0,
                odp,
                iwarp,
            })
        }
    }

    fn alloc_pd(&self, dev: DeviceHandle) -> io::Result<PdHandle> {
        // SAFETY: FFI.
        let pd = unsafe { ibv_alloc_pd(dev.as_ptr()) };
        non_null(pd).map(PdHandle::from)
    }

    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { ibv_dealloc_pd(pd.as_ptr()) };
        from_c_ret_explained(ret, |code| {
            (code == libc::EBUSY).then_some("PD still has registered memory or queues")
        })
    }

    fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        len: usize,
        access: Access,
    ) -> io::Result<RegisteredMr> {
        // SAFETY: FFI. The caller keeps the memory alive while registered.
        let mr = unsafe { ibv_reg_mr(pd.as_ptr(), addr as *mut c_void, len, access.0 as i32) };
        let mr = non_null(mr)?;
        // SAFETY: `mr` was just registered.
        let (lkey, rkey) = unsafe { (mr.as_ref().lkey, mr.as_ref().rkey) };
        Ok(RegisteredMr {
            handle: MrHandle::from(mr),
            lkey,
            rkey,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dereg_mr(mr.as_ptr()) })
    }

    fn create_comp_channel(&self, dev: DeviceHandle) -> io::Result<CompChannelHandle> {
        // SAFETY: FFI.
        let channel = unsafe { ibv_create_comp_channel(dev.as_ptr()) };
        non_null(channel).map(CompChannelHandle::from)
    }

    fn destroy_comp_channel(&self, channel: CompChannelHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_comp_channel(channel.as_ptr()) })
    }

    fn comp_channel_fd(&self, channel: CompChannelHandle) -> RawFd {
        // SAFETY: the channel is live.
        unsafe { (*channel.as_ptr::<ibv_comp_channel>()).fd }
    }

    fn create_cq(
        &self,
        dev: DeviceHandle,
        cqe: u32,
        channel: Option<CompChannelHandle>,
    ) -> io::Result<CqHandle> {
        let cqe = i32::try_from(cqe).map_err(|_| err(libc::EINVAL))?;
        let channel = channel.map_or(ptr::null_mut(), |ch| ch.as_ptr());
        // SAFETY: FFI.
        let cq = unsafe { ibv_create_cq(dev.as_ptr(), cqe, ptr::null_mut(), channel, 0) };
        non_null(cq).map(CqHandle::from)
    }

    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()> {
        // SAFETY: FFI.
        let ret = unsafe { ibv_destroy_cq(cq.as_ptr()) };
        from_c_ret_explained(ret, |code| {
            (code == libc::EBUSY).then_some("CQ is still used by a QP or has unacked events")
        })
    }

    fn req_notify_cq(&self, cq: CqHandle, solicited_only: bool) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_req_notify_cq(cq.as_ptr(), solicited_only as i32) })
    }

    fn get_cq_event(&self, channel: CompChannelHandle) -> io::Result<CqHandle> {
        let mut cq = ptr::null_mut();
        let mut ctx = ptr::null_mut();
        // SAFETY: FFI.
        from_c_errno(unsafe { ibv_get_cq_event(channel.as_ptr(), &mut cq, &mut ctx) })?;
        NonNull::new(cq)
            .map(CqHandle::from)
            .ok_or_else(|| err(libc::EIO))
    }

    fn ack_cq_events(&self, cq: CqHandle, num: u32) {
        // SAFETY: FFI.
        unsafe { ibv_ack_cq_events(cq.as_ptr(), num) }
    }

    fn poll_cq(&self, cq: CqHandle, wc: &mut [RawCompletion]) -> io::Result<usize> {
        let num = wc.len().min(POLL_BATCH);
        // SAFETY: all-zero is a valid `ibv_wc`.
        let mut raw: [ibv_wc; POLL_BATCH] = unsafe { mem::zeroed() };
        // SAFETY: `raw` holds at least `num` entries.
        let ret = unsafe { ibv_poll_cq(cq.as_ptr(), num as i32, raw.as_mut_ptr()) };
        let ret = poll_count(ret)?;
        for (dst, src) in wc.iter_mut().zip(&raw[..ret.min(num)]) {
            *dst = raw_completion(src);
        }
        Ok(ret)
    }

    fn create_srq(&self, pd: PdHandle, max_wr: u32, max_sge: u32) -> io::Result<SrqHandle> {
        let mut attr = ibv_srq_init_attr {
            srq_context: ptr::null_mut(),
            attr: ibv_srq_attr {
                max_wr,
                max_sge,
                srq_limit: 0,
            },
        };
        // SAFETY: FFI.
        let srq = unsafe { ibv_create_srq(pd.as_ptr(), &mut attr) };
        non_null(srq).map(SrqHandle::from)
    }

    fn destroy_srq(&self, srq: SrqHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_srq(srq.as_ptr()) })
    }

    fn post_srq_recv(&self, srq: SrqHandle, wr: &RecvRequest) -> io::Result<()> {
        let mut sge = raw_sge(wr.sge);
        // SAFETY: all-zero is a valid `ibv_recv_wr`.
        let mut raw: ibv_recv_wr = unsafe { mem::zeroed() };
        raw.wr_id = wr.wr_id;
        if let Some(sge) = sge.as_mut() {
            raw.sg_list = sge;
            raw.num_sge = 1;
        }
        let mut bad = ptr::null_mut();
        // SAFETY: `raw` and `sge` outlive the call.
        from_c_ret(unsafe { ibv_post_srq_recv(srq.as_ptr(), &mut raw, &mut bad) })
    }

    fn create_qp(&self, id: CmIdHandle, pd: PdHandle, attr: &QpInitAttr) -> io::Result<QpHandle> {
        let id = id.as_ptr::<rdma_cm_id>();
        // SAFETY: all-zero is a valid `ibv_qp_init_attr_ex`.
        let mut init: ibv_qp_init_attr_ex = unsafe { mem::zeroed() };
        init.send_cq = attr.send_cq.as_ptr();
        init.recv_cq = attr.recv_cq.as_ptr();
        init.srq = attr.srq.map_or(ptr::null_mut(), |srq| srq.as_ptr());
        init.cap = ibv_qp_cap {
            max_send_wr: attr.max_send_wr,
            max_recv_wr: attr.max_recv_wr,
            max_send_sge: attr.max_send_sge,
            max_recv_sge: attr.max_recv_sge,
            max_inline_data: attr.max_inline_data,
        };
        init.qp_type = ibv_qp_type::IBV_QPT_RC;
        init.sq_sig_all = 0;
        init.comp_mask = IBV_QP_INIT_ATTR_PD;
        init.pd = pd.as_ptr();

        if attr.native_flush || attr.native_atomic_write {
            init.comp_mask |= IBV_QP_INIT_ATTR_SEND_OPS_FLAGS;
            init.send_ops_flags = IBV_QP_EX_WITH_RDMA_WRITE
                | IBV_QP_EX_WITH_RDMA_WRITE_WITH_IMM
                | IBV_QP_EX_WITH_SEND
                | IBV_QP_EX_WITH_SEND_WITH_IMM
                | IBV_QP_EX_WITH_RDMA_READ;
            if attr.native_flush {
                init.send_ops_flags |= IBV_QP_EX_WITH_FLUSH;
            }
            if attr.native_atomic_write {
                init.send_ops_flags |= IBV_QP_EX_WITH_ATOMIC_WRITE;
            }
        }

        // SAFETY: FFI. On success the QP hangs off the identifier.
        unsafe {
            from_c_errno(rdma_create_qp_ex(id, &mut init))?;
            NonNull::new((*id).qp)
                .map(QpHandle::from)
                .ok_or_else(|| err(libc::EIO))
        }
    }

    fn destroy_qp(&self, id: CmIdHandle) -> io::Result<()> {
        // SAFETY: FFI.
        unsafe { rdma_destroy_qp(id.as_ptr()) };
        Ok(())
    }

    fn qp_num(&self, qp: QpHandle) -> u32 {
        // SAFETY: the QP is live.
        unsafe { (*qp.as_ptr::<ibv_qp>()).qp_num }
    }

    fn post_send(&self, qp: QpHandle, wr: &SendRequest) -> io::Result<()> {
        use ibv_wr_opcode::*;

        let qp = qp.as_ptr::<ibv_qp>();
        let (opcode, remote, imm) = match wr.op {
            SendOp::Read { remote } => (IBV_WR_RDMA_READ, Some(remote), None),
            SendOp::Write { remote, imm: None } => (IBV_WR_RDMA_WRITE, Some(remote), None),
            SendOp::Write {
                remote,
                imm: Some(imm),
            } => (IBV_WR_RDMA_WRITE_WITH_IMM, Some(remote), Some(imm)),
            SendOp::Send { imm: None } => (IBV_WR_SEND, None, None),
            SendOp::Send { imm: Some(imm) } => (IBV_WR_SEND_WITH_IMM, None, Some(imm)),
            SendOp::AtomicWrite { .. } | SendOp::Flush { .. } => {
                return self.post_native(qp, wr);
            }
        };

        let mut sge = raw_sge(wr.sge);
        // SAFETY: all-zero is a valid `ibv_send_wr`; `raw` and `sge` outlive
        // the call, and inline payloads are copied by it.
        unsafe {
            let mut raw: ibv_send_wr = mem::zeroed();
            raw.wr_id = wr.wr_id;
            if let Some(sge) = sge.as_mut() {
                raw.sg_list = sge;
                raw.num_sge = 1;
            }
            raw.opcode = opcode;
            raw.send_flags = send_flags(wr);
            if let Some(remote) = remote {
                raw.wr.rdma.remote_addr = remote.addr;
                raw.wr.rdma.rkey = remote.rkey;
            }
            if let Some(imm) = imm {
                raw.__bindgen_anon_1.imm_data = imm.to_be();
            }
            let mut bad = ptr::null_mut();
            from_c_ret(ibv_post_send(qp, &mut raw, &mut bad))
        }
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvRequest) -> io::Result<()> {
        let mut sge = raw_sge(wr.sge);
        // SAFETY: all-zero is a valid `ibv_recv_wr`.
        let mut raw: ibv_recv_wr = unsafe { mem::zeroed() };
        raw.wr_id = wr.wr_id;
        if let Some(sge) = sge.as_mut() {
            raw.sg_list = sge;
            raw.num_sge = 1;
        }
        let mut bad = ptr::null_mut();
        // SAFETY: `raw` and `sge` outlive the call.
        from_c_ret(unsafe { ibv_post_recv(qp.as_ptr(), &mut raw, &mut bad) })
    }

    fn create_event_channel(&self) -> io::Result<EventChannelHandle> {
        // SAFETY: FFI.
        let channel = unsafe { rdma_create_event_channel() };
        non_null(channel).map(EventChannelHandle::from)
    }

    fn destroy_event_channel(&self, channel: EventChannelHandle) -> io::Result<()> {
        // SAFETY: FFI.
        unsafe { rdma_destroy_event_channel(channel.as_ptr()) };
        Ok(())
    }

    fn event_channel_fd(&self, channel: EventChannelHandle) -> RawFd {
        // SAFETY: the channel is live.
        unsafe { (*channel.as_ptr::<rdma_event_channel>()).fd }
    }

    fn create_id(&self, channel: Option<EventChannelHandle>) -> io::Result<CmIdHandle> {
        let channel = channel.map_or(ptr::null_mut(), |ch| ch.as_ptr());
        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        from_c_errno(unsafe {
            rdma_create_id(channel, &mut id, ptr::null_mut(), rdma_port_space::RDMA_PS_TCP)
        })?;
        NonNull::new(id)
            .map(CmIdHandle::from)
            .ok_or_else(|| err(libc::EIO))
    }

    fn destroy_id(&self, id: CmIdHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_destroy_id(id.as_ptr()) })
    }

    fn id_device(&self, id: CmIdHandle) -> Option<DeviceHandle> {
        // SAFETY: the identifier is live.
        let verbs = unsafe { (*id.as_ptr::<rdma_cm_id>()).verbs };
        NonNull::new(verbs).map(DeviceHandle::from)
    }

    fn resolve_route(&self, id: CmIdHandle, addr: SocketAddr, timeout_ms: i32) -> io::Result<()> {
        let mut sa = sockaddr_of(addr);
        // SAFETY: FFI. Both calls complete synchronously on an identifier
        // without an event channel.
        unsafe {
            from_c_errno(rdma_resolve_addr(
                id.as_ptr(),
                ptr::null_mut(),
                &mut sa as *mut _ as *mut sockaddr,
                timeout_ms,
            ))?;
            from_c_errno(rdma_resolve_route(id.as_ptr(), timeout_ms))
        }
    }

    fn migrate_id(&self, id: CmIdHandle, channel: EventChannelHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_migrate_id(id.as_ptr(), channel.as_ptr()) })
    }

    fn bind_addr(&self, id: CmIdHandle, addr: SocketAddr) -> io::Result<()> {
        let mut sa = sockaddr_of(addr);
        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_bind_addr(id.as_ptr(), &mut sa as *mut _ as *mut sockaddr) })
    }

    fn listen(&self, id: CmIdHandle, backlog: i32) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_listen(id.as_ptr(), backlog) })
    }

    fn connect(&self, id: CmIdHandle, private_data: &[u8]) -> io::Result<()> {
        let mut param = conn_param(private_data)?;
        // SAFETY: FFI. The private data is copied by the call.
        from_c_errno(unsafe { rdma_connect(id.as_ptr(), &mut param) })
    }

    fn accept(&self, id: CmIdHandle, private_data: &[u8]) -> io::Result<()> {
        let mut param = conn_param(private_data)?;
        // SAFETY: FFI. The private data is copied by the call.
        from_c_errno(unsafe { rdma_accept(id.as_ptr(), &mut param) })
    }

    fn reject(&self, id: CmIdHandle, private_data: &[u8]) -> io::Result<()> {
        let len = u8::try_from(private_data.len()).map_err(|_| err(libc::EINVAL))?;
        let data = match len {
            0 => ptr::null(),
            _ => private_data.as_ptr() as *const c_void,
        };
        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_reject(id.as_ptr(), data, len) })
    }

    fn disconnect(&self, id: CmIdHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_disconnect(id.as_ptr()) })
    }

    fn get_cm_event(&self, channel: EventChannelHandle) -> io::Result<RawCmEvent> {
        let mut event = ptr::null_mut();
        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_get_cm_event(channel.as_ptr(), &mut event) })?;
        let event = non_null::<rdma_cm_event>(event)?;

        // SAFETY: the event stays valid until acknowledged.
        unsafe {
            let ev = event.as_ref();
            let (Some(kind), Some(id)) = (cm_event_kind(ev.event), NonNull::new(ev.id)) else {
                log::warn!("rrpma: dropping malformed CM event {}", ev.event);
                rdma_ack_cm_event(event.as_ptr());
                return Err(err(libc::EPROTO));
            };

            let carries_pdata = matches!(
                kind,
                CmEventKind::ConnectRequest
                    | CmEventKind::ConnectResponse
                    | CmEventKind::Established
                    | CmEventKind::Rejected
            );
            let conn = &ev.param.conn;
            let private_data = if carries_pdata && !conn.private_data.is_null() {
                slice::from_raw_parts(
                    conn.private_data as *const u8,
                    conn.private_data_len as usize,
                )
                .to_vec()
            } else {
                Vec::new()
            };

            Ok(RawCmEvent {
                handle: CmEventHandle::from(event),
                kind,
                id: CmIdHandle::from(id),
                listen_id: NonNull::new(ev.listen_id).map(CmIdHandle::from),
                status: ev.status,
                private_data,
            })
        }
    }

    fn ack_cm_event(&self, event: CmEventHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_errno(unsafe { rdma_ack_cm_event(event.as_ptr()) })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV6};

    use super::*;

    #[test]
    fn poll_errors_keep_their_errno() {
        assert_eq!(poll_count(3).unwrap(), 3);
        assert_eq!(poll_count(0).unwrap(), 0);
        let e = poll_count(-libc::EFAULT).unwrap_err();
        assert_eq!(e.raw_os_error(), Some(libc::EFAULT));
    }

    #[test]
    fn sockaddr_layout() {
        let v4 = sockaddr_of(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 7204)));
        // SAFETY: written as `sockaddr_in`.
        let sin = unsafe { &*(&v4 as *const _ as *const libc::sockaddr_in) };
        assert_eq!(sin.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(u16::from_be(sin.sin_port), 7204);
        assert_eq!(sin.sin_addr.s_addr.to_ne_bytes(), [10, 0, 0, 1]);

        let v6 = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 80, 0, 3));
        let v6 = sockaddr_of(v6);
        // SAFETY: written as `sockaddr_in6`.
        let sin6 = unsafe { &*(&v6 as *const _ as *const libc::sockaddr_in6) };
        assert_eq!(sin6.sin6_family, libc::AF_INET6 as libc::sa_family_t);
        assert_eq!(sin6.sin6_scope_id, 3);
        assert_eq!(sin6.sin6_addr.s6_addr, Ipv6Addr::LOCALHOST.octets());
    }

    #[test]
    fn cm_event_kinds() {
        use rdma_cm_event_type::*;
        assert_eq!(
            cm_event_kind(RDMA_CM_EVENT_ESTABLISHED),
            Some(CmEventKind::Established)
        );
        assert_eq!(
            cm_event_kind(RDMA_CM_EVENT_TIMEWAIT_EXIT),
            Some(CmEventKind::TimewaitExit)
        );
        assert_eq!(cm_event_kind(0xdead), None);
    }

    #[test]
    fn conn_param_limits() {
        assert!(conn_param(&[0; 256]).is_err());
        let pdata = [1u8; 56];
        let param = conn_param(&pdata).unwrap();
        assert_eq!(param.private_data_len, 56);
        assert_eq!(param.retry_count, RETRY_COUNT);
        assert!(conn_param(&[]).unwrap().private_data.is_null());
    }
}
