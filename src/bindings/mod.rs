//! Bindings of libibverbs and librdmacm C interfaces.
//!
//! Functions are generated by `bindgen` at build time. The static inline
//! helpers of `verbs.h`, which `bindgen` cannot see, are reimplemented here
//! on top of the context operation tables.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

use std::os::raw::{c_int, c_void};
use std::{mem, ptr};

mod private {
    include!(concat!(env!("OUT_DIR"), "/rdma_bindings.rs"));
}

pub(crate) use self::private::*;

/* Values from `ib_user_verbs.h` and `verbs.h` that bindgen does not export
 * as typed constants. */

/// `ibv_odp_general_caps::IBV_ODP_SUPPORT`.
pub const IBV_ODP_SUPPORT: u64 = 1 << 0;

/// RC transport ODP support for send, receive, write and read.
pub const IBV_ODP_SUPPORT_RC_ALL: u32 = 0b1111;

/// `IB_UVERBS_DEVICE_FLUSH_GLOBAL`.
pub const IBV_DEVICE_FLUSH_GLOBAL: u64 = 1 << 38;

/// `IB_UVERBS_DEVICE_FLUSH_PERSISTENT`.
pub const IBV_DEVICE_FLUSH_PERSISTENT: u64 = 1 << 39;

/// `IB_UVERBS_DEVICE_ATOMIC_WRITE`.
pub const IBV_DEVICE_ATOMIC_WRITE: u64 = 1 << 40;

pub const IBV_QP_INIT_ATTR_PD: u32 = 1 << 0;
pub const IBV_QP_INIT_ATTR_SEND_OPS_FLAGS: u32 = 1 << 6;

pub const IBV_QP_EX_WITH_RDMA_WRITE: u64 = 1 << 0;
pub const IBV_QP_EX_WITH_RDMA_WRITE_WITH_IMM: u64 = 1 << 1;
pub const IBV_QP_EX_WITH_SEND: u64 = 1 << 2;
pub const IBV_QP_EX_WITH_SEND_WITH_IMM: u64 = 1 << 3;
pub const IBV_QP_EX_WITH_RDMA_READ: u64 = 1 << 4;
pub const IBV_QP_EX_WITH_FLUSH: u64 = 1 << 11;
pub const IBV_QP_EX_WITH_ATOMIC_WRITE: u64 = 1 << 12;

/// `ibv_placement_type`.
pub const IBV_FLUSH_GLOBAL: u8 = 1 << 0;
pub const IBV_FLUSH_PERSISTENT: u8 = 1 << 1;

/// `ibv_selectivity_level::IBV_FLUSH_RANGE`.
pub const IBV_FLUSH_RANGE: u8 = 0;

/// `RDMA_MAX_RESP_RES` and `RDMA_MAX_INIT_DEPTH`.
pub const RDMA_MAX_RESP_RES: u8 = 0xFF;
pub const RDMA_MAX_INIT_DEPTH: u8 = 0xFF;

macro_rules! container_of {
    ($ptr:expr, $container:path, $field:ident) => {{
        ($ptr as *const _ as *const u8 as *mut u8).sub(memoffset::offset_of!($container, $field))
            as *mut $container
    }};
}

macro_rules! verbs_get_ctx_op {
    ($ctx:expr, $op:ident) => {{
        let vctx = verbs_get_ctx($ctx);
        if vctx.is_null()
            || (*vctx).sz
                < ::std::mem::size_of_val(&*vctx) - memoffset::offset_of!(verbs_context, $op)
            || (*vctx).$op.is_none()
        {
            std::ptr::null_mut()
        } else {
            vctx
        }
    }};
}

#[inline]
unsafe fn verbs_get_ctx(ctx: *const ibv_context) -> *mut verbs_context {
    const __VERBS_ABI_IS_EXTENDED: *mut c_void = usize::MAX as _;
    if ctx.is_null() || (*ctx).abi_compat != __VERBS_ABI_IS_EXTENDED {
        ptr::null_mut()
    } else {
        container_of!(ctx, verbs_context, context)
    }
}

/// Query extended device attributes, falling back to the legacy query.
#[inline]
pub unsafe fn ibv_query_device_ex(
    context: *mut ibv_context,
    input: *const ibv_query_device_ex_input,
    attr: *mut ibv_device_attr_ex,
) -> c_int {
    let vctx = verbs_get_ctx_op!(context, query_device_ex);
    if let Some(query) = vctx.as_ref().and_then(|vctx| vctx.query_device_ex) {
        let ret = query(context, input, attr, mem::size_of::<ibv_device_attr_ex>());
        if ret != libc::EOPNOTSUPP {
            return ret;
        }
    }
    ptr::write_bytes(attr, 0, 1);
    ibv_query_device(context, &mut (*attr).orig_attr)
}

/// Poll a CQ for (possibly multiple) completions.
///
/// A negative return value is an error. Otherwise it is the number of
/// completions written to `wc`; fewer than `num_entries` means the CQ was
/// emptied.
#[inline]
pub unsafe fn ibv_poll_cq(cq: *mut ibv_cq, num_entries: c_int, wc: *mut ibv_wc) -> c_int {
    match (*(*cq).context).ops.poll_cq {
        Some(poll_cq) => poll_cq(cq, num_entries, wc),
        None => -libc::EOPNOTSUPP,
    }
}

/// Request a completion notification on a CQ.
#[inline]
pub unsafe fn ibv_req_notify_cq(cq: *mut ibv_cq, solicited_only: c_int) -> c_int {
    match (*(*cq).context).ops.req_notify_cq {
        Some(req_notify_cq) => req_notify_cq(cq, solicited_only),
        None => libc::EOPNOTSUPP,
    }
}

/// Post a list of work requests to a send queue.
///
/// If IBV_SEND_INLINE flag is set, the data buffers can be reused
/// immediately after the call returns.
#[inline]
pub unsafe fn ibv_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_send_wr,
    bad_wr: *mut *mut ibv_send_wr,
) -> c_int {
    match (*(*qp).context).ops.post_send {
        Some(post_send) => post_send(qp, wr, bad_wr),
        None => libc::EOPNOTSUPP,
    }
}

/// Post a list of work requests to a receive queue.
#[inline]
pub unsafe fn ibv_post_recv(
    qp: *mut ibv_qp,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> c_int {
    match (*(*qp).context).ops.post_recv {
        Some(post_recv) => post_recv(qp, wr, bad_wr),
        None => libc::EOPNOTSUPP,
    }
}

/// Post a list of work requests to a shared receive queue.
#[inline]
pub unsafe fn ibv_post_srq_recv(
    srq: *mut ibv_srq,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> c_int {
    match (*(*srq).context).ops.post_srq_recv {
        Some(post_srq_recv) => post_srq_recv(srq, wr, bad_wr),
        None => libc::EOPNOTSUPP,
    }
}

/// Builders of the extended send API, available from rdma-core v43.
#[cfg(rdma_core_flush)]
mod qp_ex {
    use super::*;

    #[inline]
    pub unsafe fn ibv_wr_start(qp: *mut ibv_qp_ex) -> c_int {
        match (*qp).wr_start {
            Some(wr_start) => {
                wr_start(qp);
                0
            }
            None => libc::EOPNOTSUPP,
        }
    }

    #[inline]
    pub unsafe fn ibv_wr_complete(qp: *mut ibv_qp_ex) -> c_int {
        match (*qp).wr_complete {
            Some(wr_complete) => wr_complete(qp),
            None => libc::EOPNOTSUPP,
        }
    }

    #[inline]
    pub unsafe fn ibv_wr_abort(qp: *mut ibv_qp_ex) {
        if let Some(wr_abort) = (*qp).wr_abort {
            wr_abort(qp);
        }
    }

    #[inline]
    pub unsafe fn ibv_wr_flush(
        qp: *mut ibv_qp_ex,
        rkey: u32,
        remote_addr: u64,
        len: usize,
        type_: u8,
        level: u8,
    ) -> c_int {
        match (*qp).wr_flush {
            Some(wr_flush) => {
                wr_flush(qp, rkey, remote_addr, len, type_, level);
                0
            }
            None => libc::EOPNOTSUPP,
        }
    }

    #[inline]
    pub unsafe fn ibv_wr_atomic_write(
        qp: *mut ibv_qp_ex,
        rkey: u32,
        remote_addr: u64,
        atomic_wr: *const c_void,
    ) -> c_int {
        match (*qp).wr_atomic_write {
            Some(wr_atomic_write) => {
                wr_atomic_write(qp, rkey, remote_addr, atomic_wr);
                0
            }
            None => libc::EOPNOTSUPP,
        }
    }
}

#[cfg(rdma_core_flush)]
pub use self::qp_ex::*;
