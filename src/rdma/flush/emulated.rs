use std::fmt;

use super::{FlushStrategy, FlushType};
use crate::error::Result;
use crate::provider::{QpHandle, SendOp, SendRequest};
use crate::rdma::mr::{MrLocal, MrRemote, MrUsage};
use crate::rdma::peer::Peer;
use crate::rdma::type_alias::OpContext;
use crate::utils::teardown::Delete;

/// Size of the read-back.
const READ_BACK_SIZE: usize = 8;

/// Flush emulated by an RDMA read of a few bytes of the target region into
/// a private scratch buffer.
///
/// The flush completes as a read.
pub struct EmulatedFlush {
    // Dropped before `scratch`.
    mr: MrLocal<'static>,
    scratch: Box<[u8; READ_BACK_SIZE]>,
}

impl fmt::Debug for EmulatedFlush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedFlush")
            .field("mr", &self.mr)
            .finish()
    }
}

impl EmulatedFlush {
    /// Register the scratch buffer.
    pub(crate) fn new(peer: &Peer) -> Result<Self> {
        let mut scratch = Box::new([0u8; READ_BACK_SIZE]);
        // SAFETY: the box is heap-allocated, so its address is stable, and
        // it outlives the region since `mr` is dropped or deleted first.
        let mr = unsafe {
            MrLocal::reg_raw(peer, scratch.as_mut_ptr(), READ_BACK_SIZE, MrUsage::READ_DST)?
        };
        Ok(Self { mr, scratch })
    }
}

/// Position and size of the read-back for a flush of `dst` at `offset`.
///
/// The read stays inside the region even when the flushed range ends within
/// its last bytes.
fn read_back_range(dst: &MrRemote, offset: usize) -> (usize, usize) {
    let len = (READ_BACK_SIZE as u64).min(dst.size()) as usize;
    let max_offset = (dst.size() - len as u64) as usize;
    (offset.min(max_offset), len)
}

impl FlushStrategy for EmulatedFlush {
    fn flush(
        &self,
        qp: QpHandle,
        dst: &MrRemote,
        offset: usize,
        _len: usize,
        _flush_type: FlushType,
        signaled: bool,
        op_context: OpContext,
    ) -> Result<()> {
        let (offset, len) = read_back_range(dst, offset);
        let wr = SendRequest {
            wr_id: op_context,
            sge: Some(self.mr.sge(0, len)?),
            op: SendOp::Read {
                remote: dst.at(offset),
            },
            signaled,
            fence: false,
            inline: false,
        };
        Ok(self.mr.peer().provider().post_send(qp, &wr)?)
    }

    fn delete(self: Box<Self>) -> Result<()> {
        let Self { mr, scratch } = *self;
        let res = mr.delete();
        drop(scratch);
        res
    }
}
