use super::{FlushStrategy, FlushType};
use crate::error::Result;
use crate::provider::{FlushPlacement, QpHandle, SendOp, SendRequest};
use crate::rdma::mr::MrRemote;
use crate::rdma::peer::Peer;
use crate::rdma::type_alias::OpContext;

/// Flush through the hardware flush verb.
#[derive(Debug)]
pub struct NativeFlush {
    peer: Peer,
}

impl NativeFlush {
    pub(crate) fn new(peer: &Peer) -> Self {
        Self { peer: peer.clone() }
    }
}

impl FlushStrategy for NativeFlush {
    fn flush(
        &self,
        qp: QpHandle,
        dst: &MrRemote,
        offset: usize,
        len: usize,
        flush_type: FlushType,
        signaled: bool,
        op_context: OpContext,
    ) -> Result<()> {
        let placement = match flush_type {
            FlushType::Persistent => FlushPlacement::Persistent,
            FlushType::Visibility => FlushPlacement::Global,
        };
        let wr = SendRequest {
            wr_id: op_context,
            sge: None,
            op: SendOp::Flush {
                remote: dst.at(offset),
                len: len as u64,
                placement,
            },
            signaled,
            fence: false,
            inline: false,
        };
        Ok(self.peer.provider().post_send(qp, &wr)?)
    }

    fn delete(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
