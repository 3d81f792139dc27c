//! Remote flush.
//!
//! A flush makes previously written remote data visible or persistent. The
//! hardware flush verb is used when the device has it; otherwise the flush
//! is emulated by reading back from the target region, which forces the
//! preceding writes on the same queue pair to be placed first.

mod emulated;
mod native;

use std::fmt;

pub use self::emulated::EmulatedFlush;
pub use self::native::NativeFlush;
use crate::error::Result;
use crate::provider::QpHandle;
use crate::rdma::mr::MrRemote;
use crate::rdma::peer::Peer;
use crate::rdma::type_alias::OpContext;

/// Guarantee requested from a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushType {
    /// Make the data persistent.
    Persistent,

    /// Make the data globally visible.
    Visibility,
}

/// A way of carrying out a flush on a queue pair.
///
/// Arguments are already validated when `flush` is called: the range lies
/// within `dst`, and `dst` and the peer support `flush_type`.
pub trait FlushStrategy: Send + Sync + fmt::Debug {
    /// Post the work requests of one flush.
    #[allow(clippy::too_many_arguments)]
    fn flush(
        &self,
        qp: QpHandle,
        dst: &MrRemote,
        offset: usize,
        len: usize,
        flush_type: FlushType,
        signaled: bool,
        op_context: OpContext,
    ) -> Result<()>;

    /// Release the resources of the strategy.
    fn delete(self: Box<Self>) -> Result<()>;
}

/// Pick the strategy the device supports.
pub(crate) fn new_strategy(peer: &Peer) -> Result<Box<dyn FlushStrategy>> {
    if peer.caps().native_flush {
        log::debug!("rrpma: using native flush");
        Ok(Box::new(NativeFlush::new(peer)))
    } else {
        log::debug!("rrpma: using read-back flush emulation");
        Ok(Box::new(EmulatedFlush::new(peer)?))
    }
}
