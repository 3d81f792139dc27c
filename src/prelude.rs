//! The rrpma prelude.
//!
//! The purpose of this module is to alleviate imports of common connection
//! and memory functionalities.

pub use crate::error::{Error, Result};
#[cfg(feature = "rdma-core")]
pub use crate::provider::rdma_core::RdmaCore;
pub use crate::provider::{AddrKind, Provider};
pub use crate::rdma::conn::{ConnCfg, ConnEnvelope, ConnEvent, ConnReq, ConnState, Connection, Endpoint};
pub use crate::rdma::cq::{Completion, CompletionOp, Cq, WcStatus};
pub use crate::rdma::flush::FlushType;
pub use crate::rdma::mr::{CompletionFlags, MrLocal, MrRemote, MrUsage};
pub use crate::rdma::peer::Peer;
pub use crate::rdma::peer_cfg::PeerCfg;
pub use crate::rdma::srq::{Srq, SrqCfg};
pub use crate::utils::teardown::Delete;
