//! An RDMA library for remote persistent memory access, consisting of
//! connection management, memory registration and one-sided operations
//! (read, write, atomic write and flush) over reliable connections.
//!
//! Every resource is created through a [`Peer`], which owns the protection
//! domain of one device. The hardware is reached through a [`Provider`]:
//! the `rdma-core` feature enables the [`RdmaCore`] provider built atop
//! `libibverbs` and `librdmacm`, and the `fake` feature enables an
//! in-process loopback fabric.
//!
//! Resource holders release their hardware state on drop. Call
//! [`Delete::delete`] instead to observe teardown errors.
//!
//! # Example
//!
//! ```rust,ignore
//! use rrpma::*;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let addr = "192.168.1.2:7204".parse()?;
//!     let peer = Peer::for_addr(RdmaCore::new(), addr, AddrKind::Remote)?;
//!
//!     let mut buf = vec![0u8; 4096];
//!     let mr = MrLocal::reg(&peer, &mut buf, MrUsage::READ_DST)?;
//!
//!     let req = ConnReq::new(&peer, "192.168.1.2", 7204, None)?;
//!     let mut conn = req.connect(None)?;
//!     conn.establish()?;
//!
//!     let remote = ConnEnvelope::decode(conn.private_data())?.mr;
//!     conn.read(Some(&mr), 0, Some(&remote), 0, 4096, CompletionFlags::ALWAYS, 0)?;
//!     conn.cq()?.wait()?;
//!     conn.cq()?.get_completion()?.ok()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Warning
//!
//! **The interfaces are unstable and up to change!**

#[macro_use]
mod utils;

#[cfg(feature = "rdma-core")]
mod bindings;

mod error;
mod rdma;

/// Hardware providers.
pub mod provider;

pub mod prelude;

pub use error::{Error, Result};
#[cfg(feature = "rdma-core")]
pub use provider::rdma_core::RdmaCore;
pub use provider::{AddrKind, DeviceCaps, Provider};
pub use rdma::conn::*;
pub use rdma::cq::*;
pub use rdma::flush::{EmulatedFlush, FlushStrategy, FlushType, NativeFlush};
pub use rdma::mr::*;
pub use rdma::peer::Peer;
pub use rdma::peer_cfg::PeerCfg;
pub use rdma::srq::{Srq, SrqCfg};
pub use rdma::type_alias::*;
pub use utils::teardown::Delete;
