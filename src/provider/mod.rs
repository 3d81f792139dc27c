//! The hardware seam.
//!
//! The connection engine never touches `libibverbs` or `librdmacm` directly.
//! Every verbs and connection-manager primitive it consumes goes through the
//! object-safe [`Provider`] trait, held as `Arc<dyn Provider>` by the
//! [`Peer`](crate::Peer) and shared with everything created from it.
//!
//! Two providers exist:
//!
//! - [`rdma_core::RdmaCore`] (feature `rdma-core`) binds to the real
//!   libraries;
//! - [`fake::FakeProvider`] (tests and feature `fake`) is an in-process
//!   loopback fabric.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

#[cfg(feature = "rdma-core")]
pub mod rdma_core;

impl_raw_handle!(
    /// Opened RDMA device context (`ibv_context`).
    DeviceHandle
);
impl_raw_handle!(
    /// Protection domain (`ibv_pd`).
    PdHandle
);
impl_raw_handle!(
    /// Registered memory region (`ibv_mr`).
    MrHandle
);
impl_raw_handle!(
    /// Completion event channel (`ibv_comp_channel`).
    CompChannelHandle
);
impl_raw_handle!(
    /// Completion queue (`ibv_cq`).
    CqHandle
);
impl_raw_handle!(
    /// Shared receive queue (`ibv_srq`).
    SrqHandle
);
impl_raw_handle!(
    /// Queue pair (`ibv_qp`).
    QpHandle
);
impl_raw_handle!(
    /// Connection-manager identifier (`rdma_cm_id`).
    CmIdHandle
);
impl_raw_handle!(
    /// Connection-manager event channel (`rdma_event_channel`).
    EventChannelHandle
);
impl_raw_handle!(
    /// Connection-manager event awaiting acknowledgement (`rdma_cm_event`).
    CmEventHandle
);

/// Memory region access flags, with the numeric values of `ibv_access_flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Access(pub u32);

impl Access {
    pub const EMPTY: Self = Self(0);
    pub const LOCAL_WRITE: Self = Self(1 << 0);
    pub const REMOTE_WRITE: Self = Self(1 << 1);
    pub const REMOTE_READ: Self = Self(1 << 2);
    pub const REMOTE_ATOMIC: Self = Self(1 << 3);
    pub const ON_DEMAND: Self = Self(1 << 6);
    pub const FLUSH_GLOBAL: Self = Self(1 << 8);
    pub const FLUSH_PERSISTENT: Self = Self(1 << 9);

    /// Whether every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Capabilities of an opened device that the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCaps {
    /// `ibv_wr_flush` is available.
    pub native_flush: bool,

    /// `ibv_wr_atomic_write` is available.
    pub native_atomic_write: bool,

    /// On-demand paging is supported for RC send/recv/read/write.
    pub odp: bool,

    /// The device is an iWARP device.
    pub iwarp: bool,
}

/// Result of a successful memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredMr {
    pub handle: MrHandle,
    pub lkey: u32,
    pub rkey: u32,
}

/// Which end of a connection an address belongs to, for device lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    /// The address is assigned to a local interface.
    Local,

    /// The address is reachable from a local interface.
    Remote,
}

/// Scatter-gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

/// Remote side of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr {
    pub addr: u64,
    pub rkey: u32,
}

/// Placement guarantee requested from a native flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushPlacement {
    /// Make the data globally visible.
    Global,

    /// Make the data persistent.
    Persistent,
}

/// Operation of a send-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOp {
    Read { remote: RemoteAddr },
    Write { remote: RemoteAddr, imm: Option<u32> },
    Send { imm: Option<u32> },
    AtomicWrite { remote: RemoteAddr, value: [u8; 8] },
    Flush { remote: RemoteAddr, len: u64, placement: FlushPlacement },
}

/// Send-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    pub wr_id: u64,
    pub sge: Option<Sge>,
    pub op: SendOp,
    pub signaled: bool,
    pub fence: bool,
    pub inline: bool,
}

/// Receive-queue work request. Receives are always signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    pub wr_id: u64,
    pub sge: Option<Sge>,
}

/// Work completion exactly as the hardware reported it.
///
/// `opcode` and `status` carry the numeric values of `ibv_wc_opcode` and
/// `ibv_wc_status`; decoding them is the engine's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawCompletion {
    pub wr_id: u64,
    pub status: u32,
    pub opcode: u32,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm: Option<u32>,
    pub qp_num: u32,
}

/// Queue pair creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
    pub srq: Option<SrqHandle>,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,

    /// Create the QP with the extended send operations needed for native
    /// flush and native atomic write.
    pub native_flush: bool,
    pub native_atomic_write: bool,
}

/// Connection-manager event type, mirroring `rdma_cm_event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    MulticastJoin,
    MulticastError,
    AddrChange,
    TimewaitExit,
}

/// Connection-manager event. The event must be acknowledged through
/// [`Provider::ack_cm_event`] with `handle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCmEvent {
    pub handle: CmEventHandle,
    pub kind: CmEventKind,

    /// The identifier the event is about. For a connection request, this is
    /// the freshly created identifier of the inbound connection.
    pub id: CmIdHandle,

    /// The listening identifier, for connection requests.
    pub listen_id: Option<CmIdHandle>,

    pub status: i32,

    /// Copy of the private data carried by the event.
    pub private_data: Vec<u8>,
}

/// Verbs and connection-manager primitives consumed by the engine.
///
/// Non-blocking calls that find nothing ready fail with `EAGAIN` or
/// `ENODATA`. The engine never calls a method on a handle it has already
/// destroyed.
pub trait Provider: Send + Sync {
    /* Device discovery */

    /// Find the device context serving `addr`.
    fn lookup_device(&self, addr: SocketAddr, kind: AddrKind) -> io::Result<DeviceHandle>;

    /// Query the capabilities of a device.
    fn query_device(&self, dev: DeviceHandle) -> io::Result<DeviceCaps>;

    /* Protection domain & memory */

    fn alloc_pd(&self, dev: DeviceHandle) -> io::Result<PdHandle>;
    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()>;

    /// Register `[addr, addr + len)` with the given access flags.
    fn reg_mr(&self, pd: PdHandle, addr: *mut u8, len: usize, access: Access)
        -> io::Result<RegisteredMr>;
    fn dereg_mr(&self, mr: MrHandle) -> io::Result<()>;

    /* Completion channels & queues */

    fn create_comp_channel(&self, dev: DeviceHandle) -> io::Result<CompChannelHandle>;
    fn destroy_comp_channel(&self, channel: CompChannelHandle) -> io::Result<()>;
    fn comp_channel_fd(&self, channel: CompChannelHandle) -> RawFd;

    fn create_cq(
        &self,
        dev: DeviceHandle,
        cqe: u32,
        channel: Option<CompChannelHandle>,
    ) -> io::Result<CqHandle>;
    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()>;

    /// Arm the CQ for one completion notification.
    fn req_notify_cq(&self, cq: CqHandle, solicited_only: bool) -> io::Result<()>;

    /// Consume one completion event from the channel and return the CQ it
    /// belongs to.
    fn get_cq_event(&self, channel: CompChannelHandle) -> io::Result<CqHandle>;
    fn ack_cq_events(&self, cq: CqHandle, num: u32);

    /// Poll up to `wc.len()` completions. Returns the count the hardware
    /// reported.
    fn poll_cq(&self, cq: CqHandle, wc: &mut [RawCompletion]) -> io::Result<usize>;

    /* Shared receive queues */

    fn create_srq(&self, pd: PdHandle, max_wr: u32, max_sge: u32) -> io::Result<SrqHandle>;
    fn destroy_srq(&self, srq: SrqHandle) -> io::Result<()>;
    fn post_srq_recv(&self, srq: SrqHandle, wr: &RecvRequest) -> io::Result<()>;

    /* Queue pairs */

    /// Create the QP of a connection-manager identifier.
    fn create_qp(&self, id: CmIdHandle, pd: PdHandle, attr: &QpInitAttr) -> io::Result<QpHandle>;

    /// Destroy the QP of a connection-manager identifier.
    fn destroy_qp(&self, id: CmIdHandle) -> io::Result<()>;
    fn qp_num(&self, qp: QpHandle) -> u32;
    fn post_send(&self, qp: QpHandle, wr: &SendRequest) -> io::Result<()>;
    fn post_recv(&self, qp: QpHandle, wr: &RecvRequest) -> io::Result<()>;

    /* Connection manager */

    fn create_event_channel(&self) -> io::Result<EventChannelHandle>;
    fn destroy_event_channel(&self, channel: EventChannelHandle) -> io::Result<()>;
    fn event_channel_fd(&self, channel: EventChannelHandle) -> RawFd;

    /// Create an identifier. Without a channel, the identifier operates
    /// synchronously.
    fn create_id(&self, channel: Option<EventChannelHandle>) -> io::Result<CmIdHandle>;
    fn destroy_id(&self, id: CmIdHandle) -> io::Result<()>;

    /// Device context an identifier is bound to, once resolved or bound.
    fn id_device(&self, id: CmIdHandle) -> Option<DeviceHandle>;

    /// Resolve the address and the route to `addr` on a synchronous
    /// identifier.
    fn resolve_route(&self, id: CmIdHandle, addr: SocketAddr, timeout_ms: i32) -> io::Result<()>;

    /// Move an identifier to another event channel.
    fn migrate_id(&self, id: CmIdHandle, channel: EventChannelHandle) -> io::Result<()>;

    fn bind_addr(&self, id: CmIdHandle, addr: SocketAddr) -> io::Result<()>;
    fn listen(&self, id: CmIdHandle, backlog: i32) -> io::Result<()>;
    fn connect(&self, id: CmIdHandle, private_data: &[u8]) -> io::Result<()>;
    fn accept(&self, id: CmIdHandle, private_data: &[u8]) -> io::Result<()>;
    fn reject(&self, id: CmIdHandle, private_data: &[u8]) -> io::Result<()>;
    fn disconnect(&self, id: CmIdHandle) -> io::Result<()>;

    /// Fetch the next event of the channel.
    fn get_cm_event(&self, channel: EventChannelHandle) -> io::Result<RawCmEvent>;
    fn ack_cm_event(&self, event: CmEventHandle) -> io::Result<()>;
}

/// Whether a provider error means "nothing is ready right now".
#[inline]
pub(crate) fn is_would_block(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::ENODATA)
    ) || err.kind() == io::ErrorKind::WouldBlock
}
