//! Work-request builders behind the data-plane operations of a connection.
//!
//! Every builder validates its arguments completely before anything is
//! posted, so a rejected call leaves no side effect.

use std::ops::BitOr;

use super::{MrLocal, MrRemote};
use crate::error::{Error, Result};
use crate::provider::*;
use crate::rdma::type_alias::{ImmData, OpContext};

/// Granularity and size of an atomic write.
pub const ATOMIC_WRITE_ALIGNMENT: usize = 8;

/// When the operation should produce a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CompletionFlags(u32);

impl CompletionFlags {
    /// Produce a completion only if the operation fails.
    pub const ON_ERROR: Self = Self(1 << 0);

    /// Always produce a completion.
    pub const ALWAYS: Self = Self(Self::ON_ERROR.0 | 1 << 1);

    #[inline]
    pub const fn from_bits_retain(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check the flags and tell whether the work request is signaled.
    pub(crate) fn signaled(self) -> Result<bool> {
        if self.0 == 0 {
            return Err(Error::InvalidArgument("completion flags are zero"));
        }
        if self.0 & !Self::ALWAYS.0 != 0 {
            return Err(Error::InvalidArgument("completion flags have unknown bits"));
        }
        Ok(self.0 & Self::ALWAYS.0 == Self::ALWAYS.0)
    }
}

impl BitOr for CompletionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Local scatter-gather element, or `None` for a null operation.
///
/// A null operation has no region and zero offset and length. Giving a
/// region without a range or a range without a region is invalid.
fn local_sge(mr: Option<&MrLocal<'_>>, offset: usize, len: usize) -> Result<Option<Sge>> {
    match mr {
        Some(mr) => mr.sge(offset, len).map(Some),
        None if offset == 0 && len == 0 => Ok(None),
        None => Err(Error::InvalidArgument("range given without a memory region")),
    }
}

/// Remote address of a one-sided operation, checking `len` bytes fit.
fn remote_addr(mr: &MrRemote, offset: usize, len: usize) -> Result<RemoteAddr> {
    mr.check_range(offset, len)?;
    Ok(mr.at(offset))
}

/// Resolve both ends of a one-sided operation.
fn one_sided(
    local: Option<&MrLocal<'_>>,
    local_offset: usize,
    remote: Option<&MrRemote>,
    remote_offset: usize,
    len: usize,
) -> Result<(Option<Sge>, RemoteAddr)> {
    match (local, remote) {
        (Some(local), Some(remote)) => {
            let sge = local.sge(local_offset, len)?;
            Ok((Some(sge), remote_addr(remote, remote_offset, len)?))
        }
        (None, None) if local_offset == 0 && remote_offset == 0 && len == 0 => {
            Ok((None, RemoteAddr { addr: 0, rkey: 0 }))
        }
        _ => Err(Error::InvalidArgument(
            "both memory regions or neither must be given",
        )),
    }
}

/// RDMA read from `src` into `dst`.
pub(crate) fn read(
    dst: Option<&MrLocal<'_>>,
    dst_offset: usize,
    src: Option<&MrRemote>,
    src_offset: usize,
    len: usize,
    flags: CompletionFlags,
    op_context: OpContext,
) -> Result<SendRequest> {
    let signaled = flags.signaled()?;
    let (sge, remote) = one_sided(dst, dst_offset, src, src_offset, len)?;
    Ok(SendRequest {
        wr_id: op_context,
        sge,
        op: SendOp::Read { remote },
        signaled,
        fence: false,
        inline: false,
    })
}

/// RDMA write from `src` into `dst`, optionally carrying immediate data.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write(
    dst: Option<&MrRemote>,
    dst_offset: usize,
    src: Option<&MrLocal<'_>>,
    src_offset: usize,
    len: usize,
    flags: CompletionFlags,
    imm: Option<ImmData>,
    op_context: OpContext,
) -> Result<SendRequest> {
    let signaled = flags.signaled()?;
    let (sge, remote) = one_sided(src, src_offset, dst, dst_offset, len)?;
    Ok(SendRequest {
        wr_id: op_context,
        sge,
        op: SendOp::Write { remote, imm },
        signaled,
        fence: false,
        inline: false,
    })
}

/// Two-sided send, optionally carrying immediate data.
pub(crate) fn send(
    src: Option<&MrLocal<'_>>,
    offset: usize,
    len: usize,
    flags: CompletionFlags,
    imm: Option<ImmData>,
    op_context: OpContext,
) -> Result<SendRequest> {
    let signaled = flags.signaled()?;
    Ok(SendRequest {
        wr_id: op_context,
        sge: local_sge(src, offset, len)?,
        op: SendOp::Send { imm },
        signaled,
        fence: false,
        inline: false,
    })
}

/// Receive into `dst`. Receives are always signaled.
pub(crate) fn recv(
    dst: Option<&MrLocal<'_>>,
    offset: usize,
    len: usize,
    op_context: OpContext,
) -> Result<RecvRequest> {
    Ok(RecvRequest {
        wr_id: op_context,
        sge: local_sge(dst, offset, len)?,
    })
}

/// Atomic 8-byte write of `src` at `dst_offset`.
///
/// Without native support the write is emulated by an inline, fenced RDMA
/// write, which is atomic for an aligned 8-byte payload on every known
/// device.
pub(crate) fn atomic_write(
    caps: &DeviceCaps,
    dst: &MrRemote,
    dst_offset: usize,
    src: &[u8; ATOMIC_WRITE_ALIGNMENT],
    flags: CompletionFlags,
    op_context: OpContext,
) -> Result<SendRequest> {
    let signaled = flags.signaled()?;
    if dst_offset % ATOMIC_WRITE_ALIGNMENT != 0 {
        return Err(Error::InvalidArgument("atomic write offset is not 8-byte aligned"));
    }
    let remote = remote_addr(dst, dst_offset, ATOMIC_WRITE_ALIGNMENT)?;

    let (sge, op) = if caps.native_atomic_write {
        (None, SendOp::AtomicWrite { remote, value: *src })
    } else {
        // Inline payload is copied when posting, so the borrow may end then.
        let sge = Sge {
            addr: src.as_ptr() as u64,
            len: ATOMIC_WRITE_ALIGNMENT as u32,
            lkey: 0,
        };
        (Some(sge), SendOp::Write { remote, imm: None })
    };
    Ok(SendRequest {
        wr_id: op_context,
        sge,
        op,
        signaled,
        fence: true,
        inline: !caps.native_atomic_write,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::rdma::mr::MrUsage;

    #[test]
    fn completion_flags() {
        assert!(CompletionFlags::ALWAYS.signaled().unwrap());
        assert!(!CompletionFlags::ON_ERROR.signaled().unwrap());
        assert!(CompletionFlags::from_bits_retain(0).signaled().is_err());
        assert!(CompletionFlags::from_bits_retain(1 << 4).signaled().is_err());
        assert_eq!(
            CompletionFlags::ON_ERROR | CompletionFlags::ALWAYS,
            CompletionFlags::ALWAYS
        );
    }

    #[test]
    fn null_operations() {
        let req = read(None, 0, None, 0, 0, CompletionFlags::ALWAYS, 7).unwrap();
        assert_eq!(req.sge, None);
        assert!(req.signaled);
        assert!(read(None, 1, None, 0, 0, CompletionFlags::ALWAYS, 7).is_err());
        assert!(send(None, 0, 4, CompletionFlags::ALWAYS, None, 7).is_err());
        assert_eq!(recv(None, 0, 0, 9).unwrap().sge, None);
    }

    #[test]
    fn mixed_presence_is_invalid() {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let mut buf = vec![0u8; 64];
        let mr = MrLocal::reg(&peer, &mut buf, MrUsage::READ_DST).unwrap();
        assert!(matches!(
            read(Some(&mr), 0, None, 0, 0, CompletionFlags::ALWAYS, 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn ranges_are_checked() {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let mut local = vec![0u8; 64];
        let mut target = vec![0u8; 32];
        let src = MrLocal::reg(&peer, &mut local, MrUsage::WRITE_SRC).unwrap();
        let dst = MrLocal::reg(&peer, &mut target, MrUsage::WRITE_DST).unwrap();
        let remote = dst.as_remote().unwrap();

        assert!(write(Some(&remote), 0, Some(&src), 0, 32, CompletionFlags::ALWAYS, None, 0).is_ok());
        assert!(write(Some(&remote), 1, Some(&src), 0, 32, CompletionFlags::ALWAYS, None, 0).is_err());
        assert!(write(Some(&remote), 0, Some(&src), 40, 32, CompletionFlags::ALWAYS, None, 0).is_err());
    }

    #[test]
    fn atomic_write_alignment_and_mode() {
        let fake = FakeProvider::new();
        let peer = fake.peer();
        let mut target = vec![0u8; 64];
        let dst = MrLocal::reg(&peer, &mut target, MrUsage::WRITE_DST).unwrap();
        let remote = dst.as_remote().unwrap();
        let value = 42u64.to_le_bytes();

        let emulated = DeviceCaps::default();
        assert!(matches!(
            atomic_write(&emulated, &remote, 4, &value, CompletionFlags::ALWAYS, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(atomic_write(&emulated, &remote, 64, &value, CompletionFlags::ALWAYS, 0).is_err());

        let req = atomic_write(&emulated, &remote, 8, &value, CompletionFlags::ALWAYS, 0).unwrap();
        assert!(req.inline && req.fence);
        assert!(matches!(req.op, SendOp::Write { imm: None, .. }));

        let native = DeviceCaps {
            native_atomic_write: true,
            ..Default::default()
        };
        let req = atomic_write(&native, &remote, 56, &value, CompletionFlags::ON_ERROR, 0).unwrap();
        assert!(!req.signaled && req.fence && !req.inline);
        assert!(matches!(req.op, SendOp::AtomicWrite { value: v, .. } if v == value));
    }

    #[test]
    fn wrapping_descriptor_never_reaches_a_post() {
        let desc = crate::rdma::mr::encode_descriptor(u64::MAX - 3, 64, 1, MrUsage::WRITE_DST);
        assert!(MrRemote::from_descriptor(&desc).is_err());

        let desc = crate::rdma::mr::encode_descriptor(u64::MAX - 63, 63, 1, MrUsage::WRITE_DST);
        let remote = MrRemote::from_descriptor(&desc).unwrap();
        let value = 7u64.to_le_bytes();
        let req =
            atomic_write(&DeviceCaps::default(), &remote, 48, &value, CompletionFlags::ALWAYS, 0).unwrap();
        assert!(matches!(req.op, SendOp::Write { remote, .. } if remote.addr == u64::MAX - 15));
    }
}
