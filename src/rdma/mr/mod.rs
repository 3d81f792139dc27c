mod remote;
mod usage;
pub(crate) mod verbs;

use std::fmt;
use std::marker::PhantomData;
use std::slice;

pub use self::remote::*;
pub use self::usage::*;
pub use self::verbs::CompletionFlags;
use crate::error::{Error, Result};
use crate::provider::{Access, MrHandle, RegisteredMr, Sge};
use crate::rdma::peer::Peer;
use crate::rdma::type_alias::{LKey, RKey};
use crate::utils::teardown::Delete;

/// Local memory region.
///
/// A memory region is a virtual memory space registered to the RDMA device
/// through a [`Peer`]. The registered memory itself does not belong to this
/// type, but it must outlive this type's lifetime (`'a`), which the borrow
/// taken by [`MrLocal::reg`] enforces.
///
/// Deregistration is the only way to release the region: call
/// [`Delete::delete`] to observe errors, or drop the value to deregister
/// silently.
pub struct MrLocal<'a> {
    peer: Peer,
    mr: Option<MrHandle>,
    addr: *mut u8,
    len: usize,
    lkey: LKey,
    rkey: RKey,
    usage: MrUsage,
    _marker: PhantomData<&'a mut [u8]>,
}

// SAFETY: the raw address is only handed to the hardware and never
// dereferenced by this type except through `unsafe fn mem`.
unsafe impl Send for MrLocal<'_> {}
unsafe impl Sync for MrLocal<'_> {}

impl fmt::Debug for MrLocal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MrLocal")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .field("lkey", &self.lkey)
            .field("rkey", &self.rkey)
            .field("usage", &self.usage)
            .finish()
    }
}

impl<'a> MrLocal<'a> {
    /// Register a buffer with the given usage.
    pub fn reg(peer: &Peer, buf: &'a mut [u8], usage: MrUsage) -> Result<Self> {
        // SAFETY: the buffer is borrowed for the region's whole lifetime.
        unsafe { Self::reg_impl(peer, buf.as_mut_ptr(), buf.len(), usage) }
    }

    /// Register a raw memory area with the given usage.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must stay valid until the region is deleted or
    /// dropped, and must not be accessed in a way that races with RDMA
    /// operations targeting it.
    pub unsafe fn reg_raw(
        peer: &Peer,
        addr: *mut u8,
        len: usize,
        usage: MrUsage,
    ) -> Result<MrLocal<'static>> {
        MrLocal::reg_impl(peer, addr, len, usage)
    }

    unsafe fn reg_impl(peer: &Peer, addr: *mut u8, len: usize, usage: MrUsage) -> Result<Self> {
        if addr.is_null() {
            return Err(Error::InvalidArgument("memory region address is null"));
        }
        if len == 0 {
            return Err(Error::InvalidArgument("memory region length is zero"));
        }
        if !usage.is_valid() {
            return Err(Error::InvalidArgument("memory region usage is empty or unknown"));
        }

        let caps = peer.caps();
        let access = usage.access(&caps);
        let provider = peer.provider();
        let reg = match provider.reg_mr(peer.pd(), addr, len, access) {
            Ok(reg) => reg,
            Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) && caps.odp => {
                log::debug!("rrpma: plain registration unsupported, retrying with on-demand paging");
                provider.reg_mr(peer.pd(), addr, len, access | Access::ON_DEMAND)?
            }
            Err(e) => return Err(e.into()),
        };
        let RegisteredMr { handle, lkey, rkey } = reg;

        Ok(Self {
            peer: peer.clone(),
            mr: Some(handle),
            addr,
            len,
            lkey,
            rkey,
            usage,
            _marker: PhantomData,
        })
    }

    /// Get the start address of the registered memory area.
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Get the length of the registered memory area.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn usage(&self) -> MrUsage {
        self.usage
    }

    #[inline]
    pub fn lkey(&self) -> LKey {
        self.lkey
    }

    #[inline]
    pub fn rkey(&self) -> RKey {
        self.rkey
    }

    /// Get the peer this region is registered through.
    #[inline]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Retrieve the registered memory area as a slice.
    ///
    /// # Safety
    ///
    /// See the safety documentation of [`std::slice::from_raw_parts_mut`].
    /// No RDMA operation may target the area while the slice is alive.
    #[inline]
    pub unsafe fn mem(&self) -> &'a mut [u8] {
        slice::from_raw_parts_mut(self.addr, self.len)
    }

    /// Size of the wire descriptor of any local memory region.
    #[inline]
    pub const fn descriptor_size() -> usize {
        MR_DESCRIPTOR_SIZE
    }

    /// Serialize this region into its wire descriptor.
    pub fn descriptor(&self) -> [u8; MR_DESCRIPTOR_SIZE] {
        encode_descriptor(self.addr as u64, self.len as u64, self.rkey, self.usage)
    }

    /// Write the wire descriptor into the first [`Self::descriptor_size`]
    /// bytes of `out`, whatever its alignment.
    pub fn write_descriptor(&self, out: &mut [u8]) -> Result<()> {
        let out = out
            .get_mut(..MR_DESCRIPTOR_SIZE)
            .ok_or(Error::InvalidArgument("descriptor buffer is too small"))?;
        out.copy_from_slice(&self.descriptor());
        Ok(())
    }

    /// View this local memory region as a remote memory region, as the peer
    /// would see it after decoding the descriptor.
    pub fn as_remote(&self) -> Result<MrRemote> {
        MrRemote::from_descriptor(&self.descriptor())
    }

    /// Build a scatter-gather element covering `[offset, offset + len)`.
    pub(crate) fn sge(&self, offset: usize, len: usize) -> Result<Sge> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::InvalidArgument("local range overflows"))?;
        if end > self.len {
            return Err(Error::InvalidArgument("local range exceeds the memory region"));
        }
        let len = u32::try_from(len).map_err(|_| Error::InvalidArgument("length exceeds 4 GiB"))?;
        Ok(Sge {
            addr: self.addr as u64 + offset as u64,
            len,
            lkey: self.lkey,
        })
    }
}

impl Delete for MrLocal<'_> {
    /// Deregister the memory region. The wrapper is released even if the
    /// hardware call fails.
    fn delete(mut self) -> Result<()> {
        match self.mr.take() {
            Some(mr) => Ok(self.peer.provider().dereg_mr(mr)?),
            None => Ok(()),
        }
    }
}

impl Drop for MrLocal<'_> {
    fn drop(&mut self) {
        if let Some(mr) = self.mr.take() {
            if let Err(e) = self.peer.provider().dereg_mr(mr) {
                log::warn!("rrpma: cannot dereg MR on drop: {}", e);
            }
        }
    }
}
