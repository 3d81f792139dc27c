//! Completion queue and completions.

mod wc;

use std::fmt;
use std::os::fd::RawFd;

pub use self::wc::*;
use crate::error::{Error, Result};
use crate::provider::{CompChannelHandle, CqHandle, RawCompletion};
use crate::rdma::peer::Peer;
use crate::utils::teardown::{Delete, FirstError};

/// Completion queue.
///
/// Every completion queue is bound to a completion channel. It either owns
/// that channel, and then can be waited on by itself, or uses a channel
/// shared with the other queue of its connection, and then only the
/// connection can wait on it.
///
/// The queue is armed for one notification at creation and rearmed after
/// each consumed notification.
pub struct Cq {
    peer: Peer,
    cq: Option<CqHandle>,
    channel: CompChannelHandle,
    shared: bool,
}

impl fmt::Debug for Cq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cq")
            .field("cq", &self.cq)
            .field("channel", &self.channel)
            .field("shared", &self.shared)
            .finish()
    }
}

impl Cq {
    /// Create a completion queue with `size` entries. Without a shared
    /// channel, a dedicated one is created.
    pub(crate) fn new(peer: &Peer, size: u32, shared: Option<CompChannelHandle>) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("completion queue size is zero"));
        }
        let provider = peer.provider();
        let dev = peer.device();

        let channel = match shared {
            Some(channel) => channel,
            None => provider.create_comp_channel(dev)?,
        };
        let rollback_channel = |e: Error| {
            if shared.is_none() {
                if let Err(e) = provider.destroy_comp_channel(channel) {
                    log::warn!("rrpma: cannot destroy completion channel on rollback: {}", e);
                }
            }
            e
        };

        let cq = provider
            .create_cq(dev, size, Some(channel))
            .map_err(|e| rollback_channel(e.into()))?;
        if let Err(e) = provider.req_notify_cq(cq, false) {
            if let Err(e) = provider.destroy_cq(cq) {
                log::warn!("rrpma: cannot destroy CQ on rollback: {}", e);
            }
            return Err(rollback_channel(e.into()));
        }

        Ok(Self {
            peer: peer.clone(),
            cq: Some(cq),
            channel,
            shared: shared.is_some(),
        })
    }

    /// The hardware handle. Only absent while the queue is being deleted.
    pub(crate) fn handle(&self) -> Result<CqHandle> {
        self.cq.ok_or(Error::InvalidArgument("completion queue is deleted"))
    }

    /// Whether this queue uses a channel shared with another queue.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Get the file descriptor of the completion channel, for use with an
    /// external event loop.
    pub fn fd(&self) -> Result<RawFd> {
        if self.shared {
            return Err(Error::SharedChannel);
        }
        Ok(self.peer.provider().comp_channel_fd(self.channel))
    }

    /// Block until the queue signals one notification, then rearm it.
    ///
    /// One notification may stand for several completions, and completions
    /// already queued when the queue is rearmed raise no new notification.
    /// After each wait, drain with [`Cq::get_completion`] until it returns
    /// [`Error::NoCompletion`] before waiting again.
    ///
    /// Fails with [`Error::NoCompletion`] if the channel yields no event
    /// (for example, a non-blocking channel with nothing ready).
    pub fn wait(&self) -> Result<()> {
        if self.shared {
            return Err(Error::SharedChannel);
        }
        let cq = self.handle()?;
        let ev_cq = self
            .peer
            .provider()
            .get_cq_event(self.channel)
            .map_err(|_| Error::NoCompletion)?;
        if ev_cq != cq {
            log::warn!("rrpma: event on {:?} delivered to {:?}", ev_cq, cq);
            self.peer.provider().ack_cq_events(ev_cq, 1);
            return Err(Error::Unknown("completion event for a foreign queue"));
        }
        self.ack_and_rearm()
    }

    /// Acknowledge one consumed notification and rearm the queue.
    pub(crate) fn ack_and_rearm(&self) -> Result<()> {
        let cq = self.handle()?;
        let provider = self.peer.provider();
        provider.ack_cq_events(cq, 1);
        Ok(provider.req_notify_cq(cq, false)?)
    }

    /// Fetch one completion without blocking.
    ///
    /// Returns [`Error::NoCompletion`] if the queue is empty.
    pub fn get_completion(&self) -> Result<Completion> {
        let mut raw = [RawCompletion::default()];
        let num = self.poll_raw(&mut raw)?;
        debug_assert_eq!(num, 1);
        Completion::from_raw(&raw[0])
    }

    /// Fetch up to `wc.len()` completions without blocking. Returns the
    /// number fetched, which is at least one.
    ///
    /// Returns [`Error::NoCompletion`] if the queue is empty.
    pub fn get_completions(&self, wc: &mut [Completion]) -> Result<usize> {
        if wc.is_empty() {
            return Err(Error::InvalidArgument("completion buffer is empty"));
        }
        let mut raw = vec![RawCompletion::default(); wc.len()];
        let num = self.poll_raw(&mut raw)?;
        for (dst, src) in wc.iter_mut().zip(&raw[..num]) {
            *dst = Completion::from_raw(src)?;
        }
        Ok(num)
    }

    fn poll_raw(&self, raw: &mut [RawCompletion]) -> Result<usize> {
        let cq = self.handle()?;
        let num = self.peer.provider().poll_cq(cq, raw)?;
        match num {
            0 => Err(Error::NoCompletion),
            n if n > raw.len() => {
                log::warn!("rrpma: polled {} completions but asked for {}", n, raw.len());
                Err(Error::Unknown("hardware reported more completions than requested"))
            }
            n => Ok(n),
        }
    }

    fn destroy(&mut self, first: &mut FirstError) {
        let provider = self.peer.provider();
        if let Some(cq) = self.cq.take() {
            first.record(provider.destroy_cq(cq));
            if !self.shared {
                first.record(provider.destroy_comp_channel(self.channel));
            }
        }
    }
}

impl Delete for Cq {
    /// Destroy the queue, then its dedicated channel if it has one.
    fn delete(mut self) -> Result<()> {
        let mut first = FirstError::new();
        self.destroy(&mut first);
        first.into_result()
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        let mut first = FirstError::new();
        self.destroy(&mut first);
        if let Err(e) = first.into_result() {
            log::warn!("rrpma: cannot destroy CQ on drop: {}", e);
        }
    }
}
