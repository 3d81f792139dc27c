use thiserror::Error;

use crate::error::{Error as RrpmaError, Result};
use crate::provider::RawCompletion;
use crate::rdma::type_alias::{ImmData, OpContext, Qpn};

/// Kind of operation a completion reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CompletionOp {
    /// RDMA read, including the read-back of an emulated flush.
    Read,
    /// RDMA write, with or without immediate data. An emulated atomic write
    /// also completes as a write.
    Write,
    /// Send, with or without immediate data.
    Send,
    /// Receive of a send. A send with immediate data also completes as a
    /// receive, carrying the value in [`Completion::imm`].
    Recv,
    /// Receive consumed by an RDMA write with immediate data.
    RecvRdmaWithImm,
    /// Native flush.
    Flush,
    /// Native atomic write.
    AtomicWrite,
}

impl CompletionOp {
    /// Decode the numeric `ibv_wc_opcode`.
    pub(crate) fn from_raw(opcode: u32) -> Result<Self> {
        Ok(match opcode {
            0 => Self::Send,
            1 => Self::Write,
            2 => Self::Read,
            8 => Self::Flush,
            9 => Self::AtomicWrite,
            128 => Self::Recv,
            129 => Self::RecvRdmaWithImm,
            _ => return Err(RrpmaError::Unknown("unrecognized completion opcode")),
        })
    }
}

/// Status of a completion.
///
/// Values follow `ibv_wc_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// The work request and every unsignaled one posted before it ended, and
    /// their buffers may be reused.
    #[error("success")]
    Success = 0,

    /// A message exceeded the port's maximum message size, or a receive
    /// buffer was too small for the incoming message.
    #[error("local length error")]
    LocLenErr = 1,

    /// An internal QP consistency error was detected.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// Relevant to RD QPs only.
    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// A local buffer does not belong to a memory region valid for the
    /// operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// The work request was outstanding when the QP entered the error
    /// state. Seen in bulk after a disconnect.
    #[error("WR flush error")]
    WrFlushErr = 5,

    #[error("memory window bind error")]
    MwBindErr = 6,

    /// The responder returned an unexpected transport opcode.
    #[error("bad response error")]
    BadRespErr = 7,

    /// A write with immediate data from the peer hit a protection error on
    /// a local buffer.
    #[error("local access error")]
    LocAccessErr = 8,

    /// The responder saw an invalid message, such as an operation its QP
    /// does not allow.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// A remote buffer was outside the remote region or lacked the needed
    /// access right.
    #[error("remote access error")]
    RemAccessErr = 10,

    #[error("remote operation error")]
    RemOpErr = 11,

    /// No ACK or NACK came back from the peer within the retry budget. The
    /// remote QP is usually gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// The peer had no receive posted within the retry budget.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    #[error("remote aborted error")]
    RemAbortErr = 16,

    #[error("invalid EE context number")]
    InvEecnErr = 17,

    #[error("invalid EE context state error")]
    InvEecStateErr = 18,

    #[error("fatal error")]
    FatalErr = 19,

    #[error("response timeout error")]
    RespTimeoutErr = 20,

    #[error("general error")]
    GeneralErr = 21,
}

impl WcStatus {
    const ALL: [Self; 22] = [
        Self::Success,
        Self::LocLenErr,
        Self::LocQpOpErr,
        Self::LocEecOpErr,
        Self::LocProtErr,
        Self::WrFlushErr,
        Self::MwBindErr,
        Self::BadRespErr,
        Self::LocAccessErr,
        Self::RemInvReqErr,
        Self::RemAccessErr,
        Self::RemOpErr,
        Self::RetryExcErr,
        Self::RnrRetryExcErr,
        Self::LocRddViolErr,
        Self::RemInvRdReqErr,
        Self::RemAbortErr,
        Self::InvEecnErr,
        Self::InvEecStateErr,
        Self::FatalErr,
        Self::RespTimeoutErr,
        Self::GeneralErr,
    ];

    /// Decode the numeric `ibv_wc_status`.
    pub(crate) fn from_raw(status: u32) -> Result<Self> {
        Self::ALL
            .get(status as usize)
            .copied()
            .ok_or(RrpmaError::Unknown("unrecognized completion status"))
    }
}

/// Completion of one posted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// The operation context given when posting.
    pub op_context: OpContext,

    /// Operation kind. `None` only for a failed completion whose opcode the
    /// hardware left undefined.
    pub op: Option<CompletionOp>,

    pub status: WcStatus,

    /// Number of bytes received. Meaningful for receive-class completions.
    pub byte_len: u32,

    /// Immediate data carried by the operation, if any.
    pub imm: Option<ImmData>,

    /// Local QP number of the operation. Tells apart the connections of
    /// completions on a receive CQ shared through an SRQ.
    pub qp_num: Qpn,
}

/// Placeholder for completion buffers passed to
/// [`Cq::get_completions`](super::Cq::get_completions).
impl Default for Completion {
    fn default() -> Self {
        Self {
            op_context: 0,
            op: None,
            status: WcStatus::Success,
            byte_len: 0,
            imm: None,
            qp_num: 0,
        }
    }
}

impl Completion {
    /// Decode a raw hardware completion.
    pub(crate) fn from_raw(raw: &RawCompletion) -> Result<Self> {
        let status = WcStatus::from_raw(raw.status)?;
        // Opcodes are undefined for failed completions.
        let op = match (status, CompletionOp::from_raw(raw.opcode)) {
            (_, Ok(op)) => Some(op),
            (WcStatus::Success, Err(e)) => {
                log::warn!("rrpma: unrecognized opcode {} in completion {}", raw.opcode, raw.wr_id);
                return Err(e);
            }
            (_, Err(_)) => None,
        };
        if status != WcStatus::Success {
            log::debug!(
                "rrpma: completion {} failed: {} (vendor error {:#x})",
                raw.wr_id,
                status,
                raw.vendor_err
            );
        }
        Ok(Self {
            op_context: raw.wr_id,
            op,
            status,
            byte_len: raw.byte_len,
            imm: raw.imm,
            qp_num: raw.qp_num,
        })
    }

    /// Get the completion status as a `Result`.
    ///
    /// - If the status is `Success`, return the number of bytes received.
    /// - Otherwise, return the status as an error.
    #[inline]
    pub fn ok(&self) -> std::result::Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.byte_len as usize),
            status => Err(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_numbers() {
        assert_eq!(WcStatus::from_raw(0).unwrap(), WcStatus::Success);
        assert_eq!(WcStatus::from_raw(5).unwrap(), WcStatus::WrFlushErr);
        assert_eq!(WcStatus::from_raw(21).unwrap(), WcStatus::GeneralErr);
        for (i, status) in WcStatus::ALL.iter().enumerate() {
            assert_eq!(*status as u32, i as u32);
        }
        assert!(matches!(WcStatus::from_raw(22), Err(RrpmaError::Unknown(_))));
    }

    #[test]
    fn opcode_decoding() {
        assert_eq!(CompletionOp::from_raw(2).unwrap(), CompletionOp::Read);
        assert_eq!(CompletionOp::from_raw(129).unwrap(), CompletionOp::RecvRdmaWithImm);
        assert!(matches!(CompletionOp::from_raw(4), Err(RrpmaError::Unknown(_))));
    }

    #[test]
    fn failed_completion_keeps_context() {
        let raw = RawCompletion {
            wr_id: 77,
            status: WcStatus::WrFlushErr as u32,
            opcode: 0xdead,
            ..Default::default()
        };
        let wc = Completion::from_raw(&raw).unwrap();
        assert_eq!(wc.op_context, 77);
        assert_eq!(wc.ok(), Err(WcStatus::WrFlushErr));
        assert_eq!(wc.op, None);
    }

    #[test]
    fn ok_reports_bytes() {
        let raw = RawCompletion {
            wr_id: 1,
            opcode: 128,
            byte_len: 42,
            imm: Some(0xabcd),
            ..Default::default()
        };
        let wc = Completion::from_raw(&raw).unwrap();
        assert_eq!(wc.ok(), Ok(42));
        assert_eq!(wc.imm, Some(0xabcd));
        assert_eq!(wc.op, Some(CompletionOp::Recv));
    }

    #[test]
    fn write_with_imm_completes_apart_from_recv() {
        let raw = RawCompletion {
            wr_id: 2,
            opcode: 129,
            imm: Some(7),
            ..Default::default()
        };
        let wc = Completion::from_raw(&raw).unwrap();
        assert_eq!(wc.op, Some(CompletionOp::RecvRdmaWithImm));
        assert_eq!(wc.imm, Some(7));
    }
}
