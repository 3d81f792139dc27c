//! Connection private data and the descriptor envelope carried in it.

use std::ops::Deref;

use crate::error::{Error, Result};
use crate::rdma::mr::{MrRemote, MR_DESCRIPTOR_SIZE};
use crate::rdma::peer_cfg::PeerCfg;

/// Most private data an outgoing connect can carry.
pub const CONNECT_PDATA_MAX: usize = 56;

/// Most private data an accept can carry.
pub const ACCEPT_PDATA_MAX: usize = 196;

/// Private data exchanged while setting up a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PrivateData(Vec<u8>);

impl PrivateData {
    #[inline]
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for PrivateData {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<u8>> for PrivateData {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

impl From<&[u8]> for PrivateData {
    fn from(data: &[u8]) -> Self {
        Self(data.to_vec())
    }
}

/// Size of the envelope header.
const HEADER_SIZE: usize = 4;

/// Size of the descriptor area.
const DESCRIPTORS_SIZE: usize = 24;

/// Descriptors a peer advertises in its connection private data.
///
/// Wire layout, little-endian:
///
/// | offset | size | field                                   |
/// |-------:|-----:|-----------------------------------------|
/// |      0 |    2 | offset of the application data in the MR |
/// |      2 |    1 | size of the MR descriptor               |
/// |      3 |    1 | size of the peer configuration, or 0    |
/// |      4 |   24 | MR descriptor, then peer configuration  |
///
/// The encoding always spans [`ConnEnvelope::ENCODED_SIZE`] bytes; the unused
/// tail of the descriptor area is zero. Decoding ignores anything past the
/// declared descriptors, since the connection manager may pad private data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnEnvelope {
    /// Where the application data starts within the advertised region.
    pub data_offset: u16,

    /// The advertised region.
    pub mr: MrRemote,

    /// The advertising peer's configuration.
    pub peer_cfg: Option<PeerCfg>,
}

impl ConnEnvelope {
    /// Size of the encoding.
    pub const ENCODED_SIZE: usize = HEADER_SIZE + DESCRIPTORS_SIZE;

    pub fn new(mr: MrRemote, data_offset: u16) -> Self {
        Self {
            data_offset,
            mr,
            peer_cfg: None,
        }
    }

    pub fn with_peer_cfg(mut self, cfg: PeerCfg) -> Self {
        self.peer_cfg = Some(cfg);
        self
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0..2].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[2] = MR_DESCRIPTOR_SIZE as u8;

        let mr_end = HEADER_SIZE + MR_DESCRIPTOR_SIZE;
        buf[HEADER_SIZE..mr_end].copy_from_slice(&self.mr.descriptor());
        if let Some(cfg) = &self.peer_cfg {
            buf[3] = PeerCfg::DESCRIPTOR_SIZE as u8;
            buf[mr_end..mr_end + PeerCfg::DESCRIPTOR_SIZE].copy_from_slice(&cfg.descriptor());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = data
            .get(..HEADER_SIZE)
            .ok_or(Error::InvalidArgument("private data is shorter than the envelope header"))?;
        let data_offset = u16::from_le_bytes([header[0], header[1]]);
        let mr_size = header[2] as usize;
        let cfg_size = header[3] as usize;

        let mr_end = HEADER_SIZE + mr_size;
        let cfg_end = mr_end + cfg_size;
        if cfg_end > data.len() {
            return Err(Error::InvalidArgument("envelope descriptors exceed the private data"));
        }

        let mr = MrRemote::from_descriptor(&data[HEADER_SIZE..mr_end])?;
        let peer_cfg = match cfg_size {
            0 => None,
            _ => Some(PeerCfg::from_descriptor(&data[mr_end..cfg_end])?),
        };
        Ok(Self {
            data_offset,
            mr,
            peer_cfg,
        })
    }
}
