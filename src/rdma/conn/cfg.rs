use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rdma::srq::Srq;

/// Connection configuration.
///
/// Every field has a default, so a configuration file only needs the keys
/// it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnCfg {
    /// Timeout of route resolution, in milliseconds.
    pub timeout_ms: i32,

    /// Depth of the main completion queue.
    pub cq_size: u32,

    /// Depth of a dedicated receive completion queue. `0` means receive
    /// completions land on the main queue.
    pub rcq_size: u32,

    /// Depth of the send queue.
    pub sq_size: u32,

    /// Depth of the receive queue. Ignored with a shared receive queue.
    pub rq_size: u32,

    /// Bind both completion queues of the connection to one completion
    /// channel, waited on through [`Connection::wait`](crate::Connection::wait).
    pub shared_comp_channel: bool,

    /// Shared receive queue to use instead of a per-connection receive queue.
    /// Its receive completion queue, if any, becomes the connection's.
    #[serde(skip)]
    pub srq: Option<Srq>,
}

impl Default for ConnCfg {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            cq_size: 10,
            rcq_size: 0,
            sq_size: 10,
            rq_size: 10,
            shared_comp_channel: false,
            srq: None,
        }
    }
}

impl ConnCfg {
    /// Parse the `[rrpma.conn]` table of a TOML document. Missing keys keep
    /// their defaults, and so does a missing table.
    pub fn from_toml(s: &str) -> Result<Self> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Root {
            rrpma: Section,
        }
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Section {
            conn: ConnCfg,
        }

        let root: Root = toml::from_str(s)?;
        let cfg = root.rrpma.conn;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Attach a shared receive queue.
    pub fn with_srq(mut self, srq: Srq) -> Self {
        self.srq = Some(srq);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.timeout_ms <= 0 {
            return Err(Error::InvalidArgument("timeout must be positive"));
        }
        if self.cq_size == 0 || self.sq_size == 0 {
            return Err(Error::InvalidArgument("queue sizes must be positive"));
        }
        if self.rq_size == 0 && self.srq.is_none() {
            return Err(Error::InvalidArgument("receive queue size must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ConnCfg::default();
        assert_eq!(cfg.timeout_ms, 1000);
        assert_eq!(cfg.cq_size, 10);
        assert_eq!(cfg.rcq_size, 0);
        assert_eq!(cfg.sq_size, 10);
        assert_eq!(cfg.rq_size, 10);
        assert!(!cfg.shared_comp_channel);
        assert!(cfg.srq.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn from_toml() -> anyhow::Result<()> {
        let doc = r#"
            [rrpma.conn]
            timeout_ms = 250
            rcq_size = 32
            shared_comp_channel = true
        "#;
        let cfg = ConnCfg::from_toml(doc)?;
        assert_eq!(cfg.timeout_ms, 250);
        assert_eq!(cfg.rcq_size, 32);
        assert!(cfg.shared_comp_channel);
        assert_eq!(cfg.cq_size, 10);

        assert!(matches!(
            ConnCfg::from_toml("[rrpma.conn]\ncq_size = 0\n"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ConnCfg::from_toml("[rrpma.conn\n"),
            Err(Error::Config(_))
        ));
        Ok(())
    }
}
