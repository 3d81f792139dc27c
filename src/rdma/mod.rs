//! Connection and memory-operation engine.

pub mod conn;
pub mod cq;
pub mod flush;
pub mod mr;
pub mod peer;
pub mod peer_cfg;
pub mod srq;
pub mod type_alias;
