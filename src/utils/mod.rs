//! Process-level helpers shared by binaries embedding the RPC layer.

pub mod bootstrap;
pub mod retry;
