//! Host-side helpers for binaries embedding the relay.

pub mod bootstrap;
pub mod retry;
