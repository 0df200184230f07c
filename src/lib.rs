//! arena-relay - Cross-server broadcast relay
//!
//! A master server publishes typed, addressed notifications over Redis
//! pub/sub. Every other server listens on a channel named after itself,
//! filters what arrives and hands it to the host for local delivery.

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod handler;
pub mod peers;
pub mod publisher;
pub mod relay;
pub mod utils;
