//! Per-socket state and the socket loop.

pub mod connection;
pub mod context;
pub mod session;
