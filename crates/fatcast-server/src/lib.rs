//! # fatcast-server
//!
//! The daemon around the fatcast engine: NBD device attachment, the
//! wire-protocol serve loop, and service readiness notification. The
//! binary lives in `main.rs`; these modules are a library so the
//! integration tests can drive the protocol directly.

pub mod device;
pub mod nbd;
pub mod notify;
